//! The value model stored in a segment
//!
//! A [`Value`] is an owned tree, so cycles cannot be built. The kind of the
//! value an owner publishes becomes the declared kind of the segment, and
//! every later write must keep it.

use crate::error::{Result, ShmError};
use std::fmt;

/// Shared value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Complex { re: f64, im: f64 },
    Str(String),
    List(Vec<Value>),
    /// Ordered sequence that refuses indexed writes
    Tuple(Vec<Value>),
    /// Insertion-ordered pairs with unique scalar keys
    Mapping(Vec<(Value, Value)>),
    NumericArray(NumericArray),
    /// Placeholder that stands for a concrete default value
    Default(DefaultValueSpec),
}

/// Variant name of a [`Value`], used as the declared type of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Integer,
    Float,
    Bool,
    Complex,
    Str,
    List,
    Tuple,
    Mapping,
    NumericArray,
}

impl Kind {
    /// Kinds allowed as mapping keys.
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            Kind::Integer | Kind::Float | Kind::Bool | Kind::Complex | Kind::Str
        )
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Integer => "integer",
            Kind::Float => "float",
            Kind::Bool => "bool",
            Kind::Complex => "complex",
            Kind::Str => "string",
            Kind::List => "list",
            Kind::Tuple => "tuple",
            Kind::Mapping => "mapping",
            Kind::NumericArray => "numeric array",
        };
        f.write_str(name)
    }
}

/// Placeholder initial values
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValueSpec {
    /// The empty value of a kind: 0, 0.0, false, "", [], (), {}, ...
    Empty(Kind),
    /// A list of `n` integer zeros
    Zeros(usize),
    /// A zero-filled array
    ZeroArray { dtype: DType, shape: Vec<usize> },
}

impl DefaultValueSpec {
    pub fn kind(&self) -> Kind {
        match self {
            DefaultValueSpec::Empty(kind) => *kind,
            DefaultValueSpec::Zeros(_) => Kind::List,
            DefaultValueSpec::ZeroArray { .. } => Kind::NumericArray,
        }
    }

    /// The concrete value this placeholder stands for.
    ///
    /// Fails only for a zero array whose shape overflows the address space.
    pub fn materialize(&self) -> Result<Value> {
        Ok(match self {
            DefaultValueSpec::Empty(kind) => match kind {
                Kind::Integer => Value::Integer(0),
                Kind::Float => Value::Float(0.0),
                Kind::Bool => Value::Bool(false),
                Kind::Complex => Value::Complex { re: 0.0, im: 0.0 },
                Kind::Str => Value::Str(String::new()),
                Kind::List => Value::List(Vec::new()),
                Kind::Tuple => Value::Tuple(Vec::new()),
                Kind::Mapping => Value::Mapping(Vec::new()),
                Kind::NumericArray => {
                    Value::NumericArray(NumericArray::zeros(DType::Float64, vec![0])?)
                }
            },
            DefaultValueSpec::Zeros(n) => Value::List(vec![Value::Integer(0); *n]),
            DefaultValueSpec::ZeroArray { dtype, shape } => {
                Value::NumericArray(NumericArray::zeros(*dtype, shape.clone())?)
            }
        })
    }
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Integer(_) => Kind::Integer,
            Value::Float(_) => Kind::Float,
            Value::Bool(_) => Kind::Bool,
            Value::Complex { .. } => Kind::Complex,
            Value::Str(_) => Kind::Str,
            Value::List(_) => Kind::List,
            Value::Tuple(_) => Kind::Tuple,
            Value::Mapping(_) => Kind::Mapping,
            Value::NumericArray(_) => Kind::NumericArray,
            Value::Default(spec) => spec.kind(),
        }
    }

    /// Replace a top-level placeholder by the value it stands for.
    pub fn materialize(self) -> Result<Value> {
        match self {
            Value::Default(spec) => spec.materialize(),
            other => Ok(other),
        }
    }

    pub fn complex(re: f64, im: f64) -> Value {
        Value::Complex { re, im }
    }

    pub fn tuple<I: IntoIterator<Item = Value>>(items: I) -> Value {
        Value::Tuple(items.into_iter().collect())
    }

    /// Build a mapping; later duplicates replace earlier keys in place.
    pub fn mapping<K, V, I>(pairs: I) -> Value
    where
        K: Into<Value>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut out: Vec<(Value, Value)> = Vec::new();
        for (k, v) in pairs {
            mapping_insert(&mut out, k.into(), v.into());
        }
        Value::Mapping(out)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_slice(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Mapping(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Element count of a container, character count of a string.
    pub fn len(&self) -> Result<usize> {
        match self {
            Value::List(items) | Value::Tuple(items) => Ok(items.len()),
            Value::Mapping(pairs) => Ok(pairs.len()),
            Value::Str(s) => Ok(s.chars().count()),
            Value::NumericArray(arr) => Ok(arr.shape.first().copied().unwrap_or(0)),
            other => Err(ShmError::NotIndexable { kind: other.kind() }),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    /// Indexed read: mapping lookup by key, positional lookup otherwise.
    pub fn get_item(&self, key: &Value) -> Result<Value> {
        match self {
            Value::Mapping(pairs) => find_key(pairs, key)
                .map(|pos| pairs[pos].1.clone())
                .ok_or(ShmError::KeyNotFound),
            Value::List(items) | Value::Tuple(items) => {
                let idx = resolve_index(key, items.len())?;
                Ok(items[idx].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = resolve_index(key, chars.len())?;
                Ok(Value::Str(chars[idx].to_string()))
            }
            other => Err(ShmError::NotIndexable { kind: other.kind() }),
        }
    }

    /// Indexed write. Mappings insert or replace; lists replace in place.
    pub fn set_item(&mut self, key: Value, value: Value) -> Result<()> {
        match self {
            Value::Mapping(pairs) => {
                if !key.kind().is_scalar() {
                    return Err(ShmError::EncodingType(format!(
                        "mapping keys must be scalar, got {}",
                        key.kind()
                    )));
                }
                match find_key(pairs, &key) {
                    Some(pos) => pairs[pos].1 = value,
                    None => pairs.push((key, value)),
                }
                Ok(())
            }
            Value::List(items) => {
                let idx = resolve_index(&key, items.len())?;
                items[idx] = value;
                Ok(())
            }
            other => Err(ShmError::NotIndexable { kind: other.kind() }),
        }
    }

    /// Indexed delete, returning the removed value.
    pub fn remove_item(&mut self, key: &Value) -> Result<Value> {
        match self {
            Value::Mapping(pairs) => {
                let pos = find_key(pairs, key).ok_or(ShmError::KeyNotFound)?;
                Ok(pairs.remove(pos).1)
            }
            Value::List(items) => {
                let idx = resolve_index(key, items.len())?;
                Ok(items.remove(idx))
            }
            other => Err(ShmError::NotIndexable { kind: other.kind() }),
        }
    }

    /// Key membership for mappings, element membership for sequences,
    /// substring membership for strings.
    pub fn contains(&self, item: &Value) -> Result<bool> {
        match self {
            Value::Mapping(pairs) => Ok(find_key(pairs, item).is_some()),
            Value::List(items) | Value::Tuple(items) => Ok(items.contains(item)),
            Value::Str(s) => match item {
                Value::Str(needle) => Ok(s.contains(needle.as_str())),
                _ => Ok(false),
            },
            other => Err(ShmError::NotIndexable { kind: other.kind() }),
        }
    }
}

fn mapping_insert(pairs: &mut Vec<(Value, Value)>, key: Value, value: Value) {
    match pairs.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = value,
        None => pairs.push((key, value)),
    }
}

/// Position of `key`, falling back to its string form for integer keys
/// so mappings loaded from JSON can be indexed by number.
fn find_key(pairs: &[(Value, Value)], key: &Value) -> Option<usize> {
    pairs.iter().position(|(k, _)| k == key).or_else(|| match key {
        Value::Integer(i) => {
            let text = i.to_string();
            pairs
                .iter()
                .position(|(k, _)| matches!(k, Value::Str(s) if *s == text))
        }
        _ => None,
    })
}

fn resolve_index(key: &Value, len: usize) -> Result<usize> {
    let index = match key {
        Value::Integer(i) => *i,
        other => {
            return Err(ShmError::EncodingType(format!(
                "sequence indices must be integers, got {}",
                other.kind()
            )))
        }
    };
    let resolved = if index < 0 { len as i64 + index } else { index };
    if resolved < 0 || resolved as usize >= len {
        return Err(ShmError::IndexOutOfRange { index, len });
    }
    Ok(resolved as usize)
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<NumericArray> for Value {
    fn from(v: NumericArray) -> Self {
        Value::NumericArray(v)
    }
}

impl From<DefaultValueSpec> for Value {
    fn from(v: DefaultValueSpec) -> Self {
        Value::Default(v)
    }
}

/// Element type of a [`NumericArray`], named the way numpy names them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Complex64,
    Complex128,
}

impl DType {
    const ALL: [DType; 13] = [
        DType::Bool,
        DType::Int8,
        DType::Int16,
        DType::Int32,
        DType::Int64,
        DType::UInt8,
        DType::UInt16,
        DType::UInt32,
        DType::UInt64,
        DType::Float32,
        DType::Float64,
        DType::Complex64,
        DType::Complex128,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Complex64 => "complex64",
            DType::Complex128 => "complex128",
        }
    }

    pub fn from_name(name: &str) -> Option<DType> {
        Self::ALL.iter().copied().find(|d| d.name() == name)
    }

    pub fn item_size(self) -> usize {
        match self {
            DType::Bool | DType::Int8 | DType::UInt8 => 1,
            DType::Int16 | DType::UInt16 => 2,
            DType::Int32 | DType::UInt32 | DType::Float32 => 4,
            DType::Int64 | DType::UInt64 | DType::Float64 | DType::Complex64 => 8,
            DType::Complex128 => 16,
        }
    }
}

/// Primitive types that can live in a [`NumericArray`]
pub trait Element: Copy {
    const DTYPE: DType;
    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = $dtype;

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_element! {
    i8 => DType::Int8,
    i16 => DType::Int16,
    i32 => DType::Int32,
    i64 => DType::Int64,
    u8 => DType::UInt8,
    u16 => DType::UInt16,
    u32 => DType::UInt32,
    u64 => DType::UInt64,
    f32 => DType::Float32,
    f64 => DType::Float64,
}

/// Fixed-size n-dimensional array of one numeric type
///
/// `data` holds the elements in row-major order, little-endian.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl NumericArray {
    /// Wrap raw element bytes, checking them against the shape.
    pub fn from_raw(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = byte_len(dtype, &shape)?;
        if data.len() != expected {
            return Err(ShmError::EncodingType(format!(
                "{} array of shape {:?} needs {} bytes, got {}",
                dtype.name(),
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_elements<T: Element>(shape: Vec<usize>, elements: &[T]) -> Result<Self> {
        let mut data = Vec::with_capacity(elements.len() * T::DTYPE.item_size());
        for e in elements {
            e.write_le(&mut data);
        }
        Self::from_raw(T::DTYPE, shape, data)
    }

    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Result<Self> {
        let data = vec![0u8; byte_len(dtype, &shape)?];
        Ok(Self { dtype, shape, data })
    }

    /// Elements as `T`; `None` when `T` is not this array's dtype.
    pub fn elements<T: Element>(&self) -> Option<Vec<T>> {
        if T::DTYPE != self.dtype {
            return None;
        }
        Some(
            self.data
                .chunks_exact(self.dtype.item_size())
                .map(T::read_le)
                .collect(),
        )
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.item_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Product of the dimensions, `None` on overflow.
pub(crate) fn element_count(shape: &[usize]) -> Option<usize> {
    if shape.contains(&0) {
        return Some(0);
    }
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Data size of an array of `shape`, rejecting shapes too large to address.
pub(crate) fn byte_len(dtype: DType, shape: &[usize]) -> Result<usize> {
    element_count(shape)
        .and_then(|n| n.checked_mul(dtype.item_size()))
        .filter(|&n| n <= isize::MAX as usize)
        .ok_or_else(|| {
            ShmError::EncodingType(format!(
                "{} array of shape {:?} overflows the address space",
                dtype.name(),
                shape
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_keeps_keys_unique() {
        let v = Value::mapping([("a", 1), ("b", 2), ("a", 3)]);
        assert_eq!(
            v,
            Value::Mapping(vec![
                (Value::from("a"), Value::Integer(3)),
                (Value::from("b"), Value::Integer(2)),
            ])
        );
    }

    #[test]
    fn test_negative_index_counts_from_end() {
        let v = Value::List(vec![1.into(), 2.into(), 3.into()]);
        assert_eq!(v.get_item(&Value::Integer(-1)).unwrap(), Value::Integer(3));
        assert!(matches!(
            v.get_item(&Value::Integer(3)),
            Err(ShmError::IndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_tuple_is_read_only() {
        let mut v = Value::tuple([Value::Integer(1)]);
        assert_eq!(v.get_item(&Value::Integer(0)).unwrap(), Value::Integer(1));
        assert!(matches!(
            v.set_item(Value::Integer(0), Value::Integer(2)),
            Err(ShmError::NotIndexable { kind: Kind::Tuple })
        ));
    }

    #[test]
    fn test_contains_semantics() {
        let m = Value::mapping([("k", 1)]);
        assert!(m.contains(&"k".into()).unwrap());
        assert!(!m.contains(&Value::Integer(1)).unwrap());

        let s = Value::from("azerty");
        assert!(s.contains(&"zer".into()).unwrap());
        assert!(Value::Integer(4).contains(&Value::Integer(4)).is_err());
    }

    #[test]
    fn test_default_specs_materialize() {
        assert_eq!(
            DefaultValueSpec::Zeros(3).materialize().unwrap(),
            Value::List(vec![Value::Integer(0); 3])
        );
        let arr = DefaultValueSpec::ZeroArray {
            dtype: DType::Int32,
            shape: vec![2, 2],
        }
        .materialize()
        .unwrap();
        match arr {
            Value::NumericArray(a) => {
                assert_eq!(a.data().len(), 16);
                assert_eq!(a.elements::<i32>().unwrap(), vec![0; 4]);
            }
            other => panic!("expected array, got {other:?}"),
        }
        assert_eq!(
            Value::Default(DefaultValueSpec::Empty(Kind::Str)).kind(),
            Kind::Str
        );
    }

    #[test]
    fn test_array_checks_byte_length() {
        assert!(NumericArray::from_raw(DType::Int16, vec![3], vec![0; 5]).is_err());
        let a = NumericArray::from_elements(vec![3], &[1.5f32, -2.0, 0.25]).unwrap();
        assert_eq!(a.dtype(), DType::Float32);
        assert_eq!(a.elements::<f32>().unwrap(), vec![1.5, -2.0, 0.25]);
        assert!(a.elements::<f64>().is_none());
    }

    #[test]
    fn test_huge_shape_is_rejected() {
        let shape = vec![1usize << 62, 8];
        assert!(matches!(
            NumericArray::from_raw(DType::Float64, shape.clone(), Vec::new()),
            Err(ShmError::EncodingType(_))
        ));
        assert!(NumericArray::zeros(DType::Int8, shape).is_err());
        assert!(DefaultValueSpec::ZeroArray {
            dtype: DType::Float64,
            shape: vec![usize::MAX, 2],
        }
        .materialize()
        .is_err());

        // a zero dimension wins over overflowing ones
        let empty = NumericArray::zeros(DType::Int64, vec![usize::MAX, 0, usize::MAX]).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_integer_key_falls_back_to_string_form() {
        let mut m = Value::mapping([("1", "one"), ("2", "two")]);
        assert_eq!(m.get_item(&Value::Integer(1)).unwrap(), Value::from("one"));
        assert!(m.contains(&Value::Integer(2)).unwrap());

        m.set_item(Value::Integer(2), "deux".into()).unwrap();
        assert_eq!(m.len().unwrap(), 2);
        assert_eq!(m.get_item(&"2".into()).unwrap(), Value::from("deux"));

        assert_eq!(m.remove_item(&Value::Integer(1)).unwrap(), Value::from("one"));
        assert!(matches!(
            m.get_item(&Value::Integer(3)),
            Err(ShmError::KeyNotFound)
        ));

        // exact integer keys still take precedence
        let n = Value::mapping([(Value::from("7"), Value::from("text")), (7.into(), "int".into())]);
        assert_eq!(n.get_item(&Value::Integer(7)).unwrap(), Value::from("int"));
    }
}
