//! Self-describing binary encoding of [`Value`]
//!
//! Wire layout (all multi-byte fields big-endian):
//!
//! ```text
//! frame       := BEGIN | inner frame | END
//! inner frame := tag: u8 | payload_len: u64 | payload
//! ```
//!
//! Composite payloads are the concatenation of their children's inner
//! frames; only the outermost frame carries BEGIN/END. A numeric array
//! payload is
//!
//! ```text
//! shape_frame_len: u64 | dtype_frame_len: u64 | element bytes | shape frame | dtype frame
//! ```
//!
//! where the shape is a Tuple of Integer and the dtype a Str naming the
//! element type. A released segment holds the 3-byte [`CLOSED_FRAME`].

use crate::error::{FrameFault, Result, ShmError};
use crate::value::{byte_len, DType, NumericArray, Value};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

/// Start of an outer frame
pub const BEGIN: u8 = 0xAA;
/// End of an outer frame
pub const END: u8 = 0xBB;
/// Tag of the released-segment sentinel
pub const CLOSED: u8 = 0xAB;

/// Sentinel written into a segment when it is closed
pub const CLOSED_FRAME: [u8; 3] = [BEGIN, CLOSED, END];

/// Tag byte + 8-byte payload length
pub const INNER_HEADER_LEN: usize = 1 + 8;

/// Deepest nesting accepted in either direction
pub const MAX_DEPTH: usize = 128;

const FLOAT_FRAME_LEN: usize = INNER_HEADER_LEN + 8;
const ARRAY_PREFIX_LEN: usize = 16;

/// Type tag of an inner frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Int = 0x00,
    Float = 0x01,
    Bool = 0x02,
    Complex = 0x03,
    Str = 0x04,
    List = 0x05,
    Dict = 0x06,
    Tuple = 0x07,
    NpArray = 0x08,
}

impl TryFrom<u8> for Tag {
    type Error = FrameFault;

    fn try_from(byte: u8) -> std::result::Result<Self, FrameFault> {
        Ok(match byte {
            0x00 => Tag::Int,
            0x01 => Tag::Float,
            0x02 => Tag::Bool,
            0x03 => Tag::Complex,
            0x04 => Tag::Str,
            0x05 => Tag::List,
            0x06 => Tag::Dict,
            0x07 => Tag::Tuple,
            0x08 => Tag::NpArray,
            other => return Err(FrameFault::UnknownTag(other)),
        })
    }
}

impl Tag {
    fn is_scalar(self) -> bool {
        matches!(
            self,
            Tag::Int | Tag::Float | Tag::Bool | Tag::Complex | Tag::Str
        )
    }
}

/// Encode `value` as a complete frame.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    out.push(BEGIN);
    encode_inner(value, &mut out, 0)?;
    out.push(END);
    Ok(out)
}

/// Append the inner frame of `value` (no BEGIN/END) to `out`.
pub fn encode_into(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    encode_inner(value, out, 0)
}

/// Size of the complete frame `encode` would produce.
pub fn encoded_len(value: &Value) -> Result<usize> {
    encode(value).map(|frame| frame.len())
}

fn encode_inner(value: &Value, out: &mut Vec<u8>, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(ShmError::EncodingType(format!(
            "nesting deeper than {MAX_DEPTH} levels"
        )));
    }

    match value {
        Value::Integer(i) => {
            write_header(out, Tag::Int, 8)?;
            out.write_i64::<BigEndian>(*i)?;
        }
        Value::Float(f) => {
            write_header(out, Tag::Float, 8)?;
            out.write_f64::<BigEndian>(*f)?;
        }
        Value::Bool(b) => {
            write_header(out, Tag::Bool, 1)?;
            out.push(u8::from(*b));
        }
        Value::Complex { re, im } => {
            write_header(out, Tag::Complex, 2 * FLOAT_FRAME_LEN as u64)?;
            encode_inner(&Value::Float(*re), out, depth + 1)?;
            encode_inner(&Value::Float(*im), out, depth + 1)?;
        }
        Value::Str(s) => {
            write_header(out, Tag::Str, s.len() as u64)?;
            out.extend_from_slice(s.as_bytes());
        }
        Value::List(items) | Value::Tuple(items) => {
            let tag = if matches!(value, Value::List(_)) {
                Tag::List
            } else {
                Tag::Tuple
            };
            let len_at = open_composite(out, tag)?;
            for item in items {
                encode_inner(item, out, depth + 1)?;
            }
            close_composite(out, len_at);
        }
        Value::Mapping(pairs) => {
            let len_at = open_composite(out, Tag::Dict)?;
            for (i, (key, val)) in pairs.iter().enumerate() {
                if !key.kind().is_scalar() {
                    return Err(ShmError::EncodingType(format!(
                        "mapping keys must be scalar, got {}",
                        key.kind()
                    )));
                }
                if pairs[..i].iter().any(|(k, _)| k == key) {
                    return Err(ShmError::EncodingType(format!(
                        "duplicate mapping key {key:?}"
                    )));
                }
                encode_inner(key, out, depth + 1)?;
                encode_inner(val, out, depth + 1)?;
            }
            close_composite(out, len_at);
        }
        Value::NumericArray(arr) => encode_array(arr, out, depth)?,
        Value::Default(spec) => encode_inner(&spec.materialize()?, out, depth)?,
    }
    Ok(())
}

fn write_header(out: &mut Vec<u8>, tag: Tag, len: u64) -> Result<()> {
    out.push(tag as u8);
    out.write_u64::<BigEndian>(len)?;
    Ok(())
}

/// Write a tag and a zero length, returning where the length lives.
fn open_composite(out: &mut Vec<u8>, tag: Tag) -> Result<usize> {
    write_header(out, tag, 0)?;
    Ok(out.len() - 8)
}

fn close_composite(out: &mut [u8], len_at: usize) {
    let payload_len = (out.len() - len_at - 8) as u64;
    BigEndian::write_u64(&mut out[len_at..len_at + 8], payload_len);
}

fn encode_array(arr: &NumericArray, out: &mut Vec<u8>, depth: usize) -> Result<()> {
    let expected = byte_len(arr.dtype(), arr.shape())?;
    if arr.data().len() != expected {
        return Err(ShmError::EncodingType(format!(
            "array data is {} bytes, shape {:?} of {} needs {}",
            arr.data().len(),
            arr.shape(),
            arr.dtype().name(),
            expected
        )));
    }

    let shape = Value::Tuple(arr.shape().iter().map(|&d| Value::Integer(d as i64)).collect());
    let mut shape_frame = Vec::new();
    encode_inner(&shape, &mut shape_frame, depth + 1)?;
    let mut dtype_frame = Vec::new();
    encode_inner(&Value::from(arr.dtype().name()), &mut dtype_frame, depth + 1)?;

    let payload_len = ARRAY_PREFIX_LEN + arr.data().len() + shape_frame.len() + dtype_frame.len();
    write_header(out, Tag::NpArray, payload_len as u64)?;
    out.write_u64::<BigEndian>(shape_frame.len() as u64)?;
    out.write_u64::<BigEndian>(dtype_frame.len() as u64)?;
    out.extend_from_slice(arr.data());
    out.extend_from_slice(&shape_frame);
    out.extend_from_slice(&dtype_frame);
    Ok(())
}

/// True when `buf` starts with the CLOSED sentinel.
pub fn is_closed(buf: &[u8]) -> bool {
    buf.starts_with(&CLOSED_FRAME)
}

/// Size of the complete frame at the start of `buf`, read from its header.
///
/// Checks BEGIN and the bounds of the declared length, not the END marker
/// or the payload.
pub fn frame_extent(buf: &[u8]) -> Result<usize> {
    if buf.first() != Some(&BEGIN) {
        return Err(ShmError::frame(0, FrameFault::MissingBegin));
    }
    if is_closed(buf) {
        return Err(ShmError::frame(1, FrameFault::Closed));
    }
    let (_, payload_len) = read_header(buf, 1, buf.len())?;
    // header already bounds-checked the payload; END may still be missing
    Ok((1 + INNER_HEADER_LEN + payload_len + 1).min(buf.len()))
}

/// Decode exactly one complete frame.
pub fn decode(buf: &[u8]) -> Result<Value> {
    let (value, used) = decode_prefix(buf)?;
    if used != buf.len() {
        return Err(ShmError::frame(
            used,
            FrameFault::TrailingBytes(buf.len() - used),
        ));
    }
    Ok(value)
}

/// Decode the frame at the start of `buf`, returning it and its size.
pub fn decode_prefix(buf: &[u8]) -> Result<(Value, usize)> {
    if buf.first() != Some(&BEGIN) {
        return Err(ShmError::frame(0, FrameFault::MissingBegin));
    }
    if is_closed(buf) {
        return Err(ShmError::frame(1, FrameFault::Closed));
    }
    let (value, next) = decode_inner(buf, 1, buf.len(), 0)?;
    if buf.get(next) != Some(&END) {
        return Err(ShmError::frame(next, FrameFault::MissingEnd));
    }
    Ok((value, next + 1))
}

/// Read the inner header at `pos`, bounded by `end`.
fn read_header(buf: &[u8], pos: usize, end: usize) -> Result<(Tag, usize)> {
    let available = end.saturating_sub(pos);
    if available < INNER_HEADER_LEN {
        return Err(ShmError::frame(
            pos,
            FrameFault::Truncated {
                needed: INNER_HEADER_LEN,
                available,
            },
        ));
    }
    let tag = Tag::try_from(buf[pos]).map_err(|fault| ShmError::frame(pos, fault))?;
    let declared = BigEndian::read_u64(&buf[pos + 1..pos + INNER_HEADER_LEN]);
    let room = available - INNER_HEADER_LEN;
    if declared > room as u64 {
        return Err(ShmError::frame(
            pos + 1,
            FrameFault::Truncated {
                needed: usize::try_from(declared).unwrap_or(usize::MAX),
                available: room,
            },
        ));
    }
    Ok((tag, declared as usize))
}

fn decode_inner(buf: &[u8], pos: usize, end: usize, depth: usize) -> Result<(Value, usize)> {
    if depth > MAX_DEPTH {
        return Err(ShmError::frame(pos, FrameFault::TooDeep));
    }

    let (tag, len) = read_header(buf, pos, end)?;
    let start = pos + INNER_HEADER_LEN;
    let stop = start + len;
    let payload = &buf[start..stop];

    let value = match tag {
        Tag::Int => {
            expect_len(start, len, 8)?;
            Value::Integer(BigEndian::read_i64(payload))
        }
        Tag::Float => {
            expect_len(start, len, 8)?;
            Value::Float(BigEndian::read_f64(payload))
        }
        Tag::Bool => {
            expect_len(start, len, 1)?;
            match payload[0] {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(ShmError::frame(start, FrameFault::InvalidBool(other))),
            }
        }
        Tag::Complex => {
            expect_len(start, len, 2 * FLOAT_FRAME_LEN)?;
            let (re, mid) = decode_inner(buf, start, stop, depth + 1)?;
            let (im, _) = decode_inner(buf, mid, stop, depth + 1)?;
            match (re, im) {
                (Value::Float(re), Value::Float(im)) => Value::Complex { re, im },
                _ => return Err(ShmError::frame(start, FrameFault::BadComplex(buf[start]))),
            }
        }
        Tag::Str => match std::str::from_utf8(payload) {
            Ok(s) => Value::Str(s.to_string()),
            Err(_) => return Err(ShmError::frame(start, FrameFault::InvalidUtf8)),
        },
        Tag::List | Tag::Tuple => {
            let mut items = Vec::new();
            let mut cursor = start;
            while cursor < stop {
                let (item, next) = decode_inner(buf, cursor, stop, depth + 1)?;
                items.push(item);
                cursor = next;
            }
            if tag == Tag::List {
                Value::List(items)
            } else {
                Value::Tuple(items)
            }
        }
        Tag::Dict => {
            let mut pairs: Vec<(Value, Value)> = Vec::new();
            let mut cursor = start;
            while cursor < stop {
                let key_tag =
                    Tag::try_from(buf[cursor]).map_err(|fault| ShmError::frame(cursor, fault))?;
                if !key_tag.is_scalar() {
                    return Err(ShmError::frame(cursor, FrameFault::NonScalarKey(buf[cursor])));
                }
                let key_at = cursor;
                let (key, next) = decode_inner(buf, cursor, stop, depth + 1)?;
                let (val, next) = decode_inner(buf, next, stop, depth + 1)?;
                if pairs.iter().any(|(k, _)| *k == key) {
                    return Err(ShmError::frame(key_at, FrameFault::DuplicateKey));
                }
                pairs.push((key, val));
                cursor = next;
            }
            Value::Mapping(pairs)
        }
        Tag::NpArray => decode_array(buf, start, stop, depth)?,
    };

    Ok((value, stop))
}

fn expect_len(at: usize, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(ShmError::frame(
            at,
            FrameFault::BadScalarLength { expected, got },
        ));
    }
    Ok(())
}

fn decode_array(buf: &[u8], start: usize, stop: usize, depth: usize) -> Result<Value> {
    let bad = |at: usize, why: String| ShmError::frame(at, FrameFault::BadArray(why));

    let len = stop - start;
    if len < ARRAY_PREFIX_LEN {
        return Err(bad(start, format!("payload of {len} bytes has no sub-frame lengths")));
    }
    let shape_len = BigEndian::read_u64(&buf[start..start + 8]);
    let dtype_len = BigEndian::read_u64(&buf[start + 8..start + 16]);
    let tail = shape_len
        .checked_add(dtype_len)
        .filter(|&t| t <= (len - ARRAY_PREFIX_LEN) as u64)
        .ok_or_else(|| bad(start, "sub-frame lengths exceed the payload".to_string()))?
        as usize;

    let data_start = start + ARRAY_PREFIX_LEN;
    let dtype_start = stop - dtype_len as usize;
    let shape_start = dtype_start - shape_len as usize;

    let (shape, used) = decode_inner(buf, shape_start, dtype_start, depth + 1)?;
    if used != dtype_start {
        return Err(bad(shape_start, "shape frame length mismatch".to_string()));
    }
    let (dtype, used) = decode_inner(buf, dtype_start, stop, depth + 1)?;
    if used != stop {
        return Err(bad(dtype_start, "dtype frame length mismatch".to_string()));
    }

    let shape = match shape {
        Value::Tuple(dims) => dims
            .iter()
            .map(|d| match d {
                Value::Integer(n) if *n >= 0 => Ok(*n as usize),
                other => Err(bad(shape_start, format!("bad dimension {other:?}"))),
            })
            .collect::<Result<Vec<usize>>>()?,
        other => return Err(bad(shape_start, format!("shape is a {}", other.kind()))),
    };
    let dtype = match dtype {
        Value::Str(name) => DType::from_name(&name)
            .ok_or_else(|| bad(dtype_start, format!("unknown dtype '{name}'")))?,
        other => return Err(bad(dtype_start, format!("dtype is a {}", other.kind()))),
    };

    let data = buf[data_start..stop - tail].to_vec();
    NumericArray::from_raw(dtype, shape, data)
        .map(Value::NumericArray)
        .map_err(|e| bad(data_start, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{DefaultValueSpec, Kind};

    fn alpha() -> Value {
        Value::mapping([(
            "A",
            Value::List(vec![
                Value::Integer(1),
                Value::mapping([(
                    "B",
                    Value::List(vec![Value::Integer(10), Value::Float(1.1)]),
                )]),
            ]),
        )])
    }

    #[test]
    fn test_integer_layout() {
        let frame = encode(&Value::Integer(-125)).unwrap();
        assert_eq!(frame.len(), 1 + 9 + 8 + 1);
        assert_eq!(frame[0], BEGIN);
        assert_eq!(frame[1], Tag::Int as u8);
        assert_eq!(&frame[2..10], &8u64.to_be_bytes());
        assert_eq!(&frame[10..18], &(-125i64).to_be_bytes());
        assert_eq!(frame[18], END);
    }

    #[test]
    fn test_bool_is_not_integer() {
        let frame = encode(&Value::Bool(true)).unwrap();
        assert_eq!(frame[1], Tag::Bool as u8);
        assert_eq!(decode(&frame).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_nested_roundtrip() {
        let v = alpha();
        assert_eq!(decode(&encode(&v).unwrap()).unwrap(), v);
    }

    #[test]
    fn test_tuple_stays_tuple() {
        let v = Value::tuple([Value::Integer(1), Value::from("x")]);
        let back = decode(&encode(&v).unwrap()).unwrap();
        assert_eq!(back.kind(), Kind::Tuple);
        assert_eq!(back, v);
    }

    #[test]
    fn test_long_string_uses_full_length_field() {
        let s = "é".repeat(400);
        let frame = encode(&Value::from(s.as_str())).unwrap();
        assert_eq!(&frame[2..10], &(s.len() as u64).to_be_bytes());
        assert_eq!(decode(&frame).unwrap(), Value::Str(s));
    }

    #[test]
    fn test_array_keeps_dtype_and_shape() {
        let arr = NumericArray::from_elements(vec![2, 3], &[1i16, -2, 3, -4, 5, -6]).unwrap();
        let back = decode(&encode(&Value::from(arr.clone())).unwrap()).unwrap();
        match back {
            Value::NumericArray(got) => {
                assert_eq!(got.dtype(), DType::Int16);
                assert_eq!(got.shape(), &[2, 3]);
                assert_eq!(got, arr);
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn test_default_spec_encodes_as_concrete_value() {
        let spec = Value::Default(DefaultValueSpec::Zeros(2));
        assert_eq!(
            decode(&encode(&spec).unwrap()).unwrap(),
            Value::List(vec![Value::Integer(0), Value::Integer(0)])
        );
    }

    #[test]
    fn test_non_scalar_key_rejected() {
        let v = Value::Mapping(vec![(Value::List(vec![]), Value::Integer(1))]);
        assert!(matches!(encode(&v), Err(ShmError::EncodingType(_))));
    }

    #[test]
    fn test_closed_sentinel() {
        assert!(is_closed(&CLOSED_FRAME));
        assert!(matches!(
            decode(&CLOSED_FRAME),
            Err(ShmError::FrameFormat { fault: FrameFault::Closed, .. })
        ));
    }

    #[test]
    fn test_missing_markers() {
        let mut frame = encode(&Value::Float(2.5)).unwrap();
        let last = frame.len() - 1;
        frame[last] = 0;
        assert!(matches!(
            decode(&frame),
            Err(ShmError::FrameFormat { fault: FrameFault::MissingEnd, .. })
        ));
        frame[0] = 0;
        assert!(matches!(
            decode(&frame),
            Err(ShmError::FrameFormat { fault: FrameFault::MissingBegin, offset: 0 })
        ));
    }

    #[test]
    fn test_declared_length_past_buffer() {
        let mut frame = encode(&Value::List(vec![Value::Integer(1)])).unwrap();
        BigEndian::write_u64(&mut frame[2..10], 1 << 40);
        assert!(matches!(
            decode(&frame),
            Err(ShmError::FrameFormat { fault: FrameFault::Truncated { .. }, .. })
        ));
    }

    #[test]
    fn test_prefix_ignores_stale_tail() {
        let mut region = encode(&Value::Integer(7)).unwrap();
        let used = region.len();
        region.extend_from_slice(&[0xEE; 32]);
        assert_eq!(frame_extent(&region).unwrap(), used);
        assert_eq!(decode_prefix(&region).unwrap(), (Value::Integer(7), used));
        assert!(matches!(
            decode(&region),
            Err(ShmError::FrameFormat { fault: FrameFault::TrailingBytes(32), .. })
        ));
    }

    #[test]
    fn test_duplicate_key_on_decode() {
        let mut frame = vec![BEGIN];
        let mut payload = Vec::new();
        for _ in 0..2 {
            encode_into(&Value::from("k"), &mut payload).unwrap();
            encode_into(&Value::Integer(1), &mut payload).unwrap();
        }
        frame.push(Tag::Dict as u8);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame.push(END);
        assert!(matches!(
            decode(&frame),
            Err(ShmError::FrameFormat { fault: FrameFault::DuplicateKey, .. })
        ));
    }

    #[test]
    fn test_duplicate_key_on_encode() {
        let v = Value::Mapping(vec![
            (Value::from("a"), Value::Integer(1)),
            (Value::from("a"), Value::Integer(2)),
        ]);
        assert!(matches!(encode(&v), Err(ShmError::EncodingType(_))));
        assert!(matches!(encoded_len(&v), Err(ShmError::EncodingType(_))));

        let nested = Value::List(vec![v]);
        assert!(matches!(encode(&nested), Err(ShmError::EncodingType(_))));
    }

    fn outer(tag: Tag, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![BEGIN, tag as u8];
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        frame.extend_from_slice(payload);
        frame.push(END);
        frame
    }

    #[test]
    fn test_overflowing_array_shape() {
        let mut shape = Vec::new();
        encode_into(
            &Value::tuple([Value::Integer(1 << 62), Value::Integer(8)]),
            &mut shape,
        )
        .unwrap();
        let mut dtype = Vec::new();
        encode_into(&Value::from("float64"), &mut dtype).unwrap();

        let mut payload = Vec::new();
        payload.extend_from_slice(&(shape.len() as u64).to_be_bytes());
        payload.extend_from_slice(&(dtype.len() as u64).to_be_bytes());
        payload.extend_from_slice(&shape);
        payload.extend_from_slice(&dtype);

        assert!(matches!(
            decode(&outer(Tag::NpArray, &payload)),
            Err(ShmError::FrameFormat { fault: FrameFault::BadArray(_), .. })
        ));
    }

    #[test]
    fn test_complex_parts_must_be_floats() {
        let mut payload = Vec::new();
        encode_into(&Value::Integer(1), &mut payload).unwrap();
        encode_into(&Value::Integer(2), &mut payload).unwrap();
        assert!(matches!(
            decode(&outer(Tag::Complex, &payload)),
            Err(ShmError::FrameFormat { fault: FrameFault::BadComplex(0x00), offset: 10 })
        ));
    }
}
