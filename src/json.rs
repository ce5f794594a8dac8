//! JSON import and export of top-level values

use crate::error::{Result, ShmError};
use crate::value::{Kind, Value};
use serde_json::{Map, Number};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Convert a JSON document into a [`Value`].
///
/// Objects become Mappings with Str keys, arrays become Lists, integral
/// numbers that fit in 64 signed bits become Integers and every other
/// number a Float. `null` has no counterpart.
pub fn from_json(json: &serde_json::Value) -> Result<Value> {
    Ok(match json {
        serde_json::Value::Null => {
            return Err(ShmError::EncodingType("JSON null has no shared representation".into()))
        }
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Float(n.as_f64().ok_or_else(|| {
                ShmError::EncodingType(format!("number {n} is not representable"))
            })?),
        },
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => {
            Value::List(items.iter().map(from_json).collect::<Result<_>>()?)
        }
        serde_json::Value::Object(map) => Value::Mapping(
            map.iter()
                .map(|(k, v)| Ok((Value::Str(k.clone()), from_json(v)?)))
                .collect::<Result<_>>()?,
        ),
    })
}

/// Convert a [`Value`] into JSON.
///
/// Tuples become arrays and scalar mapping keys are stringified. Complex
/// numbers, numeric arrays and non-finite floats are rejected.
pub fn to_json(value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Float(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| ShmError::EncodingType(format!("{f} is not a JSON number")))?,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::List(items) | Value::Tuple(items) => {
            serde_json::Value::Array(items.iter().map(to_json).collect::<Result<_>>()?)
        }
        Value::Mapping(pairs) => {
            let mut map = Map::with_capacity(pairs.len());
            for (k, v) in pairs {
                map.insert(key_string(k)?, to_json(v)?);
            }
            serde_json::Value::Object(map)
        }
        Value::Default(spec) => to_json(&spec.materialize()?)?,
        Value::Complex { .. } | Value::NumericArray(_) => {
            return Err(ShmError::EncodingType(format!(
                "{} values have no JSON form",
                value.kind()
            )))
        }
    })
}

fn key_string(key: &Value) -> Result<String> {
    match key {
        Value::Str(s) => Ok(s.clone()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ShmError::EncodingType(format!(
            "{} keys have no JSON form",
            other.kind()
        ))),
    }
}

/// Read an initial value from a JSON file.
pub fn load(path: &Path) -> Result<Value> {
    let reader = BufReader::new(File::open(path)?);
    let json: serde_json::Value = serde_json::from_reader(reader)?;
    from_json(&json)
}

/// Write a Mapping value to a JSON file.
pub fn export(path: &Path, value: &Value) -> Result<()> {
    if value.kind() != Kind::Mapping {
        return Err(ShmError::TypeMismatch {
            expected: Kind::Mapping,
            got: value.kind(),
        });
    }
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, &to_json(value)?)?;
    writer.flush()?;
    Ok(())
}
