//! # Quantity Codec
//!
//! Converts attribute values between their wire form and the stored form.
//!
//! Wire forms of a quantity: a bare number, a nested array of numbers, or
//! an object `{"value": ..., "unit": ...}` (`unit` optional). The stored
//! form is `{"value": ...}` or `{"value": ..., "unit": <schema unit>}`:
//! values are always converted into the schema unit before storage.
//!
//! Strings and bytes-as-text are stored as plain JSON strings; opaque
//! attributes store arbitrary JSON unchanged.

#![allow(clippy::float_arithmetic)]

use crate::primitives::INTEGRAL_TOLERANCE;
use crate::schema::{DType, ItemSchema};
use crate::units::{Factor, Unit};
use crate::EdmError;
use serde_json::{Map, Number, Value};

/// Largest integer magnitude an `f64` represents exactly (2^53).
const MAX_EXACT_INT: u64 = 1 << 53;

/// 2^63; converted integers must lie in `[-I64_BOUND, I64_BOUND)`.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// Encode a wire value of attribute `attr` into its stored form.
pub fn encode(item: &ItemSchema, attr: &str, wire: &Value) -> Result<Value, EdmError> {
    match item.dtype {
        DType::Str | DType::Bytes => match wire {
            Value::String(_) => Ok(wire.clone()),
            other => Err(EdmError::Validation(format!(
                "{}: must be a string, not {}",
                attr,
                kind_of(other)
            ))),
        },
        DType::Opaque => Ok(wire.clone()),
        DType::Float | DType::Int | DType::Bool => encode_quantity(item, attr, wire),
    }
}

/// Decode a stored value into the read-out form.
///
/// Quantities are reported as `{value, unit}` with the schema unit. A stored
/// value carrying a different unit (the schema was redefined) is converted.
pub fn decode(item: &ItemSchema, attr: &str, stored: &Value) -> Result<Value, EdmError> {
    if !item.dtype.is_numeric() {
        return Ok(stored.clone());
    }
    let Value::Object(rec) = stored else {
        return encode_quantity(item, attr, stored);
    };
    let stored_unit = rec.get("unit").and_then(Value::as_str);
    if stored_unit == item.unit.as_deref() {
        let mut out = Map::new();
        out.insert(
            "value".to_string(),
            rec.get("value").cloned().unwrap_or(Value::Null),
        );
        if let Some(unit) = &item.unit {
            out.insert("unit".to_string(), Value::String(unit.clone()));
        }
        return Ok(Value::Object(out));
    }
    encode_quantity(item, attr, stored)
}

fn encode_quantity(item: &ItemSchema, attr: &str, wire: &Value) -> Result<Value, EdmError> {
    let (value, unit) = split_wire(attr, wire)?;
    if unit.is_some() != item.unit.is_some() {
        return Err(EdmError::Validation(format!(
            "{}: unit mismatch: unit is {:?} but schema unit is {:?}",
            attr, unit, item.unit
        )));
    }
    let factor = match (unit, item.unit.as_deref()) {
        (Some(from), Some(to)) => Some(conversion(attr, from, to)?),
        _ => None,
    }
    .filter(|f| !f.is_identity());

    check_shape(attr, value, &item.shape, 0)?;
    let converted = convert_leaves(item, attr, value, factor.as_ref())?;

    let mut out = Map::new();
    out.insert("value".to_string(), converted);
    if let Some(unit) = &item.unit {
        out.insert("unit".to_string(), Value::String(unit.clone()));
    }
    Ok(Value::Object(out))
}

fn split_wire<'a>(attr: &str, wire: &'a Value) -> Result<(&'a Value, Option<&'a str>), EdmError> {
    let Value::Object(map) = wire else {
        return Ok((wire, None));
    };
    if let Some(extra) = map.keys().find(|k| *k != "value" && *k != "unit") {
        return Err(EdmError::Validation(format!(
            "{}: quantity has extra key \"{}\" (only value, unit allowed)",
            attr, extra
        )));
    }
    let value = map
        .get("value")
        .ok_or_else(|| EdmError::Validation(format!("{}: quantity has no value", attr)))?;
    let unit = match map.get("unit") {
        None | Some(Value::Null) => None,
        Some(Value::String(u)) => Some(u.as_str()),
        Some(other) => {
            return Err(EdmError::Validation(format!(
                "{}: unit must be a string, not {}",
                attr,
                kind_of(other)
            )));
        }
    };
    Ok((value, unit))
}

fn conversion(attr: &str, from: &str, to: &str) -> Result<Factor, EdmError> {
    let from_unit =
        Unit::parse(from).map_err(|e| EdmError::Parse(format!("{}: {}", attr, e)))?;
    let to_unit = Unit::parse(to).map_err(|e| EdmError::Schema(format!("{}: {}", attr, e)))?;
    from_unit.factor_to(&to_unit).ok_or_else(|| {
        EdmError::Validation(format!(
            "{}: unit \"{}\" is not convertible to \"{}\"",
            attr, from, to
        ))
    })
}

fn check_shape(attr: &str, value: &Value, shape: &[i64], axis: usize) -> Result<(), EdmError> {
    match (value, shape.get(axis)) {
        (Value::Array(items), Some(&expected)) => {
            if expected > 0 && items.len() as i64 != expected {
                return Err(EdmError::Validation(format!(
                    "{}: shape mismatch: axis {}: {} (should be {})",
                    attr,
                    axis,
                    items.len(),
                    expected
                )));
            }
            items
                .iter()
                .try_for_each(|v| check_shape(attr, v, shape, axis + 1))
        }
        (Value::Array(_), None) => Err(EdmError::Validation(format!(
            "{}: dimension mismatch: array nested deeper than {} (shape {:?})",
            attr,
            shape.len(),
            shape
        ))),
        (_, Some(_)) => Err(EdmError::Validation(format!(
            "{}: dimension mismatch: scalar found at axis {}, should have {} dimensions (shape {:?})",
            attr,
            axis,
            shape.len(),
            shape
        ))),
        (_, None) => Ok(()),
    }
}

fn convert_leaves(
    item: &ItemSchema,
    attr: &str,
    value: &Value,
    factor: Option<&Factor>,
) -> Result<Value, EdmError> {
    if let Value::Array(items) = value {
        return items
            .iter()
            .map(|v| convert_leaves(item, attr, v, factor))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array);
    }
    convert_leaf(item, attr, value, factor)
}

fn convert_leaf(
    item: &ItemSchema,
    attr: &str,
    leaf: &Value,
    factor: Option<&Factor>,
) -> Result<Value, EdmError> {
    let mismatch = || {
        EdmError::Validation(format!(
            "{}: type mismatch: {} cannot be cast to dtype {:?}",
            attr, leaf, item.dtype
        ))
    };
    match item.dtype {
        DType::Bool => {
            let Value::Bool(b) = leaf else {
                return Err(mismatch());
            };
            if factor.is_some() {
                return Err(EdmError::Validation(format!(
                    "{}: boolean values cannot be unit-converted",
                    attr
                )));
            }
            Ok(Value::Bool(*b))
        }
        DType::Int => {
            let n = match leaf {
                Value::Bool(b) => i64::from(*b),
                Value::Number(n) => n.as_i64().ok_or_else(mismatch)?,
                _ => return Err(mismatch()),
            };
            match factor {
                None => Ok(Value::from(n)),
                Some(f) => {
                    if n.unsigned_abs() > MAX_EXACT_INT {
                        return Err(EdmError::Validation(format!(
                            "{}: {} is too large to convert exactly",
                            attr, n
                        )));
                    }
                    let v = f.apply(n as f64);
                    let rounded = v.round();
                    if !(-I64_BOUND..I64_BOUND).contains(&rounded) {
                        return Err(EdmError::Validation(format!(
                            "{}: converted value {} is out of integer range",
                            attr, v
                        )));
                    }
                    if (v - rounded).abs() > INTEGRAL_TOLERANCE * rounded.abs().max(1.0) {
                        return Err(EdmError::Validation(format!(
                            "{}: converted value {} is not integral",
                            attr, v
                        )));
                    }
                    Ok(Value::from(rounded as i64))
                }
            }
        }
        DType::Float => {
            let v = match leaf {
                Value::Bool(b) => f64::from(u8::from(*b)),
                Value::Number(n) => n.as_f64().ok_or_else(mismatch)?,
                _ => return Err(mismatch()),
            };
            let v = factor.map_or(v, |f| f.apply(v));
            Number::from_f64(v).map(Value::Number).ok_or_else(|| {
                EdmError::Validation(format!("{}: value {} is not finite", attr, v))
            })
        }
        DType::Str | DType::Bytes | DType::Opaque => Err(mismatch()),
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(dtype: DType, unit: Option<&str>, shape: &[i64]) -> ItemSchema {
        ItemSchema {
            dtype,
            unit: unit.map(str::to_string),
            shape: shape.to_vec(),
            link: None,
        }
    }

    fn value_f64(v: &Value) -> f64 {
        v["value"].as_f64().expect("float value")
    }

    #[test]
    fn converts_into_schema_unit() {
        let length = item(DType::Float, Some("m"), &[]);
        let stored = encode(&length, "length", &json!({"value": 2500, "unit": "mm"})).expect("ok");
        assert_eq!(value_f64(&stored), 2.5);
        assert_eq!(stored["unit"], "m");
        let read = decode(&length, "length", &stored).expect("decode");
        assert_eq!(read, stored);
    }

    #[test]
    fn unit_presence_must_match() {
        let length = item(DType::Float, Some("m"), &[]);
        assert!(matches!(
            encode(&length, "length", &json!(2.5)),
            Err(EdmError::Validation(_))
        ));
        let plain = item(DType::Float, None, &[]);
        assert!(matches!(
            encode(&plain, "x", &json!({"value": 1, "unit": "m"})),
            Err(EdmError::Validation(_))
        ));
        assert!(encode(&plain, "x", &json!({"value": 1})).is_ok());
    }

    #[test]
    fn incompatible_and_malformed_units() {
        let length = item(DType::Float, Some("m"), &[]);
        assert!(matches!(
            encode(&length, "l", &json!({"value": 1, "unit": "s"})),
            Err(EdmError::Validation(_))
        ));
        assert!(matches!(
            encode(&length, "l", &json!({"value": 1, "unit": "m//"})),
            Err(EdmError::Parse(_))
        ));
    }

    #[test]
    fn extra_keys_are_rejected() {
        let plain = item(DType::Float, None, &[]);
        assert!(matches!(
            encode(&plain, "x", &json!({"value": 1, "units": "m"})),
            Err(EdmError::Validation(_))
        ));
    }

    #[test]
    fn same_kind_casting() {
        let int = item(DType::Int, None, &[]);
        assert_eq!(encode(&int, "n", &json!(2)).expect("int")["value"], json!(2));
        assert_eq!(encode(&int, "n", &json!(true)).expect("bool")["value"], json!(1));
        assert!(encode(&int, "n", &json!(2.5)).is_err());

        let boolean = item(DType::Bool, None, &[]);
        assert!(encode(&boolean, "b", &json!(1)).is_err());
        assert_eq!(encode(&boolean, "b", &json!(false)).expect("bool")["value"], json!(false));

        let float = item(DType::Float, None, &[]);
        assert_eq!(value_f64(&encode(&float, "f", &json!(3)).expect("int")), 3.0);
        assert!(encode(&float, "f", &json!("3")).is_err());
    }

    #[test]
    fn shape_checks() {
        let vec3 = item(DType::Float, None, &[3]);
        assert!(encode(&vec3, "o", &json!([5, 5, 5])).is_ok());
        assert!(encode(&vec3, "o", &json!([5, 5])).is_err());
        assert!(encode(&vec3, "o", &json!(5)).is_err());
        assert!(encode(&vec3, "o", &json!([[5], [5], [5]])).is_err());

        let any_by_two = item(DType::Float, None, &[-1, 2]);
        assert!(encode(&any_by_two, "m", &json!([[1, 2], [3, 4], [5, 6]])).is_ok());
        assert!(encode(&any_by_two, "m", &json!([[1, 2], [3]])).is_err());
        let ragged = item(DType::Float, None, &[-1, -1]);
        assert!(encode(&ragged, "m", &json!([[1, 2], 3])).is_err());
    }

    #[test]
    fn integer_conversion_must_stay_integral() {
        let int_m = item(DType::Int, Some("mm"), &[]);
        let stored = encode(&int_m, "n", &json!({"value": 3, "unit": "m"})).expect("ok");
        assert_eq!(stored["value"], json!(3000));
        assert!(encode(&item(DType::Int, Some("m"), &[]), "n", &json!({"value": 3, "unit": "mm"})).is_err());
    }

    #[test]
    fn converted_integers_must_fit() {
        let int_mm = item(DType::Int, Some("mm"), &[]);
        for value in [i64::MAX, i64::MIN, 1 << 60] {
            assert!(matches!(
                encode(&int_mm, "n", &json!({"value": value, "unit": "km"})),
                Err(EdmError::Validation(_))
            ));
        }
        let beyond = encode(&int_mm, "n", &json!({"value": 10_000_000_000_000i64, "unit": "km"}));
        assert!(matches!(beyond, Err(EdmError::Validation(_))));
        let stored = encode(&int_mm, "n", &json!({"value": 1_000_000_000i64, "unit": "km"})).expect("fits");
        assert_eq!(stored["value"], json!(1_000_000_000_000_000i64));
        let same = encode(&int_mm, "n", &json!({"value": i64::MAX, "unit": "mm"})).expect("identity");
        assert_eq!(same["value"], json!(i64::MAX));
    }

    #[test]
    fn bool_accepts_only_identity_conversion() {
        let flag = item(DType::Bool, Some("m"), &[]);
        assert!(encode(&flag, "b", &json!({"value": true, "unit": "m"})).is_ok());
        assert!(encode(&flag, "b", &json!({"value": true, "unit": "mm"})).is_err());
    }

    #[test]
    fn strings_and_opaque() {
        let s = item(DType::Str, None, &[]);
        assert_eq!(encode(&s, "name", &json!("mat0")).expect("str"), json!("mat0"));
        assert!(encode(&s, "name", &json!(1)).is_err());
        let o = item(DType::Opaque, None, &[]);
        let blob = json!({"a": [1, {"b": null}]});
        assert_eq!(encode(&o, "props", &blob).expect("opaque"), blob);
    }

    #[test]
    fn decode_converts_stale_units() {
        let in_mm = item(DType::Float, Some("mm"), &[]);
        let stored = json!({"value": 2.5, "unit": "m"});
        let read = decode(&in_mm, "length", &stored).expect("decode");
        assert_eq!(value_f64(&read), 2500.0);
        assert_eq!(read["unit"], "mm");
    }
}
