//! Canonical JSON for deterministic hashing.
//!
//! Canonical JSON is the byte form used exclusively as hash input. The rules:
//!
//! - Object keys sorted by Unicode code-point order; duplicate keys in parsed
//!   input are rejected.
//! - No whitespace between tokens.
//! - Strings are NFC-normalized and line endings are normalized
//!   (`\r\n` → `\n`, lone `\r` → `\n`) before escaping.
//! - Numbers must be finite; `-0` serializes as `0`; floats use the shortest
//!   round-tripping decimal form, with integral floats emitted without a
//!   fractional part.
//! - `null`, `true`, `false` verbatim; arrays preserve input order.
//! - Absent fields are omitted entirely, never serialized as `null`.
//!
//! Unlike a validating canonicalizer, strings here are normalized rather
//! than rejected: two inputs that differ only in Unicode composition or line
//! endings canonicalize to identical bytes.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Number, Value};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum nesting depth accepted by the canonicalizer.
pub const MAX_DEPTH: usize = 128;

/// Errors that make a value non-canonicalizable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonError {
    /// A number is NaN or infinite.
    #[error("non-finite number cannot be canonicalized")]
    NonFiniteNumber,

    /// A duplicate key was found while parsing input text.
    #[error("duplicate key: '{key}' appears multiple times in object")]
    DuplicateKey {
        /// The duplicated key after escape decoding.
        key: String,
    },

    /// The structure nests deeper than [`MAX_DEPTH`] levels.
    #[error("max depth exceeded: nested deeper than {max_depth} levels")]
    MaxDepthExceeded {
        /// The limit that was exceeded.
        max_depth: usize,
    },

    /// The input text is not valid JSON.
    #[error("JSON parse error: {message}")]
    Parse {
        /// Parser diagnostic.
        message: String,
    },
}

/// Canonicalizes a JSON value to its deterministic string form.
///
/// # Errors
///
/// Returns [`CanonError`] for non-finite numbers or structures nested deeper
/// than [`MAX_DEPTH`].
pub fn canonicalize(value: &Value) -> Result<String, CanonError> {
    let mut out = String::new();
    emit_value(value, &mut out, 0)?;
    Ok(out)
}

/// Parses JSON text (rejecting duplicate keys) and canonicalizes it.
///
/// # Errors
///
/// Returns [`CanonError`] for invalid JSON, duplicate keys, non-finite
/// numbers, or excessive nesting.
pub fn canonicalize_str(input: &str) -> Result<String, CanonError> {
    let value = parse_rejecting_duplicates(input)?;
    canonicalize(&value)
}

/// Returns a copy of `value` with the named top-level field removed.
///
/// Used to strip fields (`cid`, `prev_hash`) that are spliced in after the
/// content id is computed. Non-objects are returned unchanged.
#[must_use]
pub fn strip_field(value: &Value, field: &str) -> Value {
    match value {
        Value::Object(obj) => {
            let mut out = Map::new();
            for (k, v) in obj {
                if k != field {
                    out.insert(k.clone(), v.clone());
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Parses JSON text with duplicate-key detection.
///
/// Standard parsers silently let the last duplicate win; hash input must not
/// depend on that. Detection runs on decoded keys, so `"a"` and `"a"`
/// collide as expected.
fn parse_rejecting_duplicates(input: &str) -> Result<Value, CanonError> {
    let mut deserializer = serde_json::Deserializer::from_str(input);
    let value = CheckedValue::deserialize(&mut deserializer).map_err(|e| {
        let msg = e.to_string();
        if let Some(rest) = msg.strip_prefix("duplicate key: ") {
            let key = rest.split(" at line ").next().unwrap_or(rest).to_string();
            CanonError::DuplicateKey { key }
        } else {
            CanonError::Parse { message: msg }
        }
    })?;
    Ok(value.0)
}

/// JSON value wrapper whose deserializer rejects duplicate object keys.
struct CheckedValue(Value);

impl<'de> Deserialize<'de> for CheckedValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("any valid JSON value")
            }

            fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Number::from_f64(v)
                    .map(Value::Number)
                    .ok_or_else(|| de::Error::custom("non-finite number"))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(Value::String(v.to_owned()))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
                Ok(Value::String(v))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(Value::Null)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(Value::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut vec = Vec::new();
                while let Some(elem) = seq.next_element::<CheckedValue>()? {
                    vec.push(elem.0);
                }
                Ok(Value::Array(vec))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut seen = BTreeSet::new();
                let mut obj = Map::new();
                while let Some(key) = map.next_key::<String>()? {
                    if !seen.insert(key.clone()) {
                        return Err(de::Error::custom(format!("duplicate key: {key}")));
                    }
                    let value = map.next_value::<CheckedValue>()?;
                    obj.insert(key, value.0);
                }
                Ok(Value::Object(obj))
            }
        }

        deserializer
            .deserialize_any(ValueVisitor)
            .map(CheckedValue)
    }
}

fn emit_value(value: &Value, out: &mut String, depth: usize) -> Result<(), CanonError> {
    if depth > MAX_DEPTH {
        return Err(CanonError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }

    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, out)?,
        Value::String(s) => emit_string(s, out),
        Value::Array(arr) => {
            out.push('[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_value(item, out, depth + 1)?;
            }
            out.push(']');
        }
        Value::Object(obj) => {
            // Byte order over UTF-8 equals code-point order.
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_string(key, out);
                out.push(':');
                emit_value(&obj[*key], out, depth + 1)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn emit_number(n: &Number, out: &mut String) -> Result<(), CanonError> {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
        return Ok(());
    }
    let Some(f) = n.as_f64() else {
        return Err(CanonError::NonFiniteNumber);
    };
    if !f.is_finite() {
        return Err(CanonError::NonFiniteNumber);
    }
    if f == 0.0 {
        // Covers -0.0: canonical form is plain 0.
        out.push('0');
        return Ok(());
    }
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        // Integral floats inside the 2^53 window emit without a fraction.
        let _ = write!(out, "{}", f as i64);
        return Ok(());
    }
    // serde_json renders floats via ryu: shortest round-tripping form.
    let _ = write!(out, "{f}");
    Ok(())
}

/// Escapes and emits a string after NFC + line-ending normalization.
fn emit_string(s: &str, out: &mut String) {
    let nfc: String = s.nfc().collect();
    let normalized = nfc.replace("\r\n", "\n").replace('\r', "\n");

    out.push('"');
    for c in normalized.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn primitives() {
        assert_eq!(canonicalize(&json!(null)).unwrap(), "null");
        assert_eq!(canonicalize(&json!(true)).unwrap(), "true");
        assert_eq!(canonicalize(&json!(false)).unwrap(), "false");
        assert_eq!(canonicalize(&json!(42)).unwrap(), "42");
        assert_eq!(canonicalize(&json!(-42)).unwrap(), "-42");
        assert_eq!(canonicalize(&json!("hi")).unwrap(), r#""hi""#);
    }

    #[test]
    fn keys_sorted_no_whitespace() {
        let v = json!({"z": 1, "a": 2, "m": 3});
        assert_eq!(canonicalize(&v).unwrap(), r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn nested_sorting_and_array_order() {
        let v = json!({"z": {"b": 2, "a": 1}, "a": [3, 1, 2]});
        assert_eq!(
            canonicalize(&v).unwrap(),
            r#"{"a":[3,1,2],"z":{"a":1,"b":2}}"#
        );
    }

    #[test]
    fn negative_zero_becomes_zero() {
        assert_eq!(canonicalize(&json!(-0.0)).unwrap(), "0");
        assert_eq!(canonicalize(&json!(0.0)).unwrap(), "0");
    }

    #[test]
    fn integral_float_drops_fraction() {
        assert_eq!(canonicalize(&json!(2.0)).unwrap(), "2");
        assert_eq!(canonicalize(&json!(1.5)).unwrap(), "1.5");
    }

    #[test]
    fn nfc_normalization_unifies_composition() {
        // "é" precomposed vs "e" + combining acute.
        let composed = canonicalize(&json!("\u{00e9}")).unwrap();
        let decomposed = canonicalize(&json!("e\u{0301}")).unwrap();
        assert_eq!(composed, decomposed);
    }

    #[test]
    fn line_endings_normalize() {
        assert_eq!(
            canonicalize(&json!("a\r\nb\rc\nd")).unwrap(),
            r#""a\nb\nc\nd""#
        );
    }

    #[test]
    fn control_chars_escape() {
        assert_eq!(canonicalize(&json!("a\tb")).unwrap(), r#""a\tb""#);
        assert_eq!(canonicalize(&json!("\u{0001}")).unwrap(), r#""""#);
    }

    #[test]
    fn duplicate_keys_rejected_in_text() {
        let err = canonicalize_str(r#"{"a": 1, "a": 2}"#).unwrap_err();
        assert!(matches!(err, CanonError::DuplicateKey { key } if key == "a"));
    }

    #[test]
    fn duplicate_keys_detected_after_escape_decoding() {
        // "\u0061\u0062\u0063" decodes to "abc"; the collision must still
        // be caught.
        let err =
            canonicalize_str(r#"{"abc": 1, "\u0061\u0062\u0063": 2}"#).unwrap_err();
        assert!(matches!(err, CanonError::DuplicateKey { key } if key == "abc"));
    }

    #[test]
    fn invalid_json_is_parse_error() {
        assert!(matches!(
            canonicalize_str("not json"),
            Err(CanonError::Parse { .. })
        ));
    }

    #[test]
    fn depth_limit_enforced() {
        let mut v = json!(0);
        for _ in 0..(MAX_DEPTH + 10) {
            v = json!([v]);
        }
        assert!(matches!(
            canonicalize(&v),
            Err(CanonError::MaxDepthExceeded { .. })
        ));
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let inputs = [
            r#"{"z": 1, "a": 2}"#,
            r#"{"nested": {"b": 2, "a": 1}, "top": "value"}"#,
            r#"[1, 2, {"y": 3, "x": 4}]"#,
        ];
        for input in inputs {
            let once = canonicalize_str(input).unwrap();
            let twice = canonicalize_str(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn equal_after_normalization_iff_equal_canonical() {
        let a = json!({"text": "caf\u{00e9}\r\n", "n": 1});
        let b = json!({"n": 1, "text": "cafe\u{0301}\n"});
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());

        let c = json!({"n": 2, "text": "caf\u{00e9}\n"});
        assert_ne!(canonicalize(&a).unwrap(), canonicalize(&c).unwrap());
    }

    #[test]
    fn strip_field_removes_only_named_key() {
        let v = json!({"a": 1, "cid": "c:xyz", "b": 2});
        let stripped = strip_field(&v, "cid");
        assert_eq!(canonicalize(&stripped).unwrap(), r#"{"a":1,"b":2}"#);
        // Non-objects pass through.
        assert_eq!(strip_field(&json!([1]), "cid"), json!([1]));
    }

    #[test]
    fn absent_fields_are_omitted() {
        // Serialization of Option::None with skip_serializing_if never
        // reaches the canonicalizer; explicit null still serializes.
        let v = json!({"present": null});
        assert_eq!(canonicalize(&v).unwrap(), r#"{"present":null}"#);
    }
}
