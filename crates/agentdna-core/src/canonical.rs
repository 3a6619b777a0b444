//! Canonical JSON (RFC 8785 / JCS) used as the signing input for envelopes.
//!
//! Object members are sorted by key, no insignificant whitespace is emitted, numbers follow
//! the ECMAScript `Number.prototype.toString` rules and strings use the minimal JCS escape set.
//! Two values that compare equal always canonicalize to the same bytes, whatever order their
//! members were inserted in.

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::{Number, Value};

use crate::error::{Error, Result};

/// Canonicalize a JSON value.
pub fn canonicalize(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_value(&mut out, value)?;
    Ok(out)
}

/// Serialize `value` through serde and return its canonical bytes.
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(canonicalize(&value)?.into_bytes())
}

fn write_value(out: &mut String, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(out, n)?,
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // JCS orders by UTF-16 code units; for keys outside the BMP this differs from
            // byte order, so sort on the UTF-16 encoding explicitly.
            let mut members: Vec<(&String, &Value)> = map.iter().collect();
            members.sort_by(|(a, _), (b, _)| a.encode_utf16().cmp(b.encode_utf16()));

            out.push('{');
            for (idx, (key, member)) in members.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, member)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_number(out: &mut String, n: &Number) -> Result<()> {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
        return Ok(());
    }
    match n.as_f64() {
        Some(f) => write_f64(out, f),
        None => Err(Error::Json(format!("unsupported JSON number: {n}"))),
    }
}

/// ECMAScript number-to-string for finite doubles.
fn write_f64(out: &mut String, v: f64) -> Result<()> {
    if !v.is_finite() {
        return Err(Error::Json("non-finite numbers are not valid JSON".into()));
    }
    if v == 0.0 {
        out.push('0');
        return Ok(());
    }
    if v < 0.0 {
        out.push('-');
    }

    let mut buf = ryu::Buffer::new();
    let (digits, n) = shortest_digits(buf.format_finite(v.abs()))?;
    let k = digits.len() as i32;

    if k <= n && n <= 21 {
        out.push_str(&digits);
        out.extend(std::iter::repeat('0').take((n - k) as usize));
    } else if 0 < n && n <= 21 {
        let (int_part, frac_part) = digits.split_at(n as usize);
        out.push_str(int_part);
        out.push('.');
        out.push_str(frac_part);
    } else if -6 < n && n <= 0 {
        out.push_str("0.");
        out.extend(std::iter::repeat('0').take((-n) as usize));
        out.push_str(&digits);
    } else {
        let (first, rest) = digits.split_at(1);
        out.push_str(first);
        if !rest.is_empty() {
            out.push('.');
            out.push_str(rest);
        }
        let exp = n - 1;
        let _ = write!(out, "e{}{}", if exp >= 0 { "+" } else { "-" }, exp.abs());
    }
    Ok(())
}

/// Split a ryu rendering into significant digits and the decimal point position `n`,
/// so that the value equals `0.d1d2..dk * 10^n`.
fn shortest_digits(rendered: &str) -> Result<(String, i32)> {
    let (mantissa, exponent) = match rendered.split_once(['e', 'E']) {
        Some((m, e)) => {
            let exp: i32 = e
                .parse()
                .map_err(|_| Error::Json(format!("invalid exponent in {rendered}")))?;
            (m, exp)
        }
        None => (rendered, 0),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));

    let all: String = int_part.chars().chain(frac_part.chars()).collect();
    let mut point = int_part.len() as i32 + exponent;

    let trimmed_leading = all.trim_start_matches('0');
    point -= (all.len() - trimmed_leading.len()) as i32;
    let digits = trimmed_leading.trim_end_matches('0');

    if digits.is_empty() {
        return Err(Error::Json(format!("no significant digits in {rendered}")));
    }
    Ok((digits.to_string(), point))
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_and_strips_whitespace() {
        let value = json!({"z": 1, "a": {"y": true, "b": null}, "m": [3, 2, 1]});
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"a":{"b":null,"y":true},"m":[3,2,1],"z":1}"#
        );
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut first = serde_json::Map::new();
        first.insert("task_id".into(), json!("t1"));
        first.insert("context_id".into(), json!("c1"));
        let mut second = serde_json::Map::new();
        second.insert("context_id".into(), json!("c1"));
        second.insert("task_id".into(), json!("t1"));

        assert_eq!(
            canonicalize(&Value::Object(first)).unwrap(),
            canonicalize(&Value::Object(second)).unwrap()
        );
    }

    #[test]
    fn numbers_follow_ecmascript_rendering() {
        let value = json!({
            "a": 1.0,
            "b": 0.0,
            "c": -0.0,
            "d": 1e21,
            "e": 1e20,
            "f": 1e-6,
            "g": 1e-7,
            "h": 123.456,
            "i": -2.5e-9,
        });
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"a":1,"b":0,"c":0,"d":1e+21,"e":100000000000000000000,"f":0.000001,"g":1e-7,"h":123.456,"i":-2.5e-9}"#
        );
    }

    #[test]
    fn integers_are_exact() {
        let value = json!([i64::MIN, u64::MAX, 0, -1]);
        assert_eq!(
            canonicalize(&value).unwrap(),
            format!("[{},{},0,-1]", i64::MIN, u64::MAX)
        );
    }

    #[test]
    fn escapes_only_what_jcs_requires() {
        let value = json!({
            "quote": "\"",
            "backslash": "\\",
            "ctl": "\u{000f}",
            "b": "\u{0008}",
            "nl": "\n",
            "del": "\u{007f}",
            "u2028": "\u{2028}",
        });
        assert_eq!(
            canonicalize(&value).unwrap(),
            "{\"b\":\"\\b\",\"backslash\":\"\\\\\",\"ctl\":\"\\u000f\",\"del\":\"\u{007f}\",\"nl\":\"\\n\",\"quote\":\"\\\"\",\"u2028\":\"\u{2028}\"}"
        );
    }

    #[test]
    fn numeric_string_keys_sort_lexically() {
        let value = json!({"2": "b", "10": "a", "a": 0});
        assert_eq!(canonicalize(&value).unwrap(), r#"{"10":"a","2":"b","a":0}"#);
    }

    #[test]
    fn output_is_valid_json() {
        let value = json!({"msg": "Are you free tomorrow?\n", "n": [0.5, 7]});
        let canonical = canonicalize(&value).unwrap();
        let reparsed: Value = serde_json::from_str(&canonical).unwrap();
        assert_eq!(reparsed, value);
    }
}
