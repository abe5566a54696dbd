//! Scalar converters: booleans, integers, floats, text, bytea,
//! numeric and UUID.

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::frontend::extended::EncodedParam;
use crate::protocol::types::FormatCode;
use crate::row::Column;
use crate::value::Value;

use super::Convert;

fn utf8<'a>(ty: &str, column: &Column, raw: &'a [u8]) -> Result<&'a str> {
    simdutf8::compat::from_utf8(raw)
        .map_err(|e| Error::convert(ty, column.type_oid, format!("invalid UTF-8: {}", e)))
}

fn binary(format: FormatCode, bytes: Vec<u8>) -> EncodedParam {
    debug_assert_eq!(format, FormatCode::Binary);
    EncodedParam {
        format,
        bytes: Some(bytes),
    }
}

fn unexpected(ty: &str, value: &Value) -> Error {
    Error::convert(ty, 0, format!("cannot encode {:?}", value))
}

// === Boolean ===

/// Converter for `boolean`.
pub struct BoolConvert;

impl Convert for BoolConvert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        if column.format == FormatCode::Binary {
            return match raw {
                [0] => Ok(Value::Bool(false)),
                [_] => Ok(Value::Bool(true)),
                _ => Err(Error::convert(
                    "bool",
                    column.type_oid,
                    format!("invalid boolean length {}", raw.len()),
                )),
            };
        }

        let text = utf8("bool", column, raw)?;
        match text.to_ascii_lowercase().as_str() {
            "t" | "true" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
            "f" | "false" | "no" | "off" | "0" => Ok(Value::Bool(false)),
            other => Err(Error::convert(
                "bool",
                column.type_oid,
                format!("invalid boolean {:?}", other),
            )),
        }
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::Bool(v) => Ok(binary(FormatCode::Binary, vec![u8::from(*v)])),
            other => Err(unexpected("bool", other)),
        }
    }
}

// === Integers ===

fn decode_int(ty: &str, column: &Column, raw: &[u8]) -> Result<i64> {
    if column.format == FormatCode::Binary {
        return match raw.len() {
            2 => Ok(i16::from_be_bytes([raw[0], raw[1]]).into()),
            4 => Ok(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]).into()),
            8 => Ok(i64::from_be_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ])),
            len => Err(Error::convert(
                ty,
                column.type_oid,
                format!("invalid integer length {}", len),
            )),
        };
    }

    utf8(ty, column, raw)?
        .parse()
        .map_err(|e| Error::convert(ty, column.type_oid, format!("invalid integer: {}", e)))
}

macro_rules! int_convert {
    ($name:ident, $ident:literal, $rust:ty, $variant:ident) => {
        /// Converter for the correspondingly sized integer type.
        pub struct $name;

        impl Convert for $name {
            fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
                let wide = decode_int($ident, column, raw)?;
                let narrowed = <$rust>::try_from(wide).map_err(|_| {
                    Error::convert(
                        $ident,
                        column.type_oid,
                        format!("value {} out of range", wide),
                    )
                })?;
                Ok(Value::$variant(narrowed))
            }

            fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
                match value {
                    Value::$variant(v) => {
                        Ok(binary(FormatCode::Binary, v.to_be_bytes().to_vec()))
                    }
                    other => Err(unexpected($ident, other)),
                }
            }
        }
    };
}

int_convert!(Int2Convert, "int2", i16, Int2);
int_convert!(Int4Convert, "int4", i32, Int4);
int_convert!(Int8Convert, "int8", i64, Int8);

// === Floats ===

fn decode_float(ty: &str, column: &Column, raw: &[u8]) -> Result<f64> {
    if column.format == FormatCode::Binary {
        return match raw.len() {
            4 => Ok(f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]).into()),
            8 => Ok(f64::from_be_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ])),
            len => Err(Error::convert(
                ty,
                column.type_oid,
                format!("invalid float length {}", len),
            )),
        };
    }

    let text = utf8(ty, column, raw)?;
    match text {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => text
            .parse()
            .map_err(|e| Error::convert(ty, column.type_oid, format!("invalid float: {}", e))),
    }
}

/// Render a float in PostgreSQL text form (`NaN`, `Infinity`, ...).
pub(crate) fn float_text(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "Infinity".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        value.to_string()
    }
}

/// Converter for `float4`.
pub struct Float4Convert;

impl Convert for Float4Convert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        Ok(Value::Float4(decode_float("float4", column, raw)? as f32))
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::Float4(v) => Ok(binary(FormatCode::Binary, v.to_be_bytes().to_vec())),
            other => Err(unexpected("float4", other)),
        }
    }
}

/// Converter for `float8`.
pub struct Float8Convert;

impl Convert for Float8Convert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        Ok(Value::Float8(decode_float("float8", column, raw)?))
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::Float8(v) => Ok(binary(FormatCode::Binary, v.to_be_bytes().to_vec())),
            other => Err(unexpected("float8", other)),
        }
    }
}

// === Text ===

/// Converter for the text family (`text`, `varchar`, `bpchar`, `name`,
/// `unknown`). Text and binary formats are identical for these types.
pub struct TextConvert;

impl Convert for TextConvert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        Ok(Value::Text(utf8("text", column, raw)?.to_string()))
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::Text(v) => Ok(EncodedParam {
                format: FormatCode::Text,
                bytes: Some(v.as_bytes().to_vec()),
            }),
            other => Err(unexpected("text", other)),
        }
    }
}

// === Bytea ===

/// Converter for `bytea` (`\x`-prefixed hex in text format).
pub struct ByteaConvert;

impl Convert for ByteaConvert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        if column.format == FormatCode::Binary {
            return Ok(Value::Bytes(raw.to_vec()));
        }

        let text = utf8("bytea", column, raw)?;
        let hex = text.strip_prefix("\\x").ok_or_else(|| {
            Error::convert("bytea", column.type_oid, "missing \\x prefix".to_string())
        })?;
        if hex.len() % 2 != 0 {
            return Err(Error::convert(
                "bytea",
                column.type_oid,
                "odd hex length".to_string(),
            ));
        }

        let mut bytes = Vec::with_capacity(hex.len() / 2);
        for chunk in hex.as_bytes().chunks_exact(2) {
            let high = hex_digit(chunk[0]);
            let low = hex_digit(chunk[1]);
            match (high, low) {
                (Some(h), Some(l)) => bytes.push(h << 4 | l),
                _ => {
                    return Err(Error::convert(
                        "bytea",
                        column.type_oid,
                        "invalid hex digit".to_string(),
                    ));
                }
            }
        }
        Ok(Value::Bytes(bytes))
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::Bytes(v) => Ok(binary(FormatCode::Binary, v.clone())),
            other => Err(unexpected("bytea", other)),
        }
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Render bytes in `bytea` text form.
pub(crate) fn bytea_text(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

// === Numeric ===

const NUMERIC_POSITIVE: u16 = 0x0000;
const NUMERIC_NEGATIVE: u16 = 0x4000;

/// Converter for `numeric`/`decimal`.
///
/// The binary form is the base-10000 digit representation; encoding
/// always uses text, which the server accepts for numeric.
pub struct NumericConvert;

impl Convert for NumericConvert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        let text = if column.format == FormatCode::Binary {
            numeric_binary_to_string(column, raw)?
        } else {
            utf8("numeric", column, raw)?.to_string()
        };

        let decimal = text.parse::<Decimal>().map_err(|e| {
            Error::convert(
                "numeric",
                column.type_oid,
                format!("invalid numeric {:?}: {}", text, e),
            )
        })?;
        Ok(Value::Numeric(decimal))
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::Numeric(v) => Ok(EncodedParam {
                format: FormatCode::Text,
                bytes: Some(v.to_string().into_bytes()),
            }),
            other => Err(unexpected("numeric", other)),
        }
    }
}

/// Decode the binary numeric representation into its decimal string.
fn numeric_binary_to_string(column: &Column, raw: &[u8]) -> Result<String> {
    let err = |cause: &str| Error::convert("numeric", column.type_oid, cause.to_string());

    if raw.len() < 8 {
        return Err(err("truncated numeric header"));
    }
    let ndigits = i16::from_be_bytes([raw[0], raw[1]]) as usize;
    let weight = i16::from_be_bytes([raw[2], raw[3]]) as i32;
    let sign = u16::from_be_bytes([raw[4], raw[5]]);
    let dscale = u16::from_be_bytes([raw[6], raw[7]]) as usize;

    match sign {
        NUMERIC_POSITIVE | NUMERIC_NEGATIVE => {}
        // NaN and infinities have no Decimal representation.
        _ => return Err(err("numeric is not a finite number")),
    }

    if raw.len() < 8 + ndigits * 2 {
        return Err(err("truncated numeric digits"));
    }
    let mut digits = Vec::with_capacity(ndigits);
    for i in 0..ndigits {
        let offset = 8 + i * 2;
        digits.push(i16::from_be_bytes([raw[offset], raw[offset + 1]]));
    }

    // Integer part: base-10000 digits with indices 0..=weight.
    let mut text = String::new();
    if sign == NUMERIC_NEGATIVE {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        for i in 0..=weight {
            let digit = digits.get(i as usize).copied().unwrap_or(0);
            if i == 0 {
                text.push_str(&digit.to_string());
            } else {
                text.push_str(&format!("{:04}", digit));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::new();
        let mut index = weight + 1;
        while frac.len() < dscale {
            if index < 0 {
                frac.push_str("0000");
            } else {
                let digit = digits.get(index as usize).copied().unwrap_or(0);
                frac.push_str(&format!("{:04}", digit));
            }
            index += 1;
        }
        frac.truncate(dscale);
        text.push('.');
        text.push_str(&frac);
    }

    Ok(text)
}

// === UUID ===

/// Converter for `uuid`.
pub struct UuidConvert;

impl Convert for UuidConvert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        if column.format == FormatCode::Binary {
            let uuid = Uuid::from_slice(raw).map_err(|e| {
                Error::convert("uuid", column.type_oid, format!("invalid uuid: {}", e))
            })?;
            return Ok(Value::Uuid(uuid));
        }

        let text = utf8("uuid", column, raw)?;
        let uuid = Uuid::parse_str(text).map_err(|e| {
            Error::convert("uuid", column.type_oid, format!("invalid uuid: {}", e))
        })?;
        Ok(Value::Uuid(uuid))
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::Uuid(v) => Ok(binary(FormatCode::Binary, v.as_bytes().to_vec())),
            other => Err(unexpected("uuid", other)),
        }
    }
}
