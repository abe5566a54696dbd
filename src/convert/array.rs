//! The recursive array text codec.
//!
//! Grammar: `'{' elem (',' elem)* '}'` where an element is an unquoted
//! `NULL`, a quoted string with `\\` and `\"` escapes, a nested
//! `{...}` sub-array, or an unquoted token terminated by `,` or `}`.
//! Whitespace between tokens is ignored.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::frontend::extended::EncodedParam;
use crate::protocol::types::{FormatCode, element_oid, oid};
use crate::row::Column;
use crate::value::Value;

use super::temporal::{format_date, format_time, format_timestamp, format_timestamptz};
use super::{Convert, scalar};

/// Converter for array types, parameterized by the element converter.
///
/// Only the text wire format is supported; the element type OID is
/// derived from the array OID through a fixed table, falling back to
/// `unknown` for untyped targets.
pub struct ArrayConvert {
    elem: Arc<dyn Convert>,
}

impl ArrayConvert {
    /// Build an array converter over an element converter.
    pub fn new(elem: Arc<dyn Convert>) -> Self {
        Self { elem }
    }
}

impl Convert for ArrayConvert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        if column.format == FormatCode::Binary {
            return Err(Error::convert(
                "array",
                column.type_oid,
                "binary array format is not supported".to_string(),
            ));
        }

        let elem_column = Column {
            type_oid: element_oid(column.type_oid).unwrap_or(oid::UNKNOWN),
            format: FormatCode::Text,
            ..column.clone()
        };

        let mut scanner = Scanner {
            bytes: raw,
            pos: 0,
            oid: column.type_oid,
        };
        scanner.skip_whitespace();
        let items = scanner.parse_elements(self.elem.as_ref(), &elem_column)?;
        scanner.skip_whitespace();
        if !scanner.at_end() {
            return Err(scanner.fail("trailing garbage after closing brace"));
        }

        Ok(Value::Array(items))
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::Array(items) => {
                let mut out = String::new();
                render_array(items, &mut out)?;
                Ok(EncodedParam {
                    format: FormatCode::Text,
                    bytes: Some(out.into_bytes()),
                })
            }
            other => Err(Error::convert(
                "array",
                0,
                format!("cannot encode {:?}", other),
            )),
        }
    }
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    oid: u32,
}

impl Scanner<'_> {
    fn fail(&self, cause: impl Into<String>) -> Error {
        Error::convert("array", self.oid, cause)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn skip_whitespace(&mut self) {
        while self
            .peek()
            .is_some_and(|byte| byte.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn require(&mut self, expected: u8) -> Result<()> {
        match self.bump() {
            Some(byte) if byte == expected => Ok(()),
            Some(byte) => Err(self.fail(format!(
                "expected {:?}, found {:?}",
                expected as char, byte as char
            ))),
            None => Err(self.fail(format!(
                "expected {:?}, found end of input",
                expected as char
            ))),
        }
    }

    /// True when the next token is an unquoted NULL followed by a
    /// terminator (`,`, `}` or whitespace).
    fn at_null(&self) -> bool {
        if !self.bytes[self.pos..].starts_with(b"NULL") {
            return false;
        }
        match self.bytes.get(self.pos + 4) {
            None => true,
            Some(byte) => matches!(byte, b',' | b'}') || byte.is_ascii_whitespace(),
        }
    }

    /// Parse one `{...}` level; the cursor must be on the opening brace.
    fn parse_elements(&mut self, elem: &dyn Convert, elem_column: &Column) -> Result<Vec<Value>> {
        self.require(b'{')?;
        self.skip_whitespace();

        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.fail("unterminated array literal")),
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => {}
            }

            if !items.is_empty() {
                self.require(b',')?;
                self.skip_whitespace();
            }

            let item = match self.peek() {
                Some(b'N') if self.at_null() => {
                    self.pos += 4;
                    Value::Null
                }
                Some(b'"') => {
                    let token = self.quoted_token()?;
                    self.decode_element(elem, elem_column, &token)?
                }
                Some(b'{') => Value::Array(self.parse_elements(elem, elem_column)?),
                Some(_) => {
                    let token = self.unquoted_token()?;
                    self.decode_element(elem, elem_column, &token)?
                }
                None => return Err(self.fail("unterminated array literal")),
            };
            items.push(item);
            self.skip_whitespace();
        }
    }

    fn decode_element(
        &self,
        elem: &dyn Convert,
        elem_column: &Column,
        raw: &[u8],
    ) -> Result<Value> {
        let value = elem.from_bytes(elem_column, raw)?;
        if value.is_null() {
            return Err(Error::InvalidConvertDataType);
        }
        Ok(value)
    }

    /// Consume a `"..."` token, resolving `\\` and `\"` escapes.
    fn quoted_token(&mut self) -> Result<Vec<u8>> {
        self.require(b'"')?;
        let mut token = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.fail("unterminated quoted element")),
                Some(b'\\') => match self.bump() {
                    Some(escaped) => token.push(escaped),
                    None => return Err(self.fail("unterminated escape sequence")),
                },
                Some(b'"') => return Ok(token),
                Some(byte) => token.push(byte),
            }
        }
    }

    /// Consume an unquoted token up to `,` or `}` (exclusive).
    fn unquoted_token(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if matches!(byte, b',' | b'}') {
                break;
            }
            self.pos += 1;
        }

        let mut end = self.pos;
        while end > start && self.bytes[end - 1].is_ascii_whitespace() {
            end -= 1;
        }
        if end == start {
            return Err(self.fail("empty unquoted element"));
        }
        Ok(self.bytes[start..end].to_vec())
    }
}

// === Encoding ===

fn render_array(items: &[Value], out: &mut String) -> Result<()> {
    out.push('{');
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        match item {
            Value::Null => out.push_str("NULL"),
            Value::Array(nested) => render_array(nested, out)?,
            scalar => {
                let text = element_text(scalar)?;
                if needs_quotes(&text) {
                    out.push('"');
                    for c in text.chars() {
                        if c == '"' || c == '\\' {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push('"');
                } else {
                    out.push_str(&text);
                }
            }
        }
    }
    out.push('}');
    Ok(())
}

fn needs_quotes(text: &str) -> bool {
    text.is_empty()
        || text.eq_ignore_ascii_case("null")
        || text
            .chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace())
}

/// Canonical text rendering of a scalar element.
fn element_text(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Bool(v) => if *v { "t" } else { "f" }.to_string(),
        Value::Int2(v) => v.to_string(),
        Value::Int4(v) => v.to_string(),
        Value::Int8(v) => v.to_string(),
        Value::Float4(v) => {
            if v.is_nan() {
                "NaN".to_string()
            } else if *v == f32::INFINITY {
                "Infinity".to_string()
            } else if *v == f32::NEG_INFINITY {
                "-Infinity".to_string()
            } else {
                v.to_string()
            }
        }
        Value::Float8(v) => scalar::float_text(*v),
        Value::Text(v) => v.clone(),
        Value::Bytes(v) => scalar::bytea_text(v),
        Value::Timestamp(v) => format_timestamp(*v),
        Value::TimestampTz(v) => format_timestamptz(*v),
        Value::Date(v) => format_date(*v),
        Value::Time(v) => format_time(*v),
        Value::Interval(v) => v.to_string(),
        Value::Uuid(v) => v.to_string(),
        Value::Numeric(v) => v.to_string(),
        Value::Null | Value::Array(_) => {
            return Err(Error::convert(
                "array",
                0,
                format!("non-scalar element {:?}", value),
            ));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::Registry;
    use crate::error::Error;

    fn array_column(array_oid: u32) -> Column {
        Column {
            index: 0,
            name: "c".into(),
            table_oid: 0,
            column_id: 0,
            type_oid: array_oid,
            type_size: -1,
            type_modifier: -1,
            format: FormatCode::Text,
        }
    }

    fn decode(ident: &str, array_oid: u32, text: &[u8]) -> Result<Value> {
        Registry::global().decode(ident, &array_column(array_oid), Some(text))
    }

    #[test]
    fn flat_int_array_with_null() {
        let value = decode("int4[]", oid::INT4_ARRAY, b"{1,2,NULL,4}").unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Int4(1),
                Value::Int4(2),
                Value::Null,
                Value::Int4(4),
            ])
        );
    }

    #[test]
    fn quoted_element_with_comma_decodes_as_text() {
        let value = decode("text[]", oid::TEXT_ARRAY, b"{1,2,NULL,\"4,5\"}").unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Text("1".into()),
                Value::Text("2".into()),
                Value::Null,
                Value::Text("4,5".into()),
            ])
        );

        // An integer-typed decode of the same literal fails on the
        // quoted element.
        assert!(decode("int4[]", oid::INT4_ARRAY, b"{1,2,NULL,\"4,5\"}").is_err());
    }

    #[test]
    fn nested_arrays() {
        let value = decode("int4[][]", oid::INT4_ARRAY, b"{{1,2},{3,4}}").unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Array(vec![Value::Int4(1), Value::Int4(2)]),
                Value::Array(vec![Value::Int4(3), Value::Int4(4)]),
            ])
        );
    }

    #[test]
    fn whitespace_between_tokens_is_ignored() {
        let value = decode("int4[]", oid::INT4_ARRAY, b"  { 1 ,  2 , NULL , 4 }  ").unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Int4(1),
                Value::Int4(2),
                Value::Null,
                Value::Int4(4),
            ])
        );
    }

    #[test]
    fn quoted_escapes() {
        let value = decode("text[]", oid::TEXT_ARRAY, br#"{"a\"b","c\\d",""}"#).unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Text("a\"b".into()),
                Value::Text("c\\d".into()),
                Value::Text("".into()),
            ])
        );
    }

    #[test]
    fn unquoted_null_token_variants() {
        // "NULLX" is an ordinary unquoted token, not a null.
        let value = decode("text[]", oid::TEXT_ARRAY, b"{NULLX,NULL}").unwrap();
        assert_eq!(
            value,
            Value::Array(vec![Value::Text("NULLX".into()), Value::Null])
        );
    }

    #[test]
    fn malformed_literals_are_rejected() {
        for bad in [
            &b"1,2}"[..],      // missing opening brace
            b"{1,2",           // unterminated
            b"{1,2}}",         // extra closing brace
            b"{1,2} trailing", // trailing garbage
            b"{1 2}",          // missing comma
            b"{\"a}",          // unterminated quote
            b"{,1}",           // empty element
        ] {
            assert!(
                decode("int4[]", oid::INT4_ARRAY, bad).is_err(),
                "accepted {:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn empty_array() {
        let value = decode("int4[]", oid::INT4_ARRAY, b"{}").unwrap();
        assert_eq!(value, Value::Array(vec![]));
        let value = decode("int4[]", oid::INT4_ARRAY, b"{ }").unwrap();
        assert_eq!(value, Value::Array(vec![]));
    }

    #[test]
    fn any_target_propagates_to_elements() {
        let value = decode("any", oid::INT4_ARRAY, b"{{1,2},{3,NULL}}").unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Array(vec![Value::Int4(1), Value::Int4(2)]),
                Value::Array(vec![Value::Int4(3), Value::Null]),
            ])
        );
    }

    #[test]
    fn encode_round_trip_with_nulls_and_nesting() {
        let original = Value::Array(vec![
            Value::Array(vec![Value::Text("plain".into()), Value::Null]),
            Value::Array(vec![Value::Text("needs \"quotes\", yes".into()), Value::Text("".into())]),
        ]);

        let encoded = ArrayConvert::new(std::sync::Arc::new(crate::convert::TextConvert))
            .to_bytes(&original)
            .unwrap();
        assert_eq!(encoded.format, FormatCode::Text);

        let decoded = decode(
            "text[][]",
            oid::TEXT_ARRAY,
            encoded.bytes.as_deref().unwrap(),
        )
        .unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn binary_format_is_rejected() {
        let column = Column {
            format: FormatCode::Binary,
            ..array_column(oid::INT4_ARRAY)
        };
        let err = Registry::global()
            .decode("int4[]", &column, Some(b"{1}"))
            .unwrap_err();
        assert!(matches!(err, Error::ConvertTo { .. }));
    }
}
