//! Bidirectional conversion between PostgreSQL wire values and
//! application types.
//!
//! Conversion is driven by a registry of [`Convert`] trait objects keyed
//! by a stable type identifier (`"int4"`, `"text"`, `"timestamp"`, ...).
//! Identifiers of the shape `"<elem>[]"` resolve structurally to an
//! array converter over the element converter, so arrays of any
//! registered type work without explicit registration. The `"any"`
//! identifier resolves by column OID instead of target type.

mod array;
mod scalar;
mod temporal;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

pub use array::ArrayConvert;
pub use scalar::{
    BoolConvert, ByteaConvert, Float4Convert, Float8Convert, Int2Convert, Int4Convert,
    Int8Convert, NumericConvert, TextConvert, UuidConvert,
};
pub use temporal::{
    DateConvert, IntervalConvert, TimeConvert, TimestampConvert, TimestampTzConvert,
};

use crate::error::{Error, Result};
use crate::protocol::frontend::extended::EncodedParam;
use crate::protocol::types::{element_oid, oid};
use crate::row::Column;
use crate::value::{Interval, Value};

/// A stateless bidirectional codec for one type identifier.
///
/// `from_bytes` never sees NULL input (the registry short-circuits it);
/// a converter that nevertheless produces [`Value::Null`] indicates a
/// codec bug and is reported as `InvalidConvertDataType`.
pub trait Convert: Send + Sync {
    /// Decode a non-null raw field into a value.
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value>;

    /// Encode a value as a Bind parameter (format + bytes).
    fn to_bytes(&self, value: &Value) -> Result<EncodedParam>;
}

/// Immutable converter registry.
///
/// Built once (defaults plus any user additions) and shared between
/// connections; lookups clone `Arc`s only.
#[derive(Clone)]
pub struct Registry {
    entries: HashMap<String, Arc<dyn Convert>>,
}

impl Registry {
    /// An empty registry. Most callers want [`Registry::with_defaults`].
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The default registry: integers, floats, booleans, text, byte
    /// strings, temporal types, UUIDs and numeric, plus the OID-driven
    /// `"any"` fallback.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("bool", Arc::new(BoolConvert));
        registry.register("int2", Arc::new(Int2Convert));
        registry.register("int4", Arc::new(Int4Convert));
        registry.register("int8", Arc::new(Int8Convert));
        registry.register("float4", Arc::new(Float4Convert));
        registry.register("float8", Arc::new(Float8Convert));
        registry.register("text", Arc::new(TextConvert));
        registry.register("bytea", Arc::new(ByteaConvert));
        registry.register("numeric", Arc::new(NumericConvert));
        registry.register("uuid", Arc::new(UuidConvert));
        registry.register("timestamp", Arc::new(TimestampConvert));
        registry.register("timestamptz", Arc::new(TimestampTzConvert));
        registry.register("date", Arc::new(DateConvert));
        registry.register("time", Arc::new(TimeConvert));
        registry.register("interval", Arc::new(IntervalConvert));
        registry.register("any", Arc::new(AnyConvert));
        registry
    }

    /// Register (or override) a converter for a type identifier.
    pub fn register(&mut self, ident: impl Into<String>, converter: Arc<dyn Convert>) {
        self.entries.insert(ident.into(), converter);
    }

    /// Resolve a converter by identifier.
    ///
    /// Unregistered `"<elem>[]"` identifiers fall back to an array
    /// converter over the recursively resolved element converter.
    pub fn resolve(&self, ident: &str) -> Result<Arc<dyn Convert>> {
        if let Some(converter) = self.entries.get(ident) {
            return Ok(Arc::clone(converter));
        }
        if let Some(mut elem_ident) = ident.strip_suffix("[]") {
            // Nesting depth is structural in the text format; any
            // dimensionality resolves to one converter over the scalar
            // element type.
            while let Some(inner) = elem_ident.strip_suffix("[]") {
                elem_ident = inner;
            }
            let elem = self.resolve(elem_ident)?;
            return Ok(Arc::new(ArrayConvert::new(elem)));
        }
        Err(Error::NoConversion(ident.to_string()))
    }

    /// Decode a raw field for the given target identifier.
    ///
    /// NULL input yields [`Value::Null`] without consulting the
    /// converter (the converter null law).
    pub fn decode(&self, ident: &str, column: &Column, raw: Option<&[u8]>) -> Result<Value> {
        let Some(raw) = raw else {
            return Ok(Value::Null);
        };
        let value = self.resolve(ident)?.from_bytes(column, raw)?;
        if value.is_null() {
            return Err(Error::InvalidConvertDataType);
        }
        Ok(value)
    }

    /// Encode a value as a Bind parameter using its natural converter.
    pub fn encode(&self, value: &Value) -> Result<EncodedParam> {
        if value.is_null() {
            return Ok(EncodedParam::null());
        }
        self.resolve(&value.type_ident())?.to_bytes(value)
    }

    /// The process-wide default registry.
    pub fn global() -> &'static Registry {
        static GLOBAL: LazyLock<Registry> = LazyLock::new(Registry::with_defaults);
        &GLOBAL
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut idents: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        idents.sort_unstable();
        f.debug_struct("Registry").field("idents", &idents).finish()
    }
}

/// OID-driven converter for unconstrained targets.
///
/// Decodes into the column's natural value; array OIDs decode
/// structurally with `"any"` element typing, applied recursively.
pub struct AnyConvert;

impl Convert for AnyConvert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        if element_oid(column.type_oid).is_some() {
            return ArrayConvert::new(Arc::new(AnyConvert)).from_bytes(column, raw);
        }

        match column.type_oid {
            oid::BOOL => BoolConvert.from_bytes(column, raw),
            oid::INT2 => Int2Convert.from_bytes(column, raw),
            oid::INT4 | oid::OID => Int4Convert.from_bytes(column, raw),
            oid::INT8 => Int8Convert.from_bytes(column, raw),
            oid::FLOAT4 => Float4Convert.from_bytes(column, raw),
            oid::FLOAT8 => Float8Convert.from_bytes(column, raw),
            oid::BYTEA => ByteaConvert.from_bytes(column, raw),
            oid::NUMERIC => NumericConvert.from_bytes(column, raw),
            oid::UUID => UuidConvert.from_bytes(column, raw),
            oid::TIMESTAMP => TimestampConvert.from_bytes(column, raw),
            oid::TIMESTAMPTZ => TimestampTzConvert.from_bytes(column, raw),
            oid::DATE => DateConvert.from_bytes(column, raw),
            oid::TIME => TimeConvert.from_bytes(column, raw),
            oid::INTERVAL => IntervalConvert.from_bytes(column, raw),
            // Text-family and unrecognized OIDs pass through as text.
            _ => TextConvert.from_bytes(column, raw),
        }
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::Null => Ok(EncodedParam::null()),
            Value::Bool(_) => BoolConvert.to_bytes(value),
            Value::Int2(_) => Int2Convert.to_bytes(value),
            Value::Int4(_) => Int4Convert.to_bytes(value),
            Value::Int8(_) => Int8Convert.to_bytes(value),
            Value::Float4(_) => Float4Convert.to_bytes(value),
            Value::Float8(_) => Float8Convert.to_bytes(value),
            Value::Text(_) => TextConvert.to_bytes(value),
            Value::Bytes(_) => ByteaConvert.to_bytes(value),
            Value::Numeric(_) => NumericConvert.to_bytes(value),
            Value::Uuid(_) => UuidConvert.to_bytes(value),
            Value::Timestamp(_) => TimestampConvert.to_bytes(value),
            Value::TimestampTz(_) => TimestampTzConvert.to_bytes(value),
            Value::Date(_) => DateConvert.to_bytes(value),
            Value::Time(_) => TimeConvert.to_bytes(value),
            Value::Interval(_) => IntervalConvert.to_bytes(value),
            Value::Array(_) => ArrayConvert::new(Arc::new(AnyConvert)).to_bytes(value),
        }
    }
}

/// Types that can be produced from a decoded [`Value`].
///
/// `type_ident` names the registry converter to use for decoding;
/// `from_value` narrows the resulting value.
pub trait FromSql: Sized {
    /// Registry identifier of the converter for this type.
    fn type_ident() -> Cow<'static, str>;

    /// Narrow a decoded value into this type.
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch<T>(expected: &str, value: &Value) -> Result<T> {
    Err(Error::convert(
        expected,
        0,
        format!("unexpected value {:?}", value),
    ))
}

macro_rules! impl_from_sql {
    ($ty:ty, $ident:literal, $($pattern:pat => $result:expr),+ $(,)?) => {
        impl FromSql for $ty {
            fn type_ident() -> Cow<'static, str> {
                Cow::Borrowed($ident)
            }

            fn from_value(value: Value) -> Result<Self> {
                match value {
                    $($pattern => $result,)+
                    other => mismatch($ident, &other),
                }
            }
        }
    };
}

impl_from_sql!(bool, "bool", Value::Bool(v) => Ok(v));
impl_from_sql!(i16, "int2", Value::Int2(v) => Ok(v));
impl_from_sql!(i32, "int4",
    Value::Int4(v) => Ok(v),
    Value::Int2(v) => Ok(v.into()),
);
impl_from_sql!(i64, "int8",
    Value::Int8(v) => Ok(v),
    Value::Int4(v) => Ok(v.into()),
    Value::Int2(v) => Ok(v.into()),
);
impl_from_sql!(f32, "float4", Value::Float4(v) => Ok(v));
impl_from_sql!(f64, "float8",
    Value::Float8(v) => Ok(v),
    Value::Float4(v) => Ok(v.into()),
);
impl_from_sql!(String, "text", Value::Text(v) => Ok(v));
impl_from_sql!(Vec<u8>, "bytea", Value::Bytes(v) => Ok(v));
impl_from_sql!(rust_decimal::Decimal, "numeric", Value::Numeric(v) => Ok(v));
impl_from_sql!(uuid::Uuid, "uuid", Value::Uuid(v) => Ok(v));
impl_from_sql!(time::PrimitiveDateTime, "timestamp", Value::Timestamp(v) => Ok(v));
impl_from_sql!(time::OffsetDateTime, "timestamptz", Value::TimestampTz(v) => Ok(v));
impl_from_sql!(time::Date, "date", Value::Date(v) => Ok(v));
impl_from_sql!(time::Time, "time", Value::Time(v) => Ok(v));
impl_from_sql!(Interval, "interval", Value::Interval(v) => Ok(v));

impl FromSql for Value {
    fn type_ident() -> Cow<'static, str> {
        Cow::Borrowed("any")
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn type_ident() -> Cow<'static, str> {
        T::type_ident()
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromSql> FromSql for Vec<T> {
    fn type_ident() -> Cow<'static, str> {
        Cow::Owned(format!("{}[]", T::type_ident()))
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            other => mismatch("array", &other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::FormatCode;

    fn column(type_oid: u32, format: FormatCode) -> Column {
        Column {
            index: 0,
            name: "c".into(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format,
        }
    }

    #[test]
    fn decode_null_is_null_for_every_default_converter() {
        let registry = Registry::with_defaults();
        for ident in [
            "bool",
            "int2",
            "int4",
            "int8",
            "float4",
            "float8",
            "text",
            "bytea",
            "numeric",
            "uuid",
            "timestamp",
            "timestamptz",
            "date",
            "time",
            "interval",
            "any",
            "int4[]",
        ] {
            let value = registry
                .decode(ident, &column(oid::TEXT, FormatCode::Text), None)
                .unwrap();
            assert!(value.is_null(), "converter {:?} broke the null law", ident);
        }
    }

    #[test]
    fn unknown_ident_fails_no_conversion() {
        let registry = Registry::with_defaults();
        let err = match registry.resolve("point") {
            Err(e) => e,
            Ok(_) => panic!("expected resolve(\"point\") to fail"),
        };
        assert!(matches!(err, Error::NoConversion(ident) if ident == "point"));
        // Array of an unknown element type fails the same way.
        assert!(registry.resolve("point[]").is_err());
    }

    #[test]
    fn array_ident_resolves_structurally() {
        let registry = Registry::with_defaults();
        assert!(registry.resolve("int4[]").is_ok());
        assert!(registry.resolve("text[][]").is_ok());
    }

    #[test]
    fn any_decodes_by_column_oid() {
        let registry = Registry::with_defaults();
        let value = registry
            .decode("any", &column(oid::INT8, FormatCode::Text), Some(b"99"))
            .unwrap();
        assert_eq!(value, Value::Int8(99));

        let value = registry
            .decode("any", &column(oid::BOOL, FormatCode::Text), Some(b"t"))
            .unwrap();
        assert_eq!(value, Value::Bool(true));
    }

    #[test]
    fn user_registry_overrides_defaults() {
        struct ShoutingText;
        impl Convert for ShoutingText {
            fn from_bytes(&self, _column: &Column, raw: &[u8]) -> Result<Value> {
                let s = std::str::from_utf8(raw).map_err(|e| Error::convert("text", 0, e.to_string()))?;
                Ok(Value::Text(s.to_uppercase()))
            }

            fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
                TextConvert.to_bytes(value)
            }
        }

        let mut registry = Registry::with_defaults();
        registry.register("text", Arc::new(ShoutingText));
        let value = registry
            .decode("text", &column(oid::TEXT, FormatCode::Text), Some(b"hi"))
            .unwrap();
        assert_eq!(value, Value::Text("HI".into()));
    }

    #[test]
    fn converter_yielding_null_for_data_is_a_codec_bug() {
        struct BrokenConvert;
        impl Convert for BrokenConvert {
            fn from_bytes(&self, _column: &Column, _raw: &[u8]) -> Result<Value> {
                Ok(Value::Null)
            }

            fn to_bytes(&self, _value: &Value) -> Result<EncodedParam> {
                Ok(EncodedParam::null())
            }
        }

        let mut registry = Registry::with_defaults();
        registry.register("broken", Arc::new(BrokenConvert));
        let err = registry
            .decode("broken", &column(oid::TEXT, FormatCode::Text), Some(b"x"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConvertDataType));
    }

    #[test]
    fn typed_narrowing_widens_integers() {
        assert_eq!(i64::from_value(Value::Int2(7)).unwrap(), 7);
        assert_eq!(i32::from_value(Value::Int2(7)).unwrap(), 7);
        assert!(i16::from_value(Value::Int4(7)).is_err());
    }

    #[test]
    fn vec_from_sql_ident_nests() {
        assert_eq!(Vec::<i32>::type_ident(), "int4[]");
        assert_eq!(Vec::<Vec<i32>>::type_ident(), "int4[][]");
        assert_eq!(Vec::<Option<i32>>::type_ident(), "int4[]");
    }
}
