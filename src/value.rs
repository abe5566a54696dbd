//! Decoded PostgreSQL values.

use rust_decimal::Decimal;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};
use uuid::Uuid;

use crate::protocol::types::{Oid, oid};

/// A time interval as PostgreSQL stores it: months, days and
/// microseconds are kept separate because their relative lengths vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    /// Whole months (12 per year)
    pub months: i32,
    /// Whole days
    pub days: i32,
    /// Microseconds within a day
    pub micros: i64,
}

impl Interval {
    /// Create an interval from its components.
    pub fn new(months: i32, days: i32, micros: i64) -> Self {
        Self {
            months,
            days,
            micros,
        }
    }

    /// Parse the PostgreSQL default output format, e.g.
    /// `1 year 2 mons 3 days 04:05:06.789`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut interval = Interval::default();
        let mut tokens = text.split_whitespace().peekable();

        while let Some(token) = tokens.next() {
            if token.contains(':') {
                // Clock part: [-]HH:MM:SS[.ffffff]
                let (negative, clock) = match token.strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, token),
                };
                let mut parts = clock.split(':');
                let hours: i64 = parse_int(parts.next())?;
                let minutes: i64 = parse_int(parts.next())?;
                let seconds = parts
                    .next()
                    .ok_or_else(|| format!("malformed clock part {:?}", token))?;
                if parts.next().is_some() {
                    return Err(format!("malformed clock part {:?}", token));
                }

                let (secs, frac_micros) = match seconds.split_once('.') {
                    Some((whole, frac)) => {
                        let mut digits = frac.to_string();
                        if digits.len() > 6 {
                            digits.truncate(6);
                        }
                        while digits.len() < 6 {
                            digits.push('0');
                        }
                        (
                            parse_int(Some(whole))?,
                            digits.parse::<i64>().map_err(|e| e.to_string())?,
                        )
                    }
                    None => (parse_int(Some(seconds))?, 0),
                };

                let mut micros = hours * 3_600_000_000 + minutes * 60_000_000;
                micros += secs * 1_000_000 + frac_micros;
                interval.micros += if negative { -micros } else { micros };
                continue;
            }

            let count: i64 = token
                .parse()
                .map_err(|_| format!("expected a number, got {:?}", token))?;
            let unit = tokens
                .next()
                .ok_or_else(|| format!("dangling number {:?}", token))?;

            match unit.trim_end_matches('s') {
                "year" => interval.months += (count * 12) as i32,
                "mon" | "month" => interval.months += count as i32,
                "week" => interval.days += (count * 7) as i32,
                "day" => interval.days += count as i32,
                "hour" => interval.micros += count * 3_600_000_000,
                "min" | "minute" => interval.micros += count * 60_000_000,
                "sec" | "second" => interval.micros += count * 1_000_000,
                other => return Err(format!("unknown interval unit {:?}", other)),
            }
        }

        Ok(interval)
    }
}

fn parse_int(part: Option<&str>) -> Result<i64, String> {
    part.ok_or_else(|| "missing clock component".to_string())?
        .parse()
        .map_err(|e: std::num::ParseIntError| e.to_string())
}

impl std::fmt::Display for Interval {
    /// Renders in the PostgreSQL default interval output style.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let years = self.months / 12;
        let mons = self.months % 12;
        let mut wrote = false;

        let mut unit = |f: &mut std::fmt::Formatter<'_>,
                        count: i32,
                        singular: &str|
         -> std::fmt::Result {
            if count != 0 {
                if wrote {
                    write!(f, " ")?;
                }
                write!(
                    f,
                    "{} {}{}",
                    count,
                    singular,
                    if count.abs() == 1 { "" } else { "s" }
                )?;
                wrote = true;
            }
            Ok(())
        };

        unit(f, years, "year")?;
        unit(f, mons, "mon")?;
        unit(f, self.days, "day")?;

        if self.micros != 0 || !wrote {
            if wrote {
                write!(f, " ")?;
            }
            let micros = self.micros.unsigned_abs();
            if self.micros < 0 {
                write!(f, "-")?;
            }
            let hours = micros / 3_600_000_000;
            let minutes = micros % 3_600_000_000 / 60_000_000;
            let seconds = micros % 60_000_000 / 1_000_000;
            let frac = micros % 1_000_000;
            write!(f, "{:02}:{:02}:{:02}", hours, minutes, seconds)?;
            if frac != 0 {
                let rendered = format!("{:06}", frac);
                write!(f, ".{}", rendered.trim_end_matches('0'))?;
            }
        }

        Ok(())
    }
}

/// A decoded PostgreSQL value.
///
/// The tagged-variant form keeps the converter registry object-safe;
/// typed access goes through [`crate::convert::FromSql`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// boolean
    Bool(bool),
    /// int2
    Int2(i16),
    /// int4
    Int4(i32),
    /// int8
    Int8(i64),
    /// float4
    Float4(f32),
    /// float8
    Float8(f64),
    /// text / varchar / bpchar / name / unknown
    Text(String),
    /// bytea
    Bytes(Vec<u8>),
    /// timestamp without time zone
    Timestamp(PrimitiveDateTime),
    /// timestamp with time zone
    TimestampTz(OffsetDateTime),
    /// date
    Date(Date),
    /// time of day
    Time(Time),
    /// interval
    Interval(Interval),
    /// uuid
    Uuid(Uuid),
    /// numeric / decimal
    Numeric(Decimal),
    /// any array type; elements may be `Null`
    Array(Vec<Value>),
}

impl Value {
    /// Returns true for `Value::Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The registry identifier of this value's natural converter.
    ///
    /// Arrays report the identifier of their first non-null element
    /// suffixed with `[]`, falling back to `any[]`.
    pub fn type_ident(&self) -> String {
        match self {
            Value::Null => "any".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int2(_) => "int2".into(),
            Value::Int4(_) => "int4".into(),
            Value::Int8(_) => "int8".into(),
            Value::Float4(_) => "float4".into(),
            Value::Float8(_) => "float8".into(),
            Value::Text(_) => "text".into(),
            Value::Bytes(_) => "bytea".into(),
            Value::Timestamp(_) => "timestamp".into(),
            Value::TimestampTz(_) => "timestamptz".into(),
            Value::Date(_) => "date".into(),
            Value::Time(_) => "time".into(),
            Value::Interval(_) => "interval".into(),
            Value::Uuid(_) => "uuid".into(),
            Value::Numeric(_) => "numeric".into(),
            Value::Array(items) => {
                let elem = items
                    .iter()
                    .find(|item| !item.is_null())
                    .map(|item| item.type_ident())
                    .unwrap_or_else(|| "any".into());
                format!("{}[]", elem)
            }
        }
    }

    /// The OID this value naturally encodes to (0 = let the server infer).
    pub fn natural_oid(&self) -> Oid {
        match self {
            Value::Null => 0,
            Value::Bool(_) => oid::BOOL,
            Value::Int2(_) => oid::INT2,
            Value::Int4(_) => oid::INT4,
            Value::Int8(_) => oid::INT8,
            Value::Float4(_) => oid::FLOAT4,
            Value::Float8(_) => oid::FLOAT8,
            Value::Text(_) => oid::TEXT,
            Value::Bytes(_) => oid::BYTEA,
            Value::Timestamp(_) => oid::TIMESTAMP,
            Value::TimestampTz(_) => oid::TIMESTAMPTZ,
            Value::Date(_) => oid::DATE,
            Value::Time(_) => oid::TIME,
            Value::Interval(_) => oid::INTERVAL,
            Value::Uuid(_) => oid::UUID,
            Value::Numeric(_) => oid::NUMERIC,
            Value::Array(items) => items
                .iter()
                .find(|item| !item.is_null())
                .map(|item| crate::protocol::types::array_oid(item.natural_oid()).unwrap_or(0))
                .unwrap_or(0),
        }
    }
}

macro_rules! impl_value_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::$variant(value)
            }
        })+
    };
}

impl_value_from!(
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    Vec<u8> => Bytes,
    PrimitiveDateTime => Timestamp,
    OffsetDateTime => TimestampTz,
    Date => Date,
    Time => Time,
    Interval => Interval,
    Uuid => Uuid,
    Decimal => Numeric,
);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

impl Value {
    /// Build an array value from anything convertible element-wise.
    /// `Vec<u8>` converts to `Bytes`, not to an array.
    pub fn array<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}
