//! Temporal converters: timestamps, dates, times and intervals.
//!
//! Text parsing follows the server's ISO DateStyle output:
//! `YYYY-MM-DD HH:MM:SS[.ffffff][±HH[:MM[:SS]]]`.

use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset, macros::datetime};

use crate::error::{Error, Result};
use crate::protocol::frontend::extended::EncodedParam;
use crate::protocol::types::FormatCode;
use crate::row::Column;
use crate::value::{Interval, Value};

use super::Convert;

/// The PostgreSQL timestamp epoch; binary timestamps count
/// microseconds from here.
const PG_EPOCH: PrimitiveDateTime = datetime!(2000-01-01 0:00);

/// Julian day of the PostgreSQL epoch.
const PG_EPOCH_JULIAN_DAY: i32 = 2_451_545;

fn utf8<'a>(ty: &str, column: &Column, raw: &'a [u8]) -> Result<&'a str> {
    simdutf8::compat::from_utf8(raw)
        .map_err(|e| Error::convert(ty, column.type_oid, format!("invalid UTF-8: {}", e)))
}

fn binary(bytes: Vec<u8>) -> EncodedParam {
    EncodedParam {
        format: FormatCode::Binary,
        bytes: Some(bytes),
    }
}

fn unexpected(ty: &str, value: &Value) -> Error {
    Error::convert(ty, 0, format!("cannot encode {:?}", value))
}

// === Text parsing helpers ===

fn parse_date_str(text: &str) -> core::result::Result<Date, String> {
    let mut parts = text.splitn(3, '-');
    let year: i32 = next_int(&mut parts, "year")?;
    let month: u8 = next_int(&mut parts, "month")?;
    let day: u8 = next_int(&mut parts, "day")?;

    let month = Month::try_from(month).map_err(|e| e.to_string())?;
    Date::from_calendar_date(year, month, day).map_err(|e| e.to_string())
}

fn parse_time_str(text: &str) -> core::result::Result<Time, String> {
    let mut parts = text.splitn(3, ':');
    let hour: u8 = next_int(&mut parts, "hour")?;
    let minute: u8 = next_int(&mut parts, "minute")?;
    let second = parts.next().ok_or("missing seconds")?;

    let (second, micros): (u8, u32) = match second.split_once('.') {
        Some((whole, frac)) => {
            let mut digits = frac.to_string();
            if digits.len() > 6 {
                digits.truncate(6);
            }
            while digits.len() < 6 {
                digits.push('0');
            }
            (
                whole.parse().map_err(|_| "invalid seconds")?,
                digits.parse().map_err(|_| "invalid fraction")?,
            )
        }
        None => (second.parse().map_err(|_| "invalid seconds")?, 0),
    };

    Time::from_hms_micro(hour, minute, second, micros).map_err(|e| e.to_string())
}

fn parse_offset_str(text: &str) -> core::result::Result<UtcOffset, String> {
    let (sign, rest) = match text.split_at_checked(1) {
        Some(("+", rest)) => (1_i8, rest),
        Some(("-", rest)) => (-1_i8, rest),
        _ => return Err(format!("invalid offset {:?}", text)),
    };

    let mut parts = rest.splitn(3, ':');
    let hours: i8 = next_int(&mut parts, "offset hours")?;
    let minutes: i8 = parts.next().map(str::parse).transpose().map_err(|_| "invalid offset minutes")?.unwrap_or(0);
    let seconds: i8 = parts.next().map(str::parse).transpose().map_err(|_| "invalid offset seconds")?.unwrap_or(0);

    UtcOffset::from_hms(sign * hours, sign * minutes, sign * seconds).map_err(|e| e.to_string())
}

fn next_int<'a, T: std::str::FromStr>(
    parts: &mut impl Iterator<Item = &'a str>,
    what: &str,
) -> core::result::Result<T, String> {
    parts
        .next()
        .ok_or_else(|| format!("missing {}", what))?
        .parse()
        .map_err(|_| format!("invalid {}", what))
}

/// Split `YYYY-MM-DD HH:MM:SS[.frac][±off]` into datetime and offset.
fn parse_timestamp_str(
    text: &str,
) -> core::result::Result<(PrimitiveDateTime, Option<UtcOffset>), String> {
    let (date_part, rest) = text
        .split_once(' ')
        .ok_or_else(|| format!("malformed timestamp {:?}", text))?;
    let date = parse_date_str(date_part)?;

    // The clock cannot contain '+' or '-'; anything from there on is
    // the UTC offset.
    let (clock_part, offset) = match rest.find(['+', '-']) {
        Some(at) => (&rest[..at], Some(parse_offset_str(&rest[at..])?)),
        None => (rest, None),
    };
    let time = parse_time_str(clock_part.trim_end())?;

    Ok((PrimitiveDateTime::new(date, time), offset))
}

// === Text formatting helpers ===

/// Render a datetime in the server's ISO output form (no offset).
pub(crate) fn format_timestamp(datetime: PrimitiveDateTime) -> String {
    let mut out = format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        datetime.year(),
        datetime.month() as u8,
        datetime.day(),
        datetime.hour(),
        datetime.minute(),
        datetime.second(),
    );
    let micros = datetime.microsecond();
    if micros != 0 {
        let rendered = format!("{:06}", micros);
        out.push('.');
        out.push_str(rendered.trim_end_matches('0'));
    }
    out
}

/// Render a datetime with its UTC offset appended.
pub(crate) fn format_timestamptz(datetime: OffsetDateTime) -> String {
    let offset = datetime.offset();
    let mut out = format_timestamp(PrimitiveDateTime::new(datetime.date(), datetime.time()));
    let (hours, minutes, _) = offset.as_hms();
    out.push(if offset.is_negative() { '-' } else { '+' });
    out.push_str(&format!("{:02}", hours.abs()));
    if minutes != 0 {
        out.push_str(&format!(":{:02}", minutes.abs()));
    }
    out
}

/// Render a date in ISO form.
pub(crate) fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        date.month() as u8,
        date.day()
    )
}

/// Render a time of day in ISO form.
pub(crate) fn format_time(time: Time) -> String {
    let mut out = format!(
        "{:02}:{:02}:{:02}",
        time.hour(),
        time.minute(),
        time.second()
    );
    let micros = time.microsecond();
    if micros != 0 {
        let rendered = format!("{:06}", micros);
        out.push('.');
        out.push_str(rendered.trim_end_matches('0'));
    }
    out
}

// === Converters ===

fn micros_since_epoch(datetime: PrimitiveDateTime) -> i64 {
    let delta = datetime - PG_EPOCH;
    delta.whole_microseconds() as i64
}

fn datetime_from_micros(ty: &str, column: &Column, micros: i64) -> Result<PrimitiveDateTime> {
    PG_EPOCH
        .checked_add(Duration::microseconds(micros))
        .ok_or_else(|| {
            Error::convert(
                ty,
                column.type_oid,
                format!("timestamp {} out of range", micros),
            )
        })
}

fn read_i64(ty: &str, column: &Column, raw: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = raw.try_into().map_err(|_| {
        Error::convert(
            ty,
            column.type_oid,
            format!("invalid binary length {}", raw.len()),
        )
    })?;
    Ok(i64::from_be_bytes(arr))
}

/// Converter for `timestamp` (without time zone).
pub struct TimestampConvert;

impl Convert for TimestampConvert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        if column.format == FormatCode::Binary {
            let micros = read_i64("timestamp", column, raw)?;
            return Ok(Value::Timestamp(datetime_from_micros(
                "timestamp", column, micros,
            )?));
        }

        let text = utf8("timestamp", column, raw)?;
        let (datetime, _offset) = parse_timestamp_str(text)
            .map_err(|e| Error::convert("timestamp", column.type_oid, e))?;
        Ok(Value::Timestamp(datetime))
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::Timestamp(v) => Ok(binary(micros_since_epoch(*v).to_be_bytes().to_vec())),
            other => Err(unexpected("timestamp", other)),
        }
    }
}

/// Converter for `timestamptz`.
pub struct TimestampTzConvert;

impl Convert for TimestampTzConvert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        if column.format == FormatCode::Binary {
            // Binary timestamptz is microseconds since epoch in UTC.
            let micros = read_i64("timestamptz", column, raw)?;
            let datetime = datetime_from_micros("timestamptz", column, micros)?;
            return Ok(Value::TimestampTz(datetime.assume_utc()));
        }

        let text = utf8("timestamptz", column, raw)?;
        let (datetime, offset) = parse_timestamp_str(text)
            .map_err(|e| Error::convert("timestamptz", column.type_oid, e))?;
        let offset = offset.unwrap_or(UtcOffset::UTC);
        Ok(Value::TimestampTz(datetime.assume_offset(offset)))
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::TimestampTz(v) => {
                let utc = v.to_offset(UtcOffset::UTC);
                let micros =
                    micros_since_epoch(PrimitiveDateTime::new(utc.date(), utc.time()));
                Ok(binary(micros.to_be_bytes().to_vec()))
            }
            other => Err(unexpected("timestamptz", other)),
        }
    }
}

/// Converter for `date`.
pub struct DateConvert;

impl Convert for DateConvert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        if column.format == FormatCode::Binary {
            let arr: [u8; 4] = raw.try_into().map_err(|_| {
                Error::convert(
                    "date",
                    column.type_oid,
                    format!("invalid binary length {}", raw.len()),
                )
            })?;
            let days = i32::from_be_bytes(arr);
            let date = Date::from_julian_day(days + PG_EPOCH_JULIAN_DAY)
                .map_err(|e| Error::convert("date", column.type_oid, e.to_string()))?;
            return Ok(Value::Date(date));
        }

        let text = utf8("date", column, raw)?;
        let date =
            parse_date_str(text).map_err(|e| Error::convert("date", column.type_oid, e))?;
        Ok(Value::Date(date))
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::Date(v) => {
                let days = v.to_julian_day() - PG_EPOCH_JULIAN_DAY;
                Ok(binary(days.to_be_bytes().to_vec()))
            }
            other => Err(unexpected("date", other)),
        }
    }
}

/// Converter for `time` (without time zone).
pub struct TimeConvert;

impl Convert for TimeConvert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        if column.format == FormatCode::Binary {
            let micros = read_i64("time", column, raw)?;
            let hours = micros / 3_600_000_000;
            let minutes = micros % 3_600_000_000 / 60_000_000;
            let seconds = micros % 60_000_000 / 1_000_000;
            let frac = micros % 1_000_000;
            let value = Time::from_hms_micro(hours as u8, minutes as u8, seconds as u8, frac as u32)
                .map_err(|e| Error::convert("time", column.type_oid, e.to_string()))?;
            return Ok(Value::Time(value));
        }

        let text = utf8("time", column, raw)?;
        let value =
            parse_time_str(text).map_err(|e| Error::convert("time", column.type_oid, e))?;
        Ok(Value::Time(value))
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::Time(v) => {
                let micros = i64::from(v.hour()) * 3_600_000_000
                    + i64::from(v.minute()) * 60_000_000
                    + i64::from(v.second()) * 1_000_000
                    + i64::from(v.microsecond());
                Ok(binary(micros.to_be_bytes().to_vec()))
            }
            other => Err(unexpected("time", other)),
        }
    }
}

/// Converter for `interval`.
///
/// Binary layout: microseconds (i64), days (i32), months (i32).
pub struct IntervalConvert;

impl Convert for IntervalConvert {
    fn from_bytes(&self, column: &Column, raw: &[u8]) -> Result<Value> {
        if column.format == FormatCode::Binary {
            if raw.len() != 16 {
                return Err(Error::convert(
                    "interval",
                    column.type_oid,
                    format!("invalid binary length {}", raw.len()),
                ));
            }
            let micros = i64::from_be_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]);
            let days = i32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
            let months = i32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]);
            return Ok(Value::Interval(Interval::new(months, days, micros)));
        }

        let text = utf8("interval", column, raw)?;
        let interval = Interval::parse(text)
            .map_err(|e| Error::convert("interval", column.type_oid, e))?;
        Ok(Value::Interval(interval))
    }

    fn to_bytes(&self, value: &Value) -> Result<EncodedParam> {
        match value {
            Value::Interval(v) => {
                let mut bytes = Vec::with_capacity(16);
                bytes.extend_from_slice(&v.micros.to_be_bytes());
                bytes.extend_from_slice(&v.days.to_be_bytes());
                bytes.extend_from_slice(&v.months.to_be_bytes());
                Ok(binary(bytes))
            }
            other => Err(unexpected("interval", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;
    use time::macros::{date, time as time_of_day};

    fn text_column(type_oid: u32) -> Column {
        Column {
            index: 0,
            name: "c".into(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: FormatCode::Text,
        }
    }

    fn binary_column(type_oid: u32) -> Column {
        Column {
            format: FormatCode::Binary,
            ..text_column(type_oid)
        }
    }

    #[test]
    fn timestamp_text_with_fraction() {
        let col = text_column(oid::TIMESTAMP);
        let value = TimestampConvert
            .from_bytes(&col, b"2024-03-07 15:30:45.123456")
            .unwrap();
        assert_eq!(
            value,
            Value::Timestamp(datetime!(2024-03-07 15:30:45.123456))
        );

        let value = TimestampConvert
            .from_bytes(&col, b"2024-03-07 15:30:45")
            .unwrap();
        assert_eq!(value, Value::Timestamp(datetime!(2024-03-07 15:30:45)));
    }

    #[test]
    fn timestamptz_text_offsets() {
        let col = text_column(oid::TIMESTAMPTZ);
        let value = TimestampTzConvert
            .from_bytes(&col, b"2024-03-07 15:30:45+02")
            .unwrap();
        assert_eq!(
            value,
            Value::TimestampTz(datetime!(2024-03-07 15:30:45 +2))
        );

        let value = TimestampTzConvert
            .from_bytes(&col, b"2024-03-07 15:30:45.5-05:30")
            .unwrap();
        assert_eq!(
            value,
            Value::TimestampTz(datetime!(2024-03-07 15:30:45.5 -5:30))
        );
    }

    #[test]
    fn timestamp_binary_round_trip() {
        let datetime = datetime!(2024-03-07 15:30:45.123456);
        let encoded = TimestampConvert
            .to_bytes(&Value::Timestamp(datetime))
            .unwrap();
        let col = binary_column(oid::TIMESTAMP);
        let value = TimestampConvert
            .from_bytes(&col, encoded.bytes.as_deref().unwrap())
            .unwrap();
        assert_eq!(value, Value::Timestamp(datetime));
    }

    #[test]
    fn timestamp_formatting() {
        assert_eq!(
            format_timestamp(datetime!(2024-03-07 15:30:45.500000)),
            "2024-03-07 15:30:45.5"
        );
        assert_eq!(
            format_timestamptz(datetime!(2024-03-07 15:30:45 +0)),
            "2024-03-07 15:30:45+00"
        );
        assert_eq!(
            format_timestamptz(datetime!(2024-03-07 15:30:45 -5:30)),
            "2024-03-07 15:30:45-05:30"
        );
    }

    #[test]
    fn date_binary_round_trip() {
        let value = Value::Date(date!(1999-12-31));
        let encoded = DateConvert.to_bytes(&value).unwrap();
        // One day before the PostgreSQL epoch.
        assert_eq!(encoded.bytes.as_deref(), Some(&(-1_i32).to_be_bytes()[..]));

        let col = binary_column(oid::DATE);
        assert_eq!(
            DateConvert
                .from_bytes(&col, encoded.bytes.as_deref().unwrap())
                .unwrap(),
            value
        );
    }

    #[test]
    fn time_text_and_binary() {
        let col = text_column(oid::TIME);
        assert_eq!(
            TimeConvert.from_bytes(&col, b"04:05:06.789").unwrap(),
            Value::Time(time_of_day!(04:05:06.789))
        );

        let encoded = TimeConvert
            .to_bytes(&Value::Time(time_of_day!(04:05:06.789)))
            .unwrap();
        let col = binary_column(oid::TIME);
        assert_eq!(
            TimeConvert
                .from_bytes(&col, encoded.bytes.as_deref().unwrap())
                .unwrap(),
            Value::Time(time_of_day!(04:05:06.789))
        );
    }

    #[test]
    fn interval_text_and_binary() {
        let col = text_column(oid::INTERVAL);
        let value = IntervalConvert
            .from_bytes(&col, b"1 year 2 mons 3 days 04:05:06.789")
            .unwrap();
        let expected = Interval::new(14, 3, 4 * 3_600_000_000 + 5 * 60_000_000 + 6_789_000);
        assert_eq!(value, Value::Interval(expected));

        let encoded = IntervalConvert.to_bytes(&Value::Interval(expected)).unwrap();
        let col = binary_column(oid::INTERVAL);
        assert_eq!(
            IntervalConvert
                .from_bytes(&col, encoded.bytes.as_deref().unwrap())
                .unwrap(),
            Value::Interval(expected)
        );
    }
}
