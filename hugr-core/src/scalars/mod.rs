//! Wire formats for the scalar types that cross the GraphQL boundary.
//!
//! These formats are bit-exact contracts: interval strings, range literals
//! and temporal values must round-trip unchanged between clients, the cache
//! and the central engine.

use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::char;
use nom::character::complete::digit1;
use nom::character::complete::multispace0;
use nom::character::complete::multispace1;
use nom::combinator::all_consuming;
use nom::combinator::map;
use nom::combinator::map_res;
use nom::combinator::opt;
use nom::combinator::recognize;
use nom::multi::separated_list1;
use nom::sequence::delimited;
use nom::sequence::pair;
use nom::sequence::separated_pair;
use serde::Deserialize;
use serde::Serialize;
use time::Date;
use time::OffsetDateTime;
use time::PrimitiveDateTime;
use time::Time;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

use crate::error::SingleHugrError;

/// Units accepted inside interval strings, singular or plural.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum IntervalUnit {
    #[strum(serialize = "microseconds", serialize = "microsecond")]
    Microseconds,
    #[strum(serialize = "milliseconds", serialize = "millisecond")]
    Milliseconds,
    #[strum(serialize = "seconds", serialize = "second")]
    Seconds,
    #[strum(serialize = "minutes", serialize = "minute")]
    Minutes,
    #[strum(serialize = "hours", serialize = "hour")]
    Hours,
    #[strum(serialize = "days", serialize = "day")]
    Days,
    #[strum(serialize = "weeks", serialize = "week")]
    Weeks,
    #[strum(serialize = "months", serialize = "month")]
    Months,
    #[strum(serialize = "quarters", serialize = "quarter")]
    Quarters,
    #[strum(serialize = "years", serialize = "year")]
    Years,
}

/// An interval literal: `"<quantity> <unit>[ <quantity> <unit>]*"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub parts: Vec<(i64, IntervalUnit)>,
}

impl Interval {
    pub fn parse(input: &str) -> Result<Self, SingleHugrError> {
        all_consuming(interval_parts)(input.trim())
            .map(|(_, parts)| Interval { parts })
            .map_err(|_| SingleHugrError::InvalidArgumentValue {
                field: "interval".to_owned(),
                argument: "value".to_owned(),
                message: format!("\"{input}\" is not a valid interval literal"),
            })
    }

    /// The engine-side `INTERVAL` expression, e.g. `INTERVAL '1 month 2 days'`.
    pub fn to_sql(&self) -> String {
        format!("INTERVAL '{self}'")
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (quantity, unit)) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{quantity} {unit}")?;
        }
        Ok(())
    }
}

fn signed_integer(input: &str) -> IResult<&str, i64> {
    map_res(recognize(pair(opt(char('-')), digit1)), str::parse)(input)
}

fn interval_unit(input: &str) -> IResult<&str, IntervalUnit> {
    map_res(nom::character::complete::alpha1, str::parse)(input)
}

fn interval_parts(input: &str) -> IResult<&str, Vec<(i64, IntervalUnit)>> {
    separated_list1(
        multispace1,
        separated_pair(signed_integer, multispace1, interval_unit),
    )(input)
}

/// One side of a range literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeBound {
    Unbounded,
    Value { raw: String, inclusive: bool },
}

impl RangeBound {
    pub fn is_inclusive(&self) -> bool {
        matches!(
            self,
            RangeBound::Value {
                inclusive: true,
                ..
            }
        )
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            RangeBound::Unbounded => None,
            RangeBound::Value { raw, .. } => Some(raw),
        }
    }
}

/// A range literal `"[lower, upper)"`. `[`/`]` select inclusive bounds, `(`/`)`
/// exclusive ones; an unbounded side is written `-∞` or `∞`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeLiteral {
    pub lower: RangeBound,
    pub upper: RangeBound,
}

impl RangeLiteral {
    pub fn parse(input: &str) -> Result<Self, SingleHugrError> {
        all_consuming(range_literal)(input.trim()).map(|(_, range)| range).map_err(|_| {
            SingleHugrError::InvalidArgumentValue {
                field: "range".to_owned(),
                argument: "value".to_owned(),
                message: format!("\"{input}\" is not a valid range literal"),
            }
        })
    }

    pub fn lower_inf(&self) -> bool {
        matches!(self.lower, RangeBound::Unbounded)
    }

    pub fn upper_inf(&self) -> bool {
        matches!(self.upper, RangeBound::Unbounded)
    }
}

impl std::fmt::Display for RangeLiteral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.lower {
            RangeBound::Unbounded => write!(f, "(-∞,")?,
            RangeBound::Value { raw, inclusive } => {
                write!(f, "{}{raw},", if *inclusive { '[' } else { '(' })?
            }
        }
        match &self.upper {
            RangeBound::Unbounded => write!(f, " ∞)"),
            RangeBound::Value { raw, inclusive } => {
                write!(f, " {raw}{}", if *inclusive { ']' } else { ')' })
            }
        }
    }
}

fn range_side(input: &str) -> IResult<&str, Option<String>> {
    alt((
        map(alt((tag("-∞"), tag("∞"), tag("-inf"), tag("inf"))), |_| None),
        map(
            nom::bytes::complete::is_not(",()[]"),
            |raw: &str| Some(raw.trim().to_owned()),
        ),
    ))(input)
}

fn range_literal(input: &str) -> IResult<&str, RangeLiteral> {
    let (input, open) = alt((char('['), char('(')))(input)?;
    let (input, (lower, upper)) = delimited(
        multispace0,
        separated_pair(
            range_side,
            delimited(multispace0, char(','), multispace0),
            range_side,
        ),
        multispace0,
    )(input)?;
    let (input, close) = alt((char(']'), char(')')))(input)?;
    let lower = match lower {
        None => RangeBound::Unbounded,
        Some(raw) => RangeBound::Value {
            raw,
            inclusive: open == '[',
        },
    };
    let upper = match upper {
        None => RangeBound::Unbounded,
        Some(raw) => RangeBound::Value {
            raw,
            inclusive: close == ']',
        },
    };
    Ok((input, RangeLiteral { lower, upper }))
}

const DATE_FORMAT: &[time::format_description::FormatItem<'_>] =
    format_description!("[year]-[month]-[day]");
const TIME_FORMAT: &[time::format_description::FormatItem<'_>] =
    format_description!("[hour]:[minute]:[second]");
const DATETIME_FORMAT: &[time::format_description::FormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Parses a timestamp from either an RFC 3339 string or a Unix epoch integer
/// (seconds). Naive `YYYY-MM-DD HH:MM:SS` strings are accepted and read as UTC.
pub fn parse_timestamp(value: &serde_json_bytes::Value) -> Result<OffsetDateTime, SingleHugrError> {
    match value {
        serde_json_bytes::Value::Number(n) => {
            let seconds = n.as_i64().ok_or_else(|| timestamp_error(&n.to_string()))?;
            OffsetDateTime::from_unix_timestamp(seconds)
                .map_err(|_| timestamp_error(&seconds.to_string()))
        }
        serde_json_bytes::Value::String(s) => {
            let s = s.as_str();
            OffsetDateTime::parse(s, &Rfc3339)
                .or_else(|_| PrimitiveDateTime::parse(s, DATETIME_FORMAT).map(|dt| dt.assume_utc()))
                .or_else(|_| {
                    Date::parse(s, DATE_FORMAT).map(|d| d.with_time(Time::MIDNIGHT).assume_utc())
                })
                .map_err(|_| timestamp_error(s))
        }
        other => Err(timestamp_error(&other.to_string())),
    }
}

pub fn parse_date(value: &str) -> Result<Date, SingleHugrError> {
    Date::parse(value, DATE_FORMAT).map_err(|_| SingleHugrError::InvalidArgumentValue {
        field: "date".to_owned(),
        argument: "value".to_owned(),
        message: format!("\"{value}\" is not a valid YYYY-MM-DD date"),
    })
}

pub fn parse_time(value: &str) -> Result<Time, SingleHugrError> {
    Time::parse(value, TIME_FORMAT).map_err(|_| SingleHugrError::InvalidArgumentValue {
        field: "time".to_owned(),
        argument: "value".to_owned(),
        message: format!("\"{value}\" is not a valid HH:MM:SS time"),
    })
}

pub fn format_date(date: Date) -> String {
    date.format(DATE_FORMAT).expect("date formatting is infallible")
}

fn timestamp_error(value: &str) -> SingleHugrError {
    SingleHugrError::InvalidArgumentValue {
        field: "timestamp".to_owned(),
        argument: "value".to_owned(),
        message: format!("\"{value}\" is not an RFC 3339 timestamp or Unix epoch integer"),
    }
}

/// Geometry input: a GeoJSON object, a WKT string, or a WKB hex string.
#[derive(Debug, Clone, PartialEq)]
pub enum GeometryInput {
    GeoJson(serde_json_bytes::Value),
    Wkt(String),
    WkbHex(String),
}

impl GeometryInput {
    pub fn from_value(value: &serde_json_bytes::Value) -> Result<Self, SingleHugrError> {
        match value {
            serde_json_bytes::Value::Object(_) => Ok(GeometryInput::GeoJson(value.clone())),
            serde_json_bytes::Value::String(s) => {
                let s = s.as_str().trim();
                if s.len() >= 10
                    && s.len() % 2 == 0
                    && s.chars().all(|c| c.is_ascii_hexdigit())
                {
                    Ok(GeometryInput::WkbHex(s.to_owned()))
                } else {
                    Ok(GeometryInput::Wkt(s.to_owned()))
                }
            }
            other => Err(SingleHugrError::InvalidArgumentValue {
                field: "geometry".to_owned(),
                argument: "value".to_owned(),
                message: format!("\"{other}\" is not GeoJSON, WKT or WKB hex"),
            }),
        }
    }

    /// The engine-side constructor call for this geometry.
    pub fn to_sql_constructor(&self) -> (&'static str, String) {
        match self {
            GeometryInput::GeoJson(value) => ("ST_GeomFromGeoJSON", value.to_string()),
            GeometryInput::Wkt(wkt) => ("ST_GeomFromText", wkt.clone()),
            GeometryInput::WkbHex(hex) => ("ST_GeomFromHEXWKB", hex.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json_bytes::json;

    use super::*;

    #[rstest]
    #[case("1 month", vec![(1, IntervalUnit::Months)])]
    #[case("2 days 12 hours", vec![(2, IntervalUnit::Days), (12, IntervalUnit::Hours)])]
    #[case("-3 quarters", vec![(-3, IntervalUnit::Quarters)])]
    #[case("90 seconds", vec![(90, IntervalUnit::Seconds)])]
    fn interval_round_trip(#[case] input: &str, #[case] parts: Vec<(i64, IntervalUnit)>) {
        let interval = Interval::parse(input).expect("interval should parse");
        assert_eq!(interval.parts, parts);
        assert_eq!(interval.to_string(), input);
    }

    #[test]
    fn interval_accepts_singular_units() {
        let interval = Interval::parse("1 day").expect("interval should parse");
        assert_eq!(interval.to_string(), "1 days");
    }

    #[test]
    fn interval_rejects_trailing_garbage() {
        assert!(Interval::parse("1 month and then some").is_err());
        assert!(Interval::parse("month 1").is_err());
    }

    #[test]
    fn range_bounds_select_inclusivity() {
        let range = RangeLiteral::parse("[1, 10)").expect("range should parse");
        assert!(range.lower.is_inclusive());
        assert!(!range.upper.is_inclusive());
        assert_eq!(range.lower.value(), Some("1"));
        assert_eq!(range.upper.value(), Some("10"));
    }

    #[test]
    fn range_unbounded_sides() {
        let range = RangeLiteral::parse("(-∞, 2024-01-01]").expect("range should parse");
        assert!(range.lower_inf());
        assert!(!range.upper_inf());
        assert_eq!(range.upper.value(), Some("2024-01-01"));
    }

    #[test]
    fn timestamp_accepts_rfc3339_and_epoch() {
        let from_str = parse_timestamp(&json!("2024-01-10T00:00:00Z")).expect("rfc3339");
        let from_epoch = parse_timestamp(&json!(1704844800)).expect("epoch");
        assert_eq!(from_str.unix_timestamp(), 1704844800);
        assert_eq!(from_epoch.unix_timestamp(), 1704844800);
    }

    #[test]
    fn date_format_is_iso() {
        let date = parse_date("2024-02-01").expect("date should parse");
        assert_eq!(format_date(date), "2024-02-01");
    }

    #[test]
    fn geometry_input_detection() {
        let geojson = GeometryInput::from_value(&json!({"type": "Point", "coordinates": [0, 0]}))
            .expect("geojson");
        assert!(matches!(geojson, GeometryInput::GeoJson(_)));

        let wkt = GeometryInput::from_value(&json!("POINT(1 2)")).expect("wkt");
        assert_eq!(wkt, GeometryInput::Wkt("POINT(1 2)".to_owned()));

        let wkb = GeometryInput::from_value(&json!("0101000000000000000000f03f"))
            .expect("wkb hex");
        assert!(matches!(wkb, GeometryInput::WkbHex(_)));
    }
}
