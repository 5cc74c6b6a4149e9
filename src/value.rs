//! The host-side value tree.
//!
//! Codecs decode wire payloads into [`Value`] trees; mapping those trees
//! onto user-defined types is the job of an external [`ShapeAdapter`], not
//! of this crate. Temporal values keep their wire-native integer forms and
//! expose explicit conversions instead of depending on a calendar library.

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Microseconds between the unix epoch and 2000-01-01T00:00:00Z, the wire
/// epoch for absolute timestamps.
pub const EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// An absolute point in time, stored as microseconds since 2000-01-01 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime {
    pub micros: i64,
}

impl DateTime {
    pub fn from_unix_micros(micros: i64) -> Self {
        DateTime {
            micros: micros - EPOCH_OFFSET_MICROS,
        }
    }

    pub fn to_unix_micros(self) -> i64 {
        self.micros + EPOCH_OFFSET_MICROS
    }

    pub fn from_system_time(t: std::time::SystemTime) -> Result<Self> {
        let unix = match t.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => d.as_micros() as i64,
            Err(e) => -(e.duration().as_micros() as i64),
        };
        Ok(Self::from_unix_micros(unix))
    }

    pub fn to_system_time(self) -> std::time::SystemTime {
        let unix = self.to_unix_micros();
        if unix >= 0 {
            std::time::UNIX_EPOCH + std::time::Duration::from_micros(unix as u64)
        } else {
            std::time::UNIX_EPOCH - std::time::Duration::from_micros(unix.unsigned_abs())
        }
    }
}

/// A calendar date and wall-clock time with no zone, microseconds since
/// 2000-01-01T00:00:00.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalDateTime {
    pub micros: i64,
}

/// A calendar date, days since 2000-01-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalDate {
    pub days: i32,
}

/// Wall-clock time, microseconds since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalTime {
    pub micros: i64,
}

/// An exact duration in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration {
    pub micros: i64,
}

impl Duration {
    pub fn from_std(d: std::time::Duration) -> Self {
        Duration {
            micros: d.as_micros() as i64,
        }
    }

    pub fn to_std(self) -> Option<std::time::Duration> {
        u64::try_from(self.micros)
            .ok()
            .map(std::time::Duration::from_micros)
    }
}

/// A calendar-aware duration: months and days are kept separate because
/// their absolute lengths depend on the anchor date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelativeDuration {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

/// A whole-day calendar duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateDuration {
    pub months: i32,
    pub days: i32,
}

/// Arbitrary-precision decimal in base-10000 digit groups, the wire's
/// native representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Decimal {
    pub negative: bool,
    /// Weight of the first digit group, in base-10000 positions relative
    /// to the decimal point.
    pub weight: i16,
    /// Display scale: digits after the decimal point.
    pub scale: u16,
    pub digits: Vec<u16>,
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }

        // Integral part: digit groups with weight >= 0.
        if self.weight < 0 {
            f.write_str("0")?;
        } else {
            for pos in 0..=self.weight {
                let group = self.digits.get(pos as usize).copied().unwrap_or(0);
                if pos == 0 {
                    write!(f, "{group}")?;
                } else {
                    write!(f, "{group:04}")?;
                }
            }
        }

        if self.scale > 0 {
            let mut frac = String::new();
            let mut pos = self.weight as i32 + 1;
            while frac.len() < self.scale as usize {
                let group = if pos >= 0 {
                    self.digits.get(pos as usize).copied().unwrap_or(0)
                } else {
                    0
                };
                frac.push_str(&format!("{group:04}"));
                pos += 1;
            }
            frac.truncate(self.scale as usize);
            write!(f, ".{frac}")?;
        }

        Ok(())
    }
}

/// Arbitrary-precision integer in base-10000 digit groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BigInt {
    pub negative: bool,
    pub weight: i16,
    pub digits: Vec<u16>,
}

impl std::fmt::Display for BigInt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }
        if self.weight < 0 || self.digits.is_empty() {
            return f.write_str("0");
        }
        for pos in 0..=self.weight {
            let group = self.digits.get(pos as usize).copied().unwrap_or(0);
            if pos == 0 {
                write!(f, "{group}")?;
            } else {
                write!(f, "{group:04}")?;
            }
        }
        Ok(())
    }
}

/// One bound-inclusive/-exclusive interval over an ordered element type.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub lower: Option<Box<Value>>,
    pub upper: Option<Box<Value>>,
    pub inc_lower: bool,
    pub inc_upper: bool,
    pub empty: bool,
}

impl Range {
    pub fn empty() -> Self {
        Range {
            lower: None,
            upper: None,
            inc_lower: false,
            inc_upper: false,
            empty: true,
        }
    }
}

/// A fully-decoded value: nested lists/maps/scalars tagged with host
/// types. This is the tree handed to the object-mapping layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nothing,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Str(String),
    Bytes(Bytes),
    Uuid(Uuid),
    Decimal(Decimal),
    BigInt(BigInt),
    Bool8(u8),
    Json(String),
    DateTime(DateTime),
    LocalDateTime(LocalDateTime),
    LocalDate(LocalDate),
    LocalTime(LocalTime),
    Duration(Duration),
    RelativeDuration(RelativeDuration),
    DateDuration(DateDuration),
    /// Server-configured memory quantity, in bytes.
    ConfigMemory(i64),
    Enum(String),
    Array(Vec<Value>),
    Set(Vec<Value>),
    Tuple(Vec<Value>),
    /// Named fields in shape order.
    Object(Vec<(String, Value)>),
    /// Partially-present named fields (input shapes, session state).
    SparseObject(Vec<(String, Value)>),
    Range(Range),
    MultiRange(Vec<Range>),
}

impl Value {
    /// A short name for the host type of this value, used in error text.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nothing => "nothing",
            Value::Bool(_) => "bool",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
            Value::Decimal(_) => "decimal",
            Value::BigInt(_) => "bigint",
            Value::Bool8(_) => "bool8",
            Value::Json(_) => "json",
            Value::DateTime(_) => "datetime",
            Value::LocalDateTime(_) => "local datetime",
            Value::LocalDate(_) => "local date",
            Value::LocalTime(_) => "local time",
            Value::Duration(_) => "duration",
            Value::RelativeDuration(_) => "relative duration",
            Value::DateDuration(_) => "date duration",
            Value::ConfigMemory(_) => "config memory",
            Value::Enum(_) => "enum",
            Value::Array(_) => "array",
            Value::Set(_) => "set",
            Value::Tuple(_) => "tuple",
            Value::Object(_) => "object",
            Value::SparseObject(_) => "sparse object",
            Value::Range(_) => "range",
            Value::MultiRange(_) => "multirange",
        }
    }

    /// Looks up a field of an object or sparse object value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) | Value::SparseObject(fields) => fields
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Builds a user-defined output from a decoded value tree.
///
/// The core never inspects host types reflectively; callers register an
/// adapter per target shape and the query layer hands it the raw tree.
pub trait ShapeAdapter {
    type Output;

    fn build(&self, value: Value) -> Result<Self::Output>;
}

/// The identity adapter: hands the tree through untouched.
pub struct ValueAdapter;

impl ShapeAdapter for ValueAdapter {
    type Output = Value;

    fn build(&self, value: Value) -> Result<Value> {
        Ok(value)
    }
}

/// Adapter extracting a single named field from each object.
pub struct FieldAdapter {
    pub name: String,
}

impl ShapeAdapter for FieldAdapter {
    type Output = Value;

    fn build(&self, value: Value) -> Result<Value> {
        value
            .field(&self.name)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("result has no field `{}`", self.name)))
    }
}
