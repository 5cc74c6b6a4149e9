//! Scalar codecs and the built-in type-id table.
//!
//! Scalars with well-known ids (`00000000-0000-0000-0000-0000000001xx`)
//! have fixed codecs that exist before any descriptor arrives; the
//! compiler consults this table before the general cache.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::value::{
    BigInt, DateDuration, DateTime, Decimal, Duration, LocalDate, LocalDateTime, LocalTime,
    RelativeDuration, Value,
};
use crate::wire::{Reader, Writer};

/// The all-zero id, reserved for the null codec.
pub const NULL_CODEC_ID: Uuid = Uuid::nil();

const fn known(suffix: u128) -> Uuid {
    Uuid::from_u128(suffix)
}

pub const UUID_ID: Uuid = known(0x100);
pub const STR_ID: Uuid = known(0x101);
pub const BYTES_ID: Uuid = known(0x102);
pub const INT16_ID: Uuid = known(0x103);
pub const INT32_ID: Uuid = known(0x104);
pub const INT64_ID: Uuid = known(0x105);
pub const FLOAT32_ID: Uuid = known(0x106);
pub const FLOAT64_ID: Uuid = known(0x107);
pub const DECIMAL_ID: Uuid = known(0x108);
pub const BOOL_ID: Uuid = known(0x109);
pub const DATETIME_ID: Uuid = known(0x10A);
pub const LOCAL_DATETIME_ID: Uuid = known(0x10B);
pub const LOCAL_DATE_ID: Uuid = known(0x10C);
pub const LOCAL_TIME_ID: Uuid = known(0x10D);
pub const DURATION_ID: Uuid = known(0x10E);
pub const JSON_ID: Uuid = known(0x10F);
pub const BIGINT_ID: Uuid = known(0x110);
pub const RELATIVE_DURATION_ID: Uuid = known(0x111);
pub const DATE_DURATION_ID: Uuid = known(0x112);
pub const CONFIG_MEMORY_ID: Uuid = known(0x130);

/// Host-type targets a complex scalar can convert to and from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    SystemTime,
    UnixMicros,
    StdDuration,
    String,
}

/// One registered conversion: a host-type target bound to a pair of
/// functions to and from the codec's canonical representation.
pub struct Conversion {
    pub target: HostKind,
    /// canonical -> host
    pub from_canonical: fn(&Value) -> Result<Value>,
    /// host -> canonical
    pub to_canonical: fn(&Value) -> Result<Value>,
}

/// All scalar wire codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarCodec {
    Uuid,
    Str,
    Bytes,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    Bool,
    DateTime,
    LocalDateTime,
    LocalDate,
    LocalTime,
    Duration,
    Json,
    BigInt,
    RelativeDuration,
    DateDuration,
    ConfigMemory,
}

/// The fixed built-in table consulted before the general cache.
pub const BUILT_IN: &[(Uuid, ScalarCodec)] = &[
    (UUID_ID, ScalarCodec::Uuid),
    (STR_ID, ScalarCodec::Str),
    (BYTES_ID, ScalarCodec::Bytes),
    (INT16_ID, ScalarCodec::Int16),
    (INT32_ID, ScalarCodec::Int32),
    (INT64_ID, ScalarCodec::Int64),
    (FLOAT32_ID, ScalarCodec::Float32),
    (FLOAT64_ID, ScalarCodec::Float64),
    (DECIMAL_ID, ScalarCodec::Decimal),
    (BOOL_ID, ScalarCodec::Bool),
    (DATETIME_ID, ScalarCodec::DateTime),
    (LOCAL_DATETIME_ID, ScalarCodec::LocalDateTime),
    (LOCAL_DATE_ID, ScalarCodec::LocalDate),
    (LOCAL_TIME_ID, ScalarCodec::LocalTime),
    (DURATION_ID, ScalarCodec::Duration),
    (JSON_ID, ScalarCodec::Json),
    (BIGINT_ID, ScalarCodec::BigInt),
    (RELATIVE_DURATION_ID, ScalarCodec::RelativeDuration),
    (DATE_DURATION_ID, ScalarCodec::DateDuration),
    (CONFIG_MEMORY_ID, ScalarCodec::ConfigMemory),
];

/// Looks up the built-in codec for a well-known type id.
pub fn built_in(id: Uuid) -> Option<ScalarCodec> {
    BUILT_IN
        .iter()
        .find(|(known, _)| *known == id)
        .map(|(_, codec)| *codec)
}

impl ScalarCodec {
    pub fn type_id(self) -> Uuid {
        BUILT_IN
            .iter()
            .find(|(_, codec)| *codec == self)
            .map(|(id, _)| *id)
            .expect("every scalar codec has a registered id")
    }

    pub fn kind_name(self) -> &'static str {
        match self {
            ScalarCodec::Uuid => "uuid",
            ScalarCodec::Str => "str",
            ScalarCodec::Bytes => "bytes",
            ScalarCodec::Int16 => "int16",
            ScalarCodec::Int32 => "int32",
            ScalarCodec::Int64 => "int64",
            ScalarCodec::Float32 => "float32",
            ScalarCodec::Float64 => "float64",
            ScalarCodec::Decimal => "decimal",
            ScalarCodec::Bool => "bool",
            ScalarCodec::DateTime => "datetime",
            ScalarCodec::LocalDateTime => "local datetime",
            ScalarCodec::LocalDate => "local date",
            ScalarCodec::LocalTime => "local time",
            ScalarCodec::Duration => "duration",
            ScalarCodec::Json => "json",
            ScalarCodec::BigInt => "bigint",
            ScalarCodec::RelativeDuration => "relative duration",
            ScalarCodec::DateDuration => "date duration",
            ScalarCodec::ConfigMemory => "config memory",
        }
    }

    /// The conversion set of a complex scalar: host types this codec can
    /// additionally surface, with explicit conversion pairs. Plain scalars
    /// have none.
    pub fn conversions(self) -> &'static [Conversion] {
        match self {
            ScalarCodec::DateTime => &[
                Conversion {
                    target: HostKind::SystemTime,
                    from_canonical: |v| match v {
                        Value::DateTime(dt) => Ok(Value::Int64(
                            dt.to_system_time()
                                .duration_since(std::time::UNIX_EPOCH)
                                .map(|d| d.as_micros() as i64)
                                .unwrap_or_default(),
                        )),
                        other => Err(conversion_mismatch("datetime", other)),
                    },
                    to_canonical: |v| match v {
                        Value::Int64(unix) => {
                            Ok(Value::DateTime(DateTime::from_unix_micros(*unix)))
                        }
                        other => Err(conversion_mismatch("int64", other)),
                    },
                },
                Conversion {
                    target: HostKind::UnixMicros,
                    from_canonical: |v| match v {
                        Value::DateTime(dt) => Ok(Value::Int64(dt.to_unix_micros())),
                        other => Err(conversion_mismatch("datetime", other)),
                    },
                    to_canonical: |v| match v {
                        Value::Int64(unix) => {
                            Ok(Value::DateTime(DateTime::from_unix_micros(*unix)))
                        }
                        other => Err(conversion_mismatch("int64", other)),
                    },
                },
            ],
            ScalarCodec::Duration => &[Conversion {
                target: HostKind::StdDuration,
                from_canonical: |v| match v {
                    Value::Duration(d) => Ok(Value::Int64(d.micros)),
                    other => Err(conversion_mismatch("duration", other)),
                },
                to_canonical: |v| match v {
                    Value::Int64(micros) => Ok(Value::Duration(Duration { micros: *micros })),
                    other => Err(conversion_mismatch("int64", other)),
                },
            }],
            ScalarCodec::Json => &[Conversion {
                target: HostKind::String,
                from_canonical: |v| match v {
                    Value::Json(text) => Ok(Value::Str(text.clone())),
                    other => Err(conversion_mismatch("json", other)),
                },
                to_canonical: |v| match v {
                    Value::Str(text) => Ok(Value::Json(text.clone())),
                    other => Err(conversion_mismatch("str", other)),
                },
            }],
            _ => &[],
        }
    }

    pub fn decode(self, r: &mut Reader<'_>) -> Result<Value> {
        let value = match self {
            ScalarCodec::Uuid => Value::Uuid(r.read_uuid()?),
            ScalarCodec::Str => {
                let bytes = r.peek_rest().to_vec();
                r.skip(bytes.len())?;
                Value::Str(
                    String::from_utf8(bytes)
                        .map_err(|e| Error::Protocol(format!("invalid UTF-8 in str: {e}")))?,
                )
            }
            ScalarCodec::Bytes => {
                let bytes = bytes::Bytes::copy_from_slice(r.peek_rest());
                r.skip(bytes.len())?;
                Value::Bytes(bytes)
            }
            ScalarCodec::Int16 => Value::Int16(r.read_i16()?),
            ScalarCodec::Int32 => Value::Int32(r.read_i32()?),
            ScalarCodec::Int64 => Value::Int64(r.read_i64()?),
            ScalarCodec::Float32 => Value::Float32(r.read_f32()?),
            ScalarCodec::Float64 => Value::Float64(r.read_f64()?),
            ScalarCodec::Decimal => {
                let (negative, weight, digits, scale) = read_digit_groups(r, true)?;
                Value::Decimal(Decimal {
                    negative,
                    weight,
                    scale,
                    digits,
                })
            }
            ScalarCodec::Bool => Value::Bool(r.read_u8()? != 0),
            ScalarCodec::DateTime => Value::DateTime(DateTime {
                micros: r.read_i64()?,
            }),
            ScalarCodec::LocalDateTime => Value::LocalDateTime(LocalDateTime {
                micros: r.read_i64()?,
            }),
            ScalarCodec::LocalDate => Value::LocalDate(LocalDate {
                days: r.read_i32()?,
            }),
            ScalarCodec::LocalTime => Value::LocalTime(LocalTime {
                micros: r.read_i64()?,
            }),
            ScalarCodec::Duration => {
                let micros = r.read_i64()?;
                let days = r.read_i32()?;
                let months = r.read_i32()?;
                if days != 0 || months != 0 {
                    return Err(Error::Protocol(
                        "exact duration must have zero days and months".into(),
                    ));
                }
                Value::Duration(Duration { micros })
            }
            ScalarCodec::Json => {
                let format = r.read_u8()?;
                if format != 1 {
                    return Err(Error::Protocol(format!(
                        "unknown json wire format {format}"
                    )));
                }
                let bytes = r.peek_rest().to_vec();
                r.skip(bytes.len())?;
                Value::Json(
                    String::from_utf8(bytes)
                        .map_err(|e| Error::Protocol(format!("invalid UTF-8 in json: {e}")))?,
                )
            }
            ScalarCodec::BigInt => {
                let (negative, weight, digits, _) = read_digit_groups(r, false)?;
                Value::BigInt(BigInt {
                    negative,
                    weight,
                    digits,
                })
            }
            ScalarCodec::RelativeDuration => {
                let micros = r.read_i64()?;
                let days = r.read_i32()?;
                let months = r.read_i32()?;
                Value::RelativeDuration(RelativeDuration {
                    months,
                    days,
                    micros,
                })
            }
            ScalarCodec::DateDuration => {
                let micros = r.read_i64()?;
                let days = r.read_i32()?;
                let months = r.read_i32()?;
                if micros != 0 {
                    return Err(Error::Protocol(
                        "date duration must have zero microseconds".into(),
                    ));
                }
                Value::DateDuration(DateDuration { months, days })
            }
            ScalarCodec::ConfigMemory => Value::ConfigMemory(r.read_i64()?),
        };
        Ok(value)
    }

    pub fn encode(self, w: &mut Writer, value: &Value) -> Result<()> {
        // A registered conversion may supply the canonical form.
        let converted;
        let value = match self.lift_to_canonical(value)? {
            Some(v) => {
                converted = v;
                &converted
            }
            None => value,
        };

        match (self, value) {
            (ScalarCodec::Uuid, Value::Uuid(v)) => w.write_uuid(*v),
            (ScalarCodec::Str, Value::Str(v)) => w.write_raw(v.as_bytes()),
            (ScalarCodec::Bytes, Value::Bytes(v)) => w.write_raw(v),
            (ScalarCodec::Int16, Value::Int16(v)) => w.write_i16(*v),
            (ScalarCodec::Int32, Value::Int32(v)) => w.write_i32(*v),
            (ScalarCodec::Int64, Value::Int64(v)) => w.write_i64(*v),
            (ScalarCodec::Float32, Value::Float32(v)) => w.write_f32(*v),
            (ScalarCodec::Float64, Value::Float64(v)) => w.write_f64(*v),
            (ScalarCodec::Decimal, Value::Decimal(v)) => {
                write_digit_groups(w, v.negative, v.weight, &v.digits, Some(v.scale));
            }
            (ScalarCodec::Bool, Value::Bool(v)) => w.write_u8(*v as u8),
            (ScalarCodec::DateTime, Value::DateTime(v)) => w.write_i64(v.micros),
            (ScalarCodec::LocalDateTime, Value::LocalDateTime(v)) => w.write_i64(v.micros),
            (ScalarCodec::LocalDate, Value::LocalDate(v)) => w.write_i32(v.days),
            (ScalarCodec::LocalTime, Value::LocalTime(v)) => w.write_i64(v.micros),
            (ScalarCodec::Duration, Value::Duration(v)) => {
                w.write_i64(v.micros);
                w.write_i32(0);
                w.write_i32(0);
            }
            (ScalarCodec::Json, Value::Json(v)) => {
                w.write_u8(1);
                w.write_raw(v.as_bytes());
            }
            (ScalarCodec::BigInt, Value::BigInt(v)) => {
                write_digit_groups(w, v.negative, v.weight, &v.digits, None);
            }
            (ScalarCodec::RelativeDuration, Value::RelativeDuration(v)) => {
                w.write_i64(v.micros);
                w.write_i32(v.days);
                w.write_i32(v.months);
            }
            (ScalarCodec::DateDuration, Value::DateDuration(v)) => {
                w.write_i64(0);
                w.write_i32(v.days);
                w.write_i32(v.months);
            }
            (ScalarCodec::ConfigMemory, Value::ConfigMemory(v)) => w.write_i64(*v),
            (codec, value) => {
                return Err(Error::Configuration(format!(
                    "cannot encode a {} value as {}",
                    value.kind_name(),
                    codec.kind_name()
                )))
            }
        }
        Ok(())
    }

    /// Runs the value through a registered conversion when it is not
    /// already in canonical form.
    fn lift_to_canonical(self, value: &Value) -> Result<Option<Value>> {
        let already_canonical = matches!(
            (self, value),
            (ScalarCodec::DateTime, Value::DateTime(_))
                | (ScalarCodec::Duration, Value::Duration(_))
                | (ScalarCodec::Json, Value::Json(_))
        );
        if already_canonical || self.conversions().is_empty() {
            return Ok(None);
        }

        for conversion in self.conversions() {
            if let Ok(canonical) = (conversion.to_canonical)(value) {
                return Ok(Some(canonical));
            }
        }
        Ok(None)
    }
}

fn conversion_mismatch(expected: &str, got: &Value) -> Error {
    Error::Configuration(format!(
        "conversion expected a {expected} value, got {}",
        got.kind_name()
    ))
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;

fn read_digit_groups(
    r: &mut Reader<'_>,
    with_scale: bool,
) -> Result<(bool, i16, Vec<u16>, u16)> {
    let ndigits = r.read_u16()?;
    let weight = r.read_i16()?;
    let sign = r.read_u16()?;
    let scale = r.read_u16()?;

    let negative = match sign {
        NUMERIC_POS => false,
        NUMERIC_NEG => true,
        other => {
            return Err(Error::Protocol(format!(
                "invalid numeric sign {other:#06x}"
            )))
        }
    };

    let mut digits = Vec::with_capacity(ndigits as usize);
    for _ in 0..ndigits {
        digits.push(r.read_u16()?);
    }

    Ok((negative, weight, digits, if with_scale { scale } else { 0 }))
}

fn write_digit_groups(w: &mut Writer, negative: bool, weight: i16, digits: &[u16], scale: Option<u16>) {
    w.write_u16(digits.len() as u16);
    w.write_i16(weight);
    w.write_u16(if negative { NUMERIC_NEG } else { NUMERIC_POS });
    w.write_u16(scale.unwrap_or(0));
    for digit in digits {
        w.write_u16(*digit);
    }
}
