//! PostgreSQL type encoding and decoding.
//!
//! Parameters are sent in binary format where a stable binary layout exists;
//! numerics and arrays fall back to the text format. Results are always
//! requested in binary.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::array;
use crate::error::{PgError, PgResult};
use crate::protocol::Format;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub i32);

impl Oid {
    /// Let the server infer the type.
    pub const UNSPECIFIED: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const TIMETZ: Oid = Oid(1266);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const NUMERIC_ARRAY: Oid = Oid(1231);
    pub const UUID_ARRAY: Oid = Oid(2951);
    pub const JSONB_ARRAY: Oid = Oid(3807);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }

    /// Array type for an element type, `UNSPECIFIED` when unknown.
    pub fn array_of(element: Oid) -> Oid {
        match element {
            Oid::BOOL => Oid::BOOL_ARRAY,
            Oid::BYTEA => Oid::BYTEA_ARRAY,
            Oid::INT2 => Oid::INT2_ARRAY,
            Oid::INT4 => Oid::INT4_ARRAY,
            Oid::INT8 => Oid::INT8_ARRAY,
            Oid::TEXT => Oid::TEXT_ARRAY,
            Oid::VARCHAR => Oid::VARCHAR_ARRAY,
            Oid::FLOAT4 => Oid::FLOAT4_ARRAY,
            Oid::FLOAT8 => Oid::FLOAT8_ARRAY,
            Oid::TIMESTAMP => Oid::TIMESTAMP_ARRAY,
            Oid::TIMESTAMPTZ => Oid::TIMESTAMPTZ_ARRAY,
            Oid::DATE => Oid::DATE_ARRAY,
            Oid::NUMERIC => Oid::NUMERIC_ARRAY,
            Oid::UUID => Oid::UUID_ARRAY,
            Oid::JSONB => Oid::JSONB_ARRAY,
            _ => Oid::UNSPECIFIED,
        }
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;
/// Days between 0001-01-01 (CE day 1) and 2000-01-01.
const PG_EPOCH_CE_DAYS: i32 = 730_120;

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid([u8; 16]),
    // Timestamps stored as microseconds since 2000-01-01
    Timestamp(i64),
    TimestampTz(i64),
    Date(i32),
    Time(i64),
    Json(String),
    /// Arbitrary precision decimal, kept in its text form.
    Numeric(String),
    /// Array of values sharing one element type. Nested arrays are allowed.
    Array { element: Oid, values: Vec<PgValue> },
    // For types we don't handle specially - store raw bytes
    Raw { oid: Oid, data: Vec<u8> },
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::TimestampTz(_) => Oid::TIMESTAMPTZ,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Numeric(_) => Oid::NUMERIC,
            PgValue::Array { element, .. } => Oid::array_of(*element),
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Wire format this value is sent in.
    pub fn preferred_format(&self) -> Format {
        match self {
            PgValue::Numeric(_) | PgValue::Array { .. } => Format::Text,
            _ => Format::Binary,
        }
    }

    /// Encode in the given format. NULL has no encoding and yields `None`.
    pub fn encode(&self, format: Format) -> PgResult<Option<Bytes>> {
        if self.is_null() {
            return Ok(None);
        }
        let bytes = match format {
            Format::Binary => self.encode_binary()?,
            Format::Text => self.encode_text().into_bytes(),
        };
        Ok(Some(Bytes::from(bytes)))
    }

    /// Encode this value to binary format.
    pub fn encode_binary(&self) -> PgResult<Vec<u8>> {
        Ok(match self {
            PgValue::Null => vec![],
            PgValue::Bool(v) => vec![u8::from(*v)],
            PgValue::Int2(v) => v.to_be_bytes().to_vec(),
            PgValue::Int4(v) => v.to_be_bytes().to_vec(),
            PgValue::Int8(v) => v.to_be_bytes().to_vec(),
            PgValue::Float4(v) => v.to_be_bytes().to_vec(),
            PgValue::Float8(v) => v.to_be_bytes().to_vec(),
            PgValue::Text(v) => v.as_bytes().to_vec(),
            PgValue::Bytea(v) => v.clone(),
            PgValue::Uuid(v) => v.to_vec(),
            PgValue::Timestamp(v) | PgValue::TimestampTz(v) | PgValue::Time(v) => {
                v.to_be_bytes().to_vec()
            }
            PgValue::Date(v) => v.to_be_bytes().to_vec(),
            PgValue::Json(v) => {
                // jsonb binary format: version byte followed by the text
                let mut out = Vec::with_capacity(v.len() + 1);
                out.push(1);
                out.extend_from_slice(v.as_bytes());
                out
            }
            PgValue::Raw { data, .. } => data.clone(),
            PgValue::Numeric(_) | PgValue::Array { .. } => {
                return Err(PgError::Type(format!(
                    "{:?} has no binary encoding, send it as text",
                    self.type_oid()
                )))
            }
        })
    }

    /// Encode this value to its text representation.
    pub fn encode_text(&self) -> String {
        match self {
            PgValue::Null => "NULL".to_string(),
            PgValue::Bool(v) => if *v { "t" } else { "f" }.to_string(),
            PgValue::Int2(v) => v.to_string(),
            PgValue::Int4(v) => v.to_string(),
            PgValue::Int8(v) => v.to_string(),
            PgValue::Float4(v) => float_text(f64::from(*v)),
            PgValue::Float8(v) => float_text(*v),
            PgValue::Text(v) | PgValue::Json(v) | PgValue::Numeric(v) => v.clone(),
            PgValue::Bytea(v) => {
                let mut out = String::with_capacity(2 + v.len() * 2);
                out.push_str("\\x");
                for b in v {
                    out.push_str(&format!("{:02x}", b));
                }
                out
            }
            PgValue::Uuid(v) => uuid::Uuid::from_bytes(*v).hyphenated().to_string(),
            PgValue::Timestamp(v) => match timestamp_from_pg(*v) {
                Some(ts) => ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
                None => v.to_string(),
            },
            PgValue::TimestampTz(v) => match timestamp_from_pg(*v) {
                Some(ts) => ts.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string(),
                None => v.to_string(),
            },
            PgValue::Date(v) => match date_from_pg(*v) {
                Some(d) => d.format("%Y-%m-%d").to_string(),
                None => v.to_string(),
            },
            PgValue::Time(v) => match time_from_pg(*v) {
                Some(t) => t.format("%H:%M:%S%.6f").to_string(),
                None => v.to_string(),
            },
            PgValue::Array { values, .. } => array::format_array_literal(values),
            PgValue::Raw { data, .. } => String::from_utf8_lossy(data).into_owned(),
        }
    }

    /// Decode a value from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> PgResult<Self> {
        match oid {
            Oid::BOOL => {
                let [b] = fixed::<1>(oid, data)?;
                Ok(PgValue::Bool(b != 0))
            }
            Oid::INT2 => Ok(PgValue::Int2(i16::from_be_bytes(fixed(oid, data)?))),
            Oid::INT4 => Ok(PgValue::Int4(i32::from_be_bytes(fixed(oid, data)?))),
            Oid::INT8 => Ok(PgValue::Int8(i64::from_be_bytes(fixed(oid, data)?))),
            Oid::FLOAT4 => Ok(PgValue::Float4(f32::from_be_bytes(fixed(oid, data)?))),
            Oid::FLOAT8 => Ok(PgValue::Float8(f64::from_be_bytes(fixed(oid, data)?))),
            _ if oid.is_text_like() => Ok(PgValue::Text(utf8(oid, data)?)),
            Oid::BYTEA => Ok(PgValue::Bytea(data.to_vec())),
            Oid::UUID => Ok(PgValue::Uuid(fixed(oid, data)?)),
            Oid::TIMESTAMP => Ok(PgValue::Timestamp(i64::from_be_bytes(fixed(oid, data)?))),
            Oid::TIMESTAMPTZ => Ok(PgValue::TimestampTz(i64::from_be_bytes(fixed(oid, data)?))),
            Oid::DATE => Ok(PgValue::Date(i32::from_be_bytes(fixed(oid, data)?))),
            Oid::TIME => Ok(PgValue::Time(i64::from_be_bytes(fixed(oid, data)?))),
            Oid::TIMETZ => {
                // 8 bytes of time followed by a 4 byte zone offset
                let micros = data
                    .get(..8)
                    .ok_or_else(|| length_error(oid, data.len()))?;
                Ok(PgValue::Time(i64::from_be_bytes(fixed(oid, micros)?)))
            }
            Oid::JSON => Ok(PgValue::Json(utf8(oid, data)?)),
            Oid::JSONB => {
                // JSONB has a version byte prefix
                let body = data.get(1..).unwrap_or_default();
                Ok(PgValue::Json(utf8(oid, body)?))
            }
            Oid::NUMERIC => Ok(PgValue::Numeric(decode_numeric(data)?)),
            _ if is_array_oid(oid) => decode_array_binary(data),
            // For unknown types, store raw bytes
            _ => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }

    /// Decode from text format.
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let text = String::from_utf8_lossy(data).to_string();

        match oid {
            Oid::BOOL => {
                let v = text == "t" || text == "true" || text == "1";
                Ok(PgValue::Bool(v))
            }

            Oid::INT2 => text
                .parse::<i16>()
                .map(PgValue::Int2)
                .map_err(|e| PgError::Type(format!("Invalid INT2: {}", e))),

            Oid::INT4 => text
                .parse::<i32>()
                .map(PgValue::Int4)
                .map_err(|e| PgError::Type(format!("Invalid INT4: {}", e))),

            Oid::INT8 => text
                .parse::<i64>()
                .map(PgValue::Int8)
                .map_err(|e| PgError::Type(format!("Invalid INT8: {}", e))),

            Oid::FLOAT4 => text
                .parse::<f32>()
                .map(PgValue::Float4)
                .map_err(|e| PgError::Type(format!("Invalid FLOAT4: {}", e))),

            Oid::FLOAT8 => text
                .parse::<f64>()
                .map(PgValue::Float8)
                .map_err(|e| PgError::Type(format!("Invalid FLOAT8: {}", e))),

            Oid::NUMERIC => Ok(PgValue::Numeric(text)),

            Oid::JSON | Oid::JSONB => Ok(PgValue::Json(text)),

            _ if is_array_oid(oid) => {
                let values = array::parse_array_literal(&text)?
                    .into_iter()
                    .map(|v| v.map(PgValue::Text).unwrap_or(PgValue::Null))
                    .collect();
                Ok(PgValue::Array {
                    element: Oid::TEXT,
                    values,
                })
            }

            // Default: treat as text
            _ => Ok(PgValue::Text(text)),
        }
    }
}

impl From<bool> for PgValue {
    fn from(v: bool) -> Self {
        PgValue::Bool(v)
    }
}

impl From<i16> for PgValue {
    fn from(v: i16) -> Self {
        PgValue::Int2(v)
    }
}

impl From<i32> for PgValue {
    fn from(v: i32) -> Self {
        PgValue::Int4(v)
    }
}

impl From<i64> for PgValue {
    fn from(v: i64) -> Self {
        PgValue::Int8(v)
    }
}

impl From<f64> for PgValue {
    fn from(v: f64) -> Self {
        PgValue::Float8(v)
    }
}

impl From<&str> for PgValue {
    fn from(v: &str) -> Self {
        PgValue::Text(v.to_string())
    }
}

impl From<String> for PgValue {
    fn from(v: String) -> Self {
        PgValue::Text(v)
    }
}

impl From<Vec<u8>> for PgValue {
    fn from(v: Vec<u8>) -> Self {
        PgValue::Bytea(v)
    }
}

impl From<uuid::Uuid> for PgValue {
    fn from(v: uuid::Uuid) -> Self {
        PgValue::Uuid(v.into_bytes())
    }
}

impl From<serde_json::Value> for PgValue {
    fn from(v: serde_json::Value) -> Self {
        PgValue::Json(v.to_string())
    }
}

impl From<NaiveDateTime> for PgValue {
    fn from(v: NaiveDateTime) -> Self {
        PgValue::Timestamp(v.and_utc().timestamp_micros() - PG_EPOCH_UNIX_MICROS)
    }
}

impl From<DateTime<Utc>> for PgValue {
    fn from(v: DateTime<Utc>) -> Self {
        PgValue::TimestampTz(v.timestamp_micros() - PG_EPOCH_UNIX_MICROS)
    }
}

impl From<NaiveDate> for PgValue {
    fn from(v: NaiveDate) -> Self {
        PgValue::Date(v.num_days_from_ce() - PG_EPOCH_CE_DAYS)
    }
}

impl From<NaiveTime> for PgValue {
    fn from(v: NaiveTime) -> Self {
        use chrono::Timelike;
        let micros = i64::from(v.num_seconds_from_midnight()) * 1_000_000
            + i64::from(v.nanosecond() / 1_000);
        PgValue::Time(micros)
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(PgValue::Null)
    }
}

// ============================================================================
// Helpers
// ============================================================================

use chrono::Datelike;

fn timestamp_from_pg(micros: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(micros.checked_add(PG_EPOCH_UNIX_MICROS)?)
        .map(|dt| dt.naive_utc())
}

fn date_from_pg(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(PG_EPOCH_CE_DAYS)?)
}

fn time_from_pg(micros: i64) -> Option<NaiveTime> {
    let secs = u32::try_from(micros / 1_000_000).ok()?;
    let nanos = u32::try_from((micros % 1_000_000) * 1_000).ok()?;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
}

fn float_text(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        v.to_string()
    }
}

fn length_error(oid: Oid, len: usize) -> PgError {
    PgError::Type(format!("Invalid length {} for type {}", len, oid.as_i32()))
}

fn fixed<const N: usize>(oid: Oid, data: &[u8]) -> PgResult<[u8; N]> {
    data.try_into().map_err(|_| length_error(oid, data.len()))
}

fn utf8(oid: Oid, data: &[u8]) -> PgResult<String> {
    std::str::from_utf8(data)
        .map(str::to_owned)
        .map_err(|e| PgError::Type(format!("Invalid UTF-8 for type {}: {}", oid.as_i32(), e)))
}

fn is_array_oid(oid: Oid) -> bool {
    matches!(
        oid,
        Oid::BOOL_ARRAY
            | Oid::BYTEA_ARRAY
            | Oid::INT2_ARRAY
            | Oid::INT4_ARRAY
            | Oid::TEXT_ARRAY
            | Oid::VARCHAR_ARRAY
            | Oid::INT8_ARRAY
            | Oid::FLOAT4_ARRAY
            | Oid::FLOAT8_ARRAY
            | Oid::TIMESTAMP_ARRAY
            | Oid::DATE_ARRAY
            | Oid::TIMESTAMPTZ_ARRAY
            | Oid::NUMERIC_ARRAY
            | Oid::UUID_ARRAY
            | Oid::JSONB_ARRAY
    )
}

/// Cursor over a binary payload that reports truncation as a type error.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> PgResult<&'a [u8]> {
        if self.data.len() < n {
            return Err(PgError::Type("Truncated binary value".to_string()));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn i16(&mut self) -> PgResult<i16> {
        Ok(i16::from_be_bytes(fixed(Oid::INT2, self.take(2)?)?))
    }

    fn i32(&mut self) -> PgResult<i32> {
        Ok(i32::from_be_bytes(fixed(Oid::INT4, self.take(4)?)?))
    }
}

/// Binary numeric: ndigits, weight, sign, dscale, then base-10000 digits.
fn decode_numeric(data: &[u8]) -> PgResult<String> {
    let mut r = Reader { data };
    let ndigits = r.i16()?;
    let weight = r.i16()?;
    let sign = r.i16()? as u16;
    let dscale = r.i16()?;

    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let digits = (0..ndigits.max(0))
        .map(|_| r.i16())
        .collect::<PgResult<Vec<i16>>>()?;

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }

    // Integer part: groups 0..=weight
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight as usize {
            let group = digits.get(i).copied().unwrap_or(0);
            if i == 0 {
                out.push_str(&group.to_string());
            } else {
                out.push_str(&format!("{:04}", group));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::new();
        let mut idx = weight as i32 + 1;
        while (frac.len() as i16) < dscale {
            let group = if idx < 0 {
                0
            } else {
                digits.get(idx as usize).copied().unwrap_or(0)
            };
            frac.push_str(&format!("{:04}", group));
            idx += 1;
        }
        frac.truncate(dscale as usize);
        out.push('.');
        out.push_str(&frac);
    }

    Ok(out)
}

/// Binary array: ndim, has_null flag, element oid, (len, lbound) per
/// dimension, then length-prefixed elements in row-major order.
fn decode_array_binary(data: &[u8]) -> PgResult<PgValue> {
    let mut r = Reader { data };
    let ndim = r.i32()?;
    let _has_null = r.i32()?;
    let element = Oid::from_i32(r.i32()?);

    if ndim == 0 {
        return Ok(PgValue::Array {
            element,
            values: Vec::new(),
        });
    }
    if !(1..=6).contains(&ndim) {
        return Err(PgError::Type(format!("Invalid array dimensions: {}", ndim)));
    }

    let mut dims = Vec::with_capacity(ndim as usize);
    for _ in 0..ndim {
        let len = r.i32()?;
        let _lower_bound = r.i32()?;
        dims.push(usize::try_from(len).map_err(|_| PgError::Type("Negative array length".into()))?);
    }

    // Every element carries at least its 4-byte length, which bounds the
    // element count by the bytes left.
    let total = dims
        .iter()
        .try_fold(1usize, |acc, &len| acc.checked_mul(len))
        .filter(|&total| total <= r.data.len() / 4)
        .ok_or_else(|| {
            PgError::Type(format!(
                "Array dimensions {:?} exceed the {} bytes available",
                dims,
                r.data.len()
            ))
        })?;
    if total == 0 {
        return Ok(PgValue::Array {
            element,
            values: Vec::new(),
        });
    }

    let mut flat = Vec::with_capacity(total);
    for _ in 0..total {
        let len = r.i32()?;
        if len < 0 {
            flat.push(PgValue::Null);
        } else {
            flat.push(PgValue::decode_binary(element, r.take(len as usize)?)?);
        }
    }

    Ok(nest(element, &dims, flat))
}

fn nest(element: Oid, dims: &[usize], flat: Vec<PgValue>) -> PgValue {
    if dims.len() <= 1 {
        return PgValue::Array {
            element,
            values: flat,
        };
    }
    let inner: usize = dims[1..].iter().product();
    let mut values = Vec::with_capacity(dims[0]);
    let mut rest = flat.into_iter();
    for _ in 0..dims[0] {
        let chunk: Vec<PgValue> = rest.by_ref().take(inner).collect();
        values.push(nest(element, &dims[1..], chunk));
    }
    PgValue::Array { element, values }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(!Oid::FLOAT8.is_integer());
        assert!(Oid::FLOAT4.is_float());

        assert_eq!(Oid::array_of(Oid::INT4), Oid::INT4_ARRAY);
        assert_eq!(Oid::array_of(Oid::NAME), Oid::UNSPECIFIED);
    }

    #[test]
    fn test_int4_roundtrip() {
        let original = PgValue::Int4(12345);
        let encoded = original.encode_binary().unwrap();
        let decoded = PgValue::decode_binary(Oid::INT4, &encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_wrong_length_is_type_error() {
        let err = PgValue::decode_binary(Oid::INT8, &[0, 1]).unwrap_err();
        assert!(matches!(err, PgError::Type(_)));
    }

    #[test]
    fn test_preferred_formats() {
        assert_eq!(PgValue::Int4(1).preferred_format(), Format::Binary);
        assert_eq!(PgValue::Numeric("1.5".into()).preferred_format(), Format::Text);
        let arr = PgValue::Array {
            element: Oid::TEXT,
            values: vec![],
        };
        assert_eq!(arr.preferred_format(), Format::Text);
        assert!(arr.encode_binary().is_err());
        assert_eq!(arr.type_oid(), Oid::TEXT_ARRAY);
    }

    #[test]
    fn test_null_has_no_encoding() {
        assert_eq!(PgValue::Null.encode(Format::Binary).unwrap(), None);
        assert_eq!(PgValue::Null.type_oid(), Oid::UNSPECIFIED);
    }

    #[test]
    fn test_chrono_conversions() {
        let date = NaiveDate::from_ymd_opt(2000, 1, 2).unwrap();
        assert_eq!(PgValue::from(date), PgValue::Date(1));
        assert_eq!(PgValue::Date(1).encode_text(), "2000-01-02");

        let ts = date.and_hms_opt(0, 0, 1).unwrap();
        assert_eq!(PgValue::from(ts), PgValue::Timestamp(86_401_000_000));
        assert_eq!(
            PgValue::Timestamp(86_401_000_000).encode_text(),
            "2000-01-02 00:00:01.000000"
        );

        let t = NaiveTime::from_hms_micro_opt(1, 2, 3, 4).unwrap();
        assert_eq!(PgValue::from(t), PgValue::Time(3_723_000_004));
    }

    #[test]
    fn test_uuid_text() {
        let id = uuid::Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let value = PgValue::from(id);
        assert_eq!(value.encode_text(), "550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(value.encode_binary().unwrap(), id.as_bytes().to_vec());
    }

    #[test]
    fn test_numeric_binary_decoding() {
        // 12345.678 => digits [1, 2345, 6780], weight 1, dscale 3
        let mut data = Vec::new();
        for v in [3i16, 1, 0, 3, 1, 2345, 6780] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        assert_eq!(
            PgValue::decode_binary(Oid::NUMERIC, &data).unwrap(),
            PgValue::Numeric("12345.678".to_string())
        );

        // -0.05 => digits [500], weight -1, dscale 2
        let mut data = Vec::new();
        for v in [1i16, -1, 0x4000u16 as i16, 2, 500] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        assert_eq!(
            PgValue::decode_binary(Oid::NUMERIC, &data).unwrap(),
            PgValue::Numeric("-0.05".to_string())
        );
    }

    #[test]
    fn test_array_binary_decoding() {
        // int4[] {1, NULL, 3}
        let mut data = Vec::new();
        for v in [1i32, 1, 23, 3, 1] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        data.extend_from_slice(&4i32.to_be_bytes());
        data.extend_from_slice(&1i32.to_be_bytes());
        data.extend_from_slice(&(-1i32).to_be_bytes());
        data.extend_from_slice(&4i32.to_be_bytes());
        data.extend_from_slice(&3i32.to_be_bytes());

        let value = PgValue::decode_binary(Oid::INT4_ARRAY, &data).unwrap();
        assert_eq!(
            value,
            PgValue::Array {
                element: Oid::INT4,
                values: vec![PgValue::Int4(1), PgValue::Null, PgValue::Int4(3)],
            }
        );
    }

    fn array_header(ndim: i32, dims: &[i32]) -> Vec<u8> {
        let mut data = Vec::new();
        for v in [ndim, 0, 23] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        for len in dims {
            data.extend_from_slice(&len.to_be_bytes());
            data.extend_from_slice(&1i32.to_be_bytes());
        }
        data
    }

    #[test]
    fn test_array_binary_rejects_oversized_dimensions() {
        let data = array_header(3, &[i32::MAX, i32::MAX, i32::MAX]);
        assert!(matches!(
            PgValue::decode_binary(Oid::INT4_ARRAY, &data),
            Err(PgError::Type(_))
        ));

        // Claims 1000 elements but carries none.
        let data = array_header(1, &[1000]);
        assert!(matches!(
            PgValue::decode_binary(Oid::INT4_ARRAY, &data),
            Err(PgError::Type(_))
        ));

        let data = array_header(2, &[-1, 2]);
        assert!(matches!(
            PgValue::decode_binary(Oid::INT4_ARRAY, &data),
            Err(PgError::Type(_))
        ));
    }

    #[test]
    fn test_array_binary_zero_length_dimension() {
        let data = array_header(2, &[0, i32::MAX]);
        assert_eq!(
            PgValue::decode_binary(Oid::INT4_ARRAY, &data).unwrap(),
            PgValue::Array {
                element: Oid::INT4,
                values: Vec::new(),
            }
        );
    }

    #[test]
    fn test_text_array_decoding() {
        let value = PgValue::decode_text(Oid::TEXT_ARRAY, b"{a,NULL,\"b c\"}").unwrap();
        assert_eq!(
            value,
            PgValue::Array {
                element: Oid::TEXT,
                values: vec![
                    PgValue::Text("a".into()),
                    PgValue::Null,
                    PgValue::Text("b c".into())
                ],
            }
        );
    }
}
