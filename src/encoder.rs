//! Parameter and statement encoding.
//!
//! Turns the ordered parameters of a submission into the statement's type
//! signature, the per-parameter wire format and the encoded values for every
//! repetition of a batched execution.

use bytes::Bytes;
use smallvec::SmallVec;

use crate::error::{PgError, PgResult};
use crate::protocol::Format;
use crate::types::{Oid, PgValue};

/// Bind and Parse carry parameter counts as a signed 16-bit integer.
pub const MAX_PARAMS: usize = i16::MAX as usize;

/// One positional parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// Same value for every repetition.
    Value(PgValue),
    /// One value per repetition of a batched execution.
    Repeated(Vec<PgValue>),
}

impl Param {
    pub fn value(v: impl Into<PgValue>) -> Self {
        Param::Value(v.into())
    }

    pub fn repeated<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<PgValue>,
    {
        Param::Repeated(values.into_iter().map(Into::into).collect())
    }
}

impl From<PgValue> for Param {
    fn from(v: PgValue) -> Self {
        Param::Value(v)
    }
}

/// Parameter type signature. Most statements have few parameters.
pub type Signature = SmallVec<[Oid; 8]>;

/// Cache key for a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub query: String,
    pub signature: Signature,
}

impl StatementKey {
    pub fn new(query: &str, signature: &[Oid]) -> PgResult<Self> {
        Ok(Self {
            query: normalize_query(query)?.to_string(),
            signature: signature.iter().copied().collect(),
        })
    }
}

/// Validate query text and strip surrounding whitespace.
pub fn normalize_query(query: &str) -> PgResult<&str> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(PgError::InvalidArgument("query text is empty".to_string()));
    }
    if trimmed.contains('\0') {
        return Err(PgError::InvalidArgument(
            "query text contains a NUL byte".to_string(),
        ));
    }
    Ok(trimmed)
}

/// Parameters ready to be written into Bind messages.
#[derive(Debug, Clone, Default)]
pub struct EncodedParams {
    pub type_oids: Signature,
    pub formats: SmallVec<[Format; 8]>,
    /// One row of wire values per repetition.
    pub rows: Vec<Vec<Option<Bytes>>>,
}

impl EncodedParams {
    pub fn repetitions(&self) -> usize {
        self.rows.len()
    }
}

/// Encode parameters, broadcasting scalars across the repetitions implied by
/// any repeated parameters.
pub fn encode_params(params: &[Param]) -> PgResult<EncodedParams> {
    if params.len() > MAX_PARAMS {
        return Err(PgError::Validation(format!(
            "{} parameters exceed the protocol limit of {}",
            params.len(),
            MAX_PARAMS
        )));
    }
    let repetitions = repetition_count(params)?;

    let mut encoded = EncodedParams {
        type_oids: SmallVec::with_capacity(params.len()),
        formats: SmallVec::with_capacity(params.len()),
        rows: vec![Vec::with_capacity(params.len()); repetitions],
    };

    for (index, param) in params.iter().enumerate() {
        match param {
            Param::Value(value) => {
                let format = value.preferred_format();
                let bytes = value.encode(format)?;
                encoded.type_oids.push(value.type_oid());
                encoded.formats.push(format);
                for row in &mut encoded.rows {
                    row.push(bytes.clone());
                }
            }
            Param::Repeated(values) => {
                let (oid, format) = column_type(index, values)?;
                encoded.type_oids.push(oid);
                encoded.formats.push(format);
                for (row, value) in encoded.rows.iter_mut().zip(values) {
                    row.push(value.encode(format)?);
                }
            }
        }
    }

    Ok(encoded)
}

fn repetition_count(params: &[Param]) -> PgResult<usize> {
    let mut count: Option<usize> = None;
    for (index, param) in params.iter().enumerate() {
        if let Param::Repeated(values) = param {
            if values.is_empty() {
                return Err(PgError::Validation(format!(
                    "parameter ${} has no values",
                    index + 1
                )));
            }
            match count {
                None => count = Some(values.len()),
                Some(n) if n != values.len() => {
                    return Err(PgError::Validation(format!(
                        "parameter ${} has {} values, expected {}",
                        index + 1,
                        values.len(),
                        n
                    )))
                }
                Some(_) => {}
            }
        }
    }
    Ok(count.unwrap_or(1))
}

/// Shared type of a repeated parameter. NULLs take the type of their peers.
fn column_type(index: usize, values: &[PgValue]) -> PgResult<(Oid, Format)> {
    let mut typed = values.iter().filter(|v| !v.is_null());
    let Some(first) = typed.next() else {
        return Ok((Oid::UNSPECIFIED, Format::Binary));
    };
    let oid = first.type_oid();
    if let Some(other) = typed.find(|v| v.type_oid() != oid) {
        return Err(PgError::Validation(format!(
            "parameter ${} mixes types {} and {}",
            index + 1,
            oid.as_i32(),
            other.type_oid().as_i32()
        )));
    }
    Ok((oid, first.preferred_format()))
}
