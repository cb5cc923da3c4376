//! Plutus-data codec for the two datum shapes the indexer understands.
//!
//! [`Datum`] is a small algebraic model of CBOR-encoded Plutus data. The
//! strict decoders ([`ClientDatum`], [`ReferenceDatum`]) check constructor
//! tags and field shapes exactly; [`decode_reference_flexible`] tolerates
//! extra wrapping and is meant for operator tooling.

use std::fmt;

use ciborium::value::{Integer, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Result type alias for datum decoding.
pub type DatumResult<T> = Result<T, DatumError>;

/// Errors raised while decoding a datum. Decoding never panics.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatumError {
    #[error("cbor decode error: {0}")]
    Cbor(String),

    #[error("cbor encode error: {0}")]
    Encode(String),

    #[error("unsupported cbor value: {0}")]
    Unsupported(&'static str),

    #[error("expected {expected}, found {found}")]
    UnexpectedKind {
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid constructor: expected {expected}, found {found}")]
    WrongConstructor { expected: u64, found: u64 },

    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("integer out of range")]
    IntOutOfRange,

    #[error("{0} must not be negative")]
    Negative(&'static str),

    #[error("{0} not found")]
    Missing(&'static str),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

fn utf8(field: &'static str, bytes: &[u8]) -> DatumResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| DatumError::InvalidUtf8(field))
}

const TAG_BIGNUM_POS: u64 = 2;
const TAG_BIGNUM_NEG: u64 = 3;
const TAG_CONSTR_GENERAL: u64 = 102;
const TAG_CONSTR_0: u64 = 121;
const TAG_CONSTR_7: u64 = 1280;

/// A decoded Plutus data value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datum {
    Constr { tag: u64, fields: Vec<Datum> },
    Map(Vec<(Datum, Datum)>),
    List(Vec<Datum>),
    Int(i64),
    Bytes(Vec<u8>),
    Text(String),
    Tagged(u64, Box<Datum>),
}

impl Datum {
    /// Decode CBOR bytes into a datum.
    pub fn from_cbor(bytes: &[u8]) -> DatumResult<Self> {
        let value: Value =
            ciborium::de::from_reader(bytes).map_err(|e| DatumError::Cbor(e.to_string()))?;
        Self::from_value(value)
    }

    /// Encode to CBOR. Constructors use the compact tag form where one exists.
    pub fn to_cbor(&self) -> DatumResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&self.to_value(), &mut buf)
            .map_err(|e| DatumError::Encode(e.to_string()))?;
        Ok(buf)
    }

    fn from_value(value: Value) -> DatumResult<Self> {
        match value {
            Value::Integer(i) => int_from_cbor(i).map(Datum::Int),
            Value::Bytes(b) => Ok(Datum::Bytes(b)),
            Value::Text(s) => Ok(Datum::Text(s)),
            Value::Float(f) => {
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                    Ok(Datum::Int(f as i64))
                } else {
                    Err(DatumError::Unsupported("non-integral number"))
                }
            }
            Value::Bool(_) => Err(DatumError::Unsupported("boolean")),
            Value::Null => Err(DatumError::Unsupported("null")),
            Value::Array(items) => Ok(Datum::List(
                items
                    .into_iter()
                    .map(Self::from_value)
                    .collect::<DatumResult<_>>()?,
            )),
            Value::Map(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    out.push((Self::from_value(k)?, Self::from_value(v)?));
                }
                Ok(Datum::Map(out))
            }
            Value::Tag(tag, inner) => Self::from_tagged(tag, *inner),
            _ => Err(DatumError::Unsupported("unknown cbor value")),
        }
    }

    fn from_tagged(tag: u64, inner: Value) -> DatumResult<Self> {
        if let Some(ctor) = compact_constructor(tag) {
            return Ok(Datum::Constr {
                tag: ctor,
                fields: list_fields(inner)?,
            });
        }
        match tag {
            TAG_CONSTR_GENERAL => {
                let mut parts = match inner {
                    Value::Array(parts) if parts.len() == 2 => parts,
                    Value::Array(parts) => {
                        return Err(DatumError::FieldCount {
                            expected: 2,
                            found: parts.len(),
                        });
                    }
                    other => {
                        return Err(DatumError::UnexpectedKind {
                            expected: "constructor [index, fields]",
                            found: value_kind(&other),
                        });
                    }
                };
                let fields = list_fields(parts.pop().unwrap_or(Value::Null))?;
                let index = match parts.pop() {
                    Some(Value::Integer(i)) => {
                        u64::try_from(i).map_err(|_| DatumError::IntOutOfRange)?
                    }
                    Some(other) => {
                        return Err(DatumError::UnexpectedKind {
                            expected: "constructor index",
                            found: value_kind(&other),
                        });
                    }
                    None => return Err(DatumError::Missing("constructor index")),
                };
                Ok(Datum::Constr { tag: index, fields })
            }
            TAG_BIGNUM_POS | TAG_BIGNUM_NEG => {
                let Value::Bytes(raw) = inner else {
                    return Err(DatumError::UnexpectedKind {
                        expected: "bignum bytes",
                        found: value_kind(&inner),
                    });
                };
                let magnitude = bignum_magnitude(&raw)?;
                let n = if tag == TAG_BIGNUM_POS {
                    magnitude as i128
                } else {
                    -1 - magnitude as i128
                };
                i64::try_from(n)
                    .map(Datum::Int)
                    .map_err(|_| DatumError::IntOutOfRange)
            }
            _ => Ok(Datum::Tagged(tag, Box::new(Self::from_value(inner)?))),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Datum::Constr { tag, fields } => {
                let items = Value::Array(fields.iter().map(Datum::to_value).collect());
                match *tag {
                    0..=6 => Value::Tag(TAG_CONSTR_0 + tag, Box::new(items)),
                    7..=127 => Value::Tag(TAG_CONSTR_7 + (tag - 7), Box::new(items)),
                    _ => Value::Tag(
                        TAG_CONSTR_GENERAL,
                        Box::new(Value::Array(vec![Value::Integer((*tag).into()), items])),
                    ),
                }
            }
            Datum::Map(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_value(), v.to_value()))
                    .collect(),
            ),
            Datum::List(items) => Value::Array(items.iter().map(Datum::to_value).collect()),
            Datum::Int(n) => Value::Integer((*n).into()),
            Datum::Bytes(b) => Value::Bytes(b.clone()),
            Datum::Text(s) => Value::Text(s.clone()),
            Datum::Tagged(tag, inner) => Value::Tag(*tag, Box::new(inner.to_value())),
        }
    }

    /// Strip wrappers until a concrete value remains: tags are dropped, a
    /// single-field constructor becomes its field, any other constructor
    /// becomes the list of its fields.
    pub fn unwrap(&self) -> &Datum {
        let mut current = self;
        loop {
            match current {
                Datum::Tagged(_, inner) => current = inner,
                Datum::Constr { fields, .. } if fields.len() == 1 => current = &fields[0],
                _ => return current,
            }
        }
    }

    /// Items of a list or of a multi-field constructor, after unwrapping.
    pub fn as_list(&self) -> DatumResult<&[Datum]> {
        match self.unwrap() {
            Datum::List(items) => Ok(items),
            Datum::Constr { fields, .. } => Ok(fields),
            other => Err(DatumError::UnexpectedKind {
                expected: "list",
                found: other.kind(),
            }),
        }
    }

    pub fn as_int(&self) -> DatumResult<i64> {
        match self.unwrap() {
            Datum::Int(n) => Ok(*n),
            other => Err(DatumError::UnexpectedKind {
                expected: "integer",
                found: other.kind(),
            }),
        }
    }

    pub fn as_bytes(&self) -> DatumResult<&[u8]> {
        match self.unwrap() {
            Datum::Bytes(b) => Ok(b),
            other => Err(DatumError::UnexpectedKind {
                expected: "bytes",
                found: other.kind(),
            }),
        }
    }

    /// A byte string or text string. Bytes must be valid UTF-8.
    pub fn as_str_like(&self) -> DatumResult<String> {
        match self.unwrap() {
            Datum::Bytes(b) => utf8("string", b),
            Datum::Text(s) => Ok(s.clone()),
            other => Err(DatumError::UnexpectedKind {
                expected: "string",
                found: other.kind(),
            }),
        }
    }

    /// Fields of a constructor with the given tag, without unwrapping.
    pub fn as_constr(&self, expected: u64) -> DatumResult<&[Datum]> {
        match self {
            Datum::Constr { tag, fields } if *tag == expected => Ok(fields),
            Datum::Constr { tag, .. } => Err(DatumError::WrongConstructor {
                expected,
                found: *tag,
            }),
            other => Err(DatumError::UnexpectedKind {
                expected: "constructor",
                found: other.kind(),
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Datum::Constr { .. } => "constructor",
            Datum::Map(_) => "map",
            Datum::List(_) => "list",
            Datum::Int(_) => "integer",
            Datum::Bytes(_) => "bytes",
            Datum::Text(_) => "text",
            Datum::Tagged(..) => "tagged value",
        }
    }
}

fn compact_constructor(tag: u64) -> Option<u64> {
    match tag {
        121..=127 => Some(tag - TAG_CONSTR_0),
        1280..=1400 => Some(tag - TAG_CONSTR_7 + 7),
        _ => None,
    }
}

fn list_fields(value: Value) -> DatumResult<Vec<Datum>> {
    match value {
        Value::Array(items) => items.into_iter().map(Datum::from_value).collect(),
        other => Err(DatumError::UnexpectedKind {
            expected: "constructor fields",
            found: value_kind(&other),
        }),
    }
}

fn int_from_cbor(i: Integer) -> DatumResult<i64> {
    i64::try_from(i).map_err(|_| DatumError::IntOutOfRange)
}

fn bignum_magnitude(raw: &[u8]) -> DatumResult<u128> {
    let significant: Vec<u8> = raw.iter().copied().skip_while(|b| *b == 0).collect();
    if significant.len() > 16 {
        return Err(DatumError::IntOutOfRange);
    }
    Ok(significant
        .iter()
        .fold(0u128, |acc, b| (acc << 8) | u128::from(*b)))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Integer(_) => "integer",
        Value::Bytes(_) => "bytes",
        Value::Float(_) => "float",
        Value::Text(_) => "text",
        Value::Bool(_) => "boolean",
        Value::Null => "null",
        Value::Tag(..) => "tagged value",
        Value::Array(_) => "list",
        Value::Map(_) => "map",
        _ => "unknown",
    }
}

// ── Client datum ───────────────────────────────────────────────────

/// Datum attached to a client subscription output (constructor 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDatum {
    pub credential: Vec<u8>,
    pub region: String,
    /// Subscription expiry in milliseconds since the Unix epoch.
    pub expiration_ms: u64,
}

impl ClientDatum {
    pub const CONSTRUCTOR: u64 = 1;

    pub fn from_cbor(bytes: &[u8]) -> DatumResult<Self> {
        Self::from_datum(&Datum::from_cbor(bytes)?)
    }

    pub fn from_datum(datum: &Datum) -> DatumResult<Self> {
        let fields = datum.as_constr(Self::CONSTRUCTOR)?;
        if fields.len() != 3 {
            return Err(DatumError::FieldCount {
                expected: 3,
                found: fields.len(),
            });
        }
        let credential = match &fields[0] {
            Datum::Bytes(b) => b.clone(),
            other => {
                return Err(DatumError::UnexpectedKind {
                    expected: "credential bytes",
                    found: other.kind(),
                });
            }
        };
        let region = match &fields[1] {
            Datum::Bytes(b) => utf8("region", b)?,
            Datum::Text(s) => s.clone(),
            other => {
                return Err(DatumError::UnexpectedKind {
                    expected: "region string",
                    found: other.kind(),
                });
            }
        };
        let expiration = match &fields[2] {
            Datum::Int(n) => *n,
            other => {
                return Err(DatumError::UnexpectedKind {
                    expected: "expiration integer",
                    found: other.kind(),
                });
            }
        };
        let expiration_ms =
            u64::try_from(expiration).map_err(|_| DatumError::Negative("expiration"))?;
        Ok(Self {
            credential,
            region,
            expiration_ms,
        })
    }

    pub fn to_datum(&self) -> DatumResult<Datum> {
        let expiration = i64::try_from(self.expiration_ms).map_err(|_| DatumError::IntOutOfRange)?;
        Ok(Datum::Constr {
            tag: Self::CONSTRUCTOR,
            fields: vec![
                Datum::Bytes(self.credential.clone()),
                Datum::Bytes(self.region.as_bytes().to_vec()),
                Datum::Int(expiration),
            ],
        })
    }

    pub fn to_cbor(&self) -> DatumResult<Vec<u8>> {
        self.to_datum()?.to_cbor()
    }

    /// Expiration in whole Unix seconds.
    pub fn expiration_secs(&self) -> u64 {
        self.expiration_ms / 1000
    }
}

// ── Reference datum ────────────────────────────────────────────────

/// A subscription plan: duration (milliseconds) and price (lovelace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PricePlan {
    pub duration: i64,
    pub price: i64,
}

impl fmt::Display for PricePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms@{}", self.duration, self.price)
    }
}

/// Datum attached to the reference-token output (constructor 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDatum {
    pub prices: Vec<PricePlan>,
    pub regions: Vec<String>,
}

impl ReferenceDatum {
    pub const CONSTRUCTOR: u64 = 0;

    pub fn from_cbor(bytes: &[u8]) -> DatumResult<Self> {
        Self::from_datum(&Datum::from_cbor(bytes)?)
    }

    pub fn from_datum(datum: &Datum) -> DatumResult<Self> {
        let fields = datum.as_constr(Self::CONSTRUCTOR)?;
        if fields.len() != 2 {
            return Err(DatumError::FieldCount {
                expected: 2,
                found: fields.len(),
            });
        }
        let Datum::List(raw_prices) = &fields[0] else {
            return Err(DatumError::UnexpectedKind {
                expected: "price list",
                found: fields[0].kind(),
            });
        };
        let prices = raw_prices
            .iter()
            .map(strict_plan)
            .collect::<DatumResult<Vec<_>>>()?;

        let Datum::List(raw_regions) = &fields[1] else {
            return Err(DatumError::UnexpectedKind {
                expected: "region list",
                found: fields[1].kind(),
            });
        };
        let regions = raw_regions
            .iter()
            .map(|r| match r {
                Datum::Bytes(b) => utf8("region", b),
                Datum::Text(s) => Ok(s.clone()),
                other => Err(DatumError::UnexpectedKind {
                    expected: "region string",
                    found: other.kind(),
                }),
            })
            .collect::<DatumResult<Vec<_>>>()?;

        Ok(Self { prices, regions })
    }

    pub fn to_datum(&self) -> Datum {
        Datum::Constr {
            tag: Self::CONSTRUCTOR,
            fields: vec![
                Datum::List(
                    self.prices
                        .iter()
                        .map(|p| Datum::Constr {
                            tag: 0,
                            fields: vec![Datum::Int(p.duration), Datum::Int(p.price)],
                        })
                        .collect(),
                ),
                Datum::List(
                    self.regions
                        .iter()
                        .map(|r| Datum::Bytes(r.as_bytes().to_vec()))
                        .collect(),
                ),
            ],
        }
    }

    pub fn to_cbor(&self) -> DatumResult<Vec<u8>> {
        self.to_datum().to_cbor()
    }
}

fn strict_plan(item: &Datum) -> DatumResult<PricePlan> {
    let pair = match item {
        Datum::Constr { .. } => item.as_constr(0)?,
        Datum::List(items) => items.as_slice(),
        other => {
            return Err(DatumError::UnexpectedKind {
                expected: "price pair",
                found: other.kind(),
            });
        }
    };
    if pair.len() != 2 {
        return Err(DatumError::FieldCount {
            expected: 2,
            found: pair.len(),
        });
    }
    match (&pair[0], &pair[1]) {
        (Datum::Int(duration), Datum::Int(price)) => Ok(PricePlan {
            duration: *duration,
            price: *price,
        }),
        (Datum::Int(_), other) | (other, _) => Err(DatumError::UnexpectedKind {
            expected: "integer",
            found: other.kind(),
        }),
    }
}

// ── Flexible reference decoding ────────────────────────────────────

/// Result of [`decode_reference_flexible`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexibleReference {
    pub datum: ReferenceDatum,
    /// Positions (in the unwrapped top-level list) of further lists that
    /// also matched the plan or region shape and were ignored.
    pub ambiguous_candidates: Vec<usize>,
}

/// Decode a reference datum of uncertain wrapping. The first list of integer
/// pairs becomes the plans, the first list of strings the regions.
pub fn decode_reference_flexible(bytes: &[u8]) -> DatumResult<FlexibleReference> {
    let datum = Datum::from_cbor(bytes)?;
    let top = datum.as_list()?;

    let mut prices = None;
    let mut regions = None;
    let mut ambiguous_candidates = Vec::new();
    for (position, item) in top.iter().enumerate() {
        let item = item.unwrap();
        if let Some(plans) = plan_list(item) {
            if prices.is_none() {
                prices = Some(plans);
            } else {
                ambiguous_candidates.push(position);
            }
            continue;
        }
        if let Some(names) = string_list(item) {
            if regions.is_none() {
                regions = Some(names);
            } else {
                ambiguous_candidates.push(position);
            }
        }
    }

    let prices = prices.ok_or(DatumError::Missing("plans"))?;
    let regions = regions.ok_or(DatumError::Missing("regions"))?;
    if !ambiguous_candidates.is_empty() {
        warn!(
            candidates = ?ambiguous_candidates,
            "reference datum has more than one candidate list; using the first match"
        );
    }
    Ok(FlexibleReference {
        datum: ReferenceDatum { prices, regions },
        ambiguous_candidates,
    })
}

fn plan_list(item: &Datum) -> Option<Vec<PricePlan>> {
    let items = match item {
        Datum::List(items) if !items.is_empty() => items,
        _ => return None,
    };
    items
        .iter()
        .map(|entry| {
            let pair = entry.as_list().ok()?;
            if pair.len() != 2 {
                return None;
            }
            Some(PricePlan {
                duration: pair[0].as_int().ok()?,
                price: pair[1].as_int().ok()?,
            })
        })
        .collect()
}

fn string_list(item: &Datum) -> Option<Vec<String>> {
    let Datum::List(items) = item else {
        return None;
    };
    items.iter().map(|entry| entry.as_str_like().ok()).collect()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_client() -> impl Strategy<Value = ClientDatum> {
        (
            proptest::collection::vec(any::<u8>(), 0..64),
            any::<String>(),
            0..=i64::MAX as u64,
        )
            .prop_map(|(credential, region, expiration_ms)| ClientDatum {
                credential,
                region,
                expiration_ms,
            })
    }

    proptest! {
        #[test]
        fn client_datum_survives_encoding(datum in arb_client()) {
            let bytes = datum.to_cbor().unwrap();
            prop_assert_eq!(ClientDatum::from_cbor(&bytes).unwrap(), datum);
        }

        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Datum::from_cbor(&bytes);
            let _ = ClientDatum::from_cbor(&bytes);
            let _ = ReferenceDatum::from_cbor(&bytes);
            let _ = decode_reference_flexible(&bytes);
        }

        #[test]
        fn client_datum_is_never_a_reference(datum in arb_client()) {
            let bytes = datum.to_cbor().unwrap();
            prop_assert_eq!(
                ReferenceDatum::from_cbor(&bytes),
                Err(DatumError::WrongConstructor { expected: 0, found: 1 })
            );
        }
    }
}
