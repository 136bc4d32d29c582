//! Record, identity and field value types.
//!
//! A [`Record`] is a transient, typed view of one row: its immutable internal
//! identity, the recency timestamp used to pick survivors, and only the
//! business fields a job asked for. Records are never cached beyond one job.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use uuid::Uuid;

type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// Internal identity of a record (its primary key value).
///
/// Ordering is total and is what "lowest id wins" tie-breaking uses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum RecordId {
    /// Integer key (smallint, int, bigint, serial).
    Int(i64),
    /// UUID key.
    Uuid(Uuid),
    /// Text key (cuid, varchar, text).
    Text(String),
}

impl RecordId {
    /// Interpret a field value as a record identity (for link columns).
    pub fn from_field(value: &FieldValue) -> Option<RecordId> {
        match value {
            FieldValue::Int(v) => Some(RecordId::Int(*v)),
            FieldValue::Uuid(v) => Some(RecordId::Uuid(*v)),
            FieldValue::Text(v) => Some(RecordId::Text(v.clone())),
            _ => None,
        }
    }

    /// The identity as a field value (for writing into a link column).
    pub fn to_field(&self) -> FieldValue {
        match self {
            RecordId::Int(v) => FieldValue::Int(*v),
            RecordId::Uuid(v) => FieldValue::Uuid(*v),
            RecordId::Text(v) => FieldValue::Text(v.clone()),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(v) => write!(f, "{}", v),
            RecordId::Uuid(v) => write!(f, "{}", v),
            RecordId::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        RecordId::Int(value)
    }
}

impl From<i32> for RecordId {
    fn from(value: i32) -> Self {
        RecordId::Int(value as i64)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        RecordId::Text(value.to_string())
    }
}

impl From<Uuid> for RecordId {
    fn from(value: Uuid) -> Self {
        RecordId::Uuid(value)
    }
}

impl ToSql for RecordId {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            RecordId::Int(v) => encode_int(*v, ty, out),
            RecordId::Uuid(v) => encode_checked(v, ty, out),
            RecordId::Text(v) => encode_checked(v, ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Each variant checks the concrete column type in `to_sql`.
        true
    }

    to_sql_checked!();
}

/// A typed column value.
///
/// Floats compare by bit pattern (with both zeroes and all NaNs collapsed)
/// so that every variant can take part in a hashable [`LogicalKey`].
///
/// [`LogicalKey`]: crate::core::key::LogicalKey
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
}

impl FieldValue {
    /// Build a text value.
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    /// True for SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Borrow the text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Interpret the value as a recency timestamp.
    ///
    /// Dates count as midnight UTC; anything else has no recency.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(v) => Some(*v),
            FieldValue::Date(d) => d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
            _ => None,
        }
    }

    fn discriminant(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Bool(_) => 1,
            FieldValue::Int(_) => 2,
            FieldValue::Float(_) => 3,
            FieldValue::Decimal(_) => 4,
            FieldValue::Text(_) => 5,
            FieldValue::Uuid(_) => 6,
            FieldValue::Timestamp(_) => 7,
            FieldValue::Date(_) => 8,
        }
    }
}

fn float_bits(v: f64) -> u64 {
    if v == 0.0 {
        0
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => true,
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a == b,
            (FieldValue::Int(a), FieldValue::Int(b)) => a == b,
            (FieldValue::Float(a), FieldValue::Float(b)) => float_bits(*a) == float_bits(*b),
            (FieldValue::Decimal(a), FieldValue::Decimal(b)) => a.normalize() == b.normalize(),
            (FieldValue::Text(a), FieldValue::Text(b)) => a == b,
            (FieldValue::Uuid(a), FieldValue::Uuid(b)) => a == b,
            (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => a == b,
            (FieldValue::Date(a), FieldValue::Date(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.discriminant().hash(state);
        match self {
            FieldValue::Null => {}
            FieldValue::Bool(v) => v.hash(state),
            FieldValue::Int(v) => v.hash(state),
            FieldValue::Float(v) => float_bits(*v).hash(state),
            FieldValue::Decimal(v) => v.normalize().to_string().hash(state),
            FieldValue::Text(v) => v.hash(state),
            FieldValue::Uuid(v) => v.hash(state),
            FieldValue::Timestamp(v) => v.hash(state),
            FieldValue::Date(v) => v.hash(state),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "NULL"),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Decimal(v) => write!(f, "{}", v),
            FieldValue::Text(v) => write!(f, "{}", v),
            FieldValue::Uuid(v) => write!(f, "{}", v),
            FieldValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            FieldValue::Date(v) => write!(f, "{}", v),
        }
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            FieldValue::Null => Ok(IsNull::Yes),
            FieldValue::Bool(v) => encode_checked(v, ty, out),
            FieldValue::Int(v) => encode_int(*v, ty, out),
            FieldValue::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                _ => encode_checked(v, ty, out),
            },
            FieldValue::Decimal(v) => encode_checked(v, ty, out),
            FieldValue::Text(v) => encode_checked(v, ty, out),
            FieldValue::Uuid(v) => encode_checked(v, ty, out),
            FieldValue::Timestamp(v) => match *ty {
                Type::TIMESTAMP => v.naive_utc().to_sql(ty, out),
                _ => encode_checked(v, ty, out),
            },
            FieldValue::Date(v) => encode_checked(v, ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Encode an integer into whichever integer width the column has.
fn encode_int(v: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => i16::try_from(v)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(v)?.to_sql(ty, out),
        Type::INT8 => v.to_sql(ty, out),
        Type::NUMERIC => Decimal::from(v).to_sql(ty, out),
        _ => Err(format!("cannot encode integer {} as {}", v, ty).into()),
    }
}

/// Encode through the inner type after checking it accepts the column type.
fn encode_checked<T: ToSql>(v: &T, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if !T::accepts(ty) {
        return Err(format!("cannot encode {} as {}", std::any::type_name::<T>(), ty).into());
    }
    v.to_sql(ty, out)
}

/// A transient, typed view of one row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Immutable internal identity.
    pub id: RecordId,
    /// Recency timestamp; `None` sorts as oldest.
    pub recency: Option<DateTime<Utc>>,
    /// Business fields requested by the job.
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Create a record with no recency and no fields.
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            recency: None,
            fields: BTreeMap::new(),
        }
    }

    /// Set the recency timestamp.
    pub fn with_recency(mut self, recency: DateTime<Utc>) -> Self {
        self.recency = Some(recency);
        self
    }

    /// Add a business field.
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Look up a business field.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}
