//! Avro payload decoding and the `ChangeEventHeader` carried by change
//! events.

use std::{fmt, str::FromStr};

use apache_avro::{Schema, types::Value};
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

pub const CHANGE_EVENT_HEADER_FIELD: &str = "ChangeEventHeader";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("avro: {0}")]
    Avro(#[from] apache_avro::Error),
    #[error("{0} trailing bytes after datum")]
    TrailingBytes(usize),
    #[error("payload is not a record")]
    NotARecord,
    #[error("payload has no ChangeEventHeader")]
    MissingHeader,
    #[error("invalid ChangeEventHeader: {0}")]
    InvalidHeader(String),
}

/// Decode a single Avro binary datum written with `schema`.
pub fn decode_payload(schema: &Schema, payload: &[u8]) -> Result<Value, DecodeError> {
    let mut reader = payload;
    let value = apache_avro::from_avro_datum(schema, &mut reader, None)?;
    if !reader.is_empty() {
        return Err(DecodeError::TrailingBytes(reader.len()));
    }
    Ok(value)
}

/// A decoded event record.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    fields: Vec<(String, Value)>,
}

impl DecodedEvent {
    pub fn decode(schema: &Schema, payload: &[u8]) -> Result<Self, DecodeError> {
        decode_payload(schema, payload)?.try_into()
    }

    /// Field values in schema order, as decoded.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Raw value of a field, without unwrapping unions.
    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find_map(|(field, value)| (field == name).then_some(value))
    }

    /// Value of a field with `["null", T]` unions unwrapped. Null values
    /// are reported as absent.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match unwrap_union(self.raw(name)?) {
            Value::Null => None,
            value => Some(value),
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            Value::String(s) | Value::Enum(_, s) => Some(s),
            _ => None,
        }
    }

    pub fn get_long(&self, name: &str) -> Option<i64> {
        as_long(self.get(name)?)
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            Value::Double(d) => Some(*d),
            Value::Float(f) => Some(f64::from(*f)),
            other => as_long(other).map(|l| l as f64),
        }
    }

    /// The change event header, if this event carries one.
    pub fn header(&self) -> Result<ChangeEventHeader, DecodeError> {
        let header = self
            .get(CHANGE_EVENT_HEADER_FIELD)
            .ok_or(DecodeError::MissingHeader)?;
        ChangeEventHeader::from_value(header)
    }

    /// Render as JSON. Unions are unwrapped, bytes and fixed values become
    /// lowercase hex strings and longs stay numeric.
    pub fn to_json(&self) -> Result<JsonValue, DecodeError> {
        let mut map = JsonMap::with_capacity(self.fields.len());
        for (name, value) in &self.fields {
            map.insert(name.clone(), to_json(value)?);
        }
        Ok(JsonValue::Object(map))
    }

    pub fn into_value(self) -> Value {
        Value::Record(self.fields)
    }
}

impl TryFrom<Value> for DecodedEvent {
    type Error = DecodeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Record(fields) => Ok(Self { fields }),
            Value::Union(_, inner) => Self::try_from(*inner),
            _ => Err(DecodeError::NotARecord),
        }
    }
}

fn unwrap_union(value: &Value) -> &Value {
    match value {
        Value::Union(_, inner) => unwrap_union(inner),
        value => value,
    }
}

fn as_long(value: &Value) -> Option<i64> {
    match unwrap_union(value) {
        Value::Long(l)
        | Value::TimeMicros(l)
        | Value::TimestampMillis(l)
        | Value::TimestampMicros(l) => Some(*l),
        Value::Int(i) | Value::Date(i) | Value::TimeMillis(i) => Some(i64::from(*i)),
        _ => None,
    }
}

fn to_json(value: &Value) -> Result<JsonValue, DecodeError> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Boolean(b) => JsonValue::Bool(*b),
        Value::Int(i) | Value::Date(i) | Value::TimeMillis(i) => JsonValue::from(*i),
        Value::Long(l)
        | Value::TimeMicros(l)
        | Value::TimestampMillis(l)
        | Value::TimestampMicros(l) => JsonValue::from(*l),
        Value::Float(f) => float(f64::from(*f)),
        Value::Double(d) => float(*d),
        Value::Bytes(b) | Value::Fixed(_, b) => JsonValue::String(hex::encode(b)),
        Value::String(s) | Value::Enum(_, s) => JsonValue::String(s.clone()),
        Value::Uuid(u) => JsonValue::String(u.to_string()),
        Value::Union(_, inner) => to_json(inner)?,
        Value::Array(items) => {
            JsonValue::Array(items.iter().map(to_json).collect::<Result<_, _>>()?)
        }
        Value::Map(entries) => {
            let mut map = JsonMap::with_capacity(entries.len());
            for (key, value) in entries {
                map.insert(key.clone(), to_json(value)?);
            }
            JsonValue::Object(map)
        }
        Value::Record(fields) => {
            let mut map = JsonMap::with_capacity(fields.len());
            for (name, value) in fields {
                map.insert(name.clone(), to_json(value)?);
            }
            JsonValue::Object(map)
        }
        other => JsonValue::try_from(other.clone())?,
    })
}

fn float(f: f64) -> JsonValue {
    Number::from_f64(f).map_or(JsonValue::Null, JsonValue::Number)
}

/// Kind of change recorded by a change event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    Undelete,
    GapCreate,
    GapUpdate,
    GapDelete,
    GapUndelete,
    GapOverflow,
    /// A change type this crate does not know about.
    Other(String),
}

impl ChangeType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Undelete => "UNDELETE",
            Self::GapCreate => "GAP_CREATE",
            Self::GapUpdate => "GAP_UPDATE",
            Self::GapDelete => "GAP_DELETE",
            Self::GapUndelete => "GAP_UNDELETE",
            Self::GapOverflow => "GAP_OVERFLOW",
            Self::Other(s) => s,
        }
    }

    /// Gap events carry no field values; the record has to be re-read.
    pub fn is_gap(&self) -> bool {
        matches!(
            self,
            Self::GapCreate
                | Self::GapUpdate
                | Self::GapDelete
                | Self::GapUndelete
                | Self::GapOverflow
        )
    }
}

impl From<&str> for ChangeType {
    fn from(s: &str) -> Self {
        match s {
            "CREATE" => Self::Create,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "UNDELETE" => Self::Undelete,
            "GAP_CREATE" => Self::GapCreate,
            "GAP_UPDATE" => Self::GapUpdate,
            "GAP_DELETE" => Self::GapDelete,
            "GAP_UNDELETE" => Self::GapUndelete,
            "GAP_OVERFLOW" => Self::GapOverflow,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl FromStr for ChangeType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.into())
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata describing the change behind a change event.
///
/// `changed_fields`, `nulled_fields` and `diff_fields` hold the raw bitmap
/// strings; see [`crate::bitmap::BitmapDecoder`] for field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEventHeader {
    pub entity_name: String,
    pub record_ids: Vec<String>,
    pub change_type: ChangeType,
    pub change_origin: String,
    pub transaction_key: String,
    pub sequence_number: i64,
    pub commit_timestamp: i64,
    pub commit_number: i64,
    pub commit_user: String,
    pub nulled_fields: Vec<String>,
    pub diff_fields: Vec<String>,
    pub changed_fields: Vec<String>,
}

impl ChangeEventHeader {
    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let Value::Record(fields) = unwrap_union(value) else {
            return Err(DecodeError::InvalidHeader("not a record".into()));
        };
        let field = |name: &str| {
            fields
                .iter()
                .find_map(|(field, value)| (field == name).then(|| unwrap_union(value)))
        };
        let string = |name: &str| match field(name) {
            Some(Value::String(s) | Value::Enum(_, s)) => s.clone(),
            _ => String::new(),
        };
        let long = |name: &str| field(name).and_then(as_long).unwrap_or_default();
        let strings = |name: &str| -> Result<Vec<String>, DecodeError> {
            match field(name) {
                None | Some(Value::Null) => Ok(Vec::new()),
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|item| match unwrap_union(item) {
                        Value::String(s) => Ok(s.clone()),
                        other => Err(DecodeError::InvalidHeader(format!(
                            "{name} contains {other:?}"
                        ))),
                    })
                    .collect(),
                Some(other) => Err(DecodeError::InvalidHeader(format!(
                    "{name} is {other:?}"
                ))),
            }
        };

        let entity_name = string("entityName");
        if entity_name.is_empty() {
            return Err(DecodeError::InvalidHeader("missing entityName".into()));
        }
        let change_type = match field("changeType") {
            Some(Value::String(s) | Value::Enum(_, s)) => ChangeType::from(s.as_str()),
            _ => return Err(DecodeError::InvalidHeader("missing changeType".into())),
        };

        Ok(Self {
            entity_name,
            record_ids: strings("recordIds")?,
            change_type,
            change_origin: string("changeOrigin"),
            transaction_key: string("transactionKey"),
            sequence_number: long("sequenceNumber"),
            commit_timestamp: long("commitTimestamp"),
            commit_number: long("commitNumber"),
            commit_user: string("commitUser"),
            nulled_fields: strings("nulledFields")?,
            diff_fields: strings("diffFields")?,
            changed_fields: strings("changedFields")?,
        })
    }
}
