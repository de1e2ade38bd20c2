//! Types relevant to [`Client`](crate::client::Client) and
//! [`Subscription`](crate::subscription::Subscription).

use std::{fmt, ops::Deref, str::FromStr, sync::LazyLock};

use bytes::Bytes;
use regex::Regex;

use crate::api;

static TOPIC_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/(data|event)/[A-Za-z0-9_]+$").expect("topic name regex should be valid")
});

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ConvertError(String);

impl<T: Into<String>> From<T> for ConvertError {
    fn from(value: T) -> Self {
        Self(value.into())
    }
}

/// Name of a Pub/Sub topic.
///
/// Change data capture channels live under `/data/` (for example
/// `/data/AccountChangeEvent` or `/data/ChangeEvents`) and platform events
/// under `/event/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicName(String);

impl TopicName {
    pub fn new(name: impl Into<String>) -> Result<Self, ConvertError> {
        let name = name.into();
        if TOPIC_NAME_REGEX.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(format!("invalid topic name: {name:?}").into())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the topic carries change data capture events.
    pub fn is_change_data_capture(&self) -> bool {
        self.0.starts_with("/data/")
    }
}

impl FromStr for TopicName {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for TopicName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<TopicName> for String {
    fn from(value: TopicName) -> Self {
        value.0
    }
}

/// Opaque position of an event in a topic's retention window.
///
/// Rendered and parsed as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ReplayId(Bytes);

impl ReplayId {
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self, ConvertError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err("replay id cannot be empty".into());
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn from_api(bytes: Bytes) -> Option<Self> {
        (!bytes.is_empty()).then_some(Self(bytes))
    }
}

impl fmt::Debug for ReplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplayId({self})")
    }
}

impl fmt::Display for ReplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl FromStr for ReplayId {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid replay id {s:?}: {e}"))?;
        Self::new(bytes)
    }
}

impl From<ReplayId> for Bytes {
    fn from(value: ReplayId) -> Self {
        value.0
    }
}

/// Where a subscription starts reading from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReplayStart {
    /// Only events published after the subscription is established.
    #[default]
    Latest,
    /// The oldest event still retained.
    Earliest,
    /// The event right after the given replay id.
    Custom(ReplayId),
}

impl ReplayStart {
    /// Resume after a stored checkpoint when there is one.
    pub fn resume_or(stored: Option<ReplayId>, fallback: ReplayStart) -> Self {
        stored.map(Self::Custom).unwrap_or(fallback)
    }

    pub(crate) fn into_api_parts(self) -> (api::ReplayPreset, Bytes) {
        match self {
            Self::Latest => (api::ReplayPreset::Latest, Bytes::new()),
            Self::Earliest => (api::ReplayPreset::Earliest, Bytes::new()),
            Self::Custom(replay_id) => (api::ReplayPreset::Custom, replay_id.into()),
        }
    }
}

/// Topic metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub topic_name: String,
    pub tenant_guid: String,
    pub can_publish: bool,
    pub can_subscribe: bool,
    /// Schema id of the latest schema version for the topic.
    pub schema_id: String,
}

impl From<api::TopicInfo> for TopicInfo {
    fn from(value: api::TopicInfo) -> Self {
        let api::TopicInfo {
            topic_name,
            tenant_guid,
            can_publish,
            can_subscribe,
            schema_id,
            rpc_id: _,
        } = value;
        Self {
            topic_name,
            tenant_guid,
            can_publish,
            can_subscribe,
            schema_id,
        }
    }
}

/// Avro schema definition for a schema id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaInfo {
    pub schema_id: String,
    pub schema_json: String,
}

impl TryFrom<api::SchemaInfo> for SchemaInfo {
    type Error = ConvertError;

    fn try_from(value: api::SchemaInfo) -> Result<Self, Self::Error> {
        let api::SchemaInfo {
            schema_json,
            schema_id,
            rpc_id: _,
        } = value;
        if schema_json.is_empty() {
            return Err(format!("schema {schema_id:?} has an empty definition").into());
        }
        Ok(Self {
            schema_id,
            schema_json,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub key: String,
    pub value: Bytes,
}

impl From<api::EventHeader> for EventHeader {
    fn from(value: api::EventHeader) -> Self {
        Self {
            key: value.key,
            value: value.value,
        }
    }
}

/// An event delivered by a subscription, still Avro encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerEvent {
    pub id: String,
    pub schema_id: String,
    pub payload: Bytes,
    pub headers: Vec<EventHeader>,
    pub replay_id: ReplayId,
}

impl TryFrom<api::ConsumerEvent> for ConsumerEvent {
    type Error = ConvertError;

    fn try_from(value: api::ConsumerEvent) -> Result<Self, Self::Error> {
        let api::ConsumerEvent { event, replay_id } = value;
        let event = event.ok_or("consumer event is missing its event body")?;
        let replay_id = ReplayId::from_api(replay_id)
            .ok_or_else(|| format!("event {:?} is missing its replay id", event.id))?;
        Ok(Self {
            id: event.id,
            schema_id: event.schema_id,
            payload: event.payload,
            headers: event.headers.into_iter().map(Into::into).collect(),
            replay_id,
        })
    }
}

/// One response of a subscription.
///
/// A batch without events is a keepalive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchBatch {
    pub events: Vec<ConsumerEvent>,
    /// Replay id of the latest event the server has processed for this
    /// subscription, present on keepalives as well.
    pub latest_replay_id: Option<ReplayId>,
    /// Number of events still owed for the outstanding fetch requests.
    pub pending_num_requested: usize,
    pub rpc_id: String,
}

impl FetchBatch {
    pub fn is_keepalive(&self) -> bool {
        self.events.is_empty()
    }
}

impl TryFrom<api::FetchResponse> for FetchBatch {
    type Error = ConvertError;

    fn try_from(value: api::FetchResponse) -> Result<Self, Self::Error> {
        let api::FetchResponse {
            events,
            latest_replay_id,
            rpc_id,
            pending_num_requested,
        } = value;
        let events = events
            .into_iter()
            .map(ConsumerEvent::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let pending_num_requested = usize::try_from(pending_num_requested)
            .map_err(|_| format!("negative pending count: {pending_num_requested}"))?;
        Ok(Self {
            events,
            latest_replay_id: ReplayId::from_api(latest_replay_id),
            pending_num_requested,
            rpc_id,
        })
    }
}
