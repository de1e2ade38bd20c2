//! Decoded change events.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use apache_avro::Schema;
use futures::{Stream, StreamExt};
use serde_json::{Value as JsonValue, json};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    bitmap::{BitmapDecoder, BitmapError},
    decode::{ChangeEventHeader, DecodeError, DecodedEvent},
    schema::{SchemaCache, SchemaError, SchemaSource},
    subscription::{Subscription, SubscriptionError},
    types::{ConsumerEvent, ReplayId, TopicName},
};

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("event {replay_id}: {source}")]
    Schema {
        replay_id: ReplayId,
        source: SchemaError,
    },
    #[error("event {replay_id}: {source}")]
    Decode {
        replay_id: ReplayId,
        source: DecodeError,
    },
    #[error("event {replay_id}: {source}")]
    Bitmap {
        replay_id: ReplayId,
        source: BitmapError,
    },
}

impl EventError {
    /// Replay id of the event that failed, if the error concerns a single
    /// event.
    pub fn replay_id(&self) -> Option<&ReplayId> {
        match self {
            Self::Subscription(_) => None,
            Self::Schema { replay_id, .. }
            | Self::Decode { replay_id, .. }
            | Self::Bitmap { replay_id, .. } => Some(replay_id),
        }
    }
}

/// A decoded event with its field-level change information resolved to
/// field names.
///
/// Events without a `ChangeEventHeader`, such as platform events, have no
/// header and empty field lists.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub replay_id: ReplayId,
    pub schema_id: String,
    pub event_id: String,
    pub header: Option<ChangeEventHeader>,
    pub changed_fields: Vec<String>,
    pub nulled_fields: Vec<String>,
    pub diff_fields: Vec<String>,
    pub payload: DecodedEvent,
}

impl ChangeEvent {
    pub fn decode(
        event: &ConsumerEvent,
        schema: &Schema,
        bitmaps: &BitmapDecoder,
    ) -> Result<Self, EventError> {
        let decode_err = |source: DecodeError| EventError::Decode {
            replay_id: event.replay_id.clone(),
            source,
        };
        let bitmap_err = |source: BitmapError| EventError::Bitmap {
            replay_id: event.replay_id.clone(),
            source,
        };

        let payload = DecodedEvent::decode(schema, &event.payload).map_err(decode_err)?;
        let header = match payload.header() {
            Ok(header) => Some(header),
            Err(DecodeError::MissingHeader) => None,
            Err(err) => return Err(decode_err(err)),
        };

        let (changed_fields, nulled_fields, diff_fields) = match &header {
            Some(header) => (
                bitmaps.decode(&header.changed_fields).map_err(bitmap_err)?,
                bitmaps.decode(&header.nulled_fields).map_err(bitmap_err)?,
                bitmaps.decode(&header.diff_fields).map_err(bitmap_err)?,
            ),
            None => Default::default(),
        };

        Ok(Self {
            replay_id: event.replay_id.clone(),
            schema_id: event.schema_id.clone(),
            event_id: event.id.clone(),
            header,
            changed_fields,
            nulled_fields,
            diff_fields,
            payload,
        })
    }

    pub fn to_json(&self) -> Result<JsonValue, DecodeError> {
        let header = self.header.as_ref().map(|header| {
            json!({
                "entityName": header.entity_name,
                "recordIds": header.record_ids,
                "changeType": header.change_type.as_str(),
                "changeOrigin": header.change_origin,
                "transactionKey": header.transaction_key,
                "sequenceNumber": header.sequence_number,
                "commitTimestamp": header.commit_timestamp,
                "commitNumber": header.commit_number,
                "commitUser": header.commit_user,
            })
        });
        Ok(json!({
            "replayId": self.replay_id.to_string(),
            "schemaId": self.schema_id,
            "eventId": self.event_id,
            "header": header,
            "changedFields": self.changed_fields,
            "nulledFields": self.nulled_fields,
            "diffFields": self.diff_fields,
            "payload": self.payload.to_json()?,
        }))
    }
}

type Streaming = Pin<Box<dyn Send + Stream<Item = Result<ChangeEvent, EventError>>>>;

/// Stream of decoded change events for one subscription.
///
/// Errors for a single event are yielded without ending the stream. The
/// stream ends once the underlying subscription does.
pub struct ChangeEventStream {
    topic: TopicName,
    checkpoint: watch::Receiver<Option<ReplayId>>,
    inner: Streaming,
}

impl ChangeEventStream {
    /// Keepalives only advance [`last_replay_id`](Self::last_replay_id) when
    /// the subscription yields them.
    pub fn new<S: SchemaSource + 'static>(
        subscription: Subscription,
        schemas: SchemaCache<S>,
    ) -> Self {
        let topic = subscription.topic().clone();
        let (checkpoint_tx, checkpoint) = watch::channel(subscription.last_replay_id());
        Self {
            topic,
            checkpoint,
            inner: Box::pin(change_event_stream(subscription, schemas, checkpoint_tx)),
        }
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    /// Replay id of the last event handed out, successfully decoded or not.
    pub fn last_replay_id(&self) -> Option<ReplayId> {
        self.checkpoint.borrow().clone()
    }
}

impl Stream for ChangeEventStream {
    type Item = Result<ChangeEvent, EventError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

fn change_event_stream<S: SchemaSource + 'static>(
    mut subscription: Subscription,
    schemas: SchemaCache<S>,
    checkpoint: watch::Sender<Option<ReplayId>>,
) -> impl Send + Stream<Item = Result<ChangeEvent, EventError>> {
    async_stream::stream! {
        let mut bitmaps: HashMap<String, Arc<BitmapDecoder>> = HashMap::new();

        while let Some(batch) = subscription.next().await {
            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    yield Err(EventError::from(err));
                    continue;
                }
            };
            if batch.is_keepalive() {
                if batch.latest_replay_id.is_some() {
                    checkpoint.send_replace(batch.latest_replay_id);
                }
                continue;
            }

            for event in batch.events {
                let result = match schemas.get(&event.schema_id).await {
                    Ok(schema) => decode_event(&event, &schema, &mut bitmaps),
                    Err(source) => Err(EventError::Schema {
                        replay_id: event.replay_id.clone(),
                        source,
                    }),
                };
                if let Err(err) = &result {
                    warn!(%err, event_id = %event.id, "failed to decode event");
                }
                checkpoint.send_replace(Some(event.replay_id));
                yield result;
            }
        }
    }
}

fn decode_event(
    event: &ConsumerEvent,
    schema: &Schema,
    bitmaps: &mut HashMap<String, Arc<BitmapDecoder>>,
) -> Result<ChangeEvent, EventError> {
    let decoder = match bitmaps.get(&event.schema_id) {
        Some(decoder) => decoder.clone(),
        None => {
            let decoder = BitmapDecoder::new(schema).map_err(|source| EventError::Bitmap {
                replay_id: event.replay_id.clone(),
                source,
            })?;
            let decoder = Arc::new(decoder);
            debug!(schema_id = %event.schema_id, "built field bitmap decoder");
            bitmaps.insert(event.schema_id.clone(), decoder.clone());
            decoder
        }
    };
    ChangeEvent::decode(event, schema, &decoder)
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use bytes::Bytes;

    use super::*;
    use crate::{
        api,
        decode::{
            ChangeType,
            tests::{employee_schema, employee_update_payload},
        },
        schema::tests::CountingSource,
        subscription::{
            SubscribeRequest,
            tests::{FakeTransport, Reply, retry},
        },
        types::ReplayStart,
    };

    fn consumer_event(id: u8, schema_id: &str, payload: Vec<u8>) -> api::ConsumerEvent {
        api::ConsumerEvent {
            event: Some(api::ProducerEvent {
                id: format!("e{id}"),
                schema_id: schema_id.into(),
                payload: payload.into(),
                headers: vec![],
            }),
            replay_id: Bytes::from(vec![id]),
        }
    }

    fn batch(events: Vec<api::ConsumerEvent>, pending: i32) -> Reply {
        Reply::Batch(api::FetchResponse {
            events,
            rpc_id: "rpc".into(),
            pending_num_requested: pending,
            ..Default::default()
        })
    }

    fn subscription(sessions: Vec<Vec<Vec<Reply>>>, keepalives: bool) -> Subscription {
        let req = SubscribeRequest::new("/data/Employee__ChangeEvent".parse().unwrap())
            .with_replay_start(ReplayStart::Earliest)
            .with_batch_size(3)
            .with_keepalives(keepalives);
        Subscription::new(FakeTransport::with_sessions(sessions), req, retry())
    }

    #[tokio::test]
    async fn decodes_change_events() {
        let sub = subscription(
            vec![vec![vec![batch(
                vec![
                    consumer_event(1, "schema-a", employee_update_payload()),
                    consumer_event(2, "schema-a", employee_update_payload()),
                ],
                1,
            )]]],
            false,
        );
        let mut events = ChangeEventStream::new(sub, SchemaCache::new(CountingSource::default()));

        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.event_id, "e1");
        assert_eq!(first.schema_id, "schema-a");
        assert_eq!(events.last_replay_id().unwrap().as_bytes(), &[1]);

        let header = first.header.as_ref().unwrap();
        assert_eq!(header.change_type, ChangeType::Update);
        assert_eq!(first.changed_fields, ["Name", "LastModifiedDate", "Address__c.City"]);
        assert_eq!(first.nulled_fields, ["First_Name__c"]);
        assert!(first.diff_fields.is_empty());
        assert_eq!(first.payload.get_str("Name"), Some("E-0042"));

        let json = first.to_json().unwrap();
        assert_eq!(json["replayId"], "01");
        assert_eq!(json["header"]["changeType"], "UPDATE");
        assert_eq!(json["payload"]["Address__c"]["City"], "Lisbon");

        let second = events.next().await.unwrap().unwrap();
        assert_eq!(second.event_id, "e2");
        assert_eq!(events.last_replay_id().unwrap().as_bytes(), &[2]);
    }

    #[tokio::test]
    async fn fetches_each_schema_once() {
        let sub = subscription(
            vec![vec![
                vec![batch(
                    vec![
                        consumer_event(1, "schema-a", employee_update_payload()),
                        consumer_event(2, "schema-b", employee_update_payload()),
                    ],
                    1,
                )],
                vec![],
            ]],
            false,
        );
        let source = Arc::new(CountingSource::default());
        let mut events = ChangeEventStream::new(sub, SchemaCache::new(source.clone()));

        for _ in 0..2 {
            events.next().await.unwrap().unwrap();
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn decode_failures_do_not_end_the_stream() {
        let sub = subscription(
            vec![vec![vec![batch(
                vec![
                    consumer_event(1, "schema-a", vec![0xff, 0xff]),
                    consumer_event(2, "broken", employee_update_payload()),
                    consumer_event(3, "schema-a", employee_update_payload()),
                ],
                0,
            )]]],
            false,
        );
        let mut events = ChangeEventStream::new(sub, SchemaCache::new(CountingSource::default()));

        let err = events.next().await.unwrap().unwrap_err();
        assert!(matches!(err, EventError::Decode { .. }));
        assert_eq!(err.replay_id().unwrap().as_bytes(), &[1]);

        let err = events.next().await.unwrap().unwrap_err();
        assert!(matches!(err, EventError::Schema { .. }));

        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.event_id, "e3");
        assert_eq!(events.last_replay_id().unwrap().as_bytes(), &[3]);
    }

    #[tokio::test]
    async fn events_without_header_have_no_field_lists() {
        let schema = Schema::parse_str(
            r#"{"type": "record", "name": "Order_Shipped__e", "fields": [
                {"name": "OrderNumber__c", "type": ["null", "string"]}
            ]}"#,
        )
        .unwrap();
        let payload = apache_avro::to_avro_datum(
            &schema,
            apache_avro::types::Value::Record(vec![(
                "OrderNumber__c".into(),
                apache_avro::types::Value::Union(
                    1,
                    Box::new(apache_avro::types::Value::String("O-1".into())),
                ),
            )]),
        )
        .unwrap();
        let event = ConsumerEvent {
            id: "e1".into(),
            schema_id: "schema-e".into(),
            payload: payload.into(),
            headers: vec![],
            replay_id: ReplayId::new(vec![1]).unwrap(),
        };

        let decoded =
            ChangeEvent::decode(&event, &schema, &BitmapDecoder::new(&schema).unwrap()).unwrap();
        assert!(decoded.header.is_none());
        assert!(decoded.changed_fields.is_empty());
        assert_eq!(decoded.payload.get_str("OrderNumber__c"), Some("O-1"));
        assert_eq!(decoded.to_json().unwrap()["header"], JsonValue::Null);
    }

    #[tokio::test]
    async fn keepalives_advance_the_checkpoint() {
        let sub = subscription(
            vec![vec![vec![Reply::Batch(api::FetchResponse {
                latest_replay_id: Bytes::from_static(&[9]),
                pending_num_requested: 3,
                ..Default::default()
            })]]],
            true,
        );
        let mut events = ChangeEventStream::new(sub, SchemaCache::new(CountingSource::default()));
        assert_eq!(events.last_replay_id(), None);

        let next = tokio::time::timeout(Duration::from_millis(50), events.next()).await;
        assert!(next.is_err());
        assert_eq!(events.last_replay_id().unwrap().as_bytes(), &[9]);
    }

    #[test]
    fn bitmap_decoders_are_reused() {
        let schema = employee_schema();
        let mut bitmaps = HashMap::new();
        let event = ConsumerEvent {
            id: "e1".into(),
            schema_id: "schema-a".into(),
            payload: employee_update_payload().into(),
            headers: vec![],
            replay_id: ReplayId::new(vec![1]).unwrap(),
        };

        decode_event(&event, &schema, &mut bitmaps).unwrap();
        let decoder = bitmaps["schema-a"].clone();
        decode_event(&event, &schema, &mut bitmaps).unwrap();

        assert_eq!(bitmaps.len(), 1);
        assert!(Arc::ptr_eq(&decoder, &bitmaps["schema-a"]));
    }
}
