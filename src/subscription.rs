//! Flow-controlled, self-resuming subscriptions.
//!
//! A subscription never has more than `batch_size` events outstanding. A new
//! fetch request is only sent once the server owes nothing for the previous
//! ones *and* the caller has pulled every batch delivered so far, so a slow
//! consumer is never handed more than it asked for.
//!
//! On transient failures the subscription reconnects and resumes right after
//! the last event it delivered.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{Stream, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    time::timeout,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::{
    api,
    client::ClientError,
    retry::{RetryBackoff, RetryBackoffBuilder},
    types::{FetchBatch, ReplayId, ReplayStart, TopicName},
};

/// Upper bound on `num_requested` accepted by the server.
pub const MAX_BATCH_SIZE: usize = 100;

const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(300);
const REQUEST_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub topic: TopicName,
    pub replay_start: ReplayStart,
    /// Requested events per fetch. Values outside `1..=100` are clamped.
    pub batch_size: usize,
    /// Longest silence tolerated from the server before reconnecting. The
    /// server sends keepalives every 270 seconds.
    pub heartbeat_timeout: Duration,
    /// Also yield batches without events.
    pub yield_keepalives: bool,
}

impl SubscribeRequest {
    pub fn new(topic: TopicName) -> Self {
        Self {
            topic,
            replay_start: ReplayStart::default(),
            batch_size: MAX_BATCH_SIZE,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            yield_keepalives: false,
        }
    }

    pub fn with_replay_start(self, replay_start: ReplayStart) -> Self {
        Self {
            replay_start,
            ..self
        }
    }

    /// Maximum number of events outstanding at any time.
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        assert!(
            batch_size > 0 && batch_size <= MAX_BATCH_SIZE,
            "Batch size must be between 1 and 100"
        );
        Self { batch_size, ..self }
    }

    pub fn with_heartbeat_timeout(self, heartbeat_timeout: Duration) -> Self {
        Self {
            heartbeat_timeout,
            ..self
        }
    }

    pub fn with_keepalives(self, yield_keepalives: bool) -> Self {
        Self {
            yield_keepalives,
            ..self
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("no response within heartbeat timeout")]
    HeartbeatTimeout,
    #[error("subscription closed by server")]
    Closed,
}

impl SubscriptionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Client(err) => err.is_retryable(),
            Self::HeartbeatTimeout | Self::Closed => true,
        }
    }
}

pub(crate) type FetchResponses =
    Pin<Box<dyn Send + Stream<Item = Result<api::FetchResponse, ClientError>>>>;

/// Opens one `Subscribe` stream.
pub(crate) trait FetchTransport: Send + Sync + 'static {
    fn open(
        &self,
        requests: ReceiverStream<api::FetchRequest>,
    ) -> impl Future<Output = Result<FetchResponses, ClientError>> + Send;
}

type Streaming<R> = Pin<Box<dyn Send + Stream<Item = Result<R, SubscriptionError>>>>;

/// Stream of fetched batches for one topic.
///
/// Ends after yielding the first error that cannot be retried.
pub struct Subscription {
    topic: TopicName,
    checkpoint: watch::Receiver<Option<ReplayId>>,
    inner: Streaming<FetchBatch>,
}

impl Subscription {
    pub(crate) fn new<T: FetchTransport>(
        transport: T,
        req: SubscribeRequest,
        retry: RetryBackoffBuilder,
    ) -> Self {
        let initial = match &req.replay_start {
            ReplayStart::Custom(replay_id) => Some(replay_id.clone()),
            ReplayStart::Latest | ReplayStart::Earliest => None,
        };
        let (checkpoint_tx, checkpoint) = watch::channel(initial);
        Self {
            topic: req.topic.clone(),
            checkpoint,
            inner: Box::pin(subscription_stream(transport, req, retry, checkpoint_tx)),
        }
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    /// Replay id of the last event handed to the caller, or of the latest
    /// keepalive when it is newer.
    ///
    /// Persist it once the delivered events are processed to resume from
    /// there later.
    pub fn last_replay_id(&self) -> Option<ReplayId> {
        self.checkpoint.borrow().clone()
    }
}

impl Stream for Subscription {
    type Item = Result<FetchBatch, SubscriptionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

fn subscription_stream<T: FetchTransport>(
    transport: T,
    req: SubscribeRequest,
    retry: RetryBackoffBuilder,
    checkpoint: watch::Sender<Option<ReplayId>>,
) -> impl Send + Stream<Item = Result<FetchBatch, SubscriptionError>> {
    async_stream::stream! {
        let mut backoffs = retry.build();
        let mut reconnects: u64 = 0;

        'session: loop {
            let replay_start =
                ReplayStart::resume_or(checkpoint.borrow().clone(), req.replay_start.clone());
            let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);

            let mut responses = match transport.open(ReceiverStream::new(request_rx)).await {
                Ok(responses) => responses,
                Err(err) => {
                    let err = SubscriptionError::from(err);
                    if can_retry(&err, &mut backoffs).await {
                        reconnects += 1;
                        continue;
                    }
                    yield Err(err);
                    break;
                }
            };
            info!(topic = %req.topic, ?replay_start, reconnects, "subscribed");

            let mut flow = FlowControl::new(req.batch_size);
            let mut first_request = Some(replay_start);

            let err = loop {
                if let Some(num_requested) = flow.next_request() {
                    let fetch = fetch_request(&req.topic, first_request.take(), num_requested);
                    if request_tx.send(fetch).await.is_err() {
                        break SubscriptionError::Closed;
                    }
                }

                match timeout(req.heartbeat_timeout, responses.next()).await {
                    Ok(Some(Ok(resp))) => {
                        let batch = match FetchBatch::try_from(resp) {
                            Ok(batch) => batch,
                            Err(err) => {
                                yield Err(SubscriptionError::from(ClientError::from(err)));
                                break 'session;
                            }
                        };
                        flow.on_response(&batch);
                        if backoffs.attempts_used() > 0 {
                            backoffs.reset();
                        }

                        let delivered = batch
                            .events
                            .last()
                            .map(|event| event.replay_id.clone())
                            .or_else(|| batch.latest_replay_id.clone());
                        if delivered.is_some() {
                            checkpoint.send_replace(delivered);
                        }

                        if batch.is_keepalive() {
                            debug!(
                                topic = %req.topic,
                                pending = batch.pending_num_requested,
                                "keepalive"
                            );
                            if !req.yield_keepalives {
                                continue;
                            }
                        }
                        yield Ok(batch);
                    }
                    Ok(Some(Err(err))) => break err.into(),
                    Ok(None) => break SubscriptionError::Closed,
                    Err(_) => break SubscriptionError::HeartbeatTimeout,
                }
            };

            if can_retry(&err, &mut backoffs).await {
                reconnects += 1;
                continue;
            }
            yield Err(err);
            break;
        }
    }
}

fn fetch_request(
    topic: &TopicName,
    replay_start: Option<ReplayStart>,
    num_requested: usize,
) -> api::FetchRequest {
    let mut fetch = api::FetchRequest {
        topic_name: topic.to_string(),
        num_requested: num_requested.min(MAX_BATCH_SIZE) as i32,
        ..Default::default()
    };
    if let Some(replay_start) = replay_start {
        let (preset, replay_id) = replay_start.into_api_parts();
        fetch.replay_preset = preset as i32;
        fetch.replay_id = replay_id;
    }
    fetch
}

/// Tracks events requested from the server but not yet received.
#[derive(Debug)]
struct FlowControl {
    batch_size: usize,
    pending: usize,
}

impl FlowControl {
    fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
            pending: 0,
        }
    }

    /// Number of events to request, when a new fetch request is due.
    fn next_request(&mut self) -> Option<usize> {
        if self.pending > 0 {
            return None;
        }
        self.pending = self.batch_size;
        Some(self.batch_size)
    }

    fn on_response(&mut self, batch: &FetchBatch) {
        let expected = self.pending.saturating_sub(batch.events.len());
        if batch.pending_num_requested != expected {
            debug!(
                expected,
                reported = batch.pending_num_requested,
                "server pending count differs"
            );
        }
        // The server's count is authoritative but never exceeds what was asked.
        self.pending = batch.pending_num_requested.min(self.batch_size);
    }
}

async fn can_retry(err: &SubscriptionError, backoffs: &mut RetryBackoff) -> bool {
    if err.is_retryable()
        && let Some(backoff) = backoffs.next()
    {
        debug!(
            %err,
            ?backoff,
            num_retries_remaining = backoffs.remaining(),
            "retrying subscription"
        );
        tokio::time::sleep(backoff).await;
        true
    } else {
        debug!(
            %err,
            is_retryable = err.is_retryable(),
            retries_exhausted = backoffs.is_exhausted(),
            "not retrying subscription"
        );
        false
    }
}
