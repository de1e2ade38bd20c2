use std::{env::VarError, fmt::Display, time::Duration};

use backon::Retryable;
use futures::StreamExt;
use http::uri::{Authority, Scheme};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::debug;

use crate::{
    api::{self, pub_sub_client::PubSubClient},
    auth::{Credentials, CredentialsError},
    events::ChangeEventStream,
    retry::RetryBackoffBuilder,
    schema::{SchemaCache, SchemaSource},
    service::{
        RetryableRequest, ServiceRequest,
        pubsub::{GetSchemaServiceRequest, GetTopicServiceRequest, SubscribeServiceRequest},
        send_request,
    },
    subscription::{FetchResponses, FetchTransport, SubscribeRequest, Subscription},
    types::{self, TopicName},
};

const DEFAULT_ENDPOINT: &str = "api.pubsub.salesforce.com:7443";
const ENDPOINT_ENV: &str = "PUBSUB_ENDPOINT";
// Schemas of wide objects exceed the default 4 MiB limit.
const MAX_DECODING_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, thiserror::Error)]
#[error("Invalid {0}: {1}")]
pub struct ParseError(String, String);

impl ParseError {
    fn new(what: impl Into<String>, details: impl Display) -> Self {
        Self(what.into(), details.to_string())
    }
}

/// Client configuration to be used to connect with the Pub/Sub API.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Credentials attached to every call.
    pub credentials: Credentials,
    /// Host and port of the Pub/Sub API.
    pub endpoint: Authority,
    /// URI scheme to use to connect. TLS is used for `https`.
    pub uri_scheme: Scheme,
    /// Timeout for connecting/reconnecting.
    pub connection_timeout: Duration,
    /// Timeout for a particular unary request.
    pub request_timeout: Duration,
    /// User agent to be used for the client.
    pub user_agent: String,
    /// Backoff for retried calls and subscription reconnects.
    pub retry: RetryBackoffBuilder,
}

impl ClientConfig {
    /// Construct a new client configuration with given credentials and other
    /// defaults.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            endpoint: Authority::from_static(DEFAULT_ENDPOINT),
            uri_scheme: Scheme::HTTPS,
            connection_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
            user_agent: "pubsub-cdc-rust".to_string(),
            retry: RetryBackoffBuilder::default(),
        }
    }

    /// Construct from environment variables.
    ///
    /// Credentials are read as described in [`Credentials::from_env`]. The
    /// optional `PUBSUB_ENDPOINT` overrides the default endpoint and may carry
    /// a scheme, e.g. `http://localhost:7443`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::new(Credentials::from_env()?);
        match std::env::var(ENDPOINT_ENV) {
            Ok(value) => {
                let (scheme, endpoint) = parse_endpoint(&value)?;
                Ok(config.with_endpoint(endpoint).with_uri_scheme(scheme))
            }
            Err(VarError::NotPresent) => Ok(config),
            Err(VarError::NotUnicode(value)) => Err(ParseError::new(
                format!("{ENDPOINT_ENV} env var"),
                value.to_string_lossy(),
            )
            .into()),
        }
    }

    /// Construct from an existing configuration with the new endpoint.
    pub fn with_endpoint(self, endpoint: impl Into<Authority>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..self
        }
    }

    /// Construct from an existing configuration with the new URI scheme.
    pub fn with_uri_scheme(self, uri_scheme: impl Into<Scheme>) -> Self {
        Self {
            uri_scheme: uri_scheme.into(),
            ..self
        }
    }

    /// Construct from an existing configuration with the new connection
    /// timeout.
    pub fn with_connection_timeout(self, connection_timeout: impl Into<Duration>) -> Self {
        Self {
            connection_timeout: connection_timeout.into(),
            ..self
        }
    }

    /// Construct from an existing configuration with the new request timeout.
    pub fn with_request_timeout(self, request_timeout: impl Into<Duration>) -> Self {
        Self {
            request_timeout: request_timeout.into(),
            ..self
        }
    }

    /// Construct from an existing configuration with the new user agent.
    pub fn with_user_agent(self, user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            ..self
        }
    }

    /// Construct from an existing configuration with the new retry policy.
    pub fn with_retry(self, retry: RetryBackoffBuilder) -> Self {
        Self { retry, ..self }
    }
}

fn parse_endpoint(s: &str) -> Result<(Scheme, Authority), ParseError> {
    let (scheme, authority) = match s.find("://") {
        Some(idx) => {
            let scheme: Scheme = s[..idx]
                .parse()
                .map_err(|_| ParseError::new("endpoint scheme", &s[..idx]))?;
            (scheme, &s[idx + 3..])
        }
        None => (Scheme::HTTPS, s),
    };
    let authority = authority
        .trim_end_matches('/')
        .parse()
        .map_err(|e| ParseError::new("endpoint authority", e))?;
    Ok((scheme, authority))
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Status codes mapped into typed errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid replay id: {0}")]
    InvalidReplayId(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Conversion(#[from] types::ConvertError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Service(#[from] tonic::Status),
}

impl ClientError {
    pub(crate) fn from_status(status: tonic::Status) -> Self {
        match crate::service::parse_status(&status) {
            Some(err) => Self::Request(err),
            None => Self::Service(status),
        }
    }

    /// Whether the failure is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Service(status) => matches!(
                status.code(),
                tonic::Code::Unavailable
                    | tonic::Code::DeadlineExceeded
                    | tonic::Code::Internal
                    | tonic::Code::ResourceExhausted
                    | tonic::Code::Unknown
            ),
            Self::Conversion(_) | Self::Request(_) => false,
        }
    }
}

/// The client to interact with the Pub/Sub API.
#[derive(Debug, Clone)]
pub struct Client {
    inner: ClientInner,
}

impl Client {
    /// Create the client to connect with the Pub/Sub API.
    ///
    /// The connection is established lazily on first use.
    pub fn new(config: ClientConfig) -> Result<Self, ConnectionError> {
        Ok(Self {
            inner: ClientInner::new(config)?,
        })
    }

    /// Get topic metadata, including the id of its latest schema.
    pub async fn get_topic(&self, topic: TopicName) -> Result<types::TopicInfo, ClientError> {
        self.inner
            .send_retryable(GetTopicServiceRequest::new(
                self.inner.pubsub_client(),
                topic,
            ))
            .await
    }

    /// Get the Avro schema definition for a schema id.
    pub async fn get_schema(
        &self,
        schema_id: impl Into<String>,
    ) -> Result<types::SchemaInfo, ClientError> {
        self.inner
            .send_retryable(GetSchemaServiceRequest::new(
                self.inner.pubsub_client(),
                schema_id,
            ))
            .await
    }

    /// Subscribe to a topic.
    ///
    /// The returned stream connects on first poll, requests events only as
    /// the caller consumes them, and resumes from the last delivered event
    /// after transient failures.
    pub fn subscribe(&self, req: SubscribeRequest) -> Subscription {
        Subscription::new(self.inner.clone(), req, self.inner.config.retry)
    }

    /// Subscribe to a topic and decode every event into a
    /// [`ChangeEvent`](crate::events::ChangeEvent).
    ///
    /// Keepalives are consumed by the returned stream to keep its replay id
    /// current.
    pub fn change_events(&self, req: SubscribeRequest) -> ChangeEventStream {
        let subscription = self.subscribe(req.with_keepalives(true));
        ChangeEventStream::new(subscription, SchemaCache::new(self.clone()))
    }
}

impl SchemaSource for Client {
    async fn fetch_schema(&self, schema_id: &str) -> Result<types::SchemaInfo, ClientError> {
        self.get_schema(schema_id).await
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ClientInner {
    channel: Channel,
    config: ClientConfig,
}

impl ClientInner {
    fn new(config: ClientConfig) -> Result<Self, ConnectionError> {
        let mut endpoint = format!("{}://{}", config.uri_scheme, config.endpoint)
            .parse::<Endpoint>()?
            .user_agent(config.user_agent.clone())?
            .http2_adaptive_window(true)
            .http2_keep_alive_interval(Duration::from_secs(60))
            .keep_alive_while_idle(true)
            .connect_timeout(config.connection_timeout);

        if config.uri_scheme == Scheme::HTTPS {
            endpoint = endpoint.tls_config(
                ClientTlsConfig::new()
                    .with_webpki_roots()
                    .assume_http2(true),
            )?;
        }

        Ok(Self {
            channel: endpoint.connect_lazy(),
            config,
        })
    }

    async fn send<T: ServiceRequest>(
        &self,
        service_req: T,
        timeout: Option<Duration>,
    ) -> Result<T::Response, ClientError> {
        send_request(service_req, &self.config.credentials, timeout).await
    }

    async fn send_retryable<T: RetryableRequest>(
        &self,
        service_req: T,
    ) -> Result<T::Response, ClientError> {
        let timeout = Some(self.config.request_timeout);
        let retry_fn = || async { self.send(service_req.clone(), timeout).await };

        retry_fn
            .retry(self.config.retry.to_backon())
            .when(|e| service_req.should_retry(e))
            .notify(|err, backoff| debug!(%err, ?backoff, "retrying request"))
            .await
    }

    fn pubsub_client(&self) -> PubSubClient<Channel> {
        PubSubClient::new(self.channel.clone())
            .max_decoding_message_size(MAX_DECODING_MESSAGE_SIZE)
    }
}

impl FetchTransport for ClientInner {
    async fn open(
        &self,
        requests: ReceiverStream<api::FetchRequest>,
    ) -> Result<FetchResponses, ClientError> {
        let responses = self
            .send(
                SubscribeServiceRequest::new(self.pubsub_client(), requests),
                None,
            )
            .await?;
        let responses: FetchResponses =
            Box::pin(responses.map(|item| item.map_err(ClientError::from_status)));
        Ok(responses)
    }
}

/// Error connecting to the Pub/Sub endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    TonicTransportError(#[from] tonic::transport::Error),
    #[error(transparent)]
    UriParseError(#[from] http::uri::InvalidUri),
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use prost_types::method_options::IdempotencyLevel;
    use rstest::rstest;

    use super::*;
    use crate::types::ConvertError;

    /// Fails with `code` for the first `failures` calls, then returns the
    /// number of calls made.
    #[derive(Debug, Clone)]
    struct FlakyRequest {
        calls: Arc<AtomicUsize>,
        failures: usize,
        code: tonic::Code,
    }

    impl FlakyRequest {
        fn new(failures: usize, code: tonic::Code) -> Self {
            Self {
                calls: Default::default(),
                failures,
                code,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ServiceRequest for FlakyRequest {
        type ApiRequest = ();
        type Response = usize;
        type ApiResponse = usize;

        const IDEMPOTENCY_LEVEL: IdempotencyLevel = IdempotencyLevel::NoSideEffects;

        fn prepare_request(&mut self) -> Result<tonic::Request<Self::ApiRequest>, ConvertError> {
            Ok(tonic::Request::new(()))
        }

        fn parse_response(
            &self,
            resp: tonic::Response<Self::ApiResponse>,
        ) -> Result<Self::Response, ConvertError> {
            Ok(resp.into_inner())
        }

        async fn send(
            &mut self,
            req: tonic::Request<Self::ApiRequest>,
        ) -> Result<tonic::Response<Self::ApiResponse>, tonic::Status> {
            assert!(req.metadata().contains_key("accesstoken"));
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::task::yield_now().await;
            if call <= self.failures {
                Err(tonic::Status::new(self.code, "flaky"))
            } else {
                Ok(tonic::Response::new(call))
            }
        }
    }

    fn inner() -> ClientInner {
        let config = ClientConfig::new(Credentials::new(
            "token",
            "https://acme.my.salesforce.com",
            "00D000000000001",
        ))
        .with_endpoint(Authority::from_static("localhost:7443"))
        .with_uri_scheme(Scheme::HTTP)
        .with_retry(
            RetryBackoffBuilder::default()
                .with_min_base_delay(Duration::from_millis(1))
                .with_max_base_delay(Duration::from_millis(1))
                .with_max_retries(3),
        );
        ClientInner::new(config).unwrap()
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let req = FlakyRequest::new(2, tonic::Code::Unavailable);
        assert_eq!(inner().send_retryable(req.clone()).await.unwrap(), 3);
        assert_eq!(req.calls(), 3);

        let req = FlakyRequest::new(10, tonic::Code::Unavailable);
        let err = inner().send_retryable(req.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Service(status) if status.code() == tonic::Code::Unavailable
        ));
        assert_eq!(req.calls(), 4);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let req = FlakyRequest::new(1, tonic::Code::Unauthenticated);
        let err = inner().send_retryable(req.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Request(RequestError::Unauthenticated(_))
        ));
        assert_eq!(req.calls(), 1);
    }

    #[rstest]
    #[case("api.pubsub.salesforce.com:7443", "https", "api.pubsub.salesforce.com:7443")]
    #[case("https://api.pubsub.salesforce.com:7443/", "https", "api.pubsub.salesforce.com:7443")]
    #[case("http://localhost:7443", "http", "localhost:7443")]
    fn endpoint_parsing(#[case] input: &str, #[case] scheme: &str, #[case] authority: &str) {
        let (parsed_scheme, parsed_authority) = parse_endpoint(input).unwrap();
        assert_eq!(parsed_scheme.as_str(), scheme);
        assert_eq!(parsed_authority.as_str(), authority);
    }

    #[test]
    fn endpoint_parsing_rejects_garbage() {
        assert!(parse_endpoint("http://").is_err());
        assert!(parse_endpoint("not an endpoint").is_err());
    }

    #[rstest]
    #[case(tonic::Status::unavailable("down"), true)]
    #[case(tonic::Status::internal("stream reset"), true)]
    #[case(tonic::Status::deadline_exceeded("slow"), true)]
    #[case(tonic::Status::unauthenticated("expired"), false)]
    #[case(tonic::Status::permission_denied("no access"), false)]
    #[case(tonic::Status::invalid_argument("bad"), false)]
    #[case(tonic::Status::aborted("conflict"), false)]
    fn retryable_statuses(#[case] status: tonic::Status, #[case] retryable: bool) {
        assert_eq!(ClientError::from_status(status).is_retryable(), retryable);
    }

    #[tokio::test]
    async fn client_builds_lazily() {
        let config = ClientConfig::new(Credentials::new(
            "token",
            "https://acme.my.salesforce.com",
            "00D000000000001",
        ))
        .with_endpoint(Authority::from_static("localhost:7443"))
        .with_uri_scheme(Scheme::HTTP);

        assert!(Client::new(config).is_ok());
    }
}
