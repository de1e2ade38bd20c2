pub mod pubsub;

use std::time::Duration;

use prost_types::method_options::IdempotencyLevel;
use secrecy::ExposeSecret;
use tonic::metadata::{AsciiMetadataValue, MetadataMap};

use crate::{
    auth::Credentials,
    client::{ClientError, RequestError},
    types::ConvertError,
};

const ACCESS_TOKEN_HEADER: &str = "accesstoken";
const INSTANCE_URL_HEADER: &str = "instanceurl";
const TENANT_ID_HEADER: &str = "tenantid";
const ERROR_CODE_HEADER: &str = "error-code";

pub async fn send_request<T: ServiceRequest>(
    mut service: T,
    credentials: &Credentials,
    timeout: Option<Duration>,
) -> Result<T::Response, ClientError> {
    let mut req = service.prepare_request()?;
    add_auth_metadata(req.metadata_mut(), credentials)?;
    if let Some(timeout) = timeout {
        req.set_timeout(timeout);
    }
    match service.send(req).await {
        Ok(resp) => Ok(service.parse_response(resp)?),
        Err(status) => Err(match service.parse_status(&status) {
            Some(err) => ClientError::Request(err),
            None => ClientError::Service(status),
        }),
    }
}

pub trait ServiceRequest {
    /// Request parameters for the generated client.
    type ApiRequest;
    /// Response to be returned to the user.
    type Response;
    /// Response returned by the generated client.
    type ApiResponse;

    /// Idempotency level of the underlying RPC.
    const IDEMPOTENCY_LEVEL: IdempotencyLevel;

    /// Build the request, minus auth metadata.
    fn prepare_request(&mut self) -> Result<tonic::Request<Self::ApiRequest>, ConvertError>;

    fn parse_response(
        &self,
        resp: tonic::Response<Self::ApiResponse>,
    ) -> Result<Self::Response, ConvertError>;

    /// Map a status into a typed error, `None` keeps the raw status.
    fn parse_status(&self, status: &tonic::Status) -> Option<RequestError> {
        parse_status(status)
    }

    async fn send(
        &mut self,
        req: tonic::Request<Self::ApiRequest>,
    ) -> Result<tonic::Response<Self::ApiResponse>, tonic::Status>;

    fn should_retry(&self, err: &ClientError) -> bool {
        Self::IDEMPOTENCY_LEVEL == IdempotencyLevel::NoSideEffects && err.is_retryable()
    }
}

/// Requests that can be replayed as-is.
pub trait RetryableRequest: ServiceRequest + Clone {}

impl<T: ServiceRequest + Clone> RetryableRequest for T {}

pub fn parse_status(status: &tonic::Status) -> Option<RequestError> {
    let message = status_message(status);
    match status.code() {
        tonic::Code::Unauthenticated => Some(RequestError::Unauthenticated(message)),
        tonic::Code::PermissionDenied => Some(RequestError::PermissionDenied(message)),
        tonic::Code::NotFound => Some(RequestError::NotFound(message)),
        tonic::Code::InvalidArgument if error_code(status).is_some_and(is_replay_id_error) => {
            Some(RequestError::InvalidReplayId(message))
        }
        tonic::Code::InvalidArgument => Some(RequestError::InvalidArgument(message)),
        _ => None,
    }
}

fn add_auth_metadata(
    metadata: &mut MetadataMap,
    credentials: &Credentials,
) -> Result<(), ConvertError> {
    fn value(name: &str, value: &str) -> Result<AsciiMetadataValue, ConvertError> {
        AsciiMetadataValue::try_from(value)
            .map_err(|_| format!("{name} is not a valid metadata value").into())
    }

    metadata.insert(
        ACCESS_TOKEN_HEADER,
        value("access token", credentials.access_token.expose_secret())?,
    );
    metadata.insert(
        INSTANCE_URL_HEADER,
        value("instance url", credentials.instance_url.as_str())?,
    );
    metadata.insert(TENANT_ID_HEADER, value("tenant id", &credentials.tenant_id)?);
    Ok(())
}

fn error_code(status: &tonic::Status) -> Option<&str> {
    status
        .metadata()
        .get(ERROR_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
}

fn is_replay_id_error(code: &str) -> bool {
    code.contains("replayid")
}

fn status_message(status: &tonic::Status) -> String {
    match error_code(status) {
        Some(code) => format!("{} ({code})", status.message()),
        None => status.message().to_string(),
    }
}
