use prost_types::method_options::IdempotencyLevel;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{IntoRequest, transport::Channel};

use super::ServiceRequest;
use crate::{
    api::{self, pub_sub_client::PubSubClient},
    types::{self, ConvertError, TopicName},
};

#[derive(Debug, Clone)]
pub struct GetTopicServiceRequest {
    client: PubSubClient<Channel>,
    topic: TopicName,
}

impl GetTopicServiceRequest {
    pub fn new(client: PubSubClient<Channel>, topic: TopicName) -> Self {
        Self { client, topic }
    }
}

impl ServiceRequest for GetTopicServiceRequest {
    type ApiRequest = api::TopicRequest;
    type Response = types::TopicInfo;
    type ApiResponse = api::TopicInfo;

    const IDEMPOTENCY_LEVEL: IdempotencyLevel = IdempotencyLevel::NoSideEffects;

    fn prepare_request(&mut self) -> Result<tonic::Request<Self::ApiRequest>, ConvertError> {
        let req = api::TopicRequest {
            topic_name: self.topic.to_string(),
        };
        Ok(req.into_request())
    }

    fn parse_response(
        &self,
        resp: tonic::Response<Self::ApiResponse>,
    ) -> Result<Self::Response, ConvertError> {
        Ok(resp.into_inner().into())
    }

    async fn send(
        &mut self,
        req: tonic::Request<Self::ApiRequest>,
    ) -> Result<tonic::Response<Self::ApiResponse>, tonic::Status> {
        self.client.get_topic(req).await
    }
}

#[derive(Debug, Clone)]
pub struct GetSchemaServiceRequest {
    client: PubSubClient<Channel>,
    schema_id: String,
}

impl GetSchemaServiceRequest {
    pub fn new(client: PubSubClient<Channel>, schema_id: impl Into<String>) -> Self {
        Self {
            client,
            schema_id: schema_id.into(),
        }
    }
}

impl ServiceRequest for GetSchemaServiceRequest {
    type ApiRequest = api::SchemaRequest;
    type Response = types::SchemaInfo;
    type ApiResponse = api::SchemaInfo;

    const IDEMPOTENCY_LEVEL: IdempotencyLevel = IdempotencyLevel::NoSideEffects;

    fn prepare_request(&mut self) -> Result<tonic::Request<Self::ApiRequest>, ConvertError> {
        if self.schema_id.is_empty() {
            return Err("schema id cannot be empty".into());
        }
        let req = api::SchemaRequest {
            schema_id: self.schema_id.clone(),
        };
        Ok(req.into_request())
    }

    fn parse_response(
        &self,
        resp: tonic::Response<Self::ApiResponse>,
    ) -> Result<Self::Response, ConvertError> {
        resp.into_inner().try_into()
    }

    async fn send(
        &mut self,
        req: tonic::Request<Self::ApiRequest>,
    ) -> Result<tonic::Response<Self::ApiResponse>, tonic::Status> {
        self.client.get_schema(req).await
    }
}

/// Opens the bidirectional `Subscribe` stream.
///
/// Fetch requests are fed through `requests`; the request can only be
/// prepared once.
#[derive(Debug)]
pub struct SubscribeServiceRequest {
    client: PubSubClient<Channel>,
    requests: Option<ReceiverStream<api::FetchRequest>>,
}

impl SubscribeServiceRequest {
    pub fn new(
        client: PubSubClient<Channel>,
        requests: ReceiverStream<api::FetchRequest>,
    ) -> Self {
        Self {
            client,
            requests: Some(requests),
        }
    }
}

impl ServiceRequest for SubscribeServiceRequest {
    type ApiRequest = ReceiverStream<api::FetchRequest>;
    type Response = tonic::Streaming<api::FetchResponse>;
    type ApiResponse = tonic::Streaming<api::FetchResponse>;

    const IDEMPOTENCY_LEVEL: IdempotencyLevel = IdempotencyLevel::NoSideEffects;

    fn prepare_request(&mut self) -> Result<tonic::Request<Self::ApiRequest>, ConvertError> {
        let requests = self
            .requests
            .take()
            .ok_or("subscribe request stream was already consumed")?;
        Ok(tonic::Request::new(requests))
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
        self.client.subscribe(req).await
    }
}
