//! Client for change data capture streams served over the Salesforce
//! Pub/Sub API.
//!
//! [`Client::subscribe`](client::Client::subscribe) yields raw batches with
//! flow control and automatic resumption. [`Client::change_events`](client::Client::change_events)
//! builds on it to yield decoded [`ChangeEvent`](events::ChangeEvent)s, with
//! schemas fetched once per schema id and changed-field bitmaps resolved to
//! field names.

mod api;
mod service;

pub mod auth;
pub mod bitmap;
pub mod checkpoint;
pub mod client;
pub mod decode;
pub mod events;
pub mod retry;
pub mod schema;
pub mod subscription;
pub mod types;

pub use apache_avro;
pub use futures;
pub use http::uri;
pub use secrecy::SecretString;
