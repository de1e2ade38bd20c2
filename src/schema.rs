//! Cache of parsed Avro schemas keyed by schema id.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use apache_avro::Schema;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::{client::ClientError, types::SchemaInfo};

/// Where schema definitions are fetched from.
pub trait SchemaSource: Send + Sync {
    fn fetch_schema(
        &self,
        schema_id: &str,
    ) -> impl Future<Output = Result<SchemaInfo, ClientError>> + Send;
}

impl<S: SchemaSource> SchemaSource for Arc<S> {
    fn fetch_schema(
        &self,
        schema_id: &str,
    ) -> impl Future<Output = Result<SchemaInfo, ClientError>> + Send {
        (**self).fetch_schema(schema_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("fetching schema {schema_id}: {source}")]
    Fetch {
        schema_id: String,
        source: ClientError,
    },
    #[error("parsing schema {schema_id}: {source}")]
    Parse {
        schema_id: String,
        source: apache_avro::Error,
    },
}

type Entry = Arc<OnceCell<Arc<Schema>>>;

/// Parsed schemas, fetched at most once per schema id.
///
/// Concurrent lookups of a missing id share a single fetch. Failed fetches
/// are not cached, so the next lookup tries again.
#[derive(Debug)]
pub struct SchemaCache<S> {
    source: S,
    entries: Mutex<HashMap<String, Entry>>,
}

impl<S: SchemaSource> SchemaCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, schema_id: &str) -> Result<Arc<Schema>, SchemaError> {
        let entry = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(schema_id.to_owned())
            .or_default()
            .clone();

        let result = entry
            .get_or_try_init(|| self.fetch(schema_id))
            .await
            .cloned();
        if result.is_err() {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if entries
                .get(schema_id)
                .is_some_and(|current| Arc::ptr_eq(current, &entry) && !current.initialized())
            {
                entries.remove(schema_id);
            }
        }
        result
    }

    async fn fetch(&self, schema_id: &str) -> Result<Arc<Schema>, SchemaError> {
        let info = self
            .source
            .fetch_schema(schema_id)
            .await
            .map_err(|source| SchemaError::Fetch {
                schema_id: schema_id.to_owned(),
                source,
            })?;
        if info.schema_id != schema_id {
            warn!(
                requested = schema_id,
                returned = %info.schema_id,
                "schema id mismatch"
            );
        }

        let schema = Schema::parse_str(&info.schema_json).map_err(|source| SchemaError::Parse {
            schema_id: schema_id.to_owned(),
            source,
        })?;
        debug!(schema_id, "cached schema");
        Ok(Arc::new(schema))
    }

    /// Whether a parsed schema is cached for the id.
    pub fn contains(&self, schema_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(schema_id)
            .is_some_and(|entry| entry.initialized())
    }

    /// Number of cached schemas.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn invalidate(&self, schema_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(schema_id);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
