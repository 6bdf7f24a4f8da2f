//! Remote segment storage
//!
//! The pipeline talks to its object store through the synchronous
//! [`RemoteStore`] trait: the upload cycle runs on its own thread and query
//! callers run on blocking threads, so a blocking seam keeps the core free of
//! an async runtime. [`object::ObjectStoreRemote`] adapts any `object_store`
//! backend (S3, local filesystem, in-memory) by driving it on a tokio runtime
//! handle; [`MemoryStore`] is a plain map for tests and embedding.
//!
//! The store is built once at startup and injected into the pipeline.

pub mod object;

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use parking_lot::RwLock;

pub use object::{build_remote, ObjectStoreRemote};

/// Errors raised by a remote store
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The `object_store` backend failed
    #[error("object store: {0}")]
    Backend(#[from] object_store::Error),

    /// Any other backend failure
    #[error("{0}")]
    Other(String),
}

/// Blocking key/value access to the remote object store
///
/// `put` must overwrite: uploads are retried and rely on a repeated put of
/// the same key being harmless.
pub trait RemoteStore: Send + Sync + fmt::Debug {
    /// Store `body` under `key`, replacing any previous object
    fn put(&self, key: &str, body: Bytes) -> Result<(), RemoteError>;

    /// Fetch the object under `key`, or `None` if it does not exist
    fn get(&self, key: &str) -> Result<Option<Bytes>, RemoteError>;

    /// Every key starting with `prefix`, in no particular order
    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError>;

    /// Human-readable backend name for logs
    fn name(&self) -> &str;
}

/// Remote store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the store holds no objects
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl RemoteStore for MemoryStore {
    fn put(&self, key: &str, body: Bytes) -> Result<(), RemoteError> {
        self.objects.write().insert(key.to_string(), body);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>, RemoteError> {
        Ok(self.objects.read().get(key).cloned())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
