//! `object_store` adapter
//!
//! Wraps an async [`ObjectStore`] behind the blocking [`RemoteStore`] seam by
//! running each call to completion on a tokio runtime handle. Calls must come
//! from threads outside the runtime (the upload daemon, `spawn_blocking`
//! workers); calling from inside an async task would panic.

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use tokio::runtime::Handle;

use super::{RemoteError, RemoteStore};
use crate::config::ObjectStoreConfig;
use crate::error::{Error, Result};

/// Blocking adapter over an `object_store` backend
pub struct ObjectStoreRemote {
    store: Arc<dyn ObjectStore>,
    runtime: Handle,
    name: String,
}

impl ObjectStoreRemote {
    /// Wrap `store`, driving its futures on `runtime`
    pub fn new(store: Arc<dyn ObjectStore>, runtime: Handle, name: impl Into<String>) -> Self {
        Self {
            store,
            runtime,
            name: name.into(),
        }
    }
}

impl std::fmt::Debug for ObjectStoreRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreRemote")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RemoteStore for ObjectStoreRemote {
    fn put(&self, key: &str, body: Bytes) -> std::result::Result<(), RemoteError> {
        let location = ObjectPath::from(key);
        self.runtime
            .block_on(self.store.put(&location, PutPayload::from(body)))?;
        Ok(())
    }

    fn get(&self, key: &str) -> std::result::Result<Option<Bytes>, RemoteError> {
        let location = ObjectPath::from(key);
        let fetched = self.runtime.block_on(async {
            let result = self.store.get(&location).await?;
            result.bytes().await
        });

        match fetched {
            Ok(body) => Ok(Some(body)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> std::result::Result<Vec<String>, RemoteError> {
        // object_store lists by whole path segments, so list the enclosing
        // directory and filter by the raw string prefix
        let dir = prefix.rfind('/').map(|idx| ObjectPath::from(&prefix[..idx]));
        let objects: Vec<ObjectMeta> = self
            .runtime
            .block_on(self.store.list(dir.as_ref()).try_collect())?;

        Ok(objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|key| key.starts_with(prefix))
            .collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Build the configured remote store
///
/// Construction happens once at startup; any failure is a configuration error.
pub fn build_remote(config: &ObjectStoreConfig, runtime: Handle) -> Result<Arc<dyn RemoteStore>> {
    let (store, name): (Arc<dyn ObjectStore>, String) = match config {
        ObjectStoreConfig::InMemory => (Arc::new(InMemory::new()), "in-memory".to_string()),
        ObjectStoreConfig::Local(local) => {
            std::fs::create_dir_all(&local.path).map_err(|e| {
                Error::Configuration(format!(
                    "failed to create object store directory {}: {}",
                    local.path.display(),
                    e
                ))
            })?;
            let store = LocalFileSystem::new_with_prefix(&local.path).map_err(|e| {
                Error::Configuration(format!("failed to create local object store: {}", e))
            })?;
            (Arc::new(store), format!("local:{}", local.path.display()))
        }
        ObjectStoreConfig::Aws(aws) => {
            let mut builder = AmazonS3Builder::from_env()
                .with_region(&aws.region)
                .with_bucket_name(&aws.bucket);
            if let (Some(key), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
                builder = builder.with_access_key_id(key).with_secret_access_key(secret);
            }
            let store = builder.build().map_err(|e| {
                Error::Configuration(format!("failed to create S3 store: {}", e))
            })?;
            (Arc::new(store), format!("s3://{}", aws.bucket))
        }
    };

    Ok(Arc::new(ObjectStoreRemote::new(store, runtime, name)))
}
