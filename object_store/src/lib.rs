// Copyright 2026 BuildCache Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

//! A thin adapter over an S3-compatible blob store: `get`, `put`, `head`, and streaming
//! `copy_from_local`. Retry/backoff on transient failures and the path-style vs virtual-host
//! addressing choice live in the `opendal` `Operator` layers; this module's job is mapping
//! that onto the small contract the caching fabric actually needs, and classifying failures
//! the way the fabric's error-handling policy expects: missing objects are not errors,
//! permission failures are fatal and distinct from transient ones.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use opendal::layers::{ConcurrentLimitLayer, RetryLayer, TimeoutLayer};
use opendal::Operator;

#[derive(Debug)]
pub enum ObjectStoreError {
    /// Not actually an error: callers should treat this as a cache miss.
    NotFound,
    /// Authentication or authorization failed. Fatal: uploads should be disabled rather than
    /// retried, but reads already served from the local tier are unaffected.
    PermissionDenied(String),
    /// A transient failure survived the retry layer's backoff budget, or some other I/O error.
    Other(String),
}

impl fmt::Display for ObjectStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectStoreError::NotFound => write!(f, "object not found"),
            ObjectStoreError::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            ObjectStoreError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ObjectStoreError {}

impl From<opendal::Error> for ObjectStoreError {
    fn from(e: opendal::Error) -> Self {
        match e.kind() {
            opendal::ErrorKind::NotFound => ObjectStoreError::NotFound,
            opendal::ErrorKind::PermissionDenied => ObjectStoreError::PermissionDenied(e.to_string()),
            _ => ObjectStoreError::Other(e.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ObjectStoreOptions {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    /// When true, addresses objects as `https://host/bucket/key` instead of
    /// `https://bucket.host/key`.
    pub path_style: bool,
    /// Prepended (with a `/`) to every key, e.g. to namespace several workers' caches within
    /// one bucket.
    pub key_prefix: String,
    pub concurrency_limit: usize,
    pub rpc_timeout: Duration,
    pub rpc_retries: usize,
}

/// A handle to one S3-compatible bucket. Cheap to clone (the underlying `Operator` is
/// reference-counted internally).
#[derive(Clone)]
pub struct ObjectStore {
    operator: Operator,
    key_prefix: String,
}

impl ObjectStore {
    pub fn s3(options: ObjectStoreOptions) -> Result<ObjectStore, String> {
        let mut builder = opendal::services::S3::default();
        builder = builder.bucket(&options.bucket);
        if let Some(region) = &options.region {
            builder = builder.region(region);
        }
        if let Some(endpoint) = &options.endpoint {
            builder = builder.endpoint(endpoint);
        }
        if !options.path_style {
            builder = builder.enable_virtual_host_style();
        }

        let operator = Operator::new(builder)
            .map_err(|e| format!("failed to initialise object store: {e}"))?
            .layer(ConcurrentLimitLayer::new(options.concurrency_limit))
            .layer(
                TimeoutLayer::new()
                    .with_timeout(options.rpc_timeout)
                    // TimeoutLayer requires a non-zero minimum transfer speed too.
                    .with_speed(1),
            )
            .layer(RetryLayer::new().with_max_times(options.rpc_retries + 1))
            .finish();

        Ok(ObjectStore {
            operator,
            key_prefix: options.key_prefix,
        })
    }

    /// An in-memory backend with the same `Operator`/layer plumbing as `s3`, minus any network
    /// I/O. Used by this crate's and its dependents' tests so they don't need real S3 access.
    pub fn memory(key_prefix: &str) -> ObjectStore {
        let operator = Operator::new(opendal::services::Memory::default())
            .expect("in-memory opendal backend cannot fail to construct")
            .finish();
        ObjectStore {
            operator,
            key_prefix: key_prefix.to_string(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.key_prefix.trim_end_matches('/'))
        }
    }

    /// Fetches the full contents of `key`, or `Ok(None)` if it doesn't exist.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, ObjectStoreError> {
        match self.operator.read(&self.full_key(key)).await {
            Ok(buf) => Ok(Some(buf.to_bytes())),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn put(&self, key: &str, bytes: Bytes) -> Result<(), ObjectStoreError> {
        self.operator
            .write(&self.full_key(key), bytes)
            .await
            .map_err(ObjectStoreError::from)
    }

    /// Returns the object's size, or `Ok(None)` if it doesn't exist.
    pub async fn head(&self, key: &str) -> Result<Option<usize>, ObjectStoreError> {
        match self.operator.stat(&self.full_key(key)).await {
            Ok(meta) => Ok(Some(meta.content_length() as usize)),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Streams the contents of a local file up to `key` without buffering the whole thing in
    /// memory.
    pub async fn copy_from_local(&self, key: &str, path: &Path) -> Result<(), ObjectStoreError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ObjectStoreError::Other(format!("failed to open {path:?}: {e}")))?;
        let mut writer = self
            .operator
            .writer(&self.full_key(key))
            .await
            .map_err(ObjectStoreError::from)?;

        match tokio::io::copy(&mut file, &mut writer).await {
            Ok(_) => writer.close().await.map(|_| ()).map_err(ObjectStoreError::from),
            Err(e) => {
                let _ = writer.abort().await;
                Err(ObjectStoreError::Other(format!(
                    "failed to upload {path:?}: {e}"
                )))
            }
        }
    }

    /// Lists keys under `prefix` (after applying the configured key prefix). Used by `/debug/*`
    /// introspection and tests; not on the hot path.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let lister = self
            .operator
            .lister(&self.full_key(prefix))
            .await
            .map_err(ObjectStoreError::from)?;
        let entries: Vec<opendal::Entry> = lister.try_collect().await.map_err(ObjectStoreError::from)?;
        Ok(entries.into_iter().map(|e| e.path().to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store(prefix: &str) -> ObjectStore {
        ObjectStore::memory(prefix)
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = memory_store("prefix");
        store.put("output/abc", Bytes::from_static(b"hi")).await.unwrap();
        let got = store.get("output/abc").await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"hi")));
    }

    #[tokio::test]
    async fn get_of_a_missing_key_is_none_not_an_error() {
        let store = memory_store("prefix");
        assert_eq!(store.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn head_reports_missing_objects_as_none() {
        let store = memory_store("prefix");
        assert_eq!(store.head("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn head_reports_size_of_present_objects() {
        let store = memory_store("prefix");
        store.put("k", Bytes::from_static(b"12345")).await.unwrap();
        assert_eq!(store.head("k").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn copy_from_local_uploads_file_contents() {
        let store = memory_store("prefix");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        tokio::fs::write(&path, b"from disk").await.unwrap();

        store.copy_from_local("output/def", &path).await.unwrap();
        assert_eq!(
            store.get("output/def").await.unwrap(),
            Some(Bytes::from_static(b"from disk"))
        );
    }
}
