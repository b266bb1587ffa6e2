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

//! Content-addressed cache for build actions: maps an action's fingerprint to the fingerprint
//! and bytes of its output. Backed by a local disk tier (fast, bounded by a TTL) fronting an
//! object store tier (durable, shared across machines). Reads prefer local; writes land local
//! immediately and are mirrored to the object store in the background, subject to a minimum
//! size filter and a bounded upload queue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_oncecell::OnceCell;
use bytes::Bytes;
use hashing::Fingerprint;
use introspect::{Gauge, Metric, Registry};
use local_cache::LocalCache;
use object_store::ObjectStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use task_executor::Executor;
use tokio::sync::Semaphore;

/// Identifies an action (e.g. the fingerprint of its normalized command line, environment, and
/// input tree).
pub type ActionKey = Fingerprint;
/// Identifies the bytes of an action's output.
pub type OutputKey = Fingerprint;

#[derive(Serialize, Deserialize)]
struct ActionEntry {
    output: OutputKey,
    size_bytes: u64,
}

fn actions_relpath(key: ActionKey) -> String {
    format!("actions/{}", local_cache::shard_relpath(&key.to_hex()))
}

fn outputs_relpath(key: OutputKey) -> String {
    format!("outputs/{}", local_cache::shard_relpath(&key.to_hex()))
}

fn actions_object_key(key: ActionKey) -> String {
    format!("actions/{}", key.to_hex())
}

fn outputs_object_key(key: OutputKey) -> String {
    format!("outputs/{}", key.to_hex())
}

pub struct ActionCacheOptions {
    pub min_upload_size: usize,
    /// Bounds simultaneously active `get`/`put` calls.
    pub request_concurrency: usize,
    /// Bounds simultaneous background uploads to the object store, since uploads are the
    /// action cache's only direct use of the remote tier's write path.
    pub upload_concurrency: usize,
}

/// Which tier actually answered a `get`, so the caller can increment exactly one of
/// `get.hit.local` / `get.hit.remote` / `get.miss` — never more than one, and never the wrong
/// one just because the entry has since been materialized locally.
#[derive(Clone, Copy, Eq, PartialEq)]
enum GetOutcome {
    HitLocal,
    HitRemote,
    Miss,
}

type GetResult = (Option<(OutputKey, PathBuf)>, GetOutcome);

struct Inflight {
    gets: Mutex<HashMap<ActionKey, Arc<OnceCell<GetResult>>>>,
}

/// A two-tier cache from `ActionKey` to the materialized bytes of its output.
#[derive(Clone)]
pub struct ActionCache {
    inner: Arc<Inner>,
}

struct Inner {
    local: LocalCache,
    remote: Option<ObjectStore>,
    registry: Arc<Registry>,
    executor: Executor,
    min_upload_size: usize,
    request_semaphore: Arc<Semaphore>,
    upload_semaphore: Arc<Semaphore>,
    inflight: Inflight,
}

impl ActionCache {
    pub fn new(
        local: LocalCache,
        remote: Option<ObjectStore>,
        registry: Arc<Registry>,
        executor: Executor,
        options: ActionCacheOptions,
    ) -> ActionCache {
        ActionCache {
            inner: Arc::new(Inner {
                local,
                remote,
                registry,
                executor,
                min_upload_size: options.min_upload_size,
                request_semaphore: Arc::new(Semaphore::new(options.request_concurrency.max(1))),
                upload_semaphore: Arc::new(Semaphore::new(options.upload_concurrency.max(1))),
                inflight: Inflight {
                    gets: Mutex::new(HashMap::new()),
                },
            }),
        }
    }

    /// Looks up an action's cached output, materializing it to local disk if it was only
    /// present remotely. Concurrent lookups for the same action are coalesced.
    pub async fn get(&self, action_key: ActionKey) -> Result<Option<(OutputKey, PathBuf)>, String> {
        let _permit = self
            .inner
            .request_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| e.to_string())?;

        let cell = {
            let mut gets = self.inner.inflight.gets.lock();
            gets.entry(action_key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let gauge = self.inner.registry.gauge(Gauge::InflightGets);
        gauge.increment();
        let result = cell
            .get_or_try_init(self.do_get(action_key))
            .await
            .map(Clone::clone);
        gauge.decrement();

        {
            let mut gets = self.inner.inflight.gets.lock();
            gets.remove(&action_key);
        }

        let (value, outcome) = result?;
        match outcome {
            GetOutcome::HitLocal => self.inner.registry.counter(Metric::GetHitLocal).increment(1),
            GetOutcome::HitRemote => self.inner.registry.counter(Metric::GetHitRemote).increment(1),
            GetOutcome::Miss => self.inner.registry.counter(Metric::GetMiss).increment(1),
        }
        Ok(value)
    }

    async fn do_get(&self, action_key: ActionKey) -> Result<GetResult, String> {
        if let Some(entry) = self.read_local_entry(action_key).await? {
            let output_path = self.inner.local.path_for(&outputs_relpath(entry.output));
            if self.inner.local.exists(&outputs_relpath(entry.output)).await {
                return Ok((Some((entry.output, output_path)), GetOutcome::HitLocal));
            }
            if let Some(path) = self.fetch_remote_output(entry.output).await? {
                return Ok((Some((entry.output, path)), GetOutcome::HitRemote));
            }
            // Local entry pointed at an output we no longer have anywhere: treat as corrupt.
            self.inner.local.remove(&actions_relpath(action_key)).await.ok();
            return Ok((None, GetOutcome::Miss));
        }

        let Some(remote) = &self.inner.remote else {
            return Ok((None, GetOutcome::Miss));
        };
        let entry_bytes = match remote.get(&actions_object_key(action_key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok((None, GetOutcome::Miss)),
            Err(e) => return Err(e.to_string()),
        };
        let entry: ActionEntry =
            serde_json::from_slice(&entry_bytes).map_err(|e| format!("corrupt remote action entry: {e}"))?;

        let (write_entry, fetch_output) = tokio::join!(
            self.inner
                .local
                .write_bytes(&actions_relpath(action_key), entry_bytes.clone()),
            self.fetch_remote_output(entry.output),
        );
        write_entry?;
        match fetch_output? {
            Some(path) => Ok((Some((entry.output, path)), GetOutcome::HitRemote)),
            None => Ok((None, GetOutcome::Miss)),
        }
    }

    async fn read_local_entry(&self, action_key: ActionKey) -> Result<Option<ActionEntry>, String> {
        match self.inner.local.read(&actions_relpath(action_key)).await? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    log::warn!("discarding corrupt local action entry for {action_key}: {e}");
                    self.inner.local.remove(&actions_relpath(action_key)).await.ok();
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn fetch_remote_output(&self, output_key: OutputKey) -> Result<Option<PathBuf>, String> {
        let rel_path = outputs_relpath(output_key);
        if self.inner.local.exists(&rel_path).await {
            return Ok(Some(self.inner.local.path_for(&rel_path)));
        }
        let Some(remote) = &self.inner.remote else {
            return Ok(None);
        };
        match remote.get(&outputs_object_key(output_key)).await {
            Ok(Some(bytes)) => {
                self.inner.local.write_bytes(&rel_path, bytes).await?;
                Ok(Some(self.inner.local.path_for(&rel_path)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Stores `bytes` as the output of `action_key` under `output_key`, writing through to
    /// local disk synchronously and enqueuing a bounded best-effort upload to the object store.
    pub async fn put(&self, action_key: ActionKey, output_key: OutputKey, bytes: Bytes) -> Result<(), String> {
        let _permit = self
            .inner
            .request_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| e.to_string())?;

        self.inner.registry.counter(Metric::PutTotal).increment(1);

        let size_bytes = bytes.len() as u64;
        self.inner
            .local
            .write_bytes(&outputs_relpath(output_key), bytes.clone())
            .await?;

        let entry = ActionEntry {
            output: output_key,
            size_bytes,
        };
        let entry_bytes = Bytes::from(serde_json::to_vec(&entry).map_err(|e| e.to_string())?);
        self.inner
            .local
            .write_bytes(&actions_relpath(action_key), entry_bytes.clone())
            .await?;

        self.spawn_upload(action_key, output_key, entry_bytes, bytes);
        Ok(())
    }

    /// Enqueues the background upload task. The `MinUploadSize` filter (spec.md §4.4 (a)) gates
    /// only the OutputBlob; the ActionEntry itself is small and uploaded unconditionally (§4.4
    /// (c)), so a tiny output's action record is still discoverable from a fresh process.
    fn spawn_upload(&self, action_key: ActionKey, output_key: OutputKey, entry_bytes: Bytes, output_bytes: Bytes) {
        let Some(remote) = self.inner.remote.clone() else {
            return;
        };
        let registry = self.inner.registry.clone();
        let semaphore = self.inner.upload_semaphore.clone();
        let gauge = registry.gauge(Gauge::InflightUploads);
        let min_upload_size = self.inner.min_upload_size;

        self.inner.executor.native_spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            gauge.increment();

            if output_bytes.len() < min_upload_size {
                registry.counter(Metric::PutSkippedSmall).increment(1);
            } else {
                match remote.head(&outputs_object_key(output_key)).await {
                    Ok(Some(_)) => {
                        registry.counter(Metric::PutSkippedExists).increment(1);
                    }
                    Ok(None) => match remote.put(&outputs_object_key(output_key), output_bytes).await {
                        Ok(()) => {
                            registry.counter(Metric::PutUploaded).increment(1);
                        }
                        Err(e) => {
                            log::warn!("failed to upload output {output_key}: {e}");
                            registry.counter(Metric::UploadError).increment(1);
                        }
                    },
                    Err(e) => {
                        log::warn!("failed to check for existing output {output_key}: {e}");
                        registry.counter(Metric::UploadError).increment(1);
                    }
                }
            }

            if let Err(e) = remote.put(&actions_object_key(action_key), entry_bytes).await {
                log::warn!("failed to upload action entry {action_key}: {e}");
                registry.counter(Metric::UploadError).increment(1);
            }

            gauge.decrement();
        });
    }

    pub async fn close(&self) {
        // Uploads are spawned as detached tasks on the shared executor; draining them to
        // completion (or aborting them after a grace period) is the caller's responsibility via
        // `task_executor::DrainGroup`, since only the caller knows the shutdown grace period.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fingerprint(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes_unsafe(&[byte; 32])
    }

    fn test_cache(tmp: &std::path::Path, min_upload_size: usize) -> ActionCache {
        let executor = Executor::new();
        let local = LocalCache::new(tmp.to_path_buf(), None, executor.clone());
        let remote = Some(ObjectStore::memory(""));
        ActionCache::new(
            local,
            remote,
            Registry::new(),
            executor,
            ActionCacheOptions {
                min_upload_size,
                request_concurrency: 8,
                upload_concurrency: 2,
            },
        )
    }

    #[tokio::test]
    async fn put_then_get_roundtrips_through_the_local_tier() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(tmp.path(), 1024);

        let action = fingerprint(1);
        let output = fingerprint(2);
        cache
            .put(action, output, Bytes::from_static(b"output bytes"))
            .await
            .unwrap();

        let (got_output, path) = cache.get(action).await.unwrap().unwrap();
        assert_eq!(got_output, output);
        assert_eq!(tokio::fs::read(path).await.unwrap(), b"output bytes");
    }

    #[tokio::test]
    async fn get_of_an_unknown_action_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(tmp.path(), 1024);
        assert!(cache.get(fingerprint(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn small_outputs_skip_the_blob_upload_but_still_record_the_action_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(tmp.path(), 1024);
        let action = fingerprint(3);
        let output = fingerprint(4);
        cache.put(action, output, Bytes::from_static(b"tiny")).await.unwrap();

        // The blob skip is recorded by the spawned upload task, not synchronously in `put`.
        for _ in 0..100 {
            if cache.inner.registry.counter(Metric::PutSkippedSmall).get() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.inner.registry.counter(Metric::PutSkippedSmall).get(), 1);

        // Spec §4.4 (c): the ActionEntry itself uploads unconditionally, regardless of blob size.
        let remote = cache.inner.remote.as_ref().unwrap();
        let mut entry_bytes = remote.get(&actions_object_key(action)).await.unwrap();
        for _ in 0..100 {
            if entry_bytes.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            entry_bytes = remote.get(&actions_object_key(action)).await.unwrap();
        }
        assert!(entry_bytes.is_some());
        assert!(remote.head(&outputs_object_key(output)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_gets_for_the_same_action_are_coalesced() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(tmp.path(), 1024);
        let action = fingerprint(5);
        let output = fingerprint(6);
        cache
            .put(action, output, Bytes::from_static(b"shared"))
            .await
            .unwrap();

        let (a, b) = tokio::join!(cache.get(action), cache.get(action));
        assert_eq!(a.unwrap().unwrap().0, output);
        assert_eq!(b.unwrap().unwrap().0, output);
    }

    #[tokio::test]
    async fn request_concurrency_bound_serializes_distinct_requests_without_deadlock() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = Executor::new();
        let local = LocalCache::new(tmp.path().to_path_buf(), None, executor.clone());
        let cache = ActionCache::new(
            local,
            None,
            Registry::new(),
            executor,
            ActionCacheOptions {
                min_upload_size: 1024,
                request_concurrency: 1,
                upload_concurrency: 1,
            },
        );

        let (put_a, put_b) = tokio::join!(
            cache.put(fingerprint(10), fingerprint(11), Bytes::from_static(b"a")),
            cache.put(fingerprint(12), fingerprint(13), Bytes::from_static(b"b")),
        );
        put_a.unwrap();
        put_b.unwrap();

        let (get_a, get_b) = tokio::join!(cache.get(fingerprint(10)), cache.get(fingerprint(12)));
        assert_eq!(get_a.unwrap().unwrap().0, fingerprint(11));
        assert_eq!(get_b.unwrap().unwrap().0, fingerprint(13));
    }
}
