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

//! A content-addressed file store under a root directory, with optional TTL-based pruning.
//!
//! Every tier (action/output blobs, reverse-proxy responses) addresses its entries by a
//! caller-computed relative path; [`shard_relpath`] is the deterministic two-level fanout
//! scheme callers should use to derive that path from a hex key. Writes always land via a
//! temp-file-then-rename so readers never observe a partial file, and concurrent writers of
//! the same path are coalesced onto a single filesystem write.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_oncecell::OnceCell;
use bytes::Bytes;
use parking_lot::Mutex;
use task_executor::Executor;
use tokio::io::AsyncWriteExt;

/// Derives the two-level shard path `<k[0:2]>/<k[2:4]>/<k>` used by action, output, and
/// reverse-proxy entries to bound directory fanout. Keys shorter than 4 characters are not
/// sharded at all (this only matters for tests; real keys are 64 character hex digests).
pub fn shard_relpath(key: &str) -> String {
    if key.len() < 4 {
        return key.to_string();
    }
    format!("{}/{}/{}", &key[0..2], &key[2..4], key)
}

struct Coalesce {
    writes: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

/// A content-addressed local cache rooted at a directory. Cheaply clonable; all state is
/// behind `Arc`.
#[derive(Clone)]
pub struct LocalCache {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    executor: Executor,
    ttl: Option<Duration>,
    coalesce: Coalesce,
    pruning_stopped: AtomicBool,
}

impl LocalCache {
    pub fn new(root: PathBuf, ttl: Option<Duration>, executor: Executor) -> LocalCache {
        LocalCache {
            inner: Arc::new(Inner {
                root,
                executor,
                ttl,
                coalesce: Coalesce {
                    writes: Mutex::new(HashMap::new()),
                },
                pruning_stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn path_for(&self, rel_path: &str) -> PathBuf {
        self.inner.root.join(rel_path)
    }

    /// Reads the full contents of `rel_path`, or `None` if it doesn't exist. A successful read
    /// bumps the file's mtime, since that's the clock pruning uses to approximate access time.
    pub async fn read(&self, rel_path: &str) -> Result<Option<Vec<u8>>, String> {
        let path = self.path_for(rel_path);
        match tokio::fs::read(&path).await {
            Ok(contents) => {
                self.touch(path).await;
                Ok(Some(contents))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(format!("failed to read {rel_path}: {e}")),
        }
    }

    pub async fn exists(&self, rel_path: &str) -> bool {
        tokio::fs::metadata(self.path_for(rel_path)).await.is_ok()
    }

    async fn touch(&self, path: PathBuf) {
        let result = self
            .inner
            .executor
            .spawn_blocking(move || {
                fs_set_times::set_mtime(&path, fs_set_times::SystemTimeSpec::SymbolicNow)
            })
            .await;
        if let Ok(Err(e)) = result {
            log::debug!("failed to bump mtime after cache hit: {e}");
        }
    }

    /// Writes `bytes` to `rel_path` atomically. Concurrent writers of the same `rel_path` are
    /// coalesced: only the first writer actually touches the filesystem, and the rest await its
    /// result.
    pub async fn write_bytes(&self, rel_path: &str, bytes: Bytes) -> Result<(), String> {
        self.write_using(rel_path, move |mut file| async move {
            file.write_all(&bytes)
                .await
                .map_err(|e| format!("failed to write {rel_path}: {e}"))?;
            Ok(file)
        })
        .await
    }

    /// As `write_bytes`, but the caller fills the destination file itself (e.g. by copying from
    /// a network reader) via `writer_func`.
    pub async fn write_using<F, Fut>(&self, rel_path: &str, writer_func: F) -> Result<(), String>
    where
        F: FnOnce(tokio::fs::File) -> Fut,
        Fut: Future<Output = Result<tokio::fs::File, String>>,
    {
        let cell = self
            .inner
            .coalesce
            .writes
            .lock()
            .entry(rel_path.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        cell.get_or_try_init(async {
            let dest_path = self.path_for(rel_path);
            let parent = dest_path
                .parent()
                .ok_or_else(|| format!("cache path {dest_path:?} has no parent directory"))?
                .to_owned();
            tokio::fs::create_dir_all(&parent)
                .await
                .map_err(|e| format!("failed to create cache subdirectory {parent:?}: {e}"))?;

            let named_temp_file = self
                .inner
                .executor
                .spawn_blocking(move || {
                    tempfile::Builder::new()
                        .suffix(".tmp")
                        .tempfile_in(&parent)
                        .map_err(|e| format!("failed to create temp file: {e}"))
                })
                .await
                .map_err(|e| format!("temp file creation task panicked: {e}"))??;

            let (std_file, tmp_path) = named_temp_file
                .keep()
                .map_err(|e| format!("failed to keep temp file: {e}"))?;

            match writer_func(std_file.into()).await {
                Ok(mut tokio_file) => {
                    tokio_file
                        .flush()
                        .await
                        .map_err(|e| format!("failed to flush {tmp_path:?}: {e}"))?;
                    tokio_file
                        .sync_all()
                        .await
                        .map_err(|e| format!("failed to sync {tmp_path:?}: {e}"))?;
                    tokio::fs::rename(&tmp_path, &dest_path)
                        .await
                        .map_err(|e| format!("failed to rename into place: {e}"))?;
                    Ok(())
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    Err(e)
                }
            }
        })
        .await
        .map(|_| ())?;

        self.inner.coalesce.writes.lock().remove(rel_path);
        Ok(())
    }

    /// Deletes `rel_path` if it's present. A corrupt or missing entry is not an error: callers
    /// treat it as a cache miss afterwards.
    pub async fn remove(&self, rel_path: &str) -> Result<(), String> {
        self.inner.coalesce.writes.lock().remove(rel_path);
        match tokio::fs::remove_file(self.path_for(rel_path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("failed to remove {rel_path}: {e}")),
        }
    }

    /// Starts a background pruning loop if a TTL was configured, walking the tree every
    /// `interval` and removing files whose mtime is older than the TTL. Never blocks readers:
    /// removal races with a fresh write are resolved by rename-atomicity on the write side.
    pub fn spawn_pruner(&self, interval: Duration) -> Option<tokio::task::JoinHandle<()>> {
        let ttl = self.inner.ttl?;
        let this = self.clone();
        Some(this.inner.executor.clone().native_spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if this.inner.pruning_stopped.load(Ordering::Relaxed) {
                    return;
                }
                match this.prune_once(ttl).await {
                    Ok(removed) if removed > 0 => {
                        log::debug!("pruned {removed} expired cache entries");
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("cache pruning pass failed: {e}"),
                }
            }
        }))
    }

    pub fn stop_pruning(&self) {
        self.inner.pruning_stopped.store(true, Ordering::Relaxed);
    }

    /// Runs a single pruning pass, returning the number of files removed.
    pub async fn prune_once(&self, ttl: Duration) -> Result<usize, String> {
        let root = self.inner.root.clone();
        self.inner
            .executor
            .spawn_blocking(move || {
                let expiration = SystemTime::now()
                    .checked_sub(ttl)
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                let mut removed = 0;
                for entry in walkdir::WalkDir::new(&root)
                    .min_depth(1)
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    // Tempfiles-in-progress carry a `.tmp` suffix; never touch them.
                    if entry.path().extension().map(|e| e == "tmp").unwrap_or(false) {
                        continue;
                    }
                    let Ok(metadata) = entry.metadata() else {
                        continue;
                    };
                    let Ok(mtime) = metadata.modified() else {
                        continue;
                    };
                    if mtime < expiration && std::fs::remove_file(entry.path()).is_ok() {
                        removed += 1;
                    }
                }
                Ok(removed)
            })
            .await
            .map_err(|e| format!("pruning task panicked: {e}"))?
    }
}
