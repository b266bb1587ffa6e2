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
#![allow(clippy::mutex_atomic)]

//! A small wrapper around a tokio Runtime handle, shared by every component that needs to
//! spawn background work (upload queues, prune loops, single-flight fetches) without owning
//! a runtime of its own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};

/// Executors come in two flavors:
/// * "borrowed" - created with `Self::new()` or `self.to_borrowed()`. Dropping every handle
///   has no effect on the underlying Runtime; used when the caller is itself inside a Runtime
///   (e.g. `#[tokio::main]`).
/// * "owned" - created with `Self::new_owned()`. The Runtime is shut down explicitly via
///   `shutdown`, used by the `serve` binary entrypoint.
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    /// Creates an Executor for an existing tokio::Runtime (generally entered via `#[tokio::main]`
    /// or `#[tokio::test]`).
    pub fn new() -> Executor {
        Self {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    /// Builds and owns a fresh multi-threaded Runtime.
    pub fn new_owned(num_worker_threads: usize, max_threads: usize) -> Result<Executor, String> {
        let mut runtime_builder = Builder::new_multi_thread();
        runtime_builder
            .worker_threads(num_worker_threads)
            .max_blocking_threads(max_threads.saturating_sub(num_worker_threads).max(1))
            .enable_all();

        let runtime = runtime_builder
            .build()
            .map_err(|e| format!("Failed to start the runtime: {e}"))?;

        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    /// Creates a clone of this Executor that is disconnected from shutdown events.
    pub fn to_borrowed(&self) -> Executor {
        Self {
            runtime: Arc::new(Mutex::new(None)),
            handle: self.handle.clone(),
        }
    }

    pub fn enter<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _context = self.handle.enter();
        f()
    }

    /// Runs a Future on the Runtime as a new Task, recovering from a panic via `rescue_join_error`.
    pub fn spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
        rescue_join_error: impl FnOnce(JoinError) -> O,
    ) -> impl Future<Output = O> {
        self.native_spawn(future).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    pub fn native_spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
    ) -> JoinHandle<O> {
        self.handle.spawn(future)
    }

    /// Runs a Future and blocks on its resolved Result. Must only be called from outside a
    /// Future context (i.e. roughly a `main` method).
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    pub fn spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
    ) -> JoinHandle<R> {
        self.handle.spawn_blocking(f)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Blocks until the owned Runtime has shut down, or `timeout` elapses (in which case any
    /// remaining tasks are leaked). Has no effect on "borrowed" Executors.
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        let start = Instant::now();
        runtime.shutdown_timeout(timeout + Duration::from_millis(250));
        if start.elapsed() > timeout {
            log::warn!("Executor shutdown took unexpectedly long: tasks were likely leaked!");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

/// Tracks a set of named background tasks (upload-queue drains, in-flight request handlers)
/// that must be allowed to finish before a graceful shutdown completes, subject to a deadline.
#[derive(Clone)]
pub struct DrainGroup {
    inner: Arc<Mutex<Option<DrainGroupInner>>>,
}

struct DrainGroupInner {
    id_to_name: HashMap<Id, String>,
    task_set: JoinSet<()>,
}

impl DrainGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(DrainGroupInner {
                id_to_name: HashMap::new(),
                task_set: JoinSet::new(),
            }))),
        }
    }

    /// Registers a task with the group. No-ops (logging a warning) if `wait` has already run.
    pub fn spawn_on<F>(&self, name: &str, handle: &Handle, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.inner.lock();
        let inner = match &mut *guard {
            Some(inner) => inner,
            None => {
                log::warn!("drain task `{name}` submitted after the drain group completed");
                return;
            }
        };

        let h = inner.task_set.spawn_on(task, handle);
        inner.id_to_name.insert(h.id(), name.to_string());
    }

    /// Waits for all registered tasks to complete, up to `timeout`. Tasks still running when
    /// the deadline passes are aborted.
    pub async fn wait(self, timeout: Duration) {
        let mut inner = match self.inner.lock().take() {
            Some(inner) => inner,
            None => {
                log::debug!("drain group awaited multiple times");
                return;
            }
        };

        if inner.task_set.is_empty() {
            return;
        }

        log::debug!("waiting for {} task(s) to drain", inner.task_set.len());

        let mut timeout = tokio::time::sleep(timeout).boxed();

        loop {
            tokio::select! {
                biased;

                _ = &mut timeout => break,

                next_result = inner.task_set.join_next_with_id() => {
                    match next_result {
                        Some(Ok((id, _))) => {
                            inner.id_to_name.remove(&id);
                        }
                        Some(Err(err)) => {
                            let name = inner.id_to_name.get(&err.id());
                            log::error!("drain task `{name:?}` failed: {err:?}");
                        }
                        None => break,
                    }
                }
            }
        }

        if inner.task_set.is_empty() {
            log::debug!("all drain tasks completed");
        } else {
            log::debug!(
                "{} drain task(s) did not complete within the grace period: {}",
                inner.task_set.len(),
                inner.id_to_name.values().join(", "),
            );
            inner.task_set.abort_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn drain_group_waits_for_spawned_tasks() {
        let group = DrainGroup::new();
        let handle = Handle::current();
        let flag = Arc::new(Mutex::new(false));
        let flag2 = flag.clone();
        group.spawn_on("set-flag", &handle, async move {
            *flag2.lock() = true;
        });
        group.wait(Duration::from_secs(5)).await;
        assert!(*flag.lock());
    }

    #[tokio::test]
    async fn drain_group_with_no_tasks_returns_immediately() {
        let group = DrainGroup::new();
        group.wait(Duration::from_millis(10)).await;
    }
}
