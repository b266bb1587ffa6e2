// Copyright 2026 BuildCache Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::len_without_is_empty, clippy::new_without_default)]

//! An expvar-style introspection registry. A `Registry` is constructed once by the `serve`
//! entrypoint and handed to every component that wants to publish a counter or a gauge; there
//! is no process-global state here. `/debug/vars` in the Dispatcher dumps a `Registry` to JSON.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// The counters the action cache exposes. Named with a dotted convention
/// (`get.hit.local`, not `get_hit_local`), since these values are surfaced
/// verbatim to operators via `/debug/vars`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Metric {
    GetHitLocal,
    GetHitRemote,
    GetMiss,
    PutTotal,
    PutUploaded,
    PutSkippedSmall,
    PutSkippedExists,
    UploadError,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        use Metric::*;
        match *self {
            GetHitLocal => "get.hit.local",
            GetHitRemote => "get.hit.remote",
            GetMiss => "get.miss",
            PutTotal => "put.total",
            PutUploaded => "put.uploaded",
            PutSkippedSmall => "put.skipped.small",
            PutSkippedExists => "put.skipped.exists",
            UploadError => "upload.error",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Gauge {
    InflightGets,
    InflightUploads,
}

impl Gauge {
    pub fn as_str(&self) -> &'static str {
        use Gauge::*;
        match *self {
            InflightGets => "inflight.gets",
            InflightUploads => "inflight.uploads",
        }
    }
}

/// A cheap, clonable handle to a single named counter.
#[derive(Clone)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn increment(&self, by: u64) {
        self.0.fetch_add(by, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A cheap, clonable handle to a single named gauge.
#[derive(Clone)]
pub struct GaugeHandle(Arc<AtomicI64>);

impl GaugeHandle {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// The introspection registry. Any number of named counters and gauges may be registered;
/// registering the same name twice returns the same handle.
pub struct Registry {
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<BTreeMap<String, Arc<AtomicI64>>>,
    config: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            config: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn counter(&self, metric: Metric) -> Counter {
        self.named_counter(metric.as_str())
    }

    pub fn named_counter(&self, name: &str) -> Counter {
        if let Some(existing) = self.counters.read().get(name) {
            return Counter(existing.clone());
        }
        let mut counters = self.counters.write();
        let entry = counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        Counter(entry.clone())
    }

    pub fn gauge(&self, gauge: Gauge) -> GaugeHandle {
        self.named_gauge(gauge.as_str())
    }

    pub fn named_gauge(&self, name: &str) -> GaugeHandle {
        if let Some(existing) = self.gauges.read().get(name) {
            return GaugeHandle(existing.clone());
        }
        let mut gauges = self.gauges.write();
        let entry = gauges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)));
        GaugeHandle(entry.clone())
    }

    /// Publishes a piece of static configuration (e.g. `cache-dir`, `bucket`) for display
    /// alongside the live counters under `/debug/vars`.
    pub fn set_config(&self, key: &str, value: impl Into<serde_json::Value>) {
        self.config.write().insert(key.to_string(), value.into());
    }

    /// Renders the full registry as the JSON body served at `/debug/vars`.
    pub fn dump(&self) -> serde_json::Value {
        let counters: BTreeMap<_, _> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let gauges: BTreeMap<_, _> = self
            .gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        serde_json::json!({
            "config": *self.config.read(),
            "counters": counters,
            "gauges": gauges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_handles_for_the_same_name_share_state() {
        let registry = Registry::new();
        let a = registry.counter(Metric::GetHitLocal);
        let b = registry.counter(Metric::GetHitLocal);
        a.increment(3);
        b.increment(1);
        assert_eq!(a.get(), 4);
        assert_eq!(b.get(), 4);
    }

    #[test]
    fn dump_includes_registered_values() {
        let registry = Registry::new();
        registry.counter(Metric::PutTotal).increment(2);
        registry.gauge(Gauge::InflightGets).set(5);
        registry.set_config("cache-dir", "/tmp/cache");

        let dumped = registry.dump();
        assert_eq!(dumped["counters"]["put.total"], 2);
        assert_eq!(dumped["gauges"]["inflight.gets"], 5);
        assert_eq!(dumped["config"]["cache-dir"], "/tmp/cache");
    }
}
