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

//! Two-tier cache for module-registry artifacts (`.info`/`.mod`/`.zip`, `@latest`,
//! and sum-database lookups). Structured exactly like `action_cache` — local tier
//! first, object-store tier second, single-flight coalescing of concurrent misses —
//! with a third tier `action_cache` has no need of: the upstream registry origin
//! itself, fetched over HTTPS and written through both local tiers on success.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_oncecell::OnceCell;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use introspect::Registry;
use local_cache::LocalCache;
use object_store::ObjectStore;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use task_executor::Executor;

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// The file extensions the registry protocol serves under `@v/<version>.<ext>`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArtifactKind {
    Info,
    Mod,
    Zip,
}

impl ArtifactKind {
    pub fn ext(self) -> &'static str {
        match self {
            ArtifactKind::Info => "info",
            ArtifactKind::Mod => "mod",
            ArtifactKind::Zip => "zip",
        }
    }

    pub fn from_ext(ext: &str) -> Option<ArtifactKind> {
        match ext {
            "info" => Some(ArtifactKind::Info),
            "mod" => Some(ArtifactKind::Mod),
            "zip" => Some(ArtifactKind::Zip),
            _ => None,
        }
    }
}

/// A parsed request against the `/mod` surface (already stripped of the `/mod` prefix by the
/// Dispatcher).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParsedRequest {
    Artifact {
        module_path: String,
        version: String,
        kind: ArtifactKind,
    },
    Latest {
        module_path: String,
    },
    SumLookup {
        module_at_version: String,
    },
}

/// Parses a dispatcher-stripped path (e.g. `/example.com/foo/@v/v1.2.3.zip`,
/// `/example.com/foo/@latest`, `/lookup/example.com/foo@v1.2.3`) into a `ParsedRequest`.
/// Returns `None` for anything that doesn't match one of those three shapes.
pub fn parse_request(path: &str) -> Option<ParsedRequest> {
    let path = path.trim_start_matches('/');

    if let Some(rest) = path.strip_prefix("lookup/") {
        return Some(ParsedRequest::SumLookup {
            module_at_version: rest.to_string(),
        });
    }

    if let Some(module_path) = path.strip_suffix("/@latest") {
        return Some(ParsedRequest::Latest {
            module_path: module_path.to_string(),
        });
    }

    let (module_path, filename) = path.split_once("/@v/")?;
    let (version, ext) = filename.rsplit_once('.')?;
    let kind = ArtifactKind::from_ext(ext)?;
    Some(ParsedRequest::Artifact {
        module_path: module_path.to_string(),
        version: version.to_string(),
        kind,
    })
}

/// Decodes Go's module-path escaping (`!x` -> uppercase `X`), then lowercases the result, so
/// that a module path and its escaped form collide on the same cache key.
fn canonicalize_module_path(module_path: &str) -> Result<String, String> {
    let mut out = String::with_capacity(module_path.len());
    let mut chars = module_path.chars();
    while let Some(c) = chars.next() {
        if c == '!' {
            match chars.next() {
                Some(c2) if c2.is_ascii_lowercase() => out.push(c2.to_ascii_uppercase()),
                Some(c2) => return Err(format!("invalid escape '!{c2}' in module path {module_path:?}")),
                None => return Err(format!("trailing '!' in module path {module_path:?}")),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out.to_lowercase())
}

/// Re-escapes a module path for use in an outbound request to the origin registry, which
/// expects uppercase letters spelled out as `!`-prefixed lowercase.
fn escape_module_path(module_path: &str) -> String {
    let mut out = String::with_capacity(module_path.len());
    for c in module_path.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::default();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ModuleCacheOptions {
    /// Base URL of the upstream module registry, e.g. `https://proxy.golang.org`.
    pub origin_base_url: String,
    /// Allowlisted sum database hosts, tried in order for `/lookup/...` requests.
    pub sumdb_hosts: Vec<String>,
    /// How long a locally cached `@latest` response is served before being refreshed.
    pub latest_ttl: Duration,
}

struct Inflight {
    fetches: Mutex<HashMap<String, Arc<OnceCell<Bytes>>>>,
}

#[derive(Clone)]
pub struct ModuleCache {
    inner: Arc<Inner>,
}

struct Inner {
    local: LocalCache,
    remote: Option<ObjectStore>,
    registry: Arc<Registry>,
    #[allow(dead_code)]
    executor: Executor,
    http_client: HttpsClient,
    origin_base_url: String,
    sumdb_hosts: Vec<String>,
    latest_ttl: Duration,
    inflight: Inflight,
}

impl ModuleCache {
    pub fn new(
        local: LocalCache,
        remote: Option<ObjectStore>,
        registry: Arc<Registry>,
        executor: Executor,
        options: ModuleCacheOptions,
    ) -> Result<ModuleCache, String> {
        // rustls 0.23 needs a process-wide crypto provider installed before any TLS config can
        // be built; idempotent, so every caller racing to install one is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| format!("failed to load native TLS roots: {e}"))?
            .https_or_http()
            .enable_http1()
            .build();
        let http_client = Client::builder(TokioExecutor::new()).build(https);

        Ok(ModuleCache {
            inner: Arc::new(Inner {
                local,
                remote,
                registry,
                executor,
                http_client,
                origin_base_url: options.origin_base_url.trim_end_matches('/').to_string(),
                sumdb_hosts: options.sumdb_hosts,
                latest_ttl: options.latest_ttl,
                inflight: Inflight {
                    fetches: Mutex::new(HashMap::new()),
                },
            }),
        })
    }

    /// Whether any sum database host is configured. The Dispatcher uses this to reject
    /// `/lookup/...` requests with 404 rather than 502 when the allowlist is empty.
    pub fn has_sumdb(&self) -> bool {
        !self.inner.sumdb_hosts.is_empty()
    }

    /// Serves a parsed request, consulting local, then remote, then (for artifacts and
    /// `@latest`) the upstream origin, or (for sum lookups) the sum database allowlist.
    pub async fn serve(&self, request: &ParsedRequest) -> Result<Bytes, String> {
        match request {
            ParsedRequest::Artifact {
                module_path,
                version,
                kind,
            } => self.fetch_artifact(module_path, version, *kind).await,
            ParsedRequest::Latest { module_path } => self.fetch_latest(module_path).await,
            ParsedRequest::SumLookup { module_at_version } => {
                self.sum_lookup(module_at_version).await
            }
        }
    }

    async fn fetch_artifact(
        &self,
        module_path: &str,
        version: &str,
        kind: ArtifactKind,
    ) -> Result<Bytes, String> {
        let canon = canonicalize_module_path(module_path)?;
        let rel = format!("module/{canon}/@v/{version}.{}", kind.ext());
        let object_key = rel.clone();

        if let Some(bytes) = self.inner.local.read(&rel).await? {
            self.counter("get.hit.local").increment(1);
            return Ok(bytes.into());
        }

        let module_path = module_path.to_string();
        let version = version.to_string();
        self.single_flight(rel.clone(), async move {
            if let Some(bytes) = self.fetch_remote(&object_key, &rel).await? {
                self.counter("get.hit.remote").increment(1);
                return Ok(bytes);
            }

            let origin_path = format!("{}/@v/{version}.{}", escape_module_path(&module_path), kind.ext());
            let bytes = self.fetch_origin(&origin_path).await?;
            self.inner.local.write_bytes(&rel, bytes.clone()).await?;
            if let Some(remote) = &self.inner.remote {
                if let Err(e) = remote.put(&object_key, bytes.clone()).await {
                    log::warn!("failed to upload module artifact {object_key}: {e}");
                }
            }
            self.counter("fetch.origin").increment(1);
            Ok(bytes)
        })
        .await
    }

    /// `@latest` is revalidated against the origin every `latest_ttl` and is never uploaded to
    /// the object store: its mutability means a remote copy would go stale with no way to
    /// invalidate it fleet-wide.
    async fn fetch_latest(&self, module_path: &str) -> Result<Bytes, String> {
        let canon = canonicalize_module_path(module_path)?;
        let rel = format!("module/{canon}/@latest");

        if let Ok(metadata) = tokio::fs::metadata(self.inner.local.path_for(&rel)).await {
            let fresh = metadata
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map(|age| age < self.inner.latest_ttl)
                .unwrap_or(false);
            if fresh {
                if let Some(bytes) = self.inner.local.read(&rel).await? {
                    self.counter("get.hit.local").increment(1);
                    return Ok(bytes.into());
                }
            }
        }

        let module_path = module_path.to_string();
        self.single_flight(rel.clone(), async move {
            let origin_path = format!("{}/@latest", escape_module_path(&module_path));
            let bytes = self.fetch_origin(&origin_path).await?;
            self.inner.local.write_bytes(&rel, bytes.clone()).await?;
            self.counter("latest.refresh").increment(1);
            Ok(bytes)
        })
        .await
    }

    /// Forwards `/lookup/<module@version>` to the first reachable allowlisted sum database,
    /// caching the response identically to a module artifact.
    async fn sum_lookup(&self, module_at_version: &str) -> Result<Bytes, String> {
        if self.inner.sumdb_hosts.is_empty() {
            return Err("no sum databases configured".to_string());
        }

        let digest = hex_sha256(module_at_version);
        let rel = format!("sumdb/{digest}");
        let object_key = rel.clone();

        if let Some(bytes) = self.inner.local.read(&rel).await? {
            self.counter("get.hit.local").increment(1);
            return Ok(bytes.into());
        }

        let module_at_version = module_at_version.to_string();
        self.single_flight(rel.clone(), async move {
            if let Some(bytes) = self.fetch_remote(&object_key, &rel).await? {
                self.counter("get.hit.remote").increment(1);
                return Ok(bytes);
            }

            let mut last_err = None;
            for host in &self.inner.sumdb_hosts {
                let url = format!("https://{host}/lookup/{module_at_version}");
                match self.fetch_origin(&url).await {
                    Ok(bytes) => {
                        self.inner.local.write_bytes(&rel, bytes.clone()).await?;
                        if let Some(remote) = &self.inner.remote {
                            if let Err(e) = remote.put(&object_key, bytes.clone()).await {
                                log::warn!("failed to upload sumdb lookup {object_key}: {e}");
                            }
                        }
                        self.counter("fetch.origin").increment(1);
                        return Ok(bytes);
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            self.counter("fetch.error").increment(1);
            Err(last_err.unwrap_or_else(|| "sum database lookup failed".to_string()))
        })
        .await
    }

    async fn fetch_remote(&self, object_key: &str, local_rel: &str) -> Result<Option<Bytes>, String> {
        let Some(remote) = &self.inner.remote else {
            return Ok(None);
        };
        match remote.get(object_key).await {
            Ok(Some(bytes)) => {
                self.inner.local.write_bytes(local_rel, bytes.clone()).await?;
                Ok(Some(bytes))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn fetch_origin(&self, path_or_url: &str) -> Result<Bytes, String> {
        let url = if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            path_or_url.to_string()
        } else {
            format!("{}/{}", self.inner.origin_base_url, path_or_url.trim_start_matches('/'))
        };
        let uri: Uri = url.parse().map_err(|e| format!("invalid origin URL {url:?}: {e}"))?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| format!("failed to build origin request: {e}"))?;

        let response = self
            .inner
            .http_client
            .request(request)
            .await
            .map_err(|e| format!("origin request to {url:?} failed: {e}"))?;

        if !response.status().is_success() {
            self.counter("fetch.error").increment(1);
            return Err(format!("origin {url:?} responded with {}", response.status()));
        }

        response
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| format!("failed to read origin response body from {url:?}: {e}"))
    }

    /// Coalesces concurrent fetches for the same cache-relative key onto a single attempt.
    async fn single_flight<Fut>(&self, key: String, fetch: Fut) -> Result<Bytes, String>
    where
        Fut: std::future::Future<Output = Result<Bytes, String>>,
    {
        let cell = {
            let mut fetches = self.inner.inflight.fetches.lock();
            fetches
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell.get_or_try_init(fetch).await.map(|bytes| bytes.clone());

        self.inner.inflight.fetches.lock().remove(&key);

        match &result {
            Ok(_) => {}
            Err(_) => self.counter("fetch.error").increment(1),
        }
        result
    }

    fn counter(&self, suffix: &str) -> introspect::Counter {
        self.inner.registry.named_counter(&format!("modcache.{suffix}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use object_store::ObjectStoreOptions;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn executor() -> Executor {
        Executor::new()
    }

    /// Starts a minimal HTTP/1 origin server that serves `body` for every request and reports
    /// how many requests it has received via the returned counter.
    async fn spawn_origin(body: &'static [u8]) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_for_server = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let hits = hits_for_server.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let hits = hits.clone();
                        async move {
                            hits.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, Infallible>(hyper::Response::new(Full::new(Bytes::from_static(body))))
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        (format!("http://{addr}"), hits)
    }

    fn test_cache(tmp: &std::path::Path, origin_base_url: String) -> ModuleCache {
        let executor = executor();
        let local = LocalCache::new(tmp.to_path_buf(), None, executor.clone());
        let remote = ObjectStore::s3(ObjectStoreOptions {
            bucket: "unused".to_string(),
            region: None,
            endpoint: None,
            path_style: true,
            key_prefix: String::new(),
            concurrency_limit: 1,
            rpc_timeout: Duration::from_secs(1),
            rpc_retries: 0,
        })
        .ok();
        ModuleCache::new(
            local,
            remote,
            Registry::new(),
            executor,
            ModuleCacheOptions {
                origin_base_url,
                sumdb_hosts: vec!["sum.example.test".to_string()],
                latest_ttl: Duration::from_secs(300),
            },
        )
        .unwrap()
    }

    #[test]
    fn parse_request_recognizes_versioned_artifacts() {
        let parsed = parse_request("/example.com/foo/@v/v1.2.3.zip").unwrap();
        assert_eq!(
            parsed,
            ParsedRequest::Artifact {
                module_path: "example.com/foo".to_string(),
                version: "v1.2.3".to_string(),
                kind: ArtifactKind::Zip,
            }
        );
    }

    #[test]
    fn parse_request_recognizes_latest() {
        let parsed = parse_request("/example.com/foo/@latest").unwrap();
        assert_eq!(
            parsed,
            ParsedRequest::Latest {
                module_path: "example.com/foo".to_string(),
            }
        );
    }

    #[test]
    fn parse_request_recognizes_sum_lookups() {
        let parsed = parse_request("/lookup/example.com/foo@v1.2.3").unwrap();
        assert_eq!(
            parsed,
            ParsedRequest::SumLookup {
                module_at_version: "example.com/foo@v1.2.3".to_string(),
            }
        );
    }

    #[test]
    fn parse_request_rejects_unknown_extensions() {
        assert!(parse_request("/example.com/foo/@v/v1.0.0.exe").is_none());
    }

    #[test]
    fn canonicalize_decodes_escapes_and_lowercases() {
        assert_eq!(
            canonicalize_module_path("rsc.io/!quote").unwrap(),
            "rsc.io/quote"
        );
        assert_eq!(
            canonicalize_module_path("rsc.io/Quote").unwrap(),
            "rsc.io/quote"
        );
    }

    #[tokio::test]
    async fn fetch_artifact_falls_through_to_origin_and_caches_locally() {
        let tmp = tempfile::tempdir().unwrap();
        let (base_url, hits) = spawn_origin(b"module bytes").await;
        let cache = test_cache(tmp.path(), base_url);

        let got = cache
            .fetch_artifact("example.com/foo", "v1.0.0", ArtifactKind::Zip)
            .await
            .unwrap();
        assert_eq!(got, Bytes::from_static(b"module bytes"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Second fetch is served from the local tier without another origin request.
        let got_again = cache
            .fetch_artifact("example.com/foo", "v1.0.0", ArtifactKind::Zip)
            .await
            .unwrap();
        assert_eq!(got_again, Bytes::from_static(b"module bytes"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_fetches_of_the_same_artifact_single_flight_to_one_origin_hit() {
        let tmp = tempfile::tempdir().unwrap();
        let (base_url, hits) = spawn_origin(b"shared bytes").await;
        let cache = test_cache(tmp.path(), base_url);

        let futures = (0..10).map(|_| cache.fetch_artifact("example.com/bar", "v2.0.0", ArtifactKind::Info));
        let results = futures::future::join_all(futures).await;
        for r in results {
            assert_eq!(r.unwrap(), Bytes::from_static(b"shared bytes"));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn latest_is_refetched_once_ttl_elapses() {
        let tmp = tempfile::tempdir().unwrap();
        let (base_url, hits) = spawn_origin(b"latest bytes").await;
        let mut cache = test_cache(tmp.path(), base_url);
        Arc::get_mut(&mut cache.inner).unwrap().latest_ttl = Duration::from_millis(20);

        cache.fetch_latest("example.com/baz").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        cache.fetch_latest("example.com/baz").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1, "still within TTL");

        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.fetch_latest("example.com/baz").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2, "TTL elapsed, should refetch");
    }

    #[tokio::test]
    async fn sum_lookup_without_configured_hosts_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = executor();
        let local = LocalCache::new(tmp.path().to_path_buf(), None, executor.clone());
        let cache = ModuleCache::new(
            local,
            None,
            Registry::new(),
            executor,
            ModuleCacheOptions {
                origin_base_url: "http://unused.test".to_string(),
                sumdb_hosts: vec![],
                latest_ttl: Duration::from_secs(300),
            },
        )
        .unwrap();

        assert!(cache.sum_lookup("example.com/foo@v1.0.0").await.is_err());
    }
}
