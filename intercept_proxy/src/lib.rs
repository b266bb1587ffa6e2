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

//! The HTTPS-intercepting reverse proxy: an outer CONNECT-hijacking bridge feeding an inner
//! HTTP-only caching proxy over a synthetic, in-process connection source. The inner server's
//! accept loop pulls already-TLS-terminated connections from a bounded channel the bridge
//! pushes into after completing a CONNECT hijack, rather than listening on a real socket.

use std::collections::HashSet;
use std::sync::Arc;

use async_oncecell::OnceCell;
use bytes::Bytes;
use cert_authority::CertAuthority;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use introspect::Registry;
use local_cache::LocalCache;
use object_store::ObjectStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha256Digest, Sha256};
use std::collections::HashMap;
use task_executor::Executor;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;
type HijackedTls = tokio_rustls::server::TlsStream<TokioIo<Upgraded>>;

const CACHEABLE_STATUSES: [u16; 4] = [200, 203, 301, 410];

#[derive(Serialize, Deserialize)]
struct CachedMeta {
    status: u16,
    headers: Vec<(String, String)>,
}

/// The result of an origin fetch, shared verbatim across every request single-flighted onto
/// the same in-flight origin fetch.
#[derive(Clone)]
struct FetchedEntry {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

fn encode_cached(meta: &CachedMeta, body: &[u8]) -> Result<Bytes, String> {
    let meta_json = serde_json::to_vec(meta).map_err(|e| format!("failed to encode cache entry: {e}"))?;
    let mut out = Vec::with_capacity(4 + meta_json.len() + body.len());
    out.extend_from_slice(&(meta_json.len() as u32).to_be_bytes());
    out.extend_from_slice(&meta_json);
    out.extend_from_slice(body);
    Ok(Bytes::from(out))
}

fn decode_cached(bytes: &[u8]) -> Result<(CachedMeta, Bytes), String> {
    if bytes.len() < 4 {
        return Err("cache entry too short to contain a length prefix".to_string());
    }
    let meta_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if bytes.len() < 4 + meta_len {
        return Err("cache entry truncated".to_string());
    }
    let meta: CachedMeta =
        serde_json::from_slice(&bytes[4..4 + meta_len]).map_err(|e| format!("corrupt cache entry metadata: {e}"))?;
    Ok((meta, Bytes::copy_from_slice(&bytes[4 + meta_len..])))
}

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::default();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn is_cacheable(status: StatusCode, headers: &HeaderMap) -> bool {
    if !CACHEABLE_STATUSES.contains(&status.as_u16()) {
        return false;
    }
    if let Some(cache_control) = headers.get(http::header::CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
        let lowered = cache_control.to_lowercase();
        if lowered.contains("no-store") || lowered.contains("private") || lowered.contains("no-cache") {
            return false;
        }
    }
    true
}

fn vary_header_names(headers: &HeaderMap) -> Vec<String> {
    headers
        .get(http::header::VARY)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|name| name.trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty() && name != "*")
                .collect()
        })
        .unwrap_or_default()
}

fn vary_values(headers: &HeaderMap, names: &[String]) -> Vec<(String, String)> {
    names
        .iter()
        .map(|name| {
            let value = headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
            (name.clone(), value)
        })
        .collect()
}

fn build_response(status: u16, headers: &[(String, String)], body: Bytes) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Full::new(body)).unwrap_or_else(|_| error_response("malformed cached response"))
}

fn error_response(message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Full::new(Bytes::from(message.to_string())))
        .expect("building a bad-gateway response never fails")
}

fn host_only(req: &Request<Incoming>) -> Option<String> {
    req.uri().host().map(|h| h.to_ascii_lowercase())
}

/// The inner caching reverse proxy: consults LocalCache + ObjectStore under the `revproxy/`
/// namespace before forwarding cacheable GETs to origin.
#[derive(Clone)]
struct InnerCache {
    local: LocalCache,
    remote: Option<ObjectStore>,
    registry: Arc<Registry>,
    http_client: HttpsClient,
    inflight: Arc<Mutex<HashMap<String, Arc<OnceCell<FetchedEntry>>>>>,
}

impl InnerCache {
    fn new(local: LocalCache, remote: Option<ObjectStore>, registry: Arc<Registry>) -> Result<InnerCache, String> {
        // rustls 0.23 needs a process-wide crypto provider installed before any TLS config can
        // be built (both for this outbound client and for the leaf certs the bridge serves);
        // idempotent, so every caller racing to install one is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| format!("failed to load native TLS roots: {e}"))?
            .https_or_http()
            .enable_http1()
            .build();
        Ok(InnerCache {
            local,
            remote,
            registry,
            http_client: Client::builder(TokioExecutor::new()).build(https),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn counter(&self, suffix: &str) -> introspect::Counter {
        self.registry.named_counter(&format!("revproxy.{suffix}"))
    }

    /// Handles one request arriving either through the inner synthetic TLS listener (scheme
    /// `"https"`) or directly from the bridge's plain-HTTP proxy-form path (scheme `"http"`).
    /// Infallible: any internal failure becomes a 502 response rather than propagating, since
    /// this is installed directly as a hyper service.
    async fn handle(&self, req: Request<Incoming>, scheme: &str) -> Response<Full<Bytes>> {
        match self.try_handle(req, scheme).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("intercept proxy request failed: {e}");
                self.counter("origin.error").increment(1);
                error_response(&e)
            }
        }
    }

    async fn try_handle(&self, req: Request<Incoming>, scheme: &str) -> Result<Response<Full<Bytes>>, String> {
        if req.method() != Method::GET {
            return self.forward_passthrough(req, scheme).await;
        }

        let url = absolute_url(&req, scheme)?;
        let url_hash = hash_parts(&[Method::GET.as_str(), &url]);
        let vary_names = self.load_vary_meta(&url_hash).await?;
        let candidate_vary = vary_values(req.headers(), &vary_names);
        let candidate_key = hash_parts(&[
            Method::GET.as_str(),
            &url,
            &candidate_vary.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&"),
        ]);
        let rel = format!("revproxy/{}", local_cache::shard_relpath(&candidate_key));

        if let Some(bytes) = self.local.read(&rel).await? {
            match decode_cached(&bytes) {
                Ok((meta, body)) => {
                    self.counter("get.hit.local").increment(1);
                    return Ok(build_response(meta.status, &meta.headers, body));
                }
                Err(e) => {
                    log::warn!("discarding corrupt cache entry {rel}: {e}");
                    self.local.remove(&rel).await.ok();
                }
            }
        }

        if let Some(remote) = &self.remote {
            match remote.get(&rel).await {
                Ok(Some(bytes)) => match decode_cached(&bytes) {
                    Ok((meta, body)) => {
                        self.local.write_bytes(&rel, bytes).await?;
                        self.counter("get.hit.remote").increment(1);
                        return Ok(build_response(meta.status, &meta.headers, body));
                    }
                    Err(e) => log::warn!("discarding corrupt remote cache entry {rel}: {e}"),
                },
                Ok(None) => {}
                Err(e) => log::debug!("remote cache lookup for {rel} failed: {e}"),
            }
        }

        self.counter("get.miss").increment(1);
        let headers = req.headers().clone();

        // Concurrent misses for the same URL single-flight onto one origin fetch; each waiter
        // independently derives its own vary-aware cache key and response from the shared
        // result, so a mid-flight change to the set of Vary headers never corrupts a waiter's
        // own request-specific view.
        let cell = {
            let mut inflight = self.inflight.lock();
            inflight.entry(url.clone()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };
        let fetch_headers = headers.clone();
        let fetch_url = url.clone();
        let entry = cell
            .get_or_try_init(async { self.fetch_origin(fetch_url, fetch_headers).await })
            .await?
            .clone();
        self.inflight.lock().remove(&url);

        let resp_headers = {
            let mut h = HeaderMap::new();
            for (name, value) in &entry.headers {
                if let (Ok(name), Ok(value)) = (http::HeaderName::try_from(name.as_str()), value.parse()) {
                    h.insert(name, value);
                }
            }
            h
        };
        let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::BAD_GATEWAY);

        if is_cacheable(status, &resp_headers) {
            let response_vary = vary_header_names(&resp_headers);
            self.save_vary_meta(&url_hash, &response_vary).await?;
            let response_vary_values = vary_values(&headers, &response_vary);
            let key = hash_parts(&[
                Method::GET.as_str(),
                &url,
                &response_vary_values
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("&"),
            ]);
            let rel = format!("revproxy/{}", local_cache::shard_relpath(&key));
            let meta = CachedMeta {
                status: entry.status,
                headers: entry.headers.clone(),
            };
            let encoded = encode_cached(&meta, &entry.body)?;
            self.local.write_bytes(&rel, encoded.clone()).await?;
            if let Some(remote) = &self.remote {
                if let Err(e) = remote.put(&rel, encoded).await {
                    log::warn!("failed to upload cached response {rel}: {e}");
                }
            }
        }

        Ok(build_response(entry.status, &entry.headers, entry.body.clone()))
    }

    async fn fetch_origin(&self, url: String, headers: HeaderMap) -> Result<FetchedEntry, String> {
        let uri: Uri = url.parse().map_err(|e| format!("invalid URL {url:?}: {e}"))?;
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        for (name, value) in headers.iter() {
            if name != http::header::HOST {
                builder = builder.header(name, value);
            }
        }
        let outbound = builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| format!("failed to build origin request: {e}"))?;

        let response = self
            .http_client
            .request(outbound)
            .await
            .map_err(|e| format!("origin request to {url:?} failed: {e}"))?;
        let status = response.status().as_u16();
        let header_pairs: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
            .collect();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| format!("failed reading origin response body: {e}"))?
            .to_bytes();

        Ok(FetchedEntry {
            status,
            headers: header_pairs,
            body,
        })
    }

    async fn load_vary_meta(&self, url_hash: &str) -> Result<Vec<String>, String> {
        let rel = format!("revproxy/vary/{url_hash}");
        match self.local.read(&rel).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| format!("corrupt vary metadata: {e}")),
            None => Ok(Vec::new()),
        }
    }

    async fn save_vary_meta(&self, url_hash: &str, names: &[String]) -> Result<(), String> {
        if names.is_empty() {
            return Ok(());
        }
        let rel = format!("revproxy/vary/{url_hash}");
        let encoded = serde_json::to_vec(names).map_err(|e| format!("failed to encode vary metadata: {e}"))?;
        self.local.write_bytes(&rel, Bytes::from(encoded)).await
    }

    /// Forwards a request to its origin without ever consulting the cache, for hosts outside
    /// `Targets`. Infallible, like `handle`.
    async fn forward_uncached(&self, req: Request<Incoming>, scheme: &str) -> Response<Full<Bytes>> {
        match self.forward_passthrough(req, scheme).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("uncached forward failed: {e}");
                error_response(&e)
            }
        }
    }

    /// Non-GET methods and any response that fails the cacheability test are forwarded
    /// uncached: no cache read, no cache write.
    async fn forward_passthrough(&self, req: Request<Incoming>, scheme: &str) -> Result<Response<Full<Bytes>>, String> {
        self.counter("passthrough").increment(1);
        let url = absolute_url(&req, scheme)?;
        let uri: Uri = url.parse().map_err(|e| format!("invalid URL {url:?}: {e}"))?;
        let method = req.method().clone();
        let headers = req.headers().clone();
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| format!("failed reading request body: {e}"))?
            .to_bytes();

        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers.iter() {
            if name != http::header::HOST {
                builder = builder.header(name, value);
            }
        }
        let outbound = builder
            .body(Full::new(body))
            .map_err(|e| format!("failed to build origin request: {e}"))?;

        let response = self
            .http_client
            .request(outbound)
            .await
            .map_err(|e| format!("origin request to {url:?} failed: {e}"))?;
        let status = response.status().as_u16();
        let header_pairs: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
            .collect();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| format!("failed reading origin response body: {e}"))?
            .to_bytes();
        Ok(build_response(status, &header_pairs, body))
    }
}

fn absolute_url(req: &Request<Incoming>, default_scheme: &str) -> Result<String, String> {
    if req.uri().scheme_str().is_some() {
        return Ok(req.uri().to_string());
    }
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| "request has neither an absolute URI nor a Host header".to_string())?;
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Ok(format!("{default_scheme}://{host}{path}"))
}

pub struct InterceptProxyOptions {
    /// Hostnames this proxy is allowed to intercept, either via CONNECT hijack or direct
    /// plain-HTTP proxy-form forwarding. Anything else is forwarded transparently.
    pub targets: Vec<String>,
}

/// The composed bridge + inner proxy.
#[derive(Clone)]
pub struct InterceptProxy {
    inner: Arc<Bridge>,
}

struct Bridge {
    targets: HashSet<String>,
    ca: Arc<CertAuthority>,
    cache: InnerCache,
    conn_tx: mpsc::Sender<HijackedTls>,
}

impl InterceptProxy {
    pub fn new(
        local: LocalCache,
        remote: Option<ObjectStore>,
        registry: Arc<Registry>,
        executor: Executor,
        ca: Arc<CertAuthority>,
        options: InterceptProxyOptions,
    ) -> Result<InterceptProxy, String> {
        let cache = InnerCache::new(local, remote, registry)?;
        let (conn_tx, conn_rx) = mpsc::channel(64);

        executor.native_spawn(Self::run_inner_server(conn_rx, cache.clone()));

        Ok(InterceptProxy {
            inner: Arc::new(Bridge {
                targets: options.targets.into_iter().map(|t| t.to_ascii_lowercase()).collect(),
                ca,
                cache,
                conn_tx,
            }),
        })
    }

    async fn run_inner_server(mut conn_rx: mpsc::Receiver<HijackedTls>, cache: InnerCache) {
        while let Some(tls_stream) = conn_rx.recv().await {
            let cache = cache.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(tls_stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let cache = cache.clone();
                    async move { Ok::<_, std::convert::Infallible>(cache.handle(req, "https").await) }
                });
                if let Err(e) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await {
                    log::debug!("inner proxy connection ended: {e}");
                }
            });
        }
    }

    pub fn is_target(&self, host: &str) -> bool {
        self.inner.targets.contains(&host.to_ascii_lowercase())
    }

    /// Routes a plain HTTP proxy-form request (the Dispatcher's job of recognizing proxy-form
    /// is already done; this decides target-vs-passthrough).
    pub async fn handle_proxy_form(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let Some(host) = host_only(&req) else {
            return error_response("proxy-form request is missing a resolvable host");
        };
        if self.inner.targets.contains(&host) {
            self.inner.cache.handle(req, "http").await
        } else {
            self.inner.cache.forward_uncached(req, "http").await
        }
    }

    /// Handles a CONNECT request: hijacks the socket and feeds it into the inner TLS-terminating
    /// proxy when the target host is in `Targets`, otherwise splices the raw bytes through to
    /// the real origin untouched.
    pub async fn handle_connect(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let Some(authority) = req.uri().authority().cloned() else {
            return error_response("CONNECT request has no authority");
        };
        let host = authority.host().to_ascii_lowercase();
        let host_port = authority.as_str().to_string();

        if self.inner.targets.contains(&host) {
            let ca = self.inner.ca.clone();
            let conn_tx = self.inner.conn_tx.clone();
            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => {
                        let io = TokioIo::new(upgraded);
                        match ca.issue(&[host.clone()]).await.and_then(|leaf| leaf.server_config()) {
                            Ok(tls_config) => {
                                let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
                                match acceptor.accept(io).await {
                                    Ok(tls_stream) => {
                                        if conn_tx.send(tls_stream).await.is_err() {
                                            log::warn!("inner proxy connection source is gone, dropping hijacked connection for {host}");
                                        }
                                    }
                                    Err(e) => log::warn!("TLS handshake after CONNECT hijack failed for {host}: {e}"),
                                }
                            }
                            Err(e) => log::warn!("failed to mint leaf certificate for {host}: {e}"),
                        }
                    }
                    Err(e) => log::warn!("CONNECT upgrade failed for {host}: {e}"),
                }
            });
        } else {
            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => match TcpStream::connect(&host_port).await {
                        Ok(mut origin) => {
                            let mut client_io = TokioIo::new(upgraded);
                            if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut origin).await {
                                log::debug!("passthrough CONNECT to {host_port} ended: {e}");
                            }
                        }
                        Err(e) => log::warn!("passthrough CONNECT failed to dial {host_port}: {e}"),
                    },
                    Err(e) => log::warn!("CONNECT upgrade failed for {host_port}: {e}"),
                }
            });
        }

        Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::new()))
            .expect("building a 200 response never fails")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cert_authority::CertAuthority;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn executor() -> Executor {
        Executor::new()
    }

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
                            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(body))))
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        (addr.to_string(), hits)
    }

    fn test_proxy(tmp: &std::path::Path) -> InterceptProxy {
        let executor = executor();
        let local = LocalCache::new(tmp.to_path_buf(), None, executor.clone());
        let ca = Arc::new(CertAuthority::generate().unwrap());
        InterceptProxy::new(
            local,
            None,
            Registry::new(),
            executor,
            ca,
            InterceptProxyOptions {
                targets: vec!["origin.test".to_string()],
            },
        )
        .unwrap()
    }

    #[test]
    fn is_cacheable_rejects_no_store() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CACHE_CONTROL, "no-store".parse().unwrap());
        assert!(!is_cacheable(StatusCode::OK, &headers));
    }

    #[test]
    fn is_cacheable_accepts_plain_200() {
        assert!(is_cacheable(StatusCode::OK, &HeaderMap::new()));
    }

    #[test]
    fn is_cacheable_rejects_uncacheable_statuses() {
        assert!(!is_cacheable(StatusCode::NOT_FOUND, &HeaderMap::new()));
    }

    #[test]
    fn encode_decode_cached_roundtrips() {
        let meta = CachedMeta {
            status: 200,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
        };
        let encoded = encode_cached(&meta, b"hello").unwrap();
        let (decoded_meta, body) = decode_cached(&encoded).unwrap();
        assert_eq!(decoded_meta.status, 200);
        assert_eq!(body, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn plain_proxy_form_get_caches_on_second_request() {
        let tmp = tempfile::tempdir().unwrap();
        let (addr, hits) = spawn_origin(b"cached payload").await;
        let proxy = test_proxy(tmp.path());

        let url: Uri = format!("http://{addr}/doc").parse().unwrap();
        let make_req = || {
            Request::builder()
                .method(Method::GET)
                .uri(url.clone())
                .body(Full::new(Bytes::new()))
                .unwrap()
        };

        // The test origin doesn't decode a real hyper::body::Incoming, so route calls through
        // the cache directly using the inner cache's handle, which is what both the bridge's
        // plain-proxy path and the synthetic TLS listener ultimately call.
        let resp1 = proxy.inner.cache.handle(to_incoming(make_req()).await, "http").await;
        assert_eq!(resp1.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let resp2 = proxy.inner.cache.handle(to_incoming(make_req()).await, "http").await;
        assert_eq!(resp2.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "second request should be served from cache");
    }

    /// Round-trips a request through a loopback TCP connection so its body arrives as a real
    /// `hyper::body::Incoming` (the type the production code path always receives).
    async fn to_incoming(req: Request<Full<Bytes>>) -> Request<Incoming> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: Request<Incoming>| {
                let tx = tx.clone();
                async move {
                    if let Some(sender) = tx.lock().take() {
                        let _ = sender.send(req);
                    }
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
                }
            });
            let _ = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await;
        });

        let client_stream = TcpStream::connect(addr).await.unwrap();
        let io = TokioIo::new(client_stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.unwrap();
        tokio::spawn(conn);
        let _ = sender.send_request(req).await;
        rx.await.unwrap()
    }
}
