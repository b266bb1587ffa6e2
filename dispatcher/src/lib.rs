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

//! The single HTTP front door: routes proxy-form requests to `InterceptProxy`, `/debug/*` to
//! introspection, `/mod/*` GETs to `ModuleCache`, and refuses everything else. The action-cache
//! endpoint is deliberately never mounted here — it is only reachable over the `ipc` crate's
//! local socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use intercept_proxy::InterceptProxy;
use introspect::Registry;
use module_cache::ModuleCache;

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("building a simple text response never fails")
}

fn json_response(value: &serde_json::Value) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode /debug/vars"))
}

/// Returns true when the request is in proxy form: the target is an absolute URI (or a CONNECT
/// authority) whose host matches the request's own `Host` header. CONNECT is unconditionally
/// proxy-form since it has no other meaning on this server.
fn is_proxy_form(req: &Request<Incoming>) -> bool {
    if req.method() == Method::CONNECT {
        return true;
    }
    let Some(url_host) = req.uri().host() else {
        return false;
    };
    let Some(host_header) = req.headers().get(http::header::HOST).and_then(|h| h.to_str().ok()) else {
        return false;
    };
    let host_header_host = host_header.split(':').next().unwrap_or(host_header);
    url_host.eq_ignore_ascii_case(host_header_host)
}

/// The single HTTP entrypoint, wired to the optional components the `serve` subcommand's flags
/// enable (`--revproxy`, `--modproxy`).
#[derive(Clone)]
pub struct Dispatcher {
    intercept: Option<InterceptProxy>,
    module_cache: Option<ModuleCache>,
    registry: Arc<Registry>,
    shutting_down: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        intercept: Option<InterceptProxy>,
        module_cache: Option<ModuleCache>,
        registry: Arc<Registry>,
        shutting_down: Arc<AtomicBool>,
    ) -> Dispatcher {
        Dispatcher {
            intercept,
            module_cache,
            registry,
            shutting_down,
        }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
        }

        if is_proxy_form(&req) {
            return self.route_to_intercept(req).await;
        }

        let path = req.uri().path().to_string();
        if let Some(rest) = path.strip_prefix("/debug/") {
            return self.handle_debug(rest);
        }
        if path == "/debug" {
            return self.handle_debug("");
        }

        if let Some(rest) = path.strip_prefix("/mod/") {
            return self.route_to_module_cache(req.method(), rest).await;
        }
        if path == "/mod" {
            return self.route_to_module_cache(req.method(), "").await;
        }

        text_response(StatusCode::NOT_FOUND, "not found")
    }

    async fn route_to_intercept(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        match &self.intercept {
            Some(intercept) if req.method() == Method::CONNECT => intercept.handle_connect(req).await,
            Some(intercept) => intercept.handle_proxy_form(req).await,
            None => text_response(StatusCode::BAD_GATEWAY, "intercept proxy is not configured"),
        }
    }

    fn handle_debug(&self, rest: &str) -> Response<Full<Bytes>> {
        match rest {
            // `/debug/pprof`-equivalent deliberately not implemented; `vars` is the only endpoint.
            "vars" => json_response(&self.registry.dump()),
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    async fn route_to_module_cache(&self, method: &Method, rest: &str) -> Response<Full<Bytes>> {
        if method != Method::GET {
            return text_response(StatusCode::NOT_FOUND, "not found");
        }
        let Some(module_cache) = &self.module_cache else {
            return text_response(StatusCode::NOT_FOUND, "module proxy is not configured");
        };
        let Some(parsed) = module_cache::parse_request(rest) else {
            return text_response(StatusCode::NOT_FOUND, "unrecognized module cache path");
        };
        if matches!(parsed, module_cache::ParsedRequest::SumLookup { .. }) && !module_cache.has_sumdb() {
            return text_response(StatusCode::NOT_FOUND, "no sum database configured");
        }
        match module_cache.serve(&parsed).await {
            Ok(bytes) => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(bytes))
                .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "malformed module response")),
            Err(e) => {
                log::warn!("module cache request for {rest:?} failed: {e}");
                text_response(StatusCode::BAD_GATEWAY, e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use local_cache::LocalCache;
    use module_cache::ModuleCacheOptions;
    use std::convert::Infallible;
    use std::time::Duration;
    use task_executor::Executor;
    use tokio::net::TcpListener;
    use tokio::net::TcpStream;

    async fn to_incoming(req: Request<Full<Bytes>>) -> Request<Incoming> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Arc::new(parking_lot::Mutex::new(Some(tx)));

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

    fn test_dispatcher(tmp: &std::path::Path, module_cache: Option<ModuleCache>) -> Dispatcher {
        let registry = Registry::new();
        registry.set_config("cache-dir", tmp.to_string_lossy().to_string());
        let shutting_down = Arc::new(AtomicBool::new(false));
        Dispatcher::new(None, module_cache, registry, shutting_down)
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(tmp.path(), None);
        let req = Request::builder().uri("/nope").body(Full::new(Bytes::new())).unwrap();
        let resp = dispatcher.handle(to_incoming(req).await).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn debug_vars_serves_registry_dump() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(tmp.path(), None);
        let req = Request::builder().uri("/debug/vars").body(Full::new(Bytes::new())).unwrap();
        let resp = dispatcher.handle(to_incoming(req).await).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["config"]["cache-dir"], tmp.path().to_string_lossy().to_string());
    }

    #[tokio::test]
    async fn debug_pprof_equivalent_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(tmp.path(), None);
        let req = Request::builder().uri("/debug/pprof").body(Full::new(Bytes::new())).unwrap();
        let resp = dispatcher.handle(to_incoming(req).await).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutting_down_refuses_with_503() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let shutting_down = Arc::new(AtomicBool::new(true));
        let dispatcher = Dispatcher::new(None, None, registry, shutting_down);
        let req = Request::builder().uri("/debug/vars").body(Full::new(Bytes::new())).unwrap();
        let resp = dispatcher.handle(to_incoming(req).await).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn module_cache_not_configured_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(tmp.path(), None);
        let req = Request::builder()
            .uri("/mod/example.com/foo/@v/v1.0.0.zip")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = dispatcher.handle(to_incoming(req).await).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn proxy_form_request_without_intercept_configured_is_502() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(tmp.path(), None);
        let req = Request::builder()
            .uri("http://example.test/doc")
            .header(http::header::HOST, "example.test")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = dispatcher.handle(to_incoming(req).await).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn sum_lookup_without_sumdb_configured_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = Executor::new();
        let local = LocalCache::new(tmp.path().to_owned(), None, executor.clone());
        let module_cache = ModuleCache::new(
            local,
            None,
            Registry::new(),
            executor,
            ModuleCacheOptions {
                origin_base_url: "https://proxy.example.test".to_string(),
                sumdb_hosts: Vec::new(),
                latest_ttl: Duration::from_secs(300),
            },
        )
        .unwrap();
        let dispatcher = test_dispatcher(tmp.path(), Some(module_cache));
        let req = Request::builder()
            .uri("/mod/lookup/example.com/foo@v1.0.0")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = dispatcher.handle(to_incoming(req).await).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
