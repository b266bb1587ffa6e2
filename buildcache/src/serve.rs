// Copyright 2026 BuildCache Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Component wiring and the shutdown sequence for the `serve` subcommand.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use action_cache::{ActionCache, ActionCacheOptions};
use cert_authority::CertAuthority;
use dispatcher::Dispatcher;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use intercept_proxy::{InterceptProxy, InterceptProxyOptions};
use introspect::{Gauge, Registry};
use ipc::IpcServer;
use local_cache::LocalCache;
use module_cache::{ModuleCache, ModuleCacheOptions};
use object_store::{ObjectStore, ObjectStoreOptions};
use task_executor::{DrainGroup, Executor};
use tokio::net::TcpListener;

use crate::cli::ServeArgs;

const OBJECT_STORE_TIMEOUT: Duration = Duration::from_secs(30);
const OBJECT_STORE_RETRIES: usize = 3;
const MODULE_LATEST_TTL: Duration = Duration::from_secs(5 * 60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Blocks for the lifetime of the server, returning the process exit code to use.
pub fn run(args: ServeArgs) -> i32 {
    let executor = match Executor::new_owned(num_cpus(), num_cpus() * 4) {
        Ok(executor) => executor,
        Err(e) => {
            log::error!("failed to start the runtime: {e}");
            return 1;
        }
    };

    let result = executor.block_on(run_async(args, executor.clone()));
    executor.shutdown(Duration::from_secs(5));

    match result {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{e}");
            2
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// Builds a `LocalCache` tier rooted at `<cache-dir>/<name>` and, if a TTL is configured,
/// starts its background pruner.
fn local_tier(args: &ServeArgs, name: &str, executor: &Executor) -> LocalCache {
    let ttl = args.expiration_duration();
    let local = LocalCache::new(args.cache_dir.join(name), ttl, executor.clone());
    if let Some(ttl) = ttl {
        local.spawn_pruner(PRUNE_INTERVAL.min(ttl));
    }
    local
}

async fn run_async(args: ServeArgs, executor: Executor) -> Result<(), String> {
    tokio::fs::create_dir_all(&args.cache_dir)
        .await
        .map_err(|e| format!("failed to create cache dir {:?}: {e}", args.cache_dir))?;

    let registry = Registry::new();
    registry.set_config("cache-dir", args.cache_dir.to_string_lossy().to_string());
    registry.set_config("http", args.http.map(|a| a.to_string()).unwrap_or_default());

    let remote = build_object_store(&args)?;
    let local = local_tier(&args, "actions", &executor);

    let action_cache = ActionCache::new(
        local.clone(),
        remote.clone(),
        registry.clone(),
        executor.clone(),
        ActionCacheOptions {
            min_upload_size: args.min_upload_size,
            request_concurrency: args.concurrency,
            upload_concurrency: args.s3_concurrency,
        },
    );

    let ipc_socket = args.cache_dir.join("buildcache.sock");
    let ipc_server = IpcServer::bind(executor.clone(), ipc_socket.clone(), action_cache.clone())
        .await
        .map_err(|e| format!("failed to start IPC server: {e}"))?;
    log::info!("buildcache IPC listening on {ipc_socket:?}");

    let module_cache = build_module_cache(&args, remote.clone(), &registry, &executor)?;
    let intercept_proxy = build_intercept_proxy(&args, remote, &registry, &executor)?;

    let shutting_down = Arc::new(AtomicBool::new(false));
    let dispatcher = Dispatcher::new(intercept_proxy, module_cache, registry.clone(), shutting_down.clone());

    let drain = DrainGroup::new();
    let http_listener = match args.http {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .map_err(|e| format!("failed to bind http listener on {addr}: {e}"))?,
        ),
        None => None,
    };
    if let Some(listener) = &http_listener {
        log::info!("buildcache http listening on {}", listener.local_addr().map_err(|e| e.to_string())?);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    if let Some(listener) = http_listener {
        let dispatcher = dispatcher.clone();
        let drain = drain.clone();
        let handle = executor.handle().clone();
        executor.native_spawn(accept_http(listener, dispatcher, shutdown_rx, drain, handle));
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for ctrl-c: {e}"))?;
    log::info!("buildcache shutting down");

    shutting_down.store(true, Ordering::Relaxed);
    let _ = shutdown_tx.send(true);

    let grace = args.shutdown_grace();
    drain.wait(grace).await;
    wait_for_uploads_to_drain(&registry, grace).await;

    local.stop_pruning();
    ipc_server.shutdown().await;

    Ok(())
}

fn build_object_store(args: &ServeArgs) -> Result<Option<ObjectStore>, String> {
    let Some(bucket) = &args.bucket else {
        return Ok(None);
    };
    let store = ObjectStore::s3(ObjectStoreOptions {
        bucket: bucket.clone(),
        region: args.region.clone(),
        endpoint: args.endpoint.clone(),
        path_style: args.path_style,
        key_prefix: args.key_prefix.clone(),
        concurrency_limit: args.s3_concurrency,
        rpc_timeout: OBJECT_STORE_TIMEOUT,
        rpc_retries: OBJECT_STORE_RETRIES,
    })
    .map_err(|e| format!("failed to configure remote cache: {e}"))?;
    Ok(Some(store))
}

fn build_module_cache(
    args: &ServeArgs,
    remote: Option<ObjectStore>,
    registry: &Arc<Registry>,
    executor: &Executor,
) -> Result<Option<ModuleCache>, String> {
    let Some(origin_base_url) = &args.modproxy else {
        return Ok(None);
    };
    let local = local_tier(args, "module", executor);
    let module_cache = ModuleCache::new(
        local,
        remote,
        registry.clone(),
        executor.clone(),
        ModuleCacheOptions {
            origin_base_url: origin_base_url.clone(),
            sumdb_hosts: args.sumdb.clone(),
            latest_ttl: MODULE_LATEST_TTL,
        },
    )
    .map_err(|e| format!("failed to configure module proxy: {e}"))?;
    Ok(Some(module_cache))
}

fn build_intercept_proxy(
    args: &ServeArgs,
    remote: Option<ObjectStore>,
    registry: &Arc<Registry>,
    executor: &Executor,
) -> Result<Option<InterceptProxy>, String> {
    if args.revproxy.is_empty() {
        return Ok(None);
    }
    let ca = CertAuthority::generate().map_err(|e| format!("failed to generate the local CA: {e}"))?;
    cert_authority::install_to_os_trust_store(&ca.ca_cert_pem());

    let local = local_tier(args, "revproxy", executor);
    let intercept_proxy = InterceptProxy::new(
        local,
        remote,
        registry.clone(),
        executor.clone(),
        Arc::new(ca),
        InterceptProxyOptions {
            targets: args.revproxy.clone(),
        },
    )
    .map_err(|e| format!("failed to configure the intercept proxy: {e}"))?;
    Ok(Some(intercept_proxy))
}

/// Uploads are detached tasks on the shared executor rather than members of `drain`
/// (`ActionCache::close` intentionally leaves draining to the caller); poll the inflight-uploads
/// gauge down to zero instead.
async fn wait_for_uploads_to_drain(registry: &Arc<Registry>, grace: Duration) {
    let gauge = registry.gauge(Gauge::InflightUploads);
    let deadline = tokio::time::Instant::now() + grace;
    while gauge.get() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if gauge.get() > 0 {
        log::warn!("{} upload(s) still in flight after the shutdown grace period", gauge.get());
    }
}

async fn accept_http(
    listener: TcpListener,
    dispatcher: Dispatcher,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    drain: DrainGroup,
    handle: tokio::runtime::Handle,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("http accept failed: {e}");
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let dispatcher = dispatcher.clone();
        drain.spawn_on(&format!("http-conn-{peer}"), &handle, async move {
            let service = service_fn(move |req| {
                let dispatcher = dispatcher.clone();
                async move { Ok::<_, Infallible>(dispatcher.handle(req).await) }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                log::debug!("http connection from {peer} ended: {e}");
            }
        });
    }
}
