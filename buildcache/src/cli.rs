// Copyright 2026 BuildCache Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Argument parsing and logging setup. `--debug-log` is a comma-separated set of module
//! names (`buildcache`, `modproxy`, `revproxy`) that get `debug` level regardless of the
//! default filter; `RUST_LOG` still overrides everything, matching `env_logger`'s own
//! precedence rules.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "buildcache", about = "A build-acceleration cache server.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Starts the action-cache IPC endpoint and, optionally, the HTTP listener.
    Serve(ServeArgs),
    /// Speaks the compiler's cache protocol on stdio, proxying to a running `serve`.
    Connect(ConnectArgs),
}

#[derive(Parser)]
pub struct ServeArgs {
    /// Root directory for all local cache tiers and the IPC socket.
    #[arg(long, default_value = "/tmp/buildcache")]
    pub cache_dir: PathBuf,

    /// S3-compatible bucket used as the remote cache tier. Remote tiers are disabled
    /// entirely when this is unset.
    #[arg(long)]
    pub bucket: Option<String>,

    #[arg(long)]
    pub region: Option<String>,

    #[arg(long)]
    pub endpoint: Option<String>,

    /// Address objects as `https://host/bucket/key` rather than `https://bucket.host/key`.
    #[arg(long)]
    pub path_style: bool,

    #[arg(long, default_value = "")]
    pub key_prefix: String,

    /// Bound on simultaneously active action-cache requests (IPC `get`/`put` calls).
    #[arg(long, default_value_t = 8)]
    pub concurrency: usize,

    /// Bound on simultaneous action-output uploads to the remote tier.
    #[arg(long, default_value_t = 16)]
    pub s3_concurrency: usize,

    /// Outputs smaller than this (bytes) are kept local-only, never uploaded.
    #[arg(long, default_value_t = 0)]
    pub min_upload_size: usize,

    /// TTL, in seconds, for local cache entries before the pruner reclaims them. Unset
    /// disables pruning.
    #[arg(long)]
    pub expiration: Option<u64>,

    /// Address to bind the HTTP listener (dispatcher + module proxy + intercept proxy) to.
    /// When unset, only the IPC endpoint runs.
    #[arg(long)]
    pub http: Option<SocketAddr>,

    /// Base URL of the upstream module registry; enables `/mod/...` when set.
    #[arg(long)]
    pub modproxy: Option<String>,

    /// Comma-separated hostnames to intercept via the HTTPS reverse proxy; enables the
    /// intercept proxy when set.
    #[arg(long, value_delimiter = ',')]
    pub revproxy: Vec<String>,

    /// Comma-separated sum database hostnames allowlisted for `/mod/lookup/...`.
    #[arg(long, value_delimiter = ',')]
    pub sumdb: Vec<String>,

    /// Comma-separated set of `buildcache|modproxy|revproxy` module targets to force to
    /// debug-level logging.
    #[arg(long, value_delimiter = ',')]
    pub debug_log: Vec<String>,

    /// Grace period for draining in-flight requests and the upload queue on shutdown.
    #[arg(long, default_value_t = 10)]
    pub shutdown_grace_secs: u64,
}

impl ServeArgs {
    pub fn expiration_duration(&self) -> Option<Duration> {
        self.expiration.map(Duration::from_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Parser)]
pub struct ConnectArgs {
    /// Root directory a running `serve` was started with; `<cache-dir>/buildcache.sock`
    /// is where it listens.
    #[arg(long, default_value = "/tmp/buildcache")]
    pub cache_dir: PathBuf,
}

/// Installs `env_logger`, applying `--debug-log`'s per-module overrides underneath
/// whatever `RUST_LOG` (or its absence) already specifies.
pub fn init_logging(debug_log: &[String]) {
    let mut builder = env_logger::Builder::from_default_env();
    for module in debug_log {
        builder.filter_module(module, log::LevelFilter::Debug);
    }
    builder.init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_parses_comma_separated_lists() {
        let cli = Cli::parse_from([
            "buildcache",
            "serve",
            "--revproxy",
            "example.com,registry.example.com",
            "--sumdb",
            "sum.golang.org",
            "--debug-log",
            "modproxy,revproxy",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected the serve subcommand");
        };
        assert_eq!(args.revproxy, vec!["example.com", "registry.example.com"]);
        assert_eq!(args.sumdb, vec!["sum.golang.org"]);
        assert_eq!(args.debug_log, vec!["modproxy", "revproxy"]);
    }

    #[test]
    fn serve_defaults_leave_optional_components_disabled() {
        let cli = Cli::parse_from(["buildcache", "serve"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected the serve subcommand");
        };
        assert!(args.bucket.is_none());
        assert!(args.modproxy.is_none());
        assert!(args.revproxy.is_empty());
        assert!(args.http.is_none());
        assert_eq!(args.expiration_duration(), None);
    }

    #[test]
    fn connect_defaults_cache_dir() {
        let cli = Cli::parse_from(["buildcache", "connect"]);
        let Command::Connect(args) = cli.command else {
            panic!("expected the connect subcommand");
        };
        assert_eq!(args.cache_dir, PathBuf::from("/tmp/buildcache"));
    }
}
