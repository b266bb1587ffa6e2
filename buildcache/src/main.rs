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

//! `serve` starts the cache server (IPC endpoint, and optionally an HTTP listener carrying the
//! module proxy and/or intercept proxy); `connect` is the compiler-side client. Neither
//! subcommand runs inside a `#[tokio::main]` runtime: each builds its own owned `Executor` so
//! that the top-level `Result<(), String>` each returns can be mapped to a process exit code
//! before any runtime machinery unwinds.

mod cli;
mod connect;
mod serve;

use clap::Parser;

fn main() {
    let cli = cli::Cli::parse();

    let debug_log: &[String] = match &cli.command {
        cli::Command::Serve(args) => &args.debug_log,
        cli::Command::Connect(_) => &[],
    };
    cli::init_logging(debug_log);

    let exit_code = match cli.command {
        cli::Command::Serve(args) => serve::run(args),
        cli::Command::Connect(args) => connect::run(args),
    };
    std::process::exit(exit_code);
}
