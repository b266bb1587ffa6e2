// Copyright 2026 BuildCache Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The `connect` subcommand: a thin relay that frames the same `ipc` protocol over stdio and
//! forwards each request to a running `serve`'s Unix socket, so a compiler that only speaks
//! stdio can still reach the cache's IPC endpoint.

use ipc::{read_frame, write_frame, Request, Response};
use tokio::io::{self, BufReader};
use tokio::net::UnixStream;

use crate::cli::ConnectArgs;

pub fn run(args: ConnectArgs) -> i32 {
    let executor = match task_executor::Executor::new_owned(1, 2) {
        Ok(executor) => executor,
        Err(e) => {
            log::error!("failed to start the runtime: {e}");
            return 1;
        }
    };

    let result = executor.block_on(run_async(args));
    executor.shutdown(std::time::Duration::from_secs(2));

    match result {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{e}");
            2
        }
    }
}

async fn run_async(args: ConnectArgs) -> Result<(), String> {
    let socket_path = args.cache_dir.join("buildcache.sock");
    let mut socket = UnixStream::connect(&socket_path)
        .await
        .map_err(|e| format!("failed to connect to {socket_path:?}: {e}"))?;

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    loop {
        let request: Request = match read_frame(&mut stdin).await? {
            Some(request) => request,
            None => return Ok(()),
        };
        let is_close = matches!(request, Request::Close);

        write_frame(&mut socket, &request).await?;
        if is_close {
            return Ok(());
        }

        let response: Response = match read_frame(&mut socket).await? {
            Some(response) => response,
            None => return Err("serve closed the connection unexpectedly".to_string()),
        };
        write_frame(&mut stdout, &response).await?;
    }
}
