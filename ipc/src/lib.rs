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

//! The local IPC endpoint: a length-prefixed `serde_json` protocol spoken over a Unix domain
//! socket, wired directly to an [`ActionCache`]. Structured after
//! `engine/nailgun/src/server.rs`'s accept loop: a task per connection, a
//! `tokio::sync::RwLock<()>` read guard held for the lifetime of each connection so shutdown can
//! prove every connection has drained before returning, and a `select!` race between
//! `accept()` and the shutdown signal.
//!
//! The wire messages are `get(ActionKey) -> (OutputKey, diskPath) | miss` and
//! `put(ActionKey, OutputKey, diskPath, size) -> ack`. `put` names a path the caller has
//! already written its output to, rather than inlining bytes on the wire.

use std::path::PathBuf;
use std::sync::Arc;

use action_cache::{ActionCache, ActionKey, OutputKey};
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use task_executor::Executor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, Notify, RwLock};

/// Maximum frame size accepted from a peer, guarding against a misbehaving client claiming an
/// enormous length prefix.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Get {
        action_key: ActionKey,
    },
    Put {
        action_key: ActionKey,
        output_key: OutputKey,
        disk_path: PathBuf,
        size_bytes: u64,
    },
    Close,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Hit { output_key: OutputKey, disk_path: PathBuf },
    Miss,
    Ack,
    Error { message: String },
}

/// Writes one length-prefixed `serde_json` frame.
pub async fn write_frame<W: AsyncWrite + Unpin, T: Serialize>(writer: &mut W, value: &T) -> Result<(), String> {
    let payload = serde_json::to_vec(value).map_err(|e| format!("failed to encode frame: {e}"))?;
    if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(format!("frame of {} bytes exceeds the {MAX_FRAME_BYTES} byte limit", payload.len()));
    }
    let mut len_prefix = [0u8; 4];
    BigEndian::write_u32(&mut len_prefix, payload.len() as u32);
    writer
        .write_all(&len_prefix)
        .await
        .map_err(|e| format!("failed to write frame length: {e}"))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| format!("failed to write frame body: {e}"))?;
    writer.flush().await.map_err(|e| format!("failed to flush frame: {e}"))
}

/// Reads one length-prefixed `serde_json` frame, or `Ok(None)` on a clean EOF before any bytes
/// of a new frame have arrived (the peer closed the connection between messages).
pub async fn read_frame<R: AsyncRead + Unpin, T: for<'de> Deserialize<'de>>(
    reader: &mut R,
) -> Result<Option<T>, String> {
    let mut len_prefix = [0u8; 4];
    match reader.read_exact(&mut len_prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(format!("failed to read frame length: {e}")),
    }
    let len = BigEndian::read_u32(&len_prefix);
    if len > MAX_FRAME_BYTES {
        return Err(format!("peer claimed a {len} byte frame, exceeding the {MAX_FRAME_BYTES} byte limit"));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| format!("failed to read frame body: {e}"))?;
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| format!("failed to decode frame: {e}"))
}

/// Handles the `Request`/`Response` exchange for a single connection until the peer sends
/// `Close`, closes the stream, or a protocol error occurs (in which case the connection replies
/// with an `Error` and stays open for the next request).
async fn serve_requests<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, action_cache: &ActionCache) {
    loop {
        let request: Request = match read_frame(stream).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                log::debug!("ipc connection protocol error: {e}");
                let _ = write_frame(stream, &Response::Error { message: e }).await;
                continue;
            }
        };

        let response = match request {
            Request::Get { action_key } => match action_cache.get(action_key).await {
                Ok(Some((output_key, disk_path))) => Response::Hit { output_key, disk_path },
                Ok(None) => Response::Miss,
                Err(e) => Response::Error { message: e },
            },
            Request::Put {
                action_key,
                output_key,
                disk_path,
                size_bytes,
            } => match read_put_payload(&disk_path, size_bytes).await {
                Ok(bytes) => match action_cache.put(action_key, output_key, bytes).await {
                    Ok(()) => Response::Ack,
                    Err(e) => Response::Error { message: e },
                },
                Err(e) => Response::Error { message: e },
            },
            Request::Close => return,
        };

        if write_frame(stream, &response).await.is_err() {
            return;
        }
    }
}

async fn read_put_payload(disk_path: &std::path::Path, expected_size: u64) -> Result<Bytes, String> {
    let bytes = tokio::fs::read(disk_path)
        .await
        .map_err(|e| format!("failed to read {disk_path:?}: {e}"))?;
    if bytes.len() as u64 != expected_size {
        return Err(format!(
            "{disk_path:?} is {} bytes, expected {expected_size}",
            bytes.len()
        ));
    }
    Ok(Bytes::from(bytes))
}

/// A running IPC server. Dropping this without calling [`IpcServer::shutdown`] leaves the
/// accept loop running; callers should always shut it down explicitly.
pub struct IpcServer {
    exit_sender: oneshot::Sender<()>,
    exited_receiver: oneshot::Receiver<()>,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Binds `socket_path` (removing any stale socket file left by a previous crash) and spawns
    /// the accept loop on `executor`.
    pub async fn bind(
        executor: Executor,
        socket_path: PathBuf,
        action_cache: ActionCache,
    ) -> Result<IpcServer, String> {
        if socket_path.exists() {
            tokio::fs::remove_file(&socket_path)
                .await
                .map_err(|e| format!("failed to remove stale socket {socket_path:?}: {e}"))?;
        }
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| format!("failed to bind IPC socket {socket_path:?}: {e}"))?;

        let (exit_sender, exit_receiver) = oneshot::channel();
        let (exited_sender, exited_receiver) = oneshot::channel();

        executor.native_spawn(Self::accept_loop(
            executor.clone(),
            listener,
            action_cache,
            exit_receiver,
            exited_sender,
        ));

        Ok(IpcServer {
            exit_sender,
            exited_receiver,
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    async fn accept_loop(
        executor: Executor,
        listener: UnixListener,
        action_cache: ActionCache,
        mut should_exit: oneshot::Receiver<()>,
        exited: oneshot::Sender<()>,
    ) {
        let ongoing_connections = Arc::new(RwLock::new(()));

        loop {
            let accepted = tokio::select! {
                biased;
                result = listener.accept() => result,
                _ = &mut should_exit => break,
            };
            let stream = match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    log::warn!("ipc accept failed: {e}");
                    continue;
                }
            };

            let connection_started = Arc::new(Notify::new());
            let action_cache = action_cache.clone();
            let ongoing_connections = ongoing_connections.clone();
            let started_signal = connection_started.clone();
            executor.native_spawn(async move {
                let guard = ongoing_connections.read().await;
                started_signal.notify_one();
                Self::handle_connection(stream, action_cache).await;
                drop(guard);
            });
            connection_started.notified().await;
        }

        log::debug!("ipc server waiting for in-flight connections to drain");
        let _ = ongoing_connections.write().await;
        let _ = exited.send(());
    }

    async fn handle_connection(mut stream: UnixStream, action_cache: ActionCache) {
        serve_requests(&mut stream, &action_cache).await;
    }

    /// Stops accepting new connections and waits for in-flight ones to finish.
    pub async fn shutdown(self) {
        let _ = self.exit_sender.send(());
        let _ = self.exited_receiver.await;
        let _ = tokio::fs::remove_file(&self.socket_path).await;
    }
}

/// Client-side half of the protocol, used by the `connect` subcommand (a thin stdio-to-socket
/// proxy for whatever wire format the compiler actually speaks on its end) and by tests.
pub struct IpcClient {
    stream: UnixStream,
}

impl IpcClient {
    pub async fn connect(socket_path: &std::path::Path) -> Result<IpcClient, String> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| format!("failed to connect to {socket_path:?}: {e}"))?;
        Ok(IpcClient { stream })
    }

    pub async fn get(&mut self, action_key: ActionKey) -> Result<Response, String> {
        self.roundtrip(Request::Get { action_key }).await
    }

    pub async fn put(
        &mut self,
        action_key: ActionKey,
        output_key: OutputKey,
        disk_path: PathBuf,
        size_bytes: u64,
    ) -> Result<Response, String> {
        self.roundtrip(Request::Put {
            action_key,
            output_key,
            disk_path,
            size_bytes,
        })
        .await
    }

    pub async fn close(mut self) -> Result<(), String> {
        write_frame(&mut self.stream, &Request::Close).await
    }

    async fn roundtrip(&mut self, request: Request) -> Result<Response, String> {
        write_frame(&mut self.stream, &request).await?;
        match read_frame(&mut self.stream).await? {
            Some(response) => Ok(response),
            None => Err("connection closed before a response arrived".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashing::Fingerprint;
    use introspect::Registry;
    use local_cache::LocalCache;
    use object_store::ObjectStoreOptions;
    use std::time::Duration;

    fn fingerprint(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes_unsafe(&[byte; 32])
    }

    async fn test_server(tmp: &std::path::Path) -> IpcServer {
        let executor = Executor::new();
        let local = LocalCache::new(tmp.join("cache"), None, executor.clone());
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
        let action_cache = ActionCache::new(
            local,
            remote,
            Registry::new(),
            executor.clone(),
            action_cache::ActionCacheOptions {
                min_upload_size: 0,
                request_concurrency: 8,
                upload_concurrency: 1,
            },
        );
        IpcServer::bind(executor, tmp.join("buildcache.sock"), action_cache)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn get_of_unknown_action_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let server = test_server(tmp.path()).await;

        let mut client = IpcClient::connect(server.socket_path()).await.unwrap();
        let response = client.get(fingerprint(1)).await.unwrap();
        assert!(matches!(response, Response::Miss));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn put_then_get_roundtrips_over_the_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let server = test_server(tmp.path()).await;

        let output_path = tmp.path().join("output-blob");
        tokio::fs::write(&output_path, b"hello ipc").await.unwrap();

        let mut client = IpcClient::connect(server.socket_path()).await.unwrap();
        let action = fingerprint(2);
        let output = fingerprint(3);

        let put_response = client
            .put(action, output, output_path.clone(), 9)
            .await
            .unwrap();
        assert!(matches!(put_response, Response::Ack));

        let get_response = client.get(action).await.unwrap();
        match get_response {
            Response::Hit { output_key, disk_path } => {
                assert_eq!(output_key, output);
                assert_eq!(tokio::fs::read(disk_path).await.unwrap(), b"hello ipc");
            }
            other => panic!("expected a hit, got {other:?}"),
        }

        client.close().await.unwrap();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn put_with_a_mismatched_size_reports_an_error_without_closing_the_connection() {
        let tmp = tempfile::tempdir().unwrap();
        let server = test_server(tmp.path()).await;

        let output_path = tmp.path().join("output-blob");
        tokio::fs::write(&output_path, b"short").await.unwrap();

        let mut client = IpcClient::connect(server.socket_path()).await.unwrap();
        let response = client
            .put(fingerprint(4), fingerprint(5), output_path, 999)
            .await
            .unwrap();
        assert!(matches!(response, Response::Error { .. }));

        // The connection is still usable afterwards.
        let response = client.get(fingerprint(6)).await.unwrap();
        assert!(matches!(response, Response::Miss));

        server.shutdown().await;
    }
}
