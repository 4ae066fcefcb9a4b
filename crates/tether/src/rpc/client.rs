//! Bidirectional JSON-RPC client over the runtime's stdio.
//!
//! One connection per runtime process. The client owns two tasks:
//!
//! - a writer task that serializes all outbound lines onto stdin, so
//!   interleaved callers never corrupt the stream
//! - a reader task that classifies each stdout line and either resolves a
//!   pending request of ours or forwards a runtime-initiated message to the
//!   supervisor through the event channel
//!
//! When stdout reaches EOF the connection is dead: every pending request
//! fails and a final [`ClientEvent::Disconnected`] is emitted. A fresh
//! process gets a fresh client.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc, oneshot};

use tether_protocol::{RequestId, RpcError, RpcMessage};

use crate::process::{BoxedReader, BoxedWriter};

/// Inbound traffic the supervisor has to act on.
#[derive(Debug)]
pub enum ClientEvent {
    /// A runtime notification.
    Notification { method: String, params: Option<Value> },
    /// A runtime-initiated request. Must be answered via [`RpcClient::respond`]
    /// or [`RpcClient::respond_error`] with this exact id.
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    /// The runtime's stdout reached EOF. Terminal; no further events follow.
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// The runtime answered with an error response.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// The connection died before the request was answered.
    #[error("connection closed while awaiting response to {method}")]
    ConnectionClosed { method: String },
    /// The connection was already dead when the request was issued.
    #[error("connection closed")]
    Closed,
}

type PendingResponses = Mutex<HashMap<String, oneshot::Sender<Result<Value, RpcError>>>>;

pub struct RpcClient {
    next_id: AtomicI64,
    closed: AtomicBool,
    writer_tx: mpsc::Sender<String>,
    pending: PendingResponses,
}

impl RpcClient {
    /// Wire a client to a runtime's stdio. Returns the client and the channel
    /// carrying runtime-initiated traffic.
    pub fn connect(stdin: BoxedWriter, stdout: BoxedReader) -> (Arc<Self>, mpsc::Receiver<ClientEvent>) {
        let (writer_tx, writer_rx) = mpsc::channel::<String>(256);
        let (event_tx, event_rx) = mpsc::channel::<ClientEvent>(256);

        let client = Arc::new(Self {
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
            writer_tx,
            pending: Mutex::new(HashMap::new()),
        });

        tokio::spawn(writer_task(stdin, writer_rx));
        tokio::spawn(reader_task(Arc::clone(&client), stdout, event_tx));

        (client, event_rx)
    }

    /// Send a request and wait for the correlated response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            // Checked under the pending lock: a concurrent disconnect either
            // sees this entry when it clears the map, or set the flag before
            // we got the lock. Either way the request is rejected, never
            // stranded.
            let mut pending = self.pending.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(ClientError::Closed);
            }
            pending.insert(id.to_string(), tx);
        }

        let line = RpcMessage::Request {
            id: id.into(),
            method: method.to_string(),
            params,
        }
        .to_json_line();

        if self.writer_tx.send(line).await.is_err() {
            self.pending.lock().await.remove(&id.to_string());
            return Err(ClientError::ConnectionClosed {
                method: method.to_string(),
            });
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(ClientError::Rpc(err)),
            // Sender dropped: the reader task tore down pending on EOF.
            Err(_) => Err(ClientError::ConnectionClosed {
                method: method.to_string(),
            }),
        }
    }

    /// Send a fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let line = RpcMessage::Notification {
            method: method.to_string(),
            params,
        }
        .to_json_line();
        self.write(line).await
    }

    /// Answer a runtime-initiated request.
    pub async fn respond(&self, id: RequestId, result: Value) -> Result<(), ClientError> {
        let line = RpcMessage::Response { id, result }.to_json_line();
        self.write(line).await
    }

    /// Answer a runtime-initiated request with an error.
    pub async fn respond_error(&self, id: RequestId, error: RpcError) -> Result<(), ClientError> {
        let line = RpcMessage::Error { id, error }.to_json_line();
        self.write(line).await
    }

    /// One-way write. After a disconnect the writer queue may still accept
    /// lines that will never reach the process, so the closed flag is the
    /// authoritative check.
    async fn write(&self, line: String) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        self.writer_tx
            .send(line)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Fail every pending request and refuse new ones. Idempotent.
    async fn mark_disconnected(&self) {
        let mut pending = self.pending.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders resolves each waiter with ConnectionClosed.
        pending.clear();
    }
}

async fn writer_task(mut stdin: BoxedWriter, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(e) = write.await {
            warn!("runtime stdin write failed: {}", e);
            break;
        }
    }
}

async fn reader_task(client: Arc<RpcClient>, stdout: BoxedReader, event_tx: mpsc::Sender<ClientEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("runtime stdout read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = match RpcMessage::parse(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("discarding unparseable runtime line: {}", e);
                continue;
            }
        };

        match message {
            RpcMessage::Response { id, result } => {
                match client.pending.lock().await.remove(&id.as_key()) {
                    Some(tx) => {
                        let _ = tx.send(Ok(result));
                    }
                    None => debug!("response for unknown request id {}", id),
                }
            }
            RpcMessage::Error { id, error } => {
                match client.pending.lock().await.remove(&id.as_key()) {
                    Some(tx) => {
                        let _ = tx.send(Err(error));
                    }
                    None => debug!("error response for unknown request id {}", id),
                }
            }
            RpcMessage::Notification { method, params } => {
                if event_tx
                    .send(ClientEvent::Notification { method, params })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            RpcMessage::Request { id, method, params } => {
                if event_tx
                    .send(ClientEvent::Request { id, method, params })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    client.mark_disconnected().await;
    let _ = event_tx.send(ClientEvent::Disconnected).await;
}
