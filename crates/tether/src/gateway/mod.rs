//! Runtime process supervision.
//!
//! The gateway owns the runtime child process and its RPC connection. It
//! performs the initialize/initialized handshake, retries overloaded
//! requests, tracks pending human approvals, persists every inbound
//! notification before broadcasting it, and restarts the runtime with
//! exponential backoff when it dies. Restarts never give up.

pub mod extract;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use rand::Rng;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use tether_protocol::{
    APPROVAL_REQUEST_METHODS, APPROVAL_RESOLVED_METHOD, RequestId, RpcError,
};

use crate::config::RuntimeConfig;
use crate::gateway::extract::scope_ids;
use crate::hub::EventHub;
use crate::process::{BoxedReader, ProcessControl, ProcessFactory};
use crate::rpc::{ClientError, ClientEvent, RpcClient};
use crate::store::SqliteStore;

const RESTART_BACKOFF_FLOOR_MS: u64 = 1000;
const RESTART_BACKOFF_CAP_MS: u64 = 30_000;

/// Total attempts for a request answered with the overloaded code.
const OVERLOADED_TOTAL_ATTEMPTS: u32 = 4;
const OVERLOADED_BASE_MS: u64 = 300;
const OVERLOADED_CAP_MS: u64 = 8000;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The runtime answered with an error response.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// The runtime died before answering.
    #[error("runtime connection closed during {method}")]
    ConnectionClosed { method: String },
    #[error("gateway is shutting down")]
    ShuttingDown,
    #[error("no pending approval with request id {0}")]
    UnknownApproval(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ClientError> for GatewayError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Rpc(e) => Self::Rpc(e),
            ClientError::ConnectionClosed { method } => Self::ConnectionClosed { method },
            ClientError::Closed => Self::ConnectionClosed {
                method: "<none>".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisorState {
    Stopped,
    Starting,
    Ready,
    Restarting,
}

impl SupervisorState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Restarting => "restarting",
        }
    }
}

/// A runtime-initiated approval request awaiting a human decision.
struct PendingApproval {
    rpc_id: RequestId,
    method: String,
    thread_id: Option<String>,
}

/// Snapshot of one pending approval, for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalInfo {
    pub request_id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Supervisor health snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub state: &'static str,
    pub restart_count: u64,
    pub backoff_ms: u64,
}

struct GatewayInner {
    state: SupervisorState,
    client: Option<Arc<RpcClient>>,
    /// Bumped per connection; stale connection events are ignored.
    generation: u64,
    shutting_down: bool,
    kill_tx: Option<oneshot::Sender<()>>,
    restart_task: Option<JoinHandle<()>>,
    restart_delay_ms: u64,
    restart_count: u64,
    pending_approvals: HashMap<String, PendingApproval>,
}

pub struct Gateway {
    config: RuntimeConfig,
    factory: Arc<dyn ProcessFactory>,
    store: Arc<SqliteStore>,
    hub: Arc<EventHub>,
    inner: Mutex<GatewayInner>,
    /// Serializes start attempts so concurrent callers share one.
    start_lock: Mutex<()>,
}

impl Gateway {
    pub fn new(
        config: RuntimeConfig,
        factory: Arc<dyn ProcessFactory>,
        store: Arc<SqliteStore>,
        hub: Arc<EventHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            store,
            hub,
            inner: Mutex::new(GatewayInner {
                state: SupervisorState::Stopped,
                client: None,
                generation: 0,
                shutting_down: false,
                kill_tx: None,
                restart_task: None,
                restart_delay_ms: RESTART_BACKOFF_FLOOR_MS,
                restart_count: 0,
                pending_approvals: HashMap::new(),
            }),
            start_lock: Mutex::new(()),
        })
    }

    /// Start the runtime. No-op when already ready; concurrent callers await
    /// the same in-flight attempt.
    pub async fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        let _guard = self.start_lock.lock().await;
        {
            let inner = self.inner.lock().await;
            if inner.shutting_down {
                return Err(GatewayError::ShuttingDown);
            }
            if inner.state == SupervisorState::Ready {
                return Ok(());
            }
        }
        self.start_locked().await
    }

    /// One start attempt. Caller must hold `start_lock`.
    async fn start_locked(self: &Arc<Self>) -> Result<(), GatewayError> {
        {
            let mut inner = self.inner.lock().await;
            inner.state = SupervisorState::Starting;
        }

        tokio::fs::create_dir_all(&self.config.workdir)
            .await
            .with_context(|| format!("creating workdir {}", self.config.workdir.display()))?;

        let mut handle = self.factory.spawn(&self.config).await?;
        if let Some(stderr) = handle.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        let (client, events) = RpcClient::connect(handle.stdin, handle.stdout);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch_process(handle.control, kill_rx));

        let generation = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.generation
        };
        tokio::spawn(event_loop(
            Arc::clone(self),
            Arc::clone(&client),
            events,
            generation,
        ));

        let handshake = async {
            client
                .request(
                    "initialize",
                    Some(json!({
                        "clientInfo": {
                            "name": "tether",
                            "version": env!("CARGO_PKG_VERSION"),
                        }
                    })),
                )
                .await?;
            client.notify("initialized", None).await
        };
        if let Err(e) = handshake.await {
            warn!("runtime handshake failed: {}", e);
            let _ = kill_tx.send(());
            let mut inner = self.inner.lock().await;
            // Invalidate the connection so its EOF does not double-schedule.
            inner.generation += 1;
            inner.state = SupervisorState::Stopped;
            return Err(e.into());
        }

        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            let _ = kill_tx.send(());
            inner.generation += 1;
            inner.state = SupervisorState::Stopped;
            return Err(GatewayError::ShuttingDown);
        }
        inner.client = Some(client);
        inner.kill_tx = Some(kill_tx);
        inner.restart_delay_ms = RESTART_BACKOFF_FLOOR_MS;
        inner.state = SupervisorState::Ready;
        info!("runtime ready (generation {})", generation);
        Ok(())
    }

    /// Send a request to the runtime, starting it first if needed. The
    /// distinguished overloaded error is retried with jittered backoff; any
    /// other error propagates after a single attempt.
    pub async fn request(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, GatewayError> {
        self.start().await?;
        let client = {
            let inner = self.inner.lock().await;
            inner.client.clone().ok_or(GatewayError::ConnectionClosed {
                method: method.to_string(),
            })?
        };

        let mut attempt = 0;
        loop {
            match client.request(method, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(ClientError::Rpc(err))
                    if err.is_overloaded() && attempt + 1 < OVERLOADED_TOTAL_ATTEMPTS =>
                {
                    let delay = overloaded_retry_delay(attempt);
                    warn!(
                        "runtime overloaded on {}, retrying in {:?} (attempt {})",
                        method,
                        delay,
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Answer a runtime-issued approval request. Fails on an unknown or
    /// already-resolved request id.
    pub async fn respond_approval(
        self: &Arc<Self>,
        request_id: &str,
        decision: Value,
    ) -> Result<(), GatewayError> {
        let (approval, client) = {
            let mut inner = self.inner.lock().await;
            let approval = inner
                .pending_approvals
                .remove(request_id)
                .ok_or_else(|| GatewayError::UnknownApproval(request_id.to_string()))?;
            match inner.client.clone() {
                Some(client) => (approval, client),
                None => {
                    let method = approval.method.clone();
                    inner
                        .pending_approvals
                        .insert(request_id.to_string(), approval);
                    return Err(GatewayError::ConnectionClosed { method });
                }
            }
        };

        if let Err(e) = client
            .respond(approval.rpc_id.clone(), json!({ "decision": decision }))
            .await
        {
            // The decision never reached the runtime. Put the approval back so
            // it stays answerable, unless this connection has already been
            // torn down and its approvals discarded with it.
            let mut inner = self.inner.lock().await;
            if inner
                .client
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &client))
            {
                inner
                    .pending_approvals
                    .insert(request_id.to_string(), approval);
            }
            return Err(e.into());
        }

        if !self.store.resolve_approval(request_id, &decision).await? {
            warn!("approval {} had no unresolved store row", request_id);
        }
        self.persist_and_broadcast(
            approval.thread_id.as_deref(),
            None,
            APPROVAL_RESOLVED_METHOD,
            &json!({ "requestId": request_id, "decision": decision }),
        )
        .await;
        Ok(())
    }

    /// Shut the runtime down and stay down. Idempotent.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return;
        }
        info!("stopping runtime");
        inner.shutting_down = true;
        inner.state = SupervisorState::Stopped;
        if let Some(task) = inner.restart_task.take() {
            task.abort();
        }
        inner.pending_approvals.clear();
        inner.client = None;
        if let Some(kill) = inner.kill_tx.take() {
            let _ = kill.send(());
        }
    }

    pub async fn health(&self) -> Health {
        let inner = self.inner.lock().await;
        Health {
            state: inner.state.as_str(),
            restart_count: inner.restart_count,
            backoff_ms: inner.restart_delay_ms,
        }
    }

    pub async fn pending_approvals(&self) -> Vec<ApprovalInfo> {
        let inner = self.inner.lock().await;
        inner
            .pending_approvals
            .iter()
            .map(|(request_id, approval)| ApprovalInfo {
                request_id: request_id.clone(),
                method: approval.method.clone(),
                thread_id: approval.thread_id.clone(),
            })
            .collect()
    }

    /// Append to the log, then fan out. Persistence failures are logged; the
    /// event is not broadcast without a cursor.
    async fn persist_and_broadcast(
        &self,
        thread_id: Option<&str>,
        turn_id: Option<&str>,
        method: &str,
        payload: &Value,
    ) {
        match self
            .store
            .insert_event(thread_id, turn_id, method, payload)
            .await
        {
            Ok(event) => self.hub.broadcast(&event),
            Err(e) => error!("failed to persist {}: {:#}", method, e),
        }
    }

    /// Persist first, then update projections, then fan out. Broadcast is
    /// best-effort; persistence is not.
    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        let payload = params.unwrap_or(Value::Null);
        let ids = scope_ids(&payload);
        let event = match self
            .store
            .insert_event(ids.thread_id.as_deref(), ids.turn_id.as_deref(), method, &payload)
            .await
        {
            Ok(event) => event,
            Err(e) => {
                error!("failed to persist {}: {:#}", method, e);
                return;
            }
        };
        if let Err(e) = self.project(method, &payload, &ids).await {
            error!("projection update for {} failed: {:#}", method, e);
        }
        self.hub.broadcast(&event);
    }

    /// Denormalized projection updates for the methods that carry state.
    async fn project(
        &self,
        method: &str,
        payload: &Value,
        ids: &extract::ScopeIds,
    ) -> anyhow::Result<()> {
        match method {
            "thread/started" | "thread/updated" => {
                if let Some(thread_id) = &ids.thread_id {
                    let body = payload.get("thread").unwrap_or(payload);
                    self.store.upsert_thread(thread_id, body).await?;
                }
            }
            "turn/started" | "turn/completed" | "turn/failed" => {
                if let (Some(thread_id), Some(turn_id)) = (&ids.thread_id, &ids.turn_id) {
                    let body = payload.get("turn").unwrap_or(payload);
                    self.store.upsert_turn(thread_id, turn_id, body).await?;
                }
            }
            "item/started" | "item/updated" | "item/completed" => {
                let status = method.rsplit('/').next().unwrap_or("updated");
                if let Some(item) = payload.get("item")
                    && let Some(item_id) = item.get("id").and_then(Value::as_str)
                {
                    self.store
                        .upsert_item(
                            ids.thread_id.as_deref(),
                            ids.turn_id.as_deref(),
                            item_id,
                            status,
                            item,
                        )
                        .await?;
                }
            }
            "account/updated" | "account/login/completed" => {
                let mode = payload.get("authMode").and_then(Value::as_str);
                self.store.upsert_auth_state(mode, payload).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_runtime_request(
        self: &Arc<Self>,
        client: &Arc<RpcClient>,
        id: RequestId,
        method: String,
        params: Option<Value>,
    ) {
        if !APPROVAL_REQUEST_METHODS.contains(&method.as_str()) {
            debug!("rejecting unsupported runtime request {}", method);
            if let Err(e) = client
                .respond_error(id, RpcError::method_not_found(&method))
                .await
            {
                warn!("could not reject {}: {}", method, e);
            }
            return;
        }

        let payload = params.unwrap_or(Value::Null);
        let ids = scope_ids(&payload);
        let request_id = id.as_key();
        {
            let mut inner = self.inner.lock().await;
            inner.pending_approvals.insert(
                request_id.clone(),
                PendingApproval {
                    rpc_id: id,
                    method: method.clone(),
                    thread_id: ids.thread_id.clone(),
                },
            );
        }
        if let Err(e) = self
            .store
            .insert_approval(&request_id, &method, ids.thread_id.as_deref(), &payload)
            .await
        {
            error!("failed to record approval {}: {:#}", request_id, e);
        }
        self.persist_and_broadcast(
            ids.thread_id.as_deref(),
            ids.turn_id.as_deref(),
            &method,
            &json!({ "requestId": request_id, "params": payload }),
        )
        .await;
    }

    /// Stdout EOF for a live connection. Clears connection state and, unless
    /// a deliberate stop is in progress, schedules a restart.
    async fn handle_disconnect(self: &Arc<Self>, generation: u64) {
        let delay = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            // A death during the handshake is reported to whoever is running
            // the start attempt; scheduling here too would double the backoff.
            if inner.state == SupervisorState::Starting {
                return;
            }
            warn!("runtime disconnected (generation {})", generation);
            inner.client = None;
            inner.kill_tx = None;
            inner.pending_approvals.clear();
            if inner.shutting_down {
                inner.state = SupervisorState::Stopped;
                return;
            }
            inner.state = SupervisorState::Restarting;
            inner.restart_count += 1;
            let delay = inner.restart_delay_ms;
            inner.restart_delay_ms = (delay * 2).min(RESTART_BACKOFF_CAP_MS);
            delay
        };
        self.schedule_restart(delay).await;
    }

    async fn schedule_restart(self: &Arc<Self>, delay_ms: u64) {
        info!("restarting runtime in {}ms", delay_ms);
        let gateway = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            gateway.run_restart().await;
        });
        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.restart_task.replace(task) {
            previous.abort();
        }
    }

    /// Boxed: a failed attempt schedules another restart through this same
    /// function, which would otherwise make the future type infinitely
    /// recursive.
    fn run_restart(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            let _guard = self.start_lock.lock().await;
            {
                let inner = self.inner.lock().await;
                if inner.shutting_down || inner.state == SupervisorState::Ready {
                    return;
                }
            }
            match self.start_locked().await {
                Ok(()) => info!("runtime restarted"),
                Err(e) => {
                    warn!("runtime restart failed: {}", e);
                    let delay = {
                        let mut inner = self.inner.lock().await;
                        inner.state = SupervisorState::Restarting;
                        inner.restart_count += 1;
                        let delay = inner.restart_delay_ms;
                        inner.restart_delay_ms = (delay * 2).min(RESTART_BACKOFF_CAP_MS);
                        delay
                    };
                    self.schedule_restart(delay).await;
                }
            }
        }
        .boxed()
    }
}

/// Backoff before retrying an overloaded request: exponential with a cap,
/// plus uniform jitter in [0, base/2].
fn overloaded_retry_delay(attempt: u32) -> Duration {
    let base = (OVERLOADED_BASE_MS << attempt).min(OVERLOADED_CAP_MS);
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

async fn event_loop(
    gateway: Arc<Gateway>,
    client: Arc<RpcClient>,
    mut events: mpsc::Receiver<ClientEvent>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Notification { method, params } => {
                gateway.handle_notification(&method, params).await;
            }
            ClientEvent::Request { id, method, params } => {
                gateway
                    .handle_runtime_request(&client, id, method, params)
                    .await;
            }
            ClientEvent::Disconnected => {
                gateway.handle_disconnect(generation).await;
                break;
            }
        }
    }
}

async fn watch_process(mut control: Box<dyn ProcessControl>, kill_rx: oneshot::Receiver<()>) {
    let killed = tokio::select! {
        _ = control.wait() => false,
        _ = kill_rx => true,
    };
    if killed {
        control.terminate().await;
        control.wait().await;
    }
}

async fn drain_stderr(stderr: BoxedReader) {
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("runtime stderr: {}", line);
    }
}
