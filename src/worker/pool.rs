// src/worker/pool.rs
// Fixed-size pool of worker subprocesses with warmup, spawn retry and
// crash recovery; the parent side adapts worker events onto the bus

use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use super::protocol::{FramedJson, WorkerCommand, WorkerEvent};
use crate::config::WorkerPoolConfig;
use crate::engine::StreamTurnParams;
use crate::error::WorkerError;
use crate::events::{Event, EventBus};
use crate::store::{ChatState, ChatStore};

pub struct PooledWorker {
    pub id: u32,
    child: Child,
    channel: FramedJson<ChildStdout, ChildStdin>,
}

impl PooledWorker {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    database_url: String,
    bus: Arc<EventBus>,
    store: ChatStore,
    free: tokio::sync::Mutex<Vec<PooledWorker>>,
    free_notify: Notify,
    active: Mutex<HashMap<String, mpsc::Sender<WorkerCommand>>>,
    next_id: AtomicU32,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        database_url: String,
        bus: Arc<EventBus>,
        store: ChatStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            database_url,
            bus,
            store,
            free: tokio::sync::Mutex::new(Vec::new()),
            free_notify: Notify::new(),
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        })
    }

    /// Eagerly bring the pool to size, `max_parallel_spawn` at a time.
    pub async fn warmup(self: &Arc<Self>) {
        let start = Instant::now();
        let mut spawns = FuturesUnordered::new();
        let mut remaining = self.config.pool_size;

        while remaining > 0 || !spawns.is_empty() {
            while remaining > 0 && spawns.len() < self.config.max_parallel_spawn {
                remaining -= 1;
                spawns.push(self.spawn_with_retry());
            }
            if let Some(worker) = spawns.next().await {
                match worker {
                    Some(worker) => {
                        self.free.lock().await.push(worker);
                        self.free_notify.notify_waiters();
                    }
                    None => warn!("Worker spawn permanently failed during warmup"),
                }
            }
        }

        let elapsed = start.elapsed();
        if elapsed.as_secs_f64() > self.config.slow_start_threshold_secs {
            warn!(
                elapsed_secs = elapsed.as_secs_f64(),
                "Worker pool warmup was slow"
            );
        }
        let worker_count = self.free.lock().await.len();
        info!(
            workers = worker_count,
            elapsed_ms = elapsed.as_millis() as u64,
            "Worker pool ready"
        );
    }

    /// Spawn one worker, retrying with exponential backoff from
    /// `spawn_retry_delay` up to `spawn_retry_delay_max`.
    async fn spawn_with_retry(&self) -> Option<PooledWorker> {
        let mut delay = Duration::from_secs_f64(self.config.spawn_retry_delay_secs);
        let max_delay = Duration::from_secs_f64(self.config.spawn_retry_delay_max_secs);
        let deadline = Instant::now() + Duration::from_secs_f64(self.config.init_timeout_secs);

        loop {
            match self.spawn_worker().await {
                Ok(worker) => return Some(worker),
                Err(e) => {
                    if Instant::now() + delay > deadline {
                        error!("Giving up on worker spawn: {}", e);
                        return None;
                    }
                    warn!(retry_in_secs = delay.as_secs_f64(), "Worker spawn failed: {}", e);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }

    async fn spawn_worker(&self) -> Result<PooledWorker, WorkerError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let binary = worker_binary_path();

        let mut child = Command::new(&binary)
            .arg("--database-url")
            .arg(&self.database_url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Protocol("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Protocol("worker stdout unavailable".to_string()))?;
        let mut channel = FramedJson::new(stdout, stdin);

        // The child reports readiness before accepting commands
        let init_timeout = Duration::from_secs_f64(self.config.init_timeout_secs);
        let handshake = tokio::time::timeout(init_timeout, channel.recv::<WorkerEvent>())
            .await
            .map_err(|_| WorkerError::AcquireTimeout(self.config.init_timeout_secs))??;

        match handshake {
            Some(WorkerEvent::Handshake { success: true, .. }) => {
                debug!(worker_id = id, "Worker ready");
                Ok(PooledWorker { id, child, channel })
            }
            Some(WorkerEvent::Handshake { success: false, error, .. }) => Err(WorkerError::Crashed(
                id,
                error.unwrap_or_else(|| "initialization failed".to_string()),
            )),
            other => Err(WorkerError::Protocol(format!(
                "expected handshake, got {other:?}"
            ))),
        }
    }

    /// Take a free worker, waiting up to the init timeout.
    async fn acquire(self: &Arc<Self>) -> Result<PooledWorker, WorkerError> {
        let deadline = Instant::now() + Duration::from_secs_f64(self.config.init_timeout_secs);
        loop {
            {
                let mut free = self.free.lock().await;
                while let Some(mut worker) = free.pop() {
                    if worker.is_alive() {
                        return Ok(worker);
                    }
                    warn!(worker_id = worker.id, "Discarding dead pooled worker");
                    self.respawn_in_background();
                }
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(WorkerError::AcquireTimeout(self.config.init_timeout_secs));
            };
            let notified = self.free_notify.notified();
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(WorkerError::AcquireTimeout(self.config.init_timeout_secs));
            }
        }
    }

    async fn release(self: &Arc<Self>, mut worker: PooledWorker) {
        if !worker.is_alive() {
            warn!(worker_id = worker.id, "Worker exited, respawning replacement");
            self.respawn_in_background();
            return;
        }
        self.free.lock().await.push(worker);
        self.free_notify.notify_waiters();
    }

    fn respawn_in_background(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            if let Some(worker) = pool.spawn_with_retry().await {
                pool.free.lock().await.push(worker);
                pool.free_notify.notify_waiters();
            }
        });
    }

    pub fn is_processing(&self, chat_id: &str) -> bool {
        self.active.lock().contains_key(chat_id)
    }

    /// Deliver a follow-up command (stop/cancel/decision/workspace) to
    /// the worker currently serving a chat.
    pub fn send_command(&self, chat_id: &str, command: WorkerCommand) -> bool {
        let sender = self.active.lock().get(chat_id).cloned();
        match sender {
            Some(sender) => sender.try_send(command).is_ok(),
            None => false,
        }
    }

    /// Run a turn out-of-process. Returns false when the chat already
    /// has a live worker turn.
    pub async fn start_worker_turn(
        self: &Arc<Self>,
        params: StreamTurnParams,
    ) -> Result<bool, WorkerError> {
        let chat_id = params.chat_id.clone();
        if self.active.lock().contains_key(&chat_id) {
            warn!(chat_id = %chat_id, "Chat already has a live worker turn");
            return Ok(false);
        }

        let worker = self.acquire().await?;
        let (command_tx, command_rx) = mpsc::channel(8);
        self.active.lock().insert(chat_id.clone(), command_tx);

        let pool = self.clone();
        tokio::spawn(async move {
            pool.pump_worker_turn(worker, params, command_rx).await;
        });
        Ok(true)
    }

    /// Drive one worker turn: forward queued commands down the pipe,
    /// translate events onto the bus, and recover from crashes.
    async fn pump_worker_turn(
        self: Arc<Self>,
        mut worker: PooledWorker,
        params: StreamTurnParams,
        mut command_rx: mpsc::Receiver<WorkerCommand>,
    ) {
        let chat_id = params.chat_id.clone();
        let process = WorkerCommand::Process {
            chat_id: chat_id.clone(),
            message: params.message.clone(),
            provider: params.provider.clone(),
            model: params.model.clone(),
            include_reasoning: params.include_reasoning,
            attached_file_ids: params.attached_file_ids.clone(),
            user_message_id: params.user_message_id.clone(),
            router_decision: params.router_decision.clone(),
            estimated_tokens: params.estimated_tokens,
        };

        if let Err(e) = worker.channel.send(&process).await {
            error!(chat_id = %chat_id, "Failed to dispatch process command: {}", e);
            self.handle_worker_crash(&chat_id, worker).await;
            self.active.lock().remove(&chat_id);
            return;
        }

        let outcome = {
            use super::protocol::{read_frame, write_frame};
            let (reader, writer) = worker.channel.split_mut();
            loop {
                tokio::select! {
                    command = command_rx.recv() => {
                        if let Some(command) = command {
                            if let Err(e) = write_frame(writer, &command).await {
                                error!(chat_id = %chat_id, "Failed to forward command: {}", e);
                                break Err(e);
                            }
                        }
                    }
                    event = read_frame::<_, WorkerEvent>(reader) => {
                        match event {
                            Ok(Some(event)) => {
                                if let Some(done) = self.handle_worker_event(&chat_id, event) {
                                    break Ok(done);
                                }
                            }
                            Ok(None) => {
                                break Err(WorkerError::Protocol("worker closed pipe mid-turn".to_string()));
                            }
                            Err(e) => break Err(e),
                        }
                    }
                }
            }
        };

        self.active.lock().remove(&chat_id);
        match outcome {
            Ok(done) => {
                if let WorkerEvent::Done { success: false, error, .. } = &done {
                    warn!(
                        chat_id = %chat_id,
                        error = error.as_deref().unwrap_or("unknown"),
                        "Worker turn finished with error"
                    );
                }
                self.release(worker).await;
            }
            Err(e) => {
                error!(chat_id = %chat_id, "Worker turn crashed: {}", e);
                self.handle_worker_crash(&chat_id, worker).await;
            }
        }
    }

    /// Translate one worker event onto the bus. Returns the terminal
    /// event when the turn is over.
    fn handle_worker_event(&self, chat_id: &str, event: WorkerEvent) -> Option<WorkerEvent> {
        match event {
            WorkerEvent::StateUpdate { chat_id, state } => {
                self.bus.publish_state(&chat_id, state);
                None
            }
            WorkerEvent::Content {
                chat_id,
                content_type,
                content,
                metadata,
            } => {
                let mut bus_event = Event::content(&chat_id, &content_type, content);
                bus_event.metadata = metadata;
                self.bus.publish_event(bus_event);
                None
            }
            WorkerEvent::RouterDecision { chat_id, decision } => {
                self.bus.broadcast(
                    Event::global("router_decision")
                        .with_meta("chat_id", json!(chat_id))
                        .with_meta("selected_route", json!(decision.route))
                        .with_meta("available_routes", json!(decision.available_routes))
                        .with_meta("selected_model", json!(decision.model))
                        .with_meta("selected_provider", json!(decision.provider))
                        .with_meta("tools_needed", json!(decision.tools_needed))
                        .with_meta("execution_type", json!(decision.execution_type))
                        .with_meta("fastpath_params", json!(decision.fastpath_params))
                        .with_meta("error", json!(decision.error)),
                );
                None
            }
            WorkerEvent::Handshake { .. } => {
                warn!(chat_id = %chat_id, "Unexpected handshake mid-turn");
                None
            }
            done @ WorkerEvent::Done { .. } => Some(done),
        }
    }

    /// A crashed worker leaves the chat in an unknown state: emit the
    /// error, delete the dangling placeholder, reset to static, and
    /// replace the process.
    async fn handle_worker_crash(self: &Arc<Self>, chat_id: &str, worker: PooledWorker) {
        drop(worker);
        self.respawn_in_background();

        if let Ok(history) = self.store.get_chat_history(chat_id).await {
            if let Some(last) = history.last() {
                if last.role == "assistant" && last.content.is_empty() {
                    match self.store.cascade_delete_message(&last.id, chat_id).await {
                        Ok(removed) => {
                            info!(chat_id = %chat_id, removed, "Removed placeholder after worker crash")
                        }
                        Err(e) => {
                            warn!(chat_id = %chat_id, "Failed to remove placeholder: {}", e)
                        }
                    }
                }
            }
        }

        if let Err(e) = self.store.update_chat_state(chat_id, ChatState::Static).await {
            error!(chat_id = %chat_id, "Failed to reset state after crash: {}", e);
        }
        self.bus.publish_state(chat_id, ChatState::Static);
        self.bus
            .publish_content(chat_id, "error", "Chat worker crashed; the turn was aborted");
    }
}

/// Locate the worker binary: explicit override, else next to the
/// server executable.
fn worker_binary_path() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("ATLAS_WORKER_BIN") {
        return path.into();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("atlas-worker")))
        .unwrap_or_else(|| "atlas-worker".into())
}
