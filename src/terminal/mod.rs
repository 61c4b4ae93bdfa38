// src/terminal/mod.rs
// Persistent PTY sessions per coder workspace with SSE output streaming

use parking_lot::Mutex;
use portable_pty::{Child, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::ChatStore;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSessionInfo {
    pub session_id: String,
    pub chat_id: String,
    pub workspace_path: String,
    pub running: bool,
}

/// One frame on a terminal output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEvent {
    Output { data: String },
    Closed,
}

struct SessionInner {
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    scrollback: Mutex<String>,
    subscribers: Mutex<Vec<mpsc::Sender<TerminalEvent>>>,
    closed: AtomicBool,
}

pub struct TerminalSession {
    pub session_id: String,
    pub chat_id: String,
    pub workspace_path: String,
    inner: Arc<SessionInner>,
}

impl TerminalSession {
    fn broadcast(inner: &SessionInner, event: TerminalEvent) {
        let mut subscribers = inner.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Terminal subscriber queue full, dropping subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn is_running(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn send_input(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut writer = self.inner.writer.lock();
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.inner.master.lock().resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;
        Ok(())
    }

    /// Scrollback text from `cursor` on, plus the new cursor.
    pub fn output_since(&self, cursor: usize) -> (String, usize) {
        let scrollback = self.inner.scrollback.lock();
        let start = cursor.min(scrollback.len());
        (scrollback[start..].to_string(), scrollback.len())
    }

    pub fn subscribe(&self) -> mpsc::Receiver<TerminalEvent> {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        self.inner.subscribers.lock().push(tx);
        rx
    }

    fn kill(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.inner.child.lock().kill() {
            warn!(session_id = %self.session_id, "Failed to kill shell: {}", e);
        }
        Self::broadcast(&self.inner, TerminalEvent::Closed);
    }
}

pub struct TerminalManager {
    store: ChatStore,
    sessions: Mutex<HashMap<String, Arc<TerminalSession>>>,
}

impl TerminalManager {
    pub fn new(store: ChatStore) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start an interactive shell in the chat's workspace.
    pub async fn create(&self, chat_id: &str) -> anyhow::Result<Arc<TerminalSession>> {
        let workspace_path = self
            .store
            .get_coder_workspace(chat_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no workspace configured for chat {chat_id}"))?;
        if !std::path::Path::new(&workspace_path).exists() {
            anyhow::bail!("workspace path {workspace_path} does not exist");
        }

        let pty_system = NativePtySystem::default();
        let pair = pty_system
            .openpty(PtySize {
                rows: 30,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow::anyhow!("failed to open PTY: {e}"))?;

        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
        let mut cmd = CommandBuilder::new(&shell);
        cmd.cwd(&workspace_path);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| anyhow::anyhow!("failed to spawn shell: {e}"))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| anyhow::anyhow!("failed to clone PTY reader: {e}"))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| anyhow::anyhow!("failed to take PTY writer: {e}"))?;

        let session_id = Uuid::new_v4().to_string();
        let inner = Arc::new(SessionInner {
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            scrollback: Mutex::new(String::new()),
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        // Blocking PTY reads live on their own thread; output fans out to
        // subscriber queues and the scrollback
        {
            let inner = inner.clone();
            let session_id = session_id.clone();
            std::thread::Builder::new()
                .name(format!("atlas-term-{}", &session_id[..8]))
                .spawn(move || {
                    let mut buffer = [0u8; READ_BUFFER_SIZE];
                    loop {
                        match reader.read(&mut buffer) {
                            Ok(0) => break,
                            Ok(n) => {
                                let text = String::from_utf8_lossy(&buffer[..n]).to_string();
                                inner.scrollback.lock().push_str(&text);
                                TerminalSession::broadcast(
                                    &inner,
                                    TerminalEvent::Output { data: text },
                                );
                            }
                            Err(e) => {
                                debug!(session_id = %session_id, "PTY read ended: {}", e);
                                break;
                            }
                        }
                    }
                    inner.closed.store(true, Ordering::SeqCst);
                    TerminalSession::broadcast(&inner, TerminalEvent::Closed);
                    info!(session_id = %session_id, "Terminal session ended");
                })
                .map_err(|e| anyhow::anyhow!("failed to spawn reader thread: {e}"))?;
        }

        let session = Arc::new(TerminalSession {
            session_id: session_id.clone(),
            chat_id: chat_id.to_string(),
            workspace_path,
            inner,
        });
        self.sessions.lock().insert(session_id.clone(), session.clone());
        info!(session_id = %session_id, chat_id = %chat_id, shell = %shell, "Terminal session started");
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn send(&self, session_id: &str, data: &[u8]) -> anyhow::Result<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| anyhow::anyhow!("terminal session {session_id} not found"))?;
        if !session.is_running() {
            anyhow::bail!("terminal session {session_id} has exited");
        }
        session.send_input(data)
    }

    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> anyhow::Result<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| anyhow::anyhow!("terminal session {session_id} not found"))?;
        session.resize(cols, rows)
    }

    pub fn kill(&self, session_id: &str) -> bool {
        let session = self.sessions.lock().remove(session_id);
        match session {
            Some(session) => {
                session.kill();
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<TerminalSessionInfo> {
        self.sessions
            .lock()
            .values()
            .map(|s| TerminalSessionInfo {
                session_id: s.session_id.clone(),
                chat_id: s.chat_id.clone(),
                workspace_path: s.workspace_path.clone(),
                running: s.is_running(),
            })
            .collect()
    }

    pub fn kill_all(&self) {
        let sessions: Vec<Arc<TerminalSession>> =
            self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.kill();
        }
    }
}
