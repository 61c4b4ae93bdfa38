// src/web/mod.rs
// Persistent web session manager. The browser itself sits behind the
// WebDriver trait; this module owns the session state machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default)]
pub struct PageMeta {
    pub url: String,
    pub title: String,
}

/// Backend that actually drives a headless browser.
#[async_trait]
pub trait WebDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> anyhow::Result<PageMeta>;
    async fn reload(&self) -> anyhow::Result<PageMeta>;
    async fn screenshot(&self) -> anyhow::Result<Vec<u8>>;
    async fn click(&self, x: f64, y: f64) -> anyhow::Result<()>;
    async fn scroll(&self, dx: f64, dy: f64) -> anyhow::Result<()>;
    async fn send_key(&self, key: &str) -> anyhow::Result<()>;
    async fn type_text(&self, text: &str) -> anyhow::Result<()>;
}

/// Driver for deployments without a browser; navigation succeeds with
/// synthetic metadata so the state machine stays exercisable.
pub struct NullWebDriver;

#[async_trait]
impl WebDriver for NullWebDriver {
    async fn navigate(&self, url: &str) -> anyhow::Result<PageMeta> {
        Ok(PageMeta {
            url: url.to_string(),
            title: String::new(),
        })
    }

    async fn reload(&self) -> anyhow::Result<PageMeta> {
        Ok(PageMeta::default())
    }

    async fn screenshot(&self) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("no browser driver configured")
    }

    async fn click(&self, _x: f64, _y: f64) -> anyhow::Result<()> {
        Ok(())
    }

    async fn scroll(&self, _dx: f64, _dy: f64) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_key(&self, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn type_text(&self, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub can_go_back: bool,
    pub can_go_forward: bool,
}

struct SessionState {
    session_id: String,
    status: String,
    profile_name: String,
    // Navigation history with a position cursor; back/forward move the
    // cursor and are no-ops at the endpoints
    history: Vec<String>,
    cursor: usize,
    title: String,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            status: self.status.clone(),
            url: self.history.get(self.cursor).cloned(),
            title: (!self.title.is_empty()).then(|| self.title.clone()),
            can_go_back: self.cursor > 0,
            can_go_forward: !self.history.is_empty() && self.cursor + 1 < self.history.len(),
        }
    }
}

/// Singleton owner of the one persistent browser session shared by
/// every web tool. Commands serialize through the session lock;
/// screenshots take a separate lock so they can proceed while a
/// command is pending.
pub struct WebSessionManager {
    driver: Arc<dyn WebDriver>,
    session: Mutex<Option<SessionState>>,
    screenshot_lock: Mutex<()>,
}

impl WebSessionManager {
    pub fn new(driver: Arc<dyn WebDriver>) -> Self {
        Self {
            driver,
            session: Mutex::new(None),
            screenshot_lock: Mutex::new(()),
        }
    }

    /// Idempotent: returns the live session's snapshot or starts one.
    pub async fn ensure_session(
        &self,
        profile_name: Option<&str>,
        chat_id: Option<&str>,
    ) -> SessionSnapshot {
        let mut session = self.session.lock().await;
        if let Some(state) = session.as_ref() {
            return state.snapshot();
        }

        let state = SessionState {
            session_id: Uuid::new_v4().to_string(),
            status: "ready".to_string(),
            profile_name: profile_name.unwrap_or("google_serp").to_string(),
            history: Vec::new(),
            cursor: 0,
            title: String::new(),
        };
        info!(
            session_id = %state.session_id,
            profile = %state.profile_name,
            chat_id = chat_id.unwrap_or("-"),
            "Started web session"
        );
        let snapshot = state.snapshot();
        *session = Some(state);
        snapshot
    }

    pub async fn has_active_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn get_status(&self) -> Option<SessionSnapshot> {
        self.session.lock().await.as_ref().map(|s| s.snapshot())
    }

    /// Dispatch one command. Held under the session lock for the whole
    /// call so commands are strictly serialized.
    pub async fn dispatch_command(
        &self,
        session_id: &str,
        payload: &Value,
    ) -> anyhow::Result<SessionSnapshot> {
        let mut guard = self.session.lock().await;
        let state = guard
            .as_mut()
            .filter(|s| s.session_id == session_id)
            .ok_or_else(|| anyhow::anyhow!("no active session with id {session_id}"))?;

        let command = payload
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("command payload missing type"))?;

        match command {
            "navigate" => {
                let url = payload
                    .get("url")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("navigate requires url"))?;
                let meta = self.driver.navigate(url).await?;
                // A navigation from mid-history discards the forward tail
                if !state.history.is_empty() {
                    state.history.truncate(state.cursor + 1);
                }
                state.history.push(meta.url);
                state.cursor = state.history.len() - 1;
                state.title = meta.title;
            }
            "back" => {
                if state.cursor > 0 {
                    state.cursor -= 1;
                    let url = state.history[state.cursor].clone();
                    let meta = self.driver.navigate(&url).await?;
                    state.title = meta.title;
                }
            }
            "forward" => {
                if !state.history.is_empty() && state.cursor + 1 < state.history.len() {
                    state.cursor += 1;
                    let url = state.history[state.cursor].clone();
                    let meta = self.driver.navigate(&url).await?;
                    state.title = meta.title;
                }
            }
            "reload" => {
                let meta = self.driver.reload().await?;
                if !meta.title.is_empty() {
                    state.title = meta.title;
                }
            }
            "click" => {
                let x = payload.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let y = payload.get("y").and_then(|v| v.as_f64()).unwrap_or(0.0);
                self.driver.click(x, y).await?;
            }
            "scroll" => {
                let dx = payload.get("dx").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let dy = payload.get("dy").and_then(|v| v.as_f64()).unwrap_or(0.0);
                self.driver.scroll(dx, dy).await?;
            }
            "key" => {
                let key = payload
                    .get("key")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("key command requires key"))?;
                self.driver.send_key(key).await?;
            }
            "type" => {
                let text = payload
                    .get("text")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("type command requires text"))?;
                self.driver.type_text(text).await?;
            }
            other => anyhow::bail!("unknown web command: {other}"),
        }

        Ok(state.snapshot())
    }

    /// Capture a frame with a hard timeout. Takes only the screenshot
    /// lock, so capture can overlap a pending command.
    pub async fn capture_frame(&self, session_id: &str) -> anyhow::Result<Vec<u8>> {
        {
            let session = self.session.lock().await;
            if session
                .as_ref()
                .map(|s| s.session_id != session_id)
                .unwrap_or(true)
            {
                anyhow::bail!("no active session with id {session_id}");
            }
        }

        let _guard = self.screenshot_lock.lock().await;
        match tokio::time::timeout(SCREENSHOT_TIMEOUT, self.driver.screenshot()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(session_id = %session_id, "Screenshot timed out");
                anyhow::bail!("screenshot timed out")
            }
        }
    }

    pub async fn destroy_session(&self) -> bool {
        self.session.lock().await.take().is_some()
    }

    /// Browser profile availability, reported to the frontend when a
    /// web-domain turn starts.
    pub fn profile_status(&self) -> Value {
        json!({
            "exists": false,
            "status": "unknown",
            "path": "",
            "profile_name": "google_serp",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> WebSessionManager {
        WebSessionManager::new(Arc::new(NullWebDriver))
    }

    #[tokio::test]
    async fn ensure_session_is_idempotent() {
        let manager = manager();
        let first = manager.ensure_session(None, None).await;
        let second = manager.ensure_session(Some("other"), None).await;
        assert_eq!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn back_and_forward_are_noops_at_endpoints() {
        let manager = manager();
        let session = manager.ensure_session(None, None).await;
        let id = session.session_id;

        // Back on empty history: nothing happens
        let snap = manager
            .dispatch_command(&id, &json!({"type": "back"}))
            .await
            .unwrap();
        assert!(snap.url.is_none());

        for url in ["https://a.example", "https://b.example", "https://c.example"] {
            manager
                .dispatch_command(&id, &json!({"type": "navigate", "url": url}))
                .await
                .unwrap();
        }

        let snap = manager
            .dispatch_command(&id, &json!({"type": "back"}))
            .await
            .unwrap();
        assert_eq!(snap.url.as_deref(), Some("https://b.example"));
        assert!(snap.can_go_back && snap.can_go_forward);

        // Forward twice: second is a no-op at the end of history
        manager
            .dispatch_command(&id, &json!({"type": "forward"}))
            .await
            .unwrap();
        let snap = manager
            .dispatch_command(&id, &json!({"type": "forward"}))
            .await
            .unwrap();
        assert_eq!(snap.url.as_deref(), Some("https://c.example"));
        assert!(!snap.can_go_forward);
    }

    #[tokio::test]
    async fn mid_history_navigation_discards_forward_tail() {
        let manager = manager();
        let id = manager.ensure_session(None, None).await.session_id;

        for url in ["https://a.example", "https://b.example"] {
            manager
                .dispatch_command(&id, &json!({"type": "navigate", "url": url}))
                .await
                .unwrap();
        }
        manager
            .dispatch_command(&id, &json!({"type": "back"}))
            .await
            .unwrap();
        let snap = manager
            .dispatch_command(&id, &json!({"type": "navigate", "url": "https://d.example"}))
            .await
            .unwrap();
        assert_eq!(snap.url.as_deref(), Some("https://d.example"));
        assert!(!snap.can_go_forward, "forward tail must be gone");
    }
}
