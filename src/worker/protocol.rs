// src/worker/protocol.rs
// Framed JSON protocol between the pool parent and worker subprocesses

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::WorkerError;
use crate::router::RouterDecision;
use crate::store::ChatState;

/// Commands the parent sends to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    Process {
        chat_id: String,
        message: String,
        provider: String,
        model: String,
        include_reasoning: bool,
        #[serde(default)]
        attached_file_ids: Vec<String>,
        user_message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        router_decision: Option<RouterDecision>,
        #[serde(default)]
        estimated_tokens: i64,
    },
    Stop,
    Cancel,
    DomainToolDecision {
        chat_id: String,
        task_id: String,
        call_id: String,
        decision: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        assistant_message_id: Option<String>,
        #[serde(default = "default_batch_mode")]
        batch_mode: bool,
        #[serde(default)]
        pre_executed_calls: std::collections::HashMap<String, bool>,
        #[serde(default)]
        pre_execution_state: std::collections::HashMap<String, Value>,
    },
    WorkspaceSelected {
        chat_id: String,
    },
}

fn default_batch_mode() -> bool {
    true
}

/// Messages a worker streams back to the parent. Exactly one `Done`
/// closes each command that runs a turn; `Handshake` opens the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Handshake {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StateUpdate {
        chat_id: String,
        state: ChatState,
    },
    Content {
        chat_id: String,
        content_type: String,
        content: String,
        #[serde(flatten)]
        metadata: Map<String, Value>,
    },
    RouterDecision {
        chat_id: String,
        decision: RouterDecision,
    },
    Done {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        stopped_during_stream: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cancelled: bool,
    },
}

impl WorkerEvent {
    pub fn content(chat_id: &str, content_type: &str, content: impl Into<String>) -> Self {
        WorkerEvent::Content {
            chat_id: chat_id.to_string(),
            content_type: content_type.to_string(),
            content: content.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_meta(self, key: &str, value: Value) -> Self {
        match self {
            WorkerEvent::Content {
                chat_id,
                content_type,
                content,
                mut metadata,
            } => {
                if !value.is_null() {
                    metadata.insert(key.to_string(), value);
                }
                WorkerEvent::Content {
                    chat_id,
                    content_type,
                    content,
                    metadata,
                }
            }
            other => other,
        }
    }
}

/// Length-prefixed JSON frames over a read/write pair.
pub struct FramedJson<R, W> {
    reader: FramedRead<R, LengthDelimitedCodec>,
    writer: FramedWrite<W, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> FramedJson<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, LengthDelimitedCodec::new()),
            writer: FramedWrite::new(writer, LengthDelimitedCodec::new()),
        }
    }

    pub async fn send<T: Serialize>(&mut self, value: &T) -> Result<(), WorkerError> {
        let encoded = serde_json::to_vec(value)
            .map_err(|e| WorkerError::Protocol(format!("encode failed: {e}")))?;
        self.writer
            .send(Bytes::from(encoded))
            .await
            .map_err(WorkerError::Io)
    }

    /// Next frame, `None` on a cleanly closed pipe.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, WorkerError> {
        match self.reader.next().await {
            Some(Ok(frame)) => {
                let value = serde_json::from_slice(&frame)
                    .map_err(|e| WorkerError::Protocol(format!("decode failed: {e}")))?;
                Ok(Some(value))
            }
            Some(Err(e)) => Err(WorkerError::Io(e)),
            None => Ok(None),
        }
    }

    /// Split into halves so the child can read commands while a
    /// forwarder task owns the event writer.
    pub fn split(
        self,
    ) -> (
        FramedRead<R, LengthDelimitedCodec>,
        FramedWrite<W, LengthDelimitedCodec>,
    ) {
        (self.reader, self.writer)
    }

    /// Borrow both halves at once, so a read future and a write call can
    /// coexist in one select loop.
    pub fn split_mut(
        &mut self,
    ) -> (
        &mut FramedRead<R, LengthDelimitedCodec>,
        &mut FramedWrite<W, LengthDelimitedCodec>,
    ) {
        (&mut self.reader, &mut self.writer)
    }
}

/// Read one JSON frame from a bare framed reader.
pub async fn read_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut FramedRead<R, LengthDelimitedCodec>,
) -> Result<Option<T>, WorkerError> {
    match reader.next().await {
        Some(Ok(frame)) => {
            let value = serde_json::from_slice(&frame)
                .map_err(|e| WorkerError::Protocol(format!("decode failed: {e}")))?;
            Ok(Some(value))
        }
        Some(Err(e)) => Err(WorkerError::Io(e)),
        None => Ok(None),
    }
}

/// Write one JSON frame to a bare framed writer.
pub async fn write_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut FramedWrite<W, LengthDelimitedCodec>,
    value: &T,
) -> Result<(), WorkerError> {
    let encoded = serde_json::to_vec(value)
        .map_err(|e| WorkerError::Protocol(format!("encode failed: {e}")))?;
    writer.send(Bytes::from(encoded)).await.map_err(WorkerError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let mut parent = FramedJson::new(client_read, client_write);
        let mut child = FramedJson::new(server_read, server_write);

        let command = WorkerCommand::Process {
            chat_id: "c1".to_string(),
            message: "hello".to_string(),
            provider: "scripted".to_string(),
            model: "scripted-model".to_string(),
            include_reasoning: false,
            attached_file_ids: vec![],
            user_message_id: "c1_1".to_string(),
            router_decision: None,
            estimated_tokens: 12,
        };
        parent.send(&command).await.unwrap();

        let received: WorkerCommand = child.recv().await.unwrap().unwrap();
        match received {
            WorkerCommand::Process { chat_id, estimated_tokens, .. } => {
                assert_eq!(chat_id, "c1");
                assert_eq!(estimated_tokens, 12);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        child
            .send(&WorkerEvent::content("c1", "answer", "hi").with_meta("task_id", serde_json::json!("t1")))
            .await
            .unwrap();
        let event: WorkerEvent = parent.recv().await.unwrap().unwrap();
        match event {
            WorkerEvent::Content { content_type, metadata, .. } => {
                assert_eq!(content_type, "answer");
                assert_eq!(metadata.get("task_id"), Some(&serde_json::json!("t1")));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
