//! Wire protocol
//!
//! Every message is a JSON object `{"type": ..., "payload": ...}`.

use serde::{Deserialize, Serialize};

use crate::session::SessionEvent;
use crate::session::preferences::Preferences;
use crate::types::{ExecutionResult, Outcome, OutputChunk};

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Run code
    Execute(ExecutePayload),

    /// Stop the running execution
    Stop,

    /// Ask for the sample snippet of a file extension
    GetTemplate(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutePayload {
    pub code: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<Preferences>,
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sent once when a client connects
    ServerInfo(ServerInfo),

    /// A piece of output, in production order
    Output(OutputPayload),

    /// Terminal event of an execution; always the last one for a request
    ExecutionComplete(CompletionPayload),

    /// An `execute` arrived while another one was still running
    Busy(MessagePayload),

    /// Reply to `get-template`; `null` when the extension is unknown
    Template(Option<String>),

    /// The client sent something that could not be understood
    Error(MessagePayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub message: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub supported_languages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPayload {
    pub output: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionPayload {
    pub language: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message: String,
}

impl MessagePayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<OutputChunk> for OutputPayload {
    fn from(chunk: OutputChunk) -> Self {
        Self {
            error: chunk.is_error(),
            output: chunk.text,
        }
    }
}

impl From<&ExecutionResult> for CompletionPayload {
    fn from(result: &ExecutionResult) -> Self {
        Self {
            language: result.language.clone(),
            outcome: result.outcome,
            duration_ms: result.duration_ms,
            exit_code: result.exit_code,
            truncated: result.truncated,
        }
    }
}

impl From<SessionEvent> for ServerEvent {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Output(chunk) => ServerEvent::Output(chunk.into()),
            SessionEvent::Complete(result) => ServerEvent::ExecutionComplete((&result).into()),
        }
    }
}
