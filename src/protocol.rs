//! MessagePack wire messages and framing.
//!
//! Every connection carries exactly one message in each direction, encoded as a
//! MessagePack map with string keys and no length prefix. Readers accumulate bytes
//! until a complete value decodes.
use crate::errors::AdmissionError;
use crate::task::{Priority, Task, TaskResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Default cap on the size of a single inbound message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

const READ_CHUNK: usize = 4096;

/// A task submission as it arrives on the main socket.
///
/// Every field is optional at this layer so that missing values turn into a
/// descriptive rejection instead of a decode failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
}

impl RequestMessage {
    /// Validates the request and turns it into a [`Task`].
    pub fn into_task(self) -> Result<Task, AdmissionError> {
        let raw_id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or(AdmissionError::MissingId)?;
        let id = Uuid::parse_str(raw_id.trim()).map_err(|_| AdmissionError::InvalidId(raw_id))?;

        let text = self
            .text
            .filter(|text| !text.trim().is_empty())
            .ok_or(AdmissionError::EmptyText)?;

        let callback = self
            .callback
            .ok_or(AdmissionError::MissingCallback)?
            .parse()?;

        let priority = self
            .priority
            .map(|p| p.parse::<Priority>())
            .transpose()?;

        let max_tokens = self
            .max_tokens
            .map(|n| {
                u32::try_from(n)
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or(AdmissionError::InvalidMaxTokens(n))
            })
            .transpose()?;

        Ok(Task::builder()
            .id(id)
            .text(text)
            .callback(callback)
            .ranked(self.ranked.unwrap_or(false))
            .maybe_priority(priority)
            .maybe_max_tokens(max_tokens)
            .build())
    }
}

/// The acknowledgment written back on the submission connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

impl AckMessage {
    pub fn accepted() -> Self {
        Self {
            status: AckStatus::Accepted,
            reason: None,
        }
    }

    pub fn rejected(reason: &AdmissionError) -> Self {
        Self {
            status: AckStatus::Rejected,
            reason: Some(reason.to_string()),
        }
    }
}

/// A result as delivered to the caller's callback destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub id: String,
    pub tool_input_json: String,
    pub priority: String,
    pub model_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&TaskResult> for ResultMessage {
    fn from(result: &TaskResult) -> Self {
        Self {
            id: result.id.to_string(),
            tool_input_json: result.tool_input_json.clone(),
            priority: result.priority.to_string(),
            model_id: result.model_id,
            error: result.error.clone(),
        }
    }
}

/// Errors while reading a single framed message.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed before a message was received")]
    Closed,

    #[error("connection closed mid-message after {0} bytes")]
    Truncated(usize),

    #[error("message exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("invalid message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for AdmissionError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge { limit } => AdmissionError::TooLarge { limit },
            other => AdmissionError::Malformed(other.to_string()),
        }
    }
}

/// Reads one MessagePack value, stopping as soon as the buffered bytes decode.
pub async fn read_message<R, T>(reader: &mut R, limit: usize) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                FrameError::Closed
            } else {
                FrameError::Truncated(buf.len())
            });
        }

        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > limit {
            return Err(FrameError::TooLarge { limit });
        }

        match rmp_serde::from_slice::<T>(&buf) {
            Ok(message) => return Ok(message),
            Err(e) if is_incomplete(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Encodes `message` as a MessagePack map and writes it in full.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(message).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Named (map) encoding so that clients can look fields up by key.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(message)
}

fn is_incomplete(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;
    match err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}
