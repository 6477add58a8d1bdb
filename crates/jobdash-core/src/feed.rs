use crate::JobStatus;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Registry key whose handlers see every message, after the type-specific ones.
pub const WILDCARD_EVENT: &str = "*";

pub const JOB_UPDATE: &str = "job_update";
pub const JOB_RETRY: &str = "job_retry";
pub const PIPELINE_UPDATE: &str = "pipeline_update";
pub const JOB_DISCOVERY_COMPLETE: &str = "job_discovery_complete";

/// One inbound frame after parsing: the event type plus the whole object,
/// `type` field included.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedMessage {
    pub event_type: String,
    pub body: Value,
}

impl FeedMessage {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame has no event type")]
    MissingType,
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame(bytes: &[u8], max_frame_bytes: usize) -> Result<FeedMessage, FrameError> {
    let mut raw = bytes;
    while let Some(last) = raw.last() {
        if *last == b'\n' || *last == b'\r' {
            raw = &raw[..raw.len() - 1];
        } else {
            break;
        }
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    let body: Value =
        serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))?;
    let event_type = match body.get("type") {
        Some(Value::String(kind)) if !kind.trim().is_empty() => kind.clone(),
        _ => return Err(FrameError::MissingType),
    };
    Ok(FeedMessage { event_type, body })
}

/// Typed view of the four events the dashboard reacts to.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    JobUpdate(JobUpdatePayload),
    JobRetry(OpaquePayload),
    PipelineUpdate(OpaquePayload),
    JobDiscoveryComplete(OpaquePayload),
    #[serde(other)]
    Unknown,
}

impl FeedEvent {
    pub fn from_message(message: &FeedMessage) -> Result<Self, FrameError> {
        serde_json::from_value(message.body.clone()).map_err(|err| FrameError::Decode(err.to_string()))
    }
}

/// Every field is optional: a job_update with a missing or odd field still
/// has to reach the store so the jobs refresh happens.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct JobUpdatePayload {
    #[serde(default, deserialize_with = "lenient_id")]
    pub job_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: Option<JobStatus>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub action: Option<String>,
}

impl JobUpdatePayload {
    /// The job and status to patch locally, when the frame carries both.
    pub fn patch(&self) -> Option<(&str, &JobStatus)> {
        Some((self.job_id.as_deref()?, self.status.as_ref()?))
    }

    /// Approve and reject both move a job out of the manual-review queue.
    pub fn touches_pending(&self) -> bool {
        matches!(self.action.as_deref(), Some("approve") | Some("reject"))
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct OpaquePayload {
    #[serde(default, flatten)]
    pub fields: Map<String, Value>,
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_status<'de, D>(deserializer: D) -> Result<Option<JobStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_string(deserializer)?.map(|raw| raw.parse().unwrap_or_else(|never| match never {})))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}
