pub mod discovery;
pub mod feed;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    pub fn new(id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id: id.into(),
            status,
            extra: Map::new(),
        }
    }

    /// Backend fields are carried verbatim; this only reads string-ish ones for display.
    pub fn text_field(&self, key: &str) -> Option<String> {
        match self.extra.get(key)? {
            Value::String(value) if !value.trim().is_empty() => Some(value.clone()),
            Value::Number(value) => Some(value.to_string()),
            _ => None,
        }
    }

    pub fn title(&self) -> String {
        self.text_field("title")
            .or_else(|| self.text_field("job_title"))
            .unwrap_or_else(|| format!("job {}", self.id))
    }

    pub fn company(&self) -> Option<String> {
        self.text_field("company").or_else(|| self.text_field("company_name"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Failed,
    Matched,
    Completed,
    Rejected,
    Other(String),
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Failed => "failed",
            JobStatus::Matched => "matched",
            JobStatus::Completed => "completed",
            JobStatus::Rejected => "rejected",
            JobStatus::Other(raw) => raw.as_str(),
        }
    }

    /// Pending and failed jobs both still need attention from the pipeline.
    pub fn is_open(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = std::convert::Infallible;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(match input {
            "pending" => JobStatus::Pending,
            "failed" => JobStatus::Failed,
            "matched" => JobStatus::Matched,
            "completed" => JobStatus::Completed,
            "rejected" => JobStatus::Rejected,
            other => JobStatus::Other(other.to_string()),
        })
    }
}

impl Serialize for JobStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse::<JobStatus>().unwrap_or_else(|never| match never {}))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineSnapshot {
    #[serde(default, alias = "jobs")]
    pub active_jobs: Vec<Job>,
    #[serde(default, alias = "stages")]
    pub stage_counts: BTreeMap<String, u64>,
    #[serde(default, alias = "captured_at")]
    pub timestamp: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobsResponse {
    #[serde(default)]
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PendingResponse {
    #[serde(default)]
    pub pending_jobs: Vec<Job>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DiscoveryResponse {
    /// Source platform name to its report, in the order the backend sent them.
    #[serde(default, deserialize_with = "deserialize_ordered_pollers")]
    pub pollers: Vec<(String, PollerReport)>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PollerReport {
    #[serde(default)]
    pub jobs_added: u64,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// Query filters for the jobs list. Unset fields are left off the request.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct JobListParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub applied: usize,
    pub rejected: usize,
}

impl JobStats {
    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut stats = JobStats {
            total: jobs.len(),
            ..JobStats::default()
        };
        for job in jobs {
            match job.status {
                JobStatus::Pending | JobStatus::Failed => stats.pending += 1,
                JobStatus::Completed => stats.applied += 1,
                JobStatus::Rejected => stats.rejected += 1,
                _ => {}
            }
        }
        stats
    }
}

/// Deserialize an ID that can be either a string or a number into a String
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

fn deserialize_ordered_pollers<'de, D>(
    deserializer: D,
) -> Result<Vec<(String, PollerReport)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PollersVisitor;

    impl<'de> Visitor<'de> for PollersVisitor {
        type Value = Vec<(String, PollerReport)>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a map of source name to poller report")
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Vec::new())
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut pollers = Vec::new();
            while let Some((source, report)) = map.next_entry::<String, Value>()? {
                // A poller that reported garbage still counts as "ran, added nothing".
                let report = serde_json::from_value(report).unwrap_or_default();
                pollers.push((source, report));
            }
            Ok(pollers)
        }
    }

    deserializer.deserialize_any(PollersVisitor)
}
