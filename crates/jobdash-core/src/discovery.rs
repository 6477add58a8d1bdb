use crate::DiscoveryResponse;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const DISCOVERY_FALLBACK_MESSAGE: &str = "Discovery completed successfully";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Success,
    Error,
}

/// Ephemeral banner raised by a discovery run. `id` lets an expiry timer
/// recognise whether the banner it was scheduled for is still the live one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryNotification {
    pub id: u64,
    pub kind: NoticeKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl DiscoveryNotification {
    pub fn success(id: u64, message: impl Into<String>) -> Self {
        Self::new(id, NoticeKind::Success, message)
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self::new(id, NoticeKind::Error, message)
    }

    fn new(id: u64, kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub total: u64,
    pub fragments: Vec<String>,
    pub message: String,
}

/// Sources with new jobs are listed when anything was found; when nothing
/// was found every reporting source is listed with its zero.
pub fn summarize_discovery(response: &DiscoveryResponse) -> DiscoverySummary {
    let total: u64 = response
        .pollers
        .iter()
        .map(|(_, report)| report.jobs_added)
        .sum();
    let fragments: Vec<String> = response
        .pollers
        .iter()
        .filter(|(_, report)| total == 0 || report.jobs_added > 0)
        .map(|(source, report)| format!("{} from {}", report.jobs_added, source_label(source)))
        .collect();

    let message = if total > 0 {
        let noun = if total == 1 { "job" } else { "jobs" };
        format!("Discovered {total} {noun}! ({})", fragments.join(", "))
    } else if !fragments.is_empty() {
        format!("Discovery completed: {}", fragments.join(", "))
    } else {
        DISCOVERY_FALLBACK_MESSAGE.to_string()
    };

    DiscoverySummary {
        total,
        fragments,
        message,
    }
}

pub fn source_label(source: &str) -> String {
    source.trim().replace(['_', '-'], " ").to_uppercase()
}
