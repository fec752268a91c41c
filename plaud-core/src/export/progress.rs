use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// Status tags surfaced to the host for every state transition of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Starting,
    Launching,
    Navigating,
    WaitingLogin,
    WaitingRecordings,
    Finding,
    Found,
    Exporting,
    Processing,
    Downloading,
    Error,
    Complete,
    BrowserOpen,
    Canceled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Starting => "starting",
            RunStatus::Launching => "launching",
            RunStatus::Navigating => "navigating",
            RunStatus::WaitingLogin => "waiting_login",
            RunStatus::WaitingRecordings => "waiting_recordings",
            RunStatus::Finding => "finding",
            RunStatus::Found => "found",
            RunStatus::Exporting => "exporting",
            RunStatus::Processing => "processing",
            RunStatus::Downloading => "downloading",
            RunStatus::Error => "error",
            RunStatus::Complete => "complete",
            RunStatus::BrowserOpen => "browser_open",
            RunStatus::Canceled => "canceled",
        };
        f.write_str(label)
    }
}

/// One progress report. Append-only from the engine's perspective; the host
/// renders or forwards it and never feeds anything back.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub status: RunStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<usize>,
}

impl StatusUpdate {
    pub fn new(status: RunStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            total: None,
            current: None,
            success: None,
            error: None,
        }
    }

    pub fn with_total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_progress(mut self, current: usize, total: usize) -> Self {
        self.current = Some(current);
        self.total = Some(total);
        self
    }

    pub fn with_counts(mut self, success: usize, error: usize) -> Self {
        self.success = Some(success);
        self.error = Some(error);
        self
    }
}

/// Where progress reports go. Implementations must be cheap and non-blocking;
/// the engine publishes from the middle of timed UI sequences.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, update: StatusUpdate);
}

impl ProgressSink for UnboundedSender<StatusUpdate> {
    fn publish(&self, update: StatusUpdate) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tags_match_wire_format() {
        assert_eq!(RunStatus::WaitingLogin.to_string(), "waiting_login");
        assert_eq!(RunStatus::BrowserOpen.to_string(), "browser_open");
        let json = serde_json::to_string(&RunStatus::WaitingRecordings).unwrap();
        assert_eq!(json, "\"waiting_recordings\"");
    }

    #[test]
    fn optional_counters_are_omitted_from_serialization() {
        let update = StatusUpdate::new(RunStatus::Finding, "Looking for recordings...");
        let json = serde_json::to_string(&update).unwrap();
        assert!(!json.contains("total"));
        assert!(!json.contains("success"));

        let update = StatusUpdate::new(RunStatus::Complete, "Export complete!")
            .with_total(3)
            .with_counts(3, 0);
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"total\":3"));
        assert!(json.contains("\"success\":3"));
        assert!(json.contains("\"error\":0"));
    }
}
