//! Session summary (last_session.json)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use super::state::SessionState;
use super::{SessionOutcome, SessionReport};
use crate::error::FailureKind;
use crate::slot::SlotId;

/// Schema version for the session summary
pub const SESSION_SUMMARY_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for the session summary
pub const SESSION_SUMMARY_SCHEMA_ID: &str = "ab-flash-updater/session_summary@1";

/// Coarse result of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Updated,
    NoUpdate,
    DryRun,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub schema_version: u32,
    pub schema_id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,

    /// Final state machine state
    pub state: SessionState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,

    /// Error message of the aborting failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_slot: Option<SlotId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_slot: Option<SlotId>,

    /// Bundle version, once the manifest was read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Non-fatal findings
    #[serde(default)]
    pub warnings: Vec<FailureKind>,

    pub exit_code: i32,
}

impl SessionSummary {
    pub fn from_report(report: &SessionReport, started_at: DateTime<Utc>) -> Self {
        let (outcome, error) = match &report.result {
            Ok(SessionOutcome::Updated { .. }) => (Outcome::Updated, None),
            Ok(SessionOutcome::NoUpdate) => (Outcome::NoUpdate, None),
            Ok(SessionOutcome::DryRun { .. }) => (Outcome::DryRun, None),
            Err(e) => (Outcome::Aborted, Some(e.to_string())),
        };

        Self {
            schema_version: SESSION_SUMMARY_SCHEMA_VERSION,
            schema_id: SESSION_SUMMARY_SCHEMA_ID.to_string(),
            session_id: report.session_id.clone(),
            started_at,
            finished_at: Utc::now(),
            outcome,
            state: report.state,
            failure_kind: report.failure_kind(),
            error,
            from_slot: report.from_slot,
            to_slot: report.to_slot,
            version: report.version.clone(),
            warnings: report.warnings.clone(),
            exit_code: report.exit_code().as_i32(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write atomically to file (write-then-rename)
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(io::Error::from)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = path.with_extension("tmp");
        let written = fs::write(&temp_path, json).and_then(|()| fs::rename(&temp_path, path));
        if written.is_err() && temp_path.is_file() {
            let _ = fs::remove_file(&temp_path);
        }
        written
    }

    pub fn from_file(path: &Path) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(io::Error::from)
    }
}
