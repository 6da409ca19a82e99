//! Append-only JSONL run journal.

use crate::core::types::{RunEvent, TimestampedEvent};
use std::io::Write;
use std::path::Path;

/// RFC 3339 UTC timestamp with second precision.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Append an event to the journal at `path`, creating it if needed.
pub fn append_event(path: &Path, event: RunEvent) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let te = TimestampedEvent {
        ts: now_rfc3339(),
        event,
    };
    let json = serde_json::to_string(&te)?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", json)
}

/// Journal writer bound to one run. Write failures are logged, never fatal.
#[derive(Debug, Clone)]
pub struct Journal {
    path: Option<std::path::PathBuf>,
}

impl Journal {
    pub fn new(path: Option<std::path::PathBuf>) -> Self {
        Self { path }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn record(&self, event: RunEvent) {
        let Some(ref path) = self.path else {
            return;
        };
        if let Err(e) = append_event(path, event) {
            tracing::warn!(path = %path.display(), error = %e, "cannot append to run journal");
        }
    }
}

/// Read back every event in a journal file. Malformed lines are skipped.
pub fn read_events(path: &Path) -> std::io::Result<Vec<TimestampedEvent>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
