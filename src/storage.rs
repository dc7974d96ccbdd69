use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: String, // Unique identifier, never reused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>, // Saved command this run came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>, // Saved command name at the time of the run
    #[serde(rename = "workdir")]
    pub working_dir: String,
    pub command: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output: String, // stdout, then stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>, // Human readable, e.g. "1.5s"
}

/// Terminal result of one run, applied to its record in a single step.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: ExecutionStatus,
    pub exit_code: i32,
    pub output: String,
    pub ended_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Moves a running record to its terminal state.
    ///
    /// Returns `false` and leaves the record untouched if it already left
    /// `running`.
    pub fn finish(&mut self, completion: Completion) -> bool {
        if self.status.is_terminal() || !completion.status.is_terminal() {
            return false;
        }
        let elapsed = (completion.ended_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        self.status = completion.status;
        self.exit_code = Some(completion.exit_code);
        self.output = completion.output;
        self.ended_at = Some(completion.ended_at);
        self.duration = Some(format_elapsed(elapsed));
        true
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CommandTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "workdir")]
    pub working_dir: String,
    pub command: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Formats an elapsed time the way Go prints a `time.Duration`:
/// `850ns`, `12.5µs`, `3.2ms`, `1.5s`, `2m3s`, `1h0m5.25s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let nanos = elapsed.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{}ns", nanos);
    }
    if nanos < 1_000_000 {
        return format!("{}µs", decimal(nanos, 1_000, 3));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", decimal(nanos, 1_000_000, 6));
    }

    let total_secs = nanos / 1_000_000_000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let sub_minute = nanos % 60_000_000_000;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&decimal(sub_minute, 1_000_000_000, 9));
    out.push('s');
    out
}

// `value / unit` printed exactly, trailing fractional zeros removed.
fn decimal(value: u128, unit: u128, digits: usize) -> String {
    let whole = value / unit;
    let frac = value % unit;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0width$}", frac, width = digits);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn running_record() -> ExecutionRecord {
        ExecutionRecord {
            id: "rec-1".to_string(),
            command_id: None,
            name: None,
            working_dir: "/tmp".to_string(),
            command: "true".to_string(),
            status: ExecutionStatus::Running,
            output: String::new(),
            exit_code: None,
            executed_by: None,
            started_at: Utc::now(),
            ended_at: None,
            duration: None,
        }
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::ZERO), "0s");
        assert_eq!(format_elapsed(Duration::from_nanos(850)), "850ns");
        assert_eq!(format_elapsed(Duration::from_nanos(12_500)), "12.5µs");
        assert_eq!(format_elapsed(Duration::from_micros(3_200)), "3.2ms");
        assert_eq!(format_elapsed(Duration::from_millis(1_500)), "1.5s");
        assert_eq!(format_elapsed(Duration::from_secs(2)), "2s");
        assert_eq!(format_elapsed(Duration::from_secs(123)), "2m3s");
        assert_eq!(format_elapsed(Duration::from_millis(3_605_250)), "1h0m5.25s");
    }

    #[test]
    fn test_finish_happens_once() {
        let mut record = running_record();
        let ended_at = record.started_at + ChronoDuration::milliseconds(1500);

        assert!(record.finish(Completion {
            status: ExecutionStatus::Failed,
            exit_code: 7,
            output: "boom".to_string(),
            ended_at,
        }));
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.exit_code, Some(7));
        assert_eq!(record.duration.as_deref(), Some("1.5s"));

        // A second completion never overrides the first one
        assert!(!record.finish(Completion {
            status: ExecutionStatus::Success,
            exit_code: 0,
            output: String::new(),
            ended_at,
        }));
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.output, "boom");
    }

    #[test]
    fn test_finish_rejects_running_as_terminal() {
        let mut record = running_record();
        assert!(!record.finish(Completion {
            status: ExecutionStatus::Running,
            exit_code: 0,
            output: String::new(),
            ended_at: Utc::now(),
        }));
        assert_eq!(record.exit_code, None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ExecutionStatus::Success).unwrap();
        assert_eq!(json, "\"success\"");
    }
}
