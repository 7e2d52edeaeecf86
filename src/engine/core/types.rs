use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::engine::error::JobError;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Succeeded, Failed and Cancelled never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Running or Paused: a process exists and counts against the concurrency limit
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Paused)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed(JobError),
    Cancelled,
}

impl Outcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Outcome::Succeeded => JobStatus::Succeeded,
            Outcome::Failed(_) => JobStatus::Failed,
            Outcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// What a line on ffmpeg's stderr turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// A `key=value` field of a progress block
    Progress,
    /// `progress=continue` or `progress=end`, closing a block
    BlockEnd,
    /// Anything else (banner, warnings, errors)
    Diagnostic,
}

/// Keys ffmpeg writes in a `-progress` block
const PROGRESS_KEYS: &[&str] = &[
    "frame",
    "fps",
    "bitrate",
    "total_size",
    "out_time_us",
    "out_time_ms",
    "out_time",
    "dup_frames",
    "drop_frames",
    "speed",
];

fn is_progress_key(key: &str) -> bool {
    // Per-stream quality: stream_0_0_q
    PROGRESS_KEYS.contains(&key) || (key.starts_with("stream_") && key.ends_with("_q"))
}

/// Parser for ffmpeg progress output (key=value format)
#[derive(Debug, Default, Clone)]
pub struct ProgressParser {
    pub out_time_us: u64,
    pub fps: Option<f64>,
    pub speed: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub total_size: Option<u64>,
    pub is_complete: bool,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a single line of ffmpeg stderr and report what kind of line it was.
    /// Unavailable values (`N/A`) leave the previous value in place.
    pub fn parse_line(&mut self, line: &str) -> LineKind {
        let Some((key, value)) = line.split_once('=') else {
            return LineKind::Diagnostic;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            // out_time_ms is also in microseconds, a long-standing ffmpeg quirk
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<u64>() {
                    self.out_time_us = us;
                }
            }
            "fps" => {
                if let Ok(f) = value.parse::<f64>() {
                    self.fps = Some(f);
                }
            }
            "speed" => {
                // Speed is in format "1.23x", strip the 'x'
                if let Ok(s) = value.trim_end_matches('x').trim().parse::<f64>() {
                    self.speed = Some(s);
                }
            }
            "bitrate" => {
                // Bitrate is in format "123.4kbits/s", extract number
                if let Ok(b) = value.trim_end_matches("kbits/s").parse::<f64>() {
                    self.bitrate_kbps = Some(b);
                }
            }
            "total_size" => {
                if let Ok(size) = value.parse::<u64>() {
                    self.total_size = Some(size);
                }
            }
            "progress" => {
                if value == "end" {
                    self.is_complete = true;
                }
                return LineKind::BlockEnd;
            }
            other if is_progress_key(other) => {}
            _ => return LineKind::Diagnostic,
        }
        LineKind::Progress
    }

    /// Get output time in seconds
    pub fn out_time_s(&self) -> f64 {
        self.out_time_us as f64 / 1_000_000.0
    }

    /// Completed fraction in [0, 1]; `None` when the total duration is unknown
    pub fn fraction(&self, total_duration_s: Option<f64>) -> Option<f64> {
        total_duration_s
            .filter(|total| *total > 0.0)
            .map(|total| (self.out_time_s() / total).clamp(0.0, 1.0))
    }

    pub fn snapshot(&self, total_duration_s: Option<f64>) -> ProgressSnapshot {
        ProgressSnapshot {
            out_time_s: self.out_time_s(),
            total_duration_s,
            fraction: self.fraction(total_duration_s),
            speed: self.speed,
            fps: self.fps,
            bitrate_kbps: self.bitrate_kbps,
            total_size: self.total_size,
            is_final: self.is_complete,
        }
    }
}

/// Progress of a running job as of the last completed progress block
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub out_time_s: f64,
    pub total_duration_s: Option<f64>,
    /// `None` means indeterminate
    pub fraction: Option<f64>,
    pub speed: Option<f64>,
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub total_size: Option<u64>,
    pub is_final: bool,
}

/// Read-only view of a job, as returned by `list_jobs`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub status: JobStatus,
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub progress: Option<ProgressSnapshot>,
    pub last_log: Option<String>,
    pub error: Option<JobError>,
    pub submitted_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
}

impl JobSummary {
    pub fn fraction(&self) -> Option<f64> {
        self.progress.as_ref().and_then(|p| p.fraction)
    }
}
