// Error taxonomy shared by the builder, the supervisor and the queue

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use super::core::{Container, TimeOffset};

/// A single violated constraint of a transcode option set
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    #[error("at least one input path is required")]
    NoInputs,

    #[error("output path {} is also used as an input", .0.display())]
    OutputIsInput(PathBuf),

    #[error("trim end {end} must be after trim start {start}")]
    TrimEndNotAfterStart { start: TimeOffset, end: TimeOffset },

    #[error("{what} '{name}' may only contain letters, digits, '_' and '-'")]
    InvalidName { what: &'static str, name: String },

    #[error("video stream copy cannot be combined with {0}")]
    VideoCopyWith(&'static str),

    #[error("disabled video cannot be combined with {0}")]
    VideoDisabledWith(&'static str),

    #[error("audio stream copy cannot be combined with {0}")]
    AudioCopyWith(&'static str),

    #[error("a stream copy merge cannot be combined with {0}")]
    StreamCopyMergeWith(&'static str),

    #[error("disabled audio cannot be combined with an audio bitrate")]
    AudioDisabledWithBitrate,

    #[error("both video and audio are disabled, nothing would be written")]
    NoStreams,

    #[error("resolution {width}x{height} must have non-zero dimensions")]
    InvalidResolution { width: u32, height: u32 },

    #[error("frame rate {0} must be a positive number")]
    InvalidFrameRate(f64),

    #[error("quality factor {0} is out of range (0-63)")]
    CrfOutOfRange(u8),

    #[error("{0} bitrate must be greater than zero")]
    ZeroBitrate(&'static str),

    #[error("faststart is only available for mp4, mov and m4a outputs, not {0}")]
    FaststartUnsupported(String),

    #[error("extra arguments could not be split: {0}")]
    UnparsableExtraArgs(String),
}

impl Violation {
    pub(crate) fn faststart(container: Option<Container>, extension: Option<&str>) -> Self {
        let name = container
            .map(|c| c.extension().to_string())
            .or_else(|| extension.map(str::to_string))
            .unwrap_or_else(|| "an output without extension".to_string());
        Violation::FaststartUnsupported(name)
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure to parse a textual option value (CLI flags, config defaults)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionParseError {
    #[error("unknown container '{0}'")]
    UnknownContainer(String),

    #[error("invalid resolution '{0}' (expected WIDTHxHEIGHT or 1080p/720p/480p/360p)")]
    InvalidResolution(String),

    #[error("invalid time offset '{0}' (expected seconds or [HH:]MM:SS[.fff])")]
    InvalidTime(String),

    #[error("invalid filter '{0}' (expected: name key=value ...)")]
    InvalidFilter(String),

    #[error("invalid quality '{0}' (expected crf:N or NNNk)")]
    InvalidQuality(String),
}

/// Failure to turn an option set into an argument vector
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error("invalid options: {}", join_violations(.0))]
    InvalidOptions(Vec<Violation>),
}

impl BuildError {
    pub fn violations(&self) -> &[Violation] {
        match self {
            BuildError::InvalidOptions(v) => v,
        }
    }
}

/// Why a job ended in the Failed state
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    #[error("invalid options: {}", join_violations(.violations))]
    InvalidOptions { violations: Vec<Violation> },

    #[error("executable not found: {}", .path.display())]
    ExecutableNotFound { path: PathBuf },

    #[error("failed to start {}: {reason}", .path.display())]
    SpawnFailed { path: PathBuf, reason: String },

    #[error("{}\n{}", describe_exit(.exit_code), .diagnostic_tail.join("\n"))]
    ProcessFailed {
        exit_code: Option<i32>,
        diagnostic_tail: Vec<String>,
    },

    #[error("lost track of the process: {reason}")]
    SupervisionFailed { reason: String },

    #[error("could not write concat list {}: {reason}", .path.display())]
    ConcatListFailed { path: PathBuf, reason: String },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("process exited with code {}", code),
        None => "process was terminated by a signal".to_string(),
    }
}

impl From<BuildError> for JobError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::InvalidOptions(violations) => JobError::InvalidOptions { violations },
        }
    }
}

/// Errors returned by process controls (pause/resume)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("the process has already exited")]
    ProcessGone,
}

/// Errors returned by the queue's inbound interface
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("no job with id {0}")]
    JobNotFound(Uuid),

    #[error("job {0} is no longer pending")]
    NotPending(Uuid),

    #[error("job {0} is not running")]
    NotRunning(Uuid),

    #[error("concurrency must be at least 1 (got {0})")]
    InvalidConcurrency(usize),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("the scheduler has shut down")]
    Disconnected,
}
