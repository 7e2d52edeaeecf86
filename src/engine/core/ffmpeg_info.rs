use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::ffmpeg_cmd::escape_path;

/// How long ffprobe may take before it is killed
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

const PROBE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

/// First line of `<tool> -version`
fn tool_version(program: &Path, name: &str) -> Result<String> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .with_context(|| {
            format!(
                "Failed to execute {} ({}). Is it installed and configured?",
                name,
                program.display()
            )
        })?;

    if !output.status.success() {
        anyhow::bail!("{} command failed with status: {}", name, output.status);
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let first_line = version_output.lines().next().unwrap_or("Unknown version");

    Ok(first_line.to_string())
}

/// Check if ffmpeg is available and return its version
pub fn ffmpeg_version(ffmpeg: &Path) -> Result<String> {
    tool_version(ffmpeg, "ffmpeg")
}

/// Check if ffprobe is available and return its version
pub fn ffprobe_version(ffprobe: &Path) -> Result<String> {
    tool_version(ffprobe, "ffprobe")
}

fn run_ffprobe(
    ffprobe: &Path,
    path: &Path,
    show_streams: bool,
    timeout: Duration,
) -> Result<String> {
    let mut cmd = Command::new(ffprobe);
    cmd.arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format");
    if show_streams {
        cmd.arg("-show_streams");
    }
    // Same protocol handling as the ffmpeg inputs
    let mut child = cmd
        .arg(escape_path(path))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to execute ffprobe")?;

    let stdout = child.stdout.take().context("ffprobe stdout not captured")?;
    let stderr = child.stderr.take().context("ffprobe stderr not captured")?;
    let stdout_reader = thread::spawn(move || read_lossy(stdout));
    let stderr_reader = thread::spawn(move || read_lossy(stderr));

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait().context("Failed to wait for ffprobe")? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!(
                "ffprobe timed out after {:?} for {}",
                timeout,
                path.display()
            );
        }
        thread::sleep(PROBE_POLL);
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    if !status.success() {
        let stderr = stderr_reader.join().unwrap_or_default();
        anyhow::bail!("ffprobe failed for {}: {}", path.display(), stderr.trim());
    }

    Ok(stdout)
}

fn read_lossy<R: Read>(mut stream: R) -> String {
    let mut buf = Vec::new();
    // A read error only truncates what gets parsed
    let _ = stream.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Probe a media file to get its duration in seconds
pub fn probe_duration(ffprobe: &Path, path: &Path) -> Result<f64> {
    probe_duration_within(ffprobe, path, PROBE_TIMEOUT)
}

/// Like `probe_duration`, killing ffprobe once `timeout` has passed
pub fn probe_duration_within(ffprobe: &Path, path: &Path, timeout: Duration) -> Result<f64> {
    let json = run_ffprobe(ffprobe, path, false, timeout)?;
    parse_ffprobe_duration(&json)
        .with_context(|| format!("Unusable ffprobe output for {}", path.display()))
}

/// Parse duration from ffprobe JSON string
pub fn parse_ffprobe_duration(json: &str) -> Result<f64> {
    let probe: FfprobeOutput =
        serde_json::from_str(json).context("Failed to parse ffprobe JSON")?;

    let duration_str = probe.format.duration.context("No duration found in JSON")?;

    duration_str
        .parse::<f64>()
        .context("Failed to parse duration as float")
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioStreamInfo {
    pub codec: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
}

/// Container-level facts plus the first video and audio stream of a file
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSummary {
    pub path: PathBuf,
    pub format_name: Option<String>,
    pub duration_s: Option<f64>,
    pub size_bytes: Option<u64>,
    pub bitrate_kbps: Option<f64>,
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
}

/// Probe format and stream information for display
pub fn probe_media(ffprobe: &Path, path: &Path) -> Result<MediaSummary> {
    let json = run_ffprobe(ffprobe, path, true, PROBE_TIMEOUT)?;
    parse_ffprobe_media(path, &json)
}

pub fn parse_ffprobe_media(path: &Path, json: &str) -> Result<MediaSummary> {
    let probe: FfprobeOutput =
        serde_json::from_str(json).context("Failed to parse ffprobe JSON")?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .map(|s| VideoStreamInfo {
            codec: s.codec_name.clone().unwrap_or_else(|| "unknown".to_string()),
            width: s.width.unwrap_or(0),
            height: s.height.unwrap_or(0),
            frame_rate: s.r_frame_rate.as_deref().and_then(parse_frame_rate),
        });

    let audio = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .map(|s| AudioStreamInfo {
            codec: s.codec_name.clone().unwrap_or_else(|| "unknown".to_string()),
            sample_rate: s.sample_rate.as_deref().and_then(|r| r.parse().ok()),
            channels: s.channels,
        });

    Ok(MediaSummary {
        path: path.to_path_buf(),
        format_name: probe.format.format_name,
        duration_s: probe.format.duration.and_then(|d| d.parse().ok()),
        size_bytes: probe.format.size.and_then(|s| s.parse().ok()),
        bitrate_kbps: probe
            .format
            .bit_rate
            .and_then(|b| b.parse::<f64>().ok())
            .map(|bps| bps / 1000.0),
        video,
        audio,
    })
}

/// `30000/1001` or `25`; zero denominators and `0/0` are treated as unknown
fn parse_frame_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.parse().ok()?,
    };
    (rate > 0.0).then_some(rate)
}

fn format_hms(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

impl fmt::Display for MediaSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "File: {}", self.path.display())?;
        writeln!(
            f,
            "Format: {}",
            self.format_name
                .as_deref()
                .unwrap_or("unknown")
                .to_uppercase()
        )?;
        if let Some(size) = self.size_bytes {
            writeln!(f, "Size: {:.1} MB", size as f64 / (1024.0 * 1024.0))?;
        }
        if let Some(duration) = self.duration_s {
            writeln!(f, "Duration: {}", format_hms(duration))?;
        }
        if let Some(kbps) = self.bitrate_kbps {
            writeln!(f, "Bitrate: {:.0} kb/s", kbps)?;
        }
        if let Some(video) = &self.video {
            write!(
                f,
                "Video: {} {}x{}",
                video.codec.to_uppercase(),
                video.width,
                video.height
            )?;
            if let Some(fps) = video.frame_rate {
                write!(f, " @ {:.2} fps", fps)?;
            }
            writeln!(f)?;
        }
        if let Some(audio) = &self.audio {
            write!(f, "Audio: {}", audio.codec.to_uppercase())?;
            if let Some(rate) = audio.sample_rate {
                write!(f, " {} Hz", rate)?;
            }
            if let Some(channels) = audio.channels {
                write!(f, " {}ch", channels)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Source of input durations for progress estimation
pub trait DurationProbe: Send + Sync {
    fn duration(&self, path: &Path) -> Result<f64>;
}

/// Probes with the configured ffprobe executable
#[derive(Debug, Clone)]
pub struct FfprobeDuration {
    pub ffprobe: PathBuf,
    pub timeout: Duration,
}

impl FfprobeDuration {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl DurationProbe for FfprobeDuration {
    fn duration(&self, path: &Path) -> Result<f64> {
        probe_duration_within(&self.ffprobe, path, self.timeout)
    }
}

/// Always fails, leaving progress indeterminate
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

impl DurationProbe for NoProbe {
    fn duration(&self, path: &Path) -> Result<f64> {
        anyhow::bail!("duration probing disabled for {}", path.display())
    }
}
