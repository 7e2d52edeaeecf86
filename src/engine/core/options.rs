use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use crate::engine::error::{OptionParseError, Violation};

/// Output container. When unset on a job, ffmpeg infers the muxer from the output extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Mkv,
    Webm,
    Mov,
    Avi,
    Mp3,
    M4a,
    Wav,
    Flac,
    Ogg,
}

impl Container {
    pub const ALL: [Container; 10] = [
        Container::Mp4,
        Container::Mkv,
        Container::Webm,
        Container::Mov,
        Container::Avi,
        Container::Mp3,
        Container::M4a,
        Container::Wav,
        Container::Flac,
        Container::Ogg,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
            Container::Webm => "webm",
            Container::Mov => "mov",
            Container::Avi => "avi",
            Container::Mp3 => "mp3",
            Container::M4a => "m4a",
            Container::Wav => "wav",
            Container::Flac => "flac",
            Container::Ogg => "ogg",
        }
    }

    /// Name passed to `-f`
    pub fn muxer(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "matroska",
            Container::Webm => "webm",
            Container::Mov => "mov",
            Container::Avi => "avi",
            Container::Mp3 => "mp3",
            Container::M4a => "ipod",
            Container::Wav => "wav",
            Container::Flac => "flac",
            Container::Ogg => "ogg",
        }
    }

    pub fn is_audio_only(self) -> bool {
        matches!(
            self,
            Container::Mp3 | Container::M4a | Container::Wav | Container::Flac | Container::Ogg
        )
    }

    pub fn supports_faststart(self) -> bool {
        matches!(self, Container::Mp4 | Container::Mov | Container::M4a)
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        Container::ALL
            .into_iter()
            .find(|c| c.extension() == ext)
            .or(match ext.as_str() {
                "m4v" => Some(Container::Mp4),
                "matroska" => Some(Container::Mkv),
                "oga" => Some(Container::Ogg),
                _ => None,
            })
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Container {
    type Err = OptionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Container::from_extension(s.trim())
            .ok_or_else(|| OptionParseError::UnknownContainer(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    H264,
    Hevc,
    Vp9,
    Av1,
    Mpeg4,
    Prores,
    /// Any other encoder by its ffmpeg name
    Named(String),
    Copy,
    /// No video stream in the output (`-vn`)
    Disabled,
}

impl VideoCodec {
    /// Value for `-c:v`; `None` when video is disabled
    pub fn encoder(&self) -> Option<&str> {
        match self {
            VideoCodec::H264 => Some("libx264"),
            VideoCodec::Hevc => Some("libx265"),
            VideoCodec::Vp9 => Some("libvpx-vp9"),
            VideoCodec::Av1 => Some("libsvtav1"),
            VideoCodec::Mpeg4 => Some("mpeg4"),
            VideoCodec::Prores => Some("prores_ks"),
            VideoCodec::Named(name) => Some(name.as_str()),
            VideoCodec::Copy => Some("copy"),
            VideoCodec::Disabled => None,
        }
    }
}

impl FromStr for VideoCodec {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let codec = match s.trim().to_ascii_lowercase().as_str() {
            "h264" | "x264" | "libx264" | "avc" => VideoCodec::H264,
            "hevc" | "h265" | "x265" | "libx265" => VideoCodec::Hevc,
            "vp9" | "libvpx-vp9" => VideoCodec::Vp9,
            "av1" | "libsvtav1" => VideoCodec::Av1,
            "mpeg4" => VideoCodec::Mpeg4,
            "prores" | "prores_ks" => VideoCodec::Prores,
            "copy" => VideoCodec::Copy,
            "none" | "disabled" => VideoCodec::Disabled,
            _ => VideoCodec::Named(s.trim().to_string()),
        };
        Ok(codec)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    Aac,
    Mp3,
    Opus,
    Vorbis,
    Flac,
    Ac3,
    Pcm,
    Named(String),
    Copy,
    /// No audio stream in the output (`-an`)
    Disabled,
}

impl AudioCodec {
    /// Value for `-c:a`; `None` when audio is disabled
    pub fn encoder(&self) -> Option<&str> {
        match self {
            AudioCodec::Aac => Some("aac"),
            AudioCodec::Mp3 => Some("libmp3lame"),
            AudioCodec::Opus => Some("libopus"),
            AudioCodec::Vorbis => Some("libvorbis"),
            AudioCodec::Flac => Some("flac"),
            AudioCodec::Ac3 => Some("ac3"),
            AudioCodec::Pcm => Some("pcm_s16le"),
            AudioCodec::Named(name) => Some(name.as_str()),
            AudioCodec::Copy => Some("copy"),
            AudioCodec::Disabled => None,
        }
    }

    pub fn is_lossless(&self) -> bool {
        matches!(self, AudioCodec::Flac | AudioCodec::Pcm)
    }
}

impl FromStr for AudioCodec {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let codec = match s.trim().to_ascii_lowercase().as_str() {
            "aac" => AudioCodec::Aac,
            "mp3" | "libmp3lame" => AudioCodec::Mp3,
            "opus" | "libopus" => AudioCodec::Opus,
            "vorbis" | "libvorbis" => AudioCodec::Vorbis,
            "flac" => AudioCodec::Flac,
            "ac3" => AudioCodec::Ac3,
            "pcm" | "pcm_s16le" | "wav" => AudioCodec::Pcm,
            "copy" => AudioCodec::Copy,
            "none" | "disabled" => AudioCodec::Disabled,
            _ => AudioCodec::Named(s.trim().to_string()),
        };
        Ok(codec)
    }
}

/// Video rate control: constant quality factor or target bitrate in kbps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoQuality {
    Crf(u8),
    Bitrate(u32),
}

impl FromStr for VideoQuality {
    type Err = OptionParseError;

    /// Accepts `crf:23`, `23` (quality factor) or `2500k` (bitrate)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        let err = || OptionParseError::InvalidQuality(s.to_string());

        if let Some(kbps) = value.strip_suffix('k') {
            return kbps.parse().map(VideoQuality::Bitrate).map_err(|_| err());
        }
        let crf = value.strip_prefix("crf:").unwrap_or(&value);
        crf.parse().map(VideoQuality::Crf).map_err(|_| err())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = OptionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        let labelled = match value.as_str() {
            "1080p" => Some((1920, 1080)),
            "720p" => Some((1280, 720)),
            "480p" => Some((854, 480)),
            "360p" => Some((640, 360)),
            _ => None,
        };
        if let Some((width, height)) = labelled {
            return Ok(Resolution::new(width, height));
        }

        let err = || OptionParseError::InvalidResolution(s.to_string());
        let (w, h) = value
            .split_once('x')
            .or_else(|| value.split_once(':'))
            .ok_or_else(err)?;
        let width = w.trim().parse().map_err(|_| err())?;
        let height = h.trim().parse().map_err(|_| err())?;
        Ok(Resolution::new(width, height))
    }
}

/// A position in the input timeline, millisecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeOffset(u64);

impl TimeOffset {
    pub const ZERO: TimeOffset = TimeOffset(0);

    pub fn from_millis(millis: u64) -> Self {
        TimeOffset(millis)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_finite() && secs > 0.0 {
            TimeOffset((secs * 1000.0).round() as u64)
        } else {
            TimeOffset::ZERO
        }
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

impl fmt::Display for TimeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_secs = self.0 / 1000;
        write!(
            f,
            "{:02}:{:02}:{:02}.{:03}",
            total_secs / 3600,
            (total_secs / 60) % 60,
            total_secs % 60,
            self.0 % 1000
        )
    }
}

impl FromStr for TimeOffset {
    type Err = OptionParseError;

    /// Accepts plain seconds (`90`, `1.5`) or `[HH:]MM:SS[.fff]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || OptionParseError::InvalidTime(s.to_string());
        let value = s.trim();
        if value.is_empty() {
            return Err(err());
        }

        let parts: Vec<&str> = value.split(':').collect();
        if parts.len() > 3 {
            return Err(err());
        }

        let (whole, fraction) = parts[parts.len() - 1]
            .split_once('.')
            .unwrap_or((parts[parts.len() - 1], ""));
        let secs: u64 = whole.parse().map_err(|_| err())?;
        if parts.len() > 1 && secs >= 60 {
            return Err(err());
        }
        if !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(err());
        }
        // Only millisecond precision is kept
        let millis = format!("{:0<3}", &fraction[..fraction.len().min(3)])
            .parse::<u64>()
            .map_err(|_| err())?;

        let mut total_secs = secs;
        let mut scale: u64 = 60;
        for part in parts[..parts.len() - 1].iter().rev() {
            let unit: u64 = part.parse().map_err(|_| err())?;
            if scale == 60 && parts.len() == 3 && unit >= 60 {
                return Err(err());
            }
            total_secs = unit
                .checked_mul(scale)
                .and_then(|secs| secs.checked_add(total_secs))
                .ok_or_else(err)?;
            scale *= 60;
        }

        total_secs
            .checked_mul(1000)
            .and_then(|ms| ms.checked_add(millis))
            .map(TimeOffset)
            .ok_or_else(err)
    }
}

/// One entry of the filter chain: a filter name plus its parameters in declared order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDescriptor {
    pub name: String,
    #[serde(default)]
    pub params: Vec<(String, String)>,
}

impl FilterDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

impl FromStr for FilterDescriptor {
    type Err = OptionParseError;

    /// Shell-style form: `drawtext text='Hello: world' fontsize=24`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || OptionParseError::InvalidFilter(s.to_string());
        let tokens = shlex::split(s).ok_or_else(err)?;
        let (name, params) = tokens.split_first().ok_or_else(err)?;

        let mut filter = FilterDescriptor::new(name.clone());
        for token in params {
            let (key, value) = token.split_once('=').ok_or_else(err)?;
            filter = filter.param(key, value);
        }
        Ok(filter)
    }
}

/// How several inputs are joined into one output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Decode every input and join them with the concat filter
    #[default]
    Reencode,
    /// Join packets with the concat demuxer; inputs must share codecs and parameters
    StreamCopy,
}

/// Everything the user chose for one transcode job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeOptions {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub container: Option<Container>,
    pub video_codec: Option<VideoCodec>,
    pub audio_codec: Option<AudioCodec>,
    pub video_quality: Option<VideoQuality>,
    /// kbps
    pub audio_bitrate: Option<u32>,
    pub encoder_preset: Option<String>,
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<f64>,
    pub trim_start: Option<TimeOffset>,
    pub trim_end: Option<TimeOffset>,
    pub filters: Vec<FilterDescriptor>,
    pub overwrite: bool,
    pub faststart: bool,
    pub strip_metadata: bool,
    /// Free-form arguments, split with shell rules
    pub extra_args: String,
    pub merge_mode: MergeMode,
}

impl TranscodeOptions {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            inputs: vec![input.into()],
            output: output.into(),
            ..Default::default()
        }
    }

    /// Several inputs concatenated into one output
    pub fn merge(inputs: Vec<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            inputs,
            output: output.into(),
            ..Default::default()
        }
    }

    /// Several inputs joined without re-encoding (concat demuxer)
    pub fn stream_copy_merge(inputs: Vec<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            merge_mode: MergeMode::StreamCopy,
            ..Self::merge(inputs, output)
        }
    }

    /// Drop the video stream and encode audio for the given audio format.
    /// Lossless formats get no bitrate.
    pub fn audio_extract(
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        format: Container,
    ) -> Self {
        let audio_codec = match format {
            Container::Mp3 => AudioCodec::Mp3,
            Container::Wav => AudioCodec::Pcm,
            Container::Flac => AudioCodec::Flac,
            Container::Ogg => AudioCodec::Vorbis,
            _ => AudioCodec::Aac,
        };
        let audio_bitrate = if audio_codec.is_lossless() {
            None
        } else {
            Some(192)
        };

        Self {
            container: Some(format),
            video_codec: Some(VideoCodec::Disabled),
            audio_bitrate,
            audio_codec: Some(audio_codec),
            ..Self::new(input, output)
        }
    }

    /// Container that will actually be written: explicit choice, else the output extension
    pub fn effective_container(&self) -> Option<Container> {
        self.container.or_else(|| {
            self.output
                .extension()
                .and_then(|e| e.to_str())
                .and_then(Container::from_extension)
        })
    }

    fn video_disabled(&self) -> bool {
        matches!(self.video_codec, Some(VideoCodec::Disabled))
    }

    fn audio_disabled(&self) -> bool {
        matches!(self.audio_codec, Some(AudioCodec::Disabled))
    }

    /// Set video attributes, named the way violations name them
    fn video_attributes(&self) -> Vec<&'static str> {
        let mut attrs = Vec::new();
        if !self.filters.is_empty() {
            attrs.push("filters");
        }
        if self.resolution.is_some() {
            attrs.push("a resolution");
        }
        if self.frame_rate.is_some() {
            attrs.push("a frame rate");
        }
        if self.video_quality.is_some() {
            attrs.push("a video quality");
        }
        if self.encoder_preset.is_some() {
            attrs.push("an encoder preset");
        }
        attrs
    }

    /// Settings a packet-level join cannot honour
    fn stream_copy_conflicts(&self) -> Vec<&'static str> {
        let mut conflicts = self.video_attributes();
        if self.trim_start.is_some() || self.trim_end.is_some() {
            conflicts.push("a trim window");
        }
        if !matches!(
            self.video_codec,
            None | Some(VideoCodec::Copy) | Some(VideoCodec::Disabled)
        ) {
            conflicts.push("a video encoder");
        }
        if !matches!(
            self.audio_codec,
            None | Some(AudioCodec::Copy) | Some(AudioCodec::Disabled)
        ) {
            conflicts.push("an audio encoder");
        }
        if self.audio_bitrate.is_some() {
            conflicts.push("an audio bitrate");
        }
        conflicts
    }

    /// Check every constraint, returning all violations found (empty when valid)
    pub fn validate(&self) -> Vec<Violation> {
        let mut violations = Vec::new();

        if self.inputs.is_empty() {
            violations.push(Violation::NoInputs);
        }
        let output = normalize_lexically(&self.output);
        if self
            .inputs
            .iter()
            .any(|input| normalize_lexically(input) == output)
        {
            violations.push(Violation::OutputIsInput(self.output.clone()));
        }

        if let Some(end) = self.trim_end {
            let start = self.trim_start.unwrap_or(TimeOffset::ZERO);
            if end <= start {
                violations.push(Violation::TrimEndNotAfterStart { start, end });
            }
        }

        for filter in &self.filters {
            if !is_valid_name(&filter.name) {
                violations.push(Violation::InvalidName {
                    what: "filter name",
                    name: filter.name.clone(),
                });
            }
            for (key, _) in &filter.params {
                if !is_valid_name(key) {
                    violations.push(Violation::InvalidName {
                        what: "filter parameter",
                        name: key.clone(),
                    });
                }
            }
        }

        let reencode_merge = self.inputs.len() > 1 && self.merge_mode == MergeMode::Reencode;
        if self.merge_mode == MergeMode::StreamCopy {
            violations.extend(
                self.stream_copy_conflicts()
                    .into_iter()
                    .map(Violation::StreamCopyMergeWith),
            );
        }

        match &self.video_codec {
            Some(VideoCodec::Copy) => {
                violations.extend(self.video_attributes().into_iter().map(Violation::VideoCopyWith));
                if reencode_merge {
                    violations.push(Violation::VideoCopyWith("multiple inputs"));
                }
            }
            Some(VideoCodec::Disabled) => {
                violations.extend(
                    self.video_attributes()
                        .into_iter()
                        .map(Violation::VideoDisabledWith),
                );
            }
            Some(VideoCodec::Named(name)) if !is_valid_name(name) => {
                violations.push(Violation::InvalidName {
                    what: "video encoder",
                    name: name.clone(),
                });
            }
            _ => {}
        }

        match &self.audio_codec {
            Some(AudioCodec::Copy) => {
                if self.audio_bitrate.is_some() {
                    violations.push(Violation::AudioCopyWith("an audio bitrate"));
                }
                if reencode_merge {
                    violations.push(Violation::AudioCopyWith("multiple inputs"));
                }
            }
            Some(AudioCodec::Disabled) if self.audio_bitrate.is_some() => {
                violations.push(Violation::AudioDisabledWithBitrate);
            }
            Some(AudioCodec::Named(name)) if !is_valid_name(name) => {
                violations.push(Violation::InvalidName {
                    what: "audio encoder",
                    name: name.clone(),
                });
            }
            _ => {}
        }

        if self.video_disabled() && self.audio_disabled() {
            violations.push(Violation::NoStreams);
        }

        if let Some(res) = self.resolution {
            if res.width == 0 || res.height == 0 {
                violations.push(Violation::InvalidResolution {
                    width: res.width,
                    height: res.height,
                });
            }
        }
        if let Some(fps) = self.frame_rate {
            if !fps.is_finite() || fps <= 0.0 {
                violations.push(Violation::InvalidFrameRate(fps));
            }
        }
        match self.video_quality {
            Some(VideoQuality::Crf(crf)) if crf > MAX_CRF => {
                violations.push(Violation::CrfOutOfRange(crf));
            }
            Some(VideoQuality::Bitrate(0)) => violations.push(Violation::ZeroBitrate("video")),
            _ => {}
        }
        if self.audio_bitrate == Some(0) {
            violations.push(Violation::ZeroBitrate("audio"));
        }

        if let Some(preset) = &self.encoder_preset {
            if !is_valid_name(preset) {
                violations.push(Violation::InvalidName {
                    what: "encoder preset",
                    name: preset.clone(),
                });
            }
        }

        if self.faststart {
            let container = self.effective_container();
            if !container.is_some_and(Container::supports_faststart) {
                let extension = self.output.extension().and_then(|e| e.to_str());
                violations.push(Violation::faststart(container, extension));
            }
        }

        if !self.extra_args.trim().is_empty() && shlex::split(&self.extra_args).is_none() {
            violations.push(Violation::UnparsableExtraArgs(self.extra_args.clone()));
        }

        violations
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}

/// Highest quality factor any supported encoder accepts (libsvtav1/libvpx go to 63)
pub const MAX_CRF: u8 = 63;

/// Filter names, parameter keys, encoder and preset names: `[A-Za-z0-9_-]+`
pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Resolve `.` and `..` without touching the filesystem
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(
                    normalized.components().next_back(),
                    Some(Component::Normal(_))
                ) && normalized.pop();
                if !popped {
                    normalized.push("..");
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}
