use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use ffqueue::engine::{
    AudioCodec, Container, FilterDescriptor, Preset, Resolution, TimeOffset, TranscodeOptions,
    VideoCodec, VideoQuality,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ffqueue")]
#[command(about = "Queue, run and supervise ffmpeg transcode jobs", long_about = None)]
pub struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print events as JSON lines instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check if ffmpeg and ffprobe are installed
    CheckFfmpeg,

    /// Show format, duration and streams of a media file
    Probe {
        /// Path to the media file
        file: PathBuf,
    },

    /// List the built-in presets
    Presets,

    /// Show the ffmpeg command for a job without executing it
    DryRun {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Run one job and follow its progress
    Run {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Transcode every video file under a directory
    Batch {
        /// Directory to scan
        directory: PathBuf,

        /// Where outputs go (defaults to next to each input)
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Output filename pattern: {basename}, {filename}, {ext}
        #[arg(long)]
        pattern: Option<String>,

        /// Jobs to run at once (overrides config)
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Print the commands instead of running them
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        encode: EncodeArgs,
    },

    /// Show config status and location, or create default config if missing
    InitConfig,
}

#[derive(Args)]
pub struct JobArgs {
    /// Input file; repeat to concatenate several inputs
    #[arg(short = 'i', long = "input", required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output file
    #[arg(short = 'o', long)]
    pub output: PathBuf,

    /// Drop video and write audio only, in the output's format
    #[arg(long)]
    pub extract_audio: bool,

    /// Join several inputs without re-encoding (inputs must share codecs)
    #[arg(long, conflicts_with = "extract_audio")]
    pub stream_copy: bool,

    #[command(flatten)]
    pub encode: EncodeArgs,
}

#[derive(Args, Default)]
pub struct EncodeArgs {
    /// Start from a named preset (see `ffqueue presets`)
    #[arg(long)]
    pub preset: Option<String>,

    /// Output container (defaults to the output extension)
    #[arg(long)]
    pub container: Option<Container>,

    /// Video codec: h264, hevc, vp9, av1, mpeg4, prores, copy, none or an encoder name
    #[arg(long = "vcodec")]
    pub video_codec: Option<VideoCodec>,

    /// Audio codec: aac, mp3, opus, vorbis, flac, ac3, pcm, copy, none or an encoder name
    #[arg(long = "acodec")]
    pub audio_codec: Option<AudioCodec>,

    /// Video quality: crf value (`23`, `crf:23`) or bitrate (`2500k`)
    #[arg(long)]
    pub quality: Option<VideoQuality>,

    /// Audio bitrate in kbps
    #[arg(long = "abitrate")]
    pub audio_bitrate: Option<u32>,

    /// Encoder speed preset (e.g. medium, fast)
    #[arg(long = "speed")]
    pub encoder_preset: Option<String>,

    /// WxH or a label such as 720p
    #[arg(long)]
    pub resolution: Option<Resolution>,

    /// Output frame rate
    #[arg(long)]
    pub fps: Option<f64>,

    /// Trim start (seconds or [HH:]MM:SS[.fff])
    #[arg(long)]
    pub start: Option<TimeOffset>,

    /// Trim end (seconds or [HH:]MM:SS[.fff])
    #[arg(long)]
    pub end: Option<TimeOffset>,

    /// Video filter, e.g. "scale w=1280 h=-2"; repeat to chain
    #[arg(long = "filter")]
    pub filters: Vec<FilterDescriptor>,

    /// Overwrite existing output files
    #[arg(short = 'y', long)]
    pub overwrite: bool,

    /// Move the index to the front of MP4/MOV outputs
    #[arg(long)]
    pub faststart: bool,

    /// Drop global metadata from the output
    #[arg(long)]
    pub strip_metadata: bool,

    /// Extra ffmpeg arguments, split with shell rules
    #[arg(long, allow_hyphen_values = true)]
    pub extra_args: Option<String>,
}

impl EncodeArgs {
    /// Apply the preset first, then every explicitly given flag on top of it
    pub fn apply(self, opts: &mut TranscodeOptions) -> Result<()> {
        if let Some(name) = &self.preset {
            let Some(preset) = Preset::get(name) else {
                bail!(
                    "Unknown preset '{}' (available: {})",
                    name,
                    Preset::names().join(", ")
                );
            };
            preset.apply(opts);
        }

        if self.container.is_some() {
            opts.container = self.container;
        }
        if self.video_codec.is_some() {
            opts.video_codec = self.video_codec;
        }
        if self.audio_codec.is_some() {
            opts.audio_codec = self.audio_codec;
        }
        if self.quality.is_some() {
            opts.video_quality = self.quality;
        }
        if self.audio_bitrate.is_some() {
            opts.audio_bitrate = self.audio_bitrate;
        }
        if self.encoder_preset.is_some() {
            opts.encoder_preset = self.encoder_preset;
        }
        if self.resolution.is_some() {
            opts.resolution = self.resolution;
        }
        if self.fps.is_some() {
            opts.frame_rate = self.fps;
        }
        if self.start.is_some() {
            opts.trim_start = self.start;
        }
        if self.end.is_some() {
            opts.trim_end = self.end;
        }
        opts.filters.extend(self.filters);
        opts.overwrite |= self.overwrite;
        opts.faststart |= self.faststart;
        opts.strip_metadata |= self.strip_metadata;
        if let Some(extra) = self.extra_args {
            opts.extra_args = extra;
        }

        Ok(())
    }
}

impl JobArgs {
    pub fn into_options(self, default_overwrite: bool) -> Result<TranscodeOptions> {
        let mut opts = if self.extract_audio {
            let Some(format) = self
                .output
                .extension()
                .and_then(|e| e.to_str())
                .and_then(Container::from_extension)
                .filter(|c| c.is_audio_only())
            else {
                bail!(
                    "--extract-audio needs an audio output (.mp3, .m4a, .wav, .flac or .ogg), got {}",
                    self.output.display()
                );
            };
            let Some(first) = self.inputs.first().cloned() else {
                bail!("at least one input is required");
            };
            // Several inputs are joined into one audio track
            TranscodeOptions {
                inputs: self.inputs,
                ..TranscodeOptions::audio_extract(first, self.output, format)
            }
        } else if self.stream_copy {
            TranscodeOptions::stream_copy_merge(self.inputs, self.output)
        } else {
            TranscodeOptions::merge(self.inputs, self.output)
        };

        opts.overwrite = default_overwrite;
        self.encode.apply(&mut opts)?;
        Ok(opts)
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
