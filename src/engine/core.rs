mod ffmpeg_cmd;
mod ffmpeg_info;
mod log;
mod options;
mod presets;
mod scan;
mod types;

pub use ffmpeg_cmd::{
    ArgumentVector, build_ffmpeg_args, concat_list, concat_list_path, escape_filter_value,
    escape_path, format_ffmpeg_cmd,
};
pub use ffmpeg_info::{
    AudioStreamInfo, DurationProbe, FfprobeDuration, MediaSummary, NoProbe, PROBE_TIMEOUT,
    VideoStreamInfo, ffmpeg_version, ffprobe_version, parse_ffprobe_duration, parse_ffprobe_media,
    probe_duration, probe_duration_within, probe_media,
};
pub use log::write_debug_log;
pub use options::{
    AudioCodec, Container, FilterDescriptor, MAX_CRF, MergeMode, Resolution, TimeOffset,
    TranscodeOptions, VideoCodec, VideoQuality,
};
pub use presets::Preset;
pub use scan::{BatchPlan, build_batch, derive_output_path, is_video_file, scan, scan_streaming};
pub use types::{
    JobId, JobStatus, JobSummary, LineKind, Outcome, ProgressParser, ProgressSnapshot,
};
