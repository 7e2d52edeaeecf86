use super::options::{
    AudioCodec, FilterDescriptor, MergeMode, TranscodeOptions, VideoCodec, VideoQuality,
};
use crate::engine::error::BuildError;
use std::path::{Path, PathBuf};

/// Ordered ffmpeg arguments, program name excluded
pub type ArgumentVector = Vec<String>;

/// Build the ffmpeg argument vector for a job.
///
/// Pure and deterministic: the options are validated first and nothing is produced when any
/// constraint is violated. Layout is global flags, then per-input trim + `-i`, then the filter
/// graph, then codec/quality/output flags for the attributes that are set, then the output path.
pub fn build_ffmpeg_args(opts: &TranscodeOptions) -> Result<ArgumentVector, BuildError> {
    let violations = opts.validate();
    if !violations.is_empty() {
        return Err(BuildError::InvalidOptions(violations));
    }

    let mut args = ArgumentVector::new();

    push_args(&mut args, &["-hide_banner", "-nostdin"]);
    push_args(&mut args, &[if opts.overwrite { "-y" } else { "-n" }]);
    // Machine-readable progress goes to stderr alongside diagnostics
    push_args(&mut args, &["-progress", "pipe:2", "-nostats"]);

    match opts.merge_mode {
        MergeMode::Reencode => {
            apply_inputs(&mut args, opts);
            apply_filter_graph(&mut args, opts);
        }
        MergeMode::StreamCopy => apply_concat_demuxer(&mut args, opts),
    }
    apply_video_settings(&mut args, opts);
    apply_audio_settings(&mut args, opts);
    apply_output_flags(&mut args, opts);
    apply_additional_args(&mut args, &opts.extra_args);

    if let Some(container) = opts.container {
        push_args(&mut args, &["-f", container.muxer()]);
    }

    args.push(escape_path(&opts.output));
    Ok(args)
}

fn push_args(args: &mut ArgumentVector, values: &[&str]) {
    args.extend(values.iter().map(|v| v.to_string()));
}

/// Seek flags must precede each `-i` so ffmpeg seeks the input instead of decoding up to it
fn apply_inputs(args: &mut ArgumentVector, opts: &TranscodeOptions) {
    for input in &opts.inputs {
        if let Some(start) = opts.trim_start {
            args.push("-ss".to_string());
            args.push(start.to_string());
        }
        if let Some(end) = opts.trim_end {
            args.push("-to".to_string());
            args.push(end.to_string());
        }
        args.push("-i".to_string());
        args.push(escape_path(input));
    }
}

/// The inputs are read from a list file, which has to exist before ffmpeg starts
fn apply_concat_demuxer(args: &mut ArgumentVector, opts: &TranscodeOptions) {
    push_args(args, &["-f", "concat", "-safe", "0", "-i"]);
    args.push(escape_path(&concat_list_path(&opts.output)));
    push_args(args, &["-c", "copy"]);
}

/// Where the concat list for `output` is written: a hidden file beside it
pub fn concat_list_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!(".{}.concat.txt", name))
}

/// Concat demuxer script naming each input in order.
/// Inside single quotes only `'` is special; it is closed, escaped and reopened.
pub fn concat_list(inputs: &[PathBuf]) -> String {
    inputs
        .iter()
        .map(|input| format!("file '{}'\n", escape_path(input).replace('\'', "'\\''")))
        .collect()
}

fn apply_filter_graph(args: &mut ArgumentVector, opts: &TranscodeOptions) {
    let chain = filter_chain(&opts.filters);

    if opts.inputs.len() <= 1 {
        if !chain.is_empty() {
            args.push("-vf".to_string());
            args.push(chain);
        }
        return;
    }

    let has_video = !matches!(opts.video_codec, Some(VideoCodec::Disabled));
    let has_audio = !matches!(opts.audio_codec, Some(AudioCodec::Disabled));

    let mut graph = String::new();
    for index in 0..opts.inputs.len() {
        if has_video {
            graph.push_str(&format!("[{}:v]", index));
        }
        if has_audio {
            graph.push_str(&format!("[{}:a]", index));
        }
    }
    graph.push_str(&format!(
        "concat=n={}:v={}:a={}",
        opts.inputs.len(),
        u8::from(has_video),
        u8::from(has_audio)
    ));

    let mut maps = Vec::new();
    if has_video {
        graph.push_str("[cv]");
    }
    if has_audio {
        graph.push_str("[ca]");
    }
    // The user chain runs on the concatenated video as a second graph segment
    if has_video {
        if chain.is_empty() {
            maps.push("[cv]");
        } else {
            graph.push_str(&format!(";[cv]{}[vout]", chain));
            maps.push("[vout]");
        }
    }
    if has_audio {
        maps.push("[ca]");
    }

    args.push("-filter_complex".to_string());
    args.push(graph);
    for label in maps {
        push_args(args, &["-map", label]);
    }
}

/// Filters joined with `,` in declared order, parameters as `key=value` joined with `:`
fn filter_chain(filters: &[FilterDescriptor]) -> String {
    filters
        .iter()
        .map(|filter| {
            if filter.params.is_empty() {
                return filter.name.clone();
            }
            let params = filter
                .params
                .iter()
                .map(|(key, value)| format!("{}={}", key, escape_filter_value(value)))
                .collect::<Vec<_>>()
                .join(":");
            format!("{}={}", filter.name, params)
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn apply_video_settings(args: &mut ArgumentVector, opts: &TranscodeOptions) {
    match opts.video_codec.as_ref().map(|c| c.encoder()) {
        Some(Some(encoder)) => push_args(args, &["-c:v", encoder]),
        Some(None) => push_args(args, &["-vn"]),
        None => {}
    }

    if let Some(preset) = &opts.encoder_preset {
        push_args(args, &["-preset", preset.as_str()]);
    }

    match opts.video_quality {
        Some(VideoQuality::Crf(crf)) => {
            args.push("-crf".to_string());
            args.push(crf.to_string());
        }
        Some(VideoQuality::Bitrate(kbps)) => {
            args.push("-b:v".to_string());
            args.push(format!("{}k", kbps));
        }
        None => {}
    }

    if let Some(resolution) = opts.resolution {
        args.push("-s".to_string());
        args.push(resolution.to_string());
    }

    if let Some(fps) = opts.frame_rate {
        args.push("-r".to_string());
        args.push(fps.to_string());
    }
}

fn apply_audio_settings(args: &mut ArgumentVector, opts: &TranscodeOptions) {
    match opts.audio_codec.as_ref().map(|c| c.encoder()) {
        Some(Some(encoder)) => push_args(args, &["-c:a", encoder]),
        Some(None) => push_args(args, &["-an"]),
        None => {}
    }

    if let Some(kbps) = opts.audio_bitrate {
        args.push("-b:a".to_string());
        args.push(format!("{}k", kbps));
    }
}

fn apply_output_flags(args: &mut ArgumentVector, opts: &TranscodeOptions) {
    if opts.faststart {
        push_args(args, &["-movflags", "+faststart"]);
    }
    if opts.strip_metadata {
        push_args(args, &["-map_metadata", "-1"]);
    }
}

/// Apply additional user-provided FFmpeg arguments.
/// Uses shell-style parsing so quoted strings with spaces are preserved.
fn apply_additional_args(args: &mut ArgumentVector, additional_args: &str) {
    if additional_args.trim().is_empty() {
        return;
    }

    // Unbalanced quotes were already rejected by validation
    if let Some(extra) = shlex::split(additional_args) {
        args.extend(extra);
    }
}

/// Escape a filter option value for use inside a filter graph.
///
/// ffmpeg unescapes twice: once when splitting the graph (`\ ' [ ] , ;`) and once when
/// splitting a filter's options (`\ ' :`), so the option level is applied first.
pub fn escape_filter_value(value: &str) -> String {
    let option_level = escape_chars(value, &['\\', '\'', ':']);
    escape_chars(&option_level, &['\\', '\'', '[', ']', ',', ';'])
}

fn escape_chars(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Render a path so ffmpeg reads it as a plain file.
///
/// A `:` would otherwise be taken as a protocol separator and a leading `-` as an option,
/// so such paths get the `file:` protocol prefix.
pub fn escape_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let needs_protocol = raw.starts_with('-') || (raw.contains(':') && !is_drive_path(&raw));
    if needs_protocol {
        format!("file:{}", raw)
    } else {
        raw.into_owned()
    }
}

/// `C:\...` style paths, which ffmpeg already treats as files
fn is_drive_path(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    cfg!(windows)
        && bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && !raw[2..].contains(':')
}

/// Format an ffmpeg invocation as a shell-safe string for display and logs
pub fn format_ffmpeg_cmd(program: &Path, args: &[String]) -> String {
    let program = program.to_string_lossy();
    let words: Vec<&str> = std::iter::once(program.as_ref())
        .chain(args.iter().map(String::as_str))
        .collect();

    // try_join only fails on interior NUL bytes, which no real argument carries
    shlex::try_join(words.iter().copied()).unwrap_or_else(|_| words.join(" "))
}
