// End-to-end checks of option models through the command builder

use ffqueue::engine::{
    AudioCodec, Container, FilterDescriptor, Preset, TimeOffset, TranscodeOptions, VideoCodec,
    Violation, build_ffmpeg_args, format_ffmpeg_cmd,
};
use std::path::{Path, PathBuf};

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[test]
fn test_simple_transcode() {
    let mut opts = TranscodeOptions::new("a.mp4", "b.mkv");
    opts.video_codec = Some(VideoCodec::H264);

    let args = build_ffmpeg_args(&opts).unwrap();
    let i = args.iter().position(|a| a == "-i").unwrap();
    let cv = args.iter().position(|a| a == "-c:v").unwrap();
    assert!(i < cv, "input must precede codec flags");
    assert_eq!(args[i + 1], "a.mp4");
    assert_eq!(args[cv + 1], "libx264");
    assert_eq!(args.last().unwrap(), "b.mkv");
}

#[test]
fn test_builder_is_deterministic() {
    let mut opts = TranscodeOptions::new("clip.mov", "clip.webm");
    opts.video_codec = Some(VideoCodec::Vp9);
    opts.audio_codec = Some(AudioCodec::Opus);
    opts.filters = vec![FilterDescriptor::new("scale").param("w", "640").param("h", "-2")];

    assert_eq!(build_ffmpeg_args(&opts), build_ffmpeg_args(&opts));
}

#[test]
fn test_all_violations_reported_together() {
    let mut opts = TranscodeOptions::new("x.mp4", "x.mp4");
    opts.video_codec = Some(VideoCodec::Copy);
    opts.filters = vec![FilterDescriptor::new("hflip")];
    opts.trim_start = Some(TimeOffset::from_millis(10_000));
    opts.trim_end = Some(TimeOffset::from_millis(2_000));

    let err = build_ffmpeg_args(&opts).unwrap_err();
    let violations = err.violations();
    assert!(violations.contains(&Violation::OutputIsInput(PathBuf::from("x.mp4"))));
    assert!(violations.contains(&Violation::TrimEndNotAfterStart {
        start: TimeOffset::from_millis(10_000),
        end: TimeOffset::from_millis(2_000),
    }));
    assert!(
        violations
            .iter()
            .any(|v| matches!(v, Violation::VideoCopyWith(_)))
    );
}

#[test]
fn test_audio_extraction() {
    let opts = TranscodeOptions::audio_extract("talk.mp4", "talk.mp3", Container::Mp3);
    let args = build_ffmpeg_args(&opts).unwrap();

    assert!(args.contains(&"-vn".to_string()));
    assert_eq!(flag_value(&args, "-c:a"), Some("libmp3lame"));
    assert_eq!(flag_value(&args, "-b:a"), Some("192k"));
    assert_eq!(flag_value(&args, "-f"), Some("mp3"));
}

#[test]
fn test_lossless_extraction_has_no_bitrate() {
    let opts = TranscodeOptions::audio_extract("talk.mp4", "talk.flac", Container::Flac);
    let args = build_ffmpeg_args(&opts).unwrap();
    assert_eq!(flag_value(&args, "-c:a"), Some("flac"));
    assert_eq!(flag_value(&args, "-b:a"), None);
}

#[test]
fn test_every_preset_builds() {
    for preset in Preset::all() {
        let output = format!("out.{}", preset.container.extension());
        let mut opts = TranscodeOptions::new("in.mov", output);
        preset.apply(&mut opts);

        let args = build_ffmpeg_args(&opts)
            .unwrap_or_else(|e| panic!("preset {} does not build: {}", preset.name, e));
        assert!(args.contains(&"-crf".to_string()), "{}", preset.name);
        assert_eq!(
            args.contains(&"-movflags".to_string()),
            preset.faststart,
            "{}",
            preset.name
        );
    }
}

#[test]
fn test_faststart_rejected_for_webm() {
    let mut opts = TranscodeOptions::new("a.mp4", "a.webm");
    opts.faststart = true;
    let err = build_ffmpeg_args(&opts).unwrap_err();
    assert!(matches!(
        err.violations(),
        [Violation::FaststartUnsupported(_)]
    ));
}

#[test]
fn test_awkward_paths_survive_display_round_trip() {
    let opts = TranscodeOptions::new("my clip's take.mp4", "-out: final.mkv");
    let args = build_ffmpeg_args(&opts).unwrap();
    assert_eq!(args.last().unwrap(), "file:-out: final.mkv");

    let shown = format_ffmpeg_cmd(Path::new("/usr/bin/ffmpeg"), &args);
    let mut words = shlex::split(&shown).unwrap();
    assert_eq!(words.remove(0), "/usr/bin/ffmpeg");
    assert_eq!(words, args);
}
