// Directory scan through batch planning

use ffqueue::config::Config;
use ffqueue::engine::{Container, TranscodeOptions, VideoCodec, build_batch, build_ffmpeg_args, scan};
use std::fs;
use std::path::PathBuf;

fn media_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("nested")).unwrap();
    fs::write(dir.path().join("b.mov"), b"").unwrap();
    fs::write(dir.path().join("a.mp4"), b"").unwrap();
    fs::write(dir.path().join("nested/c.MKV"), b"").unwrap();
    fs::write(dir.path().join("notes.txt"), b"").unwrap();
    dir
}

#[test]
fn test_scan_finds_videos_recursively_in_order() {
    let dir = media_tree();
    let files = scan(dir.path()).unwrap();
    let names: Vec<PathBuf> = files
        .iter()
        .map(|f| f.strip_prefix(dir.path()).unwrap().to_path_buf())
        .collect();
    assert_eq!(
        names,
        vec![
            PathBuf::from("a.mp4"),
            PathBuf::from("b.mov"),
            PathBuf::from("nested").join("c.MKV"),
        ]
    );
}

#[test]
fn test_scan_rejects_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    assert!(scan(&dir.path().join("missing")).is_err());
}

#[test]
fn test_batch_with_output_dir_and_pattern() {
    let dir = media_tree();
    let out_root = tempfile::tempdir().unwrap();
    let out = out_root.path().to_path_buf();
    // Already converted, so it is skipped
    fs::write(out.join("b_small.mp4"), b"").unwrap();

    let mut template = TranscodeOptions {
        container: Some(Container::Mp4),
        video_codec: Some(VideoCodec::H264),
        ..Default::default()
    };
    let files = scan(dir.path()).unwrap();
    let plan = build_batch(files.clone(), &template, Some(&out), Some("{basename}_small"));

    let outputs: Vec<PathBuf> = plan.jobs.iter().map(|j| j.output.clone()).collect();
    assert_eq!(outputs, vec![out.join("a_small.mp4"), out.join("c_small.mp4")]);
    assert_eq!(plan.skipped, vec![dir.path().join("b.mov")]);
    for job in &plan.jobs {
        assert_eq!(job.inputs.len(), 1);
        assert!(build_ffmpeg_args(job).is_ok());
    }

    template.overwrite = true;
    let plan = build_batch(files, &template, Some(&out), Some("{basename}_small"));
    assert_eq!(plan.jobs.len(), 3);
    assert!(plan.skipped.is_empty());
}

#[test]
fn test_batch_next_to_inputs_keeps_extension() {
    let dir = media_tree();
    let files = scan(dir.path()).unwrap();
    let template = TranscodeOptions::default();

    let plan = build_batch(files, &template, None, Some("{basename}_copy"));
    let outputs: Vec<PathBuf> = plan.jobs.iter().map(|j| j.output.clone()).collect();
    assert_eq!(
        outputs,
        vec![
            dir.path().join("a_copy.mp4"),
            dir.path().join("b_copy.mov"),
            dir.path().join("nested/c_copy.mkv"),
        ]
    );
}

#[test]
fn test_config_defaults_feed_a_batch() {
    let dir = media_tree();
    let config_path = dir.path().join("config.toml");
    fs::write(
        &config_path,
        r#"
            [defaults]
            container = "mkv"
            filename_pattern = "{basename}-archive"
        "#,
    )
    .unwrap();
    let config = Config::load_from(&config_path).unwrap();

    let template = TranscodeOptions {
        container: config.defaults.container,
        overwrite: config.defaults.overwrite,
        ..Default::default()
    };
    let files = scan(dir.path()).unwrap();
    let plan = build_batch(
        files,
        &template,
        None,
        Some(config.defaults.filename_pattern.as_str()),
    );
    assert_eq!(plan.jobs[0].output, dir.path().join("a-archive.mkv"));
    assert_eq!(plan.jobs[0].container, Some(Container::Mkv));
}
