use super::options::TranscodeOptions;
use anyhow::Result;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Default video file extensions to scan for
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "mov", "avi", "flv", "m4v", "wmv"];

/// Check if a path has a video file extension
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Scan a directory recursively for video files and invoke a callback for each file found
pub fn scan_streaming<F>(root: &Path, mut on_file: F) -> Result<()>
where
    F: FnMut(PathBuf),
{
    if !root.is_dir() {
        anyhow::bail!("{} is not a directory", root.display());
    }

    // Symlinks are not followed so loops and mounted trees can't blow up a scan
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if entry.file_type().is_file() && is_video_file(path) {
            on_file(path.to_path_buf());
        }
    }

    Ok(())
}

/// Scan a directory recursively for video files, in file name order
pub fn scan(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    scan_streaming(root, |path| files.push(path))?;
    Ok(files)
}

/// Output path for a batch input.
///
/// `pattern` may use `{basename}` (stem), `{filename}` (full name) and `{ext}` (the output
/// extension); the extension is appended afterwards. Without a pattern the output is
/// `<basename>.<extension>`. Without an output directory it lands next to the input.
pub fn derive_output_path(
    input_path: &Path,
    output_dir: Option<&Path>,
    pattern: Option<&str>,
    extension: &str,
) -> PathBuf {
    let output_dir = output_dir.unwrap_or_else(|| input_path.parent().unwrap_or(Path::new(".")));

    let stem = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let original_filename = input_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("output");

    let base = match pattern {
        Some(pat) if !pat.trim().is_empty() => pat
            .replace("{basename}", stem)
            .replace("{filename}", original_filename)
            .replace("{ext}", extension),
        _ => stem.to_string(),
    };

    output_dir.join(format!("{}.{}", base, extension))
}

/// Jobs for a batch, plus inputs left out because their output already exists
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    pub jobs: Vec<TranscodeOptions>,
    pub skipped: Vec<PathBuf>,
}

/// Build one option set per file from a template.
/// Files whose output already exists are skipped unless the template overwrites.
pub fn build_batch(
    files: Vec<PathBuf>,
    template: &TranscodeOptions,
    output_dir: Option<&Path>,
    pattern: Option<&str>,
) -> BatchPlan {
    let mut plan = BatchPlan::default();

    for input_path in files {
        let extension = template
            .container
            .map(|c| c.extension().to_string())
            .or_else(|| {
                input_path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_ascii_lowercase)
            })
            .unwrap_or_else(|| "mkv".to_string());
        let output = derive_output_path(&input_path, output_dir, pattern, &extension);

        if !template.overwrite && output.exists() {
            plan.skipped.push(input_path);
            continue;
        }

        plan.jobs.push(TranscodeOptions {
            inputs: vec![input_path],
            output,
            ..template.clone()
        });
    }

    plan
}
