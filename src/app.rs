use crate::cli::{Cli, Commands, EncodeArgs, JobArgs};
use anyhow::{Context, Result};
use ffqueue::config::Config;
use ffqueue::engine::{
    self, EventKind, JobEvent, JobId, JobQueue, MergeMode, Outcome, Preset, ProgressSnapshot,
    Supervisor, TimeOffset, TranscodeOptions,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;

/// Run the chosen command and return the process exit code
pub fn run(cli: Cli) -> i32 {
    match dispatch(cli) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    }
}

fn dispatch(cli: Cli) -> Result<bool> {
    if let Commands::InitConfig = cli.command {
        return handle_init_config(cli.config.as_deref());
    }

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::CheckFfmpeg => handle_check_ffmpeg(&config),
        Commands::Probe { file } => handle_probe(&config, &file),
        Commands::Presets => handle_presets(),
        Commands::DryRun { job } => handle_dry_run(&config, job),
        Commands::Run { job } => handle_run(&config, job, cli.json),
        Commands::Batch {
            directory,
            output_dir,
            pattern,
            jobs,
            dry_run,
            encode,
        } => handle_batch(
            &config,
            BatchRequest {
                directory,
                output_dir,
                pattern,
                jobs,
                dry_run,
                encode,
            },
            cli.json,
        ),
        Commands::InitConfig => handle_init_config(cli.config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn handle_check_ffmpeg(config: &Config) -> Result<bool> {
    let version = engine::ffmpeg_version(&config.tool.ffmpeg)?;
    println!("ffmpeg found: {}", version);
    let probe_version = engine::ffprobe_version(&config.tool.ffprobe)?;
    println!("ffprobe found: {}", probe_version);
    Ok(true)
}

fn handle_probe(config: &Config, file: &Path) -> Result<bool> {
    let summary = engine::probe_media(&config.tool.ffprobe, file)?;
    println!("{}", summary);
    Ok(true)
}

fn handle_presets() -> Result<bool> {
    for preset in Preset::all() {
        println!("{:<16} {}", preset.name, preset.description);
    }
    Ok(true)
}

fn handle_dry_run(config: &Config, job: JobArgs) -> Result<bool> {
    let opts = job.into_options(config.defaults.overwrite)?;
    Ok(print_command(config, &opts))
}

/// Print the command for `opts`, or why it cannot be built
fn print_command(config: &Config, opts: &TranscodeOptions) -> bool {
    match engine::build_ffmpeg_args(opts) {
        Ok(args) => {
            println!("{}", engine::format_ffmpeg_cmd(&config.tool.ffmpeg, &args));
            if opts.merge_mode == MergeMode::StreamCopy {
                println!(
                    "# inputs are listed in {} when the job starts",
                    engine::concat_list_path(&opts.output).display()
                );
            }
            true
        }
        Err(e) => {
            eprintln!("{}: {}", opts.output.display(), e);
            for violation in e.violations() {
                eprintln!("  - {}", violation);
            }
            false
        }
    }
}

fn handle_run(config: &Config, job: JobArgs, json: bool) -> Result<bool> {
    let opts = job.into_options(config.defaults.overwrite)?;
    let queue = JobQueue::from_config(config)?;
    let events = queue.subscribe()?;

    let label = job_label(&opts);
    let id = queue.submit(opts)?;
    let labels = HashMap::from([(id, label)]);

    let ok = follow_events(&events, &labels, json);
    queue.shutdown();
    Ok(ok)
}

struct BatchRequest {
    directory: PathBuf,
    output_dir: Option<PathBuf>,
    pattern: Option<String>,
    jobs: Option<usize>,
    dry_run: bool,
    encode: EncodeArgs,
}

fn handle_batch(config: &Config, request: BatchRequest, json: bool) -> Result<bool> {
    let files = engine::scan(&request.directory)?;
    if files.is_empty() {
        eprintln!("No video files found in {}", request.directory.display());
        return Ok(true);
    }

    let mut template = TranscodeOptions {
        overwrite: config.defaults.overwrite,
        container: config.defaults.container,
        ..Default::default()
    };
    request.encode.apply(&mut template)?;

    let output_dir = request
        .output_dir
        .or_else(|| config.defaults.output_dir.clone());
    let pattern = request
        .pattern
        .unwrap_or_else(|| config.defaults.filename_pattern.clone());

    let plan = engine::build_batch(files, &template, output_dir.as_deref(), Some(pattern.as_str()));
    for skipped in &plan.skipped {
        eprintln!("Skipping {} (output exists)", skipped.display());
    }

    if request.dry_run {
        let mut ok = true;
        for opts in &plan.jobs {
            ok &= print_command(config, opts);
        }
        println!("Total jobs: {}", plan.jobs.len());
        return Ok(ok);
    }

    let mut max_concurrency = config.queue.max_concurrency;
    if let Some(jobs) = request.jobs {
        max_concurrency = jobs;
    }
    let queue = JobQueue::new(Supervisor::from_config(config), max_concurrency)
        .context("Could not start the job queue")?;
    let events = queue.subscribe()?;

    let labels_in_order: Vec<String> = plan.jobs.iter().map(job_label).collect();
    let ids = queue.submit_batch(plan.jobs)?;
    let labels: HashMap<JobId, String> = ids.into_iter().zip(labels_in_order).collect();

    let ok = follow_events(&events, &labels, json);
    queue.shutdown();
    Ok(ok)
}

fn job_label(opts: &TranscodeOptions) -> String {
    opts.output
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| opts.output.display().to_string())
}

/// Print events until every job in `labels` completed; true when all of them succeeded
fn follow_events(events: &Receiver<JobEvent>, labels: &HashMap<JobId, String>, json: bool) -> bool {
    let mut remaining = labels.len();
    let mut all_succeeded = true;

    while remaining > 0 {
        let Ok(event) = events.recv() else {
            eprintln!("Queue stopped before all jobs finished");
            return false;
        };
        let Some(label) = labels.get(&event.job_id) else {
            continue;
        };

        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("Could not serialize event: {}", e),
            }
        } else {
            print_event(label, &event.kind);
        }

        if let EventKind::Completed(outcome) = &event.kind {
            remaining -= 1;
            all_succeeded &= matches!(outcome, Outcome::Succeeded);
        }
    }

    all_succeeded
}

fn print_event(label: &str, kind: &EventKind) {
    match kind {
        EventKind::Progress(snapshot) => println!("[{}] {}", label, format_progress(snapshot)),
        EventKind::LogLine(line) => tracing::debug!("[{}] {}", label, line),
        EventKind::StatusChanged(status) => println!("[{}] {}", label, status),
        EventKind::Completed(Outcome::Failed(err)) => eprintln!("[{}] failed: {}", label, err),
        EventKind::Completed(_) => {}
    }
}

fn format_progress(snapshot: &ProgressSnapshot) -> String {
    let mut line = match snapshot.fraction {
        Some(fraction) => format!("{:5.1}%", fraction * 100.0),
        None => "  ...".to_string(),
    };
    line.push_str(&format!(
        " time {}",
        TimeOffset::from_secs_f64(snapshot.out_time_s)
    ));
    if let Some(speed) = snapshot.speed {
        line.push_str(&format!(" speed {:.2}x", speed));
    }
    if let Some(fps) = snapshot.fps {
        line.push_str(&format!(" fps {:.1}", fps));
    }
    line
}

fn handle_init_config(path: Option<&Path>) -> Result<bool> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };

    if path.exists() {
        let cfg = Config::load_from(&path)?;
        println!("Config loaded successfully from {}", path.display());
        println!("{:#?}", cfg);
    } else {
        Config::default().save_to(&path)?;
        println!("Default config saved to {}", path.display());
    }
    Ok(true)
}
