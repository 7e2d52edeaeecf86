// Process supervision against shell scripts standing in for ffmpeg

use crate::common::helpers::{
    FakeFfmpeg, FixedDuration, SlowDuration, WAIT, progress_block, sleep_for, supervisor_config,
};
use ffqueue::engine::supervisor::{MonitorReport, SupervisorMessage, Timeline};
use ffqueue::engine::{
    ControlError, JobError, NoProbe, Outcome, Supervisor, TimeOffset, TranscodeOptions,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};
use uuid::Uuid;

fn reports_until_finished(rx: &Receiver<SupervisorMessage>) -> Vec<MonitorReport> {
    let mut reports = Vec::new();
    loop {
        let message = rx
            .recv_timeout(WAIT)
            .expect("timed out waiting for the monitor");
        let done = matches!(message.report, MonitorReport::Finished(_));
        reports.push(message.report);
        if done {
            return reports;
        }
    }
}

fn wait_for(rx: &Receiver<SupervisorMessage>, wanted: &MonitorReport) {
    loop {
        let message = rx
            .recv_timeout(WAIT)
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}", wanted));
        if &message.report == wanted {
            return;
        }
        assert!(
            !matches!(message.report, MonitorReport::Finished(_)),
            "finished before {:?}",
            wanted
        );
    }
}

fn finished(reports: &[MonitorReport]) -> &Outcome {
    match reports.last() {
        Some(MonitorReport::Finished(outcome)) => outcome,
        other => panic!("expected Finished last, got {:?}", other),
    }
}

fn single_input() -> Timeline {
    Timeline {
        inputs: vec![PathBuf::from("in.mp4")],
        ..Default::default()
    }
}

#[test]
fn test_progress_reports_and_success() {
    let fake = FakeFfmpeg::new(&format!(
        "{}\n{}\nexit 0",
        progress_block(1.0, "continue"),
        progress_block(4.0, "end")
    ));
    let supervisor = Supervisor::new(
        supervisor_config(fake.path()),
        Arc::new(FixedDuration(4.0)),
    );
    let (tx, rx) = mpsc::channel::<SupervisorMessage>();

    supervisor
        .launch(Uuid::new_v4(), single_input(), &[], tx)
        .unwrap();
    let reports = reports_until_finished(&rx);

    let snapshots: Vec<_> = reports
        .iter()
        .filter_map(|r| match r {
            MonitorReport::Progress(s) => Some(s.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].fraction, Some(0.25));
    assert_eq!(snapshots[0].speed, Some(2.0));
    assert_eq!(snapshots[0].total_duration_s, Some(4.0));
    assert!(!snapshots[0].is_final);
    assert_eq!(snapshots[1].fraction, Some(1.0));
    assert!(snapshots[1].is_final);
    assert_eq!(finished(&reports), &Outcome::Succeeded);
}

#[test]
fn test_progress_is_indeterminate_without_duration() {
    let fake = FakeFfmpeg::quick_success();
    let supervisor = Supervisor::new(supervisor_config(fake.path()), Arc::new(NoProbe));
    let (tx, rx) = mpsc::channel::<SupervisorMessage>();

    supervisor
        .launch(Uuid::new_v4(), single_input(), &[], tx)
        .unwrap();
    let reports = reports_until_finished(&rx);

    let snapshot = reports
        .iter()
        .find_map(|r| match r {
            MonitorReport::Progress(s) => Some(s),
            _ => None,
        })
        .unwrap();
    assert_eq!(snapshot.fraction, None);
    assert_eq!(snapshot.out_time_s, 1.0);
}

#[test]
fn test_trimmed_timeline_scales_fraction() {
    let fake = FakeFfmpeg::new(&format!("{}\nexit 0", progress_block(5.0, "end")));
    let supervisor = Supervisor::new(
        supervisor_config(fake.path()),
        Arc::new(FixedDuration(60.0)),
    );
    let (tx, rx) = mpsc::channel::<SupervisorMessage>();

    let opts = TranscodeOptions {
        trim_start: Some(TimeOffset::from_millis(10_000)),
        trim_end: Some(TimeOffset::from_millis(30_000)),
        ..TranscodeOptions::new("in.mp4", "out.mp4")
    };
    supervisor
        .launch(Uuid::new_v4(), Timeline::from_options(&opts), &[], tx)
        .unwrap();
    let reports = reports_until_finished(&rx);

    let fractions: Vec<Option<f64>> = reports
        .iter()
        .filter_map(|r| match r {
            MonitorReport::Progress(s) => Some(s.fraction),
            _ => None,
        })
        .collect();
    assert_eq!(fractions, vec![Some(0.25)]);
}

#[test]
fn test_arguments_passed_verbatim() {
    let fake = FakeFfmpeg::new("printf '%s\\n' \"$@\" > \"$(dirname \"$0\")/args.txt\"\nexit 0");
    let supervisor = Supervisor::new(supervisor_config(fake.path()), Arc::new(NoProbe));
    let (tx, rx) = mpsc::channel::<SupervisorMessage>();

    let args: Vec<String> = ["-i", "my clip.mp4", "-vf", "scale=w=1:h=2", "out.mkv"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    supervisor
        .launch(Uuid::new_v4(), single_input(), &args, tx)
        .unwrap();
    assert_eq!(finished(&reports_until_finished(&rx)), &Outcome::Succeeded);

    let recorded = fs::read_to_string(fake.file("args.txt")).unwrap();
    assert_eq!(recorded.lines().collect::<Vec<_>>(), args);
}

#[test]
fn test_failure_carries_diagnostic_tail() {
    let fake = FakeFfmpeg::new(
        "for n in 1 2 3 4 5; do echo \"problem $n\" >&2; done\nexit 3",
    );
    let supervisor = Supervisor::new(supervisor_config(fake.path()), Arc::new(NoProbe));
    let (tx, rx) = mpsc::channel::<SupervisorMessage>();

    supervisor
        .launch(Uuid::new_v4(), single_input(), &[], tx)
        .unwrap();
    let reports = reports_until_finished(&rx);

    let logged: Vec<&str> = reports
        .iter()
        .filter_map(|r| match r {
            MonitorReport::LogLine(line) => Some(line.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        logged,
        vec!["problem 1", "problem 2", "problem 3", "problem 4", "problem 5"]
    );
    assert_eq!(
        finished(&reports),
        &Outcome::Failed(JobError::ProcessFailed {
            exit_code: Some(3),
            diagnostic_tail: vec![
                "problem 3".to_string(),
                "problem 4".to_string(),
                "problem 5".to_string(),
            ],
        })
    );
}

#[test]
fn test_cancel_terminates_and_reports_cancelled() {
    let fake = FakeFfmpeg::new(&format!("{}\nexit 0", sleep_for(30)));
    let supervisor = Supervisor::new(supervisor_config(fake.path()), Arc::new(NoProbe));
    let (tx, rx) = mpsc::channel::<SupervisorMessage>();

    let started = Instant::now();
    let handle = supervisor
        .launch(Uuid::new_v4(), single_input(), &[], tx)
        .unwrap();
    handle.cancel();
    handle.cancel();

    let reports = reports_until_finished(&rx);
    assert_eq!(finished(&reports), &Outcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_cancel_escalates_when_termination_is_ignored() {
    let fake = FakeFfmpeg::new(&format!(
        "trap '' TERM\nwhile :; do {}; done",
        sleep_for(1)
    ));
    let mut config = supervisor_config(fake.path());
    config.cancel_grace = Duration::from_millis(300);
    let supervisor = Supervisor::new(config, Arc::new(NoProbe));
    let (tx, rx) = mpsc::channel::<SupervisorMessage>();

    let started = Instant::now();
    let handle = supervisor
        .launch(Uuid::new_v4(), single_input(), &[], tx)
        .unwrap();
    // Give the shell time to install its trap
    std::thread::sleep(Duration::from_millis(200));
    handle.cancel();

    let reports = reports_until_finished(&rx);
    assert_eq!(finished(&reports), &Outcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_pause_and_resume() {
    let fake = FakeFfmpeg::new(&format!("{}\nexit 0", sleep_for(2)));
    let supervisor = Supervisor::new(supervisor_config(fake.path()), Arc::new(NoProbe));
    let (tx, rx) = mpsc::channel::<SupervisorMessage>();

    let handle = supervisor
        .launch(Uuid::new_v4(), single_input(), &[], tx)
        .unwrap();
    handle.pause().unwrap();
    wait_for(&rx, &MonitorReport::Paused);
    handle.resume().unwrap();
    wait_for(&rx, &MonitorReport::Resumed);

    assert_eq!(finished(&reports_until_finished(&rx)), &Outcome::Succeeded);

    // Once the monitor is gone the handle reports it
    let deadline = Instant::now() + WAIT;
    loop {
        match handle.pause() {
            Err(ControlError::ProcessGone) => break,
            _ if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
            other => panic!("expected ProcessGone, got {:?}", other),
        }
    }
}

#[test]
fn test_cancel_while_paused() {
    let fake = FakeFfmpeg::new(&format!("{}\nexit 0", sleep_for(30)));
    let supervisor = Supervisor::new(supervisor_config(fake.path()), Arc::new(NoProbe));
    let (tx, rx) = mpsc::channel::<SupervisorMessage>();

    let handle = supervisor
        .launch(Uuid::new_v4(), single_input(), &[], tx)
        .unwrap();
    handle.pause().unwrap();
    wait_for(&rx, &MonitorReport::Paused);
    handle.cancel();

    assert_eq!(finished(&reports_until_finished(&rx)), &Outcome::Cancelled);
}

#[test]
fn test_controls_are_not_held_up_by_a_slow_duration_probe() {
    let fake = FakeFfmpeg::new(&format!("{}\nexit 0", sleep_for(30)));
    let supervisor = Supervisor::new(
        supervisor_config(fake.path()),
        Arc::new(SlowDuration {
            delay: Duration::from_secs(8),
            seconds: 60.0,
        }),
    );
    let (tx, rx) = mpsc::channel::<SupervisorMessage>();

    let started = Instant::now();
    let handle = supervisor
        .launch(Uuid::new_v4(), single_input(), &[], tx)
        .unwrap();
    handle.pause().unwrap();
    wait_for(&rx, &MonitorReport::Paused);
    handle.cancel();

    assert_eq!(finished(&reports_until_finished(&rx)), &Outcome::Cancelled);
    // Grace is 2s; the probe alone would take 8s
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "took {:?}",
        started.elapsed()
    );
}

#[test]
fn test_spawn_errors() {
    let supervisor = Supervisor::new(
        supervisor_config(&PathBuf::from("/nonexistent/dir/ffmpeg")),
        Arc::new(NoProbe),
    );
    let (tx, _rx) = mpsc::channel::<SupervisorMessage>();
    let err = supervisor
        .launch(Uuid::new_v4(), single_input(), &[], tx)
        .unwrap_err();
    assert_eq!(
        err,
        JobError::ExecutableNotFound {
            path: PathBuf::from("/nonexistent/dir/ffmpeg")
        }
    );

    // A directory exists but cannot be executed
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(supervisor_config(dir.path()), Arc::new(NoProbe));
    let (tx, _rx) = mpsc::channel::<SupervisorMessage>();
    let err = supervisor
        .launch(Uuid::new_v4(), single_input(), &[], tx)
        .unwrap_err();
    assert!(matches!(err, JobError::SpawnFailed { .. }), "{:?}", err);
}
