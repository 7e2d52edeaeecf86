// Scheduling behaviour of the job queue with fake ffmpeg processes

use crate::common::helpers::{
    FakeFfmpeg, WAIT, collect_until_completed, outcome_of, progress_block, queue_with, sleep_for,
    statuses_of, wait_for_status,
};
use ffqueue::engine::{
    EventKind, JobError, JobStatus, Outcome, QueueError, TranscodeOptions, Violation, concat_list,
};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Appends "start <output>" and "end <output>" around a sleep
fn recording_ffmpeg(seconds: u32) -> FakeFfmpeg {
    FakeFfmpeg::new(&format!(
        "log=\"$(dirname \"$0\")/order.log\"\necho \"start $last\" >> \"$log\"\n{}\n{}\necho \"end $last\" >> \"$log\"\nexit 0",
        progress_block(0.5, "continue"),
        sleep_for(seconds)
    ))
}

fn order_log(fake: &FakeFfmpeg) -> Vec<String> {
    fs::read_to_string(fake.file("order.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn job(name: &str) -> TranscodeOptions {
    TranscodeOptions::new(format!("{}.mp4", name), format!("{}.mkv", name))
}

#[test]
fn test_jobs_run_in_submission_order_with_limit_one() {
    let fake = recording_ffmpeg(1);
    let queue = queue_with(&fake, 1);
    let events = queue.subscribe().unwrap();

    let a = queue.submit(job("a")).unwrap();
    let b = queue.submit(job("b")).unwrap();
    let collected = collect_until_completed(&events, 2);

    assert_eq!(
        order_log(&fake),
        vec!["start a.mkv", "end a.mkv", "start b.mkv", "end b.mkv"]
    );
    for id in [a, b] {
        assert_eq!(
            statuses_of(&collected, id),
            vec![JobStatus::Pending, JobStatus::Running, JobStatus::Succeeded]
        );
        assert_eq!(outcome_of(&collected, id), Some(Outcome::Succeeded));
    }

    // b only started once a had completed
    let a_done = collected
        .iter()
        .position(|e| e.job_id == a && matches!(e.kind, EventKind::Completed(_)))
        .unwrap();
    let b_running = collected
        .iter()
        .position(|e| e.job_id == b && e.kind == EventKind::StatusChanged(JobStatus::Running))
        .unwrap();
    assert!(a_done < b_running);

    let summaries = queue.list_jobs().unwrap();
    assert!(summaries.iter().all(|s| s.finished_at.is_some()));
    assert_eq!(summaries[0].progress.as_ref().map(|p| p.out_time_s), Some(0.5));
}

#[test]
fn test_invalid_job_never_reaches_the_process() {
    let fake = FakeFfmpeg::new("touch \"$(dirname \"$0\")/invoked\"\nexit 0");
    let queue = queue_with(&fake, 1);

    let id = queue
        .submit(TranscodeOptions::new("same.mp4", "same.mp4"))
        .unwrap();
    assert!(queue.wait_idle_timeout(WAIT).unwrap());

    let summary = queue.job(id).unwrap();
    assert_eq!(summary.status, JobStatus::Failed);
    assert_eq!(
        summary.error,
        Some(JobError::InvalidOptions {
            violations: vec![Violation::OutputIsInput(PathBuf::from("same.mp4"))]
        })
    );
    assert!(!fake.file("invoked").exists());
}

#[test]
fn test_running_jobs_never_exceed_limit() {
    let fake = recording_ffmpeg(1);
    let queue = queue_with(&fake, 2);

    let ids = queue
        .submit_batch((0..5).map(|n| job(&format!("clip{}", n))).collect())
        .unwrap();

    let deadline = Instant::now() + WAIT;
    loop {
        let jobs = queue.list_jobs().unwrap();
        let active = jobs.iter().filter(|j| j.status.is_active()).count();
        assert!(active <= 2, "{} jobs active", active);
        if jobs.iter().all(|j| j.status.is_terminal()) {
            break;
        }
        assert!(Instant::now() < deadline, "queue did not drain");
        std::thread::sleep(Duration::from_millis(20));
    }

    let mut running = 0;
    let mut peak = 0;
    for line in order_log(&fake) {
        if line.starts_with("start") {
            running += 1;
        } else {
            running -= 1;
        }
        peak = peak.max(running);
    }
    assert_eq!(peak, 2);
    assert_eq!(ids.len(), 5);
}

#[test]
fn test_cancel_running_job_then_next_starts() {
    let fake = recording_ffmpeg(30);
    let queue = queue_with(&fake, 1);
    let events = queue.subscribe().unwrap();

    let first = queue.submit(job("first")).unwrap();
    let second = queue.submit(job("second")).unwrap();
    wait_for_status(&events, first, JobStatus::Running);

    let started = Instant::now();
    queue.cancel(first).unwrap();
    wait_for_status(&events, first, JobStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(queue.job(first).unwrap().finished_at.is_some());

    wait_for_status(&events, second, JobStatus::Running);
    queue.cancel(second).unwrap();
    wait_for_status(&events, second, JobStatus::Cancelled);

    // Cancelling a finished job changes nothing
    assert_eq!(queue.cancel(first), Ok(()));
    assert_eq!(queue.job(first).unwrap().status, JobStatus::Cancelled);
}

#[test]
fn test_cancel_pending_job_skips_it() {
    let fake = recording_ffmpeg(1);
    let queue = queue_with(&fake, 1);
    let events = queue.subscribe().unwrap();

    let a = queue.submit(job("a")).unwrap();
    let b = queue.submit(job("b")).unwrap();
    let c = queue.submit(job("c")).unwrap();
    queue.cancel(b).unwrap();
    queue.cancel(b).unwrap();

    let collected = collect_until_completed(&events, 3);
    assert_eq!(outcome_of(&collected, b), Some(Outcome::Cancelled));
    assert_eq!(
        statuses_of(&collected, b),
        vec![JobStatus::Pending, JobStatus::Cancelled]
    );
    assert_eq!(outcome_of(&collected, a), Some(Outcome::Succeeded));
    assert_eq!(outcome_of(&collected, c), Some(Outcome::Succeeded));
    assert!(!order_log(&fake).iter().any(|line| line.contains("b.mkv")));
}

#[test]
fn test_reorder_pending_jobs() {
    let fake = recording_ffmpeg(1);
    let queue = queue_with(&fake, 1);
    let events = queue.subscribe().unwrap();

    let a = queue.submit(job("a")).unwrap();
    let b = queue.submit(job("b")).unwrap();
    let c = queue.submit(job("c")).unwrap();
    wait_for_status(&events, a, JobStatus::Running);

    assert_eq!(queue.reorder(a, 0), Err(QueueError::NotPending(a)));
    queue.reorder(c, 0).unwrap();
    // Positions past the end are clamped
    queue.reorder(b, 99).unwrap();

    assert!(queue.wait_idle_timeout(WAIT).unwrap());
    let starts: Vec<String> = order_log(&fake)
        .into_iter()
        .filter(|line| line.starts_with("start"))
        .collect();
    assert_eq!(starts, vec!["start a.mkv", "start c.mkv", "start b.mkv"]);
}

#[test]
fn test_raising_concurrency_starts_waiting_jobs() {
    let fake = recording_ffmpeg(30);
    let queue = queue_with(&fake, 1);
    let events = queue.subscribe().unwrap();

    let a = queue.submit(job("a")).unwrap();
    let b = queue.submit(job("b")).unwrap();
    wait_for_status(&events, a, JobStatus::Running);
    assert_eq!(queue.job(b).unwrap().status, JobStatus::Pending);

    queue.set_concurrency(2).unwrap();
    wait_for_status(&events, b, JobStatus::Running);

    // Lowering the limit leaves running jobs alone
    queue.set_concurrency(1).unwrap();
    let jobs = queue.list_jobs().unwrap();
    assert!(jobs.iter().all(|j| j.status == JobStatus::Running));

    queue.cancel(a).unwrap();
    queue.cancel(b).unwrap();
    assert!(queue.wait_idle_timeout(WAIT).unwrap());
}

#[test]
fn test_pause_and_resume_through_the_queue() {
    let fake = recording_ffmpeg(3);
    let queue = queue_with(&fake, 1);
    let events = queue.subscribe().unwrap();

    let id = queue.submit(job("a")).unwrap();
    wait_for_status(&events, id, JobStatus::Running);

    queue.pause(id).unwrap();
    wait_for_status(&events, id, JobStatus::Paused);
    assert_eq!(queue.job(id).unwrap().status, JobStatus::Paused);
    // Pausing again is harmless
    queue.pause(id).unwrap();

    queue.resume(id).unwrap();
    wait_for_status(&events, id, JobStatus::Running);
    wait_for_status(&events, id, JobStatus::Succeeded);

    assert_eq!(queue.resume(id), Err(QueueError::NotRunning(id)));
}

#[test]
fn test_failed_process_reports_tail_and_queue_continues() {
    let fake = FakeFfmpeg::new(
        "case \"$last\" in\n  bad.mkv) echo 'Invalid data found when processing input' >&2; exit 1;;\nesac\nexit 0",
    );
    let queue = queue_with(&fake, 1);
    let events = queue.subscribe().unwrap();

    let bad = queue.submit(job("bad")).unwrap();
    let good = queue.submit(job("good")).unwrap();
    let collected = collect_until_completed(&events, 2);

    assert_eq!(
        outcome_of(&collected, bad),
        Some(Outcome::Failed(JobError::ProcessFailed {
            exit_code: Some(1),
            diagnostic_tail: vec!["Invalid data found when processing input".to_string()],
        }))
    );
    assert_eq!(outcome_of(&collected, good), Some(Outcome::Succeeded));

    let summary = queue.job(bad).unwrap();
    assert_eq!(
        summary.last_log.as_deref(),
        Some("Invalid data found when processing input")
    );
    assert!(summary.error.unwrap().to_string().contains("exited with code 1"));
}

#[test]
fn test_stream_copy_merge_list_exists_only_while_running() {
    let fake = FakeFfmpeg::new(
        "dir=\"$(dirname \"$0\")\"\ncat \"$dir/.joined.mkv.concat.txt\" > \"$dir/seen.txt\" || exit 1\nexit 0",
    );
    let queue = queue_with(&fake, 1);

    let inputs = vec![fake.file("a.mp4"), fake.file("b b.mp4")];
    let id = queue
        .submit(TranscodeOptions::stream_copy_merge(
            inputs.clone(),
            fake.file("joined.mkv"),
        ))
        .unwrap();
    assert!(queue.wait_idle_timeout(WAIT).unwrap());

    assert_eq!(queue.job(id).unwrap().status, JobStatus::Succeeded);
    assert_eq!(
        fs::read_to_string(fake.file("seen.txt")).unwrap(),
        concat_list(&inputs)
    );
    assert!(!fake.file(".joined.mkv.concat.txt").exists());
}

#[test]
fn test_shutdown_cancels_everything() {
    let fake = recording_ffmpeg(30);
    let queue = queue_with(&fake, 1);
    let events = queue.subscribe().unwrap();

    let running = queue.submit(job("running")).unwrap();
    let waiting = queue.submit(job("waiting")).unwrap();
    wait_for_status(&events, running, JobStatus::Running);

    let started = Instant::now();
    queue.shutdown();
    assert!(started.elapsed() < Duration::from_secs(10));

    let rest: Vec<_> = events.try_iter().collect();
    assert_eq!(outcome_of(&rest, running), Some(Outcome::Cancelled));
    assert_eq!(outcome_of(&rest, waiting), Some(Outcome::Cancelled));
    assert!(!order_log(&fake).iter().any(|line| line.contains("waiting")));
}
