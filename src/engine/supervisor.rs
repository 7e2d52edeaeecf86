// Process supervision: one external ffmpeg process per running job

use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::core::{
    DurationProbe, FfprobeDuration, JobId, LineKind, MergeMode, Outcome, ProgressParser,
    ProgressSnapshot, TimeOffset, TranscodeOptions, concat_list, concat_list_path,
    format_ffmpeg_cmd, write_debug_log,
};
use super::error::{ControlError, JobError};
use crate::config::Config;

/// How long output is still collected after the process has exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub ffmpeg: PathBuf,
    /// Time between the termination request and a forced kill
    pub cancel_grace: Duration,
    pub diagnostic_tail_lines: usize,
    pub poll_interval: Duration,
    pub debug_log: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            cancel_grace: Duration::from_secs(5),
            diagnostic_tail_lines: 10,
            poll_interval: Duration::from_millis(100),
            debug_log: None,
        }
    }
}

impl SupervisorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ffmpeg: config.tool.ffmpeg.clone(),
            cancel_grace: config.supervisor.cancel_grace(),
            diagnostic_tail_lines: config.supervisor.diagnostic_tail_lines,
            poll_interval: config.supervisor.poll_interval(),
            debug_log: config.logging.debug_log.clone(),
        }
    }
}

/// Lifecycle of one supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Succeeded | ProcessState::Failed | ProcessState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        match (self, next) {
            (NotStarted, Starting) => true,
            (Starting, Running | Failed) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running | Paused, Succeeded | Failed | Cancelled) => true,
            _ => false,
        }
    }

    fn from_outcome(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => ProcessState::Succeeded,
            Outcome::Failed(_) => ProcessState::Failed,
            Outcome::Cancelled => ProcessState::Cancelled,
        }
    }
}

/// The part of the input timeline a job actually encodes, for progress estimation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    pub inputs: Vec<PathBuf>,
    pub trim_start: Option<TimeOffset>,
    pub trim_end: Option<TimeOffset>,
}

impl Timeline {
    pub fn from_options(opts: &TranscodeOptions) -> Self {
        Self {
            inputs: opts.inputs.clone(),
            trim_start: opts.trim_start,
            trim_end: opts.trim_end,
        }
    }

    /// Length of one input after the trim window is applied
    pub fn clip(&self, full_duration_s: f64) -> f64 {
        let start = self.trim_start.map(TimeOffset::as_secs_f64).unwrap_or(0.0);
        let end = self
            .trim_end
            .map(|end| end.as_secs_f64().min(full_duration_s))
            .unwrap_or(full_duration_s);
        (end - start).max(0.0)
    }

    /// Expected output duration: the sum of every clipped input.
    /// Unknown when any input cannot be probed or the total is empty.
    pub fn total_duration(&self, probe: &dyn DurationProbe) -> Option<f64> {
        let mut total = 0.0;
        for input in &self.inputs {
            match probe.duration(input) {
                Ok(duration) => total += self.clip(duration),
                Err(e) => {
                    debug!("Duration probe failed for {}: {:#}", input.display(), e);
                    return None;
                }
            }
        }
        (total > 0.0).then_some(total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Cancel,
    Pause,
    Resume,
}

/// Message from a monitor thread to whoever launched the process
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorMessage {
    pub job_id: JobId,
    pub report: MonitorReport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorReport {
    Progress(ProgressSnapshot),
    LogLine(String),
    Paused,
    Resumed,
    /// Always the last report for a process
    Finished(Outcome),
}

/// Control surface of a running process. Dropping it does not stop the process.
#[derive(Debug)]
pub struct ProcessHandle {
    job_id: JobId,
    pid: u32,
    control: Sender<Control>,
}

impl ProcessHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Request termination. Repeated calls and calls after exit are no-ops.
    pub fn cancel(&self) {
        let _ = self.control.send(Control::Cancel);
    }

    pub fn pause(&self) -> Result<(), ControlError> {
        self.send_stop_continue(Control::Pause, "pause")
    }

    pub fn resume(&self) -> Result<(), ControlError> {
        self.send_stop_continue(Control::Resume, "resume")
    }

    fn send_stop_continue(&self, control: Control, what: &'static str) -> Result<(), ControlError> {
        if !cfg!(unix) {
            return Err(ControlError::Unsupported(what));
        }
        self.control
            .send(control)
            .map_err(|_| ControlError::ProcessGone)
    }
}

/// Starts ffmpeg processes and monitors each on its own thread
#[derive(Clone)]
pub struct Supervisor {
    config: SupervisorConfig,
    probe: Arc<dyn DurationProbe>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, probe: Arc<dyn DurationProbe>) -> Self {
        Self { config, probe }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            SupervisorConfig::from_config(config),
            Arc::new(
                FfprobeDuration::new(config.tool.ffprobe.clone())
                    .with_timeout(config.tool.probe_timeout()),
            ),
        )
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn ffmpeg with `args` and start monitoring it.
    ///
    /// Spawn failures are returned directly and no monitor is started. Otherwise every
    /// report for this job arrives on `reports`, ending with exactly one `Finished`.
    pub fn launch<T>(
        &self,
        job_id: JobId,
        timeline: Timeline,
        args: &[String],
        reports: Sender<T>,
    ) -> Result<ProcessHandle, JobError>
    where
        T: From<SupervisorMessage> + Send + 'static,
    {
        let ffmpeg = &self.config.ffmpeg;
        let command_line = format_ffmpeg_cmd(ffmpeg, args);
        info!(job = %job_id, "Starting: {}", command_line);
        if let Err(e) = write_debug_log(
            self.config.debug_log.as_deref(),
            &format!("[{}] {}", job_id, command_line),
        ) {
            warn!("Could not write debug log: {:#}", e);
        }

        let mut state = ProcessState::NotStarted;
        transition(job_id, &mut state, ProcessState::Starting);

        let spawned = Command::new(ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                let err = match e.kind() {
                    io::ErrorKind::NotFound => JobError::ExecutableNotFound {
                        path: ffmpeg.clone(),
                    },
                    _ => JobError::SpawnFailed {
                        path: ffmpeg.clone(),
                        reason: e.to_string(),
                    },
                };
                error!(job = %job_id, "{}", err);
                err
            });
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                transition(job_id, &mut state, ProcessState::Failed);
                return Err(err);
            }
        };
        transition(job_id, &mut state, ProcessState::Running);

        let pid = child.id();
        debug!(job = %job_id, pid, "Process started");

        let (line_tx, line_rx) = mpsc::channel();
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || forward_lines(stderr, line_tx));
        }

        let (control_tx, control_rx) = mpsc::channel();
        let monitor = Monitor {
            job_id,
            child,
            lines: line_rx,
            controls: control_rx,
            reports,
            config: self.config.clone(),
            probe: self.probe.clone(),
            timeline,
            state,
            tail: VecDeque::new(),
            full_log: Vec::new(),
            cancel_requested: false,
            kill_deadline: None,
        };
        thread::spawn(move || monitor.run());

        Ok(ProcessHandle {
            job_id,
            pid,
            control: control_tx,
        })
    }
}

/// Write the concat list a stream-copy merge reads its inputs from.
///
/// Entries are made absolute because the demuxer resolves relative entries against the
/// list's own directory. Returns the list path so it can be removed once the job ends.
pub fn write_concat_list(opts: &TranscodeOptions) -> Result<Option<PathBuf>, JobError> {
    if opts.merge_mode != MergeMode::StreamCopy {
        return Ok(None);
    }

    let path = concat_list_path(&opts.output);
    let failed = |e: io::Error| JobError::ConcatListFailed {
        path: path.clone(),
        reason: e.to_string(),
    };
    let inputs = opts
        .inputs
        .iter()
        .map(std::path::absolute)
        .collect::<io::Result<Vec<_>>>()
        .map_err(failed)?;
    fs::write(&path, concat_list(&inputs)).map_err(failed)?;

    debug!("Wrote concat list {}", path.display());
    Ok(Some(path))
}

pub fn remove_concat_list(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!("Could not remove concat list {}: {}", path.display(), e);
    }
}

/// Apply `next` when the state machine allows it; false when the move is refused
fn transition(job_id: JobId, state: &mut ProcessState, next: ProcessState) -> bool {
    if state.can_transition_to(next) {
        debug!(job = %job_id, "{:?} -> {:?}", state, next);
        *state = next;
        true
    } else {
        warn!(job = %job_id, "Ignoring transition {:?} -> {:?}", state, next);
        false
    }
}

/// Read a stream line by line, tolerating invalid UTF-8
fn forward_lines<R: Read>(stream: R, lines: Sender<String>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                if lines.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Stopped reading process output: {}", e);
                break;
            }
        }
    }
}

struct Monitor<T> {
    job_id: JobId,
    child: Child,
    lines: Receiver<String>,
    controls: Receiver<Control>,
    reports: Sender<T>,
    config: SupervisorConfig,
    probe: Arc<dyn DurationProbe>,
    timeline: Timeline,
    state: ProcessState,
    tail: VecDeque<String>,
    /// Every diagnostic line, only kept when a debug log is configured
    full_log: Vec<String>,
    cancel_requested: bool,
    kill_deadline: Option<Instant>,
}

impl<T: From<SupervisorMessage>> Monitor<T> {
    fn run(mut self) {
        let mut duration_rx = Some(self.spawn_duration_probe());
        let mut total_duration = None;

        let mut parser = ProgressParser::new();
        let mut lines_open = true;
        let mut controls_open = true;

        let exit = loop {
            if controls_open {
                controls_open = self.drain_controls();
            }
            self.enforce_kill_deadline();

            if let Some(rx) = &duration_rx {
                // Output stays queued until the expected duration is known
                match rx.recv_timeout(self.config.poll_interval) {
                    Ok(total) => {
                        total_duration = total;
                        self.log_duration(total_duration);
                        duration_rx = None;
                        continue;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        duration_rx = None;
                        continue;
                    }
                }
            } else if lines_open {
                match self.lines.recv_timeout(self.config.poll_interval) {
                    Ok(line) => {
                        self.handle_line(&mut parser, &line, total_duration);
                        continue;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => lines_open = false,
                }
            } else {
                thread::sleep(self.config.poll_interval);
            }

            match self.child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
        };

        if let Some(rx) = duration_rx.take() {
            total_duration = rx.recv_timeout(DRAIN_TIMEOUT).ok().flatten();
            self.log_duration(total_duration);
        }

        // Output written just before exit may still be in flight
        let drain_deadline = Instant::now() + DRAIN_TIMEOUT;
        while let Some(remaining) = drain_deadline.checked_duration_since(Instant::now()) {
            match self.lines.recv_timeout(remaining) {
                Ok(line) => self.handle_line(&mut parser, &line, total_duration),
                Err(_) => break,
            }
        }

        let outcome = match exit {
            Ok(status) => self.classify(status),
            Err(e) => {
                error!(job = %self.job_id, "Lost track of ffmpeg: {}", e);
                let _ = self.child.kill();
                Outcome::Failed(JobError::SupervisionFailed {
                    reason: e.to_string(),
                })
            }
        };

        if let Outcome::Failed(err) = &outcome {
            self.log_failure(err);
        }
        self.set_state(ProcessState::from_outcome(&outcome));
        self.report(MonitorReport::Finished(outcome));
    }

    /// Probing can be slow, so it runs beside the control loop
    fn spawn_duration_probe(&self) -> Receiver<Option<f64>> {
        let (tx, rx) = mpsc::channel();
        let probe = self.probe.clone();
        let timeline = self.timeline.clone();
        thread::spawn(move || {
            let _ = tx.send(timeline.total_duration(probe.as_ref()));
        });
        rx
    }

    fn log_duration(&self, total: Option<f64>) {
        match total {
            Some(total) => debug!(job = %self.job_id, "Expected duration {:.2}s", total),
            None => debug!(job = %self.job_id, "Duration unknown, progress is indeterminate"),
        }
    }

    /// Apply queued control requests; false once the handle is gone
    fn drain_controls(&mut self) -> bool {
        loop {
            match self.controls.try_recv() {
                Ok(control) => self.handle_control(control),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Cancel => self.request_cancel(),
            Control::Pause => {
                if self.state != ProcessState::Running || self.cancel_requested {
                    return;
                }
                match stop_process(self.child.id()) {
                    Ok(()) => {
                        info!(job = %self.job_id, "Paused");
                        self.set_state(ProcessState::Paused);
                        self.report(MonitorReport::Paused);
                    }
                    Err(e) => warn!(job = %self.job_id, "Pause failed: {}", e),
                }
            }
            Control::Resume => {
                if self.state != ProcessState::Paused || self.cancel_requested {
                    return;
                }
                match continue_process(self.child.id()) {
                    Ok(()) => {
                        info!(job = %self.job_id, "Resumed");
                        self.set_state(ProcessState::Running);
                        self.report(MonitorReport::Resumed);
                    }
                    Err(e) => warn!(job = %self.job_id, "Resume failed: {}", e),
                }
            }
        }
    }

    fn request_cancel(&mut self) {
        if self.cancel_requested {
            return;
        }
        self.cancel_requested = true;
        info!(job = %self.job_id, "Cancelling");

        match terminate_process(&mut self.child) {
            Ok(()) => {
                // A stopped process cannot act on the termination request until continued
                if self.state == ProcessState::Paused {
                    if let Err(e) = continue_process(self.child.id()) {
                        debug!(job = %self.job_id, "Continue after cancel failed: {}", e);
                    }
                }
                self.kill_deadline = Some(Instant::now() + self.config.cancel_grace);
            }
            Err(e) => {
                // Most likely exited already; try_wait will tell
                debug!(job = %self.job_id, "Termination request failed: {}", e);
            }
        }
    }

    fn enforce_kill_deadline(&mut self) {
        if let Some(deadline) = self.kill_deadline {
            if Instant::now() >= deadline {
                warn!(
                    job = %self.job_id,
                    "ffmpeg ignored termination for {:?}, killing",
                    self.config.cancel_grace
                );
                if let Err(e) = self.child.kill() {
                    debug!(job = %self.job_id, "Kill failed: {}", e);
                }
                self.kill_deadline = None;
            }
        }
    }

    fn handle_line(&mut self, parser: &mut ProgressParser, line: &str, total: Option<f64>) {
        match parser.parse_line(line) {
            LineKind::Progress => {}
            LineKind::BlockEnd => self.report(MonitorReport::Progress(parser.snapshot(total))),
            LineKind::Diagnostic => {
                let line = line.trim();
                if line.is_empty() {
                    return;
                }
                debug!(job = %self.job_id, "ffmpeg: {}", line);

                let capacity = self.config.diagnostic_tail_lines;
                if capacity > 0 {
                    if self.tail.len() == capacity {
                        self.tail.pop_front();
                    }
                    self.tail.push_back(line.to_string());
                }
                if self.config.debug_log.is_some() {
                    self.full_log.push(line.to_string());
                }
                self.report(MonitorReport::LogLine(line.to_string()));
            }
        }
    }

    fn classify(&mut self, status: ExitStatus) -> Outcome {
        if status.success() {
            info!(job = %self.job_id, "ffmpeg finished successfully");
            Outcome::Succeeded
        } else if self.cancel_requested {
            info!(job = %self.job_id, "ffmpeg stopped after cancellation ({})", status);
            Outcome::Cancelled
        } else {
            warn!(job = %self.job_id, "ffmpeg failed: {}", status);
            Outcome::Failed(JobError::ProcessFailed {
                exit_code: status.code(),
                diagnostic_tail: self.tail.drain(..).collect(),
            })
        }
    }

    fn log_failure(&self, err: &JobError) {
        let mut message = format!("[{}] FAILED: {}", self.job_id, err);
        for line in &self.full_log {
            message.push_str("\n    ");
            message.push_str(line);
        }
        if let Err(e) = write_debug_log(self.config.debug_log.as_deref(), &message) {
            warn!("Could not write debug log: {:#}", e);
        }
    }

    fn set_state(&mut self, next: ProcessState) {
        transition(self.job_id, &mut self.state, next);
    }

    fn report(&self, report: MonitorReport) {
        // The receiver only goes away when nobody is interested any more
        let _ = self.reports.send(T::from(SupervisorMessage {
            job_id: self.job_id,
            report,
        }));
    }
}

#[cfg(unix)]
fn signal_process(pid: u32, signal: libc::c_int) -> io::Result<()> {
    // The child is only reaped by its monitor, so the pid cannot have been reused yet
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn terminate_process(child: &mut Child) -> io::Result<()> {
    signal_process(child.id(), libc::SIGTERM)
}

#[cfg(not(unix))]
fn terminate_process(child: &mut Child) -> io::Result<()> {
    child.kill()
}

#[cfg(unix)]
fn stop_process(pid: u32) -> io::Result<()> {
    signal_process(pid, libc::SIGSTOP)
}

#[cfg(unix)]
fn continue_process(pid: u32) -> io::Result<()> {
    signal_process(pid, libc::SIGCONT)
}

#[cfg(not(unix))]
fn stop_process(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "stop signals"))
}

#[cfg(not(unix))]
fn continue_process(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "continue signals"))
}
