// Job queue: one scheduler thread owns every job and all dispatch decisions

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::core::{
    JobId, JobStatus, JobSummary, Outcome, ProgressSnapshot, TranscodeOptions, build_ffmpeg_args,
};
use super::error::{ControlError, JobError, QueueError};
use super::events::{EventBus, EventKind, JobEvent};
use super::supervisor::{
    MonitorReport, ProcessHandle, Supervisor, SupervisorMessage, Timeline, remove_concat_list,
    write_concat_list,
};
use crate::config::Config;

/// Everything the scheduler thread can be asked to do
enum QueueCommand {
    Submit {
        id: JobId,
        options: Box<TranscodeOptions>,
    },
    Cancel {
        id: JobId,
        reply: Sender<Result<(), QueueError>>,
    },
    Pause {
        id: JobId,
        reply: Sender<Result<(), QueueError>>,
    },
    Resume {
        id: JobId,
        reply: Sender<Result<(), QueueError>>,
    },
    Reorder {
        id: JobId,
        position: usize,
        reply: Sender<Result<(), QueueError>>,
    },
    SetConcurrency {
        limit: usize,
    },
    List {
        reply: Sender<Vec<JobSummary>>,
    },
    Subscribe {
        reply: Sender<Receiver<JobEvent>>,
    },
    WaitIdle {
        reply: Sender<()>,
    },
    Supervisor(SupervisorMessage),
    Shutdown,
}

impl From<SupervisorMessage> for QueueCommand {
    fn from(message: SupervisorMessage) -> Self {
        QueueCommand::Supervisor(message)
    }
}

/// Handle to the job queue. Cheap calls that message the scheduler thread.
///
/// Jobs run in submission order (subject to `reorder`) with at most `max_concurrency`
/// of them running or paused at once.
pub struct JobQueue {
    tx: Sender<QueueCommand>,
    worker: Option<JoinHandle<()>>,
}

impl JobQueue {
    pub fn new(supervisor: Supervisor, max_concurrency: usize) -> Result<Self, QueueError> {
        if max_concurrency == 0 {
            return Err(QueueError::InvalidConcurrency(max_concurrency));
        }

        let (tx, rx) = mpsc::channel();
        let scheduler = Scheduler {
            supervisor,
            jobs: Vec::new(),
            pending: VecDeque::new(),
            max_concurrency,
            events: EventBus::new(),
            self_tx: tx.clone(),
            idle_waiters: Vec::new(),
            shutting_down: false,
        };
        let worker = thread::spawn(move || scheduler.run(rx));

        Ok(Self {
            tx,
            worker: Some(worker),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, QueueError> {
        Self::new(
            Supervisor::from_config(config),
            config.queue.max_concurrency,
        )
    }

    fn send(&self, command: QueueCommand) -> Result<(), QueueError> {
        self.tx.send(command).map_err(|_| QueueError::Disconnected)
    }

    fn request<R>(&self, command: impl FnOnce(Sender<R>) -> QueueCommand) -> Result<R, QueueError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(command(reply_tx))?;
        reply_rx.recv().map_err(|_| QueueError::Disconnected)
    }

    /// Enqueue a job. Invalid options are accepted but the job fails immediately.
    pub fn submit(&self, options: TranscodeOptions) -> Result<JobId, QueueError> {
        let id = Uuid::new_v4();
        self.send(QueueCommand::Submit {
            id,
            options: Box::new(options),
        })?;
        Ok(id)
    }

    /// Enqueue several jobs, keeping their order
    pub fn submit_batch(&self, batch: Vec<TranscodeOptions>) -> Result<Vec<JobId>, QueueError> {
        batch.into_iter().map(|options| self.submit(options)).collect()
    }

    /// Cancel a job. Pending jobs are dropped from the queue, running or paused jobs get a
    /// termination request, finished jobs are left alone.
    pub fn cancel(&self, id: JobId) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Cancel { id, reply })?
    }

    pub fn pause(&self, id: JobId) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Pause { id, reply })?
    }

    pub fn resume(&self, id: JobId) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Resume { id, reply })?
    }

    /// Move a pending job to `position` among the pending jobs (clamped to the end)
    pub fn reorder(&self, id: JobId, position: usize) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Reorder {
            id,
            position,
            reply,
        })?
    }

    /// Change the limit. Lowering it never interrupts running jobs.
    pub fn set_concurrency(&self, limit: usize) -> Result<(), QueueError> {
        if limit == 0 {
            return Err(QueueError::InvalidConcurrency(limit));
        }
        self.send(QueueCommand::SetConcurrency { limit })
    }

    /// Every job ever submitted, in submission order
    pub fn list_jobs(&self) -> Result<Vec<JobSummary>, QueueError> {
        self.request(|reply| QueueCommand::List { reply })
    }

    pub fn job(&self, id: JobId) -> Result<JobSummary, QueueError> {
        self.list_jobs()?
            .into_iter()
            .find(|job| job.id == id)
            .ok_or(QueueError::JobNotFound(id))
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> Result<Receiver<JobEvent>, QueueError> {
        self.request(|reply| QueueCommand::Subscribe { reply })
    }

    /// Block until nothing is pending, running or paused
    pub fn wait_idle(&self) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::WaitIdle { reply })
    }

    /// Like `wait_idle`, giving up after `timeout`; returns whether the queue went idle
    pub fn wait_idle_timeout(&self, timeout: Duration) -> Result<bool, QueueError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(QueueCommand::WaitIdle { reply: reply_tx })?;
        match reply_rx.recv_timeout(timeout) {
            Ok(()) => Ok(true),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(false),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(QueueError::Disconnected),
        }
    }

    /// Cancel everything and wait for running processes to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.tx.send(QueueCommand::Shutdown);
            if worker.join().is_err() {
                warn!("Scheduler thread panicked");
            }
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Job {
    id: JobId,
    options: TranscodeOptions,
    status: JobStatus,
    progress: Option<ProgressSnapshot>,
    last_log: Option<String>,
    error: Option<JobError>,
    submitted_at: DateTime<Local>,
    finished_at: Option<DateTime<Local>>,
    /// Present exactly while Running or Paused
    process: Option<ProcessHandle>,
    /// Input list of a stream-copy merge, removed when the job ends
    concat_list: Option<PathBuf>,
}

impl Job {
    fn new(id: JobId, options: TranscodeOptions) -> Self {
        Self {
            id,
            options,
            status: JobStatus::Pending,
            progress: None,
            last_log: None,
            error: None,
            submitted_at: Local::now(),
            finished_at: None,
            process: None,
            concat_list: None,
        }
    }

    fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            status: self.status,
            inputs: self.options.inputs.clone(),
            output: self.options.output.clone(),
            progress: self.progress.clone(),
            last_log: self.last_log.clone(),
            error: self.error.clone(),
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
        }
    }
}

struct Scheduler {
    supervisor: Supervisor,
    /// Submission order
    jobs: Vec<Job>,
    /// Dispatch order of the jobs still waiting
    pending: VecDeque<JobId>,
    max_concurrency: usize,
    events: EventBus,
    /// Given to monitors so their reports land in this thread's inbox
    self_tx: Sender<QueueCommand>,
    idle_waiters: Vec<Sender<()>>,
    shutting_down: bool,
}

impl Scheduler {
    fn run(mut self, rx: Receiver<QueueCommand>) {
        debug!("Scheduler started (max concurrency {})", self.max_concurrency);

        while let Ok(command) = rx.recv() {
            self.handle(command);
            self.notify_idle();
            if self.shutting_down && self.active_count() == 0 {
                break;
            }
        }

        info!("Scheduler stopped");
    }

    fn handle(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Submit { id, options } => self.submit(id, *options),
            QueueCommand::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            QueueCommand::Pause { id, reply } => {
                let _ = reply.send(self.pause(id));
            }
            QueueCommand::Resume { id, reply } => {
                let _ = reply.send(self.resume(id));
            }
            QueueCommand::Reorder {
                id,
                position,
                reply,
            } => {
                let _ = reply.send(self.reorder(id, position));
            }
            QueueCommand::SetConcurrency { limit } => {
                info!("Concurrency limit {} -> {}", self.max_concurrency, limit);
                self.max_concurrency = limit;
                self.dispatch();
            }
            QueueCommand::List { reply } => {
                let _ = reply.send(self.jobs.iter().map(Job::summary).collect());
            }
            QueueCommand::Subscribe { reply } => {
                let _ = reply.send(self.events.subscribe());
            }
            QueueCommand::WaitIdle { reply } => self.idle_waiters.push(reply),
            QueueCommand::Supervisor(message) => self.on_report(message),
            QueueCommand::Shutdown => self.begin_shutdown(),
        }
    }

    fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    fn active_count(&self) -> usize {
        self.jobs.iter().filter(|job| job.status.is_active()).count()
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active_count() == 0
    }

    fn publish(&mut self, id: JobId, kind: EventKind) {
        self.events.publish(JobEvent::new(id, kind));
    }

    fn set_status(&mut self, id: JobId, status: JobStatus) {
        if let Some(job) = self.job_mut(id) {
            if job.status == status || job.status.is_terminal() {
                return;
            }
            debug!(job = %id, "{} -> {}", job.status, status);
            job.status = status;
            self.publish(id, EventKind::StatusChanged(status));
        }
    }

    fn submit(&mut self, id: JobId, options: TranscodeOptions) {
        let violations = options.validate();
        info!(
            job = %id,
            "Submitted {} input(s) -> {}",
            options.inputs.len(),
            options.output.display()
        );
        self.jobs.push(Job::new(id, options));
        self.publish(id, EventKind::StatusChanged(JobStatus::Pending));

        if self.shutting_down {
            self.finish(id, Outcome::Cancelled);
        } else if !violations.is_empty() {
            let err = JobError::InvalidOptions { violations };
            warn!(job = %id, "Rejected: {}", err);
            self.finish(id, Outcome::Failed(err));
        } else {
            self.pending.push_back(id);
            self.dispatch();
        }
    }

    /// Start pending jobs in order while the limit allows
    fn dispatch(&mut self) {
        if self.shutting_down {
            return;
        }
        while self.active_count() < self.max_concurrency {
            let Some(id) = self.pending.pop_front() else {
                break;
            };
            self.start(id);
        }
    }

    fn start(&mut self, id: JobId) {
        let Some(job) = self.job(id) else {
            return;
        };
        let args = match build_ffmpeg_args(&job.options) {
            Ok(args) => args,
            Err(e) => {
                warn!(job = %id, "Could not build command: {}", e);
                self.finish(id, Outcome::Failed(e.into()));
                return;
            }
        };
        let concat_list = match write_concat_list(&job.options) {
            Ok(path) => path,
            Err(err) => {
                self.finish(id, Outcome::Failed(err));
                return;
            }
        };
        let timeline = Timeline::from_options(&job.options);
        if let Some(job) = self.job_mut(id) {
            job.concat_list = concat_list;
        }

        info!(job = %id, "Dispatching");
        match self
            .supervisor
            .launch(id, timeline, &args, self.self_tx.clone())
        {
            Ok(handle) => {
                if let Some(job) = self.job_mut(id) {
                    job.process = Some(handle);
                }
                self.set_status(id, JobStatus::Running);
            }
            Err(err) => self.finish(id, Outcome::Failed(err)),
        }
    }

    /// Move a job to its terminal state. Later outcomes for the same job are ignored.
    fn finish(&mut self, id: JobId, outcome: Outcome) {
        self.pending.retain(|pending| *pending != id);

        let Some(job) = self.job_mut(id) else {
            return;
        };
        if job.status.is_terminal() {
            debug!(job = %id, "Ignoring outcome for finished job");
            return;
        }

        let status = outcome.status();
        job.status = status;
        job.finished_at = Some(Local::now());
        job.process = None;
        if let Some(list) = job.concat_list.take() {
            remove_concat_list(&list);
        }
        if let Outcome::Failed(err) = &outcome {
            job.error = Some(err.clone());
        }

        match &outcome {
            Outcome::Failed(err) => warn!(job = %id, "Failed: {}", err),
            _ => info!(job = %id, "Finished: {}", status),
        }
        self.publish(id, EventKind::StatusChanged(status));
        self.publish(id, EventKind::Completed(outcome));
    }

    fn on_report(&mut self, message: SupervisorMessage) {
        let id = message.job_id;
        let active = self.job(id).is_some_and(|job| job.status.is_active());
        if !active {
            debug!(job = %id, "Dropping report for inactive job");
            return;
        }

        match message.report {
            MonitorReport::Progress(snapshot) => {
                if let Some(job) = self.job_mut(id) {
                    job.progress = Some(snapshot.clone());
                }
                self.publish(id, EventKind::Progress(snapshot));
            }
            MonitorReport::LogLine(line) => {
                if let Some(job) = self.job_mut(id) {
                    job.last_log = Some(line.clone());
                }
                self.publish(id, EventKind::LogLine(line));
            }
            MonitorReport::Paused => self.set_status(id, JobStatus::Paused),
            MonitorReport::Resumed => self.set_status(id, JobStatus::Running),
            MonitorReport::Finished(outcome) => {
                self.finish(id, outcome);
                self.dispatch();
            }
        }
    }

    fn cancel(&mut self, id: JobId) -> Result<(), QueueError> {
        let job = self.job(id).ok_or(QueueError::JobNotFound(id))?;
        match job.status {
            JobStatus::Pending => {
                info!(job = %id, "Cancelled before start");
                self.finish(id, Outcome::Cancelled);
            }
            JobStatus::Running | JobStatus::Paused => {
                if let Some(process) = &job.process {
                    process.cancel();
                }
            }
            // Already finished: nothing to do
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled => {}
        }
        Ok(())
    }

    fn pause(&mut self, id: JobId) -> Result<(), QueueError> {
        let job = self.job(id).ok_or(QueueError::JobNotFound(id))?;
        match (job.status, &job.process) {
            (JobStatus::Paused, _) => Ok(()),
            (JobStatus::Running, Some(process)) => {
                process.pause().map_err(|e| control_error(id, e))
            }
            _ => Err(QueueError::NotRunning(id)),
        }
    }

    fn resume(&mut self, id: JobId) -> Result<(), QueueError> {
        let job = self.job(id).ok_or(QueueError::JobNotFound(id))?;
        match (job.status, &job.process) {
            (JobStatus::Running, _) => Ok(()),
            (JobStatus::Paused, Some(process)) => {
                process.resume().map_err(|e| control_error(id, e))
            }
            _ => Err(QueueError::NotRunning(id)),
        }
    }

    fn reorder(&mut self, id: JobId, position: usize) -> Result<(), QueueError> {
        if self.job(id).is_none() {
            return Err(QueueError::JobNotFound(id));
        }
        let Some(current) = self.pending.iter().position(|pending| *pending == id) else {
            return Err(QueueError::NotPending(id));
        };

        self.pending.remove(current);
        let position = position.min(self.pending.len());
        self.pending.insert(position, id);
        debug!(job = %id, "Moved to pending position {}", position);
        Ok(())
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!("Shutting down queue");
        self.shutting_down = true;

        let pending: Vec<JobId> = self.pending.drain(..).collect();
        for id in pending {
            self.finish(id, Outcome::Cancelled);
        }
        for job in &self.jobs {
            if let Some(process) = &job.process {
                process.cancel();
            }
        }
    }

    fn notify_idle(&mut self) {
        if !self.idle_waiters.is_empty() && self.is_idle() {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

fn control_error(id: JobId, err: ControlError) -> QueueError {
    match err {
        ControlError::Unsupported(what) => QueueError::Unsupported(what),
        ControlError::ProcessGone => QueueError::NotRunning(id),
    }
}
