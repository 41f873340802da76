//! Scheduler: single-writer loop that owns job admission and lifecycle.
//!
//! All mutations flow through one task: commands arrive on an mpsc channel,
//! job completions arrive from a `JoinSet`, and every state change happens in
//! this loop, so there are no racing writers over the resume store's
//! lifecycle columns. Events go out on a bounded broadcast channel; a lagging
//! subscriber skips old events and never blocks the loop.
//!
//! Admission is deterministic: highest priority first, FIFO within a tier.
//! Each admitted job takes a connection share from the global budget and
//! gives it back when it finishes, which can let several queued jobs in at
//! once.

use crate::analytics::{run_sampler, ProgressTracker};
use crate::config::EngineConfig;
use crate::control::StopToken;
use crate::events::{Command, Event};
use crate::job::{run_job, JobContext, JobOutcome};
use crate::resume::{JobId, JobPriority, JobState, JobSummary, ResumeStore};
use crate::storage::part_path;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;

const COMMAND_BUFFER: usize = 64;

/// Caller-side handle: send commands, subscribe to events. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<Event>,
}

impl EngineHandle {
    /// Add a download. Resolves once the job row is durable.
    pub async fn enqueue(
        &self,
        url: String,
        destination: PathBuf,
        priority: JobPriority,
    ) -> Result<JobId> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Enqueue {
                url,
                destination,
                priority,
                reply,
            })
            .await
            .context("engine stopped")?;
        rx.await.context("engine stopped")?
    }

    pub async fn pause(&self, id: JobId) -> Result<()> {
        self.commands
            .send(Command::Pause(id))
            .await
            .context("engine stopped")
    }

    pub async fn resume(&self, id: JobId) -> Result<()> {
        self.commands
            .send(Command::Resume(id))
            .await
            .context("engine stopped")
    }

    pub async fn cancel(&self, id: JobId, delete_file: bool) -> Result<()> {
        self.commands
            .send(Command::Cancel { id, delete_file })
            .await
            .context("engine stopped")
    }

    pub async fn set_priority(&self, id: JobId, priority: JobPriority) -> Result<()> {
        self.commands
            .send(Command::SetPriority(id, priority))
            .await
            .context("engine stopped")
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ListJobs(reply))
            .await
            .context("engine stopped")?;
        rx.await.context("engine stopped")
    }

    /// Ask the loop to stop. Running jobs are paused so progress survives.
    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(Command::Shutdown)
            .await
            .context("engine stopped")
    }

    /// Subscribe to lifecycle and progress events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

/// A started engine: the handle plus the loop task to await on shutdown.
pub struct Engine {
    pub handle: EngineHandle,
    pub task: tokio::task::JoinHandle<Result<()>>,
}

/// Start the engine loop on the current runtime.
///
/// With `exit_when_idle` the loop also ends once no job is running and none
/// is queued (the one-shot `run` mode); otherwise it runs until `shutdown`.
pub async fn start(config: EngineConfig, store: ResumeStore, exit_when_idle: bool) -> Result<Engine> {
    // A crash may have left rows claiming to run; their progress is real,
    // their workers are not.
    store.recover_running_jobs().await?;

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(config.event_buffer.max(8));

    let handle = EngineHandle {
        commands: cmd_tx,
        events: event_tx.clone(),
    };

    let scheduler = Scheduler {
        config,
        store,
        commands: cmd_rx,
        events: event_tx,
        tracker: std::sync::Arc::new(ProgressTracker::new()),
        running: HashMap::new(),
        jobs: JoinSet::new(),
        connections_used: 0,
        exit_when_idle,
    };
    let task = tokio::spawn(scheduler.run());
    Ok(Engine { handle, task })
}

struct RunningJob {
    stop: StopToken,
    connections: usize,
    delete_on_cancel: bool,
}

struct Scheduler {
    config: EngineConfig,
    store: ResumeStore,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<Event>,
    tracker: std::sync::Arc<ProgressTracker>,
    running: HashMap<JobId, RunningJob>,
    jobs: JoinSet<(JobId, Result<JobOutcome>)>,
    connections_used: usize,
    exit_when_idle: bool,
}

impl Scheduler {
    async fn run(mut self) -> Result<()> {
        let sampler = tokio::spawn(run_sampler(
            std::sync::Arc::clone(&self.tracker),
            self.events.clone(),
            self.config.progress_interval(),
        ));
        let result = self.event_loop().await;
        sampler.abort();
        result
    }

    async fn event_loop(&mut self) -> Result<()> {
        self.admit().await?;
        let mut shutting_down = false;

        loop {
            if shutting_down && self.jobs.is_empty() {
                break;
            }
            if self.exit_when_idle && !shutting_down && self.idle().await? {
                tracing::debug!("queue drained, exiting");
                break;
            }

            tokio::select! {
                cmd = self.commands.recv(), if !shutting_down => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            tracing::info!("engine shutting down");
                            for job in self.running.values() {
                                job.stop.request_pause();
                            }
                            shutting_down = true;
                        }
                        Some(cmd) => {
                            self.handle_command(cmd).await?;
                        }
                    }
                }
                Some(joined) = self.jobs.join_next(), if !self.jobs.is_empty() => {
                    let (id, outcome) = joined.context("job task panicked")?;
                    self.finish_job(id, outcome).await?;
                    if !shutting_down {
                        self.admit().await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn idle(&self) -> Result<bool> {
        Ok(self.running.is_empty() && self.store.next_eligible_job().await?.is_none())
    }

    /// Admit queued jobs while job slots and connection budget remain.
    async fn admit(&mut self) -> Result<()> {
        while self.running.len() < self.config.max_concurrent_jobs.max(1) {
            let share = connection_share(
                self.config.max_segments_per_job,
                self.config
                    .max_total_connections
                    .saturating_sub(self.connections_used),
            );
            if share == 0 {
                break;
            }
            let Some(id) = self.store.next_eligible_job().await? else {
                break;
            };
            self.store.set_state(id, JobState::Running).await?;

            let stop = StopToken::new();
            self.running.insert(
                id,
                RunningJob {
                    stop: stop.clone(),
                    connections: share,
                    delete_on_cancel: false,
                },
            );
            self.connections_used += share;

            let ctx = JobContext {
                id,
                store: self.store.clone(),
                tracker: std::sync::Arc::clone(&self.tracker),
                stop,
                segments_allowed: share,
                min_segment_bytes: self.config.min_segment_bytes,
                timeouts: self.config.fetch_timeouts(),
                retry: self.config.retry_policy(),
            };
            tracing::info!(job = id, connections = share, "admitting job");
            self.jobs.spawn(async move { (id, run_job(ctx).await) });
            let _ = self.events.send(Event::JobStarted { id });
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Enqueue {
                url,
                destination,
                priority,
                reply,
            } => {
                let added = self
                    .store
                    .add_job(&url, &destination, priority, &Default::default())
                    .await;
                match added {
                    Ok(id) => {
                        tracing::info!(job = id, url = %url, "job enqueued");
                        let _ = reply.send(Ok(id));
                        self.admit().await?;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Pause(id) => {
                if let Some(job) = self.running.get(&id) {
                    job.stop.request_pause();
                } else if let Some(record) = self.store.get_job(id).await? {
                    if record.state == JobState::Queued {
                        self.store.set_state(id, JobState::Paused).await?;
                        let _ = self.events.send(Event::JobPaused { id });
                    }
                }
            }
            Command::Resume(id) => {
                if let Some(record) = self.store.get_job(id).await? {
                    if record.state == JobState::Paused {
                        self.store.set_state(id, JobState::Queued).await?;
                        self.admit().await?;
                    }
                }
            }
            Command::Cancel { id, delete_file } => {
                if let Some(job) = self.running.get_mut(&id) {
                    job.delete_on_cancel = delete_file;
                    job.stop.request_cancel();
                } else if let Some(record) = self.store.get_job(id).await? {
                    if !record.state.is_terminal() {
                        if delete_file {
                            // Cancel-with-cleanup leaves nothing behind: the
                            // part file and the resume record go together.
                            remove_part_file(&record.destination).await;
                            self.store.delete_job(id).await?;
                        } else {
                            self.store.set_state(id, JobState::Cancelled).await?;
                        }
                        let _ = self.events.send(Event::JobCancelled { id });
                    }
                }
            }
            Command::SetPriority(id, priority) => {
                self.store.set_priority(id, priority).await?;
            }
            Command::ListJobs(reply) => {
                let _ = reply.send(self.store.list_jobs().await?);
            }
            // Handled in the select loop.
            Command::Shutdown => {}
        }
        Ok(())
    }

    async fn finish_job(&mut self, id: JobId, outcome: Result<JobOutcome>) -> Result<()> {
        let running = self.running.remove(&id);
        if let Some(job) = &running {
            self.connections_used = self.connections_used.saturating_sub(job.connections);
        }

        match outcome {
            Ok(JobOutcome::Completed) => {
                if self.config.keep_resume_on_complete {
                    self.store.set_state(id, JobState::Completed).await?;
                } else {
                    self.store.delete_job(id).await?;
                }
                let _ = self.events.send(Event::JobCompleted { id });
            }
            Ok(JobOutcome::Paused) => {
                self.store.set_state(id, JobState::Paused).await?;
                let _ = self.events.send(Event::JobPaused { id });
            }
            Ok(JobOutcome::Cancelled) => {
                let delete = running.map(|j| j.delete_on_cancel).unwrap_or(false);
                if delete {
                    if let Some(record) = self.store.get_job(id).await? {
                        remove_part_file(&record.destination).await;
                    }
                    self.store.delete_job(id).await?;
                } else {
                    self.store.set_state(id, JobState::Cancelled).await?;
                }
                let _ = self.events.send(Event::JobCancelled { id });
            }
            Ok(JobOutcome::Failed { reason }) => {
                tracing::error!(job = id, reason = %reason, "job failed");
                self.store.set_state(id, JobState::Failed).await?;
                let _ = self.events.send(Event::JobFailed { id, reason });
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                tracing::error!(job = id, reason = %reason, "job errored");
                self.store.set_state(id, JobState::Failed).await?;
                let _ = self.events.send(Event::JobFailed { id, reason });
            }
        }
        Ok(())
    }
}

/// Connections granted to a newly admitted job: its per-job cap, bounded by
/// what the global budget still has. At least one if anything is left.
fn connection_share(per_job_cap: usize, global_left: usize) -> usize {
    per_job_cap.max(1).min(global_left)
}

async fn remove_part_file(destination: &Path) {
    let part = part_path(destination);
    match tokio::fs::remove_file(&part).await {
        Ok(()) => tracing::debug!(path = %part.display(), "removed part file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %part.display(), error = %e, "failed to remove part file"),
    }
}
