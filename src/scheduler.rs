use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::{Config, Job};
use crate::executor::Engine;
use crate::utils::format_duration;

/// Next cron boundary of `job` strictly after `after`, evaluated in the job's timezone
pub fn next_occurrence(job: &Job, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    job.schedule
        .next_after(&after.with_timezone(&job.timezone))
        .map(|next| next.with_timezone(&Utc))
}

/// A job that never ran is due only when it runs on startup; otherwise it is
/// due once the first boundary after its last run has passed. Missed
/// boundaries are not queued.
pub fn is_due(job: &Job, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_run {
        None => job.run_on_startup,
        Some(last) => match next_occurrence(job, last) {
            Some(next) => now >= next,
            None => {
                debug!("Query '{}' schedule '{}' has no future occurrence", job.name, job.schedule);
                false
            }
        },
    }
}

/// Jobs and the engine that runs them, swapped as a unit on reload
#[derive(Clone)]
pub struct Generation {
    pub jobs: Vec<Arc<Job>>,
    pub engine: Arc<Engine>,
    pub tick: Duration,
    pub shutdown_timeout: Duration,
}

impl Generation {
    pub fn new(config: &Config, engine: Arc<Engine>) -> Self {
        Self {
            jobs: config.jobs.iter().filter(|j| j.enabled).cloned().collect(),
            engine,
            tick: config.tick,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

struct JobSlot {
    job: Arc<Job>,
    running: Arc<AtomicBool>,
    armed_at: DateTime<Utc>,
    /// Last dispatch or skip, successful or not
    last_attempt: Option<DateTime<Utc>>,
}

impl JobSlot {
    fn should_dispatch(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let reference = match (last_run, self.last_attempt) {
            (Some(run), Some(attempt)) => Some(run.max(attempt)),
            (run, attempt) => run.or(attempt),
        };

        match reference {
            None if !self.job.run_on_startup => is_due(&self.job, Some(self.armed_at), now),
            reference => is_due(&self.job, reference, now),
        }
    }
}

/// Clears the running marker when the execution ends, even on panic
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Scheduler {
    slots: Vec<JobSlot>,
    engine: Arc<Engine>,
    tick: Duration,
    shutdown_timeout: Duration,
    in_flight: JoinSet<()>,
    /// Markers of removed jobs whose execution is still running
    detached: HashMap<String, Arc<AtomicBool>>,
    halt_tx: mpsc::UnboundedSender<anyhow::Error>,
    halt_rx: mpsc::UnboundedReceiver<anyhow::Error>,
    skipped: u64,
}

impl Scheduler {
    pub fn new(generation: Generation) -> Self {
        let (halt_tx, halt_rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler {
            slots: Vec::new(),
            engine: generation.engine.clone(),
            tick: generation.tick,
            shutdown_timeout: generation.shutdown_timeout,
            in_flight: JoinSet::new(),
            detached: HashMap::new(),
            halt_tx,
            halt_rx,
            skipped: 0,
        };
        scheduler.apply(generation);
        scheduler
    }

    /// Number of due executions dropped because the previous run was still active
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn running(&self) -> usize {
        self.in_flight.len()
    }

    /// Replaces the job set. Markers of jobs that keep their name survive, so a
    /// reload neither starts a second copy of a running job nor re-fires run on
    /// startup. A job removed while running keeps its marker until the
    /// execution ends, so re-adding it cannot overlap the old run. Dispatched
    /// executions keep the engine they started with.
    pub fn apply(&mut self, generation: Generation) {
        let now = Utc::now();
        let mut previous: HashMap<String, JobSlot> = self
            .slots
            .drain(..)
            .map(|slot| (slot.job.name.clone(), slot))
            .collect();

        self.slots = generation
            .jobs
            .into_iter()
            .map(|job| match previous.remove(&job.name) {
                Some(old) => JobSlot {
                    job,
                    running: old.running,
                    armed_at: old.armed_at,
                    last_attempt: old.last_attempt,
                },
                None => JobSlot {
                    running: self
                        .detached
                        .remove(&job.name)
                        .unwrap_or_else(|| Arc::new(AtomicBool::new(false))),
                    job,
                    armed_at: now,
                    last_attempt: None,
                },
            })
            .collect();

        for (name, removed) in previous {
            if removed.running.load(Ordering::SeqCst) {
                info!("Query '{}' was removed, letting the running execution finish", name);
                self.detached.insert(name, removed.running);
            }
        }
        self.detached.retain(|_, running| running.load(Ordering::SeqCst));

        self.engine = generation.engine;
        self.tick = generation.tick;
        self.shutdown_timeout = generation.shutdown_timeout;

        info!("Scheduling {} enabled queries", self.slots.len());
        for slot in &self.slots {
            match next_occurrence(&slot.job, now) {
                Some(next) => info!(
                    "Query '{}' ({}) next occurrence at {}",
                    slot.job.name,
                    slot.job.schedule,
                    next.with_timezone(&slot.job.timezone)
                ),
                None => warn!("Query '{}' ({}) has no future occurrence", slot.job.name, slot.job.schedule),
            }
        }
    }

    /// Dispatches every due job that is not already running
    pub async fn on_tick(&mut self, now: DateTime<Utc>) {
        let last_runs = self.engine.state().last_runs().await;

        for slot in &mut self.slots {
            if !slot.should_dispatch(last_runs.get(&slot.job.name).copied(), now) {
                continue;
            }
            slot.last_attempt = Some(now);

            if slot.running.swap(true, Ordering::SeqCst) {
                self.skipped += 1;
                warn!(
                    "Query '{}' is still running, skipping this execution ({} skipped so far)",
                    slot.job.name, self.skipped
                );
                continue;
            }

            debug!("Query '{}' is due at {}", slot.job.name, now);
            let guard = RunningGuard(slot.running.clone());
            let job = slot.job.clone();
            let engine = self.engine.clone();
            let halt = self.halt_tx.clone();

            self.in_flight.spawn(async move {
                let _guard = guard;
                if let Err(e) = engine.execute(&job).await {
                    let _ = halt.send(e);
                }
            });

            if let Some(next) = next_occurrence(&slot.job, now) {
                debug!(
                    "Query '{}' next occurrence at {}",
                    slot.job.name,
                    next.with_timezone(&slot.job.timezone)
                );
            }
        }
    }

    /// Runs until Ctrl-C, SIGTERM or a halt-policy failure, then drains the
    /// running executions. New generations arrive through `reloads`.
    pub async fn run(&mut self, mut reloads: mpsc::Receiver<Generation>) -> Result<()> {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let ctrl_c = signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut reloads_open = true;

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Starting event loop (tick: {})", format_duration(self.tick));

        let halted = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.on_tick(Utc::now()).await;
                }
                generation = reloads.recv(), if reloads_open => match generation {
                    Some(generation) => {
                        let tick = generation.tick;
                        self.apply(generation);
                        if tick != ticker.period() {
                            ticker = interval(tick);
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        }
                    }
                    None => reloads_open = false,
                },
                Some(result) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Err(e) = result {
                        error!("Query execution task failed: {}", e);
                    }
                }
                Some(e) = self.halt_rx.recv() => {
                    error!("Halting scheduler: {:#}", e);
                    break Some(e);
                }
                _ = &mut ctrl_c => {
                    info!("Scheduler shutdown initiated");
                    break None;
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, scheduler shutdown initiated");
                    break None;
                }
            }
        };

        self.drain().await;

        match halted {
            Some(e) => Err(anyhow!("Stopped by halt policy: {:#}", e)),
            None => Ok(()),
        }
    }

    /// Waits for running executions, at most `shutdown_timeout`
    pub async fn drain(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }

        info!(
            "Waiting up to {} for {} running queries",
            format_duration(self.shutdown_timeout),
            self.in_flight.len()
        );

        let in_flight = &mut self.in_flight;
        let finished = tokio::time::timeout(self.shutdown_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(
                "Shutdown timeout reached, aborting {} running queries",
                self.in_flight.len()
            );
            self.in_flight.abort_all();
            while self.in_flight.join_next().await.is_some() {}
        }
    }
}
