//! Scheduler — owns the single recurring formula-calculation job.
//!
//! One background thread drives all work: initial delay, then a fixed
//! repeat interval. Because the thread that fires the trigger is the
//! thread that runs the job, at most one run is ever in flight; a
//! trigger that would have fired during a long run is skipped with a
//! log line, never queued. Shutdown raises the runner's cancellation
//! flag and joins — the drain is bounded by one batch round-trip.

use crate::{
    config::JobConfig,
    runner::{JobRunner, RunSummary},
    store::DocStore,
};
use chrono::{DateTime, Utc};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{self, RecvTimeoutError},
    Arc, Mutex,
};
use std::thread::JoinHandle;
use std::time::Duration;

/// Observability surface shared with the owning process.
#[derive(Default)]
struct SchedulerShared {
    next_run_time: Mutex<Option<DateTime<Utc>>>,
    last_run_summary: Mutex<Option<RunSummary>>,
    in_flight: AtomicBool,
}

pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    cancel: Arc<AtomicBool>,
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Start the scheduler thread. The store moves into the thread;
    /// the job is the only writer it needs.
    pub fn start(store: DocStore, config: JobConfig) -> Self {
        let shared = Arc::new(SchedulerShared::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        // Publish the first trigger before spawning so the surface is
        // populated the moment `start` returns.
        let next = Utc::now() + interval_delta(config.first_run_delay);
        *shared.next_run_time.lock().unwrap() = Some(next);

        let thread_shared = Arc::clone(&shared);
        let thread_cancel = Arc::clone(&cancel);
        let handle = std::thread::Builder::new()
            .name("formula-scheduler".into())
            .spawn(move || {
                run_loop(store, config, next, thread_shared, thread_cancel, shutdown_rx);
            })
            .expect("failed to spawn scheduler thread");

        Self {
            shared,
            cancel,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        *self.shared.next_run_time.lock().unwrap()
    }

    pub fn last_run_summary(&self) -> Option<RunSummary> {
        self.shared.last_run_summary.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.in_flight.load(Ordering::Relaxed)
    }

    /// Signal the thread to stop and wait for it. An in-flight run
    /// finishes its current batch and drains.
    pub fn shutdown(mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        log::info!("scheduler stopped");
    }
}

fn run_loop(
    store: DocStore,
    config: JobConfig,
    first_trigger: DateTime<Utc>,
    shared: Arc<SchedulerShared>,
    cancel: Arc<AtomicBool>,
    shutdown_rx: mpsc::Receiver<()>,
) {
    let interval = config.repeat_interval;
    let mut next = first_trigger;
    log::info!(
        "scheduler started: first run at {next}, then every {:?}",
        interval
    );

    loop {
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        // Publish the following trigger before the run starts: the
        // surface must never report a trigger that already fired.
        next += interval_delta(interval);
        *shared.next_run_time.lock().unwrap() = Some(next);

        shared.in_flight.store(true, Ordering::Relaxed);
        // The runner shares the scheduler's cancel flag, so a shutdown
        // mid-run stops the job after its current batch.
        let mut runner = JobRunner::with_cancel(&store, config.clone(), Arc::clone(&cancel));
        match runner.run() {
            Ok(summary) => {
                *shared.last_run_summary.lock().unwrap() = Some(summary);
            }
            Err(e) => {
                // Run-fatal (connectivity). Nothing to retry now; the
                // next scheduled trigger starts from scratch.
                log::error!("scheduled run aborted: {e}");
            }
        }
        shared.in_flight.store(false, Ordering::Relaxed);

        if cancel.load(Ordering::Relaxed) {
            break;
        }

        // Skip any trigger that fired while the run was still active.
        while next <= Utc::now() {
            log::warn!("previous run still active at {next}; trigger skipped");
            next += interval_delta(interval);
        }
        *shared.next_run_time.lock().unwrap() = Some(next);
    }

    *shared.next_run_time.lock().unwrap() = None;
}

fn interval_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}
