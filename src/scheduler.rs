//! Named periodic jobs, at most one running instance per job.
//!
//! Every job gets its own tokio task and timer. The job body is blocking (SAS
//! POSTs, CRL downloads) and runs on the blocking pool; a tick that fires while
//! the previous run of the same job is still going is skipped and counted.

use crate::monitor::PipelineMonitor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

pub type JobFn = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

struct Job {
    name: String,
    interval: Duration,
    run: JobFn,
}

pub struct Scheduler {
    jobs: Vec<Job>,
    monitor: Arc<PipelineMonitor>,
}

/// Clears the running flag when a run ends, even if the job panics.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Scheduler {
    pub fn new(monitor: Arc<PipelineMonitor>) -> Self {
        Self { jobs: Vec::new(), monitor }
    }

    pub fn add_job<F>(&mut self, name: impl Into<String>, interval: Duration, run: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.jobs.push(Job {
            name: name.into(),
            interval,
            run: Arc::new(run),
        });
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    /// Spawns one timer task per job. Must be called inside a tokio runtime.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = self
            .jobs
            .into_iter()
            .map(|job| {
                info!("Scheduling job {} every {:?}", job.name, job.interval);
                tokio::spawn(run_job(job, Arc::clone(&self.monitor), shutdown_rx.clone()))
            })
            .collect();
        SchedulerHandle { shutdown_tx, tasks }
    }
}

async fn run_job(job: Job, monitor: Arc<PipelineMonitor>, mut shutdown: watch::Receiver<bool>) {
    let running = Arc::new(AtomicBool::new(false));
    let mut ticker = tokio::time::interval(job.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if running.swap(true, Ordering::AcqRel) {
                    debug!("Job {} still running, skipping tick", job.name);
                    monitor.record_skipped(&job.name);
                    continue;
                }
                let guard = RunningGuard(Arc::clone(&running));
                let run = Arc::clone(&job.run);
                let name = job.name.clone();
                in_flight = Some(tokio::task::spawn_blocking(move || {
                    let _guard = guard;
                    if let Err(e) = run() {
                        error!("Job {} failed: {:#}", name, e);
                    }
                }));
            }
            _ = shutdown.changed() => break,
        }
    }

    if let Some(handle) = in_flight {
        // Let the current run finish; its session commits or rolls back on its own.
        if let Err(e) = handle.await {
            error!("Job {} panicked: {}", job.name, e);
        }
    }
    debug!("Job {} stopped", job.name);
}

pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stops all timers and waits for in-flight runs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}
