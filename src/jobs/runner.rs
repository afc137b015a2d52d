use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::eid::Eid;
use crate::jobs::{IndexingOrchestrator, Job, JobError, JobStatus, TenantClaim, TransitionError};
use crate::tenant::TenantId;

/// Where indexing jobs execute. The orchestrator logic is the same for every
/// backend; runners only decide which thread drives it.
pub trait JobRunner: Send + Sync {
    /// Create a QUEUED job for the tenant.
    fn submit(&self, tenant: &TenantId) -> Result<Job, JobError>;

    /// Start a QUEUED job. Rejected while the tenant has another job running.
    fn run(&self, id: &Eid) -> Result<(), JobError>;

    /// Current record of the job.
    fn poll(&self, id: &Eid) -> Result<Job, JobError>;

    /// Poll until the job reaches DONE or ERROR, or the runner reports that
    /// it could not drive the job there.
    fn wait(&self, id: &Eid, interval: Duration) -> Result<Job, JobError> {
        loop {
            let job = self.poll(id)?;
            if job.is_terminal() {
                return Ok(job);
            }
            std::thread::sleep(interval);
        }
    }
}

/// Runs each job to completion on the caller's thread.
pub struct InlineRunner {
    orchestrator: Arc<IndexingOrchestrator>,
}

impl InlineRunner {
    pub fn new(orchestrator: Arc<IndexingOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

impl JobRunner for InlineRunner {
    fn submit(&self, tenant: &TenantId) -> Result<Job, JobError> {
        self.orchestrator.submit(tenant)
    }

    fn run(&self, id: &Eid) -> Result<(), JobError> {
        self.orchestrator.run(id).map(|_| ())
    }

    fn poll(&self, id: &Eid) -> Result<Job, JobError> {
        self.orchestrator.job(id)
    }
}

enum RunnerMsg {
    Run { id: Eid, claim: TenantClaim },
    /// finish in-flight jobs, then stop
    Shutdown,
}

type FailedRuns = Arc<Mutex<HashMap<Eid, String>>>;

/// Runs jobs on background threads fed through a channel.
///
/// `run` claims the tenant before queueing, so a second job for a tenant
/// that is already running is rejected immediately instead of waiting.
/// A worker that returns an error or panics leaves the reason behind for
/// `poll`, so pollers never wait on a job nobody is driving.
pub struct ThreadedRunner {
    orchestrator: Arc<IndexingOrchestrator>,
    task_tx: Mutex<mpsc::Sender<RunnerMsg>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    failed: FailedRuns,
}

impl ThreadedRunner {
    pub fn start(orchestrator: Arc<IndexingOrchestrator>) -> Self {
        let (task_tx, task_rx) = mpsc::channel();
        let failed = FailedRuns::default();

        let dispatcher = std::thread::spawn({
            let orchestrator = orchestrator.clone();
            let failed = failed.clone();
            move || start_queue(task_rx, orchestrator, failed)
        });

        Self {
            orchestrator,
            task_tx: Mutex::new(task_tx),
            dispatcher: Mutex::new(Some(dispatcher)),
            failed,
        }
    }

    fn send(&self, msg: RunnerMsg) -> Result<(), JobError> {
        self.task_tx
            .lock()
            .map_err(|e| JobError::Runner(format!("Lock poisoned: {}", e)))?
            .send(msg)
            .map_err(|_| JobError::Runner("job queue is shut down".to_string()))
    }

    /// Wait for in-flight jobs and stop the dispatcher. Later `run` calls fail.
    pub fn shutdown(&self) {
        if self.send(RunnerMsg::Shutdown).is_err() {
            return;
        }
        let handle = self.dispatcher.lock().ok().and_then(|mut d| d.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("job dispatcher panicked");
            }
        }
    }
}

impl Drop for ThreadedRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl JobRunner for ThreadedRunner {
    fn submit(&self, tenant: &TenantId) -> Result<Job, JobError> {
        self.orchestrator.submit(tenant)
    }

    fn run(&self, id: &Eid) -> Result<(), JobError> {
        let job = self.orchestrator.job(id)?;
        if job.status != JobStatus::Queued {
            return Err(TransitionError::InvalidTransition {
                id: job.id,
                from: job.status,
                to: JobStatus::Running,
            }
            .into());
        }
        let claim = self.orchestrator.claim(&job.tenant)?;
        self.send(RunnerMsg::Run {
            id: id.clone(),
            claim,
        })
    }

    /// Fails with [`JobError::Runner`] once the worker gave up on a job that
    /// never reached a final state.
    fn poll(&self, id: &Eid) -> Result<Job, JobError> {
        let job = self.orchestrator.job(id)?;
        if job.is_terminal() {
            return Ok(job);
        }
        let failed = self
            .failed
            .lock()
            .map_err(|e| JobError::Runner(format!("Lock poisoned: {}", e)))?;
        match failed.get(id) {
            Some(reason) => Err(JobError::Runner(format!("job {id} did not finish: {reason}"))),
            None => Ok(job),
        }
    }
}

fn start_queue(
    task_rx: mpsc::Receiver<RunnerMsg>,
    orchestrator: Arc<IndexingOrchestrator>,
    failed: FailedRuns,
) {
    let mut in_flight: Vec<(Eid, JoinHandle<()>)> = vec![];

    log::debug!("waiting for job");
    while let Ok(msg) = task_rx.recv() {
        let (id, claim) = match msg {
            RunnerMsg::Run { id, claim } => (id, claim),
            RunnerMsg::Shutdown => break,
        };
        log::debug!("got job {id}");

        let (finished, running): (Vec<_>, Vec<_>) =
            in_flight.into_iter().partition(|(_, handle)| handle.is_finished());
        finished.into_iter().for_each(join_job);
        in_flight = running;

        let handle = std::thread::spawn({
            let orchestrator = orchestrator.clone();
            let failed = failed.clone();
            let id = id.clone();
            move || {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    orchestrator.run_claimed(&id, &claim)
                }));
                let reason = match result {
                    Ok(Ok(_)) => None,
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(_) => Some("worker panicked".to_string()),
                };
                if let Some(reason) = reason {
                    log::error!("job {id} could not run: {reason}");
                    if let Ok(mut failed) = failed.lock() {
                        failed.insert(id, reason);
                    }
                }
                drop(claim);
            }
        });
        in_flight.push((id, handle));
    }

    in_flight.into_iter().for_each(join_job);
    log::debug!("job queue stopped");
}

fn join_job((id, handle): (Eid, JoinHandle<()>)) {
    if let Err(err) = handle.join() {
        log::error!("job {id} panicked: {err:?}");
    }
}
