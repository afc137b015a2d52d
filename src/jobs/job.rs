use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::Eid;
use crate::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Done => "DONE",
            JobStatus::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("job {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: Eid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {id}: processed {processed} would exceed total {total}")]
    ProgressOverflow {
        id: Eid,
        processed: usize,
        total: usize,
    },
}

/// One bulk indexing run for a tenant.
///
/// Status only moves QUEUED → RUNNING → DONE | ERROR, and `processed`
/// only grows and never passes `total`. The mutators below refuse
/// anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Eid,
    pub tenant: TenantId,
    pub status: JobStatus,
    pub total: usize,
    pub processed: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    pub fn queued(tenant: TenantId) -> Self {
        Self {
            id: Eid::new(),
            tenant,
            status: JobStatus::Queued,
            total: 0,
            processed: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    fn transition(&mut self, allowed_from: &[JobStatus], to: JobStatus) -> Result<(), TransitionError> {
        if !allowed_from.contains(&self.status) {
            return Err(TransitionError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Never earlier than `started_at`, even if the wall clock stepped back.
    fn finish_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.started_at {
            Some(started) if started > now => started,
            _ => now,
        }
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(&[JobStatus::Queued], JobStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record the catalog size. Only allowed before any progress.
    pub fn set_total(&mut self, total: usize) -> Result<(), TransitionError> {
        if self.status != JobStatus::Running {
            return Err(TransitionError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: JobStatus::Running,
            });
        }
        if total < self.processed {
            return Err(TransitionError::ProgressOverflow {
                id: self.id.clone(),
                processed: self.processed,
                total,
            });
        }
        self.total = total;
        Ok(())
    }

    /// Count `n` more items as committed.
    pub fn advance(&mut self, n: usize) -> Result<(), TransitionError> {
        if self.status != JobStatus::Running {
            return Err(TransitionError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: JobStatus::Running,
            });
        }
        let processed = self.processed.saturating_add(n);
        if processed > self.total {
            return Err(TransitionError::ProgressOverflow {
                id: self.id.clone(),
                processed,
                total: self.total,
            });
        }
        self.processed = processed;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(&[JobStatus::Running], JobStatus::Done)?;
        self.finished_at = Some(self.finish_time());
        Ok(())
    }

    /// Terminate with `error`. A job that never started gets `started_at`
    /// set as well, so an ERROR job always has both timestamps.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(&[JobStatus::Queued, JobStatus::Running], JobStatus::Error)?;

        let mut error = error.into();
        if error.is_empty() {
            error = "unknown error".to_string();
        }
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.finished_at = Some(self.finish_time());
        self.error = Some(error);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Completion in percent; 100 for a finished job with an empty catalog.
    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            return if self.status == JobStatus::Done { 100.0 } else { 0.0 };
        }
        self.processed as f64 * 100.0 / self.total as f64
    }
}
