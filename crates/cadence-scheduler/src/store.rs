//! Job storage.
//!
//! The [`JobStore`] trait is the only way scheduling state is read or
//! mutated. [`MemoryJobStore`] keeps jobs in a sharded concurrent map so
//! mutations of different jobs never contend on a global lock, while every
//! mutation of one job happens under that job's entry lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::{Job, JobPatch, SchedulerError};

/// Storage for job records and their scheduling state.
pub trait JobStore: Send + Sync {
    /// Insert a new job and compute its first run time at `now`.
    ///
    /// Rejects duplicate ids, `max_instances == 0`, and triggers that never fire.
    fn add(&self, job: Job, now: DateTime<Utc>) -> Result<String, SchedulerError>;

    /// Get a snapshot of a job.
    fn get(&self, id: &str) -> Result<Job, SchedulerError>;

    fn contains(&self, id: &str) -> bool;

    /// All jobs in insertion order.
    fn list(&self) -> Vec<Job>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a job, returning its last snapshot.
    fn remove(&self, id: &str) -> Result<Job, SchedulerError>;

    /// Apply a partial update. A new trigger is rescheduled from `now`.
    ///
    /// `max_instances` may not drop below the job's running instances.
    fn update(&self, id: &str, patch: &JobPatch, now: DateTime<Utc>) -> Result<Job, SchedulerError>;

    /// Pause (clearing the next run time) or resume (recomputing it from `now`).
    fn set_paused(&self, id: &str, paused: bool, now: DateTime<Utc>) -> Result<Job, SchedulerError>;

    /// Non-paused jobs whose next run time is at or before `now`, ordered by
    /// run time and then id.
    fn due_jobs(&self, now: DateTime<Utc>) -> Vec<Job>;

    /// Move a job from the slot `from` to the following one.
    ///
    /// Only applies while the job's next run time is still `from`; otherwise
    /// returns [`Advanced::Superseded`] and changes nothing. A trigger error
    /// unschedules the job and is returned.
    fn advance(&self, id: &str, from: DateTime<Utc>) -> Result<Advanced, SchedulerError>;

    /// Earliest next run time across non-paused jobs.
    fn next_wakeup(&self) -> Option<DateTime<Utc>>;

    /// Atomically check `currently_running < max_instances` and increment.
    ///
    /// Returns the entry generation to hand back to [`JobStore::release`].
    fn try_acquire(&self, id: &str) -> Result<u64, SchedulerError>;

    /// Decrement the running count of the job inserted as `generation`.
    fn release(&self, id: &str, generation: u64);

    /// Sum of running instances over all jobs.
    fn running_instances(&self) -> usize;
}

/// What [`JobStore::advance`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advanced {
    /// Moved to this slot.
    Next(DateTime<Utc>),
    /// The trigger has no slots left.
    Exhausted,
    /// The job no longer sat on the expected slot. Nothing changed.
    Superseded,
}

/// A stored job plus its insertion sequence number.
#[derive(Debug, Clone)]
struct JobEntry {
    seq: u64,
    job: Job,
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: DashMap<String, JobEntry>,
    next_seq: AtomicU64,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn add(&self, mut job: Job, now: DateTime<Utc>) -> Result<String, SchedulerError> {
        if job.max_instances == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_instances must be positive".to_string(),
            ));
        }

        let first = job.trigger.first_fire(now)?;
        job.next_run_time = if job.paused { None } else { Some(first) };
        job.currently_running = 0;

        let id = job.id.clone();
        match self.jobs.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SchedulerError::JobExists(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                slot.insert(JobEntry { seq, job });
                Ok(id)
            }
        }
    }

    fn get(&self, id: &str) -> Result<Job, SchedulerError> {
        self.jobs
            .get(id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    fn list(&self) -> Vec<Job> {
        let mut entries: Vec<(u64, Job)> = self
            .jobs
            .iter()
            .map(|entry| (entry.seq, entry.job.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, job)| job).collect()
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }

    fn remove(&self, id: &str) -> Result<Job, SchedulerError> {
        self.jobs
            .remove(id)
            .map(|(_, entry)| entry.job)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    fn update(&self, id: &str, patch: &JobPatch, now: DateTime<Utc>) -> Result<Job, SchedulerError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        match patch.max_instances {
            Some(0) => {
                return Err(SchedulerError::InvalidConfig(
                    "max_instances must be positive".to_string(),
                ));
            }
            Some(max) if max < entry.job.currently_running => {
                return Err(SchedulerError::InvalidConfig(format!(
                    "max_instances {} is below the {} running instances",
                    max, entry.job.currently_running
                )));
            }
            _ => {}
        }

        // Validate before touching anything so a bad trigger leaves the job intact
        let rescheduled = match &patch.trigger {
            Some(trigger) => Some(trigger.first_fire(now)?),
            None => None,
        };

        let job = &mut entry.job;
        if let Some(name) = &patch.name {
            job.name = name.clone();
        }
        if let Some(trigger) = &patch.trigger {
            job.trigger = trigger.clone();
        }
        if let Some(args) = &patch.args {
            job.args = args.clone();
        }
        if let Some(kwargs) = &patch.kwargs {
            job.kwargs = kwargs.clone();
        }
        if let Some(max_instances) = patch.max_instances {
            job.max_instances = max_instances;
        }
        if let Some(grace) = patch.misfire_grace_seconds {
            job.misfire_grace_seconds = grace;
        }
        if let Some(first) = rescheduled {
            if !job.paused {
                job.next_run_time = Some(first);
            }
        }

        Ok(job.clone())
    }

    fn set_paused(&self, id: &str, paused: bool, now: DateTime<Utc>) -> Result<Job, SchedulerError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        let job = &mut entry.job;

        if job.paused == paused {
            return Ok(job.clone());
        }

        job.paused = paused;
        if paused {
            job.next_run_time = None;
            return Ok(job.clone());
        }

        match job.trigger.next_fire(now) {
            Ok(next) => {
                job.next_run_time = next;
                Ok(job.clone())
            }
            Err(e) => {
                job.next_run_time = None;
                warn!(job_id = %id, error = %e, "resumed job cannot be scheduled");
                Err(e.into())
            }
        }
    }

    fn due_jobs(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut due: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.job.is_due(now))
            .map(|entry| entry.job.clone())
            .collect();
        due.sort_by(|a, b| {
            a.next_run_time
                .cmp(&b.next_run_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        due
    }

    fn advance(&self, id: &str, from: DateTime<Utc>) -> Result<Advanced, SchedulerError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        let job = &mut entry.job;

        if job.next_run_time != Some(from) {
            debug!(job_id = %id, expected = %from, next_run_time = ?job.next_run_time, "slot already moved");
            return Ok(Advanced::Superseded);
        }

        match job.trigger.next_fire(from) {
            Ok(next) => {
                job.next_run_time = next;
                debug!(job_id = %id, next_run_time = ?next, "advanced job");
                Ok(next.map_or(Advanced::Exhausted, Advanced::Next))
            }
            Err(e) => {
                job.next_run_time = None;
                Err(e.into())
            }
        }
    }

    fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .iter()
            .filter(|entry| !entry.job.paused)
            .filter_map(|entry| entry.job.next_run_time)
            .min()
    }

    fn try_acquire(&self, id: &str) -> Result<u64, SchedulerError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        let seq = entry.seq;
        let job = &mut entry.job;

        if job.currently_running >= job.max_instances {
            return Err(SchedulerError::Busy {
                job_id: id.to_string(),
                running: job.currently_running,
                max_instances: job.max_instances,
            });
        }

        job.currently_running += 1;
        Ok(seq)
    }

    fn release(&self, id: &str, generation: u64) {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            if entry.seq == generation {
                entry.job.currently_running = entry.job.currently_running.saturating_sub(1);
            }
        }
    }

    fn running_instances(&self) -> usize {
        self.jobs
            .iter()
            .map(|entry| entry.job.currently_running as usize)
            .sum()
    }
}

/// One running instance of a job. Dropping it releases the instance.
pub struct InstanceGuard {
    store: Arc<dyn JobStore>,
    job_id: String,
    generation: u64,
}

impl InstanceGuard {
    /// Reserve an instance slot, failing with [`SchedulerError::Busy`] at the ceiling.
    pub fn acquire(store: &Arc<dyn JobStore>, job_id: &str) -> Result<Self, SchedulerError> {
        let generation = store.try_acquire(job_id)?;
        Ok(Self {
            store: Arc::clone(store),
            job_id: job_id.to_string(),
            generation,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.store.release(&self.job_id, self.generation);
    }
}

impl std::fmt::Debug for InstanceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceGuard")
            .field("job_id", &self.job_id)
            .field("generation", &self.generation)
            .finish()
    }
}
