// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Registry of jobs. The tracker is the only writer of job state; every
//! accepted transition is persisted before it becomes visible.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes, unknown_job};
use crate::app::ports::{ClockPort, JobStorePort};
use crate::app::types::{ArtifactSet, Job, JobState, JobTransition, NewJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Changed { from: JobState },
    Unchanged,
}

pub struct JobTracker {
    store: Arc<dyn JobStorePort>,
    clock: Arc<dyn ClockPort>,
    jobs: RwLock<HashMap<i64, Arc<Mutex<Job>>>>,
    // Submission order.
    order: RwLock<Vec<i64>>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn JobStorePort>, clock: Arc<dyn ClockPort>) -> Self {
        Self {
            store,
            clock,
            jobs: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Replace the in-memory registry with the persisted jobs.
    pub async fn load(&self) -> AppResult<usize> {
        let persisted = self.store.list_jobs().await?;
        let mut jobs = self.jobs.write().await;
        let mut order = self.order.write().await;
        jobs.clear();
        order.clear();
        for job in persisted {
            order.push(job.id);
            jobs.insert(job.id, Arc::new(Mutex::new(job)));
        }
        tracing::debug!(jobs = order.len(), "job registry loaded");
        Ok(order.len())
    }

    pub async fn register(&self, new: NewJob) -> AppResult<Job> {
        let id = self.store.insert_job(&new).await?;
        let mut job = Job::from_new(id, new);
        if job.state == JobState::Running {
            job.running_since = Some(job.submitted_at);
            self.store.save_job(&job).await?;
        }
        tracing::info!(
            job_id = id,
            host = %job.host_name,
            state = %job.state,
            run = %job.name,
            "job registered"
        );
        self.jobs
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(job.clone())));
        self.order.write().await.push(id);
        Ok(job)
    }

    /// Move a job to `state`.
    ///
    /// Leaving a terminal state is an integrity error. Reports that would
    /// move the job backwards in its lifecycle are ignored, so observers
    /// never see states out of order.
    pub async fn update(&self, id: i64, state: JobState) -> AppResult<UpdateOutcome> {
        let entry = self.entry(id).await?;
        let mut job = entry.lock().await;
        let from = job.state;
        if from == state {
            return Ok(UpdateOutcome::Unchanged);
        }
        if from.is_terminal() {
            return Err(AppError::with_message(
                AppErrorKind::Integrity,
                codes::ILLEGAL_TRANSITION,
                format!("job {id} is {from}; cannot move to {state}"),
            ));
        }
        if state.rank() < from.rank() {
            tracing::debug!(job_id = id, from = %from, to = %state, "ignoring stale state report");
            return Ok(UpdateOutcome::Unchanged);
        }

        let now = self.clock.now_utc();
        let mut next = job.clone();
        next.state = state;
        if state == JobState::Running && next.running_since.is_none() {
            next.running_since = Some(now);
        }
        if state.is_terminal() {
            next.finished_at = Some(now);
            next.progress = None;
        }
        self.store.record_transition(&next, now).await?;
        *job = next;
        tracing::info!(job_id = id, host = %job.host_name, from = %from, to = %state, "job state changed");
        Ok(UpdateOutcome::Changed { from })
    }

    pub async fn get(&self, id: i64) -> AppResult<Job> {
        let entry = self.entry(id).await?;
        let job = entry.lock().await;
        Ok(job.clone())
    }

    /// Jobs on `host`, oldest submission first.
    pub async fn list(&self, host: &str) -> Vec<Job> {
        self.collect(|job| job.host_name == host).await
    }

    pub async fn list_all(&self) -> Vec<Job> {
        self.collect(|_| true).await
    }

    pub async fn outstanding(&self) -> Vec<Job> {
        self.collect(|job| !job.state.is_terminal()).await
    }

    pub async fn history(&self, id: i64) -> AppResult<Vec<JobTransition>> {
        self.entry(id).await?;
        self.store.transitions(id).await
    }

    /// Flag (or clear) a job whose last poll could not reach the host. The
    /// job state itself is left as it was.
    pub async fn set_degraded(&self, id: i64, degraded: bool) -> AppResult<()> {
        let entry = self.entry(id).await?;
        let mut job = entry.lock().await;
        if job.degraded == degraded {
            return Ok(());
        }
        let mut next = job.clone();
        next.degraded = degraded;
        self.store.save_job(&next).await?;
        *job = next;
        Ok(())
    }

    pub async fn set_artifacts(&self, id: i64, artifacts: ArtifactSet) -> AppResult<()> {
        let entry = self.entry(id).await?;
        let mut job = entry.lock().await;
        let mut next = job.clone();
        next.artifacts = Some(artifacts);
        self.store.save_job(&next).await?;
        *job = next;
        Ok(())
    }

    pub async fn set_progress(&self, id: i64, progress: Option<String>) -> AppResult<()> {
        let entry = self.entry(id).await?;
        let mut job = entry.lock().await;
        if !job.state.is_terminal() {
            job.progress = progress;
        }
        Ok(())
    }

    async fn entry(&self, id: i64) -> AppResult<Arc<Mutex<Job>>> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| unknown_job(id))
    }

    async fn collect(&self, keep: impl Fn(&Job) -> bool) -> Vec<Job> {
        let entries: Vec<Arc<Mutex<Job>>> = {
            let order = self.order.read().await;
            let jobs = self.jobs.read().await;
            order.iter().filter_map(|id| jobs.get(id).cloned()).collect()
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let job = entry.lock().await;
            if keep(&job) {
                out.push(job.clone());
            }
        }
        out
    }
}
