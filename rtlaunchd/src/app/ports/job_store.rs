// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::app::errors::AppResult;
use crate::app::types::{Job, JobTransition, NewJob};

#[async_trait]
pub trait JobStorePort: Send + Sync {
    /// Persist a new job together with its initial transition; returns the id.
    async fn insert_job(&self, job: &NewJob) -> AppResult<i64>;
    /// Persist the job's current state and append it to the transition log.
    async fn record_transition(&self, job: &Job, at: OffsetDateTime) -> AppResult<()>;
    /// Persist bookkeeping fields that do not change the state.
    async fn save_job(&self, job: &Job) -> AppResult<()>;
    /// Every job, oldest first.
    async fn list_jobs(&self) -> AppResult<Vec<Job>>;
    async fn transitions(&self, job_id: i64) -> AppResult<Vec<JobTransition>>;
}
