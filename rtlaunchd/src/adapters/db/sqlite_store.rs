// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::adapters::db::{JobStore, JobStoreError};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::JobStorePort;
use crate::app::types::{Job, JobTransition, NewJob};

#[derive(Clone)]
pub struct SqliteStoreAdapter {
    store: Arc<JobStore>,
}

impl SqliteStoreAdapter {
    pub fn new(store: JobStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }
}

/// Persistence failures become store errors; a row the tracker asks for
/// but the database lacks is an integrity problem.
fn map_store_error(err: JobStoreError) -> AppError {
    match err {
        JobStoreError::JobNotFound(id) => AppError::with_message(
            AppErrorKind::Integrity,
            codes::UNKNOWN_JOB,
            format!("job {id} is missing from the job store"),
        ),
        other => AppError::with_message(
            AppErrorKind::Internal,
            codes::STORE_ERROR,
            other.to_string(),
        ),
    }
}

#[async_trait]
impl JobStorePort for SqliteStoreAdapter {
    async fn insert_job(&self, job: &NewJob) -> AppResult<i64> {
        self.store.insert_job(job).await.map_err(map_store_error)
    }

    async fn record_transition(&self, job: &Job, at: OffsetDateTime) -> AppResult<()> {
        self.store
            .record_transition(job, at)
            .await
            .map_err(map_store_error)
    }

    async fn save_job(&self, job: &Job) -> AppResult<()> {
        self.store.save_job(job).await.map_err(map_store_error)
    }

    async fn list_jobs(&self) -> AppResult<Vec<Job>> {
        self.store.list_jobs().await.map_err(map_store_error)
    }

    async fn transitions(&self, job_id: i64) -> AppResult<Vec<JobTransition>> {
        self.store
            .transitions(job_id)
            .await
            .map_err(map_store_error)
    }
}
