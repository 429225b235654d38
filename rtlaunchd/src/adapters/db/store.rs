// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use sqlx::{
    Row, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use std::{path::Path, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::app::types::{
    ArtifactSet, Job, JobState, JobTransition, NewJob, ProcessLayout, RetrieveOptions,
    SchedulerKind,
};

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("timestamp formatting error: {0}")]
    Format(#[from] time::error::Format),
    #[error("invalid timestamp in column {column}: {value}")]
    InvalidTimestamp { column: &'static str, value: String },
    #[error("invalid value in column {column}: {value}")]
    InvalidValue { column: &'static str, value: String },
    #[error("job not found: {0}")]
    JobNotFound(i64),
}

pub type Result<T> = std::result::Result<T, JobStoreError>;

/// Durable record of submitted jobs and their state history.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) a file-backed SQLite DB.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let url = format!("sqlite://{}", path_ref.to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store.
    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        // Improve concurrency for file DBs.
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        self.ensure_jobs_table().await?;
        self.ensure_transitions_table().await?;
        Ok(())
    }

    async fn ensure_jobs_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
            id integer primary key autoincrement,
            host_name text not null,
            name text not null,
            prefix text not null,
            scheduler_kind text not null,
            remote_dir text not null,
            remote_output_dir text not null,
            local_output_dir text not null,
            processes integer not null,
            threads_per_process integer not null,
            nodes integer not null,
            ppn integer not null,
            walltime_secs integer,
            retrieve text not null,
            submitted_at text not null,
            state text not null,
            scheduler_id text,
            remote_pid integer,
            running_since text,
            finished_at text,
            artifacts text,
            degraded boolean not null default 0,
            updated_at text not null default (strftime('%Y-%m-%dT%H:%M:%fZ','now')));
            CREATE INDEX IF NOT EXISTS idx_jobs_host_name ON jobs(host_name);
            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
    "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ensure_transitions_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_transitions (
            job_id integer not null references jobs(id) on delete cascade,
            seq integer not null,
            state text not null,
            recorded_at text not null,
            primary key (job_id, seq));
    "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a job and its initial state in one transaction.
    pub async fn insert_job(&self, job: &NewJob) -> Result<i64> {
        let submitted_at = format_ts(job.submitted_at)?;
        let retrieve = serde_json::to_string(&job.retrieve)?;
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            r#"
        insert into jobs(
            host_name, name, prefix, scheduler_kind, remote_dir, remote_output_dir,
            local_output_dir, processes, threads_per_process, nodes, ppn, walltime_secs,
            retrieve, submitted_at, state, scheduler_id, remote_pid
        )
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        returning id;
    "#,
        )
        .bind(job.host_name.clone())
        .bind(job.name.clone())
        .bind(job.prefix.clone())
        .bind(job.kind.as_str())
        .bind(job.remote_dir.clone())
        .bind(job.remote_output_dir.clone())
        .bind(job.local_output_dir.to_string_lossy().to_string())
        .bind(job.layout.processes)
        .bind(job.layout.threads_per_process)
        .bind(job.layout.nodes)
        .bind(job.layout.ppn)
        .bind(walltime_secs(job.walltime))
        .bind(retrieve)
        .bind(submitted_at.clone())
        .bind(job.state.as_str())
        .bind(job.scheduler_id.clone())
        .bind(job.remote_pid)
        .fetch_one(&mut *tx)
        .await?;
        let id = rec.try_get::<i64, _>("id")?;

        sqlx::query(
            "insert into job_transitions(job_id, seq, state, recorded_at) values (?1, 1, ?2, ?3)",
        )
        .bind(id)
        .bind(job.state.as_str())
        .bind(submitted_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Write the job row and append its state to the transition log.
    pub async fn record_transition(&self, job: &Job, at: OffsetDateTime) -> Result<()> {
        let recorded_at = format_ts(at)?;
        let mut tx = self.pool.begin().await?;
        write_job(&mut *tx, job).await?;
        sqlx::query(
            r#"
        insert into job_transitions(job_id, seq, state, recorded_at)
        values (
            ?1,
            (select coalesce(max(seq), 0) + 1 from job_transitions where job_id = ?1),
            ?2,
            ?3
        );
    "#,
        )
        .bind(job.id)
        .bind(job.state.as_str())
        .bind(recorded_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Write the job row without touching the transition log.
    pub async fn save_job(&self, job: &Job) -> Result<()> {
        write_job(&self.pool, job).await
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let row = sqlx::query("select * from jobs where id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query("select * from jobs order by id asc")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    pub async fn transitions(&self, job_id: i64) -> Result<Vec<JobTransition>> {
        let rows = sqlx::query(
            "select state, recorded_at from job_transitions where job_id = ?1 order by seq asc",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(JobTransition {
                    state: parse_state(row.try_get("state")?)?,
                    recorded_at: parse_ts("recorded_at", row.try_get("recorded_at")?)?,
                })
            })
            .collect()
    }
}

// -- helpers

async fn write_job<'c, E>(executor: E, job: &Job) -> Result<()>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let artifacts = job
        .artifacts
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let running_since = job.running_since.map(format_ts).transpose()?;
    let finished_at = job.finished_at.map(format_ts).transpose()?;
    let res = sqlx::query(
        r#"
        update jobs set
            state = ?2,
            scheduler_id = ?3,
            remote_pid = ?4,
            running_since = ?5,
            finished_at = ?6,
            artifacts = ?7,
            degraded = ?8,
            updated_at = ?9
        where id = ?1;
    "#,
    )
    .bind(job.id)
    .bind(job.state.as_str())
    .bind(job.scheduler_id.clone())
    .bind(job.remote_pid)
    .bind(running_since)
    .bind(finished_at)
    .bind(artifacts)
    .bind(job.degraded)
    .bind(now_rfc3339())
    .execute(executor)
    .await?;
    if res.rows_affected() == 0 {
        return Err(JobStoreError::JobNotFound(job.id));
    }
    Ok(())
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into())
}

fn format_ts(at: OffsetDateTime) -> Result<String> {
    Ok(at.format(&Rfc3339)?)
}

fn parse_ts(column: &'static str, value: String) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(&value, &Rfc3339)
        .map_err(|_| JobStoreError::InvalidTimestamp { column, value })
}

fn parse_opt_ts(column: &'static str, value: Option<String>) -> Result<Option<OffsetDateTime>> {
    value.map(|value| parse_ts(column, value)).transpose()
}

fn parse_state(value: String) -> Result<JobState> {
    value
        .parse::<JobState>()
        .map_err(|_| JobStoreError::InvalidValue {
            column: "state",
            value,
        })
}

fn walltime_secs(walltime: Option<Duration>) -> Option<i64> {
    walltime.map(|w| i64::try_from(w.as_secs()).unwrap_or(i64::MAX))
}

fn row_to_job(row: SqliteRow) -> Result<Job> {
    let kind: String = row.try_get("scheduler_kind")?;
    let kind = kind
        .parse::<SchedulerKind>()
        .map_err(|_| JobStoreError::InvalidValue {
            column: "scheduler_kind",
            value: kind,
        })?;
    let walltime = row
        .try_get::<Option<i64>, _>("walltime_secs")?
        .map(|secs| Duration::from_secs(secs.max(0) as u64));
    let retrieve: RetrieveOptions = serde_json::from_str(&row.try_get::<String, _>("retrieve")?)?;
    let artifacts = row
        .try_get::<Option<String>, _>("artifacts")?
        .map(|raw| serde_json::from_str::<ArtifactSet>(&raw))
        .transpose()?;

    Ok(Job {
        id: row.try_get("id")?,
        host_name: row.try_get("host_name")?,
        name: row.try_get("name")?,
        prefix: row.try_get("prefix")?,
        kind,
        remote_dir: row.try_get("remote_dir")?,
        remote_output_dir: row.try_get("remote_output_dir")?,
        local_output_dir: PathBuf::from(row.try_get::<String, _>("local_output_dir")?),
        layout: ProcessLayout {
            processes: row.try_get("processes")?,
            threads_per_process: row.try_get("threads_per_process")?,
            nodes: row.try_get("nodes")?,
            ppn: row.try_get("ppn")?,
        },
        walltime,
        retrieve,
        submitted_at: parse_ts("submitted_at", row.try_get("submitted_at")?)?,
        state: parse_state(row.try_get("state")?)?,
        scheduler_id: row.try_get("scheduler_id")?,
        remote_pid: row.try_get("remote_pid")?,
        running_since: parse_opt_ts("running_since", row.try_get("running_since")?)?,
        finished_at: parse_opt_ts("finished_at", row.try_get("finished_at")?)?,
        artifacts,
        degraded: row.try_get("degraded")?,
        progress: None,
    })
}
