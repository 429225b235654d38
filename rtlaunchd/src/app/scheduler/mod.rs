// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Job submission styles behind one contract.
//!
//! Both variants stage the run the same way: a run directory under the
//! host's scratch path with the bundle in `in/`, an output directory, and a
//! `run.sh` launcher that records the simulator's exit status. They differ
//! in how `run.sh` is started and how its state is observed.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use time::OffsetDateTime;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes, invalid_argument};
use crate::app::ports::RemoteSession;
use crate::app::services::scripts::{self, LauncherValues};
use crate::app::services::shell::{remote_join, sh_escape};
use crate::app::services::simlog::{self, LogOutcome, Progress};
use crate::app::services::{layout, mpi, quota, random};
use crate::app::types::{
    ArtifactSet, HostProfile, Job, JobState, NewJob, SchedulerFamily, SchedulerKind, Submission,
};

mod batch;
mod direct;

const LAUNCHER_FILE: &str = "run.sh";
const LOG_TAIL_LINES: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerAdapter {
    /// Detached background process under the login session.
    Direct,
    /// Script handed to the cluster's queueing system.
    Batch(SchedulerFamily),
}

impl SchedulerAdapter {
    pub fn for_host(host: &HostProfile) -> Self {
        Self::for_kind(host.scheduler_kind())
    }

    pub fn for_kind(kind: SchedulerKind) -> Self {
        match kind {
            SchedulerKind::Direct => SchedulerAdapter::Direct,
            SchedulerKind::Batch(family) => SchedulerAdapter::Batch(family),
        }
    }

    pub fn kind(self) -> SchedulerKind {
        match self {
            SchedulerAdapter::Direct => SchedulerKind::Direct,
            SchedulerAdapter::Batch(family) => SchedulerKind::Batch(family),
        }
    }

    /// Decide where and how a submission will run on `host`. Nothing
    /// remote happens here.
    pub fn prepare(
        self,
        host: &HostProfile,
        submission: &Submission,
        submitted_at: OffsetDateTime,
    ) -> AppResult<NewJob> {
        let prefix = submission.bundle.prefix();
        file_name(&submission.bundle.description)?;
        let name = random::run_directory_name(&prefix);
        let remote_dir = remote_join(&host.scratch_path, &name);
        let remote_output_dir = match host.output_path.as_deref() {
            Some(base) => remote_join(base, &name),
            None => remote_join(&remote_dir, "out"),
        };
        Ok(NewJob {
            host_name: host.name.clone(),
            name,
            prefix,
            kind: self.kind(),
            remote_dir,
            remote_output_dir,
            local_output_dir: submission.bundle.local_output_dir.clone(),
            layout: layout::for_host(host, submission.parallelization),
            walltime: host.effective_walltime(),
            retrieve: submission.retrieve.clone(),
            submitted_at,
            state: JobState::Pending,
            scheduler_id: None,
            remote_pid: None,
        })
    }

    /// Stage the bundle and start the run. On success `job` carries the
    /// initial state: `Running` for Direct, `Pending` for Batch.
    #[tracing::instrument(
        name = "scheduler",
        level = "debug",
        skip(self, session, host, submission, job),
        fields(op = "submit", host = %host.name, kind = self.kind().as_str(), run = %job.name)
    )]
    pub async fn submit(
        self,
        session: &dyn RemoteSession,
        host: &HostProfile,
        submission: &Submission,
        job: &mut NewJob,
    ) -> AppResult<()> {
        let launcher = stage(session, host, submission, job).await?;
        match self {
            SchedulerAdapter::Direct => direct::launch(session, job, &launcher).await,
            SchedulerAdapter::Batch(family) => {
                batch::submit(session, family, job, &launcher).await
            }
        }
    }

    /// Ask the remote side where the job stands. Transport failures are
    /// returned as errors and never mapped onto a job state.
    #[tracing::instrument(
        name = "scheduler",
        level = "debug",
        skip(self, session, job),
        fields(op = "poll_status", host = %job.host_name, job_id = job.id)
    )]
    pub async fn poll_status(
        self,
        session: &dyn RemoteSession,
        job: &Job,
        now: OffsetDateTime,
    ) -> AppResult<JobState> {
        match self {
            SchedulerAdapter::Direct => direct::poll(session, job, now).await,
            SchedulerAdapter::Batch(family) => batch::poll(session, family, job, now).await,
        }
    }

    /// Best-effort remote cancellation. A refusal from the remote side is
    /// logged, not returned.
    #[tracing::instrument(
        name = "scheduler",
        level = "debug",
        skip(self, session, job),
        fields(op = "cancel", host = %job.host_name, job_id = job.id)
    )]
    pub async fn cancel(self, session: &dyn RemoteSession, job: &Job) -> AppResult<()> {
        let command = match self {
            SchedulerAdapter::Direct => direct::cancel_command(job)?,
            SchedulerAdapter::Batch(family) => batch::cancel_command(family, job)?,
        };
        let capture = session.exec_capture(&command).await?;
        if capture.exit_code != 0 {
            tracing::warn!(
                job_id = job.id,
                exit_code = capture.exit_code,
                "remote cancel not confirmed: {}",
                capture.stderr_text().trim()
            );
        }
        Ok(())
    }

    /// Download the matching output files into the job's local output
    /// directory.
    #[tracing::instrument(
        name = "scheduler",
        level = "debug",
        skip(self, session, job),
        fields(op = "fetch_output", host = %job.host_name, job_id = job.id)
    )]
    pub async fn fetch_output(self, session: &dyn RemoteSession, job: &Job) -> AppResult<ArtifactSet> {
        let entries = match session.list_dir(&job.remote_output_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == AppErrorKind::NotFound => {
                return Err(output_missing(format!(
                    "output directory {} does not exist",
                    job.remote_output_dir
                )));
            }
            Err(err) => return Err(err),
        };
        let matcher = build_matcher(&job.retrieve.patterns)?;
        let mut names: Vec<String> = entries
            .into_iter()
            .filter(|entry| !entry.is_dir)
            .map(|entry| entry.name)
            .filter(|name| matcher.as_ref().is_none_or(|set| set.is_match(name)))
            .collect();
        names.sort();
        if names.is_empty() {
            return Err(output_missing(format!(
                "no output files in {}",
                job.remote_output_dir
            )));
        }

        let root = job.local_output_dir.clone();
        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let local = root.join(&name);
            session
                .download(&remote_join(&job.remote_output_dir, &name), &local)
                .await?;
            files.push(local);
        }

        if job.retrieve.remove_remote {
            remove_remote(session, job).await?;
        }
        Ok(ArtifactSet { root, files })
    }

    /// Progress of a running simulation, read from its log.
    pub async fn progress(
        self,
        session: &dyn RemoteSession,
        job: &Job,
    ) -> AppResult<Option<Progress>> {
        let Some(log) = read_log(session, job).await? else {
            return Ok(None);
        };
        Ok(simlog::progress(&log))
    }
}

async fn stage(
    session: &dyn RemoteSession,
    host: &HostProfile,
    submission: &Submission,
    job: &NewJob,
) -> AppResult<String> {
    if let Some(minimum) = host.minimum_free_space_mb {
        check_free_space(session, &host.scratch_path, minimum).await?;
    }

    let input_dir = remote_join(&job.remote_dir, "in");
    session.create_dir_all(&input_dir).await?;
    session.create_dir_all(&job.remote_output_dir).await?;

    let bundle = &submission.bundle;
    let description = remote_join(&input_dir, &file_name(&bundle.description)?);
    session.upload(&bundle.description, &description).await?;
    for input in &bundle.inputs {
        session
            .upload(input, &remote_join(&input_dir, &file_name(input)?))
            .await?;
    }

    let command = mpi::simulator_command(
        host,
        &job.layout,
        &description,
        &input_dir,
        &job.remote_output_dir,
    );
    let script = scripts::render_launcher(&LauncherValues {
        remote_dir: sh_escape(&job.remote_dir),
        modules: host.modules.clone(),
        command,
        exit_file: sh_escape(&exit_code_path(&job.remote_dir)),
    })?;
    let launcher = remote_join(&job.remote_dir, LAUNCHER_FILE);
    session
        .write_file(&launcher, script.as_bytes(), 0o700)
        .await?;
    tracing::debug!(run = %job.name, "staged run directory");
    Ok(launcher)
}

async fn check_free_space(
    session: &dyn RemoteSession,
    path: &str,
    minimum_mb: u64,
) -> AppResult<()> {
    let capture = session.exec_capture(&quota::df_command(path)).await?;
    let available = (capture.exit_code == 0)
        .then(|| quota::parse_available_mb(&capture.stdout_text()))
        .flatten();
    match available {
        Some(available) if available < minimum_mb => Err(AppError::with_message(
            AppErrorKind::Submission,
            codes::QUOTA_EXCEEDED,
            format!("{available} MB free in {path}, {minimum_mb} MB required"),
        )),
        Some(_) => Ok(()),
        None => {
            tracing::warn!(path, "could not determine free space, continuing");
            Ok(())
        }
    }
}

fn exit_code_path(remote_dir: &str) -> String {
    remote_join(remote_dir, ".exit_code")
}

/// Final state of a run that is no longer known to the process table or
/// the queue: the recorded exit status, else what the log says.
async fn settled_state(
    session: &dyn RemoteSession,
    job: &Job,
    now: OffsetDateTime,
) -> AppResult<JobState> {
    let exit_file = sh_escape(&job.exit_code_path());
    let command = format!("if [ -f {exit_file} ]; then echo \"exit $(cat {exit_file})\"; else echo gone; fi");
    let capture = session.exec_capture(&command).await?;
    let stdout = capture.stdout_text();
    match parse_exit_line(&stdout) {
        Some(state) => Ok(state),
        None => state_from_log(session, job, now).await,
    }
}

/// "exit N" as printed by the status checks. A non-numeric status means the
/// launcher was interrupted while writing it.
fn parse_exit_line(output: &str) -> Option<JobState> {
    let line = output.lines().map(str::trim).rfind(|line| !line.is_empty())?;
    let status = line.strip_prefix("exit")?.trim();
    Some(match status.parse::<i32>() {
        Ok(0) => JobState::Succeeded,
        _ => JobState::Failed,
    })
}

async fn state_from_log(
    session: &dyn RemoteSession,
    job: &Job,
    now: OffsetDateTime,
) -> AppResult<JobState> {
    let Some(log) = read_log(session, job).await? else {
        tracing::info!(job_id = job.id, "no exit status and no log: run never started");
        return Ok(JobState::Cancelled);
    };
    Ok(match simlog::classify(&log, &job.prefix) {
        LogOutcome::Finished => JobState::Succeeded,
        LogOutcome::Crashed => JobState::Failed,
        LogOutcome::Unfinished if walltime_spent(job, now) => {
            tracing::info!(job_id = job.id, "run stopped mid-simulation after its walltime");
            JobState::TimedOut
        }
        LogOutcome::Unfinished => JobState::Failed,
    })
}

/// Whether the run has been running for at least its walltime. The launcher
/// is killed without writing an exit status when a limit is enforced.
fn walltime_spent(job: &Job, now: OffsetDateTime) -> bool {
    let Some(walltime) = job.walltime else {
        return false;
    };
    let started = job.running_since.unwrap_or(job.submitted_at);
    match time::Duration::try_from(walltime) {
        Ok(walltime) => started
            .checked_add(walltime)
            .is_some_and(|deadline| deadline <= now),
        Err(_) => false,
    }
}

async fn read_log(session: &dyn RemoteSession, job: &Job) -> AppResult<Option<String>> {
    let command = format!("tail -n {LOG_TAIL_LINES} {}", sh_escape(&job.log_path()));
    let capture = session.exec_capture(&command).await?;
    if capture.exit_code != 0 {
        return Ok(None);
    }
    Ok(Some(capture.stdout_text()))
}

async fn remove_remote(session: &dyn RemoteSession, job: &Job) -> AppResult<()> {
    let mut command = format!("rm -rf {}", sh_escape(&job.remote_dir));
    if !job.remote_output_dir.starts_with(&format!("{}/", job.remote_dir)) {
        command.push(' ');
        command.push_str(&sh_escape(&job.remote_output_dir));
    }
    let capture = session.exec_capture(&command).await?;
    if capture.exit_code != 0 {
        tracing::warn!(job_id = job.id, "failed to remove remote run directory: {}", capture.stderr_text().trim());
    }
    Ok(())
}

fn build_matcher(patterns: &[String]) -> AppResult<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|err| invalid_argument(format!("invalid retrieve pattern {pattern}: {err}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|err| invalid_argument(format!("invalid retrieve patterns: {err}")))
}

fn file_name(path: &Path) -> AppResult<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| invalid_argument(format!("{} has no file name", path.display())))
}

fn output_missing(message: String) -> AppError {
    AppError::with_message(AppErrorKind::Output, codes::OUTPUT_MISSING, message)
}

fn submission_rejected(message: String) -> AppError {
    AppError::with_message(AppErrorKind::Submission, codes::SUBMISSION_REJECTED, message)
}

fn missing_handle(job: &Job, what: &str) -> AppError {
    AppError::with_message(
        AppErrorKind::Internal,
        codes::INTERNAL_ERROR,
        format!("job {} has no {what}", job.id),
    )
}
