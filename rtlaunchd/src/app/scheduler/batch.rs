// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use time::OffsetDateTime;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes, remote_error};
use crate::app::ports::RemoteSession;
use crate::app::services::scripts::{self, BatchValues};
use crate::app::services::shell::{remote_join, sh_escape};
use crate::app::services::{pbs, slurm};
use crate::app::types::{Job, JobState, NewJob, SchedulerFamily};

use super::{missing_handle, settled_state, submission_rejected};

const SCRIPT_FILE: &str = "job.sh";

/// Write the queue script next to `run.sh` and hand it to the scheduler.
pub(super) async fn submit(
    session: &dyn RemoteSession,
    family: SchedulerFamily,
    job: &mut NewJob,
    launcher: &str,
) -> AppResult<()> {
    let values = BatchValues::new(
        &job.prefix,
        &job.layout,
        sh_escape(launcher),
        sh_escape(&remote_join(&job.remote_dir, "job.out")),
        sh_escape(&remote_join(&job.remote_dir, "job.err")),
    );
    let script = scripts::render_batch(family, &values, job.walltime)?;
    let script_path = remote_join(&job.remote_dir, SCRIPT_FILE);
    session
        .write_file(&script_path, script.as_bytes(), 0o600)
        .await?;

    let submit = match family {
        SchedulerFamily::Pbs => pbs::qsub_command(&script_path),
        SchedulerFamily::Slurm => slurm::sbatch_command(&script_path),
    };
    let command = format!("cd {} && {submit}", sh_escape(&job.remote_dir));
    let capture = session.exec_capture(&command).await?;
    let stderr = capture.stderr_text();
    if capture.exit_code != 0 {
        return Err(rejected(stderr.trim()));
    }
    let stdout = capture.stdout_text();
    let id = match family {
        SchedulerFamily::Pbs => pbs::parse_qsub_id(&stdout),
        SchedulerFamily::Slurm => slurm::parse_job_id(&stdout),
    }
    .ok_or_else(|| submission_rejected(format!("no job id in scheduler output: {stdout:?}")))?;

    tracing::info!(run = %job.name, scheduler = family.as_str(), scheduler_id = %id, "job queued");
    job.scheduler_id = Some(id);
    job.state = JobState::Pending;
    Ok(())
}

fn rejected(stderr: &str) -> AppError {
    if stderr.to_ascii_lowercase().contains("quota") {
        AppError::with_message(
            AppErrorKind::Submission,
            codes::QUOTA_EXCEEDED,
            format!("scheduler refused the job: {stderr}"),
        )
    } else {
        submission_rejected(format!("scheduler refused the job: {stderr}"))
    }
}

pub(super) async fn poll(
    session: &dyn RemoteSession,
    family: SchedulerFamily,
    job: &Job,
    now: OffsetDateTime,
) -> AppResult<JobState> {
    let id = scheduler_id(job)?;
    let state = match family {
        SchedulerFamily::Pbs => poll_pbs(session, id).await?,
        SchedulerFamily::Slurm => poll_slurm(session, id).await?,
    };
    match state {
        Some(state) => Ok(state),
        None => {
            tracing::debug!(job_id = job.id, scheduler_id = %id, "job left the queue, reading run files");
            settled_state(session, job, now).await
        }
    }
}

/// `None` when the server no longer knows the job.
async fn poll_pbs(session: &dyn RemoteSession, id: &str) -> AppResult<Option<JobState>> {
    let capture = session.exec_capture(&pbs::qstat_command(id)).await?;
    if capture.exit_code != 0 {
        let stderr = capture.stderr_text();
        if pbs::is_unknown_job(&stderr) {
            return Ok(None);
        }
        return Err(remote_error(format!("qstat failed: {}", stderr.trim())));
    }
    let record = pbs::parse_qstat_full(&capture.stdout_text());
    if record.job_state.is_none() || pbs::is_finished_subjob(&record) {
        return Ok(None);
    }
    pbs::map_record(&record).map(Some).ok_or_else(|| {
        remote_error(format!(
            "unrecognized PBS job state {:?}",
            record.job_state.as_deref().unwrap_or_default()
        ))
    })
}

/// Accounting first for settled jobs, then the live queue.
async fn poll_slurm(session: &dyn RemoteSession, id: &str) -> AppResult<Option<JobState>> {
    let sacct = session.exec_capture(&slurm::sacct_command(id)).await?;
    if sacct.exit_code == 0 {
        if let Some(state) = slurm::sacct_terminal_state(&sacct.stdout_text()) {
            return map_slurm(&state).map(Some);
        }
    } else {
        tracing::debug!(scheduler_id = %id, "sacct unavailable: {}", sacct.stderr_text().trim());
    }

    let squeue = session.exec_capture(&slurm::squeue_command(id)).await?;
    if squeue.exit_code != 0 {
        let stderr = squeue.stderr_text();
        if slurm::is_invalid_job_id(&stderr) {
            return Ok(None);
        }
        return Err(remote_error(format!("squeue failed: {}", stderr.trim())));
    }
    match slurm::parse_squeue_state(&squeue.stdout_text()) {
        Some(state) => map_slurm(&state).map(Some),
        None => Ok(None),
    }
}

fn map_slurm(state: &str) -> AppResult<JobState> {
    slurm::map_state(state)
        .ok_or_else(|| remote_error(format!("unrecognized Slurm job state {state:?}")))
}

pub(super) fn cancel_command(family: SchedulerFamily, job: &Job) -> AppResult<String> {
    let id = scheduler_id(job)?;
    Ok(match family {
        SchedulerFamily::Pbs => pbs::qdel_command(id),
        SchedulerFamily::Slurm => slurm::scancel_command(id),
    })
}

fn scheduler_id(job: &Job) -> AppResult<&str> {
    job.scheduler_id
        .as_deref()
        .ok_or_else(|| missing_handle(job, "scheduler job id"))
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use time::OffsetDateTime;

    use super::super::SchedulerAdapter;
    use super::super::tests::{job_from, submission};
    use crate::app::errors::codes;
    use crate::app::testing::{FakeSession, capture, host_profile};
    use crate::app::types::{HostProfile, Job, JobState, SchedulerFamily};

    fn cluster(family: SchedulerFamily) -> HostProfile {
        let mut host = host_profile("swalot");
        host.has_scheduler = true;
        host.scheduler_family = family;
        host.cores_per_node = Some(16);
        host.maximum_walltime = Some(Duration::from_secs(72 * 3600));
        host.preferred_walltime = Some(Duration::from_secs(100 * 3600));
        host
    }

    fn queued_job(family: SchedulerFamily, id: &str) -> Job {
        let host = cluster(family);
        let mut new = SchedulerAdapter::for_host(&host)
            .prepare(&host, &submission(Path::new("/tmp/out")), OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        new.scheduler_id = Some(id.to_string());
        job_from(new)
    }

    #[tokio::test]
    async fn pbs_submit_is_pending_with_capped_walltime() {
        let host = cluster(SchedulerFamily::Pbs);
        let sub = submission(Path::new("/tmp/out"));
        let adapter = SchedulerAdapter::for_host(&host);
        let mut new = adapter
            .prepare(&host, &sub, OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        let session = FakeSession::new(|cmd| {
            if cmd.contains("qsub") {
                capture(0, "123456.master15.delcatty.gent.vsc\n", "")
            } else {
                capture(0, "", "")
            }
        });

        adapter
            .submit(session.as_ref(), &host, &sub, &mut new)
            .await
            .unwrap();
        assert_eq!(new.state, JobState::Pending);
        assert_eq!(
            new.scheduler_id.as_deref(),
            Some("123456.master15.delcatty.gent.vsc")
        );
        let script = session
            .file(&format!("{}/job.sh", new.remote_dir))
            .unwrap();
        let script = String::from_utf8(script).unwrap();
        assert!(script.contains("#PBS -l walltime=72:00:00\n"));
        assert!(script.contains("#PBS -l nodes=1:ppn=8\n"));
    }

    #[tokio::test]
    async fn slurm_submit_parses_job_number() {
        let host = cluster(SchedulerFamily::Slurm);
        let sub = submission(Path::new("/tmp/out"));
        let mut new = SchedulerAdapter::for_host(&host)
            .prepare(&host, &sub, OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        let session = FakeSession::new(|cmd| {
            if cmd.contains("sbatch") {
                capture(0, "Submitted batch job 8812\n", "")
            } else {
                capture(0, "", "")
            }
        });
        SchedulerAdapter::for_host(&host)
            .submit(session.as_ref(), &host, &sub, &mut new)
            .await
            .unwrap();
        assert_eq!(new.scheduler_id.as_deref(), Some("8812"));
        assert_eq!(new.state, JobState::Pending);
    }

    #[tokio::test]
    async fn refused_submission_is_classified() {
        let host = cluster(SchedulerFamily::Pbs);
        let sub = submission(Path::new("/tmp/out"));
        let adapter = SchedulerAdapter::for_host(&host);
        let mut new = adapter
            .prepare(&host, &sub, OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        let session = FakeSession::new(|cmd| {
            if cmd.contains("qsub") {
                capture(1, "", "qsub: Disk quota exceeded for user ada\n")
            } else {
                capture(0, "", "")
            }
        });
        let err = adapter
            .submit(session.as_ref(), &host, &sub, &mut new)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::QUOTA_EXCEEDED);

        let session = FakeSession::new(|cmd| {
            if cmd.contains("qsub") {
                capture(1, "", "qsub: Job exceeds queue resource limits\n")
            } else {
                capture(0, "", "")
            }
        });
        let err = adapter
            .submit(session.as_ref(), &host, &sub, &mut new)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::SUBMISSION_REJECTED);
    }

    #[tokio::test]
    async fn pbs_states_map_onto_lifecycle() {
        let job = queued_job(SchedulerFamily::Pbs, "77.master");
        let adapter = SchedulerAdapter::Batch(SchedulerFamily::Pbs);
        let cases = [
            ("    job_state = Q\n", JobState::Pending),
            ("    job_state = R\n", JobState::Running),
            ("    job_state = C\n    exit_status = 0\n", JobState::Succeeded),
            ("    job_state = C\n    exit_status = -11\n", JobState::TimedOut),
            ("    job_state = C\n    exit_status = 271\n", JobState::Cancelled),
            ("    job_state = C\n    exit_status = 2\n", JobState::Failed),
        ];
        for (output, expected) in cases {
            let session = FakeSession::new(move |_| capture(0, output, ""));
            assert_eq!(
                adapter.poll_status(session.as_ref(), &job, job.submitted_at).await.unwrap(),
                expected,
                "{output}"
            );
        }
    }

    #[tokio::test]
    async fn finished_pbs_subjob_settles_from_exit_file() {
        let job = queued_job(SchedulerFamily::Pbs, "77.master");
        let session = FakeSession::new(|cmd| {
            if cmd.starts_with("qstat") {
                capture(0, "    job_state = X\n", "")
            } else if cmd.starts_with("if [ -f") {
                capture(0, "exit 3\n", "")
            } else {
                capture(0, "", "")
            }
        });
        assert_eq!(
            SchedulerAdapter::Batch(SchedulerFamily::Pbs)
                .poll_status(session.as_ref(), &job, job.submitted_at)
                .await
                .unwrap(),
            JobState::Failed
        );
        assert!(session.ran("if [ -f"));
    }

    #[tokio::test]
    async fn forgotten_pbs_job_falls_back_to_exit_file() {
        let job = queued_job(SchedulerFamily::Pbs, "77.master");
        let session = FakeSession::new(|cmd| {
            if cmd.starts_with("qstat") {
                capture(153, "", "qstat: Unknown Job Id 77.master\n")
            } else if cmd.starts_with("if [ -f") {
                capture(0, "exit 0\n", "")
            } else {
                capture(0, "", "")
            }
        });
        assert_eq!(
            SchedulerAdapter::Batch(SchedulerFamily::Pbs)
                .poll_status(session.as_ref(), &job, job.submitted_at)
                .await
                .unwrap(),
            JobState::Succeeded
        );
    }

    #[tokio::test]
    async fn slurm_prefers_accounting_then_queue() {
        let job = queued_job(SchedulerFamily::Slurm, "8812");
        let adapter = SchedulerAdapter::Batch(SchedulerFamily::Slurm);

        let session = FakeSession::new(|cmd| {
            if cmd.starts_with("sacct") {
                capture(0, "TIMEOUT\nCANCELLED by 0\n", "")
            } else {
                capture(0, "", "")
            }
        });
        assert_eq!(
            adapter.poll_status(session.as_ref(), &job, job.submitted_at).await.unwrap(),
            JobState::TimedOut
        );

        let session = FakeSession::new(|cmd| {
            if cmd.starts_with("sacct") {
                capture(0, "RUNNING\n", "")
            } else if cmd.starts_with("squeue") {
                capture(0, "RUNNING\n", "")
            } else {
                capture(0, "", "")
            }
        });
        assert_eq!(
            adapter.poll_status(session.as_ref(), &job, job.submitted_at).await.unwrap(),
            JobState::Running
        );
        assert!(session.ran("squeue -j 8812"));
    }

    #[tokio::test]
    async fn cancel_uses_scheduler_command() {
        let job = queued_job(SchedulerFamily::Slurm, "8812");
        let session = FakeSession::silent();
        SchedulerAdapter::Batch(SchedulerFamily::Slurm)
            .cancel(session.as_ref(), &job)
            .await
            .unwrap();
        assert_eq!(session.commands(), vec!["scancel 8812".to_string()]);
    }
}
