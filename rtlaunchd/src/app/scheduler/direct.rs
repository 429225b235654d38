// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use time::OffsetDateTime;

use crate::app::errors::{AppResult, remote_error};
use crate::app::ports::RemoteSession;
use crate::app::services::shell::{remote_join, sh_escape};
use crate::app::types::{Job, JobState, NewJob};

use super::{missing_handle, parse_exit_line, settled_state, submission_rejected};

/// Start `run.sh` detached from the login session and record its pid.
pub(super) async fn launch(
    session: &dyn RemoteSession,
    job: &mut NewJob,
    launcher: &str,
) -> AppResult<()> {
    let command = format!(
        "cd {dir} && setsid nohup sh {launcher} > {stdout} 2> {stderr} < /dev/null & echo $!",
        dir = sh_escape(&job.remote_dir),
        launcher = sh_escape(launcher),
        stdout = sh_escape(&remote_join(&job.remote_dir, "job.out")),
        stderr = sh_escape(&remote_join(&job.remote_dir, "job.err")),
    );
    let capture = session.exec_capture(&command).await?;
    if capture.exit_code != 0 {
        return Err(submission_rejected(format!(
            "failed to start simulation: {}",
            capture.stderr_text().trim()
        )));
    }
    let stdout = capture.stdout_text();
    let pid = stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .and_then(|line| line.parse::<i64>().ok())
        .filter(|pid| *pid > 0)
        .ok_or_else(|| submission_rejected(format!("no process id in launch output: {stdout:?}")))?;
    tracing::info!(run = %job.name, pid, "simulation started");
    job.remote_pid = Some(pid);
    job.state = JobState::Running;
    Ok(())
}

pub(super) async fn poll(
    session: &dyn RemoteSession,
    job: &Job,
    now: OffsetDateTime,
) -> AppResult<JobState> {
    let pid = job
        .remote_pid
        .ok_or_else(|| missing_handle(job, "process id"))?;
    let exit_file = sh_escape(&job.exit_code_path());
    let command = format!(
        "if kill -0 {pid} 2>/dev/null; then echo running; elif [ -f {exit_file} ]; then echo \"exit $(cat {exit_file})\"; else echo gone; fi"
    );
    let capture = session.exec_capture(&command).await?;
    let stdout = capture.stdout_text();
    let last = stdout.lines().map(str::trim).rfind(|line| !line.is_empty());
    match last {
        Some("running") => Ok(JobState::Running),
        Some("gone") => settled_state(session, job, now).await,
        Some(line) if line.starts_with("exit") => {
            parse_exit_line(line).ok_or_else(|| remote_error(format!("unexpected status output: {line}")))
        }
        _ => Err(remote_error(format!(
            "unexpected process status output: {:?}",
            stdout.trim()
        ))),
    }
}

/// Signal the whole process group started by `setsid`, falling back to the
/// launcher pid alone.
pub(super) fn cancel_command(job: &Job) -> AppResult<String> {
    let pid = job
        .remote_pid
        .ok_or_else(|| missing_handle(job, "process id"))?;
    Ok(format!(
        "kill -TERM -- -{pid} 2>/dev/null || kill -TERM {pid}"
    ))
}
