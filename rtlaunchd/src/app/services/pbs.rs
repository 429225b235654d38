// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::types::JobState;

/// Torque exit status for a job killed at its walltime limit.
pub const EXIT_WALLTIME_EXCEEDED: i32 = -11;
/// 256 + SIGTERM: the job was deleted while running.
pub const EXIT_DELETED: i32 = 271;

pub fn qsub_command(script_path: &str) -> String {
    format!("qsub {}", super::shell::sh_escape(script_path))
}

pub fn qstat_command(job_id: &str) -> String {
    format!("qstat -f {job_id}")
}

pub fn qdel_command(job_id: &str) -> String {
    format!("qdel {job_id}")
}

/// The job id is the first non-empty line printed by qsub,
/// e.g. "123456.master15.delcatty.gent.vsc".
pub fn parse_qsub_id(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .filter(|line| !line.contains(char::is_whitespace))
        .map(str::to_string)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QstatRecord {
    pub job_state: Option<String>,
    pub exit_status: Option<i32>,
}

/// Extract the fields we care about from `qstat -f` output.
pub fn parse_qstat_full(output: &str) -> QstatRecord {
    let mut record = QstatRecord::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            "job_state" => record.job_state = Some(value.to_ascii_uppercase()),
            "exit_status" => record.exit_status = value.parse().ok(),
            _ => {}
        }
    }
    record
}

pub fn map_record(record: &QstatRecord) -> Option<JobState> {
    let state = record.job_state.as_deref()?;
    let mapped = match state {
        "Q" | "H" | "W" | "T" | "S" | "B" => JobState::Pending,
        "R" | "E" => JobState::Running,
        "C" | "F" => match record.exit_status {
            Some(0) => JobState::Succeeded,
            Some(EXIT_WALLTIME_EXCEEDED) => JobState::TimedOut,
            Some(EXIT_DELETED) => JobState::Cancelled,
            // Completed without an exit status: never started.
            None => JobState::Cancelled,
            Some(_) => JobState::Failed,
        },
        _ => return None,
    };
    Some(mapped)
}

/// PBS Pro reports `X` for a finished subjob. It carries no usable exit
/// status, so the run files decide the outcome.
pub fn is_finished_subjob(record: &QstatRecord) -> bool {
    record.job_state.as_deref() == Some("X")
}

/// The server forgets jobs some time after completion.
pub fn is_unknown_job(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    lowered.contains("unknown job id") || lowered.contains("job has finished")
}
