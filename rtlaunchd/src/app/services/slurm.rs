// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::types::JobState;

pub fn sbatch_command(script_path: &str) -> String {
    format!("sbatch {}", super::shell::sh_escape(script_path))
}

pub fn sacct_command(job_id: &str) -> String {
    format!("sacct -j {job_id} -n -P -o State")
}

pub fn squeue_command(job_id: &str) -> String {
    format!("squeue -j {job_id} -h -o %T")
}

pub fn scancel_command(job_id: &str) -> String {
    format!("scancel {job_id}")
}

/// Parse sbatch output such as "Submitted batch job 11".
pub fn parse_job_id(output: &str) -> Option<String> {
    let marker = "job ";
    output.lines().find_map(|line| {
        let idx = line.find(marker)?;
        let id = line[idx + marker.len()..].trim();
        id.parse::<u64>().ok().map(|_| id.to_string())
    })
}

pub fn parse_sacct_states(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let state = line.split('|').next().unwrap_or(line).trim();
            if state.is_empty() {
                None
            } else {
                Some(state.to_string())
            }
        })
        .collect()
}

/// Terminal state of a job from sacct output, considering every step.
/// Any non-COMPLETED terminal step wins over COMPLETED.
pub fn sacct_terminal_state(output: &str) -> Option<String> {
    let states = parse_sacct_states(output);
    if states.is_empty() {
        return None;
    }
    let mut normalized = Vec::with_capacity(states.len());
    for state in states {
        let token = normalize_slurm_state(&state);
        if is_slurm_state_active(&token) || !is_slurm_state_terminal(&token) {
            return None;
        }
        normalized.push(token);
    }
    if normalized.iter().all(|state| state == "COMPLETED") {
        return Some("COMPLETED".to_string());
    }
    normalized.into_iter().find(|state| state != "COMPLETED")
}

pub fn parse_squeue_state(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(normalize_slurm_state)
}

pub fn is_invalid_job_id(text: &str) -> bool {
    text.to_ascii_lowercase().contains("invalid job id")
}

/// Map a native Slurm state onto the job lifecycle.
pub fn map_state(state: &str) -> Option<JobState> {
    let state = normalize_slurm_state(state);
    let mapped = match state.as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "SUSPENDED"
        | "RESV_DEL_HOLD" | "RESIZING" | "STAGE_IN" => JobState::Pending,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" => JobState::Running,
        "COMPLETED" => JobState::Succeeded,
        "TIMEOUT" | "DEADLINE" => JobState::TimedOut,
        "CANCELLED" | "REVOKED" => JobState::Cancelled,
        "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "PREEMPTED" | "SPECIAL_EXIT" => {
            JobState::Failed
        }
        _ => return None,
    };
    Some(mapped)
}

fn normalize_slurm_state(state: &str) -> String {
    let token = state
        .split(|c| c == '+' || c == ':' || c == '(' || c == ' ')
        .next()
        .unwrap_or(state)
        .trim();
    token.to_ascii_uppercase()
}

fn is_slurm_state_active(state: &str) -> bool {
    matches!(
        state,
        "PENDING"
            | "RUNNING"
            | "CONFIGURING"
            | "COMPLETING"
            | "SUSPENDED"
            | "RESIZING"
            | "REQUEUED"
            | "STAGE_OUT"
            | "STAGE_IN"
            | "SIGNALING"
    )
}

fn is_slurm_state_terminal(state: &str) -> bool {
    matches!(
        state,
        "COMPLETED"
            | "CANCELLED"
            | "FAILED"
            | "TIMEOUT"
            | "NODE_FAIL"
            | "PREEMPTED"
            | "BOOT_FAIL"
            | "OUT_OF_MEMORY"
            | "DEADLINE"
            | "SPECIAL_EXIT"
            | "REVOKED"
    )
}
