// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use serde::Serialize;
use tera::Context;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::services::walltime;
use crate::app::types::{ProcessLayout, SchedulerFamily};

const LAUNCHER: &str = r#"#!/bin/sh
cd {{ remote_dir }} || exit 1
{% for module in modules %}module load {{ module }}
{% endfor %}{{ command }}
status=$?
echo "$status" > {{ exit_file }}
exit "$status"
"#;

const PBS_SCRIPT: &str = r#"#!/bin/sh
#PBS -N {{ job_name }}
#PBS -o {{ stdout }}
#PBS -e {{ stderr }}
#PBS -l nodes={{ nodes }}:ppn={{ ppn }}
{% if walltime %}#PBS -l walltime={{ walltime }}
{% endif %}#PBS -m n
sh {{ launcher }}
"#;

const SLURM_SCRIPT: &str = r#"#!/bin/sh
#SBATCH --job-name={{ job_name }}
#SBATCH --output={{ stdout }}
#SBATCH --error={{ stderr }}
#SBATCH --nodes={{ nodes }}
#SBATCH --ntasks={{ processes }}
#SBATCH --cpus-per-task={{ threads }}
{% if walltime %}#SBATCH --time={{ walltime }}
{% endif %}sh {{ launcher }}
"#;

/// Values for `run.sh`. Paths must already be shell-escaped; `command` is
/// inserted verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct LauncherValues {
    pub remote_dir: String,
    pub modules: Vec<String>,
    pub command: String,
    pub exit_file: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchValues {
    pub job_name: String,
    pub stdout: String,
    pub stderr: String,
    pub launcher: String,
    pub nodes: u32,
    pub ppn: u32,
    pub processes: u32,
    pub threads: u32,
    pub walltime: Option<String>,
}

impl BatchValues {
    pub fn new(
        job_name: &str,
        layout: &ProcessLayout,
        launcher: String,
        stdout: String,
        stderr: String,
    ) -> Self {
        Self {
            job_name: sanitize_job_name(job_name),
            stdout,
            stderr,
            launcher,
            nodes: layout.nodes,
            ppn: layout.ppn,
            processes: layout.processes,
            threads: layout.threads_per_process,
            walltime: None,
        }
    }
}

/// Shell launcher that runs the simulator and records its exit status.
pub fn render_launcher(values: &LauncherValues) -> AppResult<String> {
    if values.command.trim().is_empty() {
        return Err(malformed("job script has no command"));
    }
    single_line(&[&values.remote_dir, &values.command, &values.exit_file])?;
    if values
        .modules
        .iter()
        .any(|m| m.trim().is_empty() || m.contains(['\n', ';', '&', '|']))
    {
        return Err(malformed("invalid module name"));
    }
    render(LAUNCHER, values)
}

/// Batch script for the given scheduler family, embedding the walltime
/// when one is requested.
pub fn render_batch(
    family: SchedulerFamily,
    values: &BatchValues,
    requested: Option<Duration>,
) -> AppResult<String> {
    single_line(&[
        &values.job_name,
        &values.stdout,
        &values.stderr,
        &values.launcher,
    ])?;
    if values.nodes == 0 || values.ppn == 0 {
        return Err(malformed("job script needs at least one node and core"));
    }
    let (template, walltime) = match family {
        SchedulerFamily::Pbs => (PBS_SCRIPT, requested.map(walltime::format_pbs)),
        SchedulerFamily::Slurm => (SLURM_SCRIPT, requested.map(walltime::format_slurm)),
    };
    let values = BatchValues {
        walltime,
        ..values.clone()
    };
    render(template, &values)
}

/// Scheduler-safe job name: letters, digits, dash and underscore.
pub fn sanitize_job_name(raw: &str) -> String {
    let name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "simulation".to_string()
    } else {
        name
    }
}

fn render<T: Serialize>(template: &str, values: &T) -> AppResult<String> {
    let context = Context::from_serialize(values)
        .map_err(|err| malformed(format!("failed to build job script context: {err}")))?;
    tera::Tera::one_off(template, &context, false)
        .map_err(|err| malformed(format!("job script render failed: {err}")))
}

fn single_line(values: &[&String]) -> AppResult<()> {
    if values.iter().any(|value| value.contains(['\n', '\r'])) {
        return Err(malformed("job script values must not contain newlines"));
    }
    Ok(())
}

fn malformed(message: impl Into<String>) -> AppError {
    AppError::with_message(
        AppErrorKind::Submission,
        codes::MALFORMED_JOB_SCRIPT,
        message,
    )
}
