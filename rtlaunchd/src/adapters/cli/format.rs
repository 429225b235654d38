// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::app::types::{HostProfile, Job, JobTransition};
use crate::app::services::walltime;

pub fn format_json(value: serde_json::Value) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&value)?)
}

fn timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

fn opt_timestamp(at: Option<OffsetDateTime>) -> String {
    at.map(timestamp).unwrap_or_else(|| "-".to_string())
}

fn str_width(value: &str) -> usize {
    value.chars().count()
}

/// Left-aligned columns separated by two spaces.
fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| str_width(h)).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(str_width(cell));
        }
    }
    let line = |cells: Vec<&str>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect();
        let mut out = padded.join("  ").trim_end().to_string();
        out.push('\n');
        out
    };

    let mut output = line(headers.to_vec());
    for row in rows {
        output.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    output
}

fn job_handle(job: &Job) -> String {
    match (&job.scheduler_id, job.remote_pid) {
        (Some(id), _) => id.clone(),
        (None, Some(pid)) => format!("pid {pid}"),
        (None, None) => "-".to_string(),
    }
}

fn job_status(job: &Job) -> String {
    if job.degraded && !job.state.is_terminal() {
        format!("{} (degraded)", job.state)
    } else {
        job.state.to_string()
    }
}

pub fn job_to_json(job: &Job) -> serde_json::Value {
    json!({
        "job_id": job.id,
        "host": job.host_name.as_str(),
        "name": job.name.as_str(),
        "scheduler": job.kind.as_str(),
        "state": job.state.as_str(),
        "degraded": job.degraded,
        "scheduler_id": job.scheduler_id.as_deref(),
        "pid": job.remote_pid,
        "remote_dir": job.remote_dir.as_str(),
        "local_output_dir": job.local_output_dir.display().to_string(),
        "processes": job.layout.processes,
        "threads_per_process": job.layout.threads_per_process,
        "nodes": job.layout.nodes,
        "walltime_secs": job.walltime.map(|w| w.as_secs()),
        "submitted_at": timestamp(job.submitted_at),
        "running_since": job.running_since.map(timestamp),
        "finished_at": job.finished_at.map(timestamp),
        "progress": job.progress.as_deref(),
        "artifacts": job.artifacts.as_ref().map(|a| {
            a.files.iter().map(|f| a.root.join(f).display().to_string()).collect::<Vec<_>>()
        }),
    })
}

pub fn format_jobs_table(jobs: &[Job]) -> String {
    let headers = ["job id", "host", "name", "state", "handle", "submitted", "finished"];
    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|job| {
            vec![
                job.id.to_string(),
                job.host_name.clone(),
                job.name.clone(),
                job_status(job),
                job_handle(job),
                timestamp(job.submitted_at),
                opt_timestamp(job.finished_at),
            ]
        })
        .collect();
    render_table(&headers, &rows)
}

pub fn format_jobs_json(jobs: &[Job]) -> anyhow::Result<String> {
    format_json(serde_json::Value::Array(jobs.iter().map(job_to_json).collect()))
}

pub fn format_job_details(job: &Job) -> String {
    let walltime = job
        .walltime
        .map(|w| format!("{}", walltime::to_hours(w)))
        .unwrap_or_else(|| "unbounded".to_string());
    let mut out = format!(
        "job_id: {}\nhost: {}\nname: {}\nscheduler: {}\nstate: {}\nhandle: {}\nremote_dir: {}\nlocal_output_dir: {}\nlayout: {} processes x {} threads on {} node(s)\nwalltime_hours: {}\nsubmitted: {}\nrunning_since: {}\nfinished: {}\n",
        job.id,
        job.host_name,
        job.name,
        job.kind.as_str(),
        job_status(job),
        job_handle(job),
        job.remote_dir,
        job.local_output_dir.display(),
        job.layout.processes,
        job.layout.threads_per_process,
        job.layout.nodes,
        walltime,
        timestamp(job.submitted_at),
        opt_timestamp(job.running_since),
        opt_timestamp(job.finished_at),
    );
    if let Some(progress) = &job.progress {
        out.push_str(&format!("progress: {progress}\n"));
    }
    if let Some(artifacts) = &job.artifacts {
        out.push_str(&format!(
            "output: {} file(s) in {}\n",
            artifacts.files.len(),
            artifacts.root.display()
        ));
    }
    out
}

pub fn format_history(transitions: &[JobTransition]) -> String {
    let rows: Vec<Vec<String>> = transitions
        .iter()
        .map(|t| vec![timestamp(t.recorded_at), t.state.to_string()])
        .collect();
    render_table(&["recorded", "state"], &rows)
}

pub fn format_history_json(transitions: &[JobTransition]) -> anyhow::Result<String> {
    format_json(serde_json::Value::Array(
        transitions
            .iter()
            .map(|t| json!({"state": t.state.as_str(), "recorded_at": timestamp(t.recorded_at)}))
            .collect(),
    ))
}

fn host_destination(host: &HostProfile) -> String {
    format!("{}@{}:{}", host.user, host.address, host.port)
}

pub fn host_to_json(host: &HostProfile, reachable: Option<bool>) -> serde_json::Value {
    json!({
        "name": host.name.as_str(),
        "destination": host_destination(host),
        "scheduler": host.scheduler_kind().as_str(),
        "vpn": host.vpn.as_ref().map(|v| v.service.as_str()),
        "scratch_path": host.scratch_path.as_str(),
        "walltime_hours": host.effective_walltime().map(walltime::to_hours),
        "reachable": reachable,
    })
}

pub fn format_hosts_table(hosts: &[(&HostProfile, Option<bool>)]) -> String {
    let headers = ["name", "destination", "scheduler", "vpn", "walltime (h)", "reachable"];
    let rows: Vec<Vec<String>> = hosts
        .iter()
        .map(|(host, reachable)| {
            vec![
                host.name.clone(),
                host_destination(host),
                host.scheduler_kind().as_str().to_string(),
                host.vpn
                    .as_ref()
                    .map(|v| v.service.clone())
                    .unwrap_or_else(|| "-".to_string()),
                host.effective_walltime()
                    .map(|w| walltime::to_hours(w).to_string())
                    .unwrap_or_else(|| "-".to_string()),
                match reachable {
                    Some(true) => "yes".to_string(),
                    Some(false) => "no".to_string(),
                    None => "-".to_string(),
                },
            ]
        })
        .collect();
    render_table(&headers, &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::host_profile;
    use crate::app::types::{JobState, NewJob, ProcessLayout, RetrieveOptions, SchedulerKind};
    use std::path::PathBuf;
    use std::time::Duration;
    use time::macros::datetime;

    fn sample_job() -> Job {
        Job::from_new(
            12,
            NewJob {
                host_name: "nancy".into(),
                name: "galaxy__x".into(),
                prefix: "galaxy".into(),
                kind: SchedulerKind::Direct,
                remote_dir: "/scratch/ada/galaxy__x".into(),
                remote_output_dir: "/scratch/ada/galaxy__x/out".into(),
                local_output_dir: PathBuf::from("/tmp/out"),
                layout: ProcessLayout {
                    processes: 2,
                    threads_per_process: 4,
                    nodes: 1,
                    ppn: 8,
                },
                walltime: Some(Duration::from_secs(5400)),
                retrieve: RetrieveOptions::default(),
                submitted_at: datetime!(2026-10-17 08:00:00 UTC),
                state: JobState::Running,
                scheduler_id: None,
                remote_pid: Some(4711),
            },
        )
    }

    #[test]
    fn table_columns_align_to_widest_cell() {
        let table = render_table(
            &["id", "state"],
            &[
                vec!["1".into(), "running".into()],
                vec!["100".into(), "failed".into()],
            ],
        );
        assert_eq!(table, "id   state\n1    running\n100  failed\n");
    }

    #[test]
    fn jobs_table_shows_pid_and_degraded_flag() {
        let mut job = sample_job();
        job.degraded = true;
        let table = format_jobs_table(&[job]);
        assert!(table.contains("running (degraded)"));
        assert!(table.contains("pid 4711"));
        assert!(table.contains("2026-10-17T08:00:00Z"));
    }

    #[test]
    fn job_json_carries_state_and_walltime() {
        let value = job_to_json(&sample_job());
        assert_eq!(value["state"], "running");
        assert_eq!(value["walltime_secs"], 5400);
        assert_eq!(value["pid"], 4711);
        assert!(value["finished_at"].is_null());
    }

    #[test]
    fn hosts_table_marks_unchecked_reachability() {
        let host = host_profile("hpc");
        let table = format_hosts_table(&[(&host, None)]);
        assert!(table.contains("ada@hpc.example.org:22"));
        assert!(table.lines().nth(1).unwrap().ends_with('-'));
    }

    #[test]
    fn details_include_walltime_hours() {
        let details = format_job_details(&sample_job());
        assert!(details.contains("walltime_hours: 1.5"));
        assert!(details.contains("layout: 2 processes x 4 threads on 1 node(s)"));
    }
}
