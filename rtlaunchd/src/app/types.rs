// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::app::services::walltime;

/// Address for a host: either hostname or IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Hostname(String),
    Ip(IpAddr),
}

impl Address {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Hostname(raw.to_string()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Hostname(host) => write!(f, "{host}"),
            Address::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Ssh,
    Other(String),
}

impl Protocol {
    pub fn as_str(&self) -> &str {
        match self {
            Protocol::Ssh => "ssh",
            Protocol::Other(value) => value,
        }
    }
}

impl FromStr for Protocol {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Ok(if lowered == "ssh" {
            Protocol::Ssh
        } else {
            Protocol::Other(lowered)
        })
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub password: Option<String>,
    pub key_path: Option<PathBuf>,
    pub key_password: Option<String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.password.as_deref().is_none_or(str::is_empty) && self.key_path.is_none()
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_path", &self.key_path)
            .field("key_password", &self.key_password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// VPN sub-profile. The service is driven through the local network
/// control tool; credentials are only used when the tool prompts for them.
#[derive(Clone, PartialEq, Eq)]
pub struct VpnProfile {
    pub service: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub secret: Option<String>,
    pub prompt_delay: Duration,
    pub not_required_for_domain: Option<String>,
}

impl fmt::Debug for VpnProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VpnProfile")
            .field("service", &self.service)
            .field("user", &self.user)
            .field("prompt_delay", &self.prompt_delay)
            .field("not_required_for_domain", &self.not_required_for_domain)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerFamily {
    #[default]
    Pbs,
    Slurm,
}

impl SchedulerFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerFamily::Pbs => "pbs",
            SchedulerFamily::Slurm => "slurm",
        }
    }
}

impl FromStr for SchedulerFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pbs" | "torque" => Ok(SchedulerFamily::Pbs),
            "slurm" => Ok(SchedulerFamily::Slurm),
            other => Err(format!("unsupported scheduler family: {other}")),
        }
    }
}

/// Resolved description of one remote execution target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProfile {
    pub name: String,
    pub user: String,
    pub credentials: Credentials,
    pub protocol: Protocol,
    pub address: Address,
    pub port: u16,
    pub vpn: Option<VpnProfile>,
    /// Base directory for run directories.
    pub scratch_path: String,
    /// Separate output base; output goes next to the inputs when unset.
    pub output_path: Option<String>,
    pub has_scheduler: bool,
    pub scheduler_family: SchedulerFamily,
    pub mpi_command: Option<String>,
    pub force_process_binding: bool,
    pub use_hyperthreading: bool,
    pub maximum_walltime: Option<Duration>,
    pub preferred_walltime: Option<Duration>,
    pub cores_per_node: Option<u32>,
    pub threads_per_core: Option<u32>,
    pub modules: Vec<String>,
    pub simulator: String,
    pub minimum_free_space_mb: Option<u64>,
}

impl HostProfile {
    pub fn effective_walltime(&self) -> Option<Duration> {
        walltime::effective(self.preferred_walltime, self.maximum_walltime)
    }

    pub fn scheduler_kind(&self) -> SchedulerKind {
        if self.has_scheduler {
            SchedulerKind::Batch(self.scheduler_family)
        } else {
            SchedulerKind::Direct
        }
    }
}

/// Which submission style a job was launched with. Persisted with the job
/// so that a restarted process polls it the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Direct,
    Batch(SchedulerFamily),
}

impl SchedulerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerKind::Direct => "direct",
            SchedulerKind::Batch(family) => family.as_str(),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(SchedulerKind::Direct),
            other => other.parse::<SchedulerFamily>().map(SchedulerKind::Batch),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }

    /// Lifecycle order: Pending < Running < terminal.
    pub fn rank(self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Running => 1,
            _ => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "timed_out" => Ok(JobState::TimedOut),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parallelization {
    pub processes: u32,
    pub threads_per_process: u32,
}

impl Default for Parallelization {
    fn default() -> Self {
        Self {
            processes: 1,
            threads_per_process: 1,
        }
    }
}

/// Requested process count plus the node layout derived for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLayout {
    pub processes: u32,
    pub threads_per_process: u32,
    pub nodes: u32,
    pub ppn: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveOptions {
    /// Glob patterns matched against output file names. Empty means everything.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub remove_remote: bool,
}

/// Opaque simulation bundle: a description file plus the input files it
/// references. Nothing here is parsed, only uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationBundle {
    pub description: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub local_output_dir: PathBuf,
}

impl SimulationBundle {
    /// Output prefix used by the simulator: the description file stem.
    pub fn prefix(&self) -> String {
        file_stem(&self.description)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "simulation".to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub bundle: SimulationBundle,
    pub parallelization: Parallelization,
    pub retrieve: RetrieveOptions,
}

/// Output files of a completed run, downloaded under `root`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
}

impl ArtifactSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// A job as prepared for submission, before the tracker assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub host_name: String,
    pub name: String,
    pub prefix: String,
    pub kind: SchedulerKind,
    pub remote_dir: String,
    pub remote_output_dir: String,
    pub local_output_dir: PathBuf,
    pub layout: ProcessLayout,
    pub walltime: Option<Duration>,
    pub retrieve: RetrieveOptions,
    pub submitted_at: OffsetDateTime,
    pub state: JobState,
    pub scheduler_id: Option<String>,
    pub remote_pid: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: i64,
    pub host_name: String,
    pub name: String,
    pub prefix: String,
    pub kind: SchedulerKind,
    pub remote_dir: String,
    pub remote_output_dir: String,
    pub local_output_dir: PathBuf,
    pub layout: ProcessLayout,
    pub walltime: Option<Duration>,
    pub retrieve: RetrieveOptions,
    pub submitted_at: OffsetDateTime,
    pub state: JobState,
    pub scheduler_id: Option<String>,
    pub remote_pid: Option<i64>,
    pub running_since: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
    pub artifacts: Option<ArtifactSet>,
    pub degraded: bool,
    /// Last progress line seen in the simulator log. Not persisted.
    pub progress: Option<String>,
}

impl Job {
    pub fn from_new(id: i64, job: NewJob) -> Self {
        Self {
            id,
            host_name: job.host_name,
            name: job.name,
            prefix: job.prefix,
            kind: job.kind,
            remote_dir: job.remote_dir,
            remote_output_dir: job.remote_output_dir,
            local_output_dir: job.local_output_dir,
            layout: job.layout,
            walltime: job.walltime,
            retrieve: job.retrieve,
            submitted_at: job.submitted_at,
            state: job.state,
            scheduler_id: job.scheduler_id,
            remote_pid: job.remote_pid,
            running_since: None,
            finished_at: None,
            artifacts: None,
            degraded: false,
            progress: None,
        }
    }

    pub fn log_path(&self) -> String {
        format!("{}/{}_log.txt", self.remote_output_dir, self.prefix)
    }

    pub fn exit_code_path(&self) -> String {
        format!("{}/.exit_code", self.remote_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTransition {
    pub state: JobState,
    pub recorded_at: OffsetDateTime,
}
