// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Host profile file loader.
//!
//! ```toml
//! [[host]]
//! name = "nancy"
//! user = "ada"
//! host = "nancy.example.org"
//! key = "~/.ssh/id_ed25519"
//! scratch_path = "/scratch/ada"
//! has_scheduler = true
//! scheduler = "slurm"
//! maximum_walltime = 72.0
//!
//! [host.vpn]
//! service = "Campus VPN"
//! not_required_for_domain = "example.org"
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::app::services::walltime;
use crate::app::types::{Address, Credentials, HostProfile, Protocol, SchedulerFamily, VpnProfile};
use crate::config::resolve_path;

const DEFAULT_PORT: u16 = 22;
const DEFAULT_SIMULATOR: &str = "skirt";
const DEFAULT_PROMPT_DELAY_SECS: u64 = 5;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostsFile {
    #[serde(default)]
    host: Vec<HostEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostEntry {
    name: String,
    user: String,
    host: String,
    scratch_path: String,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    key_password: Option<String>,
    #[serde(default)]
    vpn: Option<VpnEntry>,
    #[serde(default)]
    output_path: Option<String>,
    #[serde(default)]
    has_scheduler: bool,
    #[serde(default)]
    scheduler: Option<String>,
    #[serde(default)]
    mpi_command: Option<String>,
    #[serde(default)]
    force_process_binding: bool,
    #[serde(default)]
    use_hyperthreading: bool,
    #[serde(default)]
    maximum_walltime: Option<f64>,
    #[serde(default)]
    preferred_walltime: Option<f64>,
    #[serde(default)]
    cores_per_node: Option<u32>,
    #[serde(default)]
    threads_per_core: Option<u32>,
    #[serde(default)]
    modules: Vec<String>,
    #[serde(default)]
    simulator: Option<String>,
    #[serde(default)]
    minimum_free_space_mb: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VpnEntry {
    service: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    prompt_delay: Option<u64>,
    #[serde(default)]
    not_required_for_domain: Option<String>,
}

pub fn load(path: &Path) -> Result<Vec<HostProfile>> {
    if !path.exists() {
        bail!(
            "hosts file not found at {}; pass --hosts or set hosts_path in the config file",
            path.display()
        );
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read hosts file {}", path.display()))?;
    parse(&contents, path.parent())
        .with_context(|| format!("invalid hosts file {}", path.display()))
}

/// Relative key paths are taken from `base_dir`.
pub fn parse(contents: &str, base_dir: Option<&Path>) -> Result<Vec<HostProfile>> {
    let file: HostsFile = toml::from_str(contents)?;
    let mut seen = HashSet::new();
    let mut hosts = Vec::with_capacity(file.host.len());
    for entry in file.host {
        if !seen.insert(entry.name.clone()) {
            bail!("duplicate host name {:?}", entry.name);
        }
        let name = entry.name.clone();
        hosts.push(resolve(entry, base_dir).with_context(|| format!("host {name:?}"))?);
    }
    Ok(hosts)
}

fn walltime_hours(field: &str, hours: Option<f64>) -> Result<Option<Duration>> {
    match hours {
        None => Ok(None),
        Some(hours) => match walltime::from_hours(hours) {
            Some(walltime) => Ok(Some(walltime)),
            None => bail!(
                "{field} must be a positive number of hours up to {}, got {hours}",
                walltime::MAX_HOURS
            ),
        },
    }
}

fn non_zero(field: &str, value: Option<u32>) -> Result<Option<u32>> {
    if value == Some(0) {
        bail!("{field} must be at least 1");
    }
    Ok(value)
}

fn resolve(entry: HostEntry, base_dir: Option<&Path>) -> Result<HostProfile> {
    if entry.name.trim().is_empty() {
        bail!("name must not be empty");
    }
    if entry.host.trim().is_empty() {
        bail!("host must not be empty");
    }
    if !entry.scratch_path.starts_with('/') {
        bail!("scratch_path must be an absolute remote path");
    }
    let scheduler_family = match entry.scheduler.as_deref() {
        Some(raw) => raw.parse::<SchedulerFamily>().map_err(anyhow::Error::msg)?,
        None => SchedulerFamily::default(),
    };
    let protocol = entry
        .protocol
        .as_deref()
        .map(|raw| raw.parse::<Protocol>())
        .transpose()?
        .unwrap_or(Protocol::Ssh);
    let vpn = entry.vpn.map(|vpn| VpnProfile {
        service: vpn.service,
        user: vpn.user,
        password: vpn.password,
        secret: vpn.secret,
        prompt_delay: Duration::from_secs(vpn.prompt_delay.unwrap_or(DEFAULT_PROMPT_DELAY_SECS)),
        not_required_for_domain: vpn.not_required_for_domain,
    });

    Ok(HostProfile {
        name: entry.name,
        user: entry.user,
        credentials: Credentials {
            password: entry.password,
            key_path: entry.key.as_deref().map(|raw| resolve_path(raw, base_dir)),
            key_password: entry.key_password,
        },
        protocol,
        address: Address::parse(&entry.host),
        port: entry.port.unwrap_or(DEFAULT_PORT),
        vpn,
        scratch_path: entry.scratch_path,
        output_path: entry.output_path,
        has_scheduler: entry.has_scheduler,
        scheduler_family,
        mpi_command: entry.mpi_command,
        force_process_binding: entry.force_process_binding,
        use_hyperthreading: entry.use_hyperthreading,
        maximum_walltime: walltime_hours("maximum_walltime", entry.maximum_walltime)?,
        preferred_walltime: walltime_hours("preferred_walltime", entry.preferred_walltime)?,
        cores_per_node: non_zero("cores_per_node", entry.cores_per_node)?,
        threads_per_core: non_zero("threads_per_core", entry.threads_per_core)?,
        modules: entry.modules,
        simulator: entry
            .simulator
            .unwrap_or_else(|| DEFAULT_SIMULATOR.to_string()),
        minimum_free_space_mb: entry.minimum_free_space_mb,
    })
}
