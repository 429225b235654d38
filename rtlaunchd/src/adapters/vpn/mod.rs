// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! VPN control through the system network-connection tool (`scutil --nc`).

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{VpnPort, VpnStatus};
use crate::app::types::VpnProfile;

const DEFAULT_PROGRAM: &str = "scutil";
const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Debug, Error)]
pub enum VpnError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} {action} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        action: &'static str,
        status: i32,
        stderr: String,
    },
    #[error("failed to read {path}: {source}")]
    ReadResolver {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CommandVpn {
    program: PathBuf,
    resolv_conf: PathBuf,
}

impl Default for CommandVpn {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM, DEFAULT_RESOLV_CONF)
    }
}

impl CommandVpn {
    pub fn new(program: impl Into<PathBuf>, resolv_conf: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            resolv_conf: resolv_conf.into(),
        }
    }

    async fn run(&self, action: &'static str, args: Vec<String>) -> Result<String, VpnError> {
        let program = self.program.display().to_string();
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| VpnError::Spawn {
                program: program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(VpnError::CommandFailed {
                program,
                action,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn read_domain(&self) -> Result<Option<String>, VpnError> {
        match tokio::fs::read_to_string(&self.resolv_conf).await {
            Ok(text) => Ok(parse_local_domain(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(VpnError::ReadResolver {
                path: self.resolv_conf.clone(),
                source,
            }),
        }
    }
}

/// `domain` wins over the first `search` entry, as in the resolver itself.
fn parse_local_domain(text: &str) -> Option<String> {
    let mut search = None;
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("domain"), Some(domain)) => {
                return Some(domain.trim_end_matches('.').to_ascii_lowercase());
            }
            (Some("search"), Some(domain)) if search.is_none() => {
                search = Some(domain.trim_end_matches('.').to_ascii_lowercase());
            }
            _ => {}
        }
    }
    search
}

fn parse_status(output: &str) -> VpnStatus {
    let first = output.lines().map(str::trim).find(|l| !l.is_empty());
    match first {
        Some("Connected") => VpnStatus::Connected,
        Some("Disconnected") | Some("Invalid") | None => VpnStatus::Disconnected,
        // The service sits here while a credential dialog is open.
        Some("Authenticating") => VpnStatus::PromptPending,
        Some(_) => VpnStatus::Connecting,
    }
}

fn start_args(vpn: &VpnProfile) -> Vec<String> {
    let mut args = vec!["--nc".to_string(), "start".to_string(), vpn.service.clone()];
    if let Some(user) = &vpn.user {
        args.extend(["--user".to_string(), user.clone()]);
    }
    if let Some(password) = &vpn.password {
        args.extend(["--password".to_string(), password.clone()]);
    }
    if let Some(secret) = &vpn.secret {
        args.extend(["--secret".to_string(), secret.clone()]);
    }
    args
}

fn map_vpn_error(err: VpnError) -> AppError {
    match err {
        VpnError::Spawn { .. } | VpnError::ReadResolver { .. } => {
            AppError::with_message(AppErrorKind::Local, codes::LOCAL_ERROR, err.to_string())
        }
        VpnError::CommandFailed { .. } => {
            AppError::with_message(AppErrorKind::Connection, codes::VPN_TIMEOUT, err.to_string())
        }
    }
}

#[async_trait]
impl VpnPort for CommandVpn {
    async fn local_domain(&self) -> AppResult<Option<String>> {
        self.read_domain().await.map_err(map_vpn_error)
    }

    #[tracing::instrument(name = "vpn", level = "debug", skip(self, vpn), fields(op = "start", service = %vpn.service))]
    async fn start(&self, vpn: &VpnProfile) -> AppResult<()> {
        self.run("start", start_args(vpn))
            .await
            .map(|_| ())
            .map_err(map_vpn_error)
    }

    #[tracing::instrument(name = "vpn", level = "debug", skip(self, vpn), fields(op = "status", service = %vpn.service))]
    async fn status(&self, vpn: &VpnProfile) -> AppResult<VpnStatus> {
        let args = vec!["--nc".to_string(), "status".to_string(), vpn.service.clone()];
        let output = self.run("status", args).await.map_err(map_vpn_error)?;
        Ok(parse_status(&output))
    }

    async fn answer_prompt(&self, vpn: &VpnProfile) -> AppResult<()> {
        // Starting again re-submits the credentials to the open dialog.
        self.start(vpn).await
    }

    #[tracing::instrument(name = "vpn", level = "debug", skip(self, vpn), fields(op = "stop", service = %vpn.service))]
    async fn stop(&self, vpn: &VpnProfile) -> AppResult<()> {
        let args = vec!["--nc".to_string(), "stop".to_string(), vpn.service.clone()];
        self.run("stop", args)
            .await
            .map(|_| ())
            .map_err(map_vpn_error)
    }
}
