// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::HostProfile;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecCapture {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// A live authenticated channel to one host, usable for command execution
/// and file transfer. Callers serialize access per host.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn exec_capture(&self, command: &str) -> AppResult<ExecCapture>;
    async fn create_dir_all(&self, remote_dir: &str) -> AppResult<()>;
    async fn write_file(&self, remote_path: &str, contents: &[u8], mode: u32) -> AppResult<()>;
    /// Upload a local file or directory tree to `remote_path`.
    async fn upload(&self, local_path: &Path, remote_path: &str) -> AppResult<()>;
    /// Entries of a remote directory. Fails with a `NotFound` kind when the
    /// directory does not exist.
    async fn list_dir(&self, remote_dir: &str) -> AppResult<Vec<RemoteEntry>>;
    async fn download(&self, remote_path: &str, local_path: &Path) -> AppResult<()>;
    fn is_closed(&self) -> bool;
    async fn close(&self);
}

/// Opens sessions. Authentication happens here; VPN handling does not.
#[async_trait]
pub trait SessionConnectorPort: Send + Sync {
    async fn connect(
        &self,
        host: &HostProfile,
        addr: SocketAddr,
    ) -> AppResult<Arc<dyn RemoteSession>>;
}
