// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum SshError {
    #[error("ssh protocol error: {0}")]
    Protocol(#[from] russh::Error),
    #[error("key error: {0}")]
    Key(#[from] russh::keys::Error),
    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authentication rejected for {user}")]
    AuthenticationRejected { user: String },
    #[error("server key for {host}:{port} rejected: {reason}")]
    HostKey {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("session closed")]
    Closed,
}

impl SshError {
    /// Whether the remote side reported that a path does not exist.
    pub fn is_missing_path(&self) -> bool {
        matches!(
            self,
            SshError::Sftp(russh_sftp::client::error::Error::Status(status))
                if status.status_code == russh_sftp::protocol::StatusCode::NoSuchFile
        )
    }
}
