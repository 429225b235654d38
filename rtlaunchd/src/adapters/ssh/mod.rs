// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{AuthResult, Config, Handle};
use russh::keys::PrivateKeyWithHashAlg;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{RemoteSession, SessionConnectorPort};
use crate::app::types::{Credentials, HostProfile};

mod error;
mod session;

pub use error::SshError;
pub use session::SshSession;

use session::ClientHandler;

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub keepalive_interval: Option<Duration>,
    pub inactivity_timeout: Option<Duration>,
    /// Alternate known_hosts file; the user's default file when unset.
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(Duration::from_secs(30)),
            inactivity_timeout: None,
            known_hosts_path: None,
        }
    }
}

/// Opens authenticated russh sessions.
#[derive(Clone)]
pub struct SshConnector {
    settings: SshSettings,
    config: Arc<Config>,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        let config = Config {
            inactivity_timeout: settings.inactivity_timeout,
            keepalive_interval: settings.keepalive_interval,
            channel_buffer_size: 64,
            window_size: 1024 * 1024,
            ..Default::default()
        };
        Self {
            settings,
            config: Arc::new(config),
        }
    }

    async fn authenticate(
        handle: &mut Handle<ClientHandler>,
        user: &str,
        credentials: &Credentials,
    ) -> Result<(), SshError> {
        // Key first, then password.
        if let Some(path) = &credentials.key_path {
            let key = russh::keys::load_secret_key(path, credentials.key_password.as_deref())?;
            let pk = PrivateKeyWithHashAlg::new(
                Arc::new(key),
                handle.best_supported_rsa_hash().await?.flatten(),
            );
            let result = handle.authenticate_publickey(user, pk).await?;
            if matches!(result, AuthResult::Success) {
                return Ok(());
            }
            tracing::debug!(user, "public key rejected");
        }
        if let Some(password) = credentials.password.as_deref().filter(|p| !p.is_empty()) {
            let result = handle.authenticate_password(user, password).await?;
            if matches!(result, AuthResult::Success) {
                return Ok(());
            }
            tracing::debug!(user, "password rejected");
        }
        Err(SshError::AuthenticationRejected {
            user: user.to_string(),
        })
    }

    async fn open(&self, host: &HostProfile, addr: SocketAddr) -> Result<SshSession, SshError> {
        let handler = ClientHandler::new(
            host.address.to_string(),
            addr,
            self.settings.known_hosts_path.clone(),
        );
        let mut handle = russh::client::connect(self.config.clone(), addr, handler).await?;
        tracing::info!(
            host = %host.name,
            "established connection with {}@{}, proceeding with auth",
            host.user,
            addr
        );
        if let Err(err) = Self::authenticate(&mut handle, &host.user, &host.credentials).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
            return Err(err);
        }
        Ok(SshSession::start(
            host.name.clone(),
            handle,
            self.settings.keepalive_interval,
        ))
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(SshSettings::default())
    }
}

fn map_connect_error(host: &HostProfile, err: SshError) -> AppError {
    let code = match &err {
        SshError::AuthenticationRejected { .. } | SshError::Key(_) | SshError::HostKey { .. } => {
            codes::AUTHENTICATION_REJECTED
        }
        _ => codes::HOST_UNREACHABLE,
    };
    AppError::with_message(
        AppErrorKind::Connection,
        code,
        format!("ssh connect to {}@{} failed: {err}", host.user, host.address),
    )
}

#[async_trait]
impl SessionConnectorPort for SshConnector {
    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self, host),
        fields(op = "connect", host = %host.name, user = %host.user)
    )]
    async fn connect(
        &self,
        host: &HostProfile,
        addr: SocketAddr,
    ) -> AppResult<Arc<dyn RemoteSession>> {
        let session = self
            .open(host, addr)
            .await
            .map_err(|err| map_connect_error(host, err))?;
        Ok(Arc::new(session))
    }
}
