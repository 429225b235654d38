// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Per-host sessions, optionally tunnelled through a VPN.
//!
//! Each host owns one slot. Holding a [`SessionLease`] holds the slot lock,
//! so every session operation against a host is serialized while other hosts
//! proceed independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{NetworkProbePort, RemoteSession, SessionConnectorPort, VpnPort, VpnStatus};
use crate::app::services::retry::{RetryPolicy, retry_transient};
use crate::app::types::{HostProfile, Protocol, VpnProfile};

pub const DEFAULT_VPN_TIMEOUT: Duration = Duration::from_secs(60);
const MIN_VPN_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub retry: RetryPolicy,
    /// Upper bound for the VPN to report itself connected.
    pub vpn_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            vpn_timeout: DEFAULT_VPN_TIMEOUT,
        }
    }
}

/// A started VPN service. Stopped on [`VpnTunnel::teardown`], or from a
/// spawned task if the guard is dropped while still active.
pub struct VpnTunnel {
    vpn: Arc<dyn VpnPort>,
    profile: VpnProfile,
    active: bool,
}

impl VpnTunnel {
    fn new(vpn: Arc<dyn VpnPort>, profile: VpnProfile) -> Self {
        Self {
            vpn,
            profile,
            active: true,
        }
    }

    pub async fn teardown(mut self) {
        self.active = false;
        if let Err(err) = self.vpn.stop(&self.profile).await {
            tracing::warn!(service = %self.profile.service, "failed to stop vpn: {err}");
        }
    }
}

impl Drop for VpnTunnel {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(service = %self.profile.service, "vpn left running: no runtime to stop it");
            return;
        };
        let vpn = self.vpn.clone();
        let profile = self.profile.clone();
        runtime.spawn(async move {
            if let Err(err) = vpn.stop(&profile).await {
                tracing::warn!(service = %profile.service, "failed to stop vpn: {err}");
            }
        });
    }
}

#[derive(Default)]
struct HostSlot {
    session: Option<Arc<dyn RemoteSession>>,
    tunnel: Option<VpnTunnel>,
}

impl HostSlot {
    fn live_session(&self) -> Option<Arc<dyn RemoteSession>> {
        self.session
            .as_ref()
            .filter(|session| !session.is_closed())
            .cloned()
    }

    async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.teardown().await;
        }
    }
}

/// Exclusive use of a host's session for the lifetime of the lease.
pub struct SessionLease {
    host: String,
    session: Arc<dyn RemoteSession>,
    slot: OwnedMutexGuard<HostSlot>,
}

impl SessionLease {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn session(&self) -> &dyn RemoteSession {
        self.session.as_ref()
    }

    /// Drop the session and its tunnel so the next `open` reconnects.
    pub async fn discard(mut self) {
        tracing::debug!(host = %self.host, "discarding session");
        self.slot.shutdown().await;
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn SessionConnectorPort>,
    vpn: Arc<dyn VpnPort>,
    network: Arc<dyn NetworkProbePort>,
    settings: ConnectionSettings,
    slots: RwLock<HashMap<String, Arc<Mutex<HostSlot>>>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn SessionConnectorPort>,
        vpn: Arc<dyn VpnPort>,
        network: Arc<dyn NetworkProbePort>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            connector,
            vpn,
            network,
            settings,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Lease the host's session, connecting (and bringing up the VPN) when
    /// there is no live one. Transient connection failures are retried with
    /// back-off before being returned.
    #[tracing::instrument(
        name = "connection",
        level = "debug",
        skip(self, profile),
        fields(op = "acquire", host = %profile.name)
    )]
    pub async fn acquire(&self, profile: &HostProfile) -> AppResult<SessionLease> {
        validate(profile)?;
        let slot = self.slot(&profile.name).await;
        let mut guard = slot.lock_owned().await;
        if let Some(session) = guard.live_session() {
            return Ok(SessionLease {
                host: profile.name.clone(),
                session,
                slot: guard,
            });
        }
        guard.shutdown().await;

        let (session, tunnel) =
            retry_transient(&self.settings.retry, "connect", || self.establish(profile)).await?;
        tracing::info!(host = %profile.name, vpn = tunnel.is_some(), "session established");
        guard.session = Some(session.clone());
        guard.tunnel = tunnel;
        Ok(SessionLease {
            host: profile.name.clone(),
            session,
            slot: guard,
        })
    }

    /// Close the host's session and tunnel. Safe to call repeatedly and for
    /// hosts that were never opened.
    pub async fn close(&self, host: &str) {
        let slot = self.slots.read().await.get(host).cloned();
        let Some(slot) = slot else {
            return;
        };
        slot.lock().await.shutdown().await;
    }

    pub async fn close_all(&self) {
        let slots: Vec<Arc<Mutex<HostSlot>>> = self.slots.read().await.values().cloned().collect();
        for slot in slots {
            slot.lock().await.shutdown().await;
        }
    }

    /// TCP reachability of the host's SSH port. No VPN is started and no
    /// credentials are sent.
    pub async fn probe(&self, profile: &HostProfile) -> AppResult<bool> {
        self.network
            .check_host_reachable(&profile.address, profile.port)
            .await
    }

    /// Whether a live session exists. Never waits for a busy slot.
    pub async fn is_connected(&self, host: &str) -> bool {
        let Some(slot) = self.slots.read().await.get(host).cloned() else {
            return false;
        };
        let Ok(guard) = slot.try_lock() else {
            return true;
        };
        guard.live_session().is_some()
    }

    async fn slot(&self, host: &str) -> Arc<Mutex<HostSlot>> {
        if let Some(slot) = self.slots.read().await.get(host) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(host.to_string())
            .or_default()
            .clone()
    }

    async fn establish(
        &self,
        profile: &HostProfile,
    ) -> AppResult<(Arc<dyn RemoteSession>, Option<VpnTunnel>)> {
        let tunnel = match &profile.vpn {
            Some(vpn) => self.establish_vpn(vpn).await?,
            None => None,
        };
        match self.connect(profile).await {
            Ok(session) => Ok((session, tunnel)),
            Err(err) => {
                if let Some(tunnel) = tunnel {
                    tunnel.teardown().await;
                }
                Err(err.with_context(profile.name.clone()))
            }
        }
    }

    async fn connect(&self, profile: &HostProfile) -> AppResult<Arc<dyn RemoteSession>> {
        let addr = self
            .network
            .resolve_host_addr(&profile.address, profile.port)
            .await
            .map_err(|err| {
                AppError::with_message(
                    AppErrorKind::Connection,
                    codes::HOST_UNREACHABLE,
                    format!("cannot resolve {}: {}", profile.address, err.message()),
                )
            })?;
        self.connector.connect(profile, addr).await
    }

    async fn establish_vpn(&self, vpn: &VpnProfile) -> AppResult<Option<VpnTunnel>> {
        if let Some(domain) = vpn.not_required_for_domain.as_deref() {
            match self.vpn.local_domain().await {
                Ok(Some(local)) if domain_matches(&local, domain) => {
                    tracing::debug!(service = %vpn.service, domain = %local, "vpn not required on this network");
                    return Ok(None);
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("cannot determine local domain: {err}"),
            }
        }

        self.vpn.start(vpn).await?;
        let tunnel = VpnTunnel::new(self.vpn.clone(), vpn.clone());
        let deadline = Instant::now() + self.settings.vpn_timeout;
        let interval = vpn.prompt_delay.max(MIN_VPN_POLL);
        loop {
            tokio::time::sleep(interval).await;
            let step = match self.vpn.status(vpn).await {
                Ok(VpnStatus::Connected) => return Ok(Some(tunnel)),
                Ok(VpnStatus::PromptPending) => {
                    tracing::info!(service = %vpn.service, "vpn prompt still displayed, entering credentials again");
                    self.vpn.answer_prompt(vpn).await
                }
                Ok(_) => Ok(()),
                Err(err) => Err(err),
            };
            if let Err(err) = step {
                tunnel.teardown().await;
                return Err(err);
            }
            if Instant::now() >= deadline {
                tunnel.teardown().await;
                return Err(AppError::with_message(
                    AppErrorKind::Connection,
                    codes::VPN_TIMEOUT,
                    format!(
                        "vpn {} not connected after {}s",
                        vpn.service,
                        self.settings.vpn_timeout.as_secs()
                    ),
                ));
            }
        }
    }
}

fn validate(profile: &HostProfile) -> AppResult<()> {
    if profile.protocol != Protocol::Ssh {
        return Err(AppError::with_message(
            AppErrorKind::Connection,
            codes::UNSUPPORTED_PROTOCOL,
            format!("protocol {} is not supported", profile.protocol.as_str()),
        )
        .with_context(profile.name.clone()));
    }
    if profile.credentials.is_empty() {
        return Err(AppError::with_message(
            AppErrorKind::Connection,
            codes::CREDENTIALS_MISSING,
            "neither password nor key configured",
        )
        .with_context(profile.name.clone()));
    }
    Ok(())
}

fn domain_matches(local: &str, required: &str) -> bool {
    let local = local.trim().trim_end_matches('.').to_ascii_lowercase();
    let required = required.trim().trim_end_matches('.').to_ascii_lowercase();
    !required.is_empty() && (local == required || local.ends_with(&format!(".{required}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{
        FakeConnector, FakeNetwork, FakeSession, FakeVpn, host_profile, vpn_profile,
    };
    use crate::app::types::Credentials;

    fn manager(connector: Arc<FakeConnector>, vpn: Arc<FakeVpn>) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(
            connector,
            vpn,
            Arc::new(FakeNetwork),
            ConnectionSettings {
                retry: RetryPolicy::new(2, Duration::from_secs(1)),
                vpn_timeout: Duration::from_secs(30),
            },
        ))
    }

    fn failure(code: &'static str) -> AppError {
        AppError::with_message(AppErrorKind::Connection, code, code)
    }

    #[tokio::test]
    async fn probe_does_not_open_a_session() {
        let connector = FakeConnector::new(FakeSession::silent());
        let vpn = FakeVpn::new(None, vec![]);
        let manager = manager(connector.clone(), vpn.clone());
        let mut host = host_profile("hpc");
        host.vpn = Some(vpn_profile(None));

        assert!(manager.probe(&host).await.unwrap());
        assert_eq!(connector.connects(), 0);
        assert!(vpn.calls().is_empty());
        assert!(!manager.is_connected("hpc").await);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_vpn_when_local_domain_matches() {
        let connector = FakeConnector::new(FakeSession::silent());
        let vpn = FakeVpn::new(Some("UGent.be"), vec![]);
        let manager = manager(connector.clone(), vpn.clone());
        let mut host = host_profile("nancy");
        host.vpn = Some(vpn_profile(Some("ugent.be")));

        let lease = manager.acquire(&host).await.unwrap();
        assert_eq!(lease.host(), "nancy");
        assert_eq!(vpn.calls(), vec!["local_domain"]);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn answers_vpn_prompt_still_displayed() {
        let connector = FakeConnector::new(FakeSession::silent());
        let vpn = FakeVpn::new(
            Some("home.lan"),
            vec![VpnStatus::PromptPending, VpnStatus::Connected],
        );
        let manager = manager(connector, vpn.clone());
        let mut host = host_profile("nancy");
        host.vpn = Some(vpn_profile(Some("ugent.be")));

        drop(manager.acquire(&host).await.unwrap());
        assert_eq!(
            vpn.calls(),
            vec!["local_domain", "start", "status", "answer_prompt", "status"]
        );

        manager.close("nancy").await;
        assert_eq!(vpn.calls().last(), Some(&"stop"));
    }

    #[tokio::test]
    async fn rejects_missing_credentials_before_connecting() {
        let connector = FakeConnector::new(FakeSession::silent());
        let manager = manager(connector.clone(), FakeVpn::new(None, vec![]));
        let mut host = host_profile("nancy");
        host.credentials = Credentials::default();

        let err = manager.acquire(&host).await.err().unwrap();
        assert_eq!(err.code(), codes::CREDENTIALS_MISSING);
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn rejects_non_ssh_protocol() {
        let manager = manager(
            FakeConnector::new(FakeSession::silent()),
            FakeVpn::new(None, vec![]),
        );
        let mut host = host_profile("nancy");
        host.protocol = Protocol::Other("telnet".into());

        let err = manager.acquire(&host).await.err().unwrap();
        assert_eq!(err.code(), codes::UNSUPPORTED_PROTOCOL);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_unreachable_host() {
        let connector = FakeConnector::failing_first(
            FakeSession::silent(),
            vec![failure(codes::HOST_UNREACHABLE)],
        );
        let manager = manager(connector.clone(), FakeVpn::new(None, vec![]));

        manager.acquire(&host_profile("nancy")).await.unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retry_budget() {
        let connector = FakeConnector::failing_first(
            FakeSession::silent(),
            vec![failure(codes::HOST_UNREACHABLE); 5],
        );
        let manager = manager(connector.clone(), FakeVpn::new(None, vec![]));

        let err = manager.acquire(&host_profile("nancy")).await.err().unwrap();
        assert_eq!(err.code(), codes::HOST_UNREACHABLE);
        assert_eq!(err.context(), Some("nancy"));
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_auth_is_not_retried_and_stops_vpn() {
        let connector = FakeConnector::failing_first(
            FakeSession::silent(),
            vec![failure(codes::AUTHENTICATION_REJECTED)],
        );
        let vpn = FakeVpn::new(None, vec![VpnStatus::Connected]);
        let manager = manager(connector.clone(), vpn.clone());
        let mut host = host_profile("nancy");
        host.vpn = Some(vpn_profile(None));

        let err = manager.acquire(&host).await.err().unwrap();
        assert_eq!(err.code(), codes::AUTHENTICATION_REJECTED);
        assert_eq!(connector.connects(), 1);
        assert_eq!(vpn.calls(), vec!["start", "status", "stop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn vpn_that_never_connects_times_out() {
        let connector = FakeConnector::new(FakeSession::silent());
        let vpn = FakeVpn::stuck(None, VpnStatus::Connecting);
        let manager = Arc::new(ConnectionManager::new(
            connector.clone(),
            vpn.clone(),
            Arc::new(FakeNetwork),
            ConnectionSettings {
                retry: RetryPolicy::new(0, Duration::from_secs(1)),
                vpn_timeout: Duration::from_secs(30),
            },
        ));
        let mut host = host_profile("nancy");
        host.vpn = Some(vpn_profile(None));

        let err = manager.acquire(&host).await.err().unwrap();
        assert_eq!(err.code(), codes::VPN_TIMEOUT);
        assert_eq!(connector.connects(), 0);
        assert_eq!(vpn.calls().last(), Some(&"stop"));
    }

    #[tokio::test]
    async fn reuses_live_session_and_reconnects_closed_one() {
        let session = FakeSession::silent();
        let connector = FakeConnector::new(session.clone());
        let manager = manager(connector.clone(), FakeVpn::new(None, vec![]));
        let host = host_profile("nancy");

        drop(manager.acquire(&host).await.unwrap());
        drop(manager.acquire(&host).await.unwrap());
        assert_eq!(connector.connects(), 1);
        assert!(manager.is_connected("nancy").await);

        session.close().await;
        assert!(!manager.is_connected("nancy").await);
        drop(manager.acquire(&host).await.unwrap());
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let session = FakeSession::silent();
        let manager = manager(
            FakeConnector::new(session.clone()),
            FakeVpn::new(None, vec![]),
        );
        manager.close("never-opened").await;

        drop(manager.acquire(&host_profile("nancy")).await.unwrap());
        manager.close("nancy").await;
        manager.close("nancy").await;
        assert!(session.is_closed());
        assert!(!manager.is_connected("nancy").await);
    }

    #[tokio::test]
    async fn leases_serialize_per_host_only() {
        let manager = manager(
            FakeConnector::new(FakeSession::silent()),
            FakeVpn::new(None, vec![]),
        );
        let nancy = host_profile("nancy");
        let lease = manager.acquire(&nancy).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(20), manager.acquire(&nancy)).await;
        assert!(blocked.is_err());
        let other =
            tokio::time::timeout(Duration::from_millis(20), manager.acquire(&host_profile("leia")))
                .await;
        assert!(matches!(other, Ok(Ok(_))));

        drop(lease);
        assert!(manager.acquire(&nancy).await.is_ok());
    }

    #[test]
    fn domain_match_accepts_subdomains() {
        assert!(domain_matches("ugent.be.", "UGent.be"));
        assert!(domain_matches("wifi.ugent.be", "ugent.be"));
        assert!(!domain_matches("notugent.be", "ugent.be"));
        assert!(!domain_matches("ugent.be", ""));
    }
}
