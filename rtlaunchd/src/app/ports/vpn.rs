// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::VpnProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnStatus {
    Disconnected,
    Connecting,
    /// The service is waiting for credentials to be entered.
    PromptPending,
    Connected,
}

/// Control of a locally configured VPN service.
#[async_trait]
pub trait VpnPort: Send + Sync {
    /// DNS domain of the local network, when known.
    async fn local_domain(&self) -> AppResult<Option<String>>;
    async fn start(&self, vpn: &VpnProfile) -> AppResult<()>;
    async fn status(&self, vpn: &VpnProfile) -> AppResult<VpnStatus>;
    /// Re-submit the configured credentials to a pending prompt.
    async fn answer_prompt(&self, vpn: &VpnProfile) -> AppResult<()>;
    async fn stop(&self, vpn: &VpnProfile) -> AppResult<()>;
}
