// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::NetworkProbePort;
use crate::app::types::Address;

mod net;

pub use net::NetError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Default)]
pub struct NetworkAdapter;

impl NetworkAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn map_net_error(err: NetError) -> AppError {
    AppError::with_message(
        AppErrorKind::Connection,
        codes::HOST_UNREACHABLE,
        err.to_string(),
    )
}

async fn accepts_connections(addr: SocketAddr) -> bool {
    matches!(
        timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[async_trait]
impl NetworkProbePort for NetworkAdapter {
    async fn resolve_host_addr(&self, address: &Address, port: u16) -> AppResult<SocketAddr> {
        match address {
            Address::Ip(ip) => Ok(SocketAddr::new(*ip, port)),
            Address::Hostname(host) => {
                let addrs = net::lookup_addrs(host, port).await.map_err(map_net_error)?;
                addrs
                    .into_iter()
                    .next()
                    .ok_or_else(|| map_net_error(NetError::NoAddrs(host.clone())))
            }
        }
    }

    #[tracing::instrument(name = "net", level = "debug", skip(self), fields(op = "reachable", address = %address))]
    async fn check_host_reachable(&self, address: &Address, port: u16) -> AppResult<bool> {
        let addrs = match address {
            Address::Ip(ip) => vec![SocketAddr::new(*ip, port)],
            Address::Hostname(host) => net::lookup_addrs(host, port).await.map_err(map_net_error)?,
        };
        for addr in addrs {
            if accepts_connections(addr).await {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
