// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::{io, net::SocketAddr};
use thiserror::Error as ThisError;
use tokio::net::lookup_host;

#[derive(ThisError, Debug)]
pub enum NetError {
    #[error("no DNS record for {0}")]
    DnsNotFound(String),

    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} resolved to no addresses")]
    NoAddrs(String),
}

/// Resolved addresses, IPv4 first: cluster login nodes often publish AAAA
/// records that are not routable from outside.
pub async fn lookup_addrs(host: &str, port: u16) -> Result<Vec<SocketAddr>, NetError> {
    let mut out: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => NetError::DnsNotFound(host.to_owned()),
            _ => NetError::Resolve {
                host: host.to_owned(),
                source,
            },
        })?
        .collect();
    out.sort_by_key(|addr| addr.is_ipv6());
    if out.is_empty() {
        return Err(NetError::NoAddrs(host.to_owned()));
    }
    Ok(out)
}
