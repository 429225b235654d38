// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod clock;
pub mod job_store;
pub mod local_fs;
pub mod network;
pub mod session;
pub mod telemetry;
pub mod vpn;

pub use clock::ClockPort;
pub use job_store::JobStorePort;
pub use local_fs::LocalFilesystemPort;
pub use network::NetworkProbePort;
pub use session::{ExecCapture, RemoteEntry, RemoteSession, SessionConnectorPort};
#[allow(unused_imports)]
pub use telemetry::{NoopTelemetry, TelemetryEvent, TelemetryPort};
pub use vpn::{VpnPort, VpnStatus};
