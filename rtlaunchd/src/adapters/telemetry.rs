// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::ports::{TelemetryEvent, TelemetryPort};

/// Job lifecycle events as structured tracing records on their own target,
/// so they can be filtered or routed separately from diagnostics.
#[derive(Clone, Default)]
pub struct TracingTelemetry;

impl TelemetryPort for TracingTelemetry {
    fn event(&self, name: &'static str, fields: TelemetryEvent) {
        let TelemetryEvent {
            host,
            job_id,
            job_name,
            state,
            detail,
        } = fields;

        tracing::info!(
            target: "rtlaunchd::telemetry",
            event = name,
            host = host.as_deref(),
            job_id = job_id,
            job_name = job_name.as_deref(),
            state = state,
            detail = detail.as_deref(),
        );
    }
}
