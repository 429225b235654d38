// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Remote execution of radiative-transfer simulation runs.
//!
//! `app` holds the domain core: connection management, the scheduler
//! variants, the persisted job tracker and the orchestrator that drives
//! jobs to a terminal state. `adapters` implements its ports over SSH,
//! the local VPN tool, SQLite and the local machine.

pub mod adapters;
pub mod app;
pub mod config;
pub mod hosts;
pub mod logging;
