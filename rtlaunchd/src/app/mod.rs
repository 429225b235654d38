// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod connection;
pub mod errors;
pub mod orchestrator;
pub mod ports;
pub mod scheduler;
pub mod services;
pub mod tracker;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
