// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::services::shell::sh_escape;

pub fn df_command(path: &str) -> String {
    format!("df -Pk {}", sh_escape(path))
}

/// Available space in MiB from POSIX `df -Pk` output.
pub fn parse_available_mb(output: &str) -> Option<u64> {
    let line = output.lines().skip(1).find(|line| !line.trim().is_empty())?;
    let available_kb: u64 = line.split_whitespace().nth(3)?.parse().ok()?;
    Some(available_kb / 1024)
}
