// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use chrono::Local;
use rand::Rng;

/// "YYYY-MM-DD-xxxxxxxxxx": local date plus ten random lowercase letters.
pub fn generate_run_suffix() -> String {
    let date = Local::now().format("%Y-%m-%d").to_string();
    let mut rng = rand::rng();
    let rand_string: String = (0..10)
        .map(|_| {
            let idx = rng.random_range(0..26);
            (b'a' + idx) as char
        })
        .collect();
    format!("{}-{}", date, rand_string)
}

/// Remote run directory name for a simulation.
pub fn run_directory_name(prefix: &str) -> String {
    format!("{}__{}", prefix, generate_run_suffix())
}
