// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::types::{HostProfile, Parallelization, ProcessLayout};

/// Derive the node layout for a requested parallelization on a host.
///
/// Threads count against hardware threads only when the host allows
/// hyperthreading; otherwise each thread occupies a full core.
pub fn for_host(host: &HostProfile, request: Parallelization) -> ProcessLayout {
    let processes = request.processes.max(1);
    let threads_per_process = request.threads_per_process.max(1);
    let threads_per_core = if host.use_hyperthreading {
        host.threads_per_core.unwrap_or(1).max(1)
    } else {
        1
    };
    let threads = processes.saturating_mul(threads_per_process);
    let cores = threads.div_ceil(threads_per_core).max(1);

    let (nodes, ppn) = match host.cores_per_node.filter(|&c| c > 0) {
        Some(cores_per_node) => {
            let nodes = cores.div_ceil(cores_per_node);
            let ppn = if nodes == 1 { cores } else { cores_per_node };
            (nodes, ppn)
        }
        None => (1, cores),
    };

    ProcessLayout {
        processes,
        threads_per_process,
        nodes,
        ppn,
    }
}
