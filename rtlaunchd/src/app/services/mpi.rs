// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::services::shell::sh_escape;
use crate::app::types::{HostProfile, ProcessLayout};

const DEFAULT_MPI_COMMAND: &str = "mpirun";
const PROCESSES_PLACEHOLDER: &str = "{processes}";

/// MPI launcher prefix for a layout, or `None` for a single process.
pub fn launcher(host: &HostProfile, layout: &ProcessLayout) -> Option<String> {
    if layout.processes <= 1 {
        return None;
    }
    let template = host
        .mpi_command
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_MPI_COMMAND);

    let mut command = if template.contains(PROCESSES_PLACEHOLDER) {
        template.replace(PROCESSES_PLACEHOLDER, &layout.processes.to_string())
    } else {
        format!("{template} -np {}", layout.processes)
    };
    if host.force_process_binding {
        let unit = if host.use_hyperthreading {
            "hwthread"
        } else {
            "core"
        };
        command.push_str(" --bind-to ");
        command.push_str(unit);
    }
    if host.use_hyperthreading {
        command.push_str(" --use-hwthread-cpus");
    }
    Some(command)
}

/// Full command line running the simulator on a description file.
pub fn simulator_command(
    host: &HostProfile,
    layout: &ProcessLayout,
    description: &str,
    input_dir: &str,
    output_dir: &str,
) -> String {
    let simulator = format!(
        "{} -t {} -i {} -o {} {}",
        sh_escape(&host.simulator),
        layout.threads_per_process,
        sh_escape(input_dir),
        sh_escape(output_dir),
        sh_escape(description)
    );
    match launcher(host, layout) {
        Some(mpi) => format!("{mpi} {simulator}"),
        None => simulator,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::host_profile;

    fn layout(processes: u32, threads: u32) -> ProcessLayout {
        ProcessLayout {
            processes,
            threads_per_process: threads,
            nodes: 1,
            ppn: processes * threads,
        }
    }

    #[test]
    fn single_process_runs_without_mpi() {
        let host = host_profile("nancy");
        let cmd = simulator_command(&host, &layout(1, 4), "/r/in/g.ski", "/r/in", "/r/out");
        assert_eq!(cmd, "'skirt' -t 4 -i '/r/in' -o '/r/out' '/r/in/g.ski'");
    }

    #[test]
    fn appends_process_count_when_no_placeholder() {
        let mut host = host_profile("nancy");
        host.mpi_command = Some("mpirun".into());
        assert_eq!(launcher(&host, &layout(4, 1)).unwrap(), "mpirun -np 4");
    }

    #[test]
    fn fills_placeholder() {
        let mut host = host_profile("delcatty");
        host.mpi_command = Some("mympirun --universe {processes}".into());
        assert_eq!(
            launcher(&host, &layout(8, 1)).unwrap(),
            "mympirun --universe 8"
        );
    }

    #[test]
    fn binding_and_hyperthreading_flags() {
        let mut host = host_profile("swalot");
        host.mpi_command = Some("mpirun".into());
        host.force_process_binding = true;
        assert_eq!(
            launcher(&host, &layout(2, 1)).unwrap(),
            "mpirun -np 2 --bind-to core"
        );
        host.use_hyperthreading = true;
        assert_eq!(
            launcher(&host, &layout(2, 1)).unwrap(),
            "mpirun -np 2 --bind-to hwthread --use-hwthread-cpus"
        );
    }
}
