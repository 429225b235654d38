// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod layout;
pub mod mpi;
pub mod pbs;
pub mod quota;
pub mod random;
pub mod retry;
pub mod scripts;
pub mod shell;
pub mod simlog;
pub mod slurm;
pub mod walltime;
