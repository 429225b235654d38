// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Reading the simulator's own log file: how a run ended and how far a
//! running one has progressed.

use std::fmt;

/// How the log ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    Finished,
    Crashed,
    Unfinished,
}

pub fn classify(log: &str, prefix: &str) -> LogOutcome {
    let Some(last) = log.lines().rev().find(|line| !line.trim().is_empty()) else {
        return LogOutcome::Unfinished;
    };
    if last.contains(&format!(" Finished simulation {prefix}")) {
        LogOutcome::Finished
    } else if last.contains(" *** Error: ") {
        LogOutcome::Crashed
    } else {
        LogOutcome::Unfinished
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    StellarEmission,
    SelfAbsorption { stage: u8 },
    DustEmission,
    Writing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub phase: Phase,
    pub cycle: Option<u32>,
    pub percent: Option<f32>,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            Phase::Setup => write!(f, "setup"),
            Phase::Writing => write!(f, "writing"),
            Phase::StellarEmission | Phase::DustEmission => {
                let name = if self.phase == Phase::StellarEmission {
                    "stellar emission"
                } else {
                    "dust emission"
                };
                match self.percent {
                    Some(percent) => write!(f, "{name} {percent:.0}%"),
                    None => write!(f, "{name}"),
                }
            }
            Phase::SelfAbsorption { stage } => {
                write!(f, "self-absorption stage {stage}")?;
                if let Some(cycle) = self.cycle {
                    write!(f, ", cycle {cycle}")?;
                }
                if let Some(percent) = self.percent {
                    write!(f, " {percent:.0}%")?;
                }
                Ok(())
            }
        }
    }
}

const STAGES: [(&str, u8); 3] = [("first", 1), ("second", 2), ("last", 3)];

/// Latest recognizable phase in the log, or `None` before setup started.
pub fn progress(log: &str) -> Option<Progress> {
    let mut current: Option<Progress> = None;
    for line in log.lines() {
        if line.contains("Starting setup") {
            current = Some(start(Phase::Setup));
        } else if line.contains("Starting the stellar emission phase") {
            current = Some(start(Phase::StellarEmission));
        } else if line.contains("Launched stellar emission photon packages")
            || line.contains("Launched dust emission photon packages")
        {
            if let Some(progress) = current.as_mut() {
                progress.percent = packages_percent(line);
            }
        } else if line.contains("Starting the dust emission phase") {
            current = Some(start(Phase::DustEmission));
        } else if line.contains("Starting writing results") {
            current = Some(start(Phase::Writing));
        } else if let Some(stage) = self_absorption_stage(line, "Starting the") {
            current = Some(start(Phase::SelfAbsorption { stage }));
        } else if let Some(stage) = self_absorption_stage(line, "Launched") {
            current = Some(Progress {
                phase: Phase::SelfAbsorption { stage },
                cycle: cycle_number(line),
                percent: packages_percent(line),
            });
        }
    }
    current
}

fn start(phase: Phase) -> Progress {
    Progress {
        phase,
        cycle: None,
        percent: None,
    }
}

fn self_absorption_stage(line: &str, verb: &str) -> Option<u8> {
    STAGES.iter().find_map(|(name, stage)| {
        let marker = format!("{verb} {name}-stage dust self-absorption cycle");
        line.contains(&marker).then_some(*stage)
    })
}

fn packages_percent(line: &str) -> Option<f32> {
    let (_, rest) = line.split_once("packages: ")?;
    let (value, _) = rest.split_once('%')?;
    value.trim().parse().ok()
}

fn cycle_number(line: &str) -> Option<u32> {
    let (_, rest) = line.split_once("cycle ")?;
    let (value, _) = rest.split_once(" photon packages")?;
    value.trim().parse().ok()
}
