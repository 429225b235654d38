// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

/// Walltime actually requested and enforced for a host.
///
/// Preferred wins when set, but never exceeds the maximum. With only a
/// maximum, the maximum is requested. With neither, the run is unbounded.
pub fn effective(preferred: Option<Duration>, maximum: Option<Duration>) -> Option<Duration> {
    match (preferred, maximum) {
        (Some(preferred), Some(maximum)) => Some(preferred.min(maximum)),
        (Some(preferred), None) => Some(preferred),
        (None, Some(maximum)) => Some(maximum),
        (None, None) => None,
    }
}

/// Upper bound on a configured walltime, one year.
pub const MAX_HOURS: f64 = 365.0 * 24.0;

/// Host files express walltimes in (possibly fractional) hours.
pub fn from_hours(hours: f64) -> Option<Duration> {
    if !hours.is_finite() || hours <= 0.0 || hours > MAX_HOURS {
        return None;
    }
    Some(Duration::from_secs((hours * 3600.0).round() as u64))
}

pub fn to_hours(walltime: Duration) -> f64 {
    walltime.as_secs_f64() / 3600.0
}

/// `HH:MM:SS` with unbounded hours, as accepted by `#PBS -l walltime=`.
pub fn format_pbs(walltime: Duration) -> String {
    let total = walltime.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// `D-HH:MM:SS`, as accepted by `#SBATCH --time=`.
pub fn format_slurm(walltime: Duration) -> String {
    let total = walltime.as_secs();
    let days = total / 86_400;
    let rest = total % 86_400;
    format!(
        "{}-{:02}:{:02}:{:02}",
        days,
        rest / 3600,
        (rest % 3600) / 60,
        rest % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(hours: u64) -> Duration {
        Duration::from_secs(hours * 3600)
    }

    #[test]
    fn preferred_above_maximum_is_capped() {
        assert_eq!(effective(Some(h(36)), Some(h(24))), Some(h(24)));
        assert_eq!(effective(Some(h(200)), Some(h(72))), Some(h(72)));
    }

    #[test]
    fn preferred_below_maximum_is_kept() {
        assert_eq!(effective(Some(h(12)), Some(h(72))), Some(h(12)));
    }

    #[test]
    fn maximum_alone_becomes_requested() {
        assert_eq!(effective(None, Some(h(72))), Some(h(72)));
    }

    #[test]
    fn preferred_alone_and_unbounded() {
        assert_eq!(effective(Some(h(36)), None), Some(h(36)));
        assert_eq!(effective(None, None), None);
    }

    #[test]
    fn hours_conversion_rejects_nonsense() {
        assert_eq!(from_hours(1.5), Some(Duration::from_secs(5400)));
        assert_eq!(from_hours(0.0), None);
        assert_eq!(from_hours(f64::NAN), None);
        assert_eq!(from_hours(1e16), None);
        assert_eq!(from_hours(f64::INFINITY), None);
        assert_eq!(from_hours(MAX_HOURS), Some(h(365 * 24)));
    }

    #[test]
    fn formats_for_both_scheduler_families() {
        assert_eq!(format_pbs(h(36)), "36:00:00");
        assert_eq!(format_pbs(Duration::from_secs(5430)), "01:30:30");
        assert_eq!(format_slurm(h(36)), "1-12:00:00");
        assert_eq!(format_slurm(Duration::from_secs(59)), "0-00:00:59");
    }
}
