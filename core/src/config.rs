//! Job configuration — scheduling knobs and batch sizes.
//!
//! All values come from the environment with documented defaults, so a
//! bare deployment runs sensibly with nothing set. Invalid values fall
//! back to the default (logged), never abort startup.

use std::time::Duration;

/// Environment variable names, kept stable across deployments.
const ENV_FIRST_RUN_DELAY_MINUTES: &str = "FORMULA_JOB_FIRST_RUN_DELAY_MINUTES";
const ENV_INTERVAL_HOURS: &str = "FORMULA_JOB_INTERVAL_HOURS";
const ENV_SCHEDULED_BATCH_SIZE: &str = "SCHEDULED_JOB_BATCH_SIZE";
const ENV_FORMULA_BATCH_SIZE: &str = "FORMULA_JOB_BATCH_SIZE";

#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    /// Delay before the first scheduled run after process start.
    pub first_run_delay: Duration,
    /// Fixed interval between scheduled runs.
    pub repeat_interval: Duration,
    /// Batch size for general scheduled processing.
    pub scheduled_batch_size: usize,
    /// Batch size for formula calculation. Takes precedence over
    /// `scheduled_batch_size` inside the job runner when set (> 0).
    pub formula_batch_size: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            first_run_delay: Duration::from_secs(60),
            repeat_interval: Duration::from_secs(2 * 60 * 60),
            scheduled_batch_size: 5000,
            formula_batch_size: 1000,
        }
    }
}

impl JobConfig {
    /// Build a config from the environment, falling back to defaults
    /// for anything absent or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let delay_minutes = read_env_u64(
            ENV_FIRST_RUN_DELAY_MINUTES,
            defaults.first_run_delay.as_secs() / 60,
        );
        let interval_hours = read_env_f64(
            ENV_INTERVAL_HOURS,
            defaults.repeat_interval.as_secs() as f64 / 3600.0,
        );

        Self {
            first_run_delay: Duration::from_secs(delay_minutes * 60),
            repeat_interval: Duration::from_secs((interval_hours * 3600.0).max(1.0) as u64),
            scheduled_batch_size: read_env_u64(
                ENV_SCHEDULED_BATCH_SIZE,
                defaults.scheduled_batch_size as u64,
            ) as usize,
            formula_batch_size: read_env_u64(
                ENV_FORMULA_BATCH_SIZE,
                defaults.formula_batch_size as u64,
            ) as usize,
        }
    }

    /// Effective batch size for formula processing: the formula-specific
    /// knob wins when defined, otherwise the general scheduled-job size.
    pub fn effective_batch_size(&self) -> usize {
        if self.formula_batch_size > 0 {
            self.formula_batch_size
        } else {
            self.scheduled_batch_size.max(1)
        }
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("{name}={raw:?} is not a valid integer, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

fn read_env_f64(name: &str, default: f64) -> f64 {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<f64>() {
            Ok(v) if v > 0.0 => v,
            _ => {
                log::warn!("{name}={raw:?} is not a valid positive number, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}
