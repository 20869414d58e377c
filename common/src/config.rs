use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{bench::Bench, launcher::GuestSizing};

pub const DEFAULT_RUNNER: &str = "../osv/scripts/run.py";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    #[serde(default)]
    pub settings: Settings,
    pub benches: Vec<InnerBench>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Parent folder of every run folder, `results` if unset
    pub results_dir: Option<String>,
    /// OSv `run.py` used to boot guests
    pub runner: Option<String>,
    /// Flags passed to the runner before the sizing flags
    pub runner_args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    /// Pin commands to their CPU range with `taskset`, on by default
    pub pin_cpus: Option<bool>,
}

impl Settings {
    pub fn pin_cpus(&self) -> bool {
        self.pin_cpus.unwrap_or(true)
    }

    /// The inclusive CPU range to pin to, if pinning is enabled
    pub fn cpus(&self, first: u32, count: u32) -> Option<(u32, u32)> {
        self.pin_cpus()
            .then(|| (first, first + count.max(1) - 1))
    }

    /// Sizing flags for booting a guest with `vcpus` and `memsize`
    pub fn guest(&self, vcpus: u32, memsize: &str) -> GuestSizing {
        GuestSizing {
            runner: self.runner().to_owned(),
            runner_args: self.runner_args(),
            vcpus,
            memsize: memsize.to_owned(),
        }
    }

    pub fn results_dir(&self) -> &str {
        self.results_dir.as_deref().unwrap_or("results")
    }

    pub fn runner(&self) -> &str {
        self.runner.as_deref().unwrap_or(DEFAULT_RUNNER)
    }

    pub fn runner_args(&self) -> Vec<String> {
        self.runner_args
            .clone()
            .unwrap_or_else(|| vec!["--novnc".to_owned(), "--nogdb".to_owned()])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerBench {
    pub name: String,
    pub bench: Box<dyn Bench>,
}

/// Where the benchmark program executes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Inside an OSv guest booted through the runner
    #[default]
    Guest,
    /// Directly on the host
    Native,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub timeout_secs: u64,
    pub timeout_increment_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            delay_ms: 1000,
            timeout_secs: 20,
            timeout_increment_secs: 10,
        }
    }
}

impl RetryPolicy {
    /// Timeout of the zero based `attempt`
    pub fn timeout(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.timeout_secs + u64::from(attempt) * self.timeout_increment_secs)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}
