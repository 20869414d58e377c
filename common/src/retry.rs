use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{fs::OpenOptions, io::AsyncWriteExt, time::sleep};
use tracing::{debug, error, warn};

use crate::{
    config::RetryPolicy,
    error::HarnessError,
    launcher::{Launched, RunResult},
    stats::extract_sample,
};

/// Runs one attempt of a command
#[async_trait::async_trait]
pub trait Execute: Send + Sync {
    async fn execute(&self, command: &str, limit: Duration) -> Result<RunResult, HarnessError>;
}

/// Runs commands through `sh` in their own process group
#[derive(Debug, Default, Clone)]
pub struct Shell {
    pub env: Option<HashMap<String, String>>,
}

#[async_trait::async_trait]
impl Execute for Shell {
    async fn execute(&self, command: &str, limit: Duration) -> Result<RunResult, HarnessError> {
        let launched = Launched::spawn(command, self.env.as_ref())?;
        launched
            .wait_with_timeout(limit)
            .await
            .map_err(|source| HarnessError::Launch {
                command: command.to_owned(),
                source,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    TimedOut,
    StderrNonEmpty,
    NonZeroExit(Option<i32>),
    MissingSample,
    Success(f64),
}

impl Outcome {
    pub fn of(result: &RunResult) -> Self {
        if result.timed_out {
            Self::TimedOut
        } else if !result.stderr.is_empty() {
            Self::StderrNonEmpty
        } else if result.exit_code != Some(0) {
            Self::NonZeroExit(result.exit_code)
        } else {
            match extract_sample(&result.stdout) {
                Some(sample) => Self::Success(sample),
                None => Self::MissingSample,
            }
        }
    }
}

/// A successful attempt
#[derive(Debug, Clone)]
pub struct Sampled {
    pub sample: f64,
    pub stdout: String,
    /// Number of attempts it took, starting at 1
    pub attempts: u32,
}

/// Retries a command until it yields a timing sample
#[derive(Debug)]
pub struct RetryController<'a, E> {
    policy: &'a RetryPolicy,
    executor: E,
    /// Output of timed out attempts is appended here
    log: Option<PathBuf>,
}

impl<'a, E: Execute> RetryController<'a, E> {
    pub fn new(policy: &'a RetryPolicy, executor: E) -> Self {
        Self {
            policy,
            executor,
            log: None,
        }
    }

    pub fn with_log(mut self, log: impl Into<PathBuf>) -> Self {
        self.log = Some(log.into());
        self
    }

    pub async fn run(&self, command: &str) -> Result<Sampled, HarnessError> {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 0..attempts {
            let limit = self.policy.timeout(attempt);
            debug!("attempt={attempt} timeout={limit:?} command={command}");
            let result = self.executor.execute(command, limit).await?;

            match Outcome::of(&result) {
                Outcome::Success(sample) => {
                    return Ok(Sampled {
                        sample,
                        stdout: result.stdout,
                        attempts: attempt + 1,
                    });
                }
                Outcome::TimedOut => {
                    error!("Subprocess timed out after {limit:?}");
                    if let Some(log) = &self.log {
                        append(log, &result.stdout).await?;
                    }
                }
                Outcome::StderrNonEmpty => {
                    error!("Subprocess stderr: {}", result.stderr.trim_end())
                }
                Outcome::NonZeroExit(code) => {
                    error!("Subprocess failed with exit code {code:?}")
                }
                Outcome::MissingSample => error!("{}", HarnessError::MissingSample),
            }

            if attempt + 1 < attempts {
                warn!("Retrying ({}/{attempts})", attempt + 2);
                sleep(self.policy.delay()).await;
            }
        }

        error!("Command failed after {attempts} attempts");
        Err(HarnessError::Exhausted { attempts })
    }
}

async fn append(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await
}
