//! Line by line classification of benchmark output.
//!
//! Rules are checked in a fixed order and the first one that matches wins:
//! fatal marker, start marker, boot marker, section marker, capture.
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{error::HarnessError, launcher::Launched};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Markers {
    /// Substrings that mean the guest is beyond saving
    pub fatal: Vec<String>,
    /// Prefix of the first line worth keeping
    pub start: Option<String>,
    /// Prefix of the boot completion line, whose fourth token is kept
    pub boot: Option<String>,
    /// Prefix of the line that opens the results of an iteration
    pub section: Option<String>,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            fatal: ["[backtrace]", "Out of memory", "page fault"]
                .into_iter()
                .map(|x| x.to_owned())
                .collect(),
            start: Some("OSv".to_owned()),
            boot: None,
            section: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMode {
    /// Keep only the start marker line of the first iteration
    StartLine,
    /// Keep everything from the start marker onward
    #[default]
    FromStart,
    /// Keep everything on the first iteration, and whatever follows a
    /// section marker on later ones
    FirstIteration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Fatal,
    Started,
    Boot,
    Section,
    Captured,
    Ignored,
}

#[derive(Debug)]
pub struct Classifier<'a> {
    markers: &'a Markers,
    mode: CaptureMode,
    iteration: u32,
    capturing: bool,
    started: bool,
    pending: Option<String>,
    output: Vec<String>,
}

impl<'a> Classifier<'a> {
    pub fn new(markers: &'a Markers, mode: CaptureMode, iteration: u32) -> Self {
        Self {
            markers,
            mode,
            iteration,
            capturing: mode == CaptureMode::FirstIteration && iteration == 0,
            started: false,
            pending: None,
            output: Vec::new(),
        }
    }

    pub fn feed(&mut self, line: &str) -> Verdict {
        let line = line.trim();
        let starts = |prefix: &Option<String>| prefix.as_deref().is_some_and(|p| line.starts_with(p));

        if self.markers.fatal.iter().any(|marker| line.contains(marker.as_str())) {
            return Verdict::Fatal;
        }

        if !self.started && !self.capturing && starts(&self.markers.start) {
            self.started = true;
            match self.mode {
                CaptureMode::StartLine if self.iteration != 0 => return Verdict::Ignored,
                CaptureMode::FromStart => self.capturing = true,
                _ => {}
            }
            self.output.push(line.to_owned());
            return Verdict::Started;
        }

        if starts(&self.markers.boot) {
            let payload = line
                .split(' ')
                .nth(3)
                .or_else(|| {
                    self.markers
                        .boot
                        .as_deref()
                        .and_then(|p| line.strip_prefix(p))
                        .map(|rest| rest.trim())
                })
                .unwrap_or_default();
            self.pending = Some(payload.to_owned());
            return Verdict::Boot;
        }

        if starts(&self.markers.section) {
            let header = match &self.markers.boot {
                Some(_) => format!(
                    "iteration {}:\n\n{}",
                    self.iteration,
                    self.pending.take().unwrap_or_default()
                ),
                None => format!("iteration {}:\n", self.iteration),
            };
            self.output.push(header);
            if self.mode == CaptureMode::FirstIteration {
                self.capturing = true;
            }
            return Verdict::Section;
        }

        if self.capturing {
            self.output.push(line.to_owned());
            return Verdict::Captured;
        }

        Verdict::Ignored
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn into_output(self) -> Vec<String> {
        self.output
    }

    /// Feeds every stdout line of `launched` through the classifier.
    ///
    /// A fatal marker terminates the process group and fails immediately,
    /// without reading any further output.
    pub async fn drive(mut self, mut launched: Launched) -> Result<Vec<String>, HarnessError> {
        let command = launched.command().to_owned();
        let io_err = |source| HarnessError::Launch {
            command: command.clone(),
            source,
        };

        loop {
            let line = match launched.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(source) => return Err(io_err(source)),
            };
            let verdict = self.feed(&line);
            debug!("{verdict:?}: {line}");
            if verdict == Verdict::Fatal {
                error!("Detected error in output: {line}");
                if let Err(err) = launched.terminate() {
                    warn!("Could not terminate {}: {err}", launched.command());
                }
                return Err(HarnessError::Fatal {
                    line: line.trim().to_owned(),
                });
            }
        }

        let result = launched.wait().await.map_err(io_err)?;
        if result.exit_code != Some(0) {
            warn!("`{command}` exited with {:?}", result.exit_code);
        }
        if !result.stderr.is_empty() {
            debug!("stderr of `{command}`: {}", result.stderr);
        }
        Ok(self.output)
    }
}
