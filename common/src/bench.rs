use core::fmt::Debug;
use std::path::Path;

use dyn_clone::{DynClone, clone_trait_object};
use eyre::{Context, Result};
use indicatif::ProgressBar;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    classify::{CaptureMode, Classifier, Markers},
    config::Settings,
    launcher::Launched,
    report::{BenchInfo, write_block},
};

/// One command a bench launches
#[derive(Debug, Clone, Serialize)]
pub struct Cmd {
    /// Benchmark identity the command belongs to
    pub identity: String,
    pub iteration: u32,
    pub command: String,
}

/// Everything a bench needs while it runs
pub struct RunContext<'a> {
    /// Name of the experiment in the config
    pub name: &'a str,
    pub settings: &'a Settings,
    /// Run folder that reports are written to
    pub results_path: &'a Path,
    /// Run start in nanoseconds since the epoch, used in report names
    pub time: i64,
    /// Print classified output instead of writing text reports
    pub stdout: bool,
    pub progress: ProgressBar,
}

impl RunContext<'_> {
    /// Prints above the progress bar
    pub fn println(&self, text: &str) {
        self.progress.suspend(|| println!("{text}"));
    }
}

#[typetag::serde(tag = "type")]
#[async_trait::async_trait]
pub trait Bench: Debug + DynClone + Send + Sync {
    /// Name of the bench, for identification
    fn name(&self) -> &'static str;
    /// Every command the bench would launch, in launch order
    async fn cmds(&self, settings: &Settings) -> Result<Vec<Cmd>>;
    /// Runs the bench, returning a summary per benchmark identity
    ///
    /// Arguments:
    /// * `ctx` - Settings, run folder and output mode of the current run
    async fn run(&self, ctx: &RunContext<'_>) -> Result<BenchInfo>;
}
clone_trait_object!(Bench);

/// Launches `cmd` and streams its output through a classifier.
///
/// The classified lines are printed in stdout mode, otherwise written as one
/// block of `report`.
pub async fn run_classified(
    ctx: &RunContext<'_>,
    cmd: &Cmd,
    markers: &Markers,
    mode: CaptureMode,
    report: &Path,
) -> Result<Vec<String>> {
    ctx.progress
        .set_message(format!("{} {}", cmd.identity, cmd.iteration));
    info!("Executing (iteration {}): {}", cmd.iteration + 1, cmd.command);

    let launched = Launched::spawn(&cmd.command, ctx.settings.env.as_ref())?;
    let output = Classifier::new(markers, mode, cmd.iteration)
        .drive(launched)
        .await?;

    if output.is_empty() {
        warn!("No output kept for {} iteration {}", cmd.identity, cmd.iteration);
    }
    if ctx.stdout {
        if !output.is_empty() {
            ctx.println(&output.join("\n"));
        }
    } else {
        // iteration 0 always truncates, even with nothing kept
        write_block(report, &output, cmd.iteration)
            .await
            .with_context(|| format!("Writing report {}", report.display()))?;
    }
    Ok(output)
}
