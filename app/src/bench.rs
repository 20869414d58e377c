use std::path::{Path, PathBuf};

use chrono::{Local, Utc};
use common::{
    bench::RunContext,
    config::{Config, InnerBench},
    report::BenchInfo,
};
use eyre::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use tokio::fs::{copy, create_dir_all};
use tracing::{debug, error};

use crate::read_config;

pub async fn run_benchmark(config_file: &str, no_progress: bool, stdout: bool) -> Result<()> {
    let config = read_config(config_file).await?;

    let file_prefix = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let results_path =
        PathBuf::from(config.settings.results_dir()).join(format!("{}-{file_prefix}", config.name));
    println!("Results created in folder: {}", results_path.display());
    create_dir_all(&results_path).await?;
    copy(config_file, results_path.join("config.yaml")).await?;

    let progress = progress_bar(&config, no_progress).await?;
    let time = Utc::now().timestamp_nanos_opt().unwrap_or_default();

    let mut benchmark_info = BenchInfo::new();
    for experiment in &config.benches {
        let info = run_experiment(&config, experiment, &results_path, time, stdout, &progress)
            .await
            .with_context(|| format!("Running {}", experiment.name))?;
        benchmark_info.extend(info);
        tokio::fs::write(
            results_path.join("info.json"),
            serde_json::to_string_pretty(&benchmark_info)?,
        )
        .await?;
        debug!("Done with bench {}", experiment.name);
    }
    progress.finish_and_clear();

    debug!("Exiting");
    Ok(())
}

async fn run_experiment(
    config: &Config,
    experiment: &InnerBench,
    results_path: &Path,
    time: i64,
    stdout: bool,
    progress: &ProgressBar,
) -> Result<BenchInfo> {
    let experiment_path = results_path.join(&experiment.name);
    create_dir_all(&experiment_path).await?;

    let ctx = RunContext {
        name: &experiment.name,
        settings: &config.settings,
        results_path: &experiment_path,
        time,
        stdout,
        progress: progress.clone(),
    };
    let result = experiment.bench.run(&ctx).await;
    if let Err(err) = &result {
        error!("Failed to run benchmark {}: {err}", experiment.name);
    }
    result
}

/// One step per benchmark identity across every bench of the config
async fn progress_bar(config: &Config, hidden: bool) -> Result<ProgressBar> {
    if hidden {
        return Ok(ProgressBar::hidden());
    }

    let mut total = 0;
    for experiment in &config.benches {
        let cmds = experiment.bench.cmds(&config.settings).await?;
        total += cmds.iter().map(|cmd| &cmd.identity).unique().count();
    }
    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?,
    );
    Ok(progress)
}
