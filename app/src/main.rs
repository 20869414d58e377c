use std::path::PathBuf;

use clap::{Parser, Subcommand};
use common::config::Config;
use eyre::Result;
use tokio::fs::{create_dir_all, read_dir, read_to_string};
use tracing::{debug, error};
use tracing_subscriber::{
    EnvFilter,
    fmt::{layer, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod bench;

#[derive(Parser)]
#[command(version, about = "Runs OSv guest and native benchmarks and collects their results")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(long, default_value_t = false)]
    no_progress: bool,
    /// Extra tracing filter directives, ie. `common=debug`
    #[arg(short, long)]
    log: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List previous runs
    Ls {
        #[arg(short, long, default_value = "results")]
        results_dir: String,
    },
    /// Run the benches of a config
    Bench {
        #[arg(short, long, default_value = "config.yaml")]
        config_file: String,
        /// Print classified output instead of writing text reports
        #[arg(long, default_value_t = false)]
        stdout: bool,
    },
    /// Print the commands a config would launch
    Print {
        #[arg(short, long, default_value = "config.yaml")]
        config_file: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let modules = default_benches::MODULES;
    let log_level = std::env::var("RUST_LOG").unwrap_or("warn".to_owned());
    let args = Cli::parse();
    let file_appender = tracing_appender::rolling::never(".", "log.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let mut env_filter = EnvFilter::new(format!("osv_bench={log_level}"));

    for log in &args.log {
        env_filter = env_filter.add_directive(log.parse()?);
    }

    for module in modules {
        if !args.log.iter().any(|x| x.starts_with(module)) {
            env_filter = env_filter.add_directive(format!("{module}={log_level}").parse()?);
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            layer()
                .with_writer(std::io::stderr)
                .with_timer(ChronoLocal::new("%v %k:%M:%S %z".to_owned()))
                .compact(),
        )
        .with(layer().with_writer(non_blocking).with_ansi(false))
        .init();

    debug!("Benches: {:?}", default_benches::init_benches());

    match args.command {
        Commands::Ls { results_dir } => list_runs(&results_dir).await?,
        Commands::Bench {
            config_file,
            stdout,
        } => {
            if let Err(err) = bench::run_benchmark(&config_file, args.no_progress, stdout).await {
                error!("{err:#?}");
                return Err(err);
            }
        }
        Commands::Print { config_file } => print_commands(&config_file).await?,
    };

    Ok(())
}

async fn read_config(path: impl Into<PathBuf>) -> Result<Config> {
    use eyre::Context;

    let path = path.into();
    let contents = read_to_string(&path)
        .await
        .with_context(|| format!("Reading config {}", path.display()))?;
    serde_yml::from_str(&contents).with_context(|| format!("Parsing config {}", path.display()))
}

async fn list_runs(results_dir: &str) -> Result<()> {
    create_dir_all(results_dir).await?;
    let mut items = read_dir(results_dir).await?;
    let mut runs = Vec::new();
    while let Some(entry) = items.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            let config_file = entry.path().join("config.yaml");
            if config_file.exists() {
                let config = read_config(config_file).await?;
                runs.push((config.name, entry.file_name()));
            }
        }
    }
    runs.sort();
    for (name, folder) in runs {
        println!("{} -> {}", name, folder.to_string_lossy());
    }
    Ok(())
}

async fn print_commands(config_file: &str) -> Result<()> {
    let config = read_config(config_file).await?;
    for experiment in &config.benches {
        println!("# {} ({})", experiment.name, experiment.bench.name());
        for cmd in experiment.bench.cmds(&config.settings).await? {
            println!("{}", cmd.command);
        }
    }
    Ok(())
}
