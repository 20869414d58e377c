use std::path::Path;

use common::{
    bench::{Bench, Cmd, RunContext},
    config::{Environment, RetryPolicy, Settings},
    launcher::{check_cpu_range, shell_command},
    report::{BenchInfo, CsvReport, RunInfo},
    retry::{RetryController, Shell},
    stats::AggregateResult,
};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const GUEST_DUCKDB: &str = "/duckdb";
const NATIVE_DUCKDB: &str = "../osv/benchmarks/duckdb/duckdb/build/release/duckdb";

/// TPC-H queries through the DuckDB shell, retried until they report a time
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tpch {
    /// Scale factor, the database file is `{scale_factor}.db`
    pub scale_factor: String,
    #[serde(default)]
    pub environment: Environment,
    /// Query numbers, 1 to 22 if unset
    pub queries: Option<Vec<u32>>,
    pub cpu_offset: Option<u32>,
    /// CPUs to pin to, and guest vcpus, 64 if unset
    pub vcpus: Option<u32>,
    /// Guest memory, 200G if unset
    pub memsize: Option<String>,
    /// DuckDB shell binary
    pub duckdb: Option<String>,
    /// Directory with the `{query}.sql` files
    pub query_dir: Option<String>,
    /// Successful runs per query
    pub repeat: Option<u32>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Tpch {
    fn queries(&self) -> Vec<u32> {
        self.queries.clone().unwrap_or_else(|| (1..=22).collect())
    }

    fn vcpus(&self) -> u32 {
        self.vcpus.unwrap_or(64)
    }

    fn query_cmd(&self, settings: &Settings, query: u32) -> Cmd {
        let duckdb = self.duckdb.as_deref().unwrap_or(match self.environment {
            Environment::Guest => GUEST_DUCKDB,
            Environment::Native => NATIVE_DUCKDB,
        });
        let query_file = Path::new(self.query_dir.as_deref().unwrap_or("/tpch")).join(format!("{query}.sql"));
        let program = format!("{duckdb} -f {} {}.db", query_file.display(), self.scale_factor);

        let cpus = settings.cpus(self.cpu_offset.unwrap_or(0), self.vcpus());
        let command = match self.environment {
            Environment::Guest => {
                let guest = settings.guest(self.vcpus(), self.memsize.as_deref().unwrap_or("200G"));
                shell_command(cpus, Some(&guest), &program)
            }
            Environment::Native => shell_command(cpus, None, &program),
        };
        Cmd {
            identity: query.to_string(),
            iteration: 0,
            command,
        }
    }
}

#[async_trait::async_trait]
#[typetag::serde]
impl Bench for Tpch {
    fn name(&self) -> &'static str {
        "tpch"
    }

    async fn cmds(&self, settings: &Settings) -> Result<Vec<Cmd>> {
        Ok(self
            .queries()
            .into_iter()
            .map(|query| self.query_cmd(settings, query))
            .collect())
    }

    async fn run(&self, ctx: &RunContext<'_>) -> Result<BenchInfo> {
        let report_path = ctx.results_path.join(format!("{}.csv", ctx.name));
        let log = ctx.results_path.join(format!("{}.log", ctx.name));
        let mut report = CsvReport::open(&report_path, &["query", "mean", "stddev"])
            .await
            .with_context(|| format!("Opening report {}", report_path.display()))?;
        let controller = RetryController::new(
            &self.retry,
            Shell {
                env: ctx.settings.env.clone(),
            },
        )
        .with_log(&log);

        if let Some((_, last)) = ctx.settings.cpus(self.cpu_offset.unwrap_or(0), self.vcpus()) {
            check_cpu_range(last);
        }

        let repeat = self.repeat.unwrap_or(1).max(1);
        let mut info = BenchInfo::new();
        for query in self.queries() {
            let cmd = self.query_cmd(ctx.settings, query);
            ctx.progress.set_message(format!("query {query}"));
            info!("Executing: {}", cmd.command);

            let mut aggregate = AggregateResult::default();
            for run in 0..repeat {
                let sampled = controller
                    .run(&cmd.command)
                    .await
                    .with_context(|| format!("Query {query}"))?;
                debug!("query={query} run={run} attempts={} sample={}", sampled.attempts, sampled.sample);
                if ctx.stdout {
                    ctx.println(&sampled.stdout);
                }
                aggregate.push(sampled.sample);
            }

            let mean = aggregate.mean().unwrap_or_default();
            let stddev = aggregate.stddev();
            info!("query {query}: samples={:?} mean={mean:.4}s stddev={stddev:.4}s", aggregate.samples);
            report.append([query.to_string(), mean.to_string(), stddev.to_string()])?;
            ctx.progress.inc(1);

            info.insert(
                format!("{}-q{query}", ctx.name),
                RunInfo {
                    bench: self.name().to_owned(),
                    identity: cmd.identity,
                    report: report.path().to_path_buf(),
                    samples: Some(aggregate.samples.clone()),
                    mean: Some(mean),
                    stddev: Some(stddev),
                },
            );
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use common::error::HarnessError;
    use indicatif::ProgressBar;

    use super::*;

    fn fake_duckdb(dir: &Path, body: &str) -> String {
        let duckdb = dir.join("duckdb");
        std::fs::write(&duckdb, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&duckdb, std::fs::Permissions::from_mode(0o755)).unwrap();
        duckdb.to_str().unwrap().to_owned()
    }

    fn native(duckdb: String, retry: RetryPolicy) -> Tpch {
        Tpch {
            scale_factor: "sf1".to_owned(),
            environment: Environment::Native,
            queries: Some(vec![1, 6]),
            duckdb: Some(duckdb),
            query_dir: Some("/tpch".to_owned()),
            repeat: Some(2),
            retry,
            ..Tpch::default()
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay_ms: 0,
            timeout_secs: 5,
            timeout_increment_secs: 0,
        }
    }

    #[tokio::test]
    async fn default_queries_in_guest() {
        let bench = Tpch {
            scale_factor: "sf10".to_owned(),
            ..Tpch::default()
        };
        let cmds = bench.cmds(&Settings::default()).await.unwrap();
        assert_eq!(cmds.len(), 22);
        assert_eq!(cmds[21].identity, "22");
        assert_eq!(
            cmds[0].command,
            "taskset -c 0-63 ../osv/scripts/run.py --novnc --nogdb --vcpus 64 --memsize 200G -e \"/duckdb -f /tpch/1.sql sf10.db\""
        );
    }

    #[tokio::test]
    async fn writes_mean_and_stddev_per_query() {
        let dir = tempfile::tempdir().unwrap();
        // alternates between 1.0 and 3.0 across invocations
        let state = dir.path().join("state");
        let duckdb = fake_duckdb(
            dir.path(),
            &format!(
                "echo 'Run Time (s): real 9.9'\nif [ -e {0} ]; then rm {0}; echo 'Run Time (s): real 3.0'; else touch {0}; echo 'Run Time (s): real 1.0'; fi",
                state.display()
            ),
        );
        let bench = native(duckdb, fast_retry(8));
        let settings = Settings {
            pin_cpus: Some(false),
            ..Settings::default()
        };
        let ctx = RunContext {
            name: "tpch",
            settings: &settings,
            results_path: dir.path(),
            time: 0,
            stdout: false,
            progress: ProgressBar::hidden(),
        };

        let info = bench.run(&ctx).await.unwrap();
        let csv = std::fs::read_to_string(dir.path().join("tpch.csv")).unwrap();
        let rows = csv.lines().collect::<Vec<_>>();
        assert_eq!(rows[0], "query,mean,stddev");
        assert_eq!(rows.len(), 3);
        assert!(rows[1].starts_with("1,2,1.414"));
        assert_eq!(info["tpch-q6"].samples, Some(vec![1.0, 3.0]));
    }

    #[tokio::test]
    async fn exhausted_retries_abort() {
        let dir = tempfile::tempdir().unwrap();
        let duckdb = fake_duckdb(dir.path(), "echo 'Error: Catalog Error' >&2\nexit 1");
        let bench = native(duckdb, fast_retry(3));
        let settings = Settings {
            pin_cpus: Some(false),
            ..Settings::default()
        };
        let ctx = RunContext {
            name: "tpch",
            settings: &settings,
            results_path: dir.path(),
            time: 0,
            stdout: false,
            progress: ProgressBar::hidden(),
        };

        let err = bench.run(&ctx).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::Exhausted { attempts: 3 })
        ));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("tpch.csv")).unwrap(),
            "query,mean,stddev\n"
        );
    }
}
