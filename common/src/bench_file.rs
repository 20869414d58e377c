//! Whitespace separated bench files, one benchmark per line:
//!
//! ```text
//! # program vcpus threads memsize iterations measurements granularity [size]
//! /alloc_bench 4 2 1G 5 10 1
//! ```
use std::{path::Path, str::FromStr};

use serde::Serialize;
use tokio::fs::read_to_string;

use crate::error::HarnessError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BenchmarkSpec {
    pub program: String,
    pub vcpus: u32,
    pub threads: u32,
    pub memsize: String,
    pub iterations: u32,
    pub measurements: u64,
    pub granularity: u64,
    pub size: Option<u64>,
}

impl BenchmarkSpec {
    /// Arguments passed to the benchmark program itself.
    ///
    /// `-i` is only passed when the program loops internally; host side
    /// iteration launches the program once per iteration instead.
    pub fn program_args(&self, with_iterations: bool) -> String {
        let mut args = format!("-t {}", self.threads);
        if with_iterations {
            args.push_str(&format!(" -i {}", self.iterations));
        }
        args.push_str(&format!(" -m {} -g {}", self.measurements, self.granularity));
        if let Some(size) = self.size {
            args.push_str(&format!(" -s {size}"));
        }
        args
    }
}

fn field<T: FromStr>(token: &str, name: &str) -> Result<T, String> {
    token
        .parse()
        .map_err(|_| format!("Invalid {name} `{token}`"))
}

fn parse_fields(line: &str) -> Result<BenchmarkSpec, String> {
    let tokens = line.split_whitespace().collect::<Vec<_>>();
    let (fixed, size) = match tokens.len() {
        7 => (&tokens[..], None),
        8 => (&tokens[..7], Some(field(tokens[7], "size")?)),
        n => return Err(format!("Expected 7 or 8 fields, found {n}")),
    };

    Ok(BenchmarkSpec {
        program: fixed[0].to_owned(),
        vcpus: field(fixed[1], "vcpus")?,
        threads: field(fixed[2], "threads")?,
        memsize: fixed[3].to_owned(),
        iterations: field(fixed[4], "iterations")?,
        measurements: field(fixed[5], "measurements")?,
        granularity: field(fixed[6], "granularity")?,
        size,
    })
}

/// Parses bench file contents. `path` is only used for error reporting.
pub fn parse_bench_file(contents: &str, path: &Path) -> Result<Vec<BenchmarkSpec>, HarnessError> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(idx, line)| {
            parse_fields(line.trim()).map_err(|reason| HarnessError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                reason,
            })
        })
        .collect()
}

pub async fn read_bench_file(path: &Path) -> eyre::Result<Vec<BenchmarkSpec>> {
    use eyre::Context;

    let contents = read_to_string(path)
        .await
        .with_context(|| format!("Reading bench file {}", path.display()))?;
    Ok(parse_bench_file(&contents, path)?)
}
