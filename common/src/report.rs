use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
};

use handlebars::{Handlebars, no_escape};
use serde::Serialize;
use tokio::fs;

use crate::{bench_file::BenchmarkSpec, error::HarnessError};

/// CSV report with one row per benchmark identity.
///
/// An existing non-empty file is appended to as is; a new one gets the
/// header first.
#[derive(Debug)]
pub struct CsvReport {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvReport {
    pub async fn open(path: impl Into<PathBuf>, header: &[&str]) -> Result<Self, HarnessError> {
        let path = path.into();
        let is_new = fs::metadata(&path).await.map(|m| m.len() == 0).unwrap_or(true);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?
            .into_std()
            .await;
        let mut writer = csv::Writer::from_writer(file);
        if is_new {
            writer.write_record(header).map_err(csv_err)?;
            writer.flush()?;
        }
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes and flushes a row so that an aborted run keeps finished rows.
    ///
    /// Rows are small and written between attempts, so this stays blocking.
    pub fn append<I, T>(&mut self, row: I) -> Result<(), HarnessError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.writer.write_record(row).map_err(csv_err)?;
        self.writer.flush()?;
        Ok(())
    }
}

fn csv_err(err: csv::Error) -> HarnessError {
    match err.into_kind() {
        csv::ErrorKind::Io(err) => HarnessError::Io(err),
        other => HarnessError::Io(std::io::Error::other(format!("{other:?}"))),
    }
}

/// Writes one iteration block of a text report.
///
/// Iteration 0 starts the file over, later ones append to it. No lines make
/// an empty block.
pub async fn write_block(path: &Path, lines: &[String], iteration: u32) -> std::io::Result<()> {
    let block = if lines.is_empty() {
        String::new()
    } else {
        format!("{}\n\n", lines.join("\n"))
    };
    if iteration == 0 {
        fs::write(path, block).await
    } else {
        let mut file = fs::OpenOptions::new().append(true).create(true).open(path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, block.as_bytes()).await
    }
}

#[derive(Debug, Serialize)]
struct FilenameValues<'a> {
    time: i64,
    benchmark: &'a str,
    vcpus: String,
    threads: String,
    memsize: &'a str,
    iterations: u32,
    measurements: u64,
    granularity: u64,
    size: String,
}

/// Renders a report filename template such as
/// `{{benchmark}}_{{vcpus}}_{{threads}}_{{memsize}}`.
///
/// `vcpus` and `threads` are zero padded to two digits, `size` is empty when
/// the bench line has none, and slashes in the program name are replaced so
/// the result stays a single path component.
pub fn render_filename(template: &str, spec: &BenchmarkSpec, time: i64) -> Result<String, HarnessError> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry.register_escape_fn(no_escape);

    let benchmark = spec.program.trim_start_matches('/').replace('/', "_");
    let values = FilenameValues {
        time,
        benchmark: &benchmark,
        vcpus: format!("{:02}", spec.vcpus),
        threads: format!("{:02}", spec.threads),
        memsize: &spec.memsize,
        iterations: spec.iterations,
        measurements: spec.measurements,
        granularity: spec.granularity,
        size: spec.size.map(|s| s.to_string()).unwrap_or_default(),
    };
    Ok(registry.render_template(template, &values)?)
}

/// Summary of one benchmark identity, collected into `info.json`
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub bench: String,
    pub identity: String,
    pub report: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stddev: Option<f64>,
}

pub type BenchInfo = HashMap<String, RunInfo>;
