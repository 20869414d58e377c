use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// The guest printed an unrecoverable failure marker
    #[error("Detected error in output: {line}")]
    Fatal { line: String },
    #[error("Could not launch `{command}`")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Command failed after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("{}:{line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("No timing sample found in output")]
    MissingSample,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid filename template")]
    Template(#[from] handlebars::RenderError),
}
