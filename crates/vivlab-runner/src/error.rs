use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that end a single run early. Everything else a stage can do wrong
/// ends up as a sentinel in the emitted record instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("filesystem_error: {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid_run: {0}")]
    InvalidRun(String),
}

impl PipelineError {
    pub fn fs(path: &Path, source: io::Error) -> Self {
        PipelineError::Filesystem {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
