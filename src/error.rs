use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CsxError {
    /// Invalid run configuration. Always raised before any sampling starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// A distribution was asked for with parameters outside its support.
    #[error("invalid distribution parameter: {0}")]
    InvalidParameter(String),

    #[error("cannot read or write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("numerical failure: {0}")]
    Numerical(String),

    /// A sampler or accumulator was driven in a way its current state does not allow.
    #[error("invalid sampler state: {0}")]
    State(String),
}

impl CsxError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CsxError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        CsxError::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CsxError>;
