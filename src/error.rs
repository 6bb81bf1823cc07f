use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CarbonError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unrecognized or malformed data in {}: {message}", path.display())]
    Format { path: PathBuf, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error at {}: {message}", path.display())]
    Storage { path: PathBuf, message: String },

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

impl CarbonError {
    pub(crate) fn format(path: &Path, message: impl Into<String>) -> Self {
        CarbonError::Format {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    pub(crate) fn storage(path: &Path, message: impl std::fmt::Display) -> Self {
        CarbonError::Storage {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }

    /// Fails with `Io` if `path` is missing or cannot be stat'ed.
    pub(crate) fn check_readable(path: &Path) -> Result<()> {
        std::fs::metadata(path)
            .map(|_| ())
            .map_err(|source| CarbonError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
}

pub type Result<T> = std::result::Result<T, CarbonError>;
