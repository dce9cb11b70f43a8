//! Error kinds shared across the pipeline.

use std::path::PathBuf;

//tp Error
/// The single error type returned by every fallible function in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Parse(String),

    #[error("source extractor failed: {0}")]
    ExtractorFailed(String),

    #[error("astrometry solve failed: {0}")]
    AstrometryFailed(String),

    #[error("reference catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("model fit failed: {0}")]
    ModelFitFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

//ip Error
impl Error {
    //cp io
    /// Wrap an I/O error with the path that was being operated on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

//ip From<toml::de::Error> for Error
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Parse(e.to_string())
    }
}
