use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while loading `selena.toml`/`browser.toml` or compiling the
/// settings derived from them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("cannot parse {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("archive pattern {pattern:?} does not compile: {source}")]
    Pattern {
        source: regex::Error,
        pattern: String,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
