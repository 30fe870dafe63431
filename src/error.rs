//! Fatal errors raised before the watch loop starts.

use std::path::PathBuf;

use thiserror::Error;

/// Failures that stop rerun before it begins watching.
///
/// Everything that can go wrong once the loop is running (stage failures,
/// signal delivery, launch errors) is reported and recovered from instead.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no target given")]
    MissingTarget,
    #[error("invalid toolchain root {}: not a directory", .0.display())]
    InvalidToolchainRoot(PathBuf),
    #[error("cannot resolve {target}: {message}")]
    Resolution { target: String, message: String },
    #[error("{target} is part of the standard library")]
    StandardLibrary { target: String },
    #[error("expected package \"main\", got {name:?}")]
    NotExecutable { name: String },
    #[error("watch root {} is not readable", .path.display())]
    WatchRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid ignore pattern {pattern:?}")]
    IgnorePattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}
