//! The collector's failure taxonomy. Every variant owns a process exit code
//! so downstream tooling can tell classes of failure apart without parsing
//! stderr.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use timeslicer_perf::counter::GroupError;
use timeslicer_perf::events::EncodeError;

use crate::config::MIN_PERIOD;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("cannot open result file {path}: {source}")]
    ResultFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot open subject executable {path}: {source}")]
    ExecutableFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no debug information found for any in-scope mapping")]
    DebugSymbols,

    #[error("bad environment variable {var}: {detail}")]
    Env { var: &'static str, detail: String },

    #[error(transparent)]
    Event(#[from] EncodeError),

    #[error("sample period {period} is below the minimum {MIN_PERIOD}")]
    Param { period: u64 },

    #[error("terminated before the first timeslice")]
    Interrupted,
}

impl CollectorError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CollectorError::Internal(_) => 1,
            CollectorError::ResultFile { .. } => 2,
            CollectorError::ExecutableFile { .. } => 3,
            CollectorError::DebugSymbols => 4,
            CollectorError::Env { .. } => 5,
            CollectorError::Event(_) => 6,
            CollectorError::Param { .. } => 7,
            CollectorError::Interrupted => 255,
        }
    }
}

impl From<GroupError> for CollectorError {
    fn from(err: GroupError) -> Self {
        match err {
            GroupError::BadEvent(e) => CollectorError::Event(e),
            other => CollectorError::Internal(other.to_string()),
        }
    }
}

/// Shorthand for wrapping arbitrary failures into the internal bucket.
pub fn internal(err: impl std::fmt::Display) -> CollectorError {
    CollectorError::Internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_and_stable() {
        assert_eq!(internal("x").exit_code(), 1);
        assert_eq!(
            CollectorError::ResultFile {
                path: "out".into(),
                source: io::Error::from(io::ErrorKind::NotFound),
            }
            .exit_code(),
            2
        );
        assert_eq!(CollectorError::DebugSymbols.exit_code(), 4);
        assert_eq!(
            CollectorError::Env {
                var: "COLLECTOR_PERIOD",
                detail: "not a number".into(),
            }
            .exit_code(),
            5
        );
        assert_eq!(CollectorError::Param { period: 1 }.exit_code(), 7);
        assert_eq!(CollectorError::Interrupted.exit_code(), 255);
    }

    #[test]
    fn group_errors_map_onto_the_taxonomy() {
        let bad = GroupError::BadEvent(
            timeslicer_perf::events::encode("DEFINITELY_NOT_AN_EVENT").unwrap_err(),
        );
        assert_eq!(CollectorError::from(bad).exit_code(), 6);

        let mismatch = GroupError::FdCount {
            expected: 2,
            received: 0,
        };
        assert_eq!(CollectorError::from(mismatch).exit_code(), 1);
    }
}
