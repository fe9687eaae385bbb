//! Error types for Tidelog with stable wire codes.

use thiserror::Error;

use crate::types::StorageTeamId;

/// A specialized `Result` type for Tidelog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the TLog state machines and storage layers.
///
/// Each variant maps to a stable string code (see [`Error::code`]) carried
/// across the wire, so peers distinguish the kinds without sharing the enum
/// layout.
#[derive(Debug, Error)]
pub enum Error {
    /// A commit or queue wait hit a generation that has been stopped by a
    /// newer recruitment or displacement.
    #[error("log generation is stopped")]
    TLogStopped,

    /// The active generation does not own the requested storage team.
    #[error("no active generation owns storage team {0}")]
    TLogGroupNotFound(StorageTeamId),

    /// Cluster info shows this worker's generation was displaced; all of its
    /// generations are removed.
    #[error("worker displaced by newer recovery")]
    WorkerRemoved,

    /// Fatal error while starting the TLog role; pending recruitments are
    /// rejected with this.
    #[error("tlog recruitment failed")]
    RecruitmentFailed,

    /// A disk operation exceeded its configured duration.
    #[error("disk operation timed out")]
    IoTimeout,

    /// The disk subsystem reported itself degraded during a commit.
    #[error("disk subsystem degraded")]
    IoDegraded,

    /// The disk queue contained a record that violates the framing format.
    #[error("corrupt log record: {0}")]
    CorruptLog(&'static str),

    /// A backup log block carried padding bytes other than `0xFF`.
    #[error("corrupt block padding")]
    CorruptPadding,

    /// A backup log block or record did not decode (bad part sequence,
    /// truncated value, length mismatch).
    #[error("corrupt data: {0}")]
    CorruptData(&'static str),

    /// A durable file carried a format version this build does not read.
    #[error("unsupported format version {0:#x}")]
    UnsupportedVersion(u32),

    /// Normal termination signal from disk-queue replay.
    #[error("end of stream")]
    EndOfStream,

    /// The owning handle was dropped; not an error during shutdown.
    #[error("operation cancelled")]
    OperationCancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying key/value database error.
    #[error("database error: {0}")]
    Database(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the stable wire code for this error kind.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::TLogStopped => "tlog_stopped",
            Self::TLogGroupNotFound(_) => "tlog_group_not_found",
            Self::WorkerRemoved => "worker_removed",
            Self::RecruitmentFailed => "recruitment_failed",
            Self::IoTimeout => "io_timeout",
            Self::IoDegraded => "io_degraded",
            Self::CorruptLog(_) => "corrupt_log",
            Self::CorruptPadding => "corrupt_padding",
            Self::CorruptData(_) => "corrupt_data",
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::EndOfStream => "end_of_stream",
            Self::OperationCancelled => "operation_cancelled",
            Self::Io(_) => "io_error",
            Self::Database(_) => "database_error",
            Self::Config(_) => "configuration_error",
        }
    }

    /// Reconstructs an error kind from a wire code.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "tlog_stopped" => Self::TLogStopped,
            "worker_removed" => Self::WorkerRemoved,
            "recruitment_failed" => Self::RecruitmentFailed,
            "io_timeout" => Self::IoTimeout,
            "io_degraded" => Self::IoDegraded,
            "corrupt_log" => Self::CorruptLog("remote"),
            "corrupt_padding" => Self::CorruptPadding,
            "corrupt_data" => Self::CorruptData("remote"),
            "end_of_stream" => Self::EndOfStream,
            "operation_cancelled" => Self::OperationCancelled,
            other => Self::Database(other.to_string()),
        }
    }

    /// Whether this error tears down the whole group (as opposed to being
    /// returned to a single caller).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkerRemoved
                | Self::RecruitmentFailed
                | Self::IoTimeout
                | Self::IoDegraded
                | Self::Io(_)
                | Self::Database(_)
        )
    }

    /// Whether this error is an expected part of shutdown rather than a
    /// failure.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::OperationCancelled | Self::EndOfStream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_roundtrip_for_unit_kinds() {
        for err in [
            Error::TLogStopped,
            Error::WorkerRemoved,
            Error::RecruitmentFailed,
            Error::IoTimeout,
            Error::IoDegraded,
            Error::CorruptPadding,
            Error::EndOfStream,
            Error::OperationCancelled,
        ] {
            let code = err.code();
            assert_eq!(Error::from_code(code).code(), code);
        }
    }

    #[test]
    fn terminal_classification() {
        assert!(Error::WorkerRemoved.is_terminal());
        assert!(Error::IoTimeout.is_terminal());
        assert!(!Error::TLogStopped.is_terminal());
        assert!(!Error::EndOfStream.is_terminal());
        assert!(Error::OperationCancelled.is_shutdown());
    }
}
