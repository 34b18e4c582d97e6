use crate::Recoverability;
use std::fmt;

/// Broad subsystem family an [`ErrorKind`] belongs to, per the error table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Build,
    Transient,
    User,
    Integrity,
    Fatal,
}

/// Stable, machine-matchable error kind. Each variant belongs to exactly one
/// [`ErrorCategory`], which in turn determines its [`Recoverability`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // -- Build (fatal per-action; the overall build may still partially succeed) --
    BuildFailed,
    OutputMissing,

    // -- Transient (retry with back-off) --
    ActionTimeout,
    FetchTimeout,
    CacheIoFailed,
    NetworkUnavailable,
    WorkerUnreachable,

    // -- User / configuration (stop, surface clearly) --
    TargetNotFound,
    CircularDependency,
    InvalidFingerprintInput,
    InvalidOutputPath,
    ConfigInvalid,

    // -- Integrity (fatal, never recovered) --
    IntegrityMismatch,
    CasCorruption,

    // -- Fatal system (abort build) --
    OutOfMemory,
    WorkerUnreachableExhausted,
    Internal,
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            Self::BuildFailed | Self::OutputMissing => ErrorCategory::Build,

            Self::ActionTimeout
            | Self::FetchTimeout
            | Self::CacheIoFailed
            | Self::NetworkUnavailable
            | Self::WorkerUnreachable => ErrorCategory::Transient,

            Self::TargetNotFound
            | Self::CircularDependency
            | Self::InvalidFingerprintInput
            | Self::InvalidOutputPath
            | Self::ConfigInvalid => ErrorCategory::User,

            Self::IntegrityMismatch | Self::CasCorruption => ErrorCategory::Integrity,

            Self::OutOfMemory | Self::WorkerUnreachableExhausted | Self::Internal => {
                ErrorCategory::Fatal
            }
        }
    }

    pub fn recoverability(self) -> Recoverability {
        match self.category() {
            ErrorCategory::Transient => Recoverability::Transient,
            ErrorCategory::User => Recoverability::User,
            ErrorCategory::Build | ErrorCategory::Integrity | ErrorCategory::Fatal => {
                Recoverability::Fatal
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BuildFailed => "BUILD_FAILED",
            Self::OutputMissing => "OUTPUT_MISSING",
            Self::ActionTimeout => "ACTION_TIMEOUT",
            Self::FetchTimeout => "FETCH_TIMEOUT",
            Self::CacheIoFailed => "CACHE_IO_FAILED",
            Self::NetworkUnavailable => "NETWORK_UNAVAILABLE",
            Self::WorkerUnreachable => "WORKER_UNREACHABLE",
            Self::TargetNotFound => "TARGET_NOT_FOUND",
            Self::CircularDependency => "CIRCULAR_DEPENDENCY",
            Self::InvalidFingerprintInput => "INVALID_FINGERPRINT_INPUT",
            Self::InvalidOutputPath => "INVALID_OUTPUT_PATH",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::IntegrityMismatch => "INTEGRITY_MISMATCH",
            Self::CasCorruption => "CAS_CORRUPTION",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::WorkerUnreachableExhausted => "WORKER_UNREACHABLE_EXHAUSTED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
