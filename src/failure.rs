//! Stable CLI exit codes

use serde::{Deserialize, Serialize};

use kiln_api::FailureKind;

/// Stable exit codes of the `kiln` binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    /// Operation completed
    Success = 0,
    /// A core operation failed (build error, partial GC)
    OperationFailed = 1,
    /// Bad arguments or configuration
    Usage = 2,
    /// State file unreadable or unwritable
    StateFile = 3,
    /// Registry refused an operation
    Registry = 4,
    /// Internal invariant violated
    Internal = 70,
}

impl ExitCode {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            1 => Some(ExitCode::OperationFailed),
            2 => Some(ExitCode::Usage),
            3 => Some(ExitCode::StateFile),
            4 => Some(ExitCode::Registry),
            70 => Some(ExitCode::Internal),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExitCode::Success => "Success",
            ExitCode::OperationFailed => "Operation failed",
            ExitCode::Usage => "Usage or configuration error",
            ExitCode::StateFile => "State file error",
            ExitCode::Registry => "Registry failure",
            ExitCode::Internal => "Internal error",
        }
    }
}

/// Exit code for a build that ended in Error.
pub fn build_failure_exit_code(kind: FailureKind) -> ExitCode {
    match kind {
        FailureKind::Transient
        | FailureKind::Fatal
        | FailureKind::Incompatible
        | FailureKind::RetriesExhausted
        | FailureKind::BaseFailed => ExitCode::OperationFailed,
    }
}

/// Human-readable description of a build failure kind.
pub fn build_failure_description(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::Transient => "Transient build failure",
        FailureKind::Fatal => "Build failed",
        FailureKind::Incompatible => "Runtime catalog incompatible",
        FailureKind::RetriesExhausted => "Build retries exhausted",
        FailureKind::BaseFailed => "Incremental base build failed",
    }
}
