//! Error families.
//!
//! [`RunError`] terminates the workflow. [`EnumerationFailed`] is an ordinary
//! per-port value that the orchestrator records and moves past.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{EnumKey, EnumerationCategory};

/// Fatal conditions: the run stops and the process exits non-zero.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("required tool '{tool}' is not installed")]
    DependencyMissing { tool: String },

    #[error("port scan failed: {0}")]
    ScanFailed(#[source] ScanError),

    #[error("scan interrupted by operator")]
    Interrupted,

    #[error("session invariant violated: {0}")]
    Session(#[from] SessionError),
}

impl RunError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Interrupted => 130,
            _ => 1,
        }
    }
}

/// Failure launching or waiting on an external binary.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{tool} not found")]
    NotFound { tool: String },

    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} timed out after {secs}s")]
    TimedOut { tool: String, secs: u64 },

    #[error("{tool} exited with {}: {stderr}", .code.map_or_else(|| "signal".to_string(), |c| format!("status {c}")))]
    Failed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("host {target} appears to be down")]
    HostDown { target: String },

    #[error("unable to parse scanner output: {0}")]
    Parse(String),
}

/// Why a single enumeration attempt produced nothing.
#[derive(Error, Debug)]
pub enum EnumerationCause {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("unexpected response: {0}")]
    Protocol(String),

    /// A defect on our side rather than in the probed service.
    #[error("internal error: {0}")]
    Unexpected(String),
}

#[derive(Error, Debug)]
#[error("{category} enumeration on port {port} failed: {cause}")]
pub struct EnumerationFailed {
    pub category: EnumerationCategory,
    pub port: u16,
    #[source]
    pub cause: EnumerationCause,
}

impl EnumerationFailed {
    pub fn new(category: EnumerationCategory, port: u16, cause: impl Into<EnumerationCause>) -> Self {
        Self {
            category,
            port,
            cause: cause.into(),
        }
    }

    pub fn key(&self) -> EnumKey {
        EnumKey::new(self.category, self.port)
    }

    pub fn is_unexpected(&self) -> bool {
        matches!(self.cause, EnumerationCause::Unexpected(_))
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("scanner returned an error instead of results: {0}")]
    InvalidScanResult(#[source] ScanError),

    #[error("port scan results were already recorded")]
    PortsAlreadyRecorded,

    #[error("enumeration {key} already recorded")]
    DuplicateEnumeration { key: EnumKey },

    #[error("enumeration {key} does not match an open, classified port")]
    PortNotEnumerable { key: EnumKey },
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(RunError::Interrupted.exit_code(), 130);
        assert_eq!(
            RunError::DependencyMissing { tool: "nmap".into() }.exit_code(),
            1
        );
    }

    #[test]
    fn enumeration_failure_message_names_port() {
        let err = EnumerationFailed::new(
            EnumerationCategory::Ftp,
            21,
            EnumerationCause::Timeout { secs: 30 },
        );
        assert_eq!(err.to_string(), "ftp enumeration on port 21 failed: timed out after 30s");
        assert_eq!(err.key().to_string(), "ftp_21");
        assert!(!err.is_unexpected());
    }

    #[test]
    fn tool_failure_message() {
        let err = ToolError::Failed {
            tool: "smbclient".into(),
            code: Some(1),
            stderr: "boom".into(),
        };
        assert_eq!(err.to_string(), "smbclient exited with status 1: boom");
    }
}
