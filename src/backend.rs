//! Command handler trait and implementations.
//!
//! Handlers perform the actual work behind each command code. The dispatcher
//! turns their typed results and errors into response envelopes.

mod local;
mod sysinfo;

pub use local::LocalHandlers;

use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{
    DirectoryListing, ErrorKind, FileContent, InfoSelection, ListDirectoryArgs, SystemInfo,
    WriteFileArgs, WriteOutcome,
};

/// A handler failure, already categorised for the wire.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {reason}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub reason: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    /// Categorise an I/O error raised while operating on `path`.
    pub fn from_io(err: &io::Error, path: &str) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
            _ => ErrorKind::IoFailure,
        };
        Self::new(kind, format!("{path}: {err}"))
    }
}

/// The capabilities an agent exposes, one method per command code.
#[async_trait]
pub trait CommandHandlers: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<FileContent, HandlerError>;

    /// Truncate-then-write, or append when `args.append` is set.
    /// Creates the file if it does not exist.
    async fn write_file(&self, args: &WriteFileArgs) -> Result<WriteOutcome, HandlerError>;

    async fn list_directory(
        &self,
        args: &ListDirectoryArgs,
    ) -> Result<DirectoryListing, HandlerError>;

    /// Report only the selected categories.
    async fn system_info(&self, selection: InfoSelection) -> Result<SystemInfo, HandlerError>;
}
