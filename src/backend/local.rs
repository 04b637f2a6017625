//! Local filesystem backend.
//!
//! Executes commands against the agent's own filesystem, optionally confined
//! to a root directory and optionally read-only.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use super::{sysinfo, CommandHandlers, HandlerError};
use crate::config::AgentConfig;
use crate::protocol::{
    DirectoryListing, ErrorKind, FileContent, FileEntry, InfoSelection, ListDirectoryArgs,
    SystemInfo, WriteFileArgs, WriteOutcome,
};

/// Handlers backed by `tokio::fs` and the host's `/proc`.
#[derive(Debug, Clone)]
pub struct LocalHandlers {
    root: Option<PathBuf>,
    read_only: bool,
    hidden_prefix: String,
}

impl Default for LocalHandlers {
    fn default() -> Self {
        Self {
            root: None,
            read_only: false,
            hidden_prefix: ".".to_string(),
        }
    }
}

impl LocalHandlers {
    /// Unconfined, writable handlers.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            root: config.root.as_deref().map(normalize),
            read_only: config.read_only,
            hidden_prefix: config.hidden_prefix.clone(),
        }
    }

    /// Confine every path to `root`.
    #[must_use]
    pub fn with_root(mut self, root: impl AsRef<Path>) -> Self {
        self.root = Some(normalize(root.as_ref()));
        self
    }

    #[must_use]
    pub const fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Resolve a request path, rejecting anything outside the root.
    ///
    /// The lexical check catches `..` escapes; the canonical check catches
    /// symlinks inside the root that point elsewhere. Paths that do not exist
    /// yet are checked through their parent directory.
    async fn resolve(&self, path: &str) -> Result<PathBuf, HandlerError> {
        if path.is_empty() {
            return Err(HandlerError::new(ErrorKind::InvalidArgument, "empty path"));
        }
        let Some(root) = &self.root else {
            return Ok(PathBuf::from(path));
        };

        let requested = Path::new(path);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            root.join(requested)
        };
        let resolved = normalize(&joined);
        if !resolved.starts_with(root) {
            return Err(escapes_root(path, root));
        }

        let canonical_root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| HandlerError::from_io(&e, &root.to_string_lossy()))?;
        let canonical = canonicalize_existing(&resolved)
            .await
            .map_err(|e| HandlerError::from_io(&e, path))?;
        if !canonical.starts_with(&canonical_root) {
            return Err(escapes_root(path, root));
        }
        Ok(canonical)
    }

    fn is_hidden(&self, name: &str) -> bool {
        !self.hidden_prefix.is_empty() && name.starts_with(&self.hidden_prefix)
    }
}

fn escapes_root(path: &str, root: &Path) -> HandlerError {
    HandlerError::new(
        ErrorKind::PermissionDenied,
        format!("{path}: path escapes allowed root {}", root.display()),
    )
}

/// Canonicalize `path`, or its parent plus the final name when `path` does
/// not exist yet. A dangling symlink is refused since following it on create
/// could land anywhere.
async fn canonicalize_existing(path: &Path) -> io::Result<PathBuf> {
    match tokio::fs::canonicalize(path).await {
        Ok(canonical) => Ok(canonical),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if tokio::fs::symlink_metadata(path).await.is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "dangling symlink",
                ));
            }
            let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                return Err(e);
            };
            Ok(tokio::fs::canonicalize(parent).await?.join(name))
        }
        Err(e) => Err(e),
    }
}

/// Lexically normalize a path: drop `.` and fold `..` into its parent.
/// Symlinks are not resolved.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[async_trait]
impl CommandHandlers for LocalHandlers {
    #[instrument(skip(self))]
    async fn read_file(&self, path: &str) -> Result<FileContent, HandlerError> {
        let resolved = self.resolve(path).await?;
        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| HandlerError::from_io(&e, path))?;
        debug!(bytes = bytes.len(), "Read file");
        Ok(FileContent {
            content: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    #[instrument(skip(self, args), fields(path = %args.path, append = args.append))]
    async fn write_file(&self, args: &WriteFileArgs) -> Result<WriteOutcome, HandlerError> {
        if self.read_only {
            return Err(HandlerError::new(
                ErrorKind::PermissionDenied,
                format!("{}: agent is read-only", args.path),
            ));
        }
        let resolved = self.resolve(&args.path).await?;

        let mut options = OpenOptions::new();
        options.create(true);
        if args.append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let mut file = options
            .open(&resolved)
            .await
            .map_err(|e| HandlerError::from_io(&e, &args.path))?;
        file.write_all(args.content.as_bytes())
            .await
            .map_err(|e| HandlerError::from_io(&e, &args.path))?;
        file.flush()
            .await
            .map_err(|e| HandlerError::from_io(&e, &args.path))?;

        let bytes_written = u64::try_from(args.content.len()).unwrap_or(u64::MAX);
        let verb = if args.append { "Appended" } else { "Wrote" };
        debug!(bytes_written, "Wrote file");
        Ok(WriteOutcome {
            message: format!("{verb} {bytes_written} bytes to {}", args.path),
            bytes_written,
        })
    }

    #[instrument(skip(self, args), fields(path = %args.path, include_hidden = args.include_hidden))]
    async fn list_directory(
        &self,
        args: &ListDirectoryArgs,
    ) -> Result<DirectoryListing, HandlerError> {
        let resolved = self.resolve(&args.path).await?;
        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| HandlerError::from_io(&e, &args.path))?;
        if !meta.is_dir() {
            return Err(HandlerError::new(
                ErrorKind::InvalidArgument,
                format!("{}: not a directory", args.path),
            ));
        }

        let mut entries = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| HandlerError::from_io(&e, &args.path))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| HandlerError::from_io(&e, &args.path))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !args.include_hidden && self.is_hidden(&name) {
                continue;
            }
            // Entries can vanish between read_dir and stat.
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(entry = %name, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            let file_type = meta.file_type();
            let kind = if file_type.is_dir() {
                "directory"
            } else if file_type.is_file() {
                "file"
            } else if file_type.is_symlink() {
                "symlink"
            } else {
                "other"
            };
            files.push(FileEntry {
                name,
                kind: kind.to_string(),
                size: meta.len(),
                last_modified: meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs()),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(count = files.len(), "Listed directory");
        Ok(DirectoryListing { files })
    }

    #[instrument(skip(self))]
    async fn system_info(&self, selection: InfoSelection) -> Result<SystemInfo, HandlerError> {
        let disk_path = self.root.clone().unwrap_or_else(|| PathBuf::from("/"));
        tokio::task::spawn_blocking(move || sysinfo::collect(selection, &disk_path))
            .await
            .map_err(|e| {
                HandlerError::new(
                    ErrorKind::IoFailure,
                    format!("system info task failed: {e}"),
                )
            })
    }
}
