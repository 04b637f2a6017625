//! Typed request payloads and result shapes.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use super::CommandName;

/// A request payload did not have the shape its command expects.
#[derive(Debug, Error)]
#[error("invalid {command} payload: {detail}")]
pub struct PayloadError {
    pub command: CommandName,
    pub detail: String,
}

impl PayloadError {
    fn new(command: CommandName, detail: impl Into<String>) -> Self {
        Self {
            command,
            detail: detail.into(),
        }
    }
}

/// Arguments for `wf`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
    /// Append instead of truncating the existing content.
    #[serde(default)]
    pub append: bool,
}

/// Arguments for `ld`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDirectoryArgs {
    pub path: String,
    #[serde(default)]
    pub include_hidden: bool,
}

/// A typed command, ready to be sent or executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ReadFile { path: String },
    WriteFile(WriteFileArgs),
    ListDirectory(ListDirectoryArgs),
    /// `None` requests every category.
    GetSystemInfo { categories: Option<Vec<String>> },
}

impl Command {
    pub const fn name(&self) -> CommandName {
        match self {
            Self::ReadFile { .. } => CommandName::ReadFile,
            Self::WriteFile(_) => CommandName::WriteFile,
            Self::ListDirectory(_) => CommandName::ListDirectory,
            Self::GetSystemInfo { .. } => CommandName::GetSystemInfo,
        }
    }

    /// Wire payload for the `p` key.
    pub fn payload(&self) -> Value {
        match self {
            Self::ReadFile { path } => Value::String(path.clone()),
            Self::WriteFile(args) => json!({
                "path": args.path,
                "content": args.content,
                "append": args.append,
            }),
            Self::ListDirectory(args) => json!({
                "path": args.path,
                "includeHidden": args.include_hidden,
            }),
            Self::GetSystemInfo { categories } => categories
                .as_ref()
                .map_or(Value::Null, |names| json!(names)),
        }
    }

    /// Convert a wire payload into the typed command for `name`.
    pub fn from_payload(name: CommandName, payload: Value) -> Result<Self, PayloadError> {
        match name {
            CommandName::ReadFile => match payload {
                Value::String(path) => Ok(Self::ReadFile { path }),
                other => Err(PayloadError::new(
                    name,
                    format!("expected a path string, got {}", type_name(&other)),
                )),
            },
            CommandName::WriteFile => serde_json::from_value(payload)
                .map(Self::WriteFile)
                .map_err(|e| PayloadError::new(name, e.to_string())),
            CommandName::ListDirectory => match payload {
                // Deprecated shape kept for older controllers.
                Value::String(path) => {
                    debug!(path = %path, "Bare path payload for ld is deprecated");
                    Ok(Self::ListDirectory(ListDirectoryArgs {
                        path,
                        include_hidden: false,
                    }))
                }
                Value::Object(_) => serde_json::from_value(payload)
                    .map(Self::ListDirectory)
                    .map_err(|e| PayloadError::new(name, e.to_string())),
                other => Err(PayloadError::new(
                    name,
                    format!("expected an object with a path, got {}", type_name(&other)),
                )),
            },
            CommandName::GetSystemInfo => match payload {
                Value::Null => Ok(Self::GetSystemInfo { categories: None }),
                Value::Array(items) => items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(s),
                        other => Err(PayloadError::new(
                            name,
                            format!("category names must be strings, got {}", type_name(&other)),
                        )),
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(|names| Self::GetSystemInfo {
                        categories: Some(names),
                    }),
                other => Err(PayloadError::new(
                    name,
                    format!("expected null or a list of categories, got {}", type_name(&other)),
                )),
            },
        }
    }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// System-info categories understood by the local handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoCategory {
    Os,
    Cpu,
    Memory,
    Disk,
}

impl InfoCategory {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "os" => Some(Self::Os),
            "cpu" => Some(Self::Cpu),
            "memory" => Some(Self::Memory),
            "disk" => Some(Self::Disk),
            _ => None,
        }
    }
}

/// Which system-info categories a request asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct InfoSelection {
    pub os: bool,
    pub cpu: bool,
    pub memory: bool,
    pub disk: bool,
}

impl InfoSelection {
    pub const fn all() -> Self {
        Self {
            os: true,
            cpu: true,
            memory: true,
            disk: true,
        }
    }

    /// Build a selection from request names. Unknown names are ignored.
    pub fn from_names<S: AsRef<str>>(names: Option<&[S]>) -> Self {
        let Some(names) = names else {
            return Self::all();
        };
        let mut selection = Self::default();
        for category in names.iter().filter_map(|n| InfoCategory::from_name(n.as_ref())) {
            match category {
                InfoCategory::Os => selection.os = true,
                InfoCategory::Cpu => selection.cpu = true,
                InfoCategory::Memory => selection.memory = true,
                InfoCategory::Disk => selection.disk = true,
            }
        }
        selection
    }
}

/// Result of `rf`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub content: String,
}

/// Result of `wf`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub message: String,
    pub bytes_written: u64,
}

/// Result of `ld`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// `file`, `directory`, `symlink` or `other`.
    #[serde(rename = "type")]
    pub kind: String,
    pub size: u64,
    /// Seconds since the unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
}

/// Result of `gsi`. Fields outside the requested categories are absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_disk: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_disk: Option<u64>,
}

impl SystemInfo {
    /// Wire keys that identify a system-info payload.
    pub const KEYS: [&'static str; 7] = [
        "osName",
        "osVersion",
        "cpuInfo",
        "totalMemory",
        "availableMemory",
        "totalDisk",
        "availableDisk",
    ];
}
