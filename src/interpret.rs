//! Classification of success payloads into known result shapes.
//!
//! Payloads carry no explicit tag, so the shape is recovered from the keys
//! present. Anything unrecognised is kept as `Opaque` and passed along.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::protocol::{DirectoryListing, FileContent, SystemInfo, WriteOutcome};

/// A success payload after classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResultView {
    FileContent(FileContent),
    WriteOutcome(WriteOutcome),
    DirectoryListing(DirectoryListing),
    SystemInfo(SystemInfo),
    Opaque(Value),
}

impl ResultView {
    /// Classify a payload. Checks run in a fixed order: `content`, then
    /// `message` + `bytesWritten`, then `files`, then system-info keys.
    pub fn classify(payload: Value) -> Self {
        let Value::Object(obj) = &payload else {
            return Self::Opaque(payload);
        };

        if obj.contains_key("content") {
            return typed(payload, Self::FileContent);
        }
        if obj.contains_key("message") && obj.contains_key("bytesWritten") {
            return typed(payload, Self::WriteOutcome);
        }
        if obj.contains_key("files") {
            return typed(payload, Self::DirectoryListing);
        }
        if SystemInfo::KEYS.iter().any(|key| obj.contains_key(*key)) {
            return typed(payload, Self::SystemInfo);
        }
        Self::Opaque(payload)
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::FileContent(_) => "file_content",
            Self::WriteOutcome(_) => "write_outcome",
            Self::DirectoryListing(_) => "directory_listing",
            Self::SystemInfo(_) => "system_info",
            Self::Opaque(_) => "opaque",
        }
    }
}

/// Deserialize into the matched shape, falling back to `Opaque` when the
/// keys are present but mistyped.
fn typed<T, F>(payload: Value, wrap: F) -> ResultView
where
    T: DeserializeOwned,
    F: FnOnce(T) -> ResultView,
{
    match serde_json::from_value::<T>(payload.clone()) {
        Ok(value) => wrap(value),
        Err(_) => ResultView::Opaque(payload),
    }
}

impl fmt::Display for ResultView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileContent(file) => {
                write!(f, "file content ({} bytes): {}", file.content.len(), file.content)
            }
            Self::WriteOutcome(outcome) => {
                write!(f, "{} ({} bytes written)", outcome.message, outcome.bytes_written)
            }
            Self::DirectoryListing(listing) => {
                write!(f, "{} entries", listing.files.len())?;
                for entry in &listing.files {
                    write!(f, "\n  {:<9} {:>12}  {}", entry.kind, entry.size, entry.name)?;
                }
                Ok(())
            }
            Self::SystemInfo(info) => {
                let mut parts = Vec::new();
                if let Some(name) = &info.os_name {
                    let version = info.os_version.as_deref().unwrap_or("?");
                    parts.push(format!("os: {name} {version}"));
                }
                if let Some(cpu) = &info.cpu_info {
                    parts.push(format!("cpu: {cpu}"));
                }
                if let (Some(available), Some(total)) = (info.available_memory, info.total_memory) {
                    parts.push(format!("memory: {} / {} MiB free", mib(available), mib(total)));
                }
                if let (Some(available), Some(total)) = (info.available_disk, info.total_disk) {
                    parts.push(format!("disk: {} / {} MiB free", mib(available), mib(total)));
                }
                write!(f, "system info: {}", parts.join(", "))
            }
            Self::Opaque(value) => write!(f, "unrecognised result: {value}"),
        }
    }
}

const fn mib(bytes: u64) -> u64 {
    bytes / (1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_is_file_content() {
        let view = ResultView::classify(json!({"content": "x"}));
        assert_eq!(
            view,
            ResultView::FileContent(FileContent {
                content: "x".into()
            })
        );
    }

    #[test]
    fn message_and_bytes_is_write_outcome() {
        let view = ResultView::classify(json!({"message": "ok", "bytesWritten": 5}));
        assert_eq!(
            view,
            ResultView::WriteOutcome(WriteOutcome {
                message: "ok".into(),
                bytes_written: 5
            })
        );
    }

    #[test]
    fn message_alone_is_opaque() {
        let view = ResultView::classify(json!({"message": "ok"}));
        assert_eq!(view.kind(), "opaque");
    }

    #[test]
    fn empty_files_is_directory_listing() {
        let view = ResultView::classify(json!({"files": []}));
        assert_eq!(
            view,
            ResultView::DirectoryListing(DirectoryListing { files: Vec::new() })
        );
    }

    #[test]
    fn listing_entries_are_decoded() {
        let view = ResultView::classify(json!({
            "files": [
                {"name": "a.txt", "type": "file", "size": 3, "lastModified": 1_700_000_000},
                {"name": "src", "type": "directory", "size": 4096}
            ]
        }));
        let ResultView::DirectoryListing(listing) = view else {
            panic!("expected a listing");
        };
        assert_eq!(listing.files.len(), 2);
        assert_eq!(listing.files[0].last_modified, Some(1_700_000_000));
        assert_eq!(listing.files[1].kind, "directory");
    }

    #[test]
    fn os_name_is_system_info() {
        let view = ResultView::classify(json!({
            "osName": "Linux",
            "osVersion": "6.8",
            "cpuInfo": "x86_64 (8 cores)",
            "totalMemory": 1024,
            "availableMemory": 512,
            "totalDisk": 2048,
            "availableDisk": 1024
        }));
        let ResultView::SystemInfo(info) = view else {
            panic!("expected system info");
        };
        assert_eq!(info.os_name.as_deref(), Some("Linux"));
        assert_eq!(info.total_disk, Some(2048));
    }

    #[test]
    fn filtered_system_info_is_still_recognised() {
        let view = ResultView::classify(json!({"totalMemory": 1, "availableMemory": 1}));
        assert_eq!(view.kind(), "system_info");
    }

    #[test]
    fn unknown_shapes_pass_through() {
        let payload = json!({"stdout": "hi", "exitCode": 0});
        assert_eq!(ResultView::classify(payload.clone()), ResultView::Opaque(payload));
        assert_eq!(ResultView::classify(Value::Null), ResultView::Opaque(Value::Null));
        assert_eq!(ResultView::classify(json!([1, 2])).kind(), "opaque");
    }

    #[test]
    fn mistyped_known_shape_is_opaque() {
        let payload = json!({"content": 42});
        assert_eq!(ResultView::classify(payload.clone()), ResultView::Opaque(payload));
    }

    #[test]
    fn summaries_render() {
        let view = ResultView::classify(json!({"message": "Wrote 5 bytes", "bytesWritten": 5}));
        assert_eq!(view.to_string(), "Wrote 5 bytes (5 bytes written)");

        let view = ResultView::classify(json!({"osName": "Linux", "osVersion": "6.8"}));
        assert_eq!(view.to_string(), "system info: os: Linux 6.8");
    }
}
