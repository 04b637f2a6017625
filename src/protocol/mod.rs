//! Protocol envelopes exchanged between controller and agent.
//!
//! Every message is a JSON object with short keys:
//! - requests carry `n` (command code), `p` (payload) and `s` (sequence)
//! - responses carry `c` (status), `r` (result), `e` (error kind),
//!   `er` (error reason) and `s` (the originating request's sequence)

pub mod codec;
pub mod payload;

pub use codec::{decode_request, decode_response, encode_request, encode_response, DecodeError};
pub use payload::{
    Command, DirectoryListing, FileContent, FileEntry, InfoCategory, InfoSelection,
    ListDirectoryArgs, PayloadError, SystemInfo, WriteFileArgs, WriteOutcome,
};

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status code carried by every successful response.
pub const STATUS_OK: u16 = 200;

/// Closed set of commands an agent understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "rf")]
    ReadFile,
    #[serde(rename = "wf")]
    WriteFile,
    #[serde(rename = "ld")]
    ListDirectory,
    #[serde(rename = "gsi")]
    GetSystemInfo,
}

impl CommandName {
    pub const ALL: [Self; 4] = [
        Self::ReadFile,
        Self::WriteFile,
        Self::ListDirectory,
        Self::GetSystemInfo,
    ];

    /// Short code used for the `n` key on the wire.
    pub const fn code(self) -> &'static str {
        match self {
            Self::ReadFile => "rf",
            Self::WriteFile => "wf",
            Self::ListDirectory => "ld",
            Self::GetSystemInfo => "gsi",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.code() == code)
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ReadFile => "ReadFile",
            Self::WriteFile => "WriteFile",
            Self::ListDirectory => "ListDirectory",
            Self::GetSystemInfo => "GetSystemInfo",
        };
        f.write_str(label)
    }
}

/// Machine-readable failure categories carried in the `e` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Path does not exist.
    NotFound,
    PermissionDenied,
    /// Malformed payload for a known command.
    InvalidArgument,
    UnknownCommand,
    /// Generic I/O failure not covered by the other kinds.
    #[serde(rename = "IOFailure")]
    IoFailure,
    /// Wire-level decode failure.
    MalformedMessage,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::PermissionDenied => "PermissionDenied",
            Self::InvalidArgument => "InvalidArgument",
            Self::UnknownCommand => "UnknownCommand",
            Self::IoFailure => "IOFailure",
            Self::MalformedMessage => "MalformedMessage",
        }
    }

    /// HTTP-style status code reported alongside this kind.
    pub const fn status(self) -> u16 {
        match self {
            Self::NotFound | Self::UnknownCommand => 404,
            Self::PermissionDenied => 403,
            Self::InvalidArgument | Self::MalformedMessage => 400,
            Self::IoFailure => 500,
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        [
            Self::NotFound,
            Self::PermissionDenied,
            Self::InvalidArgument,
            Self::UnknownCommand,
            Self::IoFailure,
            Self::MalformedMessage,
        ]
        .into_iter()
        .find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request as sent by the controller.
///
/// The payload stays untyped until the dispatcher converts it with
/// [`Command::from_payload`]; `Value::Null` stands for an absent payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub name: CommandName,
    pub payload: Value,
    pub sequence: u64,
}

impl RequestEnvelope {
    pub fn new(command: &Command, sequence: u64) -> Self {
        Self {
            name: command.name(),
            payload: command.payload(),
            sequence,
        }
    }
}

/// Either the success payload or the error pair of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Success(Value),
    Failure { kind: String, reason: Option<String> },
}

/// A response as sent by the agent.
///
/// Constructed only through [`ResponseEnvelope::success`],
/// [`ResponseEnvelope::failure`] or the codec, so a result and an error kind
/// are never present together and the status always agrees with the body.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    sequence: u64,
    status: u16,
    body: ResponseBody,
}

impl ResponseEnvelope {
    pub const fn success(sequence: u64, result: Value) -> Self {
        Self {
            sequence,
            status: STATUS_OK,
            body: ResponseBody::Success(result),
        }
    }

    pub fn failure(sequence: u64, kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            sequence,
            status: kind.status(),
            body: ResponseBody::Failure {
                kind: kind.as_str().to_string(),
                reason: Some(reason.into()),
            },
        }
    }

    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    pub const fn status(&self) -> u16 {
        self.status
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.body, ResponseBody::Success(_))
    }

    pub const fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    pub const fn result(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Success(value) => Some(value),
            ResponseBody::Failure { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Failure { kind, .. } => Some(kind),
            ResponseBody::Success(_) => None,
        }
    }

    pub fn error_reason(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Failure { reason, .. } => reason.as_deref(),
            ResponseBody::Success(_) => None,
        }
    }
}
