//! Agent-side command dispatch.
//!
//! Decodes inbound requests, routes them to a [`CommandHandlers`]
//! implementation and turns every outcome, including handler panics, into a
//! response carrying the request's own sequence number.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::backend::{CommandHandlers, HandlerError};
use crate::protocol::{
    decode_request, encode_response, Command, DecodeError, ErrorKind, InfoSelection,
    RequestEnvelope, ResponseEnvelope,
};
use crate::transport::Transport;

/// Routes decoded requests to handlers.
pub struct Dispatcher<H> {
    handlers: Arc<H>,
}

impl<H> Clone for Dispatcher<H> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<H: CommandHandlers + 'static> Dispatcher<H> {
    pub fn new(handlers: H) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// Handle one raw inbound frame.
    ///
    /// Returns `None` only when the frame is so broken that no sequence
    /// number can be recovered to answer it.
    pub async fn handle_frame(&self, frame: &[u8]) -> Option<ResponseEnvelope> {
        match decode_request(frame) {
            Ok(request) => Some(self.dispatch(request).await),
            Err(DecodeError::UnknownCommand { code, sequence }) => {
                warn!(sequence, code = %code, "Unknown command");
                Some(ResponseEnvelope::failure(
                    sequence,
                    ErrorKind::UnknownCommand,
                    format!("No handler registered for command: {code}"),
                ))
            }
            Err(e) => {
                if let Some(sequence) = e.sequence() {
                    warn!(sequence, error = %e, "Malformed request");
                    Some(ResponseEnvelope::failure(
                        sequence,
                        ErrorKind::MalformedMessage,
                        e.to_string(),
                    ))
                } else {
                    warn!(error = %e, "Discarding undecodable request");
                    None
                }
            }
        }
    }

    /// Execute a decoded request.
    pub async fn dispatch(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let RequestEnvelope {
            name,
            payload,
            sequence,
        } = request;

        let command = match Command::from_payload(name, payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(sequence, command = %name, error = %e, "Rejected payload");
                return ResponseEnvelope::failure(sequence, ErrorKind::InvalidArgument, e.to_string());
            }
        };

        info!(sequence, command = %name, "Dispatching");

        // Run on its own task so a panicking handler cannot take the
        // connection down with it.
        let handlers = Arc::clone(&self.handlers);
        let task = tokio::spawn(async move { execute(handlers.as_ref(), command).await });

        match task.await {
            Ok(Ok(result)) => {
                debug!(sequence, "Command succeeded");
                ResponseEnvelope::success(sequence, result)
            }
            Ok(Err(err)) => {
                warn!(sequence, kind = %err.kind, reason = %err.reason, "Command failed");
                ResponseEnvelope::failure(sequence, err.kind, err.reason)
            }
            Err(e) => {
                error!(sequence, error = %e, "Handler panicked");
                ResponseEnvelope::failure(
                    sequence,
                    ErrorKind::IoFailure,
                    format!("{name} handler aborted"),
                )
            }
        }
    }
}

async fn execute<H>(handlers: &H, command: Command) -> Result<Value, HandlerError>
where
    H: CommandHandlers + ?Sized,
{
    match command {
        Command::ReadFile { path } => to_value(handlers.read_file(&path).await?),
        Command::WriteFile(args) => to_value(handlers.write_file(&args).await?),
        Command::ListDirectory(args) => to_value(handlers.list_directory(&args).await?),
        Command::GetSystemInfo { categories } => {
            let selection = InfoSelection::from_names(categories.as_deref());
            to_value(handlers.system_info(selection).await?)
        }
    }
}

fn to_value<T: Serialize>(result: T) -> Result<Value, HandlerError> {
    serde_json::to_value(result).map_err(|e| {
        HandlerError::new(ErrorKind::IoFailure, format!("Failed to encode result: {e}"))
    })
}

/// Answer requests on `transport` until the peer closes the connection.
///
/// Returns the number of responses sent.
pub async fn serve<T, H>(transport: &mut T, dispatcher: &Dispatcher<H>) -> Result<u64>
where
    T: Transport + ?Sized,
    H: CommandHandlers + 'static,
{
    let mut answered = 0u64;
    while let Some(frame) = transport
        .recv()
        .await
        .context("Failed to receive request")?
    {
        let Some(response) = dispatcher.handle_frame(&frame).await else {
            continue;
        };
        transport
            .send(&encode_response(&response))
            .await
            .with_context(|| format!("Failed to send response {}", response.sequence()))?;
        answered += 1;
    }
    info!(answered, "Peer closed connection");
    Ok(answered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        decode_response, encode_request, DirectoryListing, FileContent, ListDirectoryArgs,
        SystemInfo, WriteFileArgs, WriteOutcome, STATUS_OK,
    };
    use crate::transport::FramedTransport;
    use async_trait::async_trait;
    use serde_json::json;

    struct MockHandlers;

    #[async_trait]
    impl CommandHandlers for MockHandlers {
        async fn read_file(&self, path: &str) -> Result<FileContent, HandlerError> {
            match path {
                "/boom" => panic!("handler bug"),
                "/missing" => Err(HandlerError::new(ErrorKind::NotFound, "/missing: gone")),
                _ => Ok(FileContent {
                    content: format!("contents of {path}"),
                }),
            }
        }

        async fn write_file(&self, args: &WriteFileArgs) -> Result<WriteOutcome, HandlerError> {
            Ok(WriteOutcome {
                message: "ok".into(),
                bytes_written: args.content.len() as u64,
            })
        }

        async fn list_directory(
            &self,
            _args: &ListDirectoryArgs,
        ) -> Result<DirectoryListing, HandlerError> {
            Ok(DirectoryListing { files: Vec::new() })
        }

        async fn system_info(&self, selection: InfoSelection) -> Result<SystemInfo, HandlerError> {
            Ok(SystemInfo {
                os_name: selection.os.then(|| "TestOS".to_string()),
                cpu_info: selection.cpu.then(|| "test cpu".to_string()),
                ..SystemInfo::default()
            })
        }
    }

    fn dispatcher() -> Dispatcher<MockHandlers> {
        Dispatcher::new(MockHandlers)
    }

    async fn roundtrip(frame: &[u8]) -> Option<ResponseEnvelope> {
        dispatcher().handle_frame(frame).await
    }

    #[tokio::test]
    async fn success_keeps_sequence() {
        let resp = roundtrip(br#"{"n":"rf","p":"/etc/hosts","s":1000}"#)
            .await
            .unwrap();
        assert_eq!(resp.sequence(), 1000);
        assert_eq!(resp.status(), STATUS_OK);
        assert_eq!(resp.result(), Some(&json!({"content": "contents of /etc/hosts"})));
    }

    #[tokio::test]
    async fn handler_error_becomes_failure() {
        let resp = roundtrip(br#"{"n":"rf","p":"/missing","s":1001}"#)
            .await
            .unwrap();
        assert_eq!(resp.sequence(), 1001);
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.error_kind(), Some("NotFound"));
        assert!(resp.result().is_none());
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let dispatcher = dispatcher();
        let resp = dispatcher
            .handle_frame(br#"{"n":"rf","p":"/boom","s":5}"#)
            .await
            .unwrap();
        assert_eq!(resp.error_kind(), Some("IOFailure"));
        assert_eq!(resp.sequence(), 5);

        // The dispatcher keeps working afterwards.
        let resp = dispatcher
            .handle_frame(br#"{"n":"rf","p":"/ok","s":6}"#)
            .await
            .unwrap();
        assert!(resp.is_success());
    }

    #[tokio::test]
    async fn unknown_command() {
        let resp = roundtrip(br#"{"n":"ec","p":{"command":"ls"},"s":77}"#)
            .await
            .unwrap();
        assert_eq!(resp.sequence(), 77);
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.error_kind(), Some("UnknownCommand"));
    }

    #[tokio::test]
    async fn bad_payload_is_invalid_argument() {
        let resp = roundtrip(br#"{"n":"wf","p":"just a string","s":8}"#)
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(resp.error_kind(), Some("InvalidArgument"));
    }

    #[tokio::test]
    async fn malformed_with_sequence_is_answered() {
        let resp = roundtrip(br#"{"n":42,"s":9}"#).await.unwrap();
        assert_eq!(resp.sequence(), 9);
        assert_eq!(resp.error_kind(), Some("MalformedMessage"));
    }

    #[tokio::test]
    async fn garbage_is_dropped() {
        assert!(roundtrip(b"not json at all").await.is_none());
        assert!(roundtrip(br#"{"n":"rf","p":"/x"}"#).await.is_none());
    }

    #[tokio::test]
    async fn system_info_filter_is_passed_through() {
        let resp = roundtrip(br#"{"n":"gsi","p":["cpu","gpu"],"s":3}"#)
            .await
            .unwrap();
        assert_eq!(resp.result(), Some(&json!({"cpuInfo": "test cpu"})));

        let resp = roundtrip(br#"{"n":"gsi","p":null,"s":4}"#).await.unwrap();
        assert_eq!(
            resp.result(),
            Some(&json!({"osName": "TestOS", "cpuInfo": "test cpu"}))
        );
    }

    #[tokio::test]
    async fn serve_answers_until_close() {
        let (agent_io, controller_io) = tokio::io::duplex(4096);
        let mut agent = FramedTransport::from_stream(agent_io);
        let mut controller = FramedTransport::from_stream(controller_io);

        let server = tokio::spawn(async move { serve(&mut agent, &dispatcher()).await });

        let request = RequestEnvelope::new(
            &Command::ReadFile {
                path: "/a".into(),
            },
            1,
        );
        controller.send(&encode_request(&request)).await.unwrap();
        controller.send(b"garbage").await.unwrap();
        controller
            .send(br#"{"n":"rf","p":"/missing","s":2}"#)
            .await
            .unwrap();

        let first = decode_response(&controller.recv().await.unwrap().unwrap()).unwrap();
        let second = decode_response(&controller.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.sequence(), 1);
        assert_eq!(second.sequence(), 2);
        assert!(!second.is_success());

        controller.close().await.unwrap();
        assert_eq!(server.await.unwrap().unwrap(), 2);
    }
}
