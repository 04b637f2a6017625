//! Controller-side session driver.
//!
//! A session sends a batch of commands and receives until every one of them
//! has been answered. The transport is split so responses are read while
//! requests are still being written; a peer that answers one request at a
//! time can then never stall the batch. Closing the connection early, a
//! failed send or an elapsed timeout abandons whatever is still outstanding.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SessionConfigFile;
use crate::correlator::{BatchState, Completion, Correlator, Resolution};
use crate::interpret::ResultView;
use crate::protocol::{
    decode_response, encode_request, Command, CommandName, RequestEnvelope, ResponseBody,
    ResponseEnvelope,
};
use crate::transport::{FrameSink, FrameSource, Transport};

/// Parsed session configuration with `Duration` fields.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sequence number of the first request.
    pub first_sequence: u64,

    /// Minimum spacing between consecutive sends. Zero sends back to back.
    pub send_spacing: Duration,

    /// Upper bound on one `run_batch` call. Zero waits forever.
    pub response_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            first_sequence: 1000,
            send_spacing: Duration::ZERO,
            response_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    /// Create from the JSON configuration values.
    pub const fn from_file(file: &SessionConfigFile) -> Self {
        Self {
            first_sequence: file.first_sequence,
            send_spacing: Duration::from_millis(file.send_spacing_ms),
            response_timeout: Duration::from_secs(file.response_timeout_seconds),
        }
    }

    /// Create from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `CMDLINK_FIRST_SEQUENCE`, `CMDLINK_SEND_SPACING_MS` and
    /// `CMDLINK_RESPONSE_TIMEOUT` (seconds) when set.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        let read = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok());
        Self {
            first_sequence: read("CMDLINK_FIRST_SEQUENCE").unwrap_or(self.first_sequence),
            send_spacing: read("CMDLINK_SEND_SPACING_MS")
                .map_or(self.send_spacing, Duration::from_millis),
            response_timeout: read("CMDLINK_RESPONSE_TIMEOUT")
                .map_or(self.response_timeout, Duration::from_secs),
        }
    }
}

/// Terminal outcome of one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        result: ResultView,
    },
    Failure {
        code: u16,
        kind: String,
        reason: Option<String>,
    },
}

impl Outcome {
    pub fn from_response(response: ResponseEnvelope) -> Self {
        let code = response.status();
        match response.into_body() {
            ResponseBody::Success(value) => Self::Success {
                result: ResultView::classify(value),
            },
            ResponseBody::Failure { kind, reason } => Self::Failure { code, kind, reason },
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedRequest {
    pub sequence: u64,
    pub command: CommandName,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AbandonedRequest {
    pub sequence: u64,
    pub command: CommandName,
}

/// Everything observed while running one batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    /// Answered requests, in arrival order.
    pub completed: Vec<CompletedRequest>,
    /// Requests still outstanding when the connection went away.
    pub abandoned: Vec<AbandonedRequest>,
    /// Commands never sent because the connection failed mid-batch.
    pub unsent: usize,
    /// Responses whose sequence matched nothing outstanding.
    pub unmatched: u32,
    /// Inbound messages that failed to decode.
    pub malformed: u32,
    /// The batch hit `response_timeout` before completing.
    pub timed_out: bool,
}

impl BatchReport {
    /// True when every request was sent and received its response.
    pub fn is_complete(&self) -> bool {
        self.abandoned.is_empty() && self.unsent == 0 && !self.timed_out
    }

    pub fn failures(&self) -> usize {
        self.completed
            .iter()
            .filter(|c| !c.outcome.is_success())
            .count()
    }
}

/// Correlation state plus everything observed for the current batch.
struct Tracker {
    correlator: Correlator,
    report: BatchReport,
}

impl Tracker {
    /// Receive until the batch leaves `Open`. Returns `false` when the
    /// connection ended first.
    async fn receive<R: FrameSource>(&mut self, source: &mut R) -> bool {
        while self.correlator.state() == BatchState::Open {
            match source.recv().await {
                Ok(Some(frame)) => self.handle_frame(&frame),
                Ok(None) => {
                    info!(
                        outstanding = ?self.correlator.outstanding(),
                        "Connection closed before batch completed"
                    );
                    return false;
                }
                Err(e) => {
                    warn!(error = %e, "Receive failed");
                    return false;
                }
            }
        }
        true
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let response = match decode_response(frame) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Discarding malformed response");
                self.report.malformed += 1;
                return;
            }
        };

        match self.correlator.resolve(response) {
            Resolution::Matched { command, response } => {
                let sequence = response.sequence();
                let outcome = Outcome::from_response(response);
                match &outcome {
                    Outcome::Success { result } => {
                        info!(sequence, command = %command, kind = result.kind(), "Request succeeded");
                    }
                    Outcome::Failure { code, kind, reason } => {
                        warn!(
                            sequence,
                            command = %command,
                            code,
                            kind = %kind,
                            reason = reason.as_deref().unwrap_or(""),
                            "Request failed"
                        );
                    }
                }
                self.report.completed.push(CompletedRequest {
                    sequence,
                    command,
                    outcome,
                });
            }
            Resolution::Unmatched { .. } => self.report.unmatched += 1,
            Resolution::Ignored { .. } => {}
        }
    }

    /// Stop tracking requests that were never fully written.
    fn drop_unsent(&mut self, sequences: impl IntoIterator<Item = u64>) {
        for sequence in sequences {
            if self.correlator.forget(sequence).is_some() {
                self.report.unsent += 1;
            }
        }
    }

    fn abandon(&mut self) {
        self.report.abandoned.extend(
            self.correlator
                .abandon()
                .into_iter()
                .map(|(sequence, command)| AbandonedRequest { sequence, command }),
        );
    }
}

/// Drives one connection from the initiating side.
pub struct SessionDriver<T: Transport> {
    sink: T::Sink,
    source: T::Source,
    tracker: Tracker,
    config: SessionConfig,
}

impl<T: Transport> SessionDriver<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let (sink, source) = transport.split();
        Self {
            sink,
            source,
            tracker: Tracker {
                correlator: Correlator::new(config.first_sequence),
                report: BatchReport::default(),
            },
            config,
        }
    }

    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub const fn state(&self) -> BatchState {
        self.tracker.correlator.state()
    }

    /// Send a single command without reading anything.
    ///
    /// Pair with [`receive_until_complete`](Self::receive_until_complete).
    /// Large batches should go through [`run_batch`](Self::run_batch), which
    /// reads while it writes. A transport failure abandons the session.
    pub async fn send(&mut self, command: &Command) -> Result<Completion> {
        let completion = self.tracker.correlator.track_next(command.name())?;
        let sequence = completion.sequence();
        let request = RequestEnvelope::new(command, sequence);

        debug!(sequence, command = %request.name, "Sending request");
        if let Err(e) = self.sink.send(&encode_request(&request)).await {
            self.tracker.drop_unsent([sequence]);
            self.tracker.abandon();
            return Err(e).with_context(|| format!("Failed to send request {sequence}"));
        }
        Ok(completion)
    }

    /// Receive until every tracked request is answered or the connection
    /// closes, then hand back the report for this batch.
    pub async fn receive_until_complete(&mut self) -> BatchReport {
        if !self.tracker.receive(&mut self.source).await {
            self.tracker.abandon();
        }
        std::mem::take(&mut self.tracker.report)
    }

    /// Send every command while receiving responses, until all are answered,
    /// the connection ends, or `response_timeout` elapses.
    ///
    /// Outcomes come back through the returned report only; the per-request
    /// [`Completion`] continuations are not used on this path. Requests that
    /// never reached the wire are counted as `unsent`, the rest of the
    /// unanswered ones as `abandoned`.
    pub async fn run_batch(&mut self, commands: &[Command]) -> Result<BatchReport> {
        anyhow::ensure!(
            self.tracker.correlator.state() != BatchState::Abandoned,
            "Session was abandoned; open a new connection"
        );
        if commands.is_empty() {
            return Ok(std::mem::take(&mut self.tracker.report));
        }
        info!(count = commands.len(), "Sending batch");

        let mut frames = Vec::with_capacity(commands.len());
        for command in commands {
            let sequence = self
                .tracker
                .correlator
                .track_next(command.name())?
                .sequence();
            frames.push((sequence, encode_request(&RequestEnvelope::new(command, sequence))));
        }

        let spacing = self.config.send_spacing;
        let timeout = self.config.response_timeout;
        let mut written = 0usize;
        let outcome = {
            let sink = &mut self.sink;
            let frames = &frames;
            let written = &mut written;
            let send_all = async move {
                for (index, (sequence, frame)) in frames.iter().enumerate() {
                    if index > 0 && !spacing.is_zero() {
                        tokio::time::sleep(spacing).await;
                    }
                    debug!(sequence, "Sending request");
                    sink.send(frame)
                        .await
                        .with_context(|| format!("Failed to send request {sequence}"))?;
                    *written += 1;
                }
                anyhow::Ok(())
            };
            let receive = self.tracker.receive(&mut self.source);

            let exchange = async move {
                tokio::pin!(send_all, receive);
                tokio::select! {
                    biased;
                    sent = &mut send_all => match sent {
                        Ok(()) => Ok(receive.await),
                        Err(e) => Err(e),
                    },
                    connected = &mut receive => Ok(connected),
                }
            };

            if timeout.is_zero() {
                Ok(exchange.await)
            } else {
                tokio::time::timeout(timeout, exchange).await
            }
        };

        let finished = match outcome {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                warn!(error = %e, "Send failed; abandoning batch");
                false
            }
            Err(_) => {
                warn!(?timeout, "Timed out waiting for responses");
                self.tracker.report.timed_out = true;
                false
            }
        };

        self.tracker
            .drop_unsent(frames[written..].iter().map(|(sequence, _)| *sequence));
        if !finished {
            self.tracker.abandon();
        }
        Ok(std::mem::take(&mut self.tracker.report))
    }

    /// Close the outbound direction of the connection.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await
    }
}

#[derive(Debug, Deserialize)]
struct BatchEntry {
    n: String,
    #[serde(default)]
    p: Value,
}

/// Parse a batch file: a JSON array of `{"n": code, "p": payload}` entries.
pub fn parse_batch(json: &str) -> Result<Vec<Command>> {
    let entries: Vec<BatchEntry> = serde_json::from_str(json).context("Failed to parse batch")?;
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let name = CommandName::from_code(&entry.n).with_context(|| {
                format!("Batch entry {index}: unknown command code '{}'", entry.n)
            })?;
            Command::from_payload(name, entry.p)
                .with_context(|| format!("Batch entry {index}: invalid payload"))
        })
        .collect()
}

pub fn load_batch(path: &Path) -> Result<Vec<Command>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch file {}", path.display()))?;
    parse_batch(&text)
}
