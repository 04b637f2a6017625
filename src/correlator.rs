//! Controller-side request/response correlation.
//!
//! The correlator hands out sequence numbers, remembers which are still
//! outstanding and matches inbound responses to them purely by sequence.
//! Arrival order is irrelevant. All state changes go through `&mut self`,
//! so a single owner serialises every update.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::{CommandName, ResponseEnvelope};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelateError {
    #[error("sequence {0} is still awaiting a response")]
    SequenceInUse(u64),

    #[error("correlator was abandoned")]
    Abandoned,
}

/// Lifecycle of the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Nothing sent yet.
    Idle,
    /// At least one request awaiting its response.
    Open,
    /// Every tracked request has been answered.
    Complete,
    /// The connection went away; nothing will be matched any more.
    Abandoned,
}

/// What happened to an inbound response.
#[derive(Debug)]
pub enum Resolution {
    Matched {
        command: CommandName,
        response: ResponseEnvelope,
    },
    /// No outstanding request has this sequence (duplicate or never sent).
    Unmatched { sequence: u64 },
    /// The correlator was abandoned before this response arrived.
    Ignored { sequence: u64 },
}

/// Continuation for a single tracked request.
#[derive(Debug)]
pub struct Completion {
    sequence: u64,
    rx: oneshot::Receiver<ResponseEnvelope>,
}

impl Completion {
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wait for the matching response.
    ///
    /// Resolves to `None` when the correlator is abandoned first.
    pub async fn wait(self) -> Option<ResponseEnvelope> {
        self.rx.await.ok()
    }
}

#[derive(Debug)]
struct Pending {
    command: CommandName,
    reply: oneshot::Sender<ResponseEnvelope>,
}

/// Tracks the pending batch for one connection.
#[derive(Debug)]
pub struct Correlator {
    next_sequence: u64,
    outstanding: HashMap<u64, Pending>,
    expected: u32,
    received: u32,
    state: BatchState,
}

impl Correlator {
    pub fn new(first_sequence: u64) -> Self {
        Self {
            next_sequence: first_sequence,
            outstanding: HashMap::new(),
            expected: 0,
            received: 0,
            state: BatchState::Idle,
        }
    }

    /// Track a request under the next free sequence number.
    pub fn track_next(&mut self, command: CommandName) -> Result<Completion, CorrelateError> {
        while self.outstanding.contains_key(&self.next_sequence) {
            self.next_sequence = self.next_sequence.wrapping_add(1);
        }
        let sequence = self.next_sequence;
        let completion = self.track(sequence, command)?;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Ok(completion)
    }

    /// Track a request under a caller-chosen sequence number.
    ///
    /// Tracking after a completed batch starts a new batch.
    pub fn track(
        &mut self,
        sequence: u64,
        command: CommandName,
    ) -> Result<Completion, CorrelateError> {
        match self.state {
            BatchState::Abandoned => return Err(CorrelateError::Abandoned),
            BatchState::Idle | BatchState::Complete => {
                self.expected = 0;
                self.received = 0;
            }
            BatchState::Open => {}
        }
        if self.outstanding.contains_key(&sequence) {
            return Err(CorrelateError::SequenceInUse(sequence));
        }

        let (reply, rx) = oneshot::channel();
        self.outstanding.insert(sequence, Pending { command, reply });
        self.expected = self.expected.saturating_add(1);
        self.state = BatchState::Open;
        debug!(sequence, command = %command, expected = self.expected, "Tracking request");
        Ok(Completion { sequence, rx })
    }

    /// Match an inbound response to its outstanding request.
    pub fn resolve(&mut self, response: ResponseEnvelope) -> Resolution {
        let sequence = response.sequence();
        if self.state == BatchState::Abandoned {
            debug!(sequence, "Ignoring response after abandon");
            return Resolution::Ignored { sequence };
        }
        let Some(pending) = self.outstanding.remove(&sequence) else {
            warn!(sequence, "Discarding response with no outstanding request");
            return Resolution::Unmatched { sequence };
        };

        self.received = self.received.saturating_add(1);
        if self.received == self.expected {
            self.state = BatchState::Complete;
        }
        if !pending.reply.is_closed() {
            // Receiver may drop between the check and the send; that is fine.
            let _ = pending.reply.send(response.clone());
        }
        Resolution::Matched {
            command: pending.command,
            response,
        }
    }

    /// Stop tracking a request that never reached the wire.
    ///
    /// Its continuation resolves to `None` and it no longer counts towards
    /// the batch.
    pub fn forget(&mut self, sequence: u64) -> Option<CommandName> {
        let pending = self.outstanding.remove(&sequence)?;
        self.expected = self.expected.saturating_sub(1);
        if self.state == BatchState::Open && self.received == self.expected {
            self.state = BatchState::Complete;
        }
        debug!(sequence, "Forgot unsent request");
        Some(pending.command)
    }

    /// Give up on every outstanding request.
    ///
    /// Pending continuations resolve to `None` and later responses are
    /// ignored. Returns the abandoned sequences in ascending order.
    pub fn abandon(&mut self) -> Vec<(u64, CommandName)> {
        self.state = BatchState::Abandoned;
        let mut abandoned: Vec<_> = self
            .outstanding
            .drain()
            .map(|(sequence, pending)| (sequence, pending.command))
            .collect();
        abandoned.sort_unstable_by_key(|(sequence, _)| *sequence);
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "Abandoned outstanding requests");
        }
        abandoned
    }

    pub const fn state(&self) -> BatchState {
        self.state
    }

    pub const fn is_complete(&self) -> bool {
        matches!(self.state, BatchState::Complete)
    }

    pub const fn expected(&self) -> u32 {
        self.expected
    }

    pub const fn received(&self) -> u32 {
        self.received
    }

    /// Outstanding sequences in ascending order.
    pub fn outstanding(&self) -> Vec<u64> {
        let mut sequences: Vec<_> = self.outstanding.keys().copied().collect();
        sequences.sort_unstable();
        sequences
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorKind;
    use serde_json::json;

    fn ok(sequence: u64) -> ResponseEnvelope {
        ResponseEnvelope::success(sequence, json!({"content": format!("#{sequence}")}))
    }

    #[test]
    fn out_of_order_responses_complete_the_batch() {
        let mut correlator = Correlator::new(1);
        for _ in 0..3 {
            correlator.track_next(CommandName::ReadFile).unwrap();
        }
        assert_eq!(correlator.outstanding(), vec![1, 2, 3]);

        for sequence in [3, 1, 2] {
            assert!(!correlator.is_complete());
            match correlator.resolve(ok(sequence)) {
                Resolution::Matched { response, .. } => assert_eq!(response.sequence(), sequence),
                other => panic!("expected a match, got {other:?}"),
            }
        }
        assert!(correlator.is_complete());
        assert_eq!(correlator.received(), 3);
        assert_eq!(correlator.expected(), 3);
    }

    #[test]
    fn duplicate_response_is_not_counted() {
        let mut correlator = Correlator::new(10);
        correlator.track_next(CommandName::ReadFile).unwrap();
        correlator.track_next(CommandName::WriteFile).unwrap();

        assert!(matches!(correlator.resolve(ok(10)), Resolution::Matched { .. }));
        assert!(matches!(
            correlator.resolve(ok(10)),
            Resolution::Unmatched { sequence: 10 }
        ));
        assert_eq!(correlator.received(), 1);
        assert!(!correlator.is_complete());
    }

    #[test]
    fn response_never_sent_is_unmatched() {
        let mut correlator = Correlator::new(1);
        correlator.track_next(CommandName::ListDirectory).unwrap();
        assert!(matches!(
            correlator.resolve(ok(999)),
            Resolution::Unmatched { sequence: 999 }
        ));
        assert_eq!(correlator.received(), 0);
    }

    #[test]
    fn sequence_in_use_is_rejected() {
        let mut correlator = Correlator::new(1);
        correlator.track(5, CommandName::ReadFile).unwrap();
        assert_eq!(
            correlator.track(5, CommandName::ReadFile).unwrap_err(),
            CorrelateError::SequenceInUse(5)
        );
    }

    #[test]
    fn track_next_skips_caller_chosen_sequences() {
        let mut correlator = Correlator::new(1);
        correlator.track(1, CommandName::ReadFile).unwrap();
        let completion = correlator.track_next(CommandName::ReadFile).unwrap();
        assert_eq!(completion.sequence(), 2);
    }

    #[test]
    fn matched_command_is_reported() {
        let mut correlator = Correlator::new(1);
        correlator.track_next(CommandName::GetSystemInfo).unwrap();
        let failure = ResponseEnvelope::failure(1, ErrorKind::IoFailure, "probe failed");
        match correlator.resolve(failure) {
            Resolution::Matched { command, response } => {
                assert_eq!(command, CommandName::GetSystemInfo);
                assert_eq!(response.error_kind(), Some("IOFailure"));
            }
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn continuation_fires_on_match() {
        let mut correlator = Correlator::new(1);
        let completion = correlator.track_next(CommandName::ReadFile).unwrap();
        correlator.resolve(ok(1));
        let response = completion.wait().await.unwrap();
        assert_eq!(response.sequence(), 1);
    }

    #[tokio::test]
    async fn abandon_drops_continuations() {
        let mut correlator = Correlator::new(1);
        let first = correlator.track_next(CommandName::ReadFile).unwrap();
        correlator.track_next(CommandName::ReadFile).unwrap();

        let abandoned = correlator.abandon();
        assert_eq!(
            abandoned,
            vec![(1, CommandName::ReadFile), (2, CommandName::ReadFile)]
        );
        assert_eq!(correlator.state(), BatchState::Abandoned);
        assert!(first.wait().await.is_none());

        assert!(matches!(
            correlator.resolve(ok(2)),
            Resolution::Ignored { sequence: 2 }
        ));
        assert_eq!(
            correlator.track_next(CommandName::ReadFile).unwrap_err(),
            CorrelateError::Abandoned
        );
    }

    #[tokio::test]
    async fn forgotten_request_leaves_the_batch() {
        let mut correlator = Correlator::new(1);
        correlator.track_next(CommandName::ReadFile).unwrap();
        let second = correlator.track_next(CommandName::WriteFile).unwrap();

        correlator.resolve(ok(1));
        assert_eq!(correlator.forget(2), Some(CommandName::WriteFile));
        assert_eq!(correlator.forget(2), None);
        assert!(second.wait().await.is_none());

        assert_eq!(correlator.expected(), 1);
        assert!(correlator.is_complete());
        assert!(correlator.abandon().is_empty());
    }

    #[test]
    fn tracking_after_completion_starts_a_new_batch() {
        let mut correlator = Correlator::new(1);
        correlator.track_next(CommandName::ReadFile).unwrap();
        correlator.resolve(ok(1));
        assert!(correlator.is_complete());

        correlator.track_next(CommandName::ReadFile).unwrap();
        assert_eq!(correlator.state(), BatchState::Open);
        assert_eq!(correlator.expected(), 1);
        assert_eq!(correlator.received(), 0);
    }
}
