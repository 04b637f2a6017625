//! cmdlink library
//!
//! Sequenced remote command execution over a persistent message connection:
//! - Wire envelopes and their JSON codec
//! - Controller-side correlation of out-of-order responses
//! - Agent-side dispatch to file and system-info handlers
//! - Framed TCP and WebSocket transports

pub mod backend;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod interpret;
pub mod protocol;
pub mod session;
pub mod transport;
