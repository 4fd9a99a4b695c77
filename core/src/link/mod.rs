//! Link establishment and reliable transmission
//!
//! Protocol flow:
//! 1. START: wait for the byte channel to come up
//! 2. RESET: force the peer into a known state
//! 3. UNINITIALIZED: exchange SYNC / SYNC_RESPONSE
//! 4. INITIALIZED: exchange SYNC_CONFIG / SYNC_CONFIG_RESPONSE both ways
//! 5. ACTIVE: acknowledged data transfer with a single-slot send window
//!
//! A dedicated worker thread executes one action per state, blocking on a
//! shared condition until the state's exit criteria hold. The transport's
//! delivery thread feeds decoded packets into the dispatcher, which flips
//! criteria flags and wakes the worker.

mod criteria;
mod machine;

pub use machine::{H5Link, LinkCounters, LinkDelegate};

use crate::transport::TransportError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Reliable-packet retransmission budget, shared with the SYNC and
/// SYNC_CONFIG dialogues
pub const SYNC_RETRANSMISSION: u32 = 4;

/// Bound on each link-establishment wait
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(250);

/// How long `open` waits for the link to reach ACTIVE
pub const OPEN_WAIT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Sequence numbers are 3 bits wide
pub const SEQ_MASK: u8 = 0x07;

/// SYNC link-control payload
pub const SYNC_PAYLOAD: [u8; 2] = [0x01, 0x7E];
/// SYNC_RESPONSE link-control payload
pub const SYNC_RESPONSE_PAYLOAD: [u8; 2] = [0x02, 0x7D];
/// SYNC_CONFIG link-control payload; the trailing configuration byte asks
/// for sliding-window-size 1, no out-of-frame control, no integrity check,
/// version 0
pub const SYNC_CONFIG_PAYLOAD: [u8; 3] = [0x03, 0xFC, 0x11];
/// SYNC_CONFIG_RESPONSE link-control payload
pub const SYNC_CONFIG_RESPONSE_PAYLOAD: [u8; 3] = [0x04, 0x7B, 0x11];

/// Link establishment states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Start,
    Reset,
    Uninitialized,
    Initialized,
    Active,
    Failed,
    Unknown,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Start => "START",
            LinkState::Reset => "RESET",
            LinkState::Uninitialized => "UNINITIALIZED",
            LinkState::Initialized => "INITIALIZED",
            LinkState::Active => "ACTIVE",
            LinkState::Failed => "FAILED",
            LinkState::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Errors returned by the link API
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The operation is not valid in the link's current state
    #[error("invalid link state: {0}")]
    InvalidState(LinkState),

    /// No acknowledgement (or no ACTIVE state) within the deadline
    #[error("timed out")]
    Timeout,

    /// The payload cannot be represented on the wire
    #[error(transparent)]
    Encode(#[from] crate::codec::H5Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Out-of-band notifications delivered alongside payload data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A RESET was transmitted to force the peer into a known state
    ResetPerformed,
    /// The peer re-sent SYNC while the link was ACTIVE; the link is
    /// re-establishing
    PeerRestart,
}

/// Construction-time tunables
#[derive(Debug, Clone)]
pub struct H5LinkConfig {
    /// How long `send` waits for an acknowledgement before retransmitting
    pub retransmission_timeout: Duration,
}

impl Default for H5LinkConfig {
    fn default() -> Self {
        Self {
            retransmission_timeout: Duration::from_millis(250),
        }
    }
}
