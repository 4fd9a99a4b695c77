//! Downward byte-transport abstraction
//!
//! The link layer sits on top of an opaque byte channel (typically a serial
//! port). The channel pushes inbound bytes and errors to a delegate on its
//! own delivery thread; the link drives it through the `Transport` trait.

use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by a byte transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Fatal loss of the underlying channel. Drives the link to FAILED.
    #[error("I/O resources unavailable: {0}")]
    IoResourcesUnavailable(String),

    #[error("transport already open")]
    AlreadyOpen,

    #[error("transport is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether this error means the channel is gone for good
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::IoResourcesUnavailable(_))
    }
}

/// Receiver side of a transport: inbound bytes and link errors are pushed
/// here from the transport's own delivery thread.
pub trait TransportDelegate: Send + Sync {
    fn on_data(&self, data: &[u8]);
    fn on_error(&self, error: TransportError);
}

/// A byte-oriented channel the link layer can drive
pub trait Transport: Send {
    /// Open the channel and install the delegate that receives inbound
    /// bytes. Delivery happens on a thread owned by the transport.
    fn open(&mut self, delegate: Arc<dyn TransportDelegate>) -> Result<(), TransportError>;

    /// Write bytes to the channel
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the channel and drop the delegate
    fn close(&mut self) -> Result<(), TransportError>;
}
