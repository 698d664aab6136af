//! Transport abstraction traits for Canopy.
//!
//! A listener owns the read loop, classification and dispatch; the pluggable
//! part is an [`ObjectSource`] that only knows how to read one object.

use async_trait::async_trait;
use canopy_protocol::{ChannelError, Packet, PacketId, ProtocolError};
use thiserror::Error;

use crate::listener::ListenerEvent;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Timed out waiting for the peer.
    #[error("Timed out waiting for acknowledgement")]
    Timeout,

    /// The peer answered a request with a negative acknowledgement.
    #[error("Request {0} rejected by peer")]
    Rejected(PacketId),

    /// Invalid channel name.
    #[error("Invalid channel: {0}")]
    InvalidChannel(#[from] ChannelError),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error only concerns one unit of undecodable input, after
    /// which reading can go on.
    #[must_use]
    pub fn is_invalid_data(&self) -> bool {
        matches!(self, TransportError::Protocol(e) if e.is_invalid_data())
    }
}

/// Something a [`Listener`](crate::Listener) can read objects from.
///
/// `read_object` must be cancel safe: the listener drops the pending future
/// when it is stopped, and a later call must pick up where the stream left
/// off.
#[async_trait]
pub trait ObjectSource: Send + 'static {
    /// Read one object.
    ///
    /// `Ok(None)` reports a null object. An error for which
    /// [`TransportError::is_invalid_data`] holds skips one unit of input;
    /// any other error ends the read loop.
    async fn read_object(&mut self) -> Result<Option<Packet>, TransportError>;

    /// Called once the read loop has been unblocked by a stop.
    async fn on_stop(&mut self) {}

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Receives the events a listener raises.
///
/// Observers run on the listener's dispatcher task, one event at a time and
/// in read order.
pub trait ListenerObserver: Send + Sync + 'static {
    /// Handle one event.
    fn on_event(&self, event: &ListenerEvent);
}

impl<F> ListenerObserver for F
where
    F: Fn(&ListenerEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &ListenerEvent) {
        self(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_data_classification() {
        let bad = malformed_chunk_error();
        assert!(TransportError::Protocol(bad).is_invalid_data());
        assert!(!TransportError::Protocol(ProtocolError::InvalidChunkSize(1)).is_invalid_data());
        assert!(!TransportError::ConnectionClosed.is_invalid_data());
    }

    fn malformed_chunk_error() -> ProtocolError {
        let mut buf = bytes::BytesMut::from(&[0xc1u8; 16][..]);
        canopy_protocol::codec::decode_from(&mut buf, 16).unwrap_err()
    }
}
