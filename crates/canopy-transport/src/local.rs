//! In-process object source.

use async_trait::async_trait;
use canopy_protocol::Packet;
use tokio::sync::mpsc;

use crate::traits::{ObjectSource, TransportError};

/// Sending side of a [`ChannelSource`].
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Option<Packet>>,
}

impl ChannelSink {
    /// Queue a packet.
    ///
    /// # Errors
    ///
    /// Returns an error if the source has been dropped.
    pub fn send(&self, packet: Packet) -> Result<(), TransportError> {
        self.tx
            .send(Some(packet))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Queue a null object.
    ///
    /// # Errors
    ///
    /// Returns an error if the source has been dropped.
    pub fn send_null(&self) -> Result<(), TransportError> {
        self.tx
            .send(None)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Whether the source has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Object source fed from within the process.
///
/// Once every [`ChannelSink`] is dropped, reading fails with
/// [`TransportError::ConnectionClosed`]. Stopping a listener leaves the queue
/// open; objects sent meanwhile are read after the next start.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Option<Packet>>,
}

impl ChannelSource {
    /// Create a connected sink and source.
    #[must_use]
    pub fn pair() -> (ChannelSink, ChannelSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, ChannelSource { rx })
    }
}

#[async_trait]
impl ObjectSource for ChannelSource {
    async fn read_object(&mut self) -> Result<Option<Packet>, TransportError> {
        self.rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_in_order() {
        let (sink, mut source) = ChannelSource::pair();
        sink.send(Packet::subscribe("p", "a")).unwrap();
        sink.send_null().unwrap();

        let first = source.read_object().await.unwrap().unwrap();
        assert_eq!(first.channel(), Some("a"));
        assert!(source.read_object().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed() {
        let (sink, mut source) = ChannelSource::pair();
        drop(sink);
        assert!(matches!(
            source.read_object().await,
            Err(TransportError::ConnectionClosed)
        ));

        let (sink, source) = ChannelSource::pair();
        drop(source);
        assert!(sink.is_closed());
        assert!(sink.send_null().is_err());
    }
}
