//! Chunk-framed packet transport over any byte stream.
//!
//! Outbound packets are queued and written by a dedicated writer task, one
//! padded frame at a time. Inbound bytes are buffered by a [`FramedSource`]
//! and decoded chunk-aligned by the transport's [`Listener`].

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use canopy_protocol::{FrameCodec, FrameDecoder, Packet, DEFAULT_CHUNK_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::listener::{Listener, ObserverId};
use crate::traits::{ListenerObserver, ObjectSource, TransportError};

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Every frame is padded to a multiple of this many bytes.
    pub chunk_size: usize,
    /// Initial capacity of the read buffer.
    pub read_buffer_capacity: usize,
    /// How long `stop` lets the writer flush queued frames before the write
    /// half is closed under it.
    pub drain_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_buffer_capacity: 8 * 1024,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Boxed read half of a stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Reads whole frames from a byte stream.
pub struct FramedSource<R> {
    reader: R,
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl<R> FramedSource<R> {
    /// Wrap a reader.
    #[must_use]
    pub fn new(reader: R, codec: FrameCodec, capacity: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(capacity),
            decoder: FrameDecoder::new(codec),
        }
    }

    /// Bytes received but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[async_trait]
impl<R> ObjectSource for FramedSource<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    async fn read_object(&mut self) -> Result<Option<Packet>, TransportError> {
        loop {
            if let Some(packet) = self.decoder.decode(&mut self.buf)? {
                return Ok(Some(packet));
            }

            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if !self.buf.is_empty() {
                    debug!(buffered = self.buf.len(), "Stream ended inside a frame");
                }
                return Err(TransportError::ConnectionClosed);
            }
            trace!(bytes = n, buffered = self.buf.len(), "Read from stream");
        }
    }

    fn name(&self) -> &'static str {
        "framed"
    }
}

/// Resolves once the frame for one sent packet has been written.
#[derive(Debug)]
pub struct WriteCompletion {
    rx: oneshot::Receiver<Result<(), TransportError>>,
}

impl Future for WriteCompletion {
    type Output = Result<(), TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(TransportError::ConnectionClosed)))
    }
}

struct WriteRequest {
    packet: Arc<Packet>,
    done: oneshot::Sender<Result<(), TransportError>>,
}

/// Bidirectional packet transport over a byte stream.
///
/// Must be created inside a tokio runtime. The writer task starts right away;
/// reading starts with [`start`](Self::start).
pub struct FramedTransport {
    listener: Listener<FramedSource<BoxedReader>>,
    tx: Mutex<Option<mpsc::UnboundedSender<WriteRequest>>>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    close_writer: watch::Sender<bool>,
    drain_timeout: Duration,
    codec: FrameCodec,
}

impl FramedTransport {
    /// Split a stream into a reader and a writer task.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured chunk size is out of range.
    pub fn new<T>(stream: T, config: &TransportConfig) -> Result<Self, TransportError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = FrameCodec::new(config.chunk_size)?;
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(read_half);

        let (tx, rx) = mpsc::unbounded_channel();
        let (close_writer, close_rx) = watch::channel(false);
        let writer = tokio::spawn(write_loop(write_half, codec, rx, close_rx));

        Ok(Self {
            listener: Listener::new(FramedSource::new(
                reader,
                codec,
                config.read_buffer_capacity,
            )),
            tx: Mutex::new(Some(tx)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            close_writer,
            drain_timeout: config.drain_timeout,
            codec,
        })
    }

    /// The chunk size frames are padded to.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.codec.chunk_size()
    }

    /// Add an observer for inbound events.
    pub fn add_observer(&self, observer: impl ListenerObserver) -> ObserverId {
        self.listener.add_observer(observer)
    }

    /// Remove an observer.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.listener.remove_observer(id)
    }

    /// Start reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be started.
    pub async fn start(&self) -> Result<bool, TransportError> {
        self.listener.start().await
    }

    /// Whether the read loop is running.
    #[must_use]
    pub fn is_reading(&self) -> bool {
        self.listener.is_running()
    }

    /// Whether packets can still be sent.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.tx
            .lock()
            .map(|tx| tx.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Queue a packet for writing.
    ///
    /// The returned completion resolves once the frame has been written, or
    /// with an error if writing failed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the transport has been
    /// stopped or its writer has failed.
    pub fn send(&self, packet: impl Into<Arc<Packet>>) -> Result<WriteCompletion, TransportError> {
        let (done, rx) = oneshot::channel();
        let request = WriteRequest {
            packet: packet.into(),
            done,
        };

        let guard = self.tx.lock().map_err(|_| TransportError::ConnectionClosed)?;
        let tx = guard.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(request)
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(WriteCompletion { rx })
    }

    /// Stop reading, write out what is queued, and close the write half.
    ///
    /// Queued frames get [`TransportConfig::drain_timeout`] to be written.
    /// After that the pending write is abandoned, its completion and every
    /// later one fail with [`TransportError::ConnectionClosed`], and the write
    /// half is closed regardless of the peer.
    pub async fn stop(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        self.listener.stop().await;

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let result = match tokio::time::timeout(self.drain_timeout, &mut writer).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(timeout = ?self.drain_timeout, "Writer did not drain, closing it");
                    let _ = self.close_writer.send(true);
                    writer.await
                }
            };
            if let Err(e) = result {
                warn!("Writer task failed: {}", e);
            }
        }
    }
}

/// Resolves once the writer is told to give up, or the transport is gone.
async fn closed(close: &mut watch::Receiver<bool>) {
    let _ = close.wait_for(|closed| *closed).await;
}

async fn write_loop<W>(
    mut writer: W,
    codec: FrameCodec,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
    mut close: watch::Receiver<bool>,
) where
    W: AsyncWrite + Send + Unpin,
{
    let mut buf = BytesMut::with_capacity(codec.chunk_size());

    loop {
        let request = tokio::select! {
            biased;
            _ = closed(&mut close) => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        buf.clear();
        if let Err(e) = codec.encode_into(&request.packet, &mut buf) {
            warn!(packet = request.packet.id(), error = %e, "Failed to encode packet");
            let _ = request.done.send(Err(e.into()));
            continue;
        }

        let write = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        };
        let result = tokio::select! {
            biased;
            _ = closed(&mut close) => {
                debug!(packet = request.packet.id(), "Write abandoned on close");
                let _ = request.done.send(Err(TransportError::ConnectionClosed));
                break;
            }
            result = write => result,
        };

        match result {
            Ok(()) => {
                trace!(packet = request.packet.id(), bytes = buf.len(), "Frame written");
                let _ = request.done.send(Ok(()));
            }
            Err(e) => {
                debug!(error = %e, "Write failed, closing writer");
                let _ = request.done.send(Err(e.into()));
                break;
            }
        }
    }

    rx.close();
    while let Ok(request) = rx.try_recv() {
        let _ = request.done.send(Err(TransportError::ConnectionClosed));
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenerEvent;
    use canopy_protocol::codec;
    use std::time::Duration;
    use tokio::io::duplex;

    fn collect(transport: &FramedTransport) -> mpsc::UnboundedReceiver<ListenerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.add_observer(move |event: &ListenerEvent| drop(tx.send(event.clone())));
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ListenerEvent>) -> ListenerEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn small_config() -> TransportConfig {
        TransportConfig {
            chunk_size: 64,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_round_trip_small_and_large() {
        let (a, b) = duplex(1024);
        let left = FramedTransport::new(a, &small_config()).unwrap();
        let right = FramedTransport::new(b, &small_config()).unwrap();
        let mut events = collect(&right);
        right.start().await.unwrap();

        let small = Packet::message("left", Some("chat"), b"hi".to_vec(), false);
        let large = Packet::message("left", Some("chat"), vec![7u8; 1000], true);
        left.send(small.clone()).unwrap().await.unwrap();
        left.send(large.clone()).unwrap().await.unwrap();

        match next(&mut events).await {
            ListenerEvent::Message(p) => assert_eq!(*p, small),
            other => panic!("unexpected event: {other:?}"),
        }
        match next(&mut events).await {
            ListenerEvent::Message(p) => assert_eq!(*p, large),
            other => panic!("unexpected event: {other:?}"),
        }

        left.stop().await;
        right.stop().await;
    }

    #[tokio::test]
    async fn test_frames_are_chunk_aligned() {
        let (a, mut b) = duplex(4096);
        let transport = FramedTransport::new(a, &small_config()).unwrap();
        transport
            .send(Packet::message("n", None, vec![1u8; 100], false))
            .unwrap()
            .await
            .unwrap();
        transport.stop().await;

        let mut written = Vec::new();
        b.read_to_end(&mut written).await.unwrap();
        assert_eq!(written.len() % 64, 0);
        assert!(written.len() >= 128);
    }

    #[tokio::test]
    async fn test_invalid_chunk_then_valid_frame() {
        let (a, mut b) = duplex(4096);
        let transport = FramedTransport::new(a, &small_config()).unwrap();
        let mut events = collect(&transport);
        transport.start().await.unwrap();

        b.write_all(&[0xc1; 64]).await.unwrap();
        let packet = Packet::subscribe("peer", "a/b");
        b.write_all(&codec::encode(&packet, 64).unwrap()).await.unwrap();

        assert!(matches!(next(&mut events).await, ListenerEvent::InvalidData(_)));
        match next(&mut events).await {
            ListenerEvent::Message(p) => assert_eq!(*p, packet),
            other => panic!("unexpected event: {other:?}"),
        }
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_eof_raises_exception() {
        let (a, b) = duplex(1024);
        let transport = FramedTransport::new(a, &small_config()).unwrap();
        let mut events = collect(&transport);
        transport.start().await.unwrap();

        drop(b);
        assert!(matches!(next(&mut events).await, ListenerEvent::Exception(_)));
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_send_after_stop() {
        let (a, _b) = duplex(1024);
        let transport = FramedTransport::new(a, &small_config()).unwrap();
        transport.stop().await;

        assert!(!transport.is_open());
        assert!(matches!(
            transport.send(Packet::resend("n")),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_stop_with_peer_not_reading() {
        // The peer stays open but never reads, so the writer stalls once the
        // duplex buffer is full.
        let (a, _peer) = duplex(256);
        let config = TransportConfig {
            chunk_size: 64,
            drain_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let transport = FramedTransport::new(a, &config).unwrap();
        let completions: Vec<WriteCompletion> = (0..10)
            .map(|_| {
                transport
                    .send(Packet::message("n", None, vec![0u8; 100], false))
                    .unwrap()
            })
            .collect();

        tokio::time::timeout(Duration::from_secs(2), transport.stop())
            .await
            .unwrap();

        let mut failed = 0;
        for completion in completions {
            if let Err(e) = completion.await {
                assert!(matches!(e, TransportError::ConnectionClosed));
                failed += 1;
            }
        }
        assert!(failed > 0);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_tcp_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let server = accept.await.unwrap();

        let left = FramedTransport::new(client, &TransportConfig::default()).unwrap();
        let right = FramedTransport::new(server, &TransportConfig::default()).unwrap();
        let mut events = collect(&right);
        right.start().await.unwrap();

        for i in 0..20u8 {
            left.send(Packet::message("left", None, vec![i; 300], false)).unwrap();
        }
        for i in 0..20u8 {
            match next(&mut events).await {
                ListenerEvent::Message(p) => match p.as_ref() {
                    Packet::Message { payload, .. } => assert_eq!(payload[0], i),
                    other => panic!("unexpected packet: {other:?}"),
                },
                other => panic!("unexpected event: {other:?}"),
            }
        }

        left.stop().await;
        right.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_chunk_size() {
        let (a, _b) = duplex(64);
        let config = TransportConfig {
            chunk_size: 3,
            ..Default::default()
        };
        assert!(matches!(
            FramedTransport::new(a, &config),
            Err(TransportError::Protocol(_))
        ));
    }
}
