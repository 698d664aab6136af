//! Remote node speaking the framed protocol to a broker.

use std::sync::Arc;
use std::time::Duration;

use canopy_core::{HandlerRegistry, SubscriptionHandle};
use canopy_protocol::{ChannelPath, NodeId, Packet, PacketId};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use crate::framed::{FramedTransport, TransportConfig, WriteCompletion};
use crate::listener::ListenerEvent;
use crate::traits::TransportError;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker address.
    pub addr: String,
    /// Node ID; generated when `None`.
    pub node_id: Option<NodeId>,
    /// Framing settings, which must match the broker's.
    pub transport: TransportConfig,
    /// How long to wait for the broker to acknowledge a request.
    pub ack_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:7400".to_string(),
            node_id: None,
            transport: TransportConfig::default(),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

type PendingAcks = DashMap<PacketId, oneshot::Sender<bool>>;

/// A node connected to a broker over a byte stream.
pub struct Client {
    id: NodeId,
    transport: FramedTransport,
    handlers: Arc<HandlerRegistry>,
    pending: Arc<PendingAcks>,
    /// Held across a handler change and the broker request it triggers.
    membership: Mutex<()>,
    ack_timeout: Duration,
}

impl Client {
    /// Connect to a broker over TCP.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(config: ClientConfig) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(&config.addr).await?;
        stream.set_nodelay(true)?;
        info!("Connected to {}", config.addr);
        Self::with_stream(stream, config).await
    }

    /// Run the client over an already-connected stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be set up.
    pub async fn with_stream<T>(stream: T, config: ClientConfig) -> Result<Self, TransportError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = config.node_id.unwrap_or_else(NodeId::generate);
        let transport = FramedTransport::new(stream, &config.transport)?;
        let handlers = Arc::new(HandlerRegistry::new());
        let pending: Arc<PendingAcks> = Arc::new(DashMap::new());

        let observer_handlers = Arc::clone(&handlers);
        let observer_pending = Arc::clone(&pending);
        let node = id.clone();
        transport.add_observer(move |event: &ListenerEvent| {
            on_event(&node, event, &observer_handlers, &observer_pending);
        });
        transport.start().await?;

        Ok(Self {
            id,
            transport,
            handlers,
            pending,
            membership: Mutex::new(()),
            ack_timeout: config.ack_timeout,
        })
    }

    /// The node's ID.
    #[must_use]
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Whether the connection is still usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_open() && self.transport.is_reading()
    }

    /// Publish a payload to a channel, or broadcast it when `channel` is
    /// `None`.
    ///
    /// The returned completion resolves once the packet has been written.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid or the connection is
    /// closed.
    pub fn publish(
        &self,
        channel: Option<&str>,
        payload: impl Into<Vec<u8>>,
        propagate: bool,
    ) -> Result<WriteCompletion, TransportError> {
        let packet = self.message(channel, payload, propagate)?;
        self.transport.send(packet)
    }

    /// Publish and wait for the broker to accept the message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Rejected`] if the broker refused it (for
    /// example an exact send to an unknown channel), or
    /// [`TransportError::Timeout`] if no answer came in time.
    pub async fn publish_acked(
        &self,
        channel: Option<&str>,
        payload: impl Into<Vec<u8>>,
        propagate: bool,
    ) -> Result<(), TransportError> {
        let packet = self.message(channel, payload, propagate)?;
        self.request(packet).await
    }

    /// Add a handler for a channel, or for broadcasts when `channel` is
    /// `None`. The first handler on a channel subscribes with the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid or the broker did not
    /// accept the subscription.
    pub async fn subscribe<F>(
        &self,
        channel: Option<&str>,
        handler: F,
    ) -> Result<SubscriptionHandle, TransportError>
    where
        F: Fn(Arc<Packet>) + Send + Sync + 'static,
    {
        let path = channel.map(ChannelPath::parse).transpose()?;
        let _membership = self.membership.lock().await;
        let (subscription, first) = self.handlers.insert(path, Arc::new(handler));

        if let (true, Some(path)) = (first, subscription.channel()) {
            let packet = Packet::subscribe(self.id.clone(), path.as_str());
            if let Err(e) = self.request(packet).await {
                self.handlers.remove(&subscription);
                return Err(e);
            }
        }
        Ok(subscription)
    }

    /// Remove a handler. The last handler on a channel unsubscribes with the
    /// broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker could not be told.
    pub async fn unsubscribe(&self, subscription: &SubscriptionHandle) -> Result<bool, TransportError> {
        let _membership = self.membership.lock().await;
        let (removed, last) = self.handlers.remove(subscription);
        if let (true, Some(path)) = (last, subscription.channel()) {
            let packet = Packet::unsubscribe(self.id.clone(), path.as_str());
            self.request(packet).await?;
        }
        Ok(removed)
    }

    /// Close the connection. Queued packets are written first.
    pub async fn dispose(&self) {
        self.transport.stop().await;
        self.handlers.clear();
        self.pending.clear();
        debug!(node = %self.id, "Client disposed");
    }

    fn message(
        &self,
        channel: Option<&str>,
        payload: impl Into<Vec<u8>>,
        propagate: bool,
    ) -> Result<Packet, TransportError> {
        let path = channel.map(ChannelPath::parse).transpose()?;
        Ok(Packet::message(
            self.id.clone(),
            path.as_ref().map(ChannelPath::as_str),
            payload,
            propagate,
        ))
    }

    /// Send a packet and wait for the broker's ACK or NACK.
    async fn request(&self, packet: Packet) -> Result<(), TransportError> {
        let id = packet.id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let sent = match self.transport.send(packet) {
            Ok(completion) => completion.await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(TransportError::Rejected(id)),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }
}

fn on_event(node: &NodeId, event: &ListenerEvent, handlers: &HandlerRegistry, pending: &PendingAcks) {
    match event {
        ListenerEvent::Message(packet) => {
            let invoked = handlers.dispatch(packet);
            trace!(node = %node, packet = packet.id(), invoked, "Received");
        }
        ListenerEvent::Meta(packet) => {
            if let Packet::Meta {
                ack,
                reply_to: Some(reply_to),
                ..
            } = packet.as_ref()
            {
                if let Some((_, waiter)) = pending.remove(reply_to) {
                    let _ = waiter.send(*ack);
                }
            } else {
                trace!(node = %node, "Meta packet without correlation");
            }
        }
        ListenerEvent::Error(packet) => {
            if let Packet::Error { diagnostic, .. } = packet.as_ref() {
                warn!(node = %node, diagnostic = diagnostic.as_deref().unwrap_or(""), "Broker reported an error");
            }
        }
        ListenerEvent::InvalidData(e) => warn!(node = %node, error = %e, "Undecodable data from broker"),
        ListenerEvent::Null => {}
        ListenerEvent::Exception(e) => {
            debug!(node = %node, error = %e, "Connection to broker ended");
            // Dropping the senders fails every waiting request.
            pending.clear();
        }
    }
}
