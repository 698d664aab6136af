//! In-process node attached directly to a [`Router`].

use crate::node::{DeliveryError, NodeHandle, Subscriber};
use crate::router::{Router, RouterError};
use crate::subscription::{HandlerRegistry, SubscriptionHandle};
use canopy_protocol::{ChannelPath, NodeId, Packet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Delivery side of a [`LocalNode`]: queues packets for the dispatcher task.
struct LocalSubscriber {
    id: NodeId,
    tx: mpsc::UnboundedSender<Arc<Packet>>,
    open: AtomicBool,
}

impl Subscriber for LocalSubscriber {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn deliver(&self, packet: Arc<Packet>) -> Result<(), DeliveryError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(DeliveryError::Closed(self.id.clone()));
        }
        self.tx
            .send(packet)
            .map_err(|_| DeliveryError::Closed(self.id.clone()))
    }
}

/// A node living in the broker's own process.
///
/// Received packets are handed to handlers on a dedicated dispatcher task, in
/// the order the router delivered them. Must be created inside a tokio
/// runtime.
pub struct LocalNode {
    router: Arc<Router>,
    handle: NodeHandle,
    subscriber: Arc<LocalSubscriber>,
    handlers: Arc<HandlerRegistry>,
    close_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl LocalNode {
    /// Register a new node with a generated ID.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::AlreadyRegistered`] if the generated ID is
    /// taken.
    pub fn connect(router: Arc<Router>) -> Result<Self, RouterError> {
        Self::connect_with_id(router, NodeId::generate())
    }

    /// Register a new node with the given ID.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::AlreadyRegistered`] if a node with this ID is
    /// already registered.
    pub fn connect_with_id(router: Arc<Router>, id: NodeId) -> Result<Self, RouterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let subscriber = Arc::new(LocalSubscriber {
            id: id.clone(),
            tx,
            open: AtomicBool::new(true),
        });
        let handle = NodeHandle::new(subscriber.clone());
        if !router.register(handle.clone()) {
            return Err(RouterError::AlreadyRegistered(id));
        }

        let handlers = Arc::new(HandlerRegistry::new());
        let dispatcher = tokio::spawn(dispatch_loop(rx, close_rx, Arc::clone(&handlers)));
        debug!(node = %id, "Local node connected");

        Ok(Self {
            router,
            handle,
            subscriber,
            handlers,
            close_tx,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// The node's ID.
    #[must_use]
    pub fn id(&self) -> &NodeId {
        self.handle.id()
    }

    /// The handle the router knows this node by.
    #[must_use]
    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    /// Whether the node has not been disposed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.subscriber.open.load(Ordering::Acquire)
    }

    /// Publish a payload to a channel, or broadcast it when `channel` is
    /// `None`. Returns the number of nodes it was handed to.
    ///
    /// # Errors
    ///
    /// Returns the router's error if the channel is invalid or unknown.
    pub fn publish(
        &self,
        channel: Option<&str>,
        payload: impl Into<Vec<u8>>,
        propagate: bool,
    ) -> Result<usize, RouterError> {
        let packet = Packet::message(self.id().clone(), channel, payload, propagate);
        self.router.submit(&self.handle, packet)
    }

    /// Add a handler for a channel, or for broadcasts when `channel` is
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid or the node has been
    /// disposed.
    pub fn subscribe<F>(
        &self,
        channel: Option<&str>,
        handler: F,
    ) -> Result<SubscriptionHandle, RouterError>
    where
        F: Fn(Arc<Packet>) + Send + Sync + 'static,
    {
        let path = channel.map(ChannelPath::parse).transpose()?;
        let name = path.as_ref().map(|path| path.as_str().to_owned());
        self.handlers.insert_with(path, Arc::new(handler), |_| {
            self.router.subscribe(&self.handle, name.as_deref())
        })
    }

    /// Remove a handler. The router subscription goes away with the last
    /// handler on the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the node has been disposed.
    pub fn unsubscribe(&self, subscription: &SubscriptionHandle) -> Result<bool, RouterError> {
        self.handlers.remove_with(subscription, |last| match subscription.channel() {
            Some(channel) if last => self
                .router
                .unsubscribe(&self.handle, Some(channel.as_str()))
                .map(drop),
            _ => Ok(()),
        })
    }

    /// Unregister the node and wait for already-queued packets to be
    /// handled. Later calls are no-ops.
    pub async fn dispose(&self) {
        self.close();
        let dispatcher = self
            .dispatcher
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
            debug!(node = %self.id(), "Local node disposed");
        }
    }

    fn close(&self) {
        if self.subscriber.open.swap(false, Ordering::AcqRel) {
            self.router.unregister(&self.handle);
            let _ = self.close_tx.send(true);
        }
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        self.close();
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Arc<Packet>>,
    mut close_rx: watch::Receiver<bool>,
    handlers: Arc<HandlerRegistry>,
) {
    loop {
        tokio::select! {
            biased;
            packet = rx.recv() => match packet {
                Some(packet) => {
                    let invoked = handlers.dispatch(&packet);
                    trace!(packet = packet.id(), invoked, "Dispatched");
                }
                None => break,
            },
            _ = close_rx.changed() => {
                while let Ok(packet) = rx.try_recv() {
                    handlers.dispatch(&packet);
                }
                break;
            }
        }
    }
}
