//! Subscriber handles tracked by the router.

use canopy_protocol::{NodeId, Packet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

/// Delivery errors reported by a subscriber.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The node can no longer accept packets.
    #[error("Node closed: {0}")]
    Closed(NodeId),

    /// The node refused the packet.
    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

/// The delivery capability behind a [`NodeHandle`].
///
/// `deliver` is called from the router on whichever task submitted the
/// packet and must not block: implementations hand the packet to a queue and
/// return.
pub trait Subscriber: Send + Sync {
    /// The node's identity.
    fn id(&self) -> &NodeId;

    /// Hand a packet to the node.
    fn deliver(&self, packet: Arc<Packet>) -> Result<(), DeliveryError>;
}

/// A cloneable handle to a subscriber.
///
/// Equality and hashing use the node ID only, so two handles to the same node
/// are interchangeable in sets.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<dyn Subscriber>,
}

impl NodeHandle {
    /// Wrap a shared subscriber.
    #[must_use]
    pub fn new(inner: Arc<dyn Subscriber>) -> Self {
        Self { inner }
    }

    /// Wrap an owned subscriber.
    #[must_use]
    pub fn from_subscriber<S: Subscriber + 'static>(subscriber: S) -> Self {
        Self::new(Arc::new(subscriber))
    }

    /// The node's identity.
    #[must_use]
    pub fn id(&self) -> &NodeId {
        self.inner.id()
    }

    /// Hand a packet to the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node rejected the packet or is closed.
    pub fn deliver(&self, packet: Arc<Packet>) -> Result<(), DeliveryError> {
        self.inner.deliver(packet)
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for NodeHandle {}

impl Hash for NodeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeHandle").field(self.id()).finish()
    }
}
