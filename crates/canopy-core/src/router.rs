//! Publish/subscribe router for Canopy.
//!
//! The router owns the node registry and the channel subscription tree, and
//! fans submitted messages out to the matching subscriber handles.

use crate::channel::ChannelTree;
use crate::concurrent_set::ConcurrentSet;
use crate::node::NodeHandle;
use canopy_protocol::{ChannelError, NodeId, Packet, PacketKind};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(#[from] ChannelError),

    /// Channel not found.
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// The node must be registered first.
    #[error("Node not registered: {0}")]
    NotRegistered(NodeId),

    /// Another node is registered under the same ID.
    #[error("Node already registered: {0}")]
    AlreadyRegistered(NodeId),

    /// Only message packets can be submitted.
    #[error("Packet carries no message content: {0:?}")]
    MissingContent(PacketKind),

    /// The packet does not name its publisher.
    #[error("Packet has no publisher")]
    MissingPublisher,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Remove a node from every channel when it unregisters.
    pub purge_on_unregister: bool,
    /// Remove channel nodes left empty by an unsubscribe.
    pub prune_empty_channels: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            purge_on_unregister: true,
            prune_empty_channels: false,
        }
    }
}

/// The central message router.
///
/// Every operation is synchronous and in-memory; registry and subscriber
/// sets are concurrent so connections can register, subscribe and submit in
/// parallel without a global lock.
pub struct Router {
    /// Registered nodes; broadcasts go to exactly this set.
    nodes: ConcurrentSet<NodeHandle>,
    /// Channel subscriptions.
    channels: ChannelTree<NodeHandle>,
    /// Configuration.
    config: RouterConfig,
}

impl Router {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            nodes: ConcurrentSet::new(),
            channels: ChannelTree::new(),
            config,
        }
    }

    /// The router's configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The channel subscription tree.
    #[must_use]
    pub fn channels(&self) -> &ChannelTree<NodeHandle> {
        &self.channels
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            node_count: self.nodes.len(),
            channel_count: self.channels.channel_count(),
            total_subscriptions: self.channels.subscription_count(),
        }
    }

    /// Register a node, which also makes it a broadcast recipient.
    ///
    /// Returns `false` if the node was already registered.
    pub fn register(&self, node: NodeHandle) -> bool {
        let id = node.id().clone();
        let added = self.nodes.insert(node);
        if added {
            debug!(node = %id, nodes = self.nodes.len(), "Node registered");
        }
        added
    }

    /// Unregister a node.
    ///
    /// Returns `false` if the node was not registered.
    pub fn unregister(&self, node: &NodeHandle) -> bool {
        if !self.nodes.remove(node) {
            return false;
        }
        if self.config.purge_on_unregister {
            let channels = self.channels.remove_all(node);
            debug!(node = %node.id(), channels, "Node unregistered, subscriptions purged");
        } else {
            debug!(node = %node.id(), "Node unregistered");
        }
        true
    }

    /// Check whether a node is registered.
    #[must_use]
    pub fn is_registered(&self, node: &NodeHandle) -> bool {
        self.nodes.contains(node)
    }

    /// Subscribe a node to a channel.
    ///
    /// `None` denotes the broadcast scope, which every registered node is
    /// already part of, so it succeeds without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not registered or the channel name is
    /// invalid.
    pub fn subscribe(&self, node: &NodeHandle, channel: Option<&str>) -> Result<(), RouterError> {
        self.ensure_registered(node)?;
        let Some(channel) = channel else {
            return Ok(());
        };

        self.channels.add(channel, node.clone())?;
        debug!(channel = %channel, node = %node.id(), "Subscribed");
        Ok(())
    }

    /// Unsubscribe a node from a channel.
    ///
    /// Returns `false` if the node was not subscribed there. `None` is the
    /// broadcast scope and is left only by unregistering.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not registered or the channel name is
    /// invalid.
    pub fn unsubscribe(
        &self,
        node: &NodeHandle,
        channel: Option<&str>,
    ) -> Result<bool, RouterError> {
        self.ensure_registered(node)?;
        let Some(channel) = channel else {
            return Ok(false);
        };

        let removed = self.channels.remove(channel, node)?;
        if removed {
            debug!(channel = %channel, node = %node.id(), "Unsubscribed");
            if self.config.prune_empty_channels {
                self.channels.prune_path(channel)?;
            }
        }
        Ok(removed)
    }

    /// Route a message packet.
    ///
    /// Broadcasts (no channel) go to every registered node. Otherwise the
    /// subscribers of the exact channel receive it, plus those of every
    /// descendant channel when the packet's propagate flag is set. The
    /// sender never receives its own packet.
    ///
    /// Returns the number of nodes the packet was handed to.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet is not a message, has no publisher,
    /// names an invalid channel, or names a channel that does not exist
    /// without asking to propagate.
    pub fn submit(
        &self,
        sender: &NodeHandle,
        packet: impl Into<Arc<Packet>>,
    ) -> Result<usize, RouterError> {
        let packet = packet.into();
        let (channel, propagate) = match packet.as_ref() {
            Packet::Message {
                channel, propagate, ..
            } => (channel.clone(), *propagate),
            other => return Err(RouterError::MissingContent(other.kind())),
        };
        if packet.publisher().is_empty() {
            return Err(RouterError::MissingPublisher);
        }

        let targets: Vec<NodeHandle> = match channel.as_deref() {
            None => self.nodes.snapshot(),
            Some(name) if propagate => self
                .channels
                .lookup_with_descendants(name)?
                .into_iter()
                .collect(),
            Some(name) => match self.channels.node(name)? {
                Some(node) => node.subscribers().snapshot(),
                None => return Err(RouterError::ChannelNotFound(name.to_string())),
            },
        };

        let count = self.deliver(sender, packet, targets);
        trace!(
            channel = channel.as_deref().unwrap_or("*"),
            propagate,
            recipients = count,
            "Submitted message"
        );
        Ok(count)
    }

    fn deliver(&self, sender: &NodeHandle, packet: Arc<Packet>, targets: Vec<NodeHandle>) -> usize {
        let mut count = 0;
        for target in targets {
            if target == *sender || !self.nodes.contains(&target) {
                continue;
            }
            match target.deliver(Arc::clone(&packet)) {
                Ok(()) => count += 1,
                Err(e) => warn!(node = %target.id(), error = %e, "Delivery failed"),
            }
        }
        count
    }

    /// Remove channel nodes that have no subscribers and no children.
    ///
    /// Returns the number of channel nodes removed.
    pub fn sweep_empty_channels(&self) -> usize {
        self.channels.prune_empty()
    }

    /// Get all channel names.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.channel_names()
    }

    /// Get the subscriber count for exactly this channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .node(channel)
            .ok()
            .flatten()
            .map(|node| node.subscribers().len())
            .unwrap_or(0)
    }

    fn ensure_registered(&self, node: &NodeHandle) -> Result<(), RouterError> {
        if self.nodes.contains(node) {
            Ok(())
        } else {
            Err(RouterError::NotRegistered(node.id().clone()))
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    /// Number of registered nodes.
    pub node_count: usize,
    /// Number of channel nodes in the tree.
    pub channel_count: usize,
    /// Total number of channel subscriptions.
    pub total_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::testing::RecordingSubscriber;

    fn message(publisher: &str, channel: Option<&str>, propagate: bool) -> Packet {
        Packet::message(publisher, channel, b"payload".to_vec(), propagate)
    }

    #[test]
    fn test_register_unregister() {
        let router = Router::new();
        let (node, _) = RecordingSubscriber::handle("n1");

        assert!(router.register(node.clone()));
        assert!(!router.register(node.clone()));
        assert!(router.is_registered(&node));

        assert!(router.unregister(&node));
        assert!(!router.unregister(&node));
    }

    #[test]
    fn test_subscribe_requires_registration() {
        let router = Router::new();
        let (node, _) = RecordingSubscriber::handle("n1");

        assert!(matches!(
            router.subscribe(&node, Some("chat")),
            Err(RouterError::NotRegistered(_))
        ));

        router.register(node.clone());
        router.subscribe(&node, Some("chat")).unwrap();
        router.subscribe(&node, None).unwrap();
        assert_eq!(router.subscriber_count("chat"), 1);
        assert!(matches!(
            router.subscribe(&node, Some("a//b")),
            Err(RouterError::InvalidChannel(_))
        ));
    }

    #[test]
    fn test_unsubscribe_removes() {
        let router = Router::new();
        let (node, _) = RecordingSubscriber::handle("n1");
        router.register(node.clone());
        router.subscribe(&node, Some("chat")).unwrap();

        assert!(router.unsubscribe(&node, Some("chat")).unwrap());
        assert_eq!(router.subscriber_count("chat"), 0);
        assert!(!router.unsubscribe(&node, Some("chat")).unwrap());
        // The emptied channel stays until swept.
        assert!(router.channels().contains("chat"));
        assert_eq!(router.sweep_empty_channels(), 1);
        assert!(!router.channels().contains("chat"));
    }

    #[test]
    fn test_unsubscribe_prunes_when_configured() {
        let router = Router::with_config(RouterConfig {
            prune_empty_channels: true,
            ..Default::default()
        });
        let (node, _) = RecordingSubscriber::handle("n1");
        router.register(node.clone());
        router.subscribe(&node, Some("a/b/c")).unwrap();

        router.unsubscribe(&node, Some("a/b/c")).unwrap();
        assert_eq!(router.stats().channel_count, 0);
    }

    #[test]
    fn test_submit_excludes_sender() {
        let router = Router::new();
        let (sender, sender_rx) = RecordingSubscriber::handle("sender");
        let (a, a_rx) = RecordingSubscriber::handle("a");
        let (b, b_rx) = RecordingSubscriber::handle("b");
        for node in [&sender, &a, &b] {
            router.register(node.clone());
            router.subscribe(node, Some("chat")).unwrap();
        }

        let count = router.submit(&sender, message("sender", Some("chat"), false)).unwrap();
        assert_eq!(count, 2);
        assert_eq!(a_rx.count(), 1);
        assert_eq!(b_rx.count(), 1);
        assert_eq!(sender_rx.count(), 0);
    }

    #[test]
    fn test_submit_propagation() {
        let router = Router::new();
        let (sender, _) = RecordingSubscriber::handle("sender");
        let (top, top_rx) = RecordingSubscriber::handle("top");
        let (mid, mid_rx) = RecordingSubscriber::handle("mid");
        let (leaf, leaf_rx) = RecordingSubscriber::handle("leaf");
        router.register(sender.clone());
        for (node, channel) in [(&top, "chat"), (&mid, "chat/x"), (&leaf, "chat/x/y")] {
            router.register(node.clone());
            router.subscribe(node, Some(channel)).unwrap();
        }

        let count = router.submit(&sender, message("sender", Some("chat"), false)).unwrap();
        assert_eq!(count, 1);
        assert_eq!((top_rx.count(), mid_rx.count(), leaf_rx.count()), (1, 0, 0));

        let count = router.submit(&sender, message("sender", Some("Chat"), true)).unwrap();
        assert_eq!(count, 3);
        assert_eq!((top_rx.count(), mid_rx.count(), leaf_rx.count()), (2, 1, 1));
    }

    #[test]
    fn test_submit_propagation_deduplicates() {
        let router = Router::new();
        let (sender, _) = RecordingSubscriber::handle("sender");
        let (node, rx) = RecordingSubscriber::handle("n1");
        router.register(sender.clone());
        router.register(node.clone());
        router.subscribe(&node, Some("a")).unwrap();
        router.subscribe(&node, Some("a/b")).unwrap();

        assert_eq!(router.submit(&sender, message("sender", Some("a"), true)).unwrap(), 1);
        assert_eq!(rx.count(), 1);
    }

    #[test]
    fn test_broadcast_reaches_all_registered() {
        let router = Router::new();
        let (sender, sender_rx) = RecordingSubscriber::handle("sender");
        let (a, a_rx) = RecordingSubscriber::handle("a");
        let (b, b_rx) = RecordingSubscriber::handle("b");
        let (stranger, stranger_rx) = RecordingSubscriber::handle("stranger");
        router.register(sender.clone());
        router.register(a.clone());
        router.register(b.clone());
        router.subscribe(&a, Some("somewhere")).unwrap();

        let count = router.submit(&sender, message("sender", None, false)).unwrap();
        assert_eq!(count, 2);
        assert_eq!((a_rx.count(), b_rx.count()), (1, 1));
        assert_eq!(sender_rx.count(), 0);
        assert_eq!(stranger_rx.count(), 0);
        drop(stranger);
    }

    #[test]
    fn test_submit_errors() {
        let router = Router::new();
        let (sender, _) = RecordingSubscriber::handle("sender");
        router.register(sender.clone());

        assert!(matches!(
            router.submit(&sender, message("sender", Some("nowhere"), false)),
            Err(RouterError::ChannelNotFound(_))
        ));
        // Propagating sends to a missing subtree succeed vacuously.
        assert_eq!(
            router.submit(&sender, message("sender", Some("nowhere"), true)).unwrap(),
            0
        );
        assert!(matches!(
            router.submit(&sender, Packet::subscribe("sender", "chat")),
            Err(RouterError::MissingContent(PacketKind::Subscribe))
        ));
        assert!(matches!(
            router.submit(&sender, message("", None, false)),
            Err(RouterError::MissingPublisher)
        ));
    }

    #[test]
    fn test_unregistered_node_never_receives() {
        for purge in [true, false] {
            let router = Router::with_config(RouterConfig {
                purge_on_unregister: purge,
                ..Default::default()
            });
            let (sender, _) = RecordingSubscriber::handle("sender");
            let (node, rx) = RecordingSubscriber::handle("n1");
            router.register(sender.clone());
            router.register(node.clone());
            router.subscribe(&node, Some("chat")).unwrap();

            router.unregister(&node);
            router.submit(&sender, message("sender", Some("chat"), false)).unwrap();
            router.submit(&sender, message("sender", Some("chat"), true)).unwrap();
            router.submit(&sender, message("sender", None, false)).unwrap();
            assert_eq!(rx.count(), 0);
            assert_eq!(router.subscriber_count("chat"), usize::from(!purge));
        }
    }

    #[test]
    fn test_failing_subscriber_does_not_block_others() {
        let router = Router::new();
        let (sender, _) = RecordingSubscriber::handle("sender");
        let (broken, _) = RecordingSubscriber::failing("broken");
        let (ok, ok_rx) = RecordingSubscriber::handle("ok");
        router.register(sender.clone());
        for node in [&broken, &ok] {
            router.register(node.clone());
            router.subscribe(node, Some("chat")).unwrap();
        }

        let count = router.submit(&sender, message("sender", Some("chat"), false)).unwrap();
        assert_eq!(count, 1);
        assert_eq!(ok_rx.count(), 1);
    }

    #[test]
    fn test_router_stats() {
        let router = Router::new();
        let (a, _) = RecordingSubscriber::handle("a");
        let (b, _) = RecordingSubscriber::handle("b");
        router.register(a.clone());
        router.register(b.clone());
        router.subscribe(&a, Some("channel-1")).unwrap();
        router.subscribe(&a, Some("channel-1/sub")).unwrap();
        router.subscribe(&b, Some("channel-1")).unwrap();

        let stats = router.stats();
        assert_eq!(stats.node_count, 2);
        assert_eq!(stats.channel_count, 2);
        assert_eq!(stats.total_subscriptions, 3);
    }
}
