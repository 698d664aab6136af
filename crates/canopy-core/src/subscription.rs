//! Node-side handler bookkeeping shared by in-process and remote nodes.

use canopy_protocol::{ChannelPath, Packet};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Callback invoked for every matching message a node receives.
pub type PacketHandler = Arc<dyn Fn(Arc<Packet>) + Send + Sync>;

/// Identifies one handler registration.
///
/// `channel` is `None` for broadcast handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    channel: Option<ChannelPath>,
}

impl SubscriptionHandle {
    /// Registration ID, unique within its registry.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The subscribed channel, or `None` for the broadcast scope.
    #[must_use]
    pub fn channel(&self) -> Option<&ChannelPath> {
        self.channel.as_ref()
    }
}

/// Handlers keyed by the channel they listen on.
///
/// Several handlers may share a channel; the router only needs to hear about
/// the first one added and the last one removed. The `*_with` variants run
/// that router update while the channel's entry is locked, so a concurrent
/// insert or remove on the same channel observes it as done.
pub struct HandlerRegistry {
    handlers: DashMap<Option<ChannelPath>, Vec<(u64, PacketHandler)>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a handler.
    ///
    /// The flag is `true` when this is the first handler on the channel.
    pub fn insert(
        &self,
        channel: Option<ChannelPath>,
        handler: PacketHandler,
    ) -> (SubscriptionHandle, bool) {
        let mut first = false;
        let handle = self
            .insert_with(channel, handler, |is_first| -> Result<(), Infallible> {
                first = is_first;
                Ok(())
            })
            .unwrap_or_else(|never| match never {});
        (handle, first)
    }

    /// Add a handler after `sync` accepts it.
    ///
    /// `sync` is told whether this is the first handler on the channel and
    /// runs with the channel locked. If it fails, nothing is added.
    ///
    /// # Errors
    ///
    /// Returns the error from `sync`.
    pub fn insert_with<E>(
        &self,
        channel: Option<ChannelPath>,
        handler: PacketHandler,
        sync: impl FnOnce(bool) -> Result<(), E>,
    ) -> Result<SubscriptionHandle, E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.handlers.entry(channel.clone()) {
            Entry::Occupied(mut entry) => {
                sync(false)?;
                entry.get_mut().push((id, handler));
            }
            Entry::Vacant(entry) => {
                sync(true)?;
                entry.insert(vec![(id, handler)]);
            }
        }
        Ok(SubscriptionHandle { id, channel })
    }

    /// Remove a handler.
    ///
    /// Returns `(removed, last)`, where `last` is `true` when no handler is
    /// left on the channel.
    pub fn remove(&self, handle: &SubscriptionHandle) -> (bool, bool) {
        let mut last = false;
        let removed = self
            .remove_with(handle, |is_last| -> Result<(), Infallible> {
                last = is_last;
                Ok(())
            })
            .unwrap_or_else(|never| match never {});
        (removed, last)
    }

    /// Remove a handler after `sync` accepts it.
    ///
    /// `sync` is told whether this is the last handler on the channel and
    /// runs with the channel locked. It is not called when the handler is
    /// unknown. If it fails, the handler stays.
    ///
    /// # Errors
    ///
    /// Returns the error from `sync`.
    pub fn remove_with<E>(
        &self,
        handle: &SubscriptionHandle,
        sync: impl FnOnce(bool) -> Result<(), E>,
    ) -> Result<bool, E> {
        let Entry::Occupied(mut entry) = self.handlers.entry(handle.channel.clone()) else {
            return Ok(false);
        };
        let Some(index) = entry.get().iter().position(|(id, _)| *id == handle.id) else {
            return Ok(false);
        };

        let last = entry.get().len() == 1;
        sync(last)?;
        if last {
            entry.remove();
        } else {
            entry.get_mut().remove(index);
        }
        Ok(true)
    }

    /// Whether any handler listens on the channel.
    #[must_use]
    pub fn has_channel(&self, channel: Option<&ChannelPath>) -> bool {
        self.handlers
            .get(&channel.cloned())
            .is_some_and(|list| !list.is_empty())
    }

    /// Channels with at least one handler, broadcast scope excluded.
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelPath> {
        self.handlers
            .iter()
            .filter_map(|entry| entry.key().clone())
            .collect()
    }

    /// Total number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether the registry has no handlers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.handlers.clear();
    }

    /// Invoke the handlers a message packet matches.
    ///
    /// Broadcasts reach broadcast handlers. Channel messages reach handlers on
    /// the target channel, and on its descendants when the packet propagates.
    /// Packets that are not messages, or name an invalid channel, match
    /// nothing. Returns the number of handlers invoked.
    pub fn dispatch(&self, packet: &Arc<Packet>) -> usize {
        let Packet::Message {
            channel, propagate, ..
        } = packet.as_ref()
        else {
            return 0;
        };

        let target = match channel.as_deref().map(ChannelPath::parse).transpose() {
            Ok(target) => target,
            Err(e) => {
                trace!(error = %e, "Dropping message with invalid channel");
                return 0;
            }
        };

        // Handlers are cloned out so none runs while a shard lock is held.
        let matched: Vec<PacketHandler> = self
            .handlers
            .iter()
            .filter(|entry| match (entry.key(), &target) {
                (None, None) => true,
                (Some(subscribed), Some(target)) => subscribed.receives(target, *propagate),
                _ => false,
            })
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect::<Vec<_>>()
            })
            .collect();

        for handler in &matched {
            handler(Arc::clone(packet));
        }
        matched.len()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting() -> (PacketHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let handler: PacketHandler = Arc::new(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (handler, count)
    }

    fn path(name: &str) -> Option<ChannelPath> {
        Some(ChannelPath::parse(name).unwrap())
    }

    #[test]
    fn test_first_and_last() {
        let registry = HandlerRegistry::new();
        let (h1, _) = counting();
        let (h2, _) = counting();

        let (a, first) = registry.insert(path("chat"), h1);
        assert!(first);
        let (b, first) = registry.insert(path("chat"), h2);
        assert!(!first);
        assert_ne!(a.id(), b.id());

        assert_eq!(registry.remove(&a), (true, false));
        assert_eq!(registry.remove(&a), (false, false));
        assert_eq!(registry.remove(&b), (true, true));
        assert!(!registry.has_channel(path("chat").as_ref()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failed_sync_changes_nothing() {
        let registry = HandlerRegistry::new();
        let (h, _) = counting();

        let refused = registry.insert_with(path("chat"), Arc::clone(&h), |_| Err("refused"));
        assert_eq!(refused, Err("refused"));
        assert!(!registry.has_channel(path("chat").as_ref()));

        let (handle, _) = registry.insert(path("chat"), h);
        assert_eq!(registry.remove_with(&handle, |_| Err("refused")), Err("refused"));
        assert!(registry.has_channel(path("chat").as_ref()));
        assert_eq!(registry.remove_with(&handle, |last| {
            assert!(last);
            Ok::<_, &str>(())
        }), Ok(true));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_last_removal_excludes_concurrent_insert() {
        let registry = Arc::new(HandlerRegistry::new());
        let (h, _) = counting();
        let (handle, _) = registry.insert(path("chat"), Arc::clone(&h));

        // An insert racing the last removal waits until it has finished, so it
        // is the first handler again and resubscribes.
        let mut racer = None;
        let removed = registry.remove_with(&handle, |last| {
            assert!(last);
            let registry = Arc::clone(&registry);
            let h = Arc::clone(&h);
            racer = Some(std::thread::spawn(move || registry.insert(path("chat"), h).1));
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok::<_, ()>(())
        });

        assert_eq!(removed, Ok(true));
        assert!(racer.unwrap().join().unwrap());
        assert!(registry.has_channel(path("chat").as_ref()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dispatch_matching() {
        let registry = HandlerRegistry::new();
        let (chat, chat_count) = counting();
        let (child, child_count) = counting();
        let (all, all_count) = counting();
        registry.insert(path("chat"), chat);
        registry.insert(path("chat/x"), child);
        registry.insert(None, all);

        let exact = Arc::new(Packet::message("p", Some("CHAT"), Vec::new(), false));
        assert_eq!(registry.dispatch(&exact), 1);

        let propagating = Arc::new(Packet::message("p", Some("chat"), Vec::new(), true));
        assert_eq!(registry.dispatch(&propagating), 2);

        let broadcast = Arc::new(Packet::message("p", None, Vec::new(), false));
        assert_eq!(registry.dispatch(&broadcast), 1);

        assert_eq!(chat_count.load(Ordering::SeqCst), 2);
        assert_eq!(child_count.load(Ordering::SeqCst), 1);
        assert_eq!(all_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_ignores_non_messages() {
        let registry = HandlerRegistry::new();
        let (all, count) = counting();
        registry.insert(None, all);

        let packet = Arc::new(Packet::subscribe("p", "chat"));
        assert_eq!(registry.dispatch(&packet), 0);
        let invalid = Arc::new(Packet::message("p", Some("a//b"), Vec::new(), false));
        assert_eq!(registry.dispatch(&invalid), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_channels() {
        let registry = HandlerRegistry::new();
        let (h, _) = counting();
        registry.insert(path("a"), Arc::clone(&h));
        registry.insert(path("b"), Arc::clone(&h));
        registry.insert(None, h);

        let mut channels: Vec<_> = registry
            .channels()
            .into_iter()
            .map(|c| c.to_string())
            .collect();
        channels.sort();
        assert_eq!(channels, vec!["/a", "/b"]);
        assert_eq!(registry.len(), 3);
    }
}
