//! Hierarchical channel subscription tree.
//!
//! Channels form a tree keyed by `/`-delimited names. Each node holds the
//! subscribers registered at exactly that channel; nodes are created lazily on
//! first use and shared by every channel with the same prefix, so `a/b/c` and
//! `a/b/d` hang off a single `a/b` node.
//!
//! ```text
//! roots
//!  └── a            (/a)
//!       └── b       (/a/b)
//!            ├── c  (/a/b/c)  {n1}
//!            └── d  (/a/b/d)  {n2, n3}
//! ```

use crate::concurrent_set::ConcurrentSet;
use canopy_protocol::{ChannelError, ChannelPath};
use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, trace};

/// One segment of the channel tree.
pub struct ChannelNode<T: Eq + Hash> {
    /// Full channel name, e.g. `/a/b`.
    name: String,
    /// Parent node; `None` for roots.
    parent: Option<Weak<ChannelNode<T>>>,
    /// Subscribers registered at exactly this channel.
    subscribers: ConcurrentSet<T>,
    /// Children keyed by their full name.
    children: DashMap<String, Arc<ChannelNode<T>>>,
}

impl<T: Eq + Hash> ChannelNode<T> {
    fn new(name: impl Into<String>, parent: Option<Weak<ChannelNode<T>>>) -> Self {
        Self {
            name: name.into(),
            parent,
            subscribers: ConcurrentSet::new(),
            children: DashMap::new(),
        }
    }

    /// The full channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parent node, if this is not a root and the parent is still alive.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<ChannelNode<T>>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Subscribers registered at exactly this channel.
    #[must_use]
    pub fn subscribers(&self) -> &ConcurrentSet<T> {
        &self.subscribers
    }

    /// Number of direct children.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Direct child with the given full name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<Arc<ChannelNode<T>>> {
        self.children.get(name).map(|c| Arc::clone(c.value()))
    }

    /// Snapshot of the direct children.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<ChannelNode<T>>> {
        self.children.iter().map(|c| Arc::clone(c.value())).collect()
    }

    /// Whether the node has neither subscribers nor children.
    fn is_vacant(&self) -> bool {
        self.subscribers.is_empty() && self.children.is_empty()
    }

    fn visit(&self, f: &mut dyn FnMut(&ChannelNode<T>)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }

    /// Remove vacant descendants, deepest first. Returns how many went.
    fn prune_children(&self) -> usize {
        let mut removed = 0;
        for child in self.children() {
            removed += child.prune_children();
            if self
                .children
                .remove_if(child.name(), |_, c| c.is_vacant())
                .is_some()
            {
                trace!(channel = %child.name(), "Pruned empty channel");
                removed += 1;
            }
        }
        removed
    }
}

impl<T: Eq + Hash + Clone> ChannelNode<T> {
    /// Union of this node's subscribers and those of every descendant.
    #[must_use]
    pub fn subscribers_with_descendants(&self) -> HashSet<T> {
        let mut out = HashSet::new();
        self.visit(&mut |node| node.subscribers.collect_into(&mut out));
        out
    }
}

impl<T: Eq + Hash> PartialEq for ChannelNode<T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<T: Eq + Hash> Eq for ChannelNode<T> {}

impl<T: Eq + Hash> Hash for ChannelNode<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl<T: Eq + Hash> fmt::Debug for ChannelNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelNode")
            .field("name", &self.name)
            .field("subscribers", &self.subscribers.len())
            .field("children", &self.children.len())
            .finish()
    }
}

/// The channel subscription tree.
///
/// All operations take `&self`. Adds run concurrently with each other and
/// with lookups; node creation is an atomic create-if-absent on the parent's
/// child map, so two adds racing on a shared prefix always end up on the
/// same node. Structural removal (`remove_channel`, pruning) is exclusive
/// with adds so a subscriber is never attached to a node being detached.
pub struct ChannelTree<T: Eq + Hash> {
    /// Root nodes keyed by their segment.
    roots: DashMap<String, Arc<ChannelNode<T>>>,
    /// Shared by adds, exclusive for structural removal.
    structure: RwLock<()>,
}

impl<T: Eq + Hash> ChannelTree<T> {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            roots: DashMap::new(),
            structure: RwLock::new(()),
        }
    }

    /// Add `item` to the channel at `path`, creating missing nodes.
    ///
    /// Returns `false` if the item was already subscribed there.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty or has a blank segment.
    pub fn add(&self, path: &str, item: T) -> Result<bool, ChannelError> {
        let path = ChannelPath::parse(path)?;
        let _shared = self.structure.read().unwrap_or_else(PoisonError::into_inner);

        let node = self.get_or_create(&path);
        let added = node.subscribers.insert(item);
        if added {
            debug!(channel = %path, subscribers = node.subscribers.len(), "Subscriber added");
        }
        Ok(added)
    }

    /// Walk from the root, reusing existing prefix nodes and creating the
    /// rest of the chain on the first miss.
    fn get_or_create(&self, path: &ChannelPath) -> Arc<ChannelNode<T>> {
        let mut prefixes = path.prefixes();
        // A parsed path always has a root prefix.
        let root_name = prefixes.next().unwrap_or(path.as_str());
        let root_segment = &root_name[1..];

        let existing = self.roots.get(root_segment).map(|r| Arc::clone(r.value()));
        let mut current = match existing {
            Some(root) => root,
            None => Arc::clone(
                self.roots
                    .entry(root_segment.to_string())
                    .or_insert_with(|| {
                        trace!(channel = %root_name, "Creating root channel");
                        Arc::new(ChannelNode::new(root_name, None))
                    })
                    .value(),
            ),
        };

        for name in prefixes {
            let existing = current.child(name);
            let next = match existing {
                Some(child) => child,
                None => {
                    let parent = Arc::downgrade(&current);
                    Arc::clone(
                        current
                            .children
                            .entry(name.to_string())
                            .or_insert_with(|| {
                                trace!(channel = %name, "Creating channel");
                                Arc::new(ChannelNode::new(name, Some(parent)))
                            })
                            .value(),
                    )
                }
            };
            current = next;
        }

        current
    }

    fn find(&self, path: &ChannelPath) -> Option<Arc<ChannelNode<T>>> {
        let root_segment = path.segments().next()?;
        let mut current = self.roots.get(root_segment).map(|r| Arc::clone(r.value()))?;
        for name in path.prefixes().skip(1) {
            current = current.child(name)?;
        }
        Some(current)
    }

    /// The node at exactly `path`, if it exists. Never creates nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid.
    pub fn node(&self, path: &str) -> Result<Option<Arc<ChannelNode<T>>>, ChannelError> {
        let path = ChannelPath::parse(path)?;
        Ok(self.find(&path))
    }

    /// Whether a node exists at `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        matches!(self.node(path), Ok(Some(_)))
    }

    /// Remove `item` from the channel at exactly `path`.
    ///
    /// Returns `false` if the channel does not exist or the item was not
    /// subscribed there.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid.
    pub fn remove(&self, path: &str, item: &T) -> Result<bool, ChannelError> {
        let removed = self
            .node(path)?
            .is_some_and(|node| node.subscribers.remove(item));
        if removed {
            debug!(channel = %path, "Subscriber removed");
        }
        Ok(removed)
    }

    /// Remove `item` from every channel. Returns how many channels it left.
    pub fn remove_all(&self, item: &T) -> usize {
        let mut removed = 0;
        self.for_each_node(|node| {
            if node.subscribers.remove(item) {
                removed += 1;
            }
        });
        if removed > 0 {
            debug!(channels = removed, "Subscriber removed from all channels");
        }
        removed
    }

    /// Remove the channel at `path` together with all of its descendants.
    ///
    /// Returns `false` if no such channel exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid.
    pub fn remove_channel(&self, path: &str) -> Result<bool, ChannelError> {
        let path = ChannelPath::parse(path)?;
        let _exclusive = self.structure.write().unwrap_or_else(PoisonError::into_inner);

        let removed = match path.parent() {
            None => path
                .segments()
                .next()
                .is_some_and(|root| self.roots.remove(root).is_some()),
            Some(_) => self
                .find(&path)
                .and_then(|node| node.parent())
                .is_some_and(|parent| parent.children.remove(path.as_str()).is_some()),
        };
        if removed {
            debug!(channel = %path, "Channel removed");
        }
        Ok(removed)
    }

    /// Remove every node that has neither subscribers nor children.
    ///
    /// Returns the number of nodes removed.
    pub fn prune_empty(&self) -> usize {
        let _exclusive = self.structure.write().unwrap_or_else(PoisonError::into_inner);

        let mut removed = 0;
        let roots: Vec<_> = self.roots.iter().map(|r| Arc::clone(r.value())).collect();
        for root in roots {
            removed += root.prune_children();
            let segment = root.name()[1..].to_string();
            if self.roots.remove_if(&segment, |_, r| r.is_vacant()).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Pruned empty channels");
        }
        removed
    }

    /// Remove vacant nodes along `path`, from the leaf up, stopping at the
    /// first node still in use.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid.
    pub fn prune_path(&self, path: &str) -> Result<usize, ChannelError> {
        let path = ChannelPath::parse(path)?;
        let _exclusive = self.structure.write().unwrap_or_else(PoisonError::into_inner);

        let mut removed = 0;
        let mut current = path;
        loop {
            let Some(node) = self.find(&current) else {
                break;
            };
            let detached = match node.parent() {
                Some(parent) => parent
                    .children
                    .remove_if(node.name(), |_, n| n.is_vacant())
                    .is_some(),
                None => self
                    .roots
                    .remove_if(&node.name()[1..], |_, n| n.is_vacant())
                    .is_some(),
            };
            if !detached {
                break;
            }
            trace!(channel = %current, "Pruned empty channel");
            removed += 1;
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(removed)
    }

    /// Total number of channel nodes.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        let mut count = 0;
        self.for_each_node(|_| count += 1);
        count
    }

    /// Total number of (channel, subscriber) pairs.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        let mut count = 0;
        self.for_each_node(|node| count += node.subscribers.len());
        count
    }

    /// Full names of every channel node.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.for_each_node(|node| names.push(node.name.clone()));
        names.sort_unstable();
        names
    }

    fn for_each_node(&self, mut f: impl FnMut(&ChannelNode<T>)) {
        let roots: Vec<_> = self.roots.iter().map(|r| Arc::clone(r.value())).collect();
        for root in roots {
            root.visit(&mut f);
        }
    }
}

impl<T: Eq + Hash + Clone> ChannelTree<T> {
    /// Subscribers registered at exactly `path`; empty if the channel does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid.
    pub fn lookup(&self, path: &str) -> Result<Vec<T>, ChannelError> {
        Ok(self
            .node(path)?
            .map(|node| node.subscribers.snapshot())
            .unwrap_or_default())
    }

    /// Subscribers of `path` and of every channel below it.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid.
    pub fn lookup_with_descendants(&self, path: &str) -> Result<HashSet<T>, ChannelError> {
        Ok(self
            .node(path)?
            .map(|node| node.subscribers_with_descendants())
            .unwrap_or_default())
    }
}

impl<T: Eq + Hash> Default for ChannelTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash> fmt::Debug for ChannelTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTree")
            .field("roots", &self.roots.len())
            .finish()
    }
}
