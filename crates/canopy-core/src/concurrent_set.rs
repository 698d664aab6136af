//! Lock-free-from-the-caller's-view set used for node registries and
//! per-channel subscriber lists.

use dashmap::DashSet;
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

/// A thread-safe set of opaque members.
///
/// Operations take `&self` and may be called from any number of tasks at
/// once; internally the set is sharded so unrelated members do not contend.
pub struct ConcurrentSet<T: Eq + Hash> {
    inner: DashSet<T>,
}

impl<T: Eq + Hash> ConcurrentSet<T> {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: DashSet::new(),
        }
    }

    /// Add a member. Returns `false` if it was already present.
    pub fn insert(&self, member: T) -> bool {
        self.inner.insert(member)
    }

    /// Remove a member. Returns `false` if it was absent.
    pub fn remove(&self, member: &T) -> bool {
        self.inner.remove(member).is_some()
    }

    /// Check membership.
    #[must_use]
    pub fn contains(&self, member: &T) -> bool {
        self.inner.contains(member)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Remove every member.
    pub fn clear(&self) {
        self.inner.clear();
    }
}

impl<T: Eq + Hash + Clone> ConcurrentSet<T> {
    /// Copy the current members out.
    ///
    /// The snapshot is taken shard by shard, so members added or removed
    /// concurrently may or may not appear in it.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.iter().map(|m| m.key().clone()).collect()
    }

    /// Add the current members to `out`.
    pub fn collect_into(&self, out: &mut HashSet<T>) {
        out.extend(self.inner.iter().map(|m| m.key().clone()));
    }
}

impl<T: Eq + Hash> Default for ConcurrentSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + fmt::Debug> fmt::Debug for ConcurrentSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.inner.iter().map(|m| format!("{:?}", m.key())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_insert_remove() {
        let set = ConcurrentSet::new();
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert!(set.contains(&"a"));
        assert_eq!(set.len(), 1);

        assert!(set.remove(&"a"));
        assert!(!set.remove(&"a"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_snapshot() {
        let set = ConcurrentSet::new();
        set.insert(1);
        set.insert(2);
        set.insert(3);

        let mut members = set.snapshot();
        members.sort_unstable();
        assert_eq!(members, vec![1, 2, 3]);

        let mut out = HashSet::from([9]);
        set.collect_into(&mut out);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_concurrent_inserts() {
        let set = Arc::new(ConcurrentSet::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let set = Arc::clone(&set);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        set.insert(i % 50);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(set.len(), 50);
    }
}
