//! Hierarchical channel names.
//!
//! Channels are `/`-delimited paths such as `chat/lobby/en`. Segments are
//! case-insensitive and normalized to lower case; the canonical form carries a
//! leading separator for the root (`/chat/lobby/en`).

use std::fmt;
use thiserror::Error;

/// Path separator between channel segments.
pub const SEPARATOR: char = '/';

/// Maximum channel name length in bytes.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Channel name validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The name has no segments.
    #[error("Channel name cannot be empty")]
    Empty,

    /// The name exceeds [`MAX_CHANNEL_NAME_LENGTH`].
    #[error("Channel name too long: {0} bytes")]
    TooLong(usize),

    /// A segment is empty or whitespace only.
    #[error("Channel name has a blank segment at position {0}")]
    BlankSegment(usize),

    /// A segment contains the separator.
    #[error("Channel segment contains a separator: {0:?}")]
    SeparatorInSegment(String),
}

/// A validated, normalized channel path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelPath {
    full: String,
}

impl ChannelPath {
    /// Parse and normalize a channel name.
    ///
    /// A single leading separator is accepted and denotes the root.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, too long, or has a blank segment.
    pub fn parse(name: &str) -> Result<Self, ChannelError> {
        if name.len() > MAX_CHANNEL_NAME_LENGTH {
            return Err(ChannelError::TooLong(name.len()));
        }
        let relative = name.strip_prefix(SEPARATOR).unwrap_or(name);
        if relative.is_empty() {
            return Err(ChannelError::Empty);
        }

        let mut full = String::with_capacity(relative.len() + 1);
        for (position, segment) in relative.split(SEPARATOR).enumerate() {
            if segment.trim().is_empty() {
                return Err(ChannelError::BlankSegment(position));
            }
            full.push(SEPARATOR);
            full.push_str(&segment.to_lowercase());
        }
        Ok(Self { full })
    }

    /// Build a path from individual segments.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no segments, a segment is blank, or a
    /// segment contains the separator.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, ChannelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut full = String::new();
        for (position, segment) in segments.into_iter().enumerate() {
            let segment = segment.as_ref();
            if segment.contains(SEPARATOR) {
                return Err(ChannelError::SeparatorInSegment(segment.to_string()));
            }
            if segment.trim().is_empty() {
                return Err(ChannelError::BlankSegment(position));
            }
            full.push(SEPARATOR);
            full.push_str(&segment.to_lowercase());
        }
        if full.is_empty() {
            return Err(ChannelError::Empty);
        }
        if full.len() > MAX_CHANNEL_NAME_LENGTH {
            return Err(ChannelError::TooLong(full.len()));
        }
        Ok(Self { full })
    }

    /// The canonical full name, e.g. `/chat/lobby`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Iterate over the normalized segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.full[1..].split(SEPARATOR)
    }

    /// Number of segments.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Full names of every prefix, root first, ending with this path.
    ///
    /// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`.
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        let full = self.full.as_str();
        full.match_indices(SEPARATOR)
            .skip(1)
            .map(move |(idx, _)| &full[..idx])
            .chain(std::iter::once(full))
    }

    /// The parent path, or `None` for a root channel.
    #[must_use]
    pub fn parent(&self) -> Option<ChannelPath> {
        match self.full.rfind(SEPARATOR) {
            Some(0) | None => None,
            Some(idx) => Some(Self {
                full: self.full[..idx].to_string(),
            }),
        }
    }

    /// Whether this path lies strictly below `ancestor`.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &ChannelPath) -> bool {
        self.full.len() > ancestor.full.len()
            && self.full.starts_with(&ancestor.full)
            && self.full[ancestor.full.len()..].starts_with(SEPARATOR)
    }

    /// Whether a subscription on this path receives a message sent to
    /// `target`, given the message's propagate flag.
    #[must_use]
    pub fn receives(&self, target: &ChannelPath, propagate: bool) -> bool {
        self == target || (propagate && self.is_descendant_of(target))
    }
}

impl fmt::Display for ChannelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl std::str::FromStr for ChannelPath {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Validate a channel name without keeping the parsed form.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate_channel_name(name: &str) -> Result<(), ChannelError> {
    ChannelPath::parse(name).map(|_| ())
}
