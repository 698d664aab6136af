//! Packet types for the Canopy protocol.
//!
//! Packets are the unit exchanged between nodes and the broker. Each packet is
//! serialized using MessagePack and carried in a chunk-padded frame.

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelError, ChannelPath};
use crate::ids::{generate_packet_id, now_millis, NodeId, PacketId};

/// Packet kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Message = 0x01,
    Subscribe = 0x02,
    Unsubscribe = 0x03,
    Meta = 0x04,
    Error = 0x05,
}

/// Request carried by a [`Packet::Meta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MetaRequest {
    /// Plain acknowledgement, nothing requested.
    #[default]
    None = 0,
    /// The peer could not decode what it received and asks for a resend.
    Resend = 1,
}

impl From<MetaRequest> for u8 {
    fn from(request: MetaRequest) -> u8 {
        request as u8
    }
}

impl TryFrom<u8> for MetaRequest {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MetaRequest::None),
            1 => Ok(MetaRequest::Resend),
            _ => Err("Invalid meta request"),
        }
    }
}

/// A protocol packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Packet {
    /// A publication to a channel, or a broadcast when `channel` is `None`.
    #[serde(rename = "message")]
    Message {
        /// Unique packet ID.
        id: PacketId,
        /// Publishing node.
        publisher: NodeId,
        /// Target channel; `None` broadcasts to every registered node.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        /// Also deliver to subscribers of descendant channels.
        #[serde(default)]
        propagate: bool,
        /// Publication time in milliseconds since the Unix epoch.
        timestamp: u64,
        /// Opaque payload.
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Subscribe the publisher to a channel.
    #[serde(rename = "subscribe")]
    Subscribe {
        id: PacketId,
        publisher: NodeId,
        channel: String,
    },

    /// Unsubscribe the publisher from a channel.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        id: PacketId,
        publisher: NodeId,
        channel: String,
    },

    /// Lightweight ACK/NACK and control requests.
    #[serde(rename = "meta")]
    Meta {
        id: PacketId,
        publisher: NodeId,
        /// What the sender asks of the receiver.
        #[serde(default)]
        request: MetaRequest,
        /// Positive (`true`) or negative acknowledgement.
        ack: bool,
        /// The packet this one answers, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<PacketId>,
    },

    /// Error report.
    #[serde(rename = "error")]
    Error {
        id: PacketId,
        publisher: NodeId,
        /// Whether the error stems from an unexpected failure rather than a
        /// rejected request.
        exception: bool,
        /// Human-readable diagnostic.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagnostic: Option<String>,
    },
}

impl Packet {
    /// Get the packet kind.
    #[must_use]
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Message { .. } => PacketKind::Message,
            Packet::Subscribe { .. } => PacketKind::Subscribe,
            Packet::Unsubscribe { .. } => PacketKind::Unsubscribe,
            Packet::Meta { .. } => PacketKind::Meta,
            Packet::Error { .. } => PacketKind::Error,
        }
    }

    /// Get the packet ID.
    #[must_use]
    pub fn id(&self) -> PacketId {
        match self {
            Packet::Message { id, .. }
            | Packet::Subscribe { id, .. }
            | Packet::Unsubscribe { id, .. }
            | Packet::Meta { id, .. }
            | Packet::Error { id, .. } => *id,
        }
    }

    /// Get the publishing node.
    #[must_use]
    pub fn publisher(&self) -> &NodeId {
        match self {
            Packet::Message { publisher, .. }
            | Packet::Subscribe { publisher, .. }
            | Packet::Unsubscribe { publisher, .. }
            | Packet::Meta { publisher, .. }
            | Packet::Error { publisher, .. } => publisher,
        }
    }

    /// The channel named by this packet, if any.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            Packet::Message { channel, .. } => channel.as_deref(),
            Packet::Subscribe { channel, .. } | Packet::Unsubscribe { channel, .. } => {
                Some(channel)
            }
            Packet::Meta { .. } | Packet::Error { .. } => None,
        }
    }

    /// Parse the channel named by this packet.
    ///
    /// Returns `Ok(None)` for broadcasts and packets without a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid.
    pub fn channel_path(&self) -> Result<Option<ChannelPath>, ChannelError> {
        self.channel().map(ChannelPath::parse).transpose()
    }

    /// Whether this is a message sent to every registered node.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Packet::Message { channel: None, .. })
    }

    /// Create a new Message packet.
    #[must_use]
    pub fn message(
        publisher: impl Into<NodeId>,
        channel: Option<&str>,
        payload: impl Into<Vec<u8>>,
        propagate: bool,
    ) -> Self {
        Packet::Message {
            id: generate_packet_id(),
            publisher: publisher.into(),
            channel: channel.map(str::to_string),
            propagate,
            timestamp: now_millis(),
            payload: payload.into(),
        }
    }

    /// Create a new Subscribe packet.
    #[must_use]
    pub fn subscribe(publisher: impl Into<NodeId>, channel: impl Into<String>) -> Self {
        Packet::Subscribe {
            id: generate_packet_id(),
            publisher: publisher.into(),
            channel: channel.into(),
        }
    }

    /// Create a new Unsubscribe packet.
    #[must_use]
    pub fn unsubscribe(publisher: impl Into<NodeId>, channel: impl Into<String>) -> Self {
        Packet::Unsubscribe {
            id: generate_packet_id(),
            publisher: publisher.into(),
            channel: channel.into(),
        }
    }

    /// Create an ACK (`ack == true`) or NACK answering `reply_to`.
    #[must_use]
    pub fn ack(publisher: impl Into<NodeId>, reply_to: Option<PacketId>, ack: bool) -> Self {
        Packet::Meta {
            id: generate_packet_id(),
            publisher: publisher.into(),
            request: MetaRequest::None,
            ack,
            reply_to,
        }
    }

    /// Create a NACK asking the peer to resend.
    #[must_use]
    pub fn resend(publisher: impl Into<NodeId>) -> Self {
        Packet::Meta {
            id: generate_packet_id(),
            publisher: publisher.into(),
            request: MetaRequest::Resend,
            ack: false,
            reply_to: None,
        }
    }

    /// Create a new Error packet.
    #[must_use]
    pub fn error(
        publisher: impl Into<NodeId>,
        exception: bool,
        diagnostic: Option<String>,
    ) -> Self {
        Packet::Error {
            id: generate_packet_id(),
            publisher: publisher.into(),
            exception,
            diagnostic,
        }
    }
}
