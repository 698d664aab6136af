//! # canopy-protocol
//!
//! Wire protocol definitions for the Canopy publish/subscribe broker.
//!
//! This crate defines the packets exchanged between nodes and the broker, the
//! hierarchical channel naming rules, and the chunk-padded frame codec used
//! on stream sockets.
//!
//! ## Packet Types
//!
//! - `Message` - Publish a payload to a channel, its descendants, or everyone
//! - `Subscribe` / `Unsubscribe` - Channel membership
//! - `Meta` - ACK/NACK and resend requests
//! - `Error` - Error reports
//!
//! ## Example
//!
//! ```rust
//! use canopy_protocol::{codec, Packet};
//!
//! let packet = Packet::message("node-1", Some("chat/lobby"), b"Hello".to_vec(), false);
//!
//! let frame = codec::encode(&packet, 64).unwrap();
//! assert_eq!(frame.len() % 64, 0);
//! assert_eq!(codec::decode(&frame, 64).unwrap(), packet);
//! ```

pub mod channel;
pub mod codec;
pub mod ids;
pub mod packets;

pub use channel::{validate_channel_name, ChannelError, ChannelPath, SEPARATOR};
pub use codec::{FrameCodec, FrameDecoder, ProtocolError, DEFAULT_CHUNK_SIZE};
pub use ids::{generate_packet_id, now_millis, NodeId, PacketId};
pub use packets::{MetaRequest, Packet, PacketKind};
