//! # canopy-transport
//!
//! Moving Canopy packets between processes.
//!
//! This crate provides:
//!
//! - **Listener** - Read-loop state machine raising classified events to observers
//! - **ObjectSource** - The "read one object" capability a listener drives
//! - **FramedTransport** - Chunk-padded frames over any byte stream
//! - **ChannelSource** - In-process object source
//! - **Client** - A node connected to a broker over TCP
//!
//! ## Reading and writing
//!
//! ```rust,ignore
//! use canopy_transport::{FramedTransport, ListenerEvent, TransportConfig};
//!
//! let transport = FramedTransport::new(stream, &TransportConfig::default())?;
//! transport.add_observer(|event: &ListenerEvent| {
//!     if let ListenerEvent::Message(packet) = event {
//!         // Route the packet
//!     }
//! });
//! transport.start().await?;
//! transport.send(packet)?.await?;
//! ```

pub mod client;
pub mod framed;
pub mod listener;
pub mod local;
pub mod traits;

pub use client::{Client, ClientConfig};
pub use framed::{FramedSource, FramedTransport, TransportConfig, WriteCompletion};
pub use listener::{Listener, ListenerEvent, ObserverId};
pub use local::{ChannelSink, ChannelSource};
pub use traits::{ListenerObserver, ObjectSource, TransportError};
