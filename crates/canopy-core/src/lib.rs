//! # canopy-core
//!
//! Subscription bookkeeping and message routing for the Canopy broker.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **ConcurrentSet** - Thread-safe membership set for registries
//! - **ChannelTree** - Hierarchical channel names mapped to subscriber sets
//! - **Router** - Pub/sub routing: exact, propagating and broadcast delivery
//! - **NodeHandle** - Identity plus delivery capability of a connected node
//! - **LocalNode** - A node living in the broker's own process
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │    Node     │────▶│   Router    │────▶│ ChannelTree │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//!        │            ┌─────────────┐
//!        └────────────│ NodeHandle  │
//!                     └─────────────┘
//! ```

pub mod channel;
pub mod concurrent_set;
pub mod local;
pub mod node;
pub mod router;
pub mod subscription;

pub use channel::{ChannelNode, ChannelTree};
pub use concurrent_set::ConcurrentSet;
pub use local::LocalNode;
pub use node::{DeliveryError, NodeHandle, Subscriber};
pub use router::{Router, RouterConfig, RouterError, RouterStats};
pub use subscription::{HandlerRegistry, PacketHandler, SubscriptionHandle};
