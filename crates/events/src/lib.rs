//! In-process fan-out for the dispatch core.
//!
//! - [`ConnectionRegistry`]: live connections, their role, metadata and
//!   outbound queue.
//! - [`ChannelHub`]: channel membership and broadcast.
//! - [`RelayBridge`]: forwards broadcasts between processes through the
//!   shared store's pub/sub.

pub mod hub;
pub mod registry;
pub mod relay;

pub use hub::ChannelHub;
pub use registry::{
    outbound_channel, ConnectionRegistry, ConnectionSnapshot, Outbound, OutboundReceiver,
    OutboundSender, RoleCounts,
};
pub use relay::{RelayBridge, RelayConfig, RelayFrame};
