//! Real-time side of the chat: the hub that owns every live connection,
//! the per-socket read/write pumps, and inbound frame dispatch.

pub mod connection;
pub mod hub;
pub mod inbound;

pub use hub::{Audience, DEFAULT_OUTBOUND_CAPACITY, Hub, Registration};
