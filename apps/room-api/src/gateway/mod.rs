//! Real-time collaboration gateway: per-session hubs, client transport
//! pumps, and the websocket wire protocol.

pub mod client;
pub mod hub;
pub mod messages;
pub mod socket;
