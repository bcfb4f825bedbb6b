//! # tether-relay
//!
//! The relay server: a topic-addressed publish/subscribe broker over
//! WebSocket. Topics are opaque strings; each holds a subscriber set
//! and at most one cached message for late subscribers. Subscriber-less
//! topics idle out and are swept periodically.

#![deny(unsafe_code)]

pub mod config;
pub mod server;
pub mod shutdown;
pub mod topics;

pub use config::RelayConfig;
pub use server::RelayServer;
pub use shutdown::ShutdownCoordinator;
pub use topics::TopicTable;
