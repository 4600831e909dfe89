//! DBServer session management
//!
//! Discovers the TCP port of each player's metadata database server and
//! brokers short-lived client sessions against it.

pub mod client;
pub mod manager;

pub use client::Client;
pub use manager::ConnectionManager;
