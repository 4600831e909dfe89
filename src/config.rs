//! Runtime configuration for the discovery and dbserver subsystems
//!
//! Defaults are the Pro DJ Link protocol constants; ports and ages are
//! adjustable so tests can run against ephemeral sockets and short
//! expiry windows.

use std::time::Duration;

use crate::constants::{
    ANNOUNCEMENT_PORT, DB_SERVER_QUERY_PORT, DEFAULT_SOCKET_TIMEOUT_MS, MAXIMUM_AGE_MS,
};

/// Configuration for the device finder
#[derive(Debug, Clone)]
pub struct FinderConfig {
    /// UDP port on which devices broadcast announcements.
    /// Zero binds an ephemeral port.
    pub announcement_port: u16,

    /// How long a device may stay silent before it is considered gone
    pub maximum_age: Duration,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            announcement_port: ANNOUNCEMENT_PORT,
            maximum_age: Duration::from_millis(MAXIMUM_AGE_MS),
        }
    }
}

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// TCP port answering dbserver port queries on each player
    pub query_port: u16,

    /// Initial timeout applied to dbserver socket connects and reads
    pub socket_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            query_port: DB_SERVER_QUERY_PORT,
            socket_timeout: Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS),
        }
    }
}
