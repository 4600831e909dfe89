//! # prolink-client
//!
//! Client library for the Pioneer Pro DJ Link network used by CDJ-class
//! DJ players.
//!
//! ## Architecture Overview
//!
//! ```text
//!                     UDP broadcast :50000
//!                            │
//!                            ▼
//!  ┌──────────────────────────────────────────────┐
//!  │          DeviceFinder (discovery)            │
//!  │  receiver thread ─ expiring device directory │
//!  └───────────────┬──────────────────────────────┘
//!                  │ found / lost events
//!                  ▼
//!  ┌──────────────────────────────────────────────┐
//!  │      EventDispatcher (serial worker)         │
//!  └───────────────┬──────────────────────────────┘
//!                  │
//!                  ▼
//!  ┌──────────────────────────────────────────────┐
//!  │        ConnectionManager (dbserver)          │
//!  │  port probes :12523 ─ session brokering      │
//!  └───────────────┬──────────────────────────────┘
//!                  │ TCP sessions
//!                  ▼
//!          player database servers
//! ```
//!
//! The finder passively watches announcement broadcasts and keeps an
//! expiring directory of the devices on the network. The connection
//! manager follows the finder's events, asks each new player which TCP
//! port its metadata database server listens on, and opens short-lived
//! client sessions against it on request, posing as a device number the
//! target player will answer. Impersonating a CDJ on the network is the
//! job of an external virtual CDJ subsystem, consumed here through the
//! narrow [`VirtualCdj`] trait.

pub mod config;
pub mod dbserver;
pub mod discovery;
pub mod error;
pub mod packet;
pub mod status;
mod util;

pub use dbserver::{Client, ConnectionManager};
pub use discovery::{DeviceAnnouncement, DeviceAnnouncementListener, DeviceFinder, EventDispatcher};
pub use error::{DbServerError, DiscoveryError, Error, Result};
pub use status::{CdjStatus, DeviceUpdate, MixerStatus, VirtualCdj};

/// Protocol constants
pub mod constants {
    /// UDP port to which devices broadcast their presence
    pub const ANNOUNCEMENT_PORT: u16 = 50000;

    /// Milliseconds of silence after which a device is considered gone
    pub const MAXIMUM_AGE_MS: u64 = 10_000;

    /// TCP port that answers dbserver port queries on every player
    pub const DB_SERVER_QUERY_PORT: u16 = 12523;

    /// Default timeout for dbserver socket connects and reads
    pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 10_000;

    /// Interval between liveness checks while any device is known
    pub const EXPIRATION_CHECK_MS: u64 = 1_000;
}
