//! DJ Link Network Monitor
//!
//! Watches the network for DJ Link devices and reports presence changes
//! and dbserver port discoveries.

use anyhow::Result;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prolink_client::{
    config::{FinderConfig, ManagerConfig},
    constants::ANNOUNCEMENT_PORT,
    ConnectionManager, DeviceAnnouncement, DeviceAnnouncementListener, DeviceFinder, DeviceUpdate,
    VirtualCdj,
};

struct LogListener;

impl DeviceAnnouncementListener for LogListener {
    fn device_found(&self, announcement: &DeviceAnnouncement) {
        tracing::info!("Device found: {}", announcement);
    }

    fn device_lost(&self, announcement: &DeviceAnnouncement) {
        tracing::info!("Device lost: {}", announcement);
    }
}

/// Stand-in virtual CDJ for pure monitoring: never announces, claims
/// device number 5, and knows no player statuses, so sessions against
/// real CDJs will be refused while rekordbox remains reachable.
struct PassiveVirtualCdj;

impl VirtualCdj for PassiveVirtualCdj {
    fn is_active(&self) -> bool {
        false
    }

    fn local_address(&self) -> Option<IpAddr> {
        None
    }

    fn device_number(&self) -> u8 {
        5
    }

    fn latest_status_for(&self, _device_number: u8) -> Option<DeviceUpdate> {
        None
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting DJ Link network monitor");

    let finder = DeviceFinder::new(FinderConfig::default())?;
    finder.add_listener(Arc::new(LogListener));

    let manager = ConnectionManager::new(
        finder.clone(),
        Arc::new(PassiveVirtualCdj),
        ManagerConfig::default(),
    );
    manager.start()?;

    tracing::info!(
        "Listening for device announcements on UDP port {}",
        ANNOUNCEMENT_PORT
    );

    loop {
        std::thread::sleep(Duration::from_secs(10));
        for device in finder.current_devices()? {
            match manager.db_server_port(device.number) {
                Some(port) => tracing::info!("{} dbserver port: {}", device, port),
                None => tracing::info!("{} dbserver port: unknown", device),
            }
        }
    }
}
