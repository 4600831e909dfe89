//! Device announcement value type

use std::fmt;
use std::net::IpAddr;

use crate::packet;

/// One sighting of a DJ Link device, parsed from a single announcement
/// datagram. The directory keeps the most recent sighting per source
/// address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAnnouncement {
    /// Device name as reported in the packet
    pub name: String,

    /// Claimed device number (real CDJs use 1..4, rekordbox above 15)
    pub number: u8,

    /// Source address the datagram arrived from
    pub address: IpAddr,

    /// Hardware address reported in the packet
    pub mac: [u8; 6],

    /// Wall-clock milliseconds at which the sighting was observed
    pub timestamp: u64,
}

impl DeviceAnnouncement {
    /// Parse an announcement datagram received from `source`.
    ///
    /// Returns `None` unless the datagram passes the length, header, and
    /// packet type checks.
    pub fn parse(data: &[u8], source: IpAddr, timestamp: u64) -> Option<Self> {
        if !packet::is_announcement(data) {
            return None;
        }
        Some(Self {
            name: packet::device_name(data),
            number: packet::device_number(data),
            address: source,
            mac: packet::mac_address(data),
            timestamp,
        })
    }
}

impl fmt::Display for DeviceAnnouncement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (device {}) at {}", self.name, self.number, self.address)
    }
}
