//! Byte-level helpers for the Pro DJ Link wire formats
//!
//! Covers validation and field extraction for the 54-byte device
//! announcement broadcast, and the tiny request/response exchange used
//! to locate a player's dbserver port.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

/// Exact length of a device announcement datagram
pub const ANNOUNCEMENT_LENGTH: usize = 54;

/// Packet type byte identifying a device announcement
pub const ANNOUNCEMENT_PACKET_TYPE: u8 = 0x06;

/// Number of leading zero bytes forming the announcement magic header
const HEADER_LENGTH: usize = 10;

/// Offset of the packet type byte, directly after the magic header
const PACKET_TYPE_OFFSET: usize = 10;

/// Offset and width of the ASCII device name field
const NAME_OFFSET: usize = 0x0c;
const NAME_LENGTH: usize = 20;

/// Offset of the claimed device number
const DEVICE_NUMBER_OFFSET: usize = 0x24;

/// Offset of the 6-byte hardware address
const MAC_OFFSET: usize = 0x26;

/// Offset of the IPv4 address the device advertises for itself.
/// The datagram source address is authoritative; this field is only
/// informational.
const IP_OFFSET: usize = 0x2c;

/// Check whether a datagram is a well-formed device announcement:
/// exactly 54 bytes, ten zero header bytes, and the announcement
/// packet type at offset 10.
pub fn is_announcement(data: &[u8]) -> bool {
    data.len() == ANNOUNCEMENT_LENGTH
        && data[..HEADER_LENGTH].iter().all(|&b| b == 0)
        && data[PACKET_TYPE_OFFSET] == ANNOUNCEMENT_PACKET_TYPE
}

/// Extract the device name, trimming trailing NUL padding
pub fn device_name(data: &[u8]) -> String {
    String::from_utf8_lossy(&data[NAME_OFFSET..NAME_OFFSET + NAME_LENGTH])
        .trim_end_matches(char::from(0))
        .to_string()
}

/// Extract the claimed device number
pub fn device_number(data: &[u8]) -> u8 {
    data[DEVICE_NUMBER_OFFSET]
}

/// Extract the hardware address
pub fn mac_address(data: &[u8]) -> [u8; 6] {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&data[MAC_OFFSET..MAC_OFFSET + 6]);
    mac
}

/// Extract the IPv4 address the device advertises for itself
pub fn advertised_ip(data: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(
        data[IP_OFFSET],
        data[IP_OFFSET + 1],
        data[IP_OFFSET + 2],
        data[IP_OFFSET + 3],
    )
}

/// Build the 19-byte frame that asks a player for its dbserver port:
/// a big-endian length prefix, the literal `RemoteDBServer`, and a
/// single NUL terminator.
pub fn port_query_frame() -> Bytes {
    let mut frame = BytesMut::with_capacity(19);
    frame.put_u32(0x0000_000f);
    frame.put_slice(b"RemoteDBServer");
    frame.put_u8(0x00);
    frame.freeze()
}

/// Decode the response to a port query: a big-endian u16 naming the TCP
/// port of the player's dbserver. Responses of any other size carry no
/// usable port.
pub fn decode_db_server_port(data: &[u8]) -> Option<u16> {
    if data.len() == 2 {
        let mut buf = data;
        Some(buf.get_u16())
    } else {
        None
    }
}

/// Build a valid announcement datagram, used by tests across the crate
#[cfg(test)]
pub(crate) fn make_announcement(number: u8, name: &str) -> Vec<u8> {
    let mut data = vec![0u8; ANNOUNCEMENT_LENGTH];
    data[PACKET_TYPE_OFFSET] = ANNOUNCEMENT_PACKET_TYPE;
    let name_bytes = name.as_bytes();
    data[NAME_OFFSET..NAME_OFFSET + name_bytes.len()].copy_from_slice(name_bytes);
    data[DEVICE_NUMBER_OFFSET] = number;
    data[MAC_OFFSET..MAC_OFFSET + 6].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, number]);
    data[IP_OFFSET..IP_OFFSET + 4].copy_from_slice(&[192, 168, 1, number]);
    data
}
