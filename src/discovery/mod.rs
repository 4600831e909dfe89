//! Device presence tracking
//!
//! Watches for DJ Link devices announcing themselves on the network and
//! maintains an expiring directory of who is present.

pub mod announcement;
pub mod dispatch;
pub mod finder;

pub use announcement::DeviceAnnouncement;
pub use dispatch::EventDispatcher;
pub use finder::{DeviceAnnouncementListener, DeviceFinder};
