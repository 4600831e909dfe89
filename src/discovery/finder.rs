//! Watches for devices reporting their presence on the network
//!
//! DJ Link devices broadcast an announcement packet on UDP port 50000
//! every second or two. The finder keeps the most recent announcement
//! per source address, ages entries out once a device goes quiet, and
//! notifies listeners when devices join or leave.

use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::FinderConfig;
use crate::constants::EXPIRATION_CHECK_MS;
use crate::discovery::announcement::DeviceAnnouncement;
use crate::discovery::dispatch::EventDispatcher;
use crate::error::{DiscoveryError, Result};
use crate::status::VirtualCdj;
use crate::util::{is_timeout, unix_millis};

/// Callbacks observing devices joining and leaving the network.
///
/// Callbacks run on the event dispatch thread, never on the receiver
/// thread, and must return quickly or later events will back up behind
/// them.
pub trait DeviceAnnouncementListener: Send + Sync {
    /// A device has been heard from for the first time
    fn device_found(&self, announcement: &DeviceAnnouncement);

    /// A device has stopped announcing itself
    fn device_lost(&self, announcement: &DeviceAnnouncement);
}

/// Mutable state guarded by the finder's single lock
struct FinderState {
    /// Bound socket while active
    socket: Option<Arc<UdpSocket>>,

    /// Port actually bound, which differs from the configured port when
    /// binding port zero
    local_port: u16,

    /// Wall-clock milliseconds when the current activation began
    start_time: u64,

    /// Most recent announcement per source address
    devices: HashMap<IpAddr, DeviceAnnouncement>,

    /// Registered listeners, deduplicated by identity
    listeners: Vec<Arc<dyn DeviceAnnouncementListener>>,

    /// Optional virtual CDJ consulted for self-echo suppression
    virtual_cdj: Option<Arc<dyn VirtualCdj>>,

    /// Receiver thread handle, joined at stop
    receiver: Option<JoinHandle<()>>,
}

struct FinderInner {
    config: FinderConfig,
    dispatcher: Arc<EventDispatcher>,
    state: Mutex<FinderState>,
}

/// Tracks the DJ Link devices currently visible on the network.
///
/// Cloning yields another handle to the same finder; the host decides
/// whether to share one finder across subsystems.
#[derive(Clone)]
pub struct DeviceFinder {
    inner: Arc<FinderInner>,
}

impl DeviceFinder {
    /// Create an inactive finder with its own event dispatch worker
    pub fn new(config: FinderConfig) -> Result<Self> {
        let dispatcher = Arc::new(EventDispatcher::new()?);
        Ok(Self::with_dispatcher(config, dispatcher))
    }

    /// Create an inactive finder delivering events through a dispatcher
    /// shared with other subsystems
    pub fn with_dispatcher(config: FinderConfig, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            inner: Arc::new(FinderInner {
                config,
                dispatcher,
                state: Mutex::new(FinderState {
                    socket: None,
                    local_port: 0,
                    start_time: 0,
                    devices: HashMap::new(),
                    listeners: Vec::new(),
                    virtual_cdj: None,
                    receiver: None,
                }),
            }),
        }
    }

    /// Start listening for device announcements. Has no effect if
    /// already listening.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state();
        if state.socket.is_some() {
            return Ok(());
        }

        let socket = bind_announcement_socket(self.inner.config.announcement_port)
            .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;
        let local_port = socket
            .local_addr()
            .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?
            .port();

        let socket = Arc::new(socket);
        state.socket = Some(socket.clone());
        state.local_port = local_port;
        state.start_time = unix_millis();

        let inner = self.inner.clone();
        match thread::Builder::new()
            .name("device-finder receiver".to_string())
            .spawn(move || receive_loop(inner, socket))
        {
            Ok(handle) => {
                state.receiver = Some(handle);
                tracing::info!("DeviceFinder listening on UDP port {}", local_port);
                Ok(())
            }
            Err(e) => {
                state.socket = None;
                Err(e.into())
            }
        }
    }

    /// Stop listening. Discards the device directory, delivering a lost
    /// notification for every entry that was present. Has no effect if
    /// not listening.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Whether the announcement socket is currently bound
    pub fn is_active(&self) -> bool {
        self.inner.state().socket.is_some()
    }

    /// Wall-clock milliseconds at which the current activation began.
    /// Used by a virtual CDJ to wait out a settling interval before
    /// claiming a device number.
    pub fn start_time(&self) -> Result<u64> {
        let state = self.inner.state();
        if state.socket.is_none() {
            return Err(DiscoveryError::NotActive.into());
        }
        Ok(state.start_time)
    }

    /// UDP port the announcement socket is bound to
    pub fn local_port(&self) -> Result<u16> {
        let state = self.inner.state();
        if state.socket.is_none() {
            return Err(DiscoveryError::NotActive.into());
        }
        Ok(state.local_port)
    }

    /// Snapshot of the devices currently visible on the network, after
    /// expiring any that have gone quiet
    pub fn current_devices(&self) -> Result<Vec<DeviceAnnouncement>> {
        if !self.is_active() {
            return Err(DiscoveryError::NotActive.into());
        }
        self.inner.expire_devices();
        Ok(self.inner.state().devices.values().cloned().collect())
    }

    /// The most recent announcement from the device claiming the given
    /// number, if it is currently visible. The directory is small, so a
    /// linear scan suffices.
    pub fn latest_announcement_from(&self, device_number: u8) -> Result<Option<DeviceAnnouncement>> {
        Ok(self
            .current_devices()?
            .into_iter()
            .find(|a| a.number == device_number))
    }

    /// Register a listener for device found and lost events. Adding a
    /// listener that is already registered has no effect.
    pub fn add_listener(&self, listener: Arc<dyn DeviceAnnouncementListener>) {
        let mut state = self.inner.state();
        if !state.listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            state.listeners.push(listener);
        }
    }

    /// Unregister a listener. Removing a listener that is not registered
    /// has no effect.
    pub fn remove_listener(&self, listener: &Arc<dyn DeviceAnnouncementListener>) {
        self.inner
            .state()
            .listeners
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Attach the virtual CDJ whose own announcements must not be
    /// mistaken for a device on the network
    pub fn set_virtual_cdj(&self, virtual_cdj: Arc<dyn VirtualCdj>) {
        self.inner.state().virtual_cdj = Some(virtual_cdj);
    }

    /// Place an announcement directly in the directory, standing in for
    /// traffic from addresses tests cannot send from
    #[cfg(test)]
    pub(crate) fn insert_test_announcement(&self, announcement: DeviceAnnouncement) {
        self.inner
            .state()
            .devices
            .insert(announcement.address, announcement);
    }
}

impl FinderInner {
    fn state(&self) -> MutexGuard<'_, FinderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the given socket is still the one the finder is using.
    /// A stop followed by a quick start leaves an older receiver thread
    /// holding a stale socket; it must wind down without touching the
    /// new activation.
    fn is_current_socket(&self, socket: &Arc<UdpSocket>) -> bool {
        match &self.state().socket {
            Some(current) => Arc::ptr_eq(current, socket),
            None => false,
        }
    }

    fn stop(&self) {
        let (receiver, local_port, lost) = {
            let mut state = self.state();
            if state.socket.is_none() {
                return;
            }
            state.socket = None;
            let receiver = state.receiver.take();
            let lost: Vec<DeviceAnnouncement> = state.devices.drain().map(|(_, a)| a).collect();
            (receiver, state.local_port, lost)
        };

        // The receiver may be blocked in recv with no timeout; a
        // zero-length loopback datagram wakes it so it can observe the
        // cleared state. It can never pass the 54-byte length check.
        wake_receiver(local_port);

        if let Some(handle) = receiver {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        let listeners = self.state().listeners.clone();
        for announcement in lost {
            notify_lost(&self.dispatcher, &listeners, announcement);
        }
        tracing::info!("DeviceFinder stopped");
    }

    /// Apply the packet acceptance policy and record an accepted
    /// announcement, notifying listeners when a new device appears
    fn process_packet(&self, data: &[u8], source: IpAddr) {
        let virtual_cdj = self.state().virtual_cdj.clone();
        if let Some(virtual_cdj) = virtual_cdj {
            if virtual_cdj.is_active() && virtual_cdj.local_address() == Some(source) {
                tracing::debug!("Ignoring our own announcement from {}", source);
                return;
            }
        }

        let Some(announcement) = DeviceAnnouncement::parse(data, source, unix_millis()) else {
            tracing::debug!(
                "Ignoring {}-byte packet from {} that is not a device announcement",
                data.len(),
                source
            );
            return;
        };

        let mut state = self.state();
        let is_new = !state.devices.contains_key(&announcement.address);
        state.devices.insert(announcement.address, announcement.clone());
        if is_new {
            tracing::info!("Found {}", announcement);
            let listeners = state.listeners.clone();
            notify_found(&self.dispatcher, &listeners, announcement);
        }
    }

    /// Remove directory entries older than the maximum age, notifying
    /// listeners for each removal. Removal and notification submission
    /// happen under the directory lock so a lost event can never be
    /// queued after a found event for the same reappearing device.
    fn expire_devices(&self) {
        let maximum_age = self.config.maximum_age.as_millis() as u64;
        let now = unix_millis();

        let mut state = self.state();
        let stale: Vec<IpAddr> = state
            .devices
            .iter()
            .filter(|(_, a)| now.saturating_sub(a.timestamp) > maximum_age)
            .map(|(address, _)| *address)
            .collect();
        for address in stale {
            if let Some(announcement) = state.devices.remove(&address) {
                tracing::info!("Lost {}", announcement);
                let listeners = state.listeners.clone();
                notify_lost(&self.dispatcher, &listeners, announcement);
            }
        }
    }
}

fn notify_found(
    dispatcher: &EventDispatcher,
    listeners: &[Arc<dyn DeviceAnnouncementListener>],
    announcement: DeviceAnnouncement,
) {
    for listener in listeners {
        let listener = listener.clone();
        let announcement = announcement.clone();
        dispatcher.submit(move || listener.device_found(&announcement));
    }
}

fn notify_lost(
    dispatcher: &EventDispatcher,
    listeners: &[Arc<dyn DeviceAnnouncementListener>],
    announcement: DeviceAnnouncement,
) {
    for listener in listeners {
        let listener = listener.clone();
        let announcement = announcement.clone();
        dispatcher.submit(move || listener.device_lost(&announcement));
    }
}

/// Receive announcements until the finder deactivates or the socket is
/// replaced by a newer activation
fn receive_loop(inner: Arc<FinderInner>, socket: Arc<UdpSocket>) {
    let mut buf = [0u8; 512];
    loop {
        {
            let state = inner.state();
            match &state.socket {
                Some(current) if Arc::ptr_eq(current, &socket) => {}
                _ => break,
            }
            // With no devices there is nothing to expire, so block
            // until traffic arrives; otherwise tick every second to
            // notice devices that have vanished.
            let timeout = if state.devices.is_empty() {
                None
            } else {
                Some(Duration::from_millis(EXPIRATION_CHECK_MS))
            };
            if let Err(e) = socket.set_read_timeout(timeout) {
                tracing::warn!("Problem adjusting announcement socket timeout: {}", e);
            }
        }

        match socket.recv_from(&mut buf) {
            Ok((len, source)) => {
                inner.process_packet(&buf[..len], source.ip());
                inner.expire_devices();
            }
            Err(e) if is_timeout(e.kind()) => {
                inner.expire_devices();
            }
            Err(e) => {
                // Expected when stop closes the socket out from under
                // us; anything else is a real failure.
                if inner.is_current_socket(&socket) {
                    tracing::warn!("Problem reading from announcement socket, stopping: {}", e);
                    inner.stop();
                }
                break;
            }
        }
    }
}

/// Bind the announcement port for broadcast reception, sharing it with
/// any other DJ Link software on this host
fn bind_announcement_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&address.into())?;
    Ok(socket.into())
}

/// Nudge a receiver blocked in recv so it can notice deactivation
fn wake_receiver(port: u16) {
    if let Ok(socket) = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)) {
        let _ = socket.send_to(&[], (Ipv4Addr::LOCALHOST, port));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::packet;
    use crate::status::DeviceUpdate;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Found(u8),
        Lost(u8),
    }

    struct RecordingListener {
        tx: Sender<Event>,
    }

    impl DeviceAnnouncementListener for RecordingListener {
        fn device_found(&self, announcement: &DeviceAnnouncement) {
            let _ = self.tx.send(Event::Found(announcement.number));
        }

        fn device_lost(&self, announcement: &DeviceAnnouncement) {
            let _ = self.tx.send(Event::Lost(announcement.number));
        }
    }

    struct StubVirtualCdj {
        active: AtomicBool,
        address: IpAddr,
    }

    impl VirtualCdj for StubVirtualCdj {
        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn local_address(&self) -> Option<IpAddr> {
            Some(self.address)
        }

        fn device_number(&self) -> u8 {
            5
        }

        fn latest_status_for(&self, _device_number: u8) -> Option<DeviceUpdate> {
            None
        }
    }

    fn test_finder(maximum_age: Duration) -> DeviceFinder {
        DeviceFinder::new(FinderConfig {
            announcement_port: 0,
            maximum_age,
        })
        .unwrap()
    }

    fn listening_finder(maximum_age: Duration) -> (DeviceFinder, Receiver<Event>, UdpSocket, u16) {
        let finder = test_finder(maximum_age);
        let (tx, rx) = unbounded();
        finder.add_listener(Arc::new(RecordingListener { tx }));
        finder.start().unwrap();
        let port = finder.local_port().unwrap();
        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        (finder, rx, sender, port)
    }

    fn fake_announcement(finder: &DeviceFinder, number: u8, address: [u8; 4]) -> DeviceAnnouncement {
        let announcement = DeviceAnnouncement::parse(
            &packet::make_announcement(number, "CDJ-2000"),
            IpAddr::V4(Ipv4Addr::new(address[0], address[1], address[2], address[3])),
            unix_millis(),
        )
        .unwrap();
        finder
            .inner
            .state()
            .devices
            .insert(announcement.address, announcement.clone());
        announcement
    }

    #[test]
    fn test_start_is_idempotent() {
        let finder = test_finder(Duration::from_secs(10));
        finder.start().unwrap();
        let first_start = finder.start_time().unwrap();
        let port = finder.local_port().unwrap();

        finder.start().unwrap();
        assert!(finder.is_active());
        assert_eq!(finder.start_time().unwrap(), first_start);
        assert_eq!(finder.local_port().unwrap(), port);

        finder.stop();
        assert!(!finder.is_active());
    }

    #[test]
    fn test_observers_fail_when_inactive() {
        let finder = test_finder(Duration::from_secs(10));
        assert!(matches!(
            finder.current_devices(),
            Err(Error::Discovery(DiscoveryError::NotActive))
        ));
        assert!(matches!(
            finder.start_time(),
            Err(Error::Discovery(DiscoveryError::NotActive))
        ));

        finder.start().unwrap();
        assert!(finder.current_devices().unwrap().is_empty());
        finder.stop();

        assert!(matches!(
            finder.current_devices(),
            Err(Error::Discovery(DiscoveryError::NotActive))
        ));
    }

    #[test]
    fn test_restart_yields_fresh_directory() {
        let finder = test_finder(Duration::from_secs(10));
        finder.start().unwrap();
        fake_announcement(&finder, 2, [192, 168, 1, 10]);
        assert_eq!(finder.current_devices().unwrap().len(), 1);

        finder.stop();
        finder.start().unwrap();
        assert!(finder.is_active());
        assert!(finder.current_devices().unwrap().is_empty());
        finder.stop();
    }

    #[test]
    fn test_found_keepalive_lost_sequence() {
        let (finder, rx, sender, port) = listening_finder(Duration::from_millis(600));
        let data = packet::make_announcement(2, "CDJ-2000");

        sender.send_to(&data, (Ipv4Addr::LOCALHOST, port)).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Event::Found(2));

        // A keepalive refreshes the timestamp without a notification
        sender.send_to(&data, (Ipv4Addr::LOCALHOST, port)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(finder.current_devices().unwrap().len(), 1);

        // Silence ages the device out on a later expiration tick
        assert_eq!(rx.recv_timeout(Duration::from_secs(4)).unwrap(), Event::Lost(2));
        assert!(finder.current_devices().unwrap().is_empty());

        finder.stop();
    }

    #[test]
    fn test_malformed_packets_are_ignored() {
        let (finder, rx, sender, port) = listening_finder(Duration::from_secs(10));

        let mut wrong_type = packet::make_announcement(2, "CDJ-2000");
        wrong_type[10] = 0x05;
        sender.send_to(&wrong_type, (Ipv4Addr::LOCALHOST, port)).unwrap();

        let short = &packet::make_announcement(2, "CDJ-2000")[..53];
        sender.send_to(short, (Ipv4Addr::LOCALHOST, port)).unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        assert!(finder.current_devices().unwrap().is_empty());

        finder.stop();
    }

    #[test]
    fn test_self_echo_suppressed_while_virtual_cdj_active() {
        let (finder, rx, sender, port) = listening_finder(Duration::from_secs(10));
        let stub = Arc::new(StubVirtualCdj {
            active: AtomicBool::new(true),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        });
        finder.set_virtual_cdj(stub.clone());

        let data = packet::make_announcement(5, "Virtual CDJ");
        sender.send_to(&data, (Ipv4Addr::LOCALHOST, port)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        assert!(finder.current_devices().unwrap().is_empty());

        // The same packet is accepted once the virtual CDJ goes quiet
        stub.active.store(false, Ordering::SeqCst);
        sender.send_to(&data, (Ipv4Addr::LOCALHOST, port)).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Event::Found(5));

        finder.stop();
    }

    #[test]
    fn test_stop_reports_every_device_lost() {
        let (finder, rx, _sender, _port) = listening_finder(Duration::from_secs(10));
        fake_announcement(&finder, 1, [192, 168, 1, 11]);
        fake_announcement(&finder, 2, [192, 168, 1, 12]);
        fake_announcement(&finder, 3, [192, 168, 1, 13]);

        finder.stop();

        let mut lost = Vec::new();
        for _ in 0..3 {
            match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                Event::Lost(number) => lost.push(number),
                other => panic!("unexpected event {:?}", other),
            }
        }
        lost.sort_unstable();
        assert_eq!(lost, vec![1, 2, 3]);
        assert!(matches!(
            finder.current_devices(),
            Err(Error::Discovery(DiscoveryError::NotActive))
        ));
    }

    #[test]
    fn test_latest_announcement_from() {
        let finder = test_finder(Duration::from_secs(10));
        finder.start().unwrap();
        fake_announcement(&finder, 2, [192, 168, 1, 10]);
        fake_announcement(&finder, 3, [192, 168, 1, 11]);

        assert_eq!(finder.latest_announcement_from(3).unwrap().unwrap().number, 3);
        assert!(finder.latest_announcement_from(4).unwrap().is_none());

        finder.stop();
    }

    #[test]
    fn test_listener_registration_is_identity_deduplicated() {
        let finder = test_finder(Duration::from_secs(10));
        let (tx, _rx) = unbounded();
        let listener: Arc<dyn DeviceAnnouncementListener> = Arc::new(RecordingListener { tx });

        finder.add_listener(listener.clone());
        finder.add_listener(listener.clone());
        assert_eq!(finder.inner.state().listeners.len(), 1);

        finder.remove_listener(&listener);
        assert!(finder.inner.state().listeners.is_empty());

        // Removing an unregistered listener is a no-op
        finder.remove_listener(&listener);
    }
}
