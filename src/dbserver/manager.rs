//! Brokered sessions with player database servers
//!
//! Each player runs a metadata database server on a TCP port that is
//! not fixed; it has to be discovered by asking a well-known query port
//! on the player. The manager watches the device finder, probes every
//! new player for its dbserver port, and opens short-lived sessions on
//! request, posing as a device number the target will answer.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use crate::config::ManagerConfig;
use crate::dbserver::client::Client;
use crate::discovery::announcement::DeviceAnnouncement;
use crate::discovery::finder::{DeviceAnnouncementListener, DeviceFinder};
use crate::error::{DbServerError, Result};
use crate::packet;
use crate::status::{DeviceUpdate, VirtualCdj};

/// Mutable state guarded by the manager's single lock
struct ManagerState {
    /// Whether we are offering dbserver sessions
    running: bool,

    /// Discovered dbserver port per device number. A missing entry
    /// means the port is unknown, whether never probed or probe failed.
    ports: HashMap<u8, u16>,

    /// Our registration with the device finder, kept so it can be
    /// removed at stop
    listener: Option<Arc<dyn DeviceAnnouncementListener>>,
}

struct ManagerInner {
    config: ManagerConfig,
    finder: DeviceFinder,
    virtual_cdj: Arc<dyn VirtualCdj>,

    /// Timeout for dbserver connects and reads, in milliseconds.
    /// Mutable at runtime and read afresh for each probe and session.
    socket_timeout_ms: AtomicU64,

    state: Mutex<ManagerState>,
}

/// Determines dbserver ports for discovered players and brokers
/// sessions against them.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

/// Finder listener that triggers a port probe for every new device and
/// forgets the port of every vanished one
struct PortProbeListener {
    inner: Weak<ManagerInner>,
}

impl DeviceAnnouncementListener for PortProbeListener {
    fn device_found(&self, announcement: &DeviceAnnouncement) {
        if let Some(inner) = self.inner.upgrade() {
            spawn_probe(&inner, announcement.clone());
        }
    }

    fn device_lost(&self, announcement: &DeviceAnnouncement) {
        if let Some(inner) = self.inner.upgrade() {
            inner.state().ports.remove(&announcement.number);
        }
    }
}

impl ConnectionManager {
    /// Create a stopped manager watching the given finder and posing
    /// with numbers sanctioned by the given virtual CDJ
    pub fn new(
        finder: DeviceFinder,
        virtual_cdj: Arc<dyn VirtualCdj>,
        config: ManagerConfig,
    ) -> Self {
        let socket_timeout_ms = AtomicU64::new(config.socket_timeout.as_millis() as u64);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                finder,
                virtual_cdj,
                socket_timeout_ms,
                state: Mutex::new(ManagerState {
                    running: false,
                    ports: HashMap::new(),
                    listener: None,
                }),
            }),
        }
    }

    /// Start offering dbserver sessions: ensure the finder is running,
    /// subscribe to its events, and probe every device already known.
    /// Has no effect if already running.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state();
        if state.running {
            return Ok(());
        }

        self.inner.finder.start()?;
        let listener: Arc<dyn DeviceAnnouncementListener> = Arc::new(PortProbeListener {
            inner: Arc::downgrade(&self.inner),
        });
        self.inner.finder.add_listener(listener.clone());
        for device in self.inner.finder.current_devices()? {
            spawn_probe(&self.inner, device);
        }

        state.listener = Some(listener);
        state.running = true;
        Ok(())
    }

    /// Stop offering dbserver sessions and forget every discovered
    /// port. Leaves the finder running. Has no effect if not running.
    pub fn stop(&self) {
        let mut state = self.inner.state();
        if !state.running {
            return;
        }
        state.running = false;
        if let Some(listener) = state.listener.take() {
            self.inner.finder.remove_listener(&listener);
        }
        state.ports.clear();
    }

    /// Whether we are currently offering dbserver sessions
    pub fn is_running(&self) -> bool {
        self.inner.state().running
    }

    /// The dbserver port reported by the given player, if a probe has
    /// discovered it. Sessions should be opened through
    /// [`invoke_with_client_session`](Self::invoke_with_client_session)
    /// rather than against this port directly.
    pub fn db_server_port(&self, player: u8) -> Option<u16> {
        self.inner.state().ports.get(&player).copied()
    }

    /// Set how long to wait for dbserver sockets to connect or read
    pub fn set_socket_timeout(&self, timeout: Duration) {
        self.inner
            .socket_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// How long we wait for dbserver sockets to connect or read
    pub fn socket_timeout(&self) -> Duration {
        self.inner.socket_timeout()
    }

    /// Open a single-use session with the target player's dbserver and
    /// hand it to `task`. The session socket is closed on every exit
    /// path; errors from the task surface unchanged. `description`
    /// names the activity for log messages, as a verb phrase like
    /// "requesting track metadata".
    pub fn invoke_with_client_session<T>(
        &self,
        target_player: u8,
        task: impl FnOnce(&mut Client) -> Result<T>,
        description: &str,
    ) -> Result<T> {
        let announcement = self.inner.finder.latest_announcement_from(target_player)?;
        let port = self.db_server_port(target_player);
        let (announcement, port) = match (announcement, port) {
            (Some(announcement), Some(port)) => (announcement, port),
            _ => return Err(DbServerError::NoSuchPlayer(target_player).into()),
        };

        let posing_as = self.inner.choose_asking_player_number(target_player)?;

        let timeout = self.socket_timeout();
        let address = SocketAddr::new(announcement.address, port);
        let stream = TcpStream::connect_timeout(&address, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut client = Client::new(stream, target_player, posing_as);
        let result = task(&mut client);

        // TODO: keep the connection in a pool for reuse instead of
        // closing after every session
        if let Err(e) = client.stream().shutdown(Shutdown::Both) {
            tracing::warn!("Problem closing dbserver socket after {}: {}", description, e);
        }
        result
    }
}

impl ManagerInner {
    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms.load(Ordering::Relaxed))
    }

    /// Ask a player which TCP port its dbserver listens on, recording
    /// the answer in the port table
    fn request_db_server_port(&self, announcement: &DeviceAnnouncement) {
        match self.query_db_server_port(announcement) {
            Ok(Some(port)) => {
                tracing::info!("Player {} dbserver is on port {}", announcement.number, port);
                let mut state = self.state();
                if state.running {
                    state.ports.insert(announcement.number, port);
                }
            }
            Ok(None) => {
                // Response size already warned about; port stays unknown
            }
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                tracing::info!(
                    "Player {} doesn't answer dbserver port queries, connection refused. \
                     Won't attempt to request metadata.",
                    announcement.number
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Problem requesting dbserver port from player {}: {}",
                    announcement.number,
                    e
                );
            }
        }
    }

    /// Perform the port query exchange against the player's well-known
    /// query port. A response of unexpected size is warned about and
    /// yields no port.
    fn query_db_server_port(
        &self,
        announcement: &DeviceAnnouncement,
    ) -> std::io::Result<Option<u16>> {
        let timeout = self.socket_timeout();
        let address = SocketAddr::new(announcement.address, self.config.query_port);
        let mut stream = TcpStream::connect_timeout(&address, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        stream.write_all(&packet::port_query_frame())?;

        let mut buf = [0u8; 8192];
        let len = stream.read(&mut buf)?;
        if len < 1 {
            return Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "dbserver port query response was empty",
            ));
        }
        if len != 2 {
            tracing::warn!(
                "Expected 2 bytes while reading dbserver port query response, received {}",
                len
            );
        }
        Ok(packet::decode_db_server_port(&buf[..len]))
    }

    /// Pick the device number to pose as when querying the target.
    ///
    /// The virtual CDJ's number is always safe for rekordbox targets,
    /// and for any target when it lies in the range real CDJs answer.
    /// Otherwise we borrow the number of another real CDJ, which only
    /// works while that player is not drawing media from the target.
    fn choose_asking_player_number(&self, target_player: u8) -> Result<u8> {
        let fake_device = self.virtual_cdj.device_number();
        if target_player > 15 || (1..=4).contains(&fake_device) {
            return Ok(fake_device);
        }

        for candidate in self.finder.current_devices()? {
            let real_device = candidate.number;
            if real_device != target_player && (1..=4).contains(&real_device) {
                if let Some(DeviceUpdate::Cdj(status)) =
                    self.virtual_cdj.latest_status_for(real_device)
                {
                    if status.track_source_player != target_player {
                        return Ok(real_device);
                    }
                }
            }
        }
        Err(DbServerError::NoSourceNumber(target_player).into())
    }
}

/// Probe the device on its own short-lived thread; probes for separate
/// devices run independently
fn spawn_probe(inner: &Arc<ManagerInner>, announcement: DeviceAnnouncement) {
    let inner = Arc::clone(inner);
    let spawned = thread::Builder::new()
        .name(format!("dbserver port probe {}", announcement.number))
        .spawn(move || inner.request_db_server_port(&announcement));
    if let Err(e) = spawned {
        tracing::warn!("Failed to spawn dbserver port probe thread: {}", e);
    }
}
