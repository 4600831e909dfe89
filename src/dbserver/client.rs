//! A single-use session with a player's dbserver

use std::net::TcpStream;

/// One open connection to a player's database server.
///
/// The connection manager hands a client to the task passed to
/// [`invoke_with_client_session`](crate::ConnectionManager::invoke_with_client_session)
/// and closes the stream once the task returns. Query framing and
/// transaction bookkeeping on top of the stream are the concern of
/// higher-level metadata code.
#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
    target_player: u8,
    posing_as: u8,
}

impl Client {
    pub(crate) fn new(stream: TcpStream, target_player: u8, posing_as: u8) -> Self {
        Self {
            stream,
            target_player,
            posing_as,
        }
    }

    /// Player this session is connected to
    pub fn target_player(&self) -> u8 {
        self.target_player
    }

    /// Device number we present ourselves as when querying
    pub fn posing_as(&self) -> u8 {
        self.posing_as
    }

    /// The underlying stream, for issuing queries
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Mutable access to the underlying stream
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}
