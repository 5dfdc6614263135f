//! Event records delivered to socket callbacks, and the links that let a
//! callback act on the socket that raised the event.
//!
//! Records own their data. Links hold a weak reference, so a handler that
//! stores one does not keep the socket alive.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Weak;

use ovsock_core::{os_error_string, ClientId, Event, OpKind};

use crate::client::ClientCore;
use crate::server::ServerCore;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on this side.
    Local,
    /// The peer shut down its sending side (zero-byte receive).
    PeerShutdown,
    /// An operation failed with the given OS error.
    Error { op: OpKind, code: i32 },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::PeerShutdown => f.write_str("peer shut down"),
            CloseReason::Error { op, code } => {
                write!(f, "{} failed: {}", op, os_error_string(*code))
            }
        }
    }
}

/// Handle to a client socket for use inside callbacks.
#[derive(Clone)]
pub struct ClientLink {
    pub(crate) core: Weak<ClientCore>,
}

impl ClientLink {
    /// Queue `data` for sending. `false` if the socket is gone or closed.
    pub fn send(&self, data: &[u8]) -> bool {
        self.core.upgrade().is_some_and(|c| c.send(data))
    }

    pub fn close(&self) -> bool {
        self.core.upgrade().is_some_and(|c| c.close())
    }

    pub fn is_open(&self) -> bool {
        self.core.upgrade().is_some_and(|c| c.is_open())
    }
}

impl fmt::Debug for ClientLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientLink").field("open", &self.is_open()).finish()
    }
}

/// Handle to a server socket for use inside callbacks.
#[derive(Clone)]
pub struct ServerLink {
    pub(crate) core: Weak<ServerCore>,
}

impl ServerLink {
    pub fn send(&self, data: &[u8], client: ClientId) -> bool {
        self.core.upgrade().is_some_and(|s| s.send(data, client))
    }

    pub fn close_client(&self, client: ClientId) -> bool {
        self.core.upgrade().is_some_and(|s| s.close_client(client))
    }

    pub fn close(&self) -> bool {
        self.core.upgrade().is_some_and(|s| s.close())
    }

    pub fn is_open(&self) -> bool {
        self.core.upgrade().is_some_and(|s| s.is_open())
    }
}

impl fmt::Debug for ServerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerLink").field("open", &self.is_open()).finish()
    }
}

// ── client events ──

/// Connection established.
#[derive(Debug, Clone)]
pub struct ConnectEvent {
    pub host: String,
    pub port: u16,
    pub link: ClientLink,
}

/// Bytes of one receive completion.
#[derive(Debug, Clone)]
pub struct DataEvent {
    pub data: Vec<u8>,
    pub link: ClientLink,
}

/// A connect, receive or send completed with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorEvent {
    pub op: OpKind,
    pub code: i32,
}

impl ErrorEvent {
    pub fn message(&self) -> String {
        os_error_string(self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseEvent {
    pub reason: CloseReason,
}

#[derive(Default)]
pub struct ClientEvents {
    pub on_connect: Event<ConnectEvent>,
    pub on_data: Event<DataEvent>,
    pub on_error: Event<ErrorEvent>,
    pub on_close: Event<CloseEvent>,
}

// ── server events ──

#[derive(Debug, Clone)]
pub struct ListeningEvent {
    pub host: String,
    pub port: u16,
}

/// A client was accepted.
#[derive(Debug, Clone)]
pub struct ClientConnectEvent {
    pub client: ClientId,
    pub peer: Option<SocketAddr>,
    pub server: ServerLink,
}

/// Bytes of one receive completion from `client`.
#[derive(Debug, Clone)]
pub struct ClientDataEvent {
    pub client: ClientId,
    pub data: Vec<u8>,
    pub server: ServerLink,
}

#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub client: ClientId,
    pub reason: CloseReason,
}

#[derive(Default)]
pub struct ServerEvents {
    pub on_listening: Event<ListeningEvent>,
    pub on_connect: Event<ClientConnectEvent>,
    pub on_data: Event<ClientDataEvent>,
    pub on_disconnect: Event<DisconnectEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::Local.to_string(), "closed locally");
        assert_eq!(CloseReason::PeerShutdown.to_string(), "peer shut down");
        let r = CloseReason::Error {
            op: OpKind::Recv,
            code: 104,
        };
        assert!(r.to_string().starts_with("recv failed: "));
    }

    #[test]
    fn test_dead_links_are_inert() {
        let c = ClientLink { core: Weak::new() };
        assert!(!c.send(b"x"));
        assert!(!c.close());
        assert!(!c.is_open());

        let s = ServerLink { core: Weak::new() };
        let id = ClientId(ovsock_core::SlabKey {
            index: 0,
            generation: 0,
        });
        assert!(!s.send(b"x", id));
        assert!(!s.close_client(id));
    }
}
