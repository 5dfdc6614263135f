//! # ovsock - completion-port sockets
//!
//! TCP client and server sockets driven by a completion port: every
//! connect, accept, receive and send is submitted as an overlapped
//! operation, and a fixed pool of worker threads dispatches the results to
//! callbacks.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ovsock::{ClientSocket, ServerSocket};
//!
//! let server = ServerSocket::new();
//! server.events().on_data.set(|ev| {
//!     ev.server.send(&ev.data, ev.client);
//! });
//! server.listen("127.0.0.1", 7000);
//!
//! let client = ClientSocket::new();
//! client.events().on_connect.set(|ev| {
//!     ev.link.send(b"ping");
//! });
//! client.events().on_data.set(|ev| println!("{:?}", ev.data));
//! client.connect("127.0.0.1", 7000);
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  ClientSocket / ServerSocket        callbacks (Event<E>)
//!            |  submit                      ^
//!            v                              |
//!  ┌────────────────────┐   wait   ┌────────────────┐
//!  │  CompletionPort    │ ───────> │ worker threads │
//!  │ iocp/io_uring/epoll│          │  (Runtime)     │
//!  └────────────────────┘          └────────────────┘
//! ```
//!
//! The first socket starts the [`Runtime`]; closing the last one stops it.

mod client;
pub mod config;
pub mod events;
mod runtime;
mod server;
mod socket;
mod worker;

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use client::{ClientSocket, ClientState};
pub use config::{ClientConfig, FailureScope, RuntimeConfig, ServerConfig};
pub use events::{
    ClientConnectEvent, ClientDataEvent, ClientEvents, ClientLink, CloseEvent, CloseReason,
    ConnectEvent, DataEvent, DisconnectEvent, ErrorEvent, ListeningEvent, ServerEvents,
    ServerLink,
};
pub use runtime::{CompletionTarget, Runtime, RuntimeStats};
pub use server::ServerSocket;

pub use ovsock_core::{AddressFamily, Backend, ClientId, OpKind, SocketType};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|p| p.into_inner())
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|p| p.into_inner())
}
