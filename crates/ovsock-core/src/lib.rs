//! # ovsock-core
//!
//! Platform-agnostic building blocks of the ovsock completion socket layer:
//!
//! - [`port::CompletionPort`]: the one trait every OS backend implements
//! - [`entry`]: operation tokens and dequeued completion entries
//! - [`context`]: per-operation records and their owning slab
//! - [`event::Event`]: single-slot callbacks
//! - [`error::PortError`]: the internal error type
//! - [`kprint`]: leveled logging macros (`kinfo!`, `kwarn!`, ...)
//!
//! Nothing here touches the OS. Backends live in `ovsock-module`; sockets
//! and the worker pool live in `ovsock`.

pub mod context;
pub mod entry;
pub mod env;
pub mod error;
pub mod event;
#[macro_use]
pub mod kprint;
pub mod port;
pub mod slab;

pub use context::{ClientId, CompletionContext, OpKind, PendingOps, DEFAULT_BUFFER_SIZE};
pub use entry::{CompletionEntry, OpToken, MAX_OWNER_KEY};
pub use error::{os_error_string, PortError, PortResult};
pub use event::Event;
pub use kprint::LogLevel;
pub use port::{AddressFamily, Backend, CompletionPort, Operation, RawSock, SocketType, INVALID_SOCK};
pub use slab::{Slab, SlabKey};
