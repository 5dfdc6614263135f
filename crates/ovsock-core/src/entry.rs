//! Completion queue entry types.
//!
//! These are the *lingua franca* between the port backends and the worker
//! dispatch loop.

/// Identifies one in-flight operation.
///
/// High 32 bits: the owning socket's key. Low 32 bits: the index of the
/// operation's context in the owner's pending slab. Backends carry it
/// through the OS untouched (io_uring `user_data`, the IOCP overlapped
/// record, the epoll pending queue) and hand it back on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct OpToken(pub u64);

impl OpToken {
    #[inline]
    pub const fn new(owner: u32, slot: u32) -> Self {
        Self(((owner as u64) << 32) | slot as u64)
    }

    #[inline]
    pub const fn owner(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn slot(self) -> u32 {
        self.0 as u32
    }
}

/// Largest owner key a socket may be assigned.
///
/// Keeps the top bit of every token clear so backends can tag their own
/// queue entries (posted keys, cancel requests) in the same 64-bit space.
pub const MAX_OWNER_KEY: u32 = 0x7FFF_FFFF;

/// One dequeued completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEntry {
    /// Completion key: the owner key for I/O, the posted value for
    /// [`CompletionPort::post`](crate::port::CompletionPort::post).
    pub key: u64,
    /// The completed operation; `None` for posted entries.
    pub token: Option<OpToken>,
    /// Bytes transferred.
    pub bytes: u32,
    /// Raw OS error code, `0` on success.
    pub error: u32,
}

impl CompletionEntry {
    pub const EMPTY: Self = Self {
        key: 0,
        token: None,
        bytes: 0,
        error: 0,
    };

    /// Entry for a completed operation.
    pub const fn io(token: OpToken, bytes: u32, error: u32) -> Self {
        Self {
            key: token.owner() as u64,
            token: Some(token),
            bytes,
            error,
        }
    }

    /// Entry for a posted key (no operation attached).
    pub const fn posted(key: u64) -> Self {
        Self {
            key,
            token: None,
            bytes: 0,
            error: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_packing() {
        let t = OpToken::new(MAX_OWNER_KEY, u32::MAX);
        assert_eq!(t.owner(), MAX_OWNER_KEY);
        assert_eq!(t.slot(), u32::MAX);
        assert_eq!(t.0 >> 63, 0);

        let t = OpToken::new(3, 17);
        assert_eq!((t.owner(), t.slot()), (3, 17));
    }

    #[test]
    fn test_entry_constructors() {
        let e = CompletionEntry::io(OpToken::new(9, 1), 4, 0);
        assert_eq!(e.key, 9);
        assert_eq!(e.token.map(OpToken::slot), Some(1));

        let p = CompletionEntry::posted(0xdead_beef);
        assert_eq!(p.key, 0xdead_beef);
        assert!(p.token.is_none());
    }
}
