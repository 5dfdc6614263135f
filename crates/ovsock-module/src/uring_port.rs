//! `UringPort`: completion port on a single shared io_uring.
//!
//! All workers share one ring. Submitters push SQEs under the SQ lock and
//! kick the kernel without waiting; one worker at a time holds the CQ lock
//! and blocks in `submit_and_wait(1)`, then drains a batch.
//!
//! `user_data` layout:
//!
//! ```text
//!   bit 63 set        posted key (low 63 bits)
//!   u64::MAX          our own AsyncCancel requests, dropped on reap
//!   otherwise         sequence number of an entry in the op table
//! ```
//!
//! Each submitted operation gets a fresh sequence number rather than its
//! token, so a late cancel can never hit a newer operation that reused the
//! same context slot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use io_uring::{opcode, squeue, types, IoUring};
use ovsock_core::{
    ktrace, kwarn, CompletionEntry, CompletionPort, OpToken, Operation, PortError, PortResult,
    RawSock,
};

use crate::{lock, net};

const POST_TAG: u64 = 1 << 63;
const CANCEL_TAG: u64 = u64::MAX;

enum UringOp {
    Connect {
        /// Kernel reads the address during the op; keep it pinned.
        _addr: Box<(libc::sockaddr_storage, libc::socklen_t)>,
    },
    Accept {
        accept_into: RawSock,
    },
    Recv,
    Send {
        buf: *const u8,
        len: usize,
        sent: usize,
    },
}

struct InFlight {
    fd: RawSock,
    token: OpToken,
    op: UringOp,
}

// Raw buffer pointers are only dereferenced by the kernel.
unsafe impl Send for InFlight {}

#[derive(Default)]
struct OpTable {
    ops: HashMap<u64, InFlight>,
    by_fd: HashMap<RawSock, HashSet<u64>>,
    /// Pre-created handles that pending accepts will land on.
    accept_targets: HashSet<RawSock>,
}

impl OpTable {
    fn insert(&mut self, seq: u64, op: InFlight) {
        self.by_fd.entry(op.fd).or_default().insert(seq);
        self.ops.insert(seq, op);
    }

    fn take(&mut self, seq: u64) -> Option<InFlight> {
        let op = self.ops.remove(&seq)?;
        if let Some(set) = self.by_fd.get_mut(&op.fd) {
            set.remove(&seq);
            if set.is_empty() {
                self.by_fd.remove(&op.fd);
            }
        }
        Some(op)
    }
}

pub struct UringPort {
    ring: IoUring,
    sq: Mutex<()>,
    cq: Mutex<()>,
    table: Mutex<OpTable>,
    next_seq: AtomicU64,
}

// SQ and CQ views are only created under their respective locks.
unsafe impl Send for UringPort {}
unsafe impl Sync for UringPort {}

impl UringPort {
    pub fn new(entries: u32) -> PortResult<Self> {
        let entries = entries.max(8).next_power_of_two();
        let ring = IoUring::builder()
            .setup_cqsize(entries * 4)
            .build(entries)?;
        Ok(Self {
            ring,
            sq: Mutex::new(()),
            cq: Mutex::new(()),
            table: Mutex::new(OpTable::default()),
            next_seq: AtomicU64::new(1),
        })
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) & !(POST_TAG | (1 << 62))
    }

    /// Queue one SQE and kick the kernel without waiting.
    fn push(&self, sqe: &squeue::Entry) -> PortResult<()> {
        let _sq = lock(&self.sq);
        let pushed = unsafe { self.ring.submission_shared().push(sqe).is_ok() };
        if !pushed {
            // SQ full: flush what is queued and retry once.
            self.kick()?;
            unsafe { self.ring.submission_shared().push(sqe) }.map_err(|_| PortError::QueueFull)?;
        }
        self.kick()
    }

    fn kick(&self) -> PortResult<()> {
        match self.ring.submit() {
            Ok(_) => Ok(()),
            // Left in the SQ; the waiter's next enter submits them.
            Err(e) if matches!(e.raw_os_error(), Some(libc::EBUSY | libc::EAGAIN | libc::EINTR)) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Turn one CQE into at most one completion entry.
    fn reap(&self, seq: u64, res: i32) -> Option<CompletionEntry> {
        if seq == CANCEL_TAG {
            return None;
        }
        if seq & POST_TAG != 0 {
            return Some(CompletionEntry::posted(seq & !POST_TAG));
        }

        let mut table = lock(&self.table);
        let Some(inflight) = table.take(seq) else {
            kwarn!("io_uring: completion for unknown op {}", seq);
            return None;
        };
        let InFlight { fd, token, op } = inflight;
        let (bytes, error) = if res < 0 { (0, -res) } else { (res as usize, 0) };

        match op {
            UringOp::Send { buf, len, sent } if error == 0 && bytes > 0 && sent + bytes < len => {
                let sent = sent + bytes;
                let sqe = opcode::Send::new(types::Fd(fd), unsafe { buf.add(sent) }, (len - sent) as u32)
                    .flags(libc::MSG_NOSIGNAL)
                    .build()
                    .user_data(seq);
                table.insert(seq, InFlight { fd, token, op: UringOp::Send { buf, len, sent } });
                match self.push(&sqe) {
                    Ok(()) => None,
                    Err(e) => {
                        table.take(seq);
                        let code = e.os_code().unwrap_or(libc::ENOBUFS);
                        Some(CompletionEntry::io(token, sent as u32, code as u32))
                    }
                }
            }
            UringOp::Send { sent, .. } => {
                Some(CompletionEntry::io(token, (sent + bytes) as u32, error as u32))
            }
            UringOp::Accept { accept_into } => {
                let wanted = table.accept_targets.remove(&accept_into);
                if error != 0 {
                    return Some(CompletionEntry::io(token, 0, error as u32));
                }
                let new_fd = res;
                let error = if !wanted {
                    libc::ECANCELED
                } else if unsafe { libc::dup3(new_fd, accept_into, libc::O_CLOEXEC) } < 0 {
                    net::errno()
                } else {
                    0
                };
                unsafe { libc::close(new_fd) };
                Some(CompletionEntry::io(token, 0, error as u32))
            }
            UringOp::Connect { .. } | UringOp::Recv => {
                Some(CompletionEntry::io(token, bytes as u32, error as u32))
            }
        }
    }
}

impl CompletionPort for UringPort {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn associate(&self, _sock: RawSock, _key: u32) -> PortResult<()> {
        Ok(())
    }

    unsafe fn submit(&self, sock: RawSock, token: OpToken, op: Operation) -> PortResult<()> {
        let seq = self.next_seq();
        let fd = types::Fd(sock);
        let (uop, sqe) = match op {
            Operation::Connect { addr } => {
                let boxed = Box::new(net::sockaddr_from(&addr));
                let sqe = opcode::Connect::new(
                    fd,
                    &boxed.0 as *const libc::sockaddr_storage as *const libc::sockaddr,
                    boxed.1,
                )
                .build();
                (UringOp::Connect { _addr: boxed }, sqe)
            }
            Operation::Accept { accept_into } => {
                let sqe = opcode::Accept::new(fd, std::ptr::null_mut(), std::ptr::null_mut())
                    .flags(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
                    .build();
                (UringOp::Accept { accept_into }, sqe)
            }
            Operation::Recv { buf, len } => {
                (UringOp::Recv, opcode::Recv::new(fd, buf, len as u32).build())
            }
            Operation::Send { buf, len } => {
                let sqe = opcode::Send::new(fd, buf, len as u32)
                    .flags(libc::MSG_NOSIGNAL)
                    .build();
                (UringOp::Send { buf, len, sent: 0 }, sqe)
            }
        };
        let sqe = sqe.user_data(seq);

        let mut table = lock(&self.table);
        if let Operation::Accept { accept_into } = op {
            table.accept_targets.insert(accept_into);
        }
        table.insert(seq, InFlight { fd: sock, token, op: uop });
        if let Err(e) = self.push(&sqe) {
            table.take(seq);
            if let Operation::Accept { accept_into } = op {
                table.accept_targets.remove(&accept_into);
            }
            return Err(e);
        }
        ktrace!("io_uring: {} on fd {} seq {}", op.name(), sock, seq);
        Ok(())
    }

    fn post(&self, key: u64) -> PortResult<()> {
        let sqe = opcode::Nop::new().build().user_data(POST_TAG | key);
        self.push(&sqe)
    }

    fn wait(&self, out: &mut [CompletionEntry]) -> PortResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let _cq = lock(&self.cq);
        loop {
            let raw: Vec<(u64, i32)> = unsafe {
                self.ring
                    .completion_shared()
                    .take(out.len())
                    .map(|cqe| (cqe.user_data(), cqe.result()))
                    .collect()
            };

            let mut n = 0;
            for (seq, res) in raw {
                if let Some(entry) = self.reap(seq, res) {
                    out[n] = entry;
                    n += 1;
                }
            }
            if n > 0 {
                return Ok(n);
            }

            if let Err(e) = self.ring.submit_and_wait(1) {
                match e.raw_os_error() {
                    Some(libc::EINTR | libc::EBUSY | libc::EAGAIN) => {}
                    _ => return Err(e.into()),
                }
            }
        }
    }

    fn release(&self, sock: RawSock) {
        let mut table = lock(&self.table);
        table.accept_targets.remove(&sock);
        let Some(seqs) = table.by_fd.get(&sock) else {
            return;
        };
        for &seq in seqs {
            let sqe = opcode::AsyncCancel::new(seq).build().user_data(CANCEL_TAG);
            if let Err(e) = self.push(&sqe) {
                kwarn!("io_uring: cancel of op {} on fd {} failed: {}", seq, sock, e);
            }
        }
    }

    fn complete_connect(&self, _sock: RawSock) -> PortResult<()> {
        Ok(())
    }

    fn complete_accept(&self, _listener: RawSock, _accepted: RawSock) -> PortResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    fn port() -> Option<UringPort> {
        match UringPort::new(64) {
            Ok(p) => Some(p),
            Err(e) => {
                eprintln!("io_uring unavailable, skipping: {}", e);
                None
            }
        }
    }

    #[test]
    fn test_post_roundtrip() {
        if let Some(p) = port() {
            conformance::post_roundtrip(&p);
        }
    }

    #[test]
    fn test_accept_connect_echo() {
        if let Some(p) = port() {
            conformance::accept_connect_echo(&p);
        }
    }

    #[test]
    fn test_release_cancels_recv() {
        if let Some(p) = port() {
            conformance::release_cancels_recv(&p);
        }
    }

    #[test]
    fn test_seq_never_tagged() {
        if let Some(p) = port() {
            p.next_seq.store(u64::MAX - 1, Ordering::Relaxed);
            assert_eq!(p.next_seq() & (POST_TAG | (1 << 62)), 0);
            assert_ne!(p.next_seq(), CANCEL_TAG);
        }
    }
}
