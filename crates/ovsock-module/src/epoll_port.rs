//! `EpollPort`: completion semantics emulated on readiness.
//!
//! Each descriptor keeps two FIFO queues of pending operations: reads
//! (recv, accept) and writes (connect, send). An operation is tried as soon
//! as it reaches the head of its queue; if the socket would block, the
//! descriptor is armed `EPOLLONESHOT` for the missing direction and the
//! queue is retried when it fires.
//!
//! Finished operations go to a lock-free ready queue and an eventfd wakes
//! the poller, so completions reach workers through `wait` exactly like a
//! kernel completion queue, including ones that finished inside `submit`.
//!
//! One worker at a time polls; the others wait on the poller lock and drain
//! the ready queue when they get it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crossbeam_queue::SegQueue;
use ovsock_core::{
    ktrace, kwarn, CompletionEntry, CompletionPort, OpToken, Operation, PortError, PortResult,
    RawSock,
};

use crate::{lock, net};

const WAKE_DATA: u64 = u64::MAX;
const MAX_EVENTS: usize = 64;

enum EpollOp {
    Connect,
    Accept { accept_into: RawSock },
    Recv { buf: *mut u8, len: usize },
    Send { buf: *const u8, len: usize, sent: usize },
}

struct Queued {
    token: OpToken,
    op: EpollOp,
}

// Raw buffer pointers are only touched by the syscalls issued for the op.
unsafe impl Send for Queued {}

enum Attempt {
    Done { bytes: usize, error: i32 },
    WouldBlock,
}

#[derive(Default)]
struct FdState {
    reads: VecDeque<Queued>,
    writes: VecDeque<Queued>,
    registered: bool,
}

#[derive(Default)]
struct OpTable {
    fds: HashMap<RawSock, FdState>,
    accept_targets: HashSet<RawSock>,
}

pub struct EpollPort {
    epfd: RawSock,
    wake: RawSock,
    table: Mutex<OpTable>,
    ready: SegQueue<CompletionEntry>,
    poller: Mutex<()>,
}

#[inline]
fn would_block(err: i32) -> bool {
    err == libc::EAGAIN || err == libc::EWOULDBLOCK || err == libc::EINPROGRESS
}

/// Make as much progress on `q` as the socket allows without blocking.
fn attempt(fd: RawSock, q: &mut Queued, targets: &mut HashSet<RawSock>) -> Attempt {
    loop {
        match &mut q.op {
            EpollOp::Recv { buf, len } => {
                let n = unsafe { libc::recv(fd, *buf as *mut libc::c_void, *len, 0) };
                if n >= 0 {
                    return Attempt::Done { bytes: n as usize, error: 0 };
                }
            }
            EpollOp::Send { buf, len, sent } => {
                if *sent == *len {
                    return Attempt::Done { bytes: *sent, error: 0 };
                }
                let n = unsafe {
                    libc::send(
                        fd,
                        buf.add(*sent) as *const libc::c_void,
                        *len - *sent,
                        libc::MSG_NOSIGNAL,
                    )
                };
                if n >= 0 {
                    *sent += n as usize;
                    continue;
                }
                let err = net::errno();
                if err == libc::EINTR {
                    continue;
                }
                if would_block(err) {
                    return Attempt::WouldBlock;
                }
                return Attempt::Done { bytes: *sent, error: err };
            }
            EpollOp::Accept { accept_into } => {
                let accept_into = *accept_into;
                let new_fd = unsafe {
                    libc::accept4(
                        fd,
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    )
                };
                if new_fd >= 0 {
                    let error = if !targets.remove(&accept_into) {
                        libc::ECANCELED
                    } else if unsafe { libc::dup3(new_fd, accept_into, libc::O_CLOEXEC) } < 0 {
                        net::errno()
                    } else {
                        0
                    };
                    unsafe { libc::close(new_fd) };
                    return Attempt::Done { bytes: 0, error };
                }
                let err = net::errno();
                if err != libc::EINTR && !would_block(err) {
                    targets.remove(&accept_into);
                }
            }
            EpollOp::Connect => {
                // Only queued after EINPROGRESS; writable means decided.
                return match net::take_error(fd) {
                    Ok(error) => Attempt::Done { bytes: 0, error },
                    Err(e) => Attempt::Done {
                        bytes: 0,
                        error: e.os_code().unwrap_or(libc::EIO),
                    },
                };
            }
        }
        let err = net::errno();
        if err == libc::EINTR {
            continue;
        }
        if would_block(err) {
            return Attempt::WouldBlock;
        }
        return Attempt::Done { bytes: 0, error: err };
    }
}

impl EpollPort {
    pub fn new() -> PortResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(PortError::last_os_error());
        }
        let wake = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake < 0 {
            let err = PortError::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_DATA,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake, &mut ev) } < 0 {
            let err = PortError::last_os_error();
            unsafe {
                libc::close(wake);
                libc::close(epfd);
            }
            return Err(err);
        }
        Ok(Self {
            epfd,
            wake,
            table: Mutex::new(OpTable::default()),
            ready: SegQueue::new(),
            poller: Mutex::new(()),
        })
    }

    fn complete(&self, token: OpToken, bytes: usize, error: i32) {
        self.ready.push(CompletionEntry::io(token, bytes as u32, error as u32));
        self.notify();
    }

    fn notify(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.wake,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN: counter saturated, a wakeup is already pending.
        if ret < 0 && net::errno() != libc::EAGAIN {
            kwarn!("epoll: eventfd write failed: {}", PortError::last_os_error());
        }
    }

    fn drain_notify(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.wake,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    /// Re-arm `fd` for every direction that still has queued work.
    fn arm(&self, fd: RawSock, state: &mut FdState) -> PortResult<()> {
        let mut interest = 0;
        if !state.reads.is_empty() {
            interest |= libc::EPOLLIN | libc::EPOLLRDHUP;
        }
        if !state.writes.is_empty() {
            interest |= libc::EPOLLOUT;
        }
        if interest == 0 {
            return Ok(());
        }
        let mut ev = libc::epoll_event {
            events: (interest | libc::EPOLLONESHOT) as u32,
            u64: fd as u64,
        };
        let (first, second) = if state.registered {
            (libc::EPOLL_CTL_MOD, libc::EPOLL_CTL_ADD)
        } else {
            (libc::EPOLL_CTL_ADD, libc::EPOLL_CTL_MOD)
        };
        if unsafe { libc::epoll_ctl(self.epfd, first, fd, &mut ev) } < 0 {
            // Registration state went stale (fd replaced by dup3, or closed
            // and reused): try the other verb once.
            let err = net::errno();
            if err != libc::ENOENT && err != libc::EEXIST {
                return Err(PortError::Os(err));
            }
            if unsafe { libc::epoll_ctl(self.epfd, second, fd, &mut ev) } < 0 {
                return Err(PortError::last_os_error());
            }
        }
        state.registered = true;
        Ok(())
    }

    fn on_ready(&self, fd: RawSock, events: u32) {
        let mut guard = lock(&self.table);
        let OpTable { fds, accept_targets } = &mut *guard;
        let Some(state) = fds.get_mut(&fd) else {
            return;
        };
        let events = events as libc::c_int;
        let hangup = events & (libc::EPOLLERR | libc::EPOLLHUP) != 0;
        if hangup || events & (libc::EPOLLIN | libc::EPOLLRDHUP) != 0 {
            self.run_queue(fd, &mut state.reads, accept_targets);
        }
        if hangup || events & libc::EPOLLOUT != 0 {
            self.run_queue(fd, &mut state.writes, accept_targets);
        }
        if let Err(e) = self.arm(fd, state) {
            kwarn!("epoll: re-arm of fd {} failed: {}", fd, e);
            let code = e.os_code().unwrap_or(libc::EIO);
            for q in state.reads.drain(..).chain(state.writes.drain(..)) {
                self.complete(q.token, 0, code);
            }
        }
    }

    fn run_queue(&self, fd: RawSock, queue: &mut VecDeque<Queued>, targets: &mut HashSet<RawSock>) {
        while let Some(head) = queue.front_mut() {
            match attempt(fd, head, targets) {
                Attempt::Done { bytes, error } => {
                    let token = head.token;
                    queue.pop_front();
                    self.complete(token, bytes, error);
                }
                Attempt::WouldBlock => break,
            }
        }
    }
}

impl Drop for EpollPort {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake);
            libc::close(self.epfd);
        }
    }
}

impl CompletionPort for EpollPort {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn associate(&self, sock: RawSock, _key: u32) -> PortResult<()> {
        net::set_nonblocking(sock)
    }

    unsafe fn submit(&self, sock: RawSock, token: OpToken, op: Operation) -> PortResult<()> {
        let mut guard = lock(&self.table);
        let OpTable { fds, accept_targets } = &mut *guard;

        let (queued, is_read) = match op {
            Operation::Connect { addr } => {
                let (storage, len) = net::sockaddr_from(&addr);
                let ret = libc::connect(sock, &storage as *const _ as *const libc::sockaddr, len);
                if ret == 0 {
                    self.complete(token, 0, 0);
                    return Ok(());
                }
                let err = net::errno();
                if !would_block(err) {
                    self.complete(token, 0, err);
                    return Ok(());
                }
                (Queued { token, op: EpollOp::Connect }, false)
            }
            Operation::Accept { accept_into } => {
                accept_targets.insert(accept_into);
                (Queued { token, op: EpollOp::Accept { accept_into } }, true)
            }
            Operation::Recv { buf, len } => (Queued { token, op: EpollOp::Recv { buf, len } }, true),
            Operation::Send { buf, len } => {
                (Queued { token, op: EpollOp::Send { buf, len, sent: 0 } }, false)
            }
        };

        let state = fds.entry(sock).or_default();
        let queue = if is_read { &mut state.reads } else { &mut state.writes };
        queue.push_back(queued);
        if queue.len() == 1 && !matches!(op, Operation::Connect { .. }) {
            self.run_queue(sock, queue, accept_targets);
        }

        if let Err(e) = self.arm(sock, state) {
            let queue = if is_read { &mut state.reads } else { &mut state.writes };
            if let Some(pos) = queue.iter().position(|q| q.token == token) {
                queue.remove(pos);
            }
            if let Operation::Accept { accept_into } = op {
                accept_targets.remove(&accept_into);
            }
            return Err(e);
        }
        ktrace!("epoll: {} on fd {}", op.name(), sock);
        Ok(())
    }

    fn post(&self, key: u64) -> PortResult<()> {
        self.ready.push(CompletionEntry::posted(key));
        self.notify();
        Ok(())
    }

    fn wait(&self, out: &mut [CompletionEntry]) -> PortResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let _poller = lock(&self.poller);
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            let mut n = 0;
            while n < out.len() {
                match self.ready.pop() {
                    Some(entry) => {
                        out[n] = entry;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n > 0 {
                return Ok(n);
            }

            let k = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as libc::c_int, -1)
            };
            if k < 0 {
                let err = net::errno();
                if err == libc::EINTR {
                    continue;
                }
                return Err(PortError::Os(err));
            }
            for ev in &events[..k as usize] {
                let (data, flags) = (ev.u64, ev.events);
                if data == WAKE_DATA {
                    self.drain_notify();
                } else {
                    self.on_ready(data as RawSock, flags);
                }
            }
        }
    }

    fn release(&self, sock: RawSock) {
        let mut guard = lock(&self.table);
        let OpTable { fds, accept_targets } = &mut *guard;
        accept_targets.remove(&sock);
        let Some(state) = fds.remove(&sock) else {
            return;
        };
        if state.registered {
            unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, sock, std::ptr::null_mut());
            }
        }
        for q in state.reads.into_iter().chain(state.writes) {
            let bytes = match q.op {
                EpollOp::Accept { accept_into } => {
                    accept_targets.remove(&accept_into);
                    0
                }
                EpollOp::Send { sent, .. } => sent,
                _ => 0,
            };
            self.complete(q.token, bytes, libc::ECANCELED);
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
    use ovsock_core::{AddressFamily, SocketType};

    #[test]
    fn test_post_roundtrip() {
        conformance::post_roundtrip(&EpollPort::new().unwrap());
    }

    #[test]
    fn test_accept_connect_echo() {
        conformance::accept_connect_echo(&EpollPort::new().unwrap());
    }

    #[test]
    fn test_release_cancels_recv() {
        conformance::release_cancels_recv(&EpollPort::new().unwrap());
    }

    #[test]
    fn test_connect_refused_completes_with_error() {
        let port = EpollPort::new().unwrap();

        // Grab a free port, then close it so nothing listens there.
        let probe = net::socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        net::bind(probe, &"127.0.0.1:0".parse().unwrap()).unwrap();
        let dead = net::local_addr(probe).unwrap();
        net::close(probe).unwrap();

        let s = net::socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        net::bind(s, &AddressFamily::Inet.unspecified()).unwrap();
        port.associate(s, 3).unwrap();
        let tok = OpToken::new(3, 0);
        unsafe { port.submit(s, tok, Operation::Connect { addr: dead }).unwrap() };

        let done = conformance::collect(&port, 1);
        assert_eq!(done[0].token, Some(tok));
        assert_eq!(done[0].error as i32, libc::ECONNREFUSED);
        net::close(s).unwrap();
    }

    #[test]
    fn test_accept_with_no_target_is_cancelled() {
        let l = net::socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        net::bind(l, &"127.0.0.1:0".parse().unwrap()).unwrap();
        net::listen(l, 4).unwrap();
        let addr = net::local_addr(l).unwrap();

        let mut targets = HashSet::new();
        let mut q = Queued {
            token: OpToken::new(1, 0),
            op: EpollOp::Accept { accept_into: -1 },
        };
        assert!(matches!(attempt(l, &mut q, &mut targets), Attempt::WouldBlock));

        // Target handle already released: the connection is dropped.
        let _peer = std::net::TcpStream::connect(addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        match attempt(l, &mut q, &mut targets) {
            Attempt::Done { error, .. } => assert_eq!(error, libc::ECANCELED),
            Attempt::WouldBlock => panic!("pending connection not accepted"),
        }
        net::close(l).unwrap();
    }
}
