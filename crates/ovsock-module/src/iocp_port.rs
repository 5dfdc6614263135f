//! `IocpPort`: Windows I/O completion port.
//!
//! Every operation is a heap `OverlappedOp` whose first field is the
//! `OVERLAPPED` handed to Winsock. The box is leaked on submit and rebuilt
//! from the dequeued `lpOverlapped` pointer, so the OS owns it exactly as
//! long as the operation is in flight.
//!
//! `ConnectEx`/`AcceptEx` are not exported by ws2_32; they are fetched once
//! per process with `WSAIoctl(SIO_GET_EXTENSION_FUNCTION_POINTER)`.

use std::mem;
use std::ptr;
use std::sync::OnceLock;

use ovsock_core::{
    ktrace, CompletionEntry, CompletionPort, OpToken, Operation, PortError, PortResult, RawSock,
};
use windows_sys::core::GUID;
use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Networking::WinSock::{
    setsockopt, WSAGetLastError, WSAGetOverlappedResult, WSAIoctl, WSARecv, WSASend, LPFN_ACCEPTEX,
    LPFN_CONNECTEX, SIO_GET_EXTENSION_FUNCTION_POINTER, SOCKADDR, SOCKADDR_STORAGE, SOCKET_ERROR,
    SOL_SOCKET, SO_UPDATE_ACCEPT_CONTEXT, SO_UPDATE_CONNECT_CONTEXT, WSABUF, WSAID_ACCEPTEX,
    WSAID_CONNECTEX, WSA_IO_PENDING,
};
use windows_sys::Win32::System::Threading::INFINITE;
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatusEx, PostQueuedCompletionStatus,
    OVERLAPPED, OVERLAPPED_ENTRY,
};

use crate::net;

const ADDR_SLOT: usize = mem::size_of::<SOCKADDR_STORAGE>() + 16;
const MAX_ENTRIES: usize = 64;

static CONNECT_EX: OnceLock<usize> = OnceLock::new();
static ACCEPT_EX: OnceLock<usize> = OnceLock::new();

#[repr(C)]
struct OverlappedOp {
    overlapped: OVERLAPPED,
    token: OpToken,
    sock: RawSock,
    wsabuf: WSABUF,
    /// ConnectEx target; AcceptEx local+remote address output.
    addr: SOCKADDR_STORAGE,
    accept_buf: [u8; 2 * ADDR_SLOT],
}

impl OverlappedOp {
    fn boxed(sock: RawSock, token: OpToken) -> Box<Self> {
        Box::new(Self {
            overlapped: unsafe { mem::zeroed() },
            token,
            sock,
            wsabuf: WSABUF {
                len: 0,
                buf: ptr::null_mut(),
            },
            addr: unsafe { mem::zeroed() },
            accept_buf: [0; 2 * ADDR_SLOT],
        })
    }
}

/// Resolve a Winsock extension function once and cache it.
fn wsa_fn(cache: &OnceLock<usize>, sock: RawSock, guid: GUID) -> PortResult<usize> {
    if let Some(&f) = cache.get() {
        return Ok(f);
    }
    let mut fptr: usize = 0;
    let mut returned: u32 = 0;
    let ret = unsafe {
        WSAIoctl(
            sock,
            SIO_GET_EXTENSION_FUNCTION_POINTER,
            &guid as *const GUID as *const _,
            mem::size_of::<GUID>() as u32,
            &mut fptr as *mut usize as *mut _,
            mem::size_of::<usize>() as u32,
            &mut returned,
            ptr::null_mut(),
            None,
        )
    };
    if ret == SOCKET_ERROR {
        return Err(PortError::Os(net::errno()));
    }
    if fptr == 0 {
        return Err(PortError::Unsupported("winsock extension function"));
    }
    let _ = cache.set(fptr);
    Ok(fptr)
}

pub struct IocpPort {
    port: HANDLE,
}

// A completion port handle may be used from any thread.
unsafe impl Send for IocpPort {}
unsafe impl Sync for IocpPort {}

impl IocpPort {
    pub fn new(concurrency: u32) -> PortResult<Self> {
        net::startup()?;
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, concurrency) };
        if port == 0 {
            return Err(PortError::Os(unsafe { GetLastError() } as i32));
        }
        Ok(Self { port })
    }

    /// Hand `op` to the OS. On immediate failure the box is reclaimed.
    unsafe fn start(&self, op: Box<OverlappedOp>, issue: impl FnOnce(*mut OverlappedOp) -> i32) -> PortResult<()> {
        let raw = Box::into_raw(op);
        let ok = issue(raw);
        if ok == 0 {
            let err = WSAGetLastError();
            if err != WSA_IO_PENDING {
                drop(Box::from_raw(raw));
                return Err(PortError::Os(err));
            }
        }
        Ok(())
    }

    fn entry_for(&self, e: &OVERLAPPED_ENTRY) -> CompletionEntry {
        if e.lpOverlapped.is_null() {
            return CompletionEntry::posted(e.lpCompletionKey as u64);
        }
        let op = unsafe { Box::from_raw(e.lpOverlapped as *mut OverlappedOp) };
        let mut bytes: u32 = 0;
        let mut flags: u32 = 0;
        let ok = unsafe { WSAGetOverlappedResult(op.sock, &op.overlapped, &mut bytes, 0, &mut flags) };
        if ok == 0 {
            let error = unsafe { WSAGetLastError() } as u32;
            return CompletionEntry::io(op.token, e.dwNumberOfBytesTransferred, error);
        }
        CompletionEntry::io(op.token, bytes, 0)
    }
}

impl Drop for IocpPort {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.port) };
    }
}

impl CompletionPort for IocpPort {
    fn name(&self) -> &'static str {
        "iocp"
    }

    fn associate(&self, sock: RawSock, key: u32) -> PortResult<()> {
        let h = unsafe { CreateIoCompletionPort(sock as HANDLE, self.port, key as usize, 0) };
        if h == 0 {
            return Err(PortError::Os(unsafe { GetLastError() } as i32));
        }
        Ok(())
    }

    unsafe fn submit(&self, sock: RawSock, token: OpToken, op: Operation) -> PortResult<()> {
        let mut rec = OverlappedOp::boxed(sock, token);
        match op {
            Operation::Connect { addr } => {
                let f = wsa_fn(&CONNECT_EX, sock, WSAID_CONNECTEX)?;
                let connect_ex: LPFN_CONNECTEX = mem::transmute(f);
                let connect_ex = connect_ex.ok_or(PortError::Unsupported("ConnectEx"))?;
                let (storage, len) = net::sockaddr_from(&addr);
                rec.addr = storage;
                self.start(rec, |raw| {
                    let mut sent = 0;
                    connect_ex(
                        sock,
                        &(*raw).addr as *const SOCKADDR_STORAGE as *const SOCKADDR,
                        len,
                        ptr::null(),
                        0,
                        &mut sent,
                        &mut (*raw).overlapped,
                    )
                })?;
            }
            Operation::Accept { accept_into } => {
                let f = wsa_fn(&ACCEPT_EX, sock, WSAID_ACCEPTEX)?;
                let accept_ex: LPFN_ACCEPTEX = mem::transmute(f);
                let accept_ex = accept_ex.ok_or(PortError::Unsupported("AcceptEx"))?;
                self.start(rec, |raw| {
                    let mut received = 0;
                    accept_ex(
                        sock,
                        accept_into,
                        (*raw).accept_buf.as_mut_ptr() as *mut _,
                        0,
                        ADDR_SLOT as u32,
                        ADDR_SLOT as u32,
                        &mut received,
                        &mut (*raw).overlapped,
                    )
                })?;
            }
            Operation::Recv { buf, len } => {
                rec.wsabuf = WSABUF { len: len as u32, buf };
                self.start(rec, |raw| {
                    let mut flags: u32 = 0;
                    let ret = WSARecv(
                        sock,
                        &(*raw).wsabuf,
                        1,
                        ptr::null_mut(),
                        &mut flags,
                        &mut (*raw).overlapped,
                        None,
                    );
                    (ret != SOCKET_ERROR) as i32
                })?;
            }
            Operation::Send { buf, len } => {
                rec.wsabuf = WSABUF {
                    len: len as u32,
                    buf: buf as *mut u8,
                };
                self.start(rec, |raw| {
                    let ret = WSASend(
                        sock,
                        &(*raw).wsabuf,
                        1,
                        ptr::null_mut(),
                        0,
                        &mut (*raw).overlapped,
                        None,
                    );
                    (ret != SOCKET_ERROR) as i32
                })?;
            }
        }
        ktrace!("iocp: {} on socket {}", op.name(), sock);
        Ok(())
    }

    fn post(&self, key: u64) -> PortResult<()> {
        let ok = unsafe { PostQueuedCompletionStatus(self.port, 0, key as usize, ptr::null_mut()) };
        if ok == 0 {
            return Err(PortError::Os(unsafe { GetLastError() } as i32));
        }
        Ok(())
    }

    fn wait(&self, out: &mut [CompletionEntry]) -> PortResult<usize> {
        let mut raw: [OVERLAPPED_ENTRY; MAX_ENTRIES] = unsafe { mem::zeroed() };
        let want = out.len().min(MAX_ENTRIES);
        if want == 0 {
            return Ok(0);
        }
        let mut removed: u32 = 0;
        let ok = unsafe {
            GetQueuedCompletionStatusEx(self.port, raw.as_mut_ptr(), want as u32, &mut removed, INFINITE, 0)
        };
        if ok == 0 {
            return Err(PortError::Os(unsafe { GetLastError() } as i32));
        }
        for (slot, e) in out.iter_mut().zip(&raw[..removed as usize]) {
            *slot = self.entry_for(e);
        }
        Ok(removed as usize)
    }

    fn release(&self, sock: RawSock) {
        // Aborted operations complete with ERROR_OPERATION_ABORTED.
        unsafe { CancelIoEx(sock as HANDLE, ptr::null()) };
    }

    fn complete_connect(&self, sock: RawSock) -> PortResult<()> {
        let ret = unsafe { setsockopt(sock, SOL_SOCKET, SO_UPDATE_CONNECT_CONTEXT, ptr::null(), 0) };
        if ret == SOCKET_ERROR {
            return Err(PortError::Os(net::errno()));
        }
        Ok(())
    }

    fn complete_accept(&self, listener: RawSock, accepted: RawSock) -> PortResult<()> {
        let ret = unsafe {
            setsockopt(
                accepted,
                SOL_SOCKET,
                SO_UPDATE_ACCEPT_CONTEXT,
                &listener as *const RawSock as *const u8,
                mem::size_of::<RawSock>() as i32,
            )
        };
        if ret == SOCKET_ERROR {
            return Err(PortError::Os(net::errno()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    #[test]
    fn test_post_roundtrip() {
        conformance::post_roundtrip(&IocpPort::new(0).unwrap());
    }

    #[test]
    fn test_accept_connect_echo() {
        conformance::accept_connect_echo(&IocpPort::new(0).unwrap());
    }

    #[test]
    fn test_release_cancels_recv() {
        conformance::release_cancels_recv(&IocpPort::new(0).unwrap());
    }
}
