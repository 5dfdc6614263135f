//! Behaviour every `CompletionPort` must share, run against each backend
//! from its own test module.

use std::net::SocketAddr;

use ovsock_core::{
    AddressFamily, CompletionEntry, CompletionPort, OpToken, Operation, RawSock, SocketType,
};

use crate::net;

const SERVER_KEY: u32 = 1;
const CLIENT_KEY: u32 = 2;

/// Wait until `n` operation completions (posted entries excluded) arrive.
pub fn collect(port: &dyn CompletionPort, n: usize) -> Vec<CompletionEntry> {
    let mut got = Vec::new();
    let mut batch = [CompletionEntry::EMPTY; 8];
    while got.len() < n {
        let k = port.wait(&mut batch).unwrap();
        got.extend(batch[..k].iter().filter(|e| e.token.is_some()).copied());
    }
    got
}

fn find(entries: &[CompletionEntry], token: OpToken) -> CompletionEntry {
    *entries
        .iter()
        .find(|e| e.token == Some(token))
        .unwrap_or_else(|| panic!("no completion for {:?} in {:?}", token, entries))
}

struct Pair {
    listener: RawSock,
    server: RawSock,
    client: RawSock,
}

impl Pair {
    fn close(self) {
        for s in [self.client, self.server, self.listener] {
            let _ = net::close(s);
        }
    }
}

fn connected_pair(port: &dyn CompletionPort) -> Pair {
    let listener = net::socket(AddressFamily::Inet, SocketType::Stream).unwrap();
    net::bind(listener, &"127.0.0.1:0".parse().unwrap()).unwrap();
    net::listen(listener, net::MAX_BACKLOG).unwrap();
    let addr: SocketAddr = net::local_addr(listener).unwrap();
    port.associate(listener, SERVER_KEY).unwrap();

    let server = net::socket(AddressFamily::Inet, SocketType::Stream).unwrap();
    port.associate(server, SERVER_KEY).unwrap();

    let client = net::socket(AddressFamily::Inet, SocketType::Stream).unwrap();
    net::bind(client, &AddressFamily::Inet.unspecified()).unwrap();
    port.associate(client, CLIENT_KEY).unwrap();

    let accept_tok = OpToken::new(SERVER_KEY, 0);
    let connect_tok = OpToken::new(CLIENT_KEY, 0);
    unsafe {
        port.submit(listener, accept_tok, Operation::Accept { accept_into: server })
            .unwrap();
        port.submit(client, connect_tok, Operation::Connect { addr }).unwrap();
    }

    let done = collect(port, 2);
    let accepted = find(&done, accept_tok);
    let connected = find(&done, connect_tok);
    assert_eq!(accepted.error, 0, "accept failed: {}", accepted.error);
    assert_eq!(connected.error, 0, "connect failed: {}", connected.error);
    assert_eq!(accepted.key, SERVER_KEY as u64);
    assert_eq!(connected.key, CLIENT_KEY as u64);

    port.complete_accept(listener, server).unwrap();
    port.complete_connect(client).unwrap();

    Pair {
        listener,
        server,
        client,
    }
}

pub fn post_roundtrip(port: &dyn CompletionPort) {
    port.post(42).unwrap();
    port.post(1 << 40).unwrap();
    let mut batch = [CompletionEntry::EMPTY; 4];
    let mut keys = Vec::new();
    while keys.len() < 2 {
        let n = port.wait(&mut batch).unwrap();
        for e in &batch[..n] {
            assert!(e.token.is_none());
            keys.push(e.key);
        }
    }
    keys.sort_unstable();
    assert_eq!(keys, vec![42, 1 << 40]);
}

pub fn accept_connect_echo(port: &dyn CompletionPort) {
    let pair = connected_pair(port);
    assert_eq!(
        net::peer_addr(pair.server).unwrap(),
        net::local_addr(pair.client).unwrap()
    );

    let out = b"ping".to_vec();
    let mut inbuf = vec![0u8; 64];
    let send_tok = OpToken::new(CLIENT_KEY, 1);
    let recv_tok = OpToken::new(SERVER_KEY, 1);
    unsafe {
        port.submit(pair.server, recv_tok, Operation::Recv { buf: inbuf.as_mut_ptr(), len: inbuf.len() })
            .unwrap();
        port.submit(pair.client, send_tok, Operation::Send { buf: out.as_ptr(), len: out.len() })
            .unwrap();
    }

    let done = collect(port, 2);
    let sent = find(&done, send_tok);
    let recvd = find(&done, recv_tok);
    assert_eq!((sent.error, sent.bytes), (0, 4));
    assert_eq!(recvd.error, 0);
    assert_eq!(&inbuf[..recvd.bytes as usize], b"ping");

    pair.close();
}

pub fn release_cancels_recv(port: &dyn CompletionPort) {
    let pair = connected_pair(port);

    let mut inbuf = vec![0u8; 64];
    let recv_tok = OpToken::new(CLIENT_KEY, 5);
    unsafe {
        port.submit(pair.client, recv_tok, Operation::Recv { buf: inbuf.as_mut_ptr(), len: inbuf.len() })
            .unwrap();
    }
    let _ = net::shutdown(pair.client);
    port.release(pair.client);

    let done = collect(port, 1);
    let e = find(&done, recv_tok);
    assert!(e.error != 0 || e.bytes == 0, "recv survived release: {:?}", e);

    pair.close();
}
