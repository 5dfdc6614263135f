//! ovsock Echo
//!
//! TCP echo server and ping client on completion-port sockets.
//!
//! Usage:
//!     cargo build --release -p ovsock-echo
//!     ./target/release/ovsock-echo server [port] [host]
//!     ./target/release/ovsock-echo ping <host> <port> [count]
//!
//! Environment:
//!     OVSOCK_WORKERS=8 OVSOCK_BACKEND=epoll OVSOCK_LOG_LEVEL=debug
//!
//! Test with:
//!     echo "hello" | nc localhost 9999

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use ovsock::{ClientSocket, FailureScope, Runtime, ServerConfig, ServerSocket};
use ovsock_core::{kerror, kinfo, kprintln};

static STOP: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn handle_sigint(_: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_signals() {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }
}

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    disconnects: AtomicU64,
    bytes: AtomicU64,
}

fn run_server(host: &str, port: u16) -> i32 {
    install_signals();
    let stats = Arc::new(Stats::default());
    // One misbehaving peer must not take the echo service down.
    let server = ServerSocket::with_config(
        Runtime::global(),
        ServerConfig::new().failure_scope(FailureScope::Client),
    );

    server.events().on_listening.set(|ev| {
        kinfo!("ovsock-echo: listening on {}:{}", ev.host, ev.port);
    });
    let s = stats.clone();
    server.events().on_connect.set(move |ev| {
        s.accepts.fetch_add(1, Ordering::Relaxed);
        match ev.peer {
            Some(peer) => kinfo!("ovsock-echo: {} connected from {}", ev.client, peer),
            None => kinfo!("ovsock-echo: {} connected", ev.client),
        }
    });
    let s = stats.clone();
    server.events().on_data.set(move |ev| {
        s.bytes.fetch_add(ev.data.len() as u64, Ordering::Relaxed);
        ev.server.send(&ev.data, ev.client);
    });
    let s = stats.clone();
    server.events().on_disconnect.set(move |ev| {
        s.disconnects.fetch_add(1, Ordering::Relaxed);
        kinfo!("ovsock-echo: {} disconnected ({})", ev.client, ev.reason);
    });

    if !server.listen(host, port) {
        kerror!("ovsock-echo: cannot listen on {}:{}", host, port);
        return 1;
    }

    let start = Instant::now();
    let mut last = start;
    while !STOP.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
        if last.elapsed() >= Duration::from_secs(5) {
            last = Instant::now();
            let rt = Runtime::global().stats();
            kinfo!(
                "ovsock-echo: clients={} accepts={} bytes={} pending={} workers={}",
                server.client_count(),
                stats.accepts.load(Ordering::Relaxed),
                stats.bytes.load(Ordering::Relaxed),
                server.pending_ops(),
                rt.workers
            );
        }
    }

    kprintln!("\novsock-echo: shutting down...");
    server.close();
    kprintln!(
        "ovsock-echo: done. {} accepts, {} disconnects, {} bytes in {:.1}s",
        stats.accepts.load(Ordering::Relaxed),
        stats.disconnects.load(Ordering::Relaxed),
        stats.bytes.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
    0
}

fn run_ping(host: &str, port: u16, count: usize) -> i32 {
    let client = ClientSocket::new();
    let (tx, rx) = mpsc::channel::<Option<Vec<u8>>>();

    client.events().on_connect.set(|ev| {
        kinfo!("ovsock-echo: connected to {}:{}", ev.host, ev.port);
    });
    let data_tx = tx.clone();
    client.events().on_data.set(move |ev| {
        let _ = data_tx.send(Some(ev.data.clone()));
    });
    client.events().on_error.set(|ev| {
        kerror!("ovsock-echo: {} failed: {}", ev.op, ev.message());
    });
    client.events().on_close.set(move |ev| {
        kinfo!("ovsock-echo: connection closed ({})", ev.reason);
        let _ = tx.send(None);
    });

    if !client.connect(host, port) {
        kerror!("ovsock-echo: cannot connect to {}:{}", host, port);
        return 1;
    }

    let mut failures = 0;
    for seq in 0..count {
        let msg = format!("ping {}", seq);
        let sent = Instant::now();
        // The first send may race the connect; retry until it is accepted.
        while !client.send(msg.as_bytes()) {
            if !client.is_open() || sent.elapsed() > Duration::from_secs(5) {
                kerror!("ovsock-echo: send failed");
                return 1;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let mut echoed = Vec::new();
        while echoed.len() < msg.len() {
            match rx.recv_timeout(Duration::from_secs(5)) {
                Ok(Some(chunk)) => echoed.extend_from_slice(&chunk),
                Ok(None) | Err(_) => {
                    kerror!("ovsock-echo: no reply to '{}'", msg);
                    return 1;
                }
            }
        }
        if echoed == msg.as_bytes() {
            kprintln!("{} from {}:{} time={:?}", msg, host, port, sent.elapsed());
        } else {
            failures += 1;
            kprintln!("{}: mismatched reply {:?}", msg, String::from_utf8_lossy(&echoed));
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    client.close();
    if failures > 0 {
        1
    } else {
        0
    }
}

fn usage() -> i32 {
    eprintln!("usage: ovsock-echo server [port] [host]");
    eprintln!("       ovsock-echo ping <host> <port> [count]");
    2
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let code = match args.get(1).map(String::as_str) {
        Some("server") => {
            let port: u16 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(9999);
            let host = args.get(3).map(String::as_str).unwrap_or("0.0.0.0");
            run_server(host, port)
        }
        Some("ping") => match (args.get(2), args.get(3).and_then(|s| s.parse().ok())) {
            (Some(host), Some(port)) => {
                let count = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(4);
                run_ping(host, port, count)
            }
            _ => usage(),
        },
        _ => usage(),
    };
    std::process::exit(code);
}
