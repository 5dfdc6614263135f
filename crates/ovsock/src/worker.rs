//! Worker dispatch loop.
//!
//! Each worker blocks on the shared port for a batch of entries and routes
//! every operation completion to the target registered under its owner key.
//! Handlers run synchronously on the worker; a panicking handler is
//! contained to the completion that raised it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ovsock_core::{kdebug, kerror, ktrace, CompletionEntry, CompletionPort};

use crate::runtime::Runtime;

/// Pause after a failed wait before retrying.
const WAIT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Worker body. `stop` belongs to the generation that spawned this worker;
/// a sentinel ends the loop only once it is set.
pub(crate) fn run(rt: Arc<Runtime>, port: Arc<dyn CompletionPort>, stop: Arc<AtomicBool>) {
    let name = thread::current().name().unwrap_or("ovsock-worker").to_string();
    rt.worker_entered();
    if rt.park_until_resumed() {
        kdebug!("{}: draining {}", name, port.name());
        drain(&rt, &*port, &stop, &name);
    } else {
        kdebug!("{}: stopped before resume", name);
    }
    rt.worker_exited();
    kdebug!("{}: exit", name);
}

fn drain(rt: &Runtime, port: &dyn CompletionPort, stop: &AtomicBool, name: &str) {
    let shutdown_key = rt.shutdown_key_value();
    let mut batch = vec![CompletionEntry::EMPTY; rt.config().batch_size.max(1)];

    loop {
        let n = match port.wait(&mut batch) {
            Ok(n) => n,
            Err(e) => {
                kerror!("{}: wait failed: {}", name, e);
                thread::sleep(WAIT_RETRY_DELAY);
                continue;
            }
        };

        let mut sentinels = 0usize;
        for entry in &batch[..n] {
            match entry.token {
                None if entry.key == shutdown_key => sentinels += 1,
                None => ktrace!("{}: stray post {:#x}", name, entry.key),
                Some(token) => dispatch(rt, name, entry, token),
            }
        }

        if sentinels > 0 && stop.load(Ordering::SeqCst) {
            // Every other worker needs its own sentinel.
            for _ in 1..sentinels {
                if let Err(e) = port.post(shutdown_key) {
                    kerror!("{}: failed to re-post sentinel: {}", name, e);
                }
            }
            break;
        }
    }
}

fn dispatch(rt: &Runtime, name: &str, entry: &CompletionEntry, token: ovsock_core::OpToken) {
    let Some(target) = rt.target(token.owner()) else {
        kdebug!(
            "{}: completion for unregistered owner {} (slot {})",
            name,
            token.owner(),
            token.slot()
        );
        return;
    };
    ktrace!(
        "{}: owner {} slot {} bytes {} error {}",
        name,
        token.owner(),
        token.slot(),
        entry.bytes,
        entry.error
    );
    let done = panic::catch_unwind(AssertUnwindSafe(|| {
        target.on_completion(token, entry.bytes, entry.error)
    }));
    if done.is_err() {
        kerror!("{}: completion handler panicked (owner {})", name, token.owner());
    }
}
