//! Process-wide completion infrastructure: one completion port, a fixed
//! pool of worker threads, and the registry that routes completions to
//! the socket that owns them.
//!
//! Lifecycle is reference counted. Every socket constructed against a
//! runtime holds one reference. The first reference opens the port and
//! spawns the workers, which stay parked until some socket is successfully
//! created. Dropping the last reference posts one shutdown sentinel per
//! worker, joins them, and releases the port. A later reference starts a
//! fresh generation.
//!
//! ```ignore
//! let rt = Runtime::new(RuntimeConfig::from_env());
//! let server = ServerSocket::with_runtime(rt.clone());
//! let client = ClientSocket::with_runtime(rt.clone());
//! ```

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::thread::{self, JoinHandle};

use ovsock_core::{kerror, kinfo, kwarn, CompletionPort, OpToken, PortError, PortResult, MAX_OWNER_KEY};
use ovsock_module::open_port;

use crate::config::RuntimeConfig;
use crate::{lock, read, write, worker};

/// A socket that owns completions.
///
/// Implemented by the client and server cores. The runtime keeps a strong
/// reference to each registered target until the target unregisters, so a
/// socket's pending buffers outlive its public handle.
pub trait CompletionTarget: Send + Sync {
    /// One of this target's operations finished. `token.slot()` names the
    /// context in the target's pending set.
    fn on_completion(&self, token: OpToken, bytes: u32, error: u32);

    /// Operations submitted and not yet handled.
    fn pending_ops(&self) -> usize;
}

/// Snapshot of runtime counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Generations started (port opened, workers spawned)
    pub starts: u64,
    /// Generations torn down
    pub teardowns: u64,
    /// Live socket references
    pub refs: usize,
    /// Worker threads of the current generation
    pub workers: usize,
    /// Worker threads alive, including one still finishing a handler that
    /// tore its own generation down
    pub threads: usize,
    pub running: bool,
    /// Sockets currently registered for completions
    pub registered: usize,
}

#[derive(Default)]
struct RuntimeState {
    workers: Vec<JoinHandle<()>>,
    /// Stop flag of the current generation, shared with its workers only.
    stop: Arc<AtomicBool>,
    refs: usize,
    starts: u64,
    teardowns: u64,
}

/// Worker park gate. Separate from `state` so parked workers can leave
/// while teardown holds the lifecycle lock.
#[derive(Default)]
struct Gate {
    resumed: bool,
    stopping: bool,
}

pub struct Runtime {
    config: RuntimeConfig,
    state: Mutex<RuntimeState>,
    gate: Mutex<Gate>,
    gate_cv: Condvar,
    running: AtomicBool,
    live_workers: AtomicUsize,
    port: RwLock<Option<Arc<dyn CompletionPort>>>,
    registry: RwLock<HashMap<u32, Arc<dyn CompletionTarget>>>,
    next_key: AtomicU32,
    shutdown_key: u64,
}

/// Sentinel completion key, drawn once per process. Above every owner key
/// and below the backends' tag bits.
fn shutdown_key() -> u64 {
    static KEY: OnceLock<u64> = OnceLock::new();
    *KEY.get_or_init(|| rand::random_range((1u64 << 40)..(1u64 << 62)))
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        if let Err(e) = config.validate() {
            kwarn!("runtime config: {}; using defaults where needed", e);
        }
        Arc::new(Self {
            config,
            state: Mutex::new(RuntimeState::default()),
            gate: Mutex::new(Gate::default()),
            gate_cv: Condvar::new(),
            running: AtomicBool::new(false),
            live_workers: AtomicUsize::new(0),
            port: RwLock::new(None),
            registry: RwLock::new(HashMap::new()),
            next_key: AtomicU32::new(1),
            shutdown_key: shutdown_key(),
        })
    }

    /// The process-wide runtime behind `ClientSocket::new` and
    /// `ServerSocket::new`, configured from the environment.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Runtime::new(RuntimeConfig::from_env()))
            .clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Take a reference, starting the port and workers if this is the first.
    pub fn acquire(self: &Arc<Self>) -> PortResult<()> {
        let mut st = lock(&self.state);
        if st.refs == 0 {
            self.start(&mut st)?;
        }
        st.refs += 1;
        Ok(())
    }

    /// Drop a reference. The last one tears everything down.
    pub fn release(&self) {
        let mut st = lock(&self.state);
        if st.refs == 0 {
            kwarn!("runtime release without a matching acquire");
            return;
        }
        st.refs -= 1;
        if st.refs == 0 {
            self.teardown(&mut st);
        }
    }

    fn start(self: &Arc<Self>, st: &mut RuntimeState) -> PortResult<()> {
        let port = open_port(self.config.backend, self.config.ring_entries)?;
        *lock(&self.gate) = Gate::default();
        let stop = Arc::new(AtomicBool::new(false));
        st.stop = Arc::clone(&stop);

        let n = self.config.effective_workers();
        for index in 0..n {
            let rt = Arc::clone(self);
            let port = Arc::clone(&port);
            let stop = Arc::clone(&stop);
            let spawned = thread::Builder::new()
                .name(format!("ovsock-worker-{}", index))
                .spawn(move || worker::run(rt, port, stop));
            match spawned {
                Ok(h) => st.workers.push(h),
                Err(e) => kerror!("failed to spawn worker {}: {}", index, e),
            }
        }
        if st.workers.is_empty() {
            stop.store(true, Ordering::SeqCst);
            lock(&self.gate).stopping = true;
            return Err(PortError::Unsupported("no worker threads"));
        }

        *write(&self.port) = Some(port);
        st.starts += 1;
        kinfo!("runtime started: {} workers", st.workers.len());
        Ok(())
    }

    fn teardown(&self, st: &mut RuntimeState) {
        st.stop.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        {
            let mut gate = lock(&self.gate);
            gate.stopping = true;
        }
        self.gate_cv.notify_all();

        let port = write(&self.port).take();
        if let Some(port) = &port {
            for _ in 0..st.workers.len() {
                if let Err(e) = port.post(self.shutdown_key) {
                    kerror!("failed to post shutdown sentinel: {}", e);
                }
            }
        }

        let me = thread::current().id();
        for h in st.workers.drain(..) {
            // Teardown triggered from inside a handler: that worker exits on
            // its own sentinel once the handler returns.
            if h.thread().id() == me {
                continue;
            }
            if h.join().is_err() {
                kerror!("worker thread panicked");
            }
        }

        // Closed sockets whose aborted operations never came back still own
        // buffers the OS may write into. Leak them rather than free.
        let targets: Vec<_> = write(&self.registry).drain().map(|(_, t)| t).collect();
        let mut leaked = 0;
        for t in targets {
            if t.pending_ops() > 0 {
                leaked += 1;
                mem::forget(t);
            }
        }
        if leaked > 0 {
            kwarn!("runtime stopped with {} sockets still holding operations", leaked);
        }

        drop(port);
        st.teardowns += 1;
        kinfo!("runtime stopped");
    }

    /// Let parked workers start draining. Idempotent.
    pub fn resume(&self) {
        let mut gate = lock(&self.gate);
        if gate.resumed || gate.stopping {
            return;
        }
        gate.resumed = true;
        self.running.store(true, Ordering::SeqCst);
        drop(gate);
        self.gate_cv.notify_all();
    }

    /// Block a fresh worker until `resume` or teardown. `true` to run.
    pub(crate) fn park_until_resumed(&self) -> bool {
        let mut gate = lock(&self.gate);
        while !gate.resumed && !gate.stopping {
            gate = self.gate_cv.wait(gate).unwrap_or_else(|p| p.into_inner());
        }
        gate.resumed
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn worker_entered(&self) {
        self.live_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn worker_exited(&self) {
        self.live_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn shutdown_key_value(&self) -> u64 {
        self.shutdown_key
    }

    /// The current generation's port, if started.
    pub fn port(&self) -> Option<Arc<dyn CompletionPort>> {
        read(&self.port).clone()
    }

    /// Worker threads a started runtime runs.
    pub fn worker_count(&self) -> usize {
        self.config.effective_workers()
    }

    /// Register a new target under a fresh owner key.
    pub(crate) fn register<T, F>(&self, make: F) -> Arc<T>
    where
        T: CompletionTarget + 'static,
        F: FnOnce(u32) -> Arc<T>,
    {
        let mut map = write(&self.registry);
        let key = loop {
            let k = self.next_key.fetch_add(1, Ordering::Relaxed) & MAX_OWNER_KEY;
            if k != 0 && !map.contains_key(&k) {
                break k;
            }
        };
        let target = make(key);
        map.insert(key, target.clone() as Arc<dyn CompletionTarget>);
        target
    }

    pub(crate) fn unregister(&self, key: u32) {
        write(&self.registry).remove(&key);
    }

    pub(crate) fn target(&self, key: u32) -> Option<Arc<dyn CompletionTarget>> {
        read(&self.registry).get(&key).cloned()
    }

    pub fn stats(&self) -> RuntimeStats {
        let st = lock(&self.state);
        RuntimeStats {
            starts: st.starts,
            teardowns: st.teardowns,
            refs: st.refs,
            workers: st.workers.len(),
            threads: self.live_workers.load(Ordering::SeqCst),
            running: self.is_running(),
            registered: read(&self.registry).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn rt() -> Arc<Runtime> {
        Runtime::new(RuntimeConfig::new().num_workers(2).min_workers(1))
    }

    struct Counter {
        hits: AtomicUsize,
    }

    impl CompletionTarget for Counter {
        fn on_completion(&self, _token: OpToken, _bytes: u32, _error: u32) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }

        fn pending_ops(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_refcount_single_start_and_teardown() {
        let rt = rt();
        for _ in 0..3 {
            rt.acquire().unwrap();
        }
        let s = rt.stats();
        assert_eq!((s.starts, s.teardowns, s.refs), (1, 0, 3));
        assert_eq!(s.workers, 2);
        assert!(!s.running, "workers stay parked until resumed");

        rt.resume();
        rt.resume();
        assert!(rt.is_running());

        for _ in 0..3 {
            rt.release();
        }
        let s = rt.stats();
        assert_eq!((s.starts, s.teardowns, s.refs, s.workers), (1, 1, 0, 0));
        assert!(!s.running);
        assert!(rt.port().is_none());
    }

    #[test]
    fn test_restart_after_teardown() {
        let rt = rt();
        rt.acquire().unwrap();
        rt.release();
        rt.acquire().unwrap();
        rt.resume();
        rt.release();
        let s = rt.stats();
        assert_eq!((s.starts, s.teardowns), (2, 2));
    }

    #[test]
    fn test_restart_while_handler_tears_down() {
        use crate::client::ClientSocket;
        use std::net::TcpListener;
        use std::sync::mpsc;
        use std::time::{Duration, Instant};

        let rt = rt();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        // The refused connect closes the only socket from a worker, so the
        // first generation is torn down inside that worker's handler.
        let client = ClientSocket::with_runtime(rt.clone());
        let (tx, rx) = mpsc::channel();
        client.events().on_close.set(move |_| tx.send(()).unwrap());
        assert!(client.connect("127.0.0.1", port));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(rt.stats().teardowns, 1);

        // A new generation runs before the old worker reads its sentinel.
        rt.acquire().unwrap();
        rt.resume();
        let settled = |want: usize| {
            let deadline = Instant::now() + Duration::from_secs(5);
            while rt.stats().threads != want && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            rt.stats().threads == want
        };
        assert!(settled(2), "old worker still alive: {:?}", rt.stats());

        rt.release();
        assert!(settled(0));
        assert_eq!(rt.stats().starts, 2);
    }

    #[test]
    fn test_unmatched_release_is_ignored() {
        let rt = rt();
        rt.release();
        assert_eq!(rt.stats().teardowns, 0);
    }

    #[test]
    fn test_register_keys_unique_and_bounded() {
        let rt = rt();
        rt.next_key.store(MAX_OWNER_KEY, Ordering::Relaxed);
        let a = rt.register(|_| Arc::new(Counter { hits: AtomicUsize::new(0) }));
        let mut keys = Vec::new();
        for _ in 0..3 {
            rt.register(|k| {
                keys.push(k);
                Arc::new(Counter { hits: AtomicUsize::new(0) })
            });
        }
        assert!(keys.iter().all(|&k| k != 0 && k <= MAX_OWNER_KEY));
        assert_eq!(rt.stats().registered, 4);
        drop(a);
        for k in keys {
            rt.unregister(k);
        }
        assert_eq!(rt.stats().registered, 1);
    }

    #[test]
    fn test_bare_post_is_not_dispatched() {
        let rt = rt();
        rt.acquire().unwrap();
        rt.resume();
        let mut key = 0;
        let target = rt.register(|k| {
            key = k;
            Arc::new(Counter { hits: AtomicUsize::new(0) })
        });
        let port = rt.port().unwrap();
        // A bare post under the owner key is not an operation; workers skip it.
        port.post(key as u64).unwrap();
        assert!(rt.target(key).is_some());
        rt.unregister(key);
        rt.release();
        assert_eq!(target.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_key_range() {
        let k = rt().shutdown_key_value();
        assert!(k >= 1 << 40 && k < 1 << 62);
        assert!(k > MAX_OWNER_KEY as u64);
    }
}
