//! Cluster supervisor (C7): master/worker process model sharing a
//! scheme's listening socket, duplex IPC, and crash auto-restart.
//! POSIX-only; any attempt to use it elsewhere reports
//! `ErrorKind::OsBroken` via a `#[cfg(unix)]`/`#[cfg(not(unix))]` split
//! rather than faking the behaviour.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info, warn};

use crate::config::ClusterTransfer;
use crate::error::{Error, ErrorKind, Result};
use crate::metrics;

/// Clamps a requested worker count: `0` or `1` forces single-process
/// mode; anything above `2 * ncpu` is clamped to `ncpu`.
pub fn clamp_worker_count(requested: usize, ncpu: usize) -> usize {
    if requested <= 1 {
        return requested.min(1);
    }
    if requested > 2 * ncpu {
        ncpu.max(1)
    } else {
        requested
    }
}

/// Events the supervisor's reap loop surfaces to the application.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A worker exited; `status` is the raw `waitpid` status.
    Exit { scheme_id: u64, pid: i32, status: i32 },
    /// A worker was auto-restarted: `new_pid` replaces `old_pid`.
    Rebase { scheme_id: u64, new_pid: i32, old_pid: i32 },
    /// An IPC message arrived on `pid`'s channel (or, from a child's
    /// perspective, from the master — `pid` is then the master's, which
    /// workers address as `0`).
    Message { scheme_id: u64, pid: i32, data: Vec<u8> },
}

/// One worker's duplex IPC channel, owned by the master.
struct Worker {
    pid: i32,
    stream: Mutex<UnixStream>,
}

/// The master's view of one scheme's worker pool.
struct Pool {
    desired: usize,
    auto_restart: bool,
    transfer: ClusterTransfer,
    shm: Option<Arc<ShmRing>>,
    workers: Vec<Worker>,
    /// Retained so a crashed worker can be re-forked from [`ClusterSupervisor::poll_events`]
    /// without the caller having to keep its own listener handle around.
    listener: Option<std::net::TcpListener>,
}

/// Whatever a spawned child needs to begin serving: its end of the IPC
/// channel, a clone of the shared listening socket (each worker inherits
/// the fd and accepts from it directly), and, for the shared-memory
/// transfer mode, the ring it shares with the master.
pub struct WorkerContext {
    pub scheme_id: u64,
    pub stream: UnixStream,
    pub listener: Option<std::net::TcpListener>,
    pub shm: Option<Arc<ShmRing>>,
}

/// Forks and supervises worker processes across schemes. Only meaningful
/// on POSIX; see [`ClusterSupervisor::start`] for the Windows fallback.
pub struct ClusterSupervisor {
    pools: HashMap<u64, Pool>,
    incoming: Arc<Mutex<Vec<ClusterEvent>>>,
    child_exited: Arc<AtomicBool>,
    _sigchld: Option<SigchldWatch>,
}

impl Default for ClusterSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterSupervisor {
    pub fn new() -> Self {
        let child_exited = Arc::new(AtomicBool::new(false));
        let sigchld = SigchldWatch::install(child_exited.clone()).ok();
        Self {
            pools: HashMap::new(),
            incoming: Arc::new(Mutex::new(Vec::new())),
            child_exited,
            _sigchld: sigchld,
        }
    }

    /// Sets the desired worker count for `scheme_id`, clamped per
    /// [`clamp_worker_count`], and returns the clamped value.
    pub fn init(&mut self, scheme_id: u64, size: usize) -> usize {
        let ncpu = num_cpus::get();
        let clamped = clamp_worker_count(size, ncpu);
        self.pools.insert(
            scheme_id,
            Pool {
                desired: clamped,
                auto_restart: true,
                transfer: ClusterTransfer::Pipes,
                shm: None,
                workers: Vec::new(),
                listener: None,
            },
        );
        clamped
    }

    pub fn set_auto_restart(&mut self, scheme_id: u64, on: bool) {
        if let Some(pool) = self.pools.get_mut(&scheme_id) {
            pool.auto_restart = on;
        }
    }

    pub fn set_transfer(&mut self, scheme_id: u64, transfer: ClusterTransfer, bandwidth: Option<usize>) {
        if let Some(pool) = self.pools.get_mut(&scheme_id) {
            pool.transfer = transfer;
            if matches!(transfer, ClusterTransfer::SharedMemory) {
                let cap = bandwidth.unwrap_or(1 << 20);
                pool.shm = Some(Arc::new(ShmRing::new(cap).expect("mmap shared ring")));
            }
        }
    }

    /// Forks `size` children for `scheme_id` (as set by [`Self::init`]),
    /// each inheriting a clone of `listener`'s fd so the kernel load-balances
    /// `accept()` across them. `entry` runs inside each child with its
    /// [`WorkerContext`] and must not return normally —
    /// the child process exits as soon as it does. The parent process
    /// returns immediately after forking every child.
    #[cfg(unix)]
    pub fn start(
        &mut self,
        scheme_id: u64,
        listener: &std::net::TcpListener,
        entry: impl Fn(WorkerContext) + Clone,
    ) -> Result<()> {
        let desired = self
            .pools
            .get(&scheme_id)
            .map(|p| p.desired)
            .ok_or_else(|| Error::cluster("scheme not initialised via init()"))?;
        if desired <= 1 {
            return Ok(());
        }
        if let Some(pool) = self.pools.get_mut(&scheme_id) {
            pool.listener = Some(listener.try_clone().map_err(|e| Error::io(ErrorKind::Cluster, e))?);
        }
        for _ in 0..desired {
            self.spawn_one(scheme_id, listener, entry.clone())?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn start(
        &mut self,
        _scheme_id: u64,
        _listener: &std::net::TcpListener,
        _entry: impl Fn(WorkerContext) + Clone,
    ) -> Result<()> {
        warn!("cluster mode requested on a non-POSIX platform");
        Err(Error::Unsupported {
            kind: ErrorKind::OsBroken,
            operation: "cluster supervisor fork()".into(),
        })
    }

    #[cfg(unix)]
    fn spawn_one(&mut self, scheme_id: u64, listener: &std::net::TcpListener, entry: impl Fn(WorkerContext) + Clone) -> Result<i32> {
        let (master_end, child_end) = UnixStream::pair().map_err(|e| Error::io(ErrorKind::Cluster, e))?;
        let shm = self.pools.get(&scheme_id).and_then(|p| p.shm.clone());
        let listener_clone = listener.try_clone().map_err(|e| Error::io(ErrorKind::Cluster, e))?;

        // SAFETY: `fork()` is called before this process has spawned the
        // reactor threads that drive the rest of the crate; the child
        // immediately calls into `entry` and exits, never touching the
        // parent's event loop state.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(Error::io(ErrorKind::Cluster, io::Error::last_os_error())),
            0 => {
                drop(master_end);
                let ctx = WorkerContext {
                    scheme_id,
                    stream: child_end,
                    listener: Some(listener_clone),
                    shm,
                };
                entry(ctx);
                std::process::exit(0);
            }
            child_pid => {
                drop(child_end);
                info!(scheme_id, pid = child_pid, "forked cluster worker");
                if let Some(pool) = self.pools.get_mut(&scheme_id) {
                    pool.workers.push(Worker {
                        pid: child_pid,
                        stream: Mutex::new(master_end.try_clone().map_err(|e| Error::io(ErrorKind::Cluster, e))?),
                    });
                }
                self.spawn_reader(scheme_id, child_pid, master_end);
                Ok(child_pid)
            }
        }
    }

    /// Spawns a dedicated blocking reader thread per worker (mirrors the
    /// teacher's `BlockingQueue`-backed producer pattern in
    /// [`crate::buffer`]): length-prefixed frames read off the socket are
    /// pushed onto `self.incoming` for the caller to drain via [`Self::poll_events`].
    fn spawn_reader(&self, scheme_id: u64, pid: i32, stream: UnixStream) {
        let incoming = self.incoming.clone();
        thread::Builder::new()
            .name(format!("corewire-cluster-reader-{pid}"))
            .spawn(move || {
                let mut stream = stream;
                loop {
                    match read_frame(&mut stream) {
                        Ok(data) => {
                            incoming.lock().unwrap().push(ClusterEvent::Message { scheme_id, pid, data });
                        }
                        Err(_) => break,
                    }
                }
                debug!(scheme_id, pid, "cluster reader thread exiting (peer closed)");
            })
            .expect("spawn cluster reader thread");
    }

    /// Sends `buf` to one specific worker (master→child) or, from a child
    /// calling into its own `WorkerContext::stream` directly, child→master.
    pub fn send(&self, scheme_id: u64, pid: i32, buf: &[u8]) -> Result<()> {
        let pool = self.pools.get(&scheme_id).ok_or_else(|| Error::cluster("unknown scheme"))?;
        let worker = pool
            .workers
            .iter()
            .find(|w| w.pid == pid)
            .ok_or_else(|| Error::cluster("unknown worker pid"))?;
        let mut guard = worker.stream.lock().unwrap();
        write_frame(&mut guard, buf).map_err(|e| Error::io(ErrorKind::Cluster, e))
    }

    /// Master→all workers for `scheme_id`.
    pub fn broadcast(&self, scheme_id: u64, buf: &[u8]) -> Result<()> {
        let pool = self.pools.get(&scheme_id).ok_or_else(|| Error::cluster("unknown scheme"))?;
        for worker in &pool.workers {
            let mut guard = worker.stream.lock().unwrap();
            write_frame(&mut guard, buf).map_err(|e| Error::io(ErrorKind::Cluster, e))?;
        }
        Ok(())
    }

    /// Reaps any children that exited since the last call (non-blocking
    /// `waitpid(WNOHANG)`), auto-restarting per-scheme if configured, and
    /// returns the `Exit`/`Rebase` events produced plus any IPC `Message`s
    /// that arrived in the meantime.
    #[cfg(unix)]
    pub fn poll_events(&mut self, entry: impl Fn(WorkerContext) + Clone) -> Vec<ClusterEvent> {
        let mut out = std::mem::take(&mut *self.incoming.lock().unwrap());
        if !self.child_exited.swap(false, Ordering::SeqCst) {
            return out;
        }
        loop {
            let mut status = 0i32;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            let Some((scheme_id, auto_restart)) = self.find_scheme_for_pid(pid) else {
                continue;
            };
            if let Some(pool) = self.pools.get_mut(&scheme_id) {
                pool.workers.retain(|w| w.pid != pid);
            }
            out.push(ClusterEvent::Exit { scheme_id, pid, status });
            warn!(scheme_id, pid, status, "cluster worker exited");

            let restart_listener = self.pools.get(&scheme_id).and_then(|p| p.listener.as_ref()).and_then(|l| l.try_clone().ok());
            if auto_restart {
                let Some(restart_listener) = restart_listener else {
                    warn!(scheme_id, "cannot restart worker: no retained listener");
                    continue;
                };
                match self.spawn_one(scheme_id, &restart_listener, entry.clone()) {
                    Ok(new_pid) => {
                        metrics::CLUSTER_RESTARTS_TOTAL.inc();
                        out.push(ClusterEvent::Rebase {
                            scheme_id,
                            new_pid,
                            old_pid: pid,
                        });
                        info!(scheme_id, new_pid, old_pid = pid, "cluster worker rebased");
                    }
                    Err(e) => warn!(scheme_id, "failed to restart worker: {e}"),
                }
            }
        }
        out
    }

    #[cfg(not(unix))]
    pub fn poll_events(&mut self, _entry: impl Fn(WorkerContext) + Clone) -> Vec<ClusterEvent> {
        Vec::new()
    }

    fn find_scheme_for_pid(&self, pid: i32) -> Option<(u64, bool)> {
        self.pools
            .iter()
            .find(|(_, pool)| pool.workers.iter().any(|w| w.pid == pid))
            .map(|(sid, pool)| (*sid, pool.auto_restart))
    }

    pub fn worker_count(&self, scheme_id: u64) -> usize {
        self.pools.get(&scheme_id).map(|p| p.workers.len()).unwrap_or(0)
    }

    pub fn worker_pids(&self, scheme_id: u64) -> Vec<i32> {
        self.pools
            .get(&scheme_id)
            .map(|p| p.workers.iter().map(|w| w.pid).collect())
            .unwrap_or_default()
    }
}

/// Length-prefixed frame I/O over the IPC stream: a 4-byte big-endian
/// length followed by the payload.
fn write_frame(stream: &mut UnixStream, data: &[u8]) -> io::Result<()> {
    stream.write_all(&(data.len() as u32).to_be_bytes())?;
    stream.write_all(data)?;
    stream.flush()
}

fn read_frame(stream: &mut UnixStream) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Installs a `SIGCHLD` handler: a dedicated thread blocks on
/// `Signals::forever()` and flips an `AtomicBool` that
/// [`ClusterSupervisor::poll_events`] consults before paying for a
/// `waitpid` syscall on every call.
#[cfg(unix)]
struct SigchldWatch;

#[cfg(unix)]
impl SigchldWatch {
    fn install(flag: Arc<AtomicBool>) -> io::Result<Self> {
        use signal_hook::consts::SIGCHLD;
        use signal_hook::iterator::Signals;
        let mut signals = Signals::new([SIGCHLD])?;
        thread::Builder::new()
            .name("corewire-cluster-sigchld".into())
            .spawn(move || {
                for _ in signals.forever() {
                    flag.store(true, Ordering::SeqCst);
                }
            })?;
        Ok(Self)
    }
}

#[cfg(not(unix))]
struct SigchldWatch;
#[cfg(not(unix))]
impl SigchldWatch {
    fn install(_flag: Arc<AtomicBool>) -> io::Result<Self> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "cluster unsupported"))
    }
}

/// Lock-free SPSC byte ring over genuinely shared memory (`mmap`
/// `MAP_SHARED | MAP_ANONYMOUS`, inherited across `fork()`), used when a
/// scheme's cluster transfer mode is [`ClusterTransfer::SharedMemory`]. A
/// heap-allocated `Arc<[AtomicU8]>` would *not* do here: a child's
/// copy-on-write page would diverge from the parent's on first write, so
/// the backing bytes must live in an `mmap` region instead.
pub struct ShmRing {
    base: *mut u8,
    len: usize,
    capacity: usize,
}

unsafe impl Send for ShmRing {}
unsafe impl Sync for ShmRing {}

const SHM_HEADER_LEN: usize = 16; // head: u64, tail: u64

impl ShmRing {
    /// Maps `capacity` bytes of data (plus a small atomic head/tail
    /// header) as `MAP_SHARED`, so every process that `fork()`s after this
    /// call shares the same physical pages.
    #[cfg(unix)]
    pub fn new(capacity: usize) -> io::Result<Self> {
        let len = SHM_HEADER_LEN + capacity.max(1);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            base: ptr as *mut u8,
            len,
            capacity,
        })
    }

    #[cfg(not(unix))]
    pub fn new(_capacity: usize) -> io::Result<Self> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "shared memory ring requires POSIX mmap"))
    }

    fn head(&self) -> &AtomicUsize {
        unsafe { &*(self.base as *const AtomicUsize) }
    }

    fn tail(&self) -> &AtomicUsize {
        unsafe { &*(self.base.add(8) as *const AtomicUsize) }
    }

    fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.add(SHM_HEADER_LEN), self.capacity) }
    }

    #[allow(clippy::mut_from_ref)]
    fn data_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base.add(SHM_HEADER_LEN), self.capacity) }
    }

    /// Bytes currently queued, matching the producer/consumer offsets.
    pub fn len_queued(&self) -> usize {
        let head = self.head().load(Ordering::Acquire);
        let tail = self.tail().load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    /// Writes as much of `bytes` as fits before the ring is full, returning
    /// the number of bytes actually written.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let head = self.head().load(Ordering::Acquire);
        let tail = self.tail().load(Ordering::Relaxed);
        let free = self.capacity - (tail.wrapping_sub(head));
        let take = bytes.len().min(free);
        let data = self.data_mut();
        for (i, &b) in bytes[..take].iter().enumerate() {
            data[(tail + i) % self.capacity] = b;
        }
        self.tail().store(tail.wrapping_add(take), Ordering::Release);
        take
    }

    /// Reads up to `out.len()` queued bytes, returning the number read.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let head = self.head().load(Ordering::Relaxed);
        let tail = self.tail().load(Ordering::Acquire);
        let available = tail.wrapping_sub(head);
        let take = out.len().min(available);
        let data = self.data();
        for (i, slot) in out[..take].iter_mut().enumerate() {
            *slot = data[(head + i) % self.capacity];
        }
        self.head().store(head.wrapping_add(take), Ordering::Release);
        take
    }
}

impl Drop for ShmRing {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
        #[cfg(not(unix))]
        let _ = self.len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_forces_single_process_for_zero_or_one() {
        assert_eq!(clamp_worker_count(0, 8), 0);
        assert_eq!(clamp_worker_count(1, 8), 1);
    }

    #[test]
    fn clamp_caps_oversized_request_to_ncpu() {
        assert_eq!(clamp_worker_count(999, 4), 4);
    }

    #[test]
    fn clamp_leaves_reasonable_request_untouched() {
        assert_eq!(clamp_worker_count(3, 8), 3);
    }

    #[test]
    fn shm_ring_round_trips_bytes() {
        let ring = ShmRing::new(64).unwrap();
        let written = ring.write(b"hello world");
        assert_eq!(written, 11);
        let mut out = [0u8; 11];
        let read = ring.read(&mut out);
        assert_eq!(read, 11);
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn shm_ring_partial_write_when_full() {
        let ring = ShmRing::new(4);
        let ring = ring.unwrap();
        let written = ring.write(b"abcdefgh");
        assert_eq!(written, 4);
        assert_eq!(ring.len_queued(), 4);
    }

    #[cfg(unix)]
    #[test]
    #[ignore] // forking inside the multithreaded test harness is flaky; run with --ignored in isolation
    fn fork_worker_round_trips_ipc_frame() {
        let mut supervisor = ClusterSupervisor::new();
        supervisor.init(1, 2);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        supervisor
            .start(1, &listener, |ctx: WorkerContext| {
                let mut stream = ctx.stream;
                let mut len_buf = [0u8; 4];
                if stream.read_exact(&mut len_buf).is_ok() {
                    let len = u32::from_be_bytes(len_buf) as usize;
                    let mut buf = vec![0u8; len];
                    if stream.read_exact(&mut buf).is_ok() {
                        let _ = write_frame(&mut stream, &buf); // echo back
                    }
                }
            })
            .unwrap();

        assert_eq!(supervisor.worker_count(1), 2);
        let pids = supervisor.worker_pids(1);
        for pid in pids {
            supervisor.send(1, pid, b"ping").unwrap();
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let mut echoes = 0;
        while echoes < 2 && std::time::Instant::now() < deadline {
            let events = supervisor.poll_events(|_| {});
            for event in events {
                if let ClusterEvent::Message { data, .. } = event {
                    assert_eq!(data, b"ping");
                    echoes += 1;
                }
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(echoes, 2);

        for pid in supervisor.worker_pids(1) {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
}
