//! Master/worker process cluster.
//!
//! The master forks `count` children per worker class and speaks CMP with
//! each of them over a pair of fd pairs (`pipe(2)` or a unix socketpair,
//! per the configured transfer). Supervision is SIGCHLD-driven: the signal
//! handler only reaps and records; everything observable happens on the
//! event base thread.

pub mod cmp;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::queue::SegQueue;
use log::{debug, error, warn};
use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::events::base::{EventBase, EventKind, EventMode};
use crate::events::event::{Event, EventType};
use crate::hash::{Cipher, Method};
use crate::net::socket::{self, Fd, INVALID_FD};

/// A child that dies younger than this aborts the whole cluster, to stop
/// crash-loop storms. Tunable via [`Cluster::crash_loop_window`].
pub const CRASH_LOOP_WINDOW_MS: u64 = 180_000;

/// Staging buffer for one `read(2)` on an IPC fd.
const STAGING_SIZE: usize = 64 * 1024;

/// What kind of fd pair carries the IPC bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transfer {
    #[default]
    Pipe,
    Ipc,
}

/// Lifecycle notifications delivered through the `process` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Start,
    Stop,
}

pub type MessageCallback = Arc<dyn Fn(u16, i32, &[u8]) + Send + Sync>;
pub type ProcessCallback = Arc<dyn Fn(u16, i32, ProcessEvent) + Send + Sync>;
pub type ExitCallback = Arc<dyn Fn(u16, i32, i32) + Send + Sync>;
pub type RebaseCallback = Arc<dyn Fn(u16, i32, i32) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    message: Option<MessageCallback>,
    process: Option<ProcessCallback>,
    exit: Option<ExitCallback>,
    rebase: Option<RebaseCallback>,
}

/// `(pid, status)` records pushed by the SIGCHLD handler and drained on the
/// event base thread. The handler itself only reaps, pushes and writes one
/// wakeup byte; no locks, no callbacks.
static REAPED: Lazy<SegQueue<(i32, i32)>> = Lazy::new(SegQueue::new);
static REAPER_WAKE_FD: AtomicI32 = AtomicI32::new(-1);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One live child as seen by the master, or the master-side endpoint as
/// seen by the child.
struct Broker {
    pid: i32,
    start_time_ms: u64,
    ended: bool,
    /// `[master_read, child_write]`
    mfds: [Fd; 2],
    /// `[child_read, master_write]`
    cfds: [Fd; 2],
    read_event: Option<Event>,
    write_event: Option<Event>,
    /// Bytes queued for the peer, drained on WRITE readiness.
    outbox: Vec<u8>,
    write_armed: bool,
}

impl Broker {
    fn new(mfds: [Fd; 2], cfds: [Fd; 2]) -> Self {
        Self {
            pid: 0,
            start_time_ms: 0,
            ended: false,
            mfds,
            cfds,
            read_event: None,
            write_event: None,
            outbox: Vec::new(),
            write_armed: false,
        }
    }

    fn stop_events(&mut self) {
        self.read_event = None;
        self.write_event = None;
    }

    fn close_fds(&mut self) {
        for fd in self.mfds.iter_mut().chain(self.cfds.iter_mut()) {
            if *fd != INVALID_FD {
                socket::close(*fd);
                *fd = INVALID_FD;
            }
        }
    }
}

/// Configuration template for a class of children.
struct Worker {
    count: u16,
    auto_restart: bool,
    working: bool,
    decoders: HashMap<Fd, cmp::Decoder>,
}

#[derive(Default)]
struct State {
    name: String,
    salt: String,
    password: String,
    cipher: Cipher,
    method: Method,
    transfer: Transfer,
    /// `(rcv, snd)` kernel buffer sizes in bytes; zero leaves the default.
    bandwidth: (usize, usize),
    workers: HashMap<u16, Worker>,
    brokers: HashMap<u16, Vec<Broker>>,
    /// Inverse of the broker table: pid to (wid, child slot).
    pids: HashMap<i32, (u16, usize)>,
    encoders: HashMap<u16, cmp::Encoder>,
    /// Set in children: which (wid, slot) this process is.
    child_slot: Option<(u16, usize)>,
    reaper_event: Option<Event>,
    reaper_read_fd: Fd,
}

struct Inner {
    master_pid: i32,
    base: Mutex<Option<Arc<EventBase>>>,
    state: Mutex<State>,
    callbacks: Mutex<Callbacks>,
    crash_window_ms: AtomicU64,
}

enum Lineage {
    Master,
    Child,
    Zombie,
}

pub struct Cluster {
    inner: Arc<Inner>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            master_pid: std::process::id() as i32,
            base: Mutex::new(None),
            state: Mutex::new(State {
                reaper_read_fd: INVALID_FD,
                ..State::default()
            }),
            callbacks: Mutex::new(Callbacks::default()),
            crash_window_ms: AtomicU64::new(CRASH_LOOP_WINDOW_MS),
        });
        #[cfg(unix)]
        install_sigchld();
        Self { inner }
    }

    /// Attaches the event base all IPC runs on. Live workers are stopped
    /// first.
    pub fn core(&self, base: Arc<EventBase>) -> Result<()> {
        let wids: Vec<u16> = self.inner.lock_state().workers.keys().copied().collect();
        for wid in wids {
            self.stop(wid);
        }
        *self.inner.base.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&base));
        #[cfg(unix)]
        {
            if self.master() {
                Inner::install_reaper(&self.inner, &base)?;
            }
        }
        Ok(())
    }

    /// Registers a worker class. `count == 0` means half the hardware
    /// threads, floor one.
    pub fn init(&self, wid: u16, count: u16) {
        {
            let mut state = self.inner.lock_state();
            state.workers.entry(wid).or_insert_with(|| Worker {
                count: 1,
                auto_restart: false,
                working: false,
                decoders: HashMap::new(),
            });
        }
        self.set_count(wid, count);
    }

    pub fn count(&self, wid: u16) -> u16 {
        self.inner
            .lock_state()
            .workers
            .get(&wid)
            .map(|worker| worker.count)
            .unwrap_or(0)
    }

    pub fn set_count(&self, wid: u16, count: u16) {
        let mut state = self.inner.lock_state();
        if let Some(worker) = state.workers.get_mut(&wid) {
            worker.count = if count == 0 {
                let threads = std::thread::available_parallelism()
                    .map(|n| n.get() as u16)
                    .unwrap_or(2);
                (threads / 2).max(1)
            } else {
                count
            };
        }
    }

    pub fn auto_restart(&self, wid: u16, enabled: bool) {
        if let Some(worker) = self.inner.lock_state().workers.get_mut(&wid) {
            worker.auto_restart = enabled;
        }
    }

    /// Alias kept for callers that think of the flag as "restart".
    pub fn restart(&self, wid: u16, enabled: bool) {
        self.auto_restart(wid, enabled);
    }

    pub fn name(&self, name: impl Into<String>) {
        self.inner.lock_state().name = name.into();
    }

    pub fn salt(&self, salt: impl Into<String>) {
        self.inner.lock_state().salt = salt.into();
    }

    pub fn password(&self, password: impl Into<String>) {
        self.inner.lock_state().password = password.into();
    }

    pub fn cipher(&self, cipher: Cipher) {
        self.inner.lock_state().cipher = cipher;
    }

    pub fn compressor(&self, method: Method) {
        self.inner.lock_state().method = method;
    }

    pub fn transfer(&self, transfer: Transfer) {
        self.inner.lock_state().transfer = transfer;
    }

    /// Kernel buffer sizing from `"<N>bps|kbps|Mbps|Gbps"` strings; empty
    /// strings leave the OS defaults.
    pub fn bandwidth(&self, read: &str, write: &str) -> Result<()> {
        let rcv = if read.is_empty() {
            0
        } else {
            socket::parse_bandwidth(read)?
        };
        let snd = if write.is_empty() {
            0
        } else {
            socket::parse_bandwidth(write)?
        };
        self.inner.lock_state().bandwidth = (rcv, snd);
        Ok(())
    }

    /// Tunes the anti-crash-loop window (milliseconds).
    pub fn crash_loop_window(&self, ms: u64) {
        self.inner.crash_window_ms.store(ms, Ordering::Relaxed);
    }

    pub fn on_message(&self, cb: impl Fn(u16, i32, &[u8]) + Send + Sync + 'static) {
        self.inner.lock_callbacks().message = Some(Arc::new(cb));
    }

    pub fn on_process(&self, cb: impl Fn(u16, i32, ProcessEvent) + Send + Sync + 'static) {
        self.inner.lock_callbacks().process = Some(Arc::new(cb));
    }

    pub fn on_exit(&self, cb: impl Fn(u16, i32, i32) + Send + Sync + 'static) {
        self.inner.lock_callbacks().exit = Some(Arc::new(cb));
    }

    pub fn on_rebase(&self, cb: impl Fn(u16, i32, i32) + Send + Sync + 'static) {
        self.inner.lock_callbacks().rebase = Some(Arc::new(cb));
    }

    /// Whether this process is the one that constructed the cluster.
    pub fn master(&self) -> bool {
        self.inner.master_pid == std::process::id() as i32
    }

    pub fn working(&self, wid: u16) -> bool {
        self.inner
            .lock_state()
            .workers
            .get(&wid)
            .map(|worker| worker.working)
            .unwrap_or(false)
    }

    /// Current children of `wid`.
    pub fn pids(&self, wid: u16) -> BTreeSet<i32> {
        let state = self.inner.lock_state();
        state
            .brokers
            .get(&wid)
            .map(|brokers| {
                brokers
                    .iter()
                    .filter(|broker| !broker.ended && broker.pid > 0)
                    .map(|broker| broker.pid)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forks `count(wid)` children. In the master this returns once all
    /// children are up; in each child it returns after the child has wired
    /// itself to the base, and the caller's code keeps running as the child.
    pub fn start(&self, wid: u16) -> Result<()> {
        #[cfg(windows)]
        {
            let _ = wid;
            return Err(Error::Unsupported(
                "process clustering is not available on Windows".into(),
            ));
        }
        #[cfg(unix)]
        {
            match self.inner.lineage() {
                Lineage::Master => {}
                Lineage::Child => return Ok(()),
                Lineage::Zombie => Inner::zombie_exit(&self.inner, wid),
            }
            let count = {
                let state = self.inner.lock_state();
                let worker = state.workers.get(&wid).ok_or_else(|| {
                    Error::IllegalState(format!("worker {wid} was never initialized"))
                })?;
                if worker.working {
                    return Err(Error::IllegalState(format!(
                        "worker {wid} is already started"
                    )));
                }
                debug!(
                    "cluster {:?} starting worker {wid} with {} children",
                    state.name, worker.count
                );
                worker.count
            };

            for _ in 0..count {
                let slot = self.inner.lock_state().brokers.entry(wid).or_default().len();
                match Inner::spawn_child(&self.inner, wid, slot, None)? {
                    ForkSide::Child => return Ok(()),
                    ForkSide::Master => {}
                }
            }

            let mut state = self.inner.lock_state();
            if let Some(worker) = state.workers.get_mut(&wid) {
                worker.working = true;
            }
            let encoder = Inner::build_encoder(&state);
            state.encoders.insert(wid, encoder);
            return Ok(());
        }
    }

    /// Closes all broker pipes for `wid` and clears the run flag. In a
    /// child this shuts the worker down; the caller is expected to leave
    /// its loop afterwards.
    pub fn stop(&self, wid: u16) {
        #[cfg(unix)]
        {
            if matches!(self.inner.lineage(), Lineage::Zombie) {
                Inner::zombie_exit(&self.inner, wid);
            }
        }
        Inner::close_worker(&self.inner, wid);
        let mut state = self.inner.lock_state();
        if let Some(worker) = state.workers.get_mut(&wid) {
            worker.working = false;
        }
        let stale: Vec<i32> = state
            .pids
            .iter()
            .filter(|(_, &(owner, _))| owner == wid)
            .map(|(&pid, _)| pid)
            .collect();
        for pid in stale {
            state.pids.remove(&pid);
        }
    }

    /// Like [`stop`](Self::stop) but keeps the worker record untouched.
    pub fn close(&self, wid: u16) {
        Inner::close_worker(&self.inner, wid);
    }

    pub fn close_all(&self) {
        let wids: Vec<u16> = self.inner.lock_state().brokers.keys().copied().collect();
        for wid in wids {
            Inner::close_worker(&self.inner, wid);
        }
    }

    /// Forks one additional child for a running worker.
    pub fn emplace(&self, wid: u16) -> Result<()> {
        #[cfg(windows)]
        {
            let _ = wid;
            return Err(Error::Unsupported(
                "process clustering is not available on Windows".into(),
            ));
        }
        #[cfg(unix)]
        {
            match self.inner.lineage() {
                Lineage::Master => {}
                Lineage::Child => return Ok(()),
                Lineage::Zombie => Inner::zombie_exit(&self.inner, wid),
            }
            let slot = {
                let mut state = self.inner.lock_state();
                let working = state
                    .workers
                    .get(&wid)
                    .map(|worker| worker.working)
                    .unwrap_or(false);
                if !working {
                    return Err(Error::IllegalState(format!(
                        "worker {wid} is not running"
                    )));
                }
                if let Some(worker) = state.workers.get_mut(&wid) {
                    worker.count += 1;
                }
                state.brokers.entry(wid).or_default().len()
            };
            // Either side, there is nothing more to do here: the master just
            // bookkeeps, the child has wired itself up inside the fork.
            let _ = Inner::spawn_child(&self.inner, wid, slot, None)?;
            return Ok(());
        }
    }

    /// Tears one child down (SIGTERM after its pipes are gone).
    pub fn erase(&self, wid: u16, pid: i32) {
        #[cfg(unix)]
        {
            if matches!(self.inner.lineage(), Lineage::Zombie) {
                Inner::zombie_exit(&self.inner, wid);
            }
            if !self.master() {
                return;
            }
            {
                let mut state = self.inner.lock_state();
                let Some(&(owner, slot)) = state.pids.get(&pid) else {
                    return;
                };
                if owner != wid {
                    return;
                }
                let mut removed = None;
                if let Some(brokers) = state.brokers.get_mut(&wid) {
                    if slot < brokers.len() && brokers[slot].pid == pid {
                        removed = Some(brokers.remove(slot));
                    }
                }
                if let Some(mut broker) = removed {
                    broker.stop_events();
                    let read_fd = broker.mfds[0];
                    broker.close_fds();
                    if let Some(worker) = state.workers.get_mut(&wid) {
                        worker.decoders.remove(&read_fd);
                    }
                }
                state.pids.remove(&pid);
                // Removing the broker shifted every slot after the gap.
                for entry in state.pids.values_mut() {
                    if entry.0 == wid && entry.1 > slot {
                        entry.1 -= 1;
                    }
                }
            }
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        #[cfg(windows)]
        {
            let _ = (wid, pid);
        }
    }

    /// Worker-to-master message.
    pub fn send(&self, wid: u16, data: &[u8]) -> Result<()> {
        Inner::send_up(&self.inner, wid, data)
    }

    /// Worker-to-master empty ping.
    pub fn ping(&self, wid: u16) -> Result<()> {
        Inner::send_up(&self.inner, wid, &[0x01])
    }

    /// Master-to-child message.
    pub fn send_to(&self, wid: u16, pid: i32, data: &[u8]) -> Result<()> {
        Inner::send_down(&self.inner, wid, pid, data)
    }

    /// Master-to-child empty ping.
    pub fn ping_child(&self, wid: u16, pid: i32) -> Result<()> {
        Inner::send_down(&self.inner, wid, pid, &[0x01])
    }

    /// Master-to-every-child message.
    pub fn broadcast(&self, wid: u16, data: &[u8]) -> Result<()> {
        let pids = self.pids(wid);
        for pid in pids {
            Inner::send_down(&self.inner, wid, pid, data)?;
        }
        Ok(())
    }

    pub fn broadcast_ping(&self, wid: u16) -> Result<()> {
        self.broadcast(wid, &[0x01])
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if self.master() {
            let wids: Vec<u16> = self.inner.lock_state().brokers.keys().copied().collect();
            for wid in wids {
                self.stop(wid);
            }
        }
    }
}

enum ForkSide {
    Master,
    Child,
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_callbacks(&self) -> std::sync::MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn callbacks(&self) -> Callbacks {
        self.lock_callbacks().clone()
    }

    fn base(&self) -> Result<Arc<EventBase>> {
        self.base
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::IllegalState("no event base is attached".into()))
    }

    fn lineage(&self) -> Lineage {
        let pid = std::process::id() as i32;
        if self.master_pid == pid {
            return Lineage::Master;
        }
        #[cfg(unix)]
        {
            if self.master_pid == nix::unistd::getppid().as_raw() {
                return Lineage::Child;
            }
            return Lineage::Zombie;
        }
        #[cfg(windows)]
        {
            return Lineage::Child;
        }
    }

    /// The master died under us; nothing sane is left to do.
    fn zombie_exit(inner: &Arc<Inner>, wid: u16) -> ! {
        error!(
            "process {} lost its master, performing self-destruction",
            std::process::id()
        );
        Inner::close_worker(inner, wid);
        std::process::exit(1);
    }

    fn build_encoder(state: &State) -> cmp::Encoder {
        let mut encoder = cmp::Encoder::new();
        encoder.cipher(state.cipher);
        encoder.method(state.method);
        encoder.password(state.password.as_bytes().to_vec());
        encoder.salt(state.salt.as_bytes().to_vec());
        encoder
    }

    fn build_decoder(state: &State) -> cmp::Decoder {
        let mut decoder = cmp::Decoder::new();
        decoder.password(state.password.as_bytes().to_vec());
        decoder.salt(state.salt.as_bytes().to_vec());
        decoder
    }

    #[cfg(unix)]
    fn install_reaper(inner: &Arc<Inner>, base: &Arc<EventBase>) -> Result<()> {
        let mut state = inner.lock_state();
        if state.reaper_event.is_some() {
            return Ok(());
        }
        let (read_fd, write_fd) = {
            let (rx, tx) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
                .map_err(|err| Error::io("pipe2(reaper)", err.into()))?;
            use std::os::fd::IntoRawFd;
            (rx.into_raw_fd(), tx.into_raw_fd())
        };
        socket::set_nonblocking(read_fd, true)?;
        socket::set_nonblocking(write_fd, true)?;
        REAPER_WAKE_FD.store(write_fd, Ordering::SeqCst);

        let event = Event::new(EventType::Event);
        event.attach(Arc::clone(base))?;
        event.set_fd(read_fd)?;
        let weak = Arc::downgrade(inner);
        event.set_callback(move |fd, kind| {
            if kind != EventKind::Read {
                return;
            }
            let mut buf = [0u8; 64];
            while matches!(socket::read(fd, &mut buf), Ok(n) if n > 0) {}
            let Some(inner) = weak.upgrade() else {
                return;
            };
            while let Some((pid, status)) = REAPED.pop() {
                Inner::handle_exit(&inner, pid, status);
            }
        });
        event.start()?;
        event.mode(EventKind::Read, EventMode::Enabled)?;

        state.reaper_event = Some(event);
        state.reaper_read_fd = read_fd;
        Ok(())
    }

    /// Forks one child into `slot`. The broker slot is created (or, for a
    /// restart, replaced) before the fork so both sides see the same fds.
    #[cfg(unix)]
    fn spawn_child(
        inner: &Arc<Inner>,
        wid: u16,
        slot: usize,
        old_pid: Option<i32>,
    ) -> Result<ForkSide> {
        let base = inner.base()?;

        // fd pairs first, so a failure aborts before fork.
        let (mfds, cfds, bandwidth, transfer) = {
            let state = inner.lock_state();
            let mfds = Inner::make_pair(state.transfer)?;
            let cfds = match Inner::make_pair(state.transfer) {
                Ok(fds) => fds,
                Err(err) => {
                    socket::close(mfds[0]);
                    socket::close(mfds[1]);
                    return Err(err);
                }
            };
            (mfds, cfds, state.bandwidth, state.transfer)
        };
        Inner::apply_bandwidth(transfer, bandwidth, &mfds, &cfds);
        // A write to a peer that died must come back as EPIPE, not a signal.
        for &fd in mfds.iter().chain(cfds.iter()) {
            if let Err(err) = socket::block_sigpipe(fd) {
                debug!("SIGPIPE suppression on fd {fd} skipped: {err}");
            }
        }

        {
            let mut state = inner.lock_state();
            let brokers = state.brokers.entry(wid).or_default();
            let broker = Broker::new(mfds, cfds);
            if slot < brokers.len() {
                let mut old = std::mem::replace(&mut brokers[slot], broker);
                old.stop_events();
                old.close_fds();
            } else {
                brokers.push(broker);
            }
        }

        let fork = unsafe { nix::unistd::fork() }.map_err(|err| {
            error!("child process could not be created: {err}");
            Error::Fatal(format!("fork failed: {err}"))
        })?;

        match fork {
            nix::unistd::ForkResult::Child => {
                Inner::setup_child(inner, &base, wid, slot);
                Ok(ForkSide::Child)
            }
            nix::unistd::ForkResult::Parent { child } => {
                let pid = child.as_raw();
                Inner::setup_master_side(inner, &base, wid, slot, pid)?;
                let callbacks = inner.callbacks();
                if let Some(cb) = callbacks.process.as_ref() {
                    cb(wid, pid, ProcessEvent::Start);
                }
                if let Some(old) = old_pid {
                    if let Some(cb) = callbacks.rebase.as_ref() {
                        cb(wid, pid, old);
                    }
                }
                Ok(ForkSide::Master)
            }
        }
    }

    #[cfg(unix)]
    fn make_pair(transfer: Transfer) -> Result<[Fd; 2]> {
        use std::os::fd::IntoRawFd;
        match transfer {
            Transfer::Pipe => {
                let (rx, tx) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
                    .map_err(|err| Error::io("pipe2", err.into()))?;
                Ok([rx.into_raw_fd(), tx.into_raw_fd()])
            }
            Transfer::Ipc => {
                let (a, b) = nix::sys::socket::socketpair(
                    nix::sys::socket::AddressFamily::Unix,
                    nix::sys::socket::SockType::Stream,
                    None,
                    nix::sys::socket::SockFlag::SOCK_CLOEXEC,
                )
                .map_err(|err| Error::io("socketpair", err.into()))?;
                Ok([a.into_raw_fd(), b.into_raw_fd()])
            }
        }
    }

    #[cfg(unix)]
    fn apply_bandwidth(transfer: Transfer, bandwidth: (usize, usize), mfds: &[Fd; 2], cfds: &[Fd; 2]) {
        let (rcv, snd) = bandwidth;
        if rcv == 0 && snd == 0 {
            return;
        }
        for &fd in mfds.iter().chain(cfds.iter()) {
            let outcome = match transfer {
                Transfer::Ipc => {
                    let mut result = Ok(());
                    if rcv > 0 {
                        result = result.and(socket::set_rcvbuf(fd, rcv));
                    }
                    if snd > 0 {
                        result = result.and(socket::set_sndbuf(fd, snd));
                    }
                    result
                }
                Transfer::Pipe => socket::set_pipe_size(fd, rcv.max(snd)),
            };
            if let Err(err) = outcome {
                debug!("bandwidth tuning on fd {fd} skipped: {err}");
            }
        }
    }

    /// Child half of the fork protocol.
    #[cfg(unix)]
    fn setup_child(inner: &Arc<Inner>, base: &Arc<EventBase>, wid: u16, slot: usize) {
        if nix::unistd::getppid().as_raw() != inner.master_pid {
            error!(
                "process {} has turned into a zombie right after fork, self-destructing",
                std::process::id()
            );
            std::process::exit(1);
        }
        let pid = std::process::id() as i32;
        install_child_signals();

        // Sibling brokers were inherited through fork; their events and fds
        // belong to the master.
        {
            let mut state = inner.lock_state();
            let all_wids: Vec<u16> = state.brokers.keys().copied().collect();
            for owner in all_wids {
                let brokers = state.brokers.get_mut(&owner).expect("key just listed");
                for (index, broker) in brokers.iter_mut().enumerate() {
                    if owner == wid && index == slot {
                        continue;
                    }
                    broker.stop_events();
                    broker.close_fds();
                }
            }
            state.reaper_event = None;
            if state.reaper_read_fd != INVALID_FD {
                socket::close(state.reaper_read_fd);
                state.reaper_read_fd = INVALID_FD;
            }
            let wake = REAPER_WAKE_FD.swap(-1, Ordering::SeqCst);
            if wake >= 0 {
                socket::close(wake);
            }
        }

        // Drop the inherited poll state before wiring our own events.
        if let Err(err) = base.rebase() {
            error!("event base could not be rebuilt in the child: {err}");
            std::process::exit(1);
        }

        let setup = || -> Result<()> {
            let read_fd;
            let write_fd;
            {
                let mut state = inner.lock_state();
                let broker = state
                    .brokers
                    .get_mut(&wid)
                    .and_then(|brokers| brokers.get_mut(slot))
                    .ok_or_else(|| Error::Fatal("own broker slot is missing".into()))?;
                socket::close(broker.cfds[1]);
                broker.cfds[1] = INVALID_FD;
                socket::close(broker.mfds[0]);
                broker.mfds[0] = INVALID_FD;
                socket::set_nonblocking(broker.cfds[0], true)?;
                socket::set_nonblocking(broker.mfds[1], true)?;
                broker.pid = pid;
                broker.start_time_ms = now_ms();
                read_fd = broker.cfds[0];
                write_fd = broker.mfds[1];

                state.pids.clear();
                state.pids.insert(pid, (wid, slot));
                state.child_slot = Some((wid, slot));

                let encoder = Inner::build_encoder(&state);
                state.encoders.clear();
                state.encoders.insert(wid, encoder);
                let decoder = Inner::build_decoder(&state);
                if let Some(worker) = state.workers.get_mut(&wid) {
                    worker.decoders.clear();
                    worker.decoders.insert(read_fd, decoder);
                    worker.working = true;
                }
            }

            let (read_event, write_event) =
                Inner::wire_broker_events(inner, base, wid, read_fd, write_fd)?;
            let mut state = inner.lock_state();
            let broker = state
                .brokers
                .get_mut(&wid)
                .and_then(|brokers| brokers.get_mut(slot))
                .ok_or_else(|| Error::Fatal("own broker slot is missing".into()))?;
            broker.read_event = Some(read_event);
            broker.write_event = Some(write_event);
            Ok(())
        };
        if let Err(err) = setup() {
            error!("child {pid} could not join the cluster: {err}");
            std::process::exit(1);
        }

        if let Some(cb) = inner.callbacks().process.as_ref() {
            cb(wid, pid, ProcessEvent::Start);
        }
    }

    /// Master half of the fork protocol.
    #[cfg(unix)]
    fn setup_master_side(
        inner: &Arc<Inner>,
        base: &Arc<EventBase>,
        wid: u16,
        slot: usize,
        pid: i32,
    ) -> Result<()> {
        let read_fd;
        let write_fd;
        {
            let mut state = inner.lock_state();
            let broker = state
                .brokers
                .get_mut(&wid)
                .and_then(|brokers| brokers.get_mut(slot))
                .ok_or_else(|| Error::Fatal("broker slot vanished".into()))?;
            socket::close(broker.mfds[1]);
            broker.mfds[1] = INVALID_FD;
            socket::close(broker.cfds[0]);
            broker.cfds[0] = INVALID_FD;
            socket::set_nonblocking(broker.mfds[0], true)?;
            socket::set_nonblocking(broker.cfds[1], true)?;
            broker.pid = pid;
            broker.start_time_ms = now_ms();
            read_fd = broker.mfds[0];
            write_fd = broker.cfds[1];

            state.pids.insert(pid, (wid, slot));
            let decoder = Inner::build_decoder(&state);
            if let Some(worker) = state.workers.get_mut(&wid) {
                worker.decoders.insert(read_fd, decoder);
            }
        }

        let (read_event, write_event) =
            Inner::wire_broker_events(inner, base, wid, read_fd, write_fd)?;
        let mut state = inner.lock_state();
        let broker = state
            .brokers
            .get_mut(&wid)
            .and_then(|brokers| brokers.get_mut(slot))
            .ok_or_else(|| Error::Fatal("broker slot vanished".into()))?;
        broker.read_event = Some(read_event);
        broker.write_event = Some(write_event);
        Ok(())
    }

    /// READ+CLOSE on the receive fd, WRITE (initially disabled) on the send
    /// fd.
    #[cfg(unix)]
    fn wire_broker_events(
        inner: &Arc<Inner>,
        base: &Arc<EventBase>,
        wid: u16,
        read_fd: Fd,
        write_fd: Fd,
    ) -> Result<(Event, Event)> {
        let read_event = Event::new(EventType::Event);
        read_event.attach(Arc::clone(base))?;
        read_event.set_fd(read_fd)?;
        let weak = Arc::downgrade(inner);
        read_event.set_callback(move |fd, kind| {
            if let Some(inner) = weak.upgrade() {
                Inner::on_readable(&inner, wid, fd, kind);
            }
        });
        read_event.start()?;
        read_event.mode(EventKind::Read, EventMode::Enabled)?;
        read_event.mode(EventKind::Close, EventMode::Enabled)?;

        let write_event = Event::new(EventType::Event);
        write_event.attach(Arc::clone(base))?;
        write_event.set_fd(write_fd)?;
        let weak = Arc::downgrade(inner);
        write_event.set_callback(move |fd, kind| {
            if kind == EventKind::Write {
                if let Some(inner) = weak.upgrade() {
                    Inner::on_writable(&inner, wid, fd);
                }
            }
        });
        write_event.start()?;
        Ok((read_event, write_event))
    }

    /// Readiness on an IPC receive fd, both sides.
    #[cfg(unix)]
    fn on_readable(inner: &Arc<Inner>, wid: u16, fd: Fd, kind: EventKind) {
        match inner.lineage() {
            Lineage::Master => match kind {
                EventKind::Close => Inner::master_lost_child(inner, wid, fd),
                EventKind::Read => Inner::pump_messages(inner, wid, fd, true),
                _ => {}
            },
            Lineage::Child => match kind {
                EventKind::Close => {
                    error!(
                        "[{}] the master side of the pipe is gone",
                        std::process::id()
                    );
                    Inner::close_worker(inner, wid);
                    std::process::exit(1);
                }
                EventKind::Read => {
                    let own_fd = {
                        let state = inner.lock_state();
                        state.child_slot.and_then(|(owner, slot)| {
                            state
                                .brokers
                                .get(&owner)
                                .and_then(|brokers| brokers.get(slot))
                                .map(|broker| broker.cfds[0])
                        })
                    };
                    if own_fd != Some(fd) {
                        // A sibling's fd leaked through fork; get rid of it.
                        socket::close(fd);
                        return;
                    }
                    Inner::pump_messages(inner, wid, fd, false);
                }
                _ => {}
            },
            Lineage::Zombie => Inner::zombie_exit(inner, wid),
        }
    }

    /// Reads once into the staging buffer and feeds the per-peer decoder;
    /// completed messages are delivered after the state lock is released.
    #[cfg(unix)]
    fn pump_messages(inner: &Arc<Inner>, wid: u16, fd: Fd, master_side: bool) {
        let mut staging = vec![0u8; STAGING_SIZE];
        let n = match socket::read(fd, &mut staging) {
            Ok(0) => {
                // Peer closed without a visible hangup event.
                if master_side {
                    error!(
                        "[{}] data from a child process could not be received",
                        inner.master_pid
                    );
                    Inner::master_lost_child(inner, wid, fd);
                } else {
                    error!("[{}] data from the master could not be received", std::process::id());
                    Inner::close_worker(inner, wid);
                    std::process::exit(1);
                }
                return;
            }
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                warn!("cluster read on fd {fd}: {err}");
                return;
            }
        };

        let mut delivered: Vec<(i32, Vec<u8>)> = Vec::new();
        {
            let mut state = inner.lock_state();
            let sender_fallback = if master_side {
                state
                    .brokers
                    .get(&wid)
                    .and_then(|brokers| brokers.iter().find(|b| b.mfds[0] == fd))
                    .map(|broker| broker.pid)
                    .unwrap_or(0)
            } else {
                inner.master_pid
            };
            let Some(worker) = state.workers.get_mut(&wid) else {
                return;
            };
            let Some(decoder) = worker.decoders.get_mut(&fd) else {
                return;
            };
            if let Err(err) = decoder.push(&staging[..n]) {
                warn!("cluster stream on fd {fd}: {err}");
            }
            while let Some(message) = decoder.get() {
                let sender = if message.pid != 0 {
                    message.pid
                } else {
                    sender_fallback
                };
                delivered.push((sender, message.data.clone()));
                decoder.pop();
            }
        }

        if let Some(cb) = inner.callbacks().message.as_ref() {
            for (sender, data) in delivered {
                cb(wid, sender, &data);
            }
        }
    }

    /// Master-side teardown when a child's pipe dies. Restart decisions are
    /// left to the SIGCHLD path, which still finds the broker by pid.
    #[cfg(unix)]
    fn master_lost_child(inner: &Arc<Inner>, wid: u16, fd: Fd) {
        let (pid, auto_restart) = {
            let mut state = inner.lock_state();
            let mut pid = 0;
            if let Some(brokers) = state.brokers.get_mut(&wid) {
                if let Some(broker) = brokers.iter_mut().find(|b| b.mfds[0] == fd) {
                    pid = broker.pid;
                    broker.ended = true;
                    broker.stop_events();
                    broker.close_fds();
                }
            }
            if let Some(worker) = state.workers.get_mut(&wid) {
                worker.decoders.remove(&fd);
            }
            let auto_restart = state
                .workers
                .get(&wid)
                .map(|worker| worker.auto_restart)
                .unwrap_or(false);
            (pid, auto_restart)
        };
        error!(
            "[{}] the pipe from child process [{pid}] is closed",
            inner.master_pid
        );
        if !auto_restart {
            Inner::abort_cluster(inner, 1);
        }
    }

    /// Runs on the loop thread with one reaped `(pid, status)` record.
    #[cfg(unix)]
    fn handle_exit(inner: &Arc<Inner>, pid: i32, status: i32) {
        let reaped = {
            let mut state = inner.lock_state();
            match state.pids.remove(&pid) {
                Some((wid, slot)) => {
                    let mut age_ms = u64::MAX;
                    let mut dead_read_fd = INVALID_FD;
                    if let Some(broker) = state
                        .brokers
                        .get_mut(&wid)
                        .and_then(|brokers| brokers.get_mut(slot))
                        .filter(|broker| broker.pid == pid)
                    {
                        broker.ended = true;
                        broker.stop_events();
                        dead_read_fd = broker.mfds[0];
                        age_ms = now_ms().saturating_sub(broker.start_time_ms);
                        broker.close_fds();
                    }
                    if dead_read_fd != INVALID_FD {
                        if let Some(worker) = state.workers.get_mut(&wid) {
                            worker.decoders.remove(&dead_read_fd);
                        }
                    }
                    let auto_restart = state
                        .workers
                        .get(&wid)
                        .map(|worker| worker.auto_restart)
                        .unwrap_or(false);
                    Some((wid, slot, age_ms, auto_restart))
                }
                None => None,
            }
        };
        // An unknown pid means the teardown already ran (stop/erase remove
        // the pid entry before the child can be reaped).
        let Some((wid, slot, age_ms, auto_restart)) = reaped else {
            return;
        };

        warn!("child process stopped, PID={pid}, STATUS={status}");
        let callbacks = inner.callbacks();
        if let Some(cb) = callbacks.exit.as_ref() {
            cb(wid, pid, status);
        }
        if let Some(cb) = callbacks.process.as_ref() {
            cb(wid, pid, ProcessEvent::Stop);
        }

        if status == libc::SIGINT {
            Inner::abort_cluster(inner, status);
        }
        let window = inner.crash_window_ms.load(Ordering::Relaxed);
        if age_ms <= window {
            error!("child {pid} lived only {age_ms} ms, stopping the whole cluster");
            Inner::abort_cluster(inner, if status == 0 { 1 } else { status });
        }

        if auto_restart && status > 0 {
            match Inner::spawn_child(inner, wid, slot, Some(pid)) {
                Ok(ForkSide::Master) => {}
                // The replacement child re-enters the caller's loop on its
                // own; nothing left to do here either way.
                Ok(ForkSide::Child) => {}
                Err(err) => error!("replacement child for worker {wid} failed: {err}"),
            }
        } else if !auto_restart {
            Inner::abort_cluster(inner, status);
        }
    }

    #[cfg(unix)]
    fn abort_cluster(inner: &Arc<Inner>, status: i32) -> ! {
        let wids: Vec<u16> = inner.lock_state().brokers.keys().copied().collect();
        for wid in wids {
            Inner::close_worker(inner, wid);
        }
        inner.lock_state().pids.clear();
        std::process::exit(status);
    }

    /// Queues `data` for one child and drains what the socket will take.
    fn send_down(inner: &Arc<Inner>, wid: u16, pid: i32, data: &[u8]) -> Result<()> {
        #[cfg(windows)]
        {
            let _ = (wid, pid, data);
            return Err(Error::Unsupported(
                "process clustering is not available on Windows".into(),
            ));
        }
        #[cfg(unix)]
        {
            if matches!(inner.lineage(), Lineage::Zombie) {
                Inner::zombie_exit(inner, wid);
            }
            if inner.master_pid != std::process::id() as i32 {
                return Err(Error::IllegalState(
                    "only the master sends to children".into(),
                ));
            }
            let write_fd = {
                let mut state = inner.lock_state();
                let &(owner, slot) = state.pids.get(&pid).ok_or_else(|| {
                    Error::IllegalState(format!("pid {pid} is not a child of worker {wid}"))
                })?;
                if owner != wid {
                    return Err(Error::IllegalState(format!(
                        "pid {pid} belongs to worker {owner}, not {wid}"
                    )));
                }
                let frame = {
                    let encoder = state.encoders.get_mut(&wid).ok_or_else(|| {
                        Error::IllegalState(format!("worker {wid} is not started"))
                    })?;
                    encoder.push(data)?;
                    let frame = encoder.data().to_vec();
                    encoder.erase(frame.len());
                    frame
                };
                let broker = state
                    .brokers
                    .get_mut(&wid)
                    .and_then(|brokers| brokers.get_mut(slot))
                    .filter(|broker| broker.pid == pid && !broker.ended)
                    .ok_or_else(|| {
                        Error::IllegalState(format!("child {pid} has no live broker"))
                    })?;
                broker.outbox.extend_from_slice(&frame);
                broker.cfds[1]
            };
            Inner::flush_outbox(inner, wid, write_fd);
            return Ok(());
        }
    }

    /// Child-to-master counterpart of [`send_down`].
    fn send_up(inner: &Arc<Inner>, wid: u16, data: &[u8]) -> Result<()> {
        #[cfg(windows)]
        {
            let _ = (wid, data);
            return Err(Error::Unsupported(
                "process clustering is not available on Windows".into(),
            ));
        }
        #[cfg(unix)]
        {
            match inner.lineage() {
                Lineage::Child => {}
                Lineage::Master => {
                    return Err(Error::IllegalState(
                        "the master has no upstream to send to".into(),
                    ))
                }
                Lineage::Zombie => Inner::zombie_exit(inner, wid),
            }
            let write_fd = {
                let mut state = inner.lock_state();
                let (owner, slot) = state.child_slot.ok_or_else(|| {
                    Error::IllegalState("this process is not a cluster child".into())
                })?;
                if owner != wid {
                    return Err(Error::IllegalState(format!(
                        "this child belongs to worker {owner}, not {wid}"
                    )));
                }
                let frame = {
                    let encoder = state.encoders.get_mut(&wid).ok_or_else(|| {
                        Error::IllegalState(format!("worker {wid} is not started"))
                    })?;
                    encoder.push(data)?;
                    let frame = encoder.data().to_vec();
                    encoder.erase(frame.len());
                    frame
                };
                let broker = state
                    .brokers
                    .get_mut(&wid)
                    .and_then(|brokers| brokers.get_mut(slot))
                    .ok_or_else(|| Error::Fatal("own broker slot is missing".into()))?;
                broker.outbox.extend_from_slice(&frame);
                broker.mfds[1]
            };
            Inner::flush_outbox(inner, wid, write_fd);
            return Ok(());
        }
    }

    /// Writes as much of the broker's outbox as the fd accepts. WRITE
    /// interest exists exactly while bytes are left over.
    #[cfg(unix)]
    fn on_writable(inner: &Arc<Inner>, wid: u16, fd: Fd) {
        Inner::flush_outbox(inner, wid, fd);
    }

    #[cfg(unix)]
    fn flush_outbox(inner: &Arc<Inner>, wid: u16, fd: Fd) {
        let mut fatal = false;
        {
            let mut state = inner.lock_state();
            let Some(broker) = state
                .brokers
                .get_mut(&wid)
                .and_then(|brokers| brokers.iter_mut().find(|b| b.cfds[1] == fd || b.mfds[1] == fd))
            else {
                return;
            };
            while !broker.outbox.is_empty() {
                match socket::write(fd, &broker.outbox) {
                    Ok(n) => {
                        broker.outbox.drain(..n);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        warn!("cluster write on fd {fd}: {err}");
                        fatal = true;
                        break;
                    }
                }
            }

            if fatal {
                broker.ended = true;
                broker.stop_events();
                broker.close_fds();
            } else {
                let want_write = !broker.outbox.is_empty();
                if want_write != broker.write_armed {
                    broker.write_armed = want_write;
                    if let Some(event) = broker.write_event.as_ref() {
                        let mode = if want_write {
                            EventMode::Enabled
                        } else {
                            EventMode::Disabled
                        };
                        if let Err(err) = event.mode(EventKind::Write, mode) {
                            debug!("write interest toggle on fd {fd}: {err}");
                        }
                    }
                }
            }
        }

        if fatal && inner.master_pid != std::process::id() as i32 {
            // A child that cannot reach its master has no reason to live.
            std::process::exit(1);
        }
    }

    /// Stops events, closes fds and forgets codec state for one worker.
    fn close_worker(inner: &Arc<Inner>, wid: u16) {
        let mut state = inner.lock_state();
        if let Some(brokers) = state.brokers.get_mut(&wid) {
            for broker in brokers.iter_mut() {
                broker.stop_events();
                broker.close_fds();
                broker.outbox.clear();
                broker.ended = true;
            }
            brokers.clear();
        }
        if let Some(worker) = state.workers.get_mut(&wid) {
            worker.decoders.clear();
        }
        if let Some(encoder) = state.encoders.get_mut(&wid) {
            encoder.clear();
        }
    }
}

/// SIGCHLD: reap everything reapable, record it, wake the base. Installed
/// once per process, `SA_RESTART | SA_SIGINFO | SA_NOCLDSTOP`.
#[cfg(unix)]
fn install_sigchld() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        extern "C" fn on_sigchld(
            _signal: libc::c_int,
            _info: *mut libc::siginfo_t,
            _context: *mut libc::c_void,
        ) {
            let mut status: libc::c_int = 0;
            loop {
                let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
                if pid <= 0 {
                    break;
                }
                let code = if libc::WIFEXITED(status) {
                    libc::WEXITSTATUS(status)
                } else if libc::WIFSIGNALED(status) {
                    libc::WTERMSIG(status)
                } else {
                    status
                };
                REAPED.push((pid, code));
                let fd = REAPER_WAKE_FD.load(Ordering::Relaxed);
                if fd >= 0 {
                    unsafe {
                        libc::write(fd, [1u8].as_ptr() as *const libc::c_void, 1);
                    }
                }
            }
        }

        let action = SigAction::new(
            SigHandler::SigAction(on_sigchld),
            SaFlags::SA_RESTART | SaFlags::SA_SIGINFO | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        unsafe {
            let _ = sigaction(Signal::SIGCHLD, &action);
        }
    });
}

/// Termination signals in a child report their cause through the exit
/// status; the master's reaper turns that into `exit`/`process` callbacks.
#[cfg(unix)]
fn install_child_signals() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    extern "C" fn on_terminal_signal(signal: libc::c_int) {
        unsafe { libc::_exit(signal) };
    }

    for signal in [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGABRT,
        Signal::SIGFPE,
        Signal::SIGILL,
        Signal::SIGSEGV,
    ] {
        let action = SigAction::new(
            SigHandler::Handler(on_terminal_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            let _ = sigaction(signal, &action);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::base::EventBase;

    /// Fork-based tests share the process-global reaper plumbing; run them
    /// one at a time.
    static FORK_LOCK: Mutex<()> = Mutex::new(());

    fn ms(n: u64) -> std::time::Duration {
        std::time::Duration::from_millis(n)
    }

    #[test]
    fn count_zero_means_half_the_cores() {
        let cluster = Cluster::new();
        cluster.init(9, 0);
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as u16)
            .unwrap_or(2);
        assert_eq!(cluster.count(9), (threads / 2).max(1));

        cluster.init(9, 7);
        assert_eq!(cluster.count(9), 7);
    }

    #[test]
    fn start_requires_an_initialized_worker_and_a_base() {
        // Attaching a base touches the process-global reaper plumbing.
        let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let cluster = Cluster::new();
        // No base attached yet.
        cluster.init(1, 1);
        assert!(cluster.start(1).is_err());

        let base = Arc::new(EventBase::new().unwrap());
        cluster.core(Arc::clone(&base)).unwrap();
        assert!(matches!(cluster.start(77), Err(Error::IllegalState(_))));
        assert!(!cluster.working(77));
    }

    #[test]
    fn broadcast_and_echo_round_trip() {
        let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let base = Arc::new(EventBase::new().unwrap());
        let cluster = Arc::new(Cluster::new());
        cluster.core(Arc::clone(&base)).unwrap();
        cluster.init(1, 2);
        cluster.password("secret");
        cluster.salt("NaCl");
        cluster.cipher(Cipher::Aes256);
        cluster.compressor(Method::Gzip);

        let echoes: Arc<Mutex<Vec<(i32, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let cluster = Arc::clone(&cluster);
            let base = Arc::clone(&base);
            let echoes = Arc::clone(&echoes);
            cluster.clone().on_message(move |wid, pid, data| {
                assert_eq!(wid, 1);
                if cluster.master() {
                    let mut echoes = echoes.lock().unwrap();
                    echoes.push((pid, data.to_vec()));
                    if echoes.len() == 2 {
                        base.stop();
                    }
                } else {
                    // Child: echo whatever the master said, once.
                    cluster.send(1, data).unwrap();
                }
            });
        }

        cluster.start(1).unwrap();
        if !cluster.master() {
            // Child: serve until the master tears the pipe down.
            let _ = base.start();
            std::process::exit(0);
        }

        assert_eq!(cluster.pids(1).len(), 2);
        assert!(cluster.working(1));
        cluster.broadcast(1, b"hello world").unwrap();
        base.start().unwrap();

        let echoes = echoes.lock().unwrap();
        assert_eq!(echoes.len(), 2);
        let senders: std::collections::BTreeSet<i32> =
            echoes.iter().map(|(pid, _)| *pid).collect();
        assert_eq!(senders, cluster.pids(1));
        for (_, data) in echoes.iter() {
            assert_eq!(data, b"hello world");
        }
        drop(echoes);

        for pid in cluster.pids(1) {
            cluster.erase(1, pid);
        }
        assert!(cluster.pids(1).is_empty());
    }

    #[test]
    fn child_messages_arrive_in_send_order() {
        let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let base = Arc::new(EventBase::new().unwrap());
        let cluster = Arc::new(Cluster::new());
        cluster.core(Arc::clone(&base)).unwrap();
        cluster.init(2, 1);
        cluster.compressor(Method::Lz4);

        const BURST: usize = 200;
        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let base = Arc::clone(&base);
            let received = Arc::clone(&received);
            cluster.on_message(move |_, _, data| {
                let mut received = received.lock().unwrap();
                received.push(data.to_vec());
                if received.len() == BURST {
                    base.stop();
                }
            });
        }

        cluster.start(2).unwrap();
        if !cluster.master() {
            for i in 0..BURST {
                let payload = [0x01, 0x02, 0x03, (i % 251) as u8];
                cluster.send(2, &payload).unwrap();
            }
            let _ = base.start();
            std::process::exit(0);
        }

        base.start().unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), BURST);
        for (i, data) in received.iter().enumerate() {
            assert_eq!(data, &[0x01, 0x02, 0x03, (i % 251) as u8], "message {i}");
        }
        drop(received);

        for pid in cluster.pids(2) {
            cluster.erase(2, pid);
        }
    }

    #[test]
    fn large_payload_over_ipc_socketpair_drains_on_write_readiness() {
        let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        const PAYLOAD_LEN: usize = 1 << 20;
        let base = Arc::new(EventBase::new().unwrap());
        let cluster = Arc::new(Cluster::new());
        cluster.core(Arc::clone(&base)).unwrap();
        cluster.init(4, 1);
        cluster.transfer(Transfer::Ipc);
        // Uncompressed payload with small kernel buffers: the megabyte has
        // to leave through many WRITE-readiness rounds.
        cluster.bandwidth("256kbps", "256kbps").unwrap();

        let replies: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let cluster = Arc::clone(&cluster);
            let base = Arc::clone(&base);
            let replies = Arc::clone(&replies);
            cluster.clone().on_message(move |wid, _, data| {
                if cluster.master() {
                    replies.lock().unwrap().push(data.to_vec());
                    base.stop();
                } else {
                    // Child: acknowledge with the byte count it reassembled.
                    assert!(data.iter().all(|&b| b == 0));
                    let ack = format!("len={}", data.len());
                    cluster.send(wid, ack.as_bytes()).unwrap();
                }
            });
        }

        cluster.start(4).unwrap();
        if !cluster.master() {
            let _ = base.start();
            std::process::exit(0);
        }

        let child = *cluster.pids(4).iter().next().unwrap();
        cluster.send_to(4, child, &vec![0u8; PAYLOAD_LEN]).unwrap();
        base.start().unwrap();

        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0], format!("len={PAYLOAD_LEN}").into_bytes());
        drop(replies);

        cluster.erase(4, child);
    }

    #[test]
    fn killed_child_is_replaced_when_auto_restart_is_on() {
        let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let base = Arc::new(EventBase::new().unwrap());
        let cluster = Arc::new(Cluster::new());
        cluster.core(Arc::clone(&base)).unwrap();
        cluster.init(3, 1);
        cluster.auto_restart(3, true);
        // The anti-crash-loop window would otherwise abort this whole test
        // process when the child dies young.
        cluster.crash_loop_window(0);

        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            cluster.on_exit(move |wid, pid, status| {
                log.lock().unwrap().push(format!("exit:{wid}:{pid}:{status}"));
            });
        }
        {
            let log = Arc::clone(&log);
            let cluster_cb = Arc::clone(&cluster);
            cluster.on_process(move |wid, pid, event| {
                if cluster_cb.master() {
                    log.lock().unwrap().push(format!("process:{wid}:{pid}:{event:?}"));
                }
            });
        }
        {
            let log = Arc::clone(&log);
            let base = Arc::clone(&base);
            cluster.on_rebase(move |wid, new_pid, old_pid| {
                log.lock().unwrap().push(format!("rebase:{wid}:{new_pid}:{old_pid}"));
                base.stop();
            });
        }

        cluster.start(3).unwrap();
        if !cluster.master() {
            let _ = base.start();
            std::process::exit(0);
        }

        let old_pid = *cluster.pids(3).iter().next().unwrap();
        // Give the child an age, so the crash-loop check sees it as mature.
        std::thread::sleep(ms(50));
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(old_pid),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();

        base.start().unwrap();

        let new_pid = *cluster.pids(3).iter().next().unwrap();
        assert_ne!(new_pid, old_pid);
        assert_eq!(cluster.pids(3).len(), 1);

        let log = log.lock().unwrap();
        let expected = vec![
            format!("process:3:{old_pid}:Start"),
            format!("exit:3:{old_pid}:{}", libc::SIGKILL),
            format!("process:3:{old_pid}:Stop"),
            format!("process:3:{new_pid}:Start"),
            format!("rebase:3:{new_pid}:{old_pid}"),
        ];
        assert_eq!(*log, expected);
        drop(log);

        cluster.erase(3, new_pid);
    }
}
