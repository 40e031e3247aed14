//! The event base: a single-threaded readiness reactor.
//!
//! One thread runs [`EventBase::start`] and is the only thread that invokes
//! user callbacks. Registration is allowed from any thread, but the intended
//! external ingress while the loop runs is the upstream mechanism: a wakeup
//! fd other threads signal, whose payloads are replayed on the loop thread in
//! FIFO order.
//!
//! Within one poll batch timers fire first, then I/O in the order the OS
//! reported it; upstream slots are serviced at the end of the iteration.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

use crate::error::{Error, Result};
use crate::events::notifier::Notifier;
use crate::events::partners::Partners;
use crate::events::poller::{new_poller, OsPoller, PollEvent};
use crate::events::watch::Watch;
use crate::net::socket::{Fd, INVALID_FD};

/// Default cap on tracked sockets.
pub const MAX_SOCKS: u32 = 0x20000;

/// Default poll block time in milliseconds.
pub const DEFAULT_RATE_MS: u32 = 10;

/// The kinds of events a registration can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Peer hangup, or an error the OS reports alongside readiness. Virtual:
    /// synthesized from POLLHUP/EPOLLRDHUP/EV_EOF style conditions.
    Close,
    Read,
    Write,
    /// A Watch-backed timer expiration.
    Timer,
    /// Cross-thread upstream traffic.
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    Enabled,
    Disabled,
}

pub type Callback = Arc<dyn Fn(Fd, EventKind) + Send + Sync>;
pub type UpstreamCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Per-fd registration record.
struct Peer {
    /// Caller-assigned handle id; lets one event kind be removed without
    /// disturbing other registrations of the same handle.
    id: u64,
    /// The tracked fd and, for two-fd wakeup primitives, its partner.
    socks: [Fd; 2],
    /// Non-zero for Watch-backed timers.
    delay: u32,
    persist: bool,
    callback: Callback,
    modes: HashMap<EventKind, EventMode>,
}

impl Peer {
    fn enabled(&self, kind: EventKind) -> bool {
        self.modes.get(&kind) == Some(&EventMode::Enabled)
    }

    fn interests(&self) -> (bool, bool) {
        if self.delay > 0 {
            // A timer is its notifier's read side.
            (true, false)
        } else {
            (self.enabled(EventKind::Read), self.enabled(EventKind::Write))
        }
    }
}

struct UpstreamSlot {
    notifier: Arc<Notifier>,
    callback: UpstreamCallback,
}

pub struct EventBase {
    poller: RwLock<Box<dyn OsPoller>>,
    peers: Mutex<HashMap<Fd, Peer>>,
    upstreams: Mutex<HashMap<Fd, UpstreamSlot>>,
    watch: Watch,
    partners: Partners,
    /// Wakes a blocked poll for `kick`/`stop`.
    waker: Notifier,
    loop_thread: Mutex<Option<thread::ThreadId>>,
    rate: AtomicU32,
    sockmax: AtomicU32,
    works: AtomicBool,
    easily: AtomicBool,
    frozen: AtomicBool,
    launched: AtomicBool,
}

impl EventBase {
    pub fn new() -> Result<Self> {
        let poller = new_poller(MAX_SOCKS as usize)?;
        let waker = Notifier::new()?;
        poller.add(waker.read_fd(), true, false)?;
        Ok(Self {
            poller: RwLock::new(poller),
            peers: Mutex::new(HashMap::new()),
            upstreams: Mutex::new(HashMap::new()),
            watch: Watch::new(),
            partners: Partners::new(),
            waker,
            loop_thread: Mutex::new(None),
            rate: AtomicU32::new(DEFAULT_RATE_MS),
            sockmax: AtomicU32::new(MAX_SOCKS),
            works: AtomicBool::new(false),
            easily: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            launched: AtomicBool::new(false),
        })
    }

    /// Registers an fd. With `delay_ms > 0` the fd is allocated from the
    /// Watch and interpreted as a timer (persistent iff `persist`); the
    /// timer's fd is returned and `fd` is ignored. Otherwise `fd` itself is
    /// registered and returned.
    ///
    /// All event kinds start out disabled (except TIMER, which a timer
    /// registration enables immediately); use [`mode`](Self::mode).
    pub fn add(
        &self,
        id: u64,
        fd: Fd,
        callback: Callback,
        delay_ms: u32,
        persist: bool,
    ) -> Result<Fd> {
        let mut peers = self.lock_peers();
        if peers.len() >= self.sockmax.load(Ordering::Relaxed) as usize {
            return Err(Error::Capacity(format!(
                "{} sockets are already registered",
                peers.len()
            )));
        }
        if peers.values().any(|peer| peer.id == id) {
            return Err(Error::IllegalState(format!(
                "event id {id} is already live on another descriptor"
            )));
        }

        if delay_ms > 0 {
            let socks = self.watch.create()?;
            let fd = socks[0];
            if socks[1] != fd {
                self.partners.merge(socks[0], socks[1]);
            }
            if let Err(err) = self.poller_read().add(fd, true, false) {
                self.partners.del(fd);
                self.watch.away(fd);
                return Err(err);
            }
            self.watch.wait(fd, delay_ms)?;
            let mut modes = HashMap::new();
            modes.insert(EventKind::Timer, EventMode::Enabled);
            peers.insert(
                fd,
                Peer {
                    id,
                    socks,
                    delay: delay_ms,
                    persist,
                    callback,
                    modes,
                },
            );
            Ok(fd)
        } else {
            if fd == INVALID_FD {
                return Err(Error::IllegalState(
                    "cannot register an invalid descriptor".into(),
                ));
            }
            if peers.contains_key(&fd) {
                return Err(Error::IllegalState(format!(
                    "descriptor {fd} is already registered"
                )));
            }
            self.poller_read().add(fd, false, false)?;
            let mut modes = HashMap::new();
            modes.insert(EventKind::Read, EventMode::Disabled);
            modes.insert(EventKind::Write, EventMode::Disabled);
            modes.insert(EventKind::Close, EventMode::Disabled);
            peers.insert(
                fd,
                Peer {
                    id,
                    socks: [fd, INVALID_FD],
                    delay: 0,
                    persist: false,
                    callback,
                    modes,
                },
            );
            Ok(fd)
        }
    }

    /// Removes every event kind registered for `(id, fd)`. Watch-owned fds
    /// are released back to the Watch; partner registrations go with them.
    pub fn del(&self, id: u64, fd: Fd) -> bool {
        let removed = {
            let mut peers = self.lock_peers();
            match peers.get(&fd) {
                Some(peer) if peer.id == id => peers.remove(&fd),
                _ => None,
            }
        };
        let Some(peer) = removed else {
            return false;
        };
        let _ = self.poller_read().delete(fd);
        if peer.delay > 0 {
            self.watch.away(fd);
        }
        // Both halves of a paired primitive leave together.
        for sock in peer.socks {
            if sock != INVALID_FD {
                self.partners.del(sock);
            }
        }
        true
    }

    /// Removes one event kind without disturbing the others.
    pub fn del_kind(&self, id: u64, fd: Fd, kind: EventKind) -> bool {
        let mut peers = self.lock_peers();
        let Some(peer) = peers.get_mut(&fd) else {
            return false;
        };
        if peer.id != id || peer.modes.remove(&kind).is_none() {
            return false;
        }
        let (read, write) = peer.interests();
        drop(peers);
        if let Err(err) = self.poller_read().modify(fd, read, write) {
            debug!("interest update after removing {kind:?} on fd {fd} failed: {err}");
        }
        true
    }

    /// Toggles interest in one event kind. Disabled kinds stay registered
    /// but are not presented to the OS poller.
    pub fn mode(&self, id: u64, fd: Fd, kind: EventKind, mode: EventMode) -> Result<()> {
        let mut peers = self.lock_peers();
        let peer = peers
            .get_mut(&fd)
            .filter(|peer| peer.id == id)
            .ok_or_else(|| {
                Error::IllegalState(format!("no registration for id {id} on descriptor {fd}"))
            })?;
        peer.modes.insert(kind, mode);
        let (read, write) = peer.interests();
        drop(peers);
        self.poller_read().modify(fd, read, write)
    }

    /// Creates a cross-thread upstream slot. The returned wakeup fd is given
    /// to [`upstream`](Self::upstream) by any thread; `callback` then runs on
    /// the loop thread, FIFO with respect to the signalling order.
    pub fn activation_upstream(
        &self,
        callback: impl Fn(u64) + Send + Sync + 'static,
    ) -> Result<Fd> {
        let notifier = Arc::new(Notifier::new()?);
        let fds = notifier.fds();
        self.poller_read().add(fds[0], true, false)?;
        if fds[1] != fds[0] {
            self.partners.merge(fds[0], fds[1]);
        }
        self.lock_upstreams().insert(
            fds[0],
            UpstreamSlot {
                notifier,
                callback: Arc::new(callback),
            },
        );
        Ok(fds[0])
    }

    /// Tears an upstream slot down.
    pub fn deactivation_upstream(&self, sock: Fd) {
        if self.lock_upstreams().remove(&sock).is_some() {
            let _ = self.poller_read().delete(sock);
            self.partners.del(sock);
        }
    }

    /// Queues `tid` for delivery to the slot's callback on the loop thread.
    pub fn upstream(&self, sock: Fd, tid: u64) -> Result<()> {
        let notifier = self
            .lock_upstreams()
            .get(&sock)
            .map(|slot| Arc::clone(&slot.notifier))
            .ok_or_else(|| {
                Error::IllegalState(format!("descriptor {sock} is not an upstream slot"))
            })?;
        notifier.notify(tid)
    }

    /// Runs the loop on the calling thread until [`stop`](Self::stop).
    pub fn start(&self) -> Result<()> {
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(Error::IllegalState("the event loop is already running".into()));
        }
        self.works.store(true, Ordering::SeqCst);
        *self.lock_loop_thread() = Some(thread::current().id());

        let result = self.run_loop();

        *self.lock_loop_thread() = None;
        self.launched.store(false, Ordering::SeqCst);
        result
    }

    /// Asks the loop to exit. When called from outside the loop thread this
    /// blocks until the loop has wound down, so that no registered callback
    /// runs after `stop` returns.
    pub fn stop(&self) {
        self.works.store(false, Ordering::SeqCst);
        let _ = self.waker.notify(0);

        let on_loop_thread = *self.lock_loop_thread() == Some(thread::current().id());
        if !on_loop_thread {
            while self.launched.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Wakes a blocked poll without changing any state.
    pub fn kick(&self) {
        let _ = self.waker.notify(0);
    }

    /// Atomically replaces the OS poll state and re-registers every live
    /// descriptor. Used after `fork` to drop the parent's poller.
    pub fn rebase(&self) -> Result<()> {
        let fresh = new_poller(self.sockmax.load(Ordering::Relaxed) as usize)?;
        fresh.add(self.waker.read_fd(), true, false)?;

        let mut dead = Vec::new();
        {
            let peers = self.lock_peers();
            for (&fd, peer) in peers.iter() {
                let (read, write) = peer.interests();
                if let Err(err) = fresh.add(fd, read, write) {
                    warn!("descriptor {fd} did not survive rebase: {err}");
                    dead.push(fd);
                }
            }
        }
        {
            let upstreams = self.lock_upstreams();
            for &fd in upstreams.keys() {
                if let Err(err) = fresh.add(fd, true, false) {
                    warn!("upstream descriptor {fd} did not survive rebase: {err}");
                }
            }
        }
        for fd in dead {
            self.lock_peers().remove(&fd);
            self.partners.del(fd);
        }

        *self.poller_write() = fresh;
        Ok(())
    }

    /// Drops every registration and upstream slot.
    pub fn clear(&self) {
        let peers: Vec<(Fd, u64)> = self
            .lock_peers()
            .iter()
            .map(|(&fd, peer)| (fd, peer.id))
            .collect();
        for (fd, id) in peers {
            self.del(id, fd);
        }
        let upstreams: Vec<Fd> = self.lock_upstreams().keys().copied().collect();
        for fd in upstreams {
            self.deactivation_upstream(fd);
        }
    }

    /// When frozen, readiness is collected but callbacks are not invoked.
    pub fn freeze(&self, mode: bool) {
        self.frozen.store(mode, Ordering::SeqCst);
    }

    /// Easy mode: non-blocking polls with a cooperative sleep in between.
    pub fn easily(&self, mode: bool) {
        self.easily.store(mode, Ordering::SeqCst);
        let _ = self.waker.notify(0);
    }

    /// Poll block time in milliseconds.
    pub fn rate(&self, msec: u32) {
        self.rate.store(msec.max(1), Ordering::SeqCst);
    }

    /// Cap on concurrently tracked sockets.
    pub fn sockmax(&self, count: u32) {
        self.sockmax.store(count.max(1), Ordering::SeqCst);
    }

    /// Whether the loop currently runs on some thread.
    pub fn launched(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }

    fn run_loop(&self) -> Result<()> {
        let mut events: Vec<PollEvent> = Vec::with_capacity(1024);
        while self.works.load(Ordering::SeqCst) {
            events.clear();
            let easily = self.easily.load(Ordering::SeqCst);
            let rate = self.rate.load(Ordering::SeqCst);
            let timeout = if easily { 0 } else { rate as i32 };

            let wait = self.poller_read().wait(timeout, &mut events);
            if let Err(err) = wait {
                error!("poll failed: {err}");
                thread::sleep(Duration::from_millis(u64::from(rate)));
                continue;
            }
            if !self.works.load(Ordering::SeqCst) {
                break;
            }

            self.dispatch(&events);

            if easily {
                thread::sleep(Duration::from_millis(u64::from(rate)));
            }
        }
        Ok(())
    }

    fn dispatch(&self, events: &[PollEvent]) {
        let frozen = self.frozen.load(Ordering::SeqCst);

        let mut timers = Vec::new();
        let mut io = Vec::new();
        let mut upstream = Vec::new();
        for &event in events {
            if event.fd == self.waker.read_fd() {
                self.waker.reset();
                continue;
            }
            if frozen {
                continue;
            }
            if self.lock_upstreams().contains_key(&event.fd) {
                upstream.push(event.fd);
            } else {
                let is_timer = self
                    .lock_peers()
                    .get(&event.fd)
                    .map(|peer| peer.delay > 0)
                    .unwrap_or(false);
                if is_timer {
                    timers.push(event.fd);
                } else {
                    io.push(event);
                }
            }
        }

        // Timers fire before I/O of the same iteration.
        for fd in timers {
            if self.watch.event(fd).is_none() {
                // Spurious wakeup or a cancellation race; nothing to deliver.
                continue;
            }
            let snapshot = {
                let peers = self.lock_peers();
                peers
                    .get(&fd)
                    .filter(|peer| peer.enabled(EventKind::Timer))
                    .map(|peer| (peer.id, Arc::clone(&peer.callback), peer.persist, peer.delay))
            };
            let Some((id, callback, persist, delay)) = snapshot else {
                continue;
            };
            if persist {
                if let Err(err) = self.watch.wait(fd, delay) {
                    warn!("persistent timer {fd} could not be rearmed: {err}");
                }
            }
            self.invoke(id, fd, EventKind::Timer, &callback);
        }

        // I/O in the order the OS reported it.
        for event in io {
            if event.readable {
                if let Some((id, callback)) = self.snapshot_if(event.fd, EventKind::Read) {
                    self.invoke(id, event.fd, EventKind::Read, &callback);
                }
            }
            if event.writable {
                if let Some((id, callback)) = self.snapshot_if(event.fd, EventKind::Write) {
                    self.invoke(id, event.fd, EventKind::Write, &callback);
                }
            }
            if event.closed || event.error {
                let snapshot = {
                    let mut peers = self.lock_peers();
                    match peers.get_mut(&event.fd) {
                        Some(peer) => {
                            let had_interest = peer.enabled(EventKind::Close);
                            if !had_interest {
                                // Nobody asked for CLOSE: quiesce the fd and
                                // push the condition through the default
                                // callback anyway.
                                peer.modes.insert(EventKind::Read, EventMode::Disabled);
                                peer.modes.insert(EventKind::Write, EventMode::Disabled);
                            }
                            Some((peer.id, Arc::clone(&peer.callback), had_interest))
                        }
                        None => None,
                    }
                };
                if let Some((id, callback, had_interest)) = snapshot {
                    if !had_interest {
                        let _ = self.poller_read().modify(event.fd, false, false);
                    }
                    self.invoke(id, event.fd, EventKind::Close, &callback);
                }
            }
        }

        // Upstream ingress is serviced at the end of each iteration.
        for fd in upstream {
            let slot = self
                .lock_upstreams()
                .get(&fd)
                .map(|slot| (Arc::clone(&slot.notifier), Arc::clone(&slot.callback)));
            let Some((notifier, callback)) = slot else {
                continue;
            };
            while let Some(tid) = notifier.event() {
                let outcome = catch_unwind(AssertUnwindSafe(|| callback(tid)));
                if outcome.is_err() {
                    error!("upstream callback on fd {fd} panicked; slot disabled");
                    self.deactivation_upstream(fd);
                    break;
                }
            }
        }
    }

    /// Re-checks that `(fd, kind)` is still live right before delivery, so
    /// a registration removed earlier in the batch is never called again.
    fn snapshot_if(&self, fd: Fd, kind: EventKind) -> Option<(u64, Callback)> {
        let peers = self.lock_peers();
        peers
            .get(&fd)
            .filter(|peer| peer.enabled(kind))
            .map(|peer| (peer.id, Arc::clone(&peer.callback)))
    }

    fn invoke(&self, id: u64, fd: Fd, kind: EventKind, callback: &Callback) {
        let outcome = catch_unwind(AssertUnwindSafe(|| callback(fd, kind)));
        if outcome.is_err() {
            error!("callback for fd {fd} ({kind:?}) panicked; handle force-disabled");
            let disabled = {
                let mut peers = self.lock_peers();
                match peers.get_mut(&fd) {
                    Some(peer) if peer.id == id => {
                        for mode in peer.modes.values_mut() {
                            *mode = EventMode::Disabled;
                        }
                        true
                    }
                    _ => false,
                }
            };
            if disabled {
                let _ = self.poller_read().modify(fd, false, false);
            }
        }
    }

    fn poller_read(&self) -> std::sync::RwLockReadGuard<'_, Box<dyn OsPoller>> {
        self.poller.read().unwrap_or_else(|e| e.into_inner())
    }

    fn poller_write(&self) -> std::sync::RwLockWriteGuard<'_, Box<dyn OsPoller>> {
        self.poller.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, HashMap<Fd, Peer>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_upstreams(&self) -> std::sync::MutexGuard<'_, HashMap<Fd, UpstreamSlot>> {
        self.upstreams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_loop_thread(&self) -> std::sync::MutexGuard<'_, Option<thread::ThreadId>> {
        self.loop_thread.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for EventBase {
    fn drop(&mut self) {
        self.stop();
    }
}
