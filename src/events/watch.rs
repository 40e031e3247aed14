//! Timer subsystem: turns scheduled delays into notifier fires.
//!
//! One background thread owns the deadline book. It sleeps until the nearest
//! deadline or until a command arrives, then fires the owning timer's
//! notifier. User callbacks are never invoked from this thread; the event
//! base observes the notifier fd like any other readable descriptor.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::warn;

use crate::error::{Error, Result};
use crate::events::notifier::Notifier;
use crate::net::socket::Fd;

enum Command {
    /// Schedule (or reschedule) a single shot for `fd`.
    Wait { fd: Fd, delay: Duration },
    /// Cancel any pending shot for `fd`; ack once the cancellation is
    /// observable (used to keep `away` race-free).
    Cancel { fd: Fd, done: SyncSender<()> },
    Stop,
}

/// Per-timer bookkeeping shared between the callers and the worker thread.
#[derive(Default)]
struct Registry {
    notifiers: HashMap<Fd, Arc<Notifier>>,
}

pub struct Watch {
    registry: Arc<Mutex<Registry>>,
    sender: Mutex<Sender<Command>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Watch {
    pub fn new() -> Self {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (sender, receiver) = mpsc::channel();
        let thread = {
            let registry = Arc::clone(&registry);
            thread::Builder::new()
                .name("awh-watch".into())
                .spawn(move || worker_loop(registry, receiver))
                .expect("spawning the watch thread cannot fail")
        };
        Self {
            registry,
            sender: Mutex::new(sender),
            thread: Some(thread),
        }
    }

    /// Allocates a new logical timer and returns its notifier fds. The caller
    /// registers the read side with its event base.
    pub fn create(&self) -> Result<[Fd; 2]> {
        let notifier = Arc::new(Notifier::new()?);
        let fds = notifier.fds();
        self.lock_registry().notifiers.insert(fds[0], notifier);
        Ok(fds)
    }

    /// Schedules a single shot; at the deadline the timer's notifier fires.
    pub fn wait(&self, fd: Fd, delay_ms: u32) -> Result<()> {
        if !self.lock_registry().notifiers.contains_key(&fd) {
            return Err(Error::IllegalState(format!(
                "timer fd {fd} was never created"
            )));
        }
        self.send(Command::Wait {
            fd,
            delay: Duration::from_millis(u64::from(delay_ms)),
        })
    }

    /// Cancels any pending shot and removes the timer. When this returns the
    /// timer's notifier is drained: a shot that already fired is swallowed.
    pub fn away(&self, fd: Fd) {
        let (done, ack) = mpsc::sync_channel(1);
        if self.send(Command::Cancel { fd, done }).is_ok() {
            let _ = ack.recv();
        }
        if let Some(notifier) = self.lock_registry().notifiers.remove(&fd) {
            notifier.reset();
        }
    }

    /// Reads the payload the timer fired with.
    pub fn event(&self, fd: Fd) -> Option<u64> {
        let notifier = self.lock_registry().notifiers.get(&fd).cloned()?;
        notifier.event()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(command)
            .map_err(|_| Error::Fatal("watch thread is gone".into()))
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        let _ = self.send(Command::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_loop(registry: Arc<Mutex<Registry>>, receiver: Receiver<Command>) {
    // Deadline book. Keys carry a registration sequence so timers that share
    // a deadline fire in registration order.
    let mut deadlines: BTreeMap<(Instant, u64), Fd> = BTreeMap::new();
    let mut by_fd: HashMap<Fd, (Instant, u64)> = HashMap::new();
    let mut seq: u64 = 0;

    loop {
        let timeout = deadlines
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(3600));

        match receiver.recv_timeout(timeout) {
            Ok(Command::Wait { fd, delay }) => {
                if let Some(old) = by_fd.remove(&fd) {
                    deadlines.remove(&old);
                }
                let key = (Instant::now() + delay, seq);
                seq += 1;
                deadlines.insert(key, fd);
                by_fd.insert(fd, key);
            }
            Ok(Command::Cancel { fd, done }) => {
                if let Some(key) = by_fd.remove(&fd) {
                    deadlines.remove(&key);
                }
                let _ = done.send(());
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        // Fire everything that is due, in key order.
        let now = Instant::now();
        while let Some((&(deadline, fire_id), &fd)) = deadlines.iter().next() {
            if deadline > now {
                break;
            }
            deadlines.remove(&(deadline, fire_id));
            by_fd.remove(&fd);
            let notifier = registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .notifiers
                .get(&fd)
                .cloned();
            match notifier {
                Some(notifier) => {
                    if let Err(err) = notifier.notify(fire_id) {
                        warn!("timer fd {fd} could not be fired: {err}");
                    }
                }
                // Removed concurrently; nothing to fire.
                None => {}
            }
        }
    }
}

impl Default for Watch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable_within(fd: Fd, ms: i32) -> bool {
        #[cfg(unix)]
        {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            return unsafe { libc::poll(&mut pfd, 1, ms) == 1 };
        }
        #[cfg(not(unix))]
        {
            let _ = (fd, ms);
            unimplemented!()
        }
    }

    #[test]
    fn single_shot_fires_once() {
        let watch = Watch::new();
        let fds = watch.create().unwrap();
        watch.wait(fds[0], 20).unwrap();

        assert!(readable_within(fds[0], 1000));
        assert!(watch.event(fds[0]).is_some());
        assert!(watch.event(fds[0]).is_none());

        // No rearm happens on its own.
        assert!(!readable_within(fds[0], 60));
        watch.away(fds[0]);
    }

    #[test]
    fn same_deadline_fires_in_registration_order() {
        let watch = Watch::new();
        let first = watch.create().unwrap();
        let second = watch.create().unwrap();
        watch.wait(first[0], 30).unwrap();
        watch.wait(second[0], 30).unwrap();

        assert!(readable_within(first[0], 1000));
        assert!(readable_within(second[0], 1000));
        let first_id = watch.event(first[0]).unwrap();
        let second_id = watch.event(second[0]).unwrap();
        assert!(first_id < second_id);

        watch.away(first[0]);
        watch.away(second[0]);
    }

    #[test]
    fn cancellation_swallows_a_posted_fire() {
        let watch = Watch::new();
        let fds = watch.create().unwrap();
        watch.wait(fds[0], 1).unwrap();

        // Let the shot land in the notifier, then cancel; `away` must drain it.
        std::thread::sleep(Duration::from_millis(50));
        watch.away(fds[0]);
        assert!(watch.event(fds[0]).is_none());
    }

    #[test]
    fn rescheduling_replaces_the_pending_shot() {
        let watch = Watch::new();
        let fds = watch.create().unwrap();
        watch.wait(fds[0], 5_000).unwrap();
        watch.wait(fds[0], 20).unwrap();

        assert!(readable_within(fds[0], 1000));
        assert!(watch.event(fds[0]).is_some());
        watch.away(fds[0]);
    }
}
