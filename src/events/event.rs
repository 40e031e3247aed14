//! User-facing handle binding {base, fd or timer, callback, event kinds}.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::events::base::{Callback, EventBase, EventKind, EventMode};
use crate::net::socket::{Fd, INVALID_FD};

/// Handle ids are process-unique; the base uses them to tell registrations
/// of the same fd apart across remove/re-add cycles.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// An fd the caller owns.
    Event,
    /// A timer whose fd is acquired from the base's Watch.
    Timer,
}

struct Inner {
    kind: EventType,
    fd: Fd,
    delay: u32,
    series: bool,
    started: bool,
    base: Option<Arc<EventBase>>,
    callback: Option<Callback>,
}

/// One logical registration with an event base.
///
/// Construct, attach a base and a callback (plus an fd for `Event` handles or
/// a timeout for `Timer` handles), then `start()`. Dropping the handle stops
/// it. A handle must outlive nothing: its base owns all loop state.
pub struct Event {
    id: u64,
    inner: Mutex<Inner>,
}

impl Event {
    pub fn new(kind: EventType) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(Inner {
                kind,
                fd: INVALID_FD,
                delay: 0,
                series: false,
                started: false,
                base: None,
                callback: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EventType {
        self.lock().kind
    }

    /// The registered fd; for timers this is only valid after `start()`.
    pub fn fd(&self) -> Fd {
        self.lock().fd
    }

    /// Attaches the event base. Disallowed while started.
    pub fn attach(&self, base: Arc<EventBase>) -> Result<()> {
        let mut inner = self.lock();
        if inner.started {
            return Err(Error::IllegalState(
                "cannot reassign the base of a started event".into(),
            ));
        }
        inner.base = Some(base);
        Ok(())
    }

    /// Assigns the fd to track. Disallowed while started and meaningless for
    /// timer handles.
    pub fn set_fd(&self, fd: Fd) -> Result<()> {
        let mut inner = self.lock();
        if inner.started {
            return Err(Error::IllegalState(
                "cannot reassign the fd of a started event".into(),
            ));
        }
        inner.fd = fd;
        Ok(())
    }

    pub fn set_callback(&self, callback: impl Fn(Fd, EventKind) + Send + Sync + 'static) {
        self.lock().callback = Some(Arc::new(callback));
    }

    /// Configures the timer delay. `series = false` is single shot,
    /// `series = true` rearms after each fire.
    pub fn timeout(&self, delay_ms: u32, series: bool) -> Result<()> {
        let mut inner = self.lock();
        if inner.started {
            return Err(Error::IllegalState(
                "cannot retime a started event; stop it first".into(),
            ));
        }
        inner.kind = EventType::Timer;
        inner.delay = delay_ms;
        inner.series = series;
        Ok(())
    }

    /// Registers with the base. Timer handles also get their TIMER kind
    /// enabled; plain events start with every kind disabled.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.started {
            return Err(Error::IllegalState("event is already started".into()));
        }
        let base = inner
            .base
            .clone()
            .ok_or_else(|| Error::IllegalState("event has no base".into()))?;
        let callback = inner
            .callback
            .clone()
            .ok_or_else(|| Error::IllegalState("event has no callback".into()))?;

        match inner.kind {
            EventType::Timer => {
                if inner.delay == 0 {
                    return Err(Error::IllegalState("timer event has no timeout".into()));
                }
                let fd = base.add(self.id, INVALID_FD, callback, inner.delay, inner.series)?;
                inner.fd = fd;
            }
            EventType::Event => {
                base.add(self.id, inner.fd, callback, 0, false)?;
            }
        }
        inner.started = true;
        Ok(())
    }

    /// Toggles interest in one event kind. Valid only while started.
    pub fn mode(&self, kind: EventKind, mode: EventMode) -> Result<()> {
        let inner = self.lock();
        if !inner.started {
            return Err(Error::IllegalState("event is not started".into()));
        }
        let base = inner
            .base
            .clone()
            .ok_or_else(|| Error::IllegalState("event has no base".into()))?;
        let fd = inner.fd;
        drop(inner);
        base.mode(self.id, fd, kind, mode)
    }

    /// Removes one event kind, leaving the others registered.
    pub fn del(&self, kind: EventKind) -> bool {
        let inner = self.lock();
        if !inner.started {
            return false;
        }
        let (base, fd) = match (&inner.base, inner.fd) {
            (Some(base), fd) => (Arc::clone(base), fd),
            _ => return false,
        };
        drop(inner);
        base.del_kind(self.id, fd, kind)
    }

    /// Deregisters from the base. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if !inner.started {
            return;
        }
        inner.started = false;
        let fd = inner.fd;
        let base = inner.base.clone();
        if inner.kind == EventType::Timer {
            inner.fd = INVALID_FD;
        }
        drop(inner);
        if let Some(base) = base {
            base.del(self.id, fd);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn pipe_pair() -> (Fd, Fd) {
        let mut fds = [0 as Fd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn reassignment_while_started_is_rejected() {
        let base = Arc::new(EventBase::new().unwrap());
        let (rx, tx) = pipe_pair();

        let event = Event::new(EventType::Event);
        event.attach(Arc::clone(&base)).unwrap();
        event.set_fd(rx).unwrap();
        event.set_callback(|_, _| {});
        event.start().unwrap();

        assert!(matches!(event.set_fd(tx), Err(Error::IllegalState(_))));
        assert!(matches!(event.attach(base), Err(Error::IllegalState(_))));
        assert!(matches!(event.start(), Err(Error::IllegalState(_))));

        event.stop();
        event.set_fd(rx).unwrap();

        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn drop_stops_the_registration() {
        let base = Arc::new(EventBase::new().unwrap());
        let (rx, tx) = pipe_pair();
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let event = Event::new(EventType::Event);
            event.attach(Arc::clone(&base)).unwrap();
            event.set_fd(rx).unwrap();
            let counter = Arc::clone(&hits);
            event.set_callback(move |fd, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 8];
                let _ = crate::net::socket::read(fd, &mut buf);
            });
            event.start().unwrap();
            event.mode(EventKind::Read, EventMode::Enabled).unwrap();

            let loop_base = Arc::clone(&base);
            let handle = thread::spawn(move || loop_base.start().unwrap());
            crate::net::socket::write(tx, b"x").unwrap();
            thread::sleep(Duration::from_millis(100));
            assert_eq!(hits.load(Ordering::SeqCst), 1);

            base.stop();
            handle.join().unwrap();
        } // event dropped here

        // The fd can be registered again under a fresh handle.
        let event = Event::new(EventType::Event);
        event.attach(Arc::clone(&base)).unwrap();
        event.set_fd(rx).unwrap();
        event.set_callback(|_, _| {});
        event.start().unwrap();
        event.stop();

        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn timer_handles_acquire_their_fd_from_the_watch() {
        let base = Arc::new(EventBase::new().unwrap());
        let fired = Arc::new(AtomicUsize::new(0));

        let event = Event::new(EventType::Timer);
        event.attach(Arc::clone(&base)).unwrap();
        event.timeout(20, false).unwrap();
        let counter = Arc::clone(&fired);
        event.set_callback(move |_, kind| {
            assert_eq!(kind, EventKind::Timer);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(event.fd(), INVALID_FD);
        event.start().unwrap();
        assert_ne!(event.fd(), INVALID_FD);

        let loop_base = Arc::clone(&base);
        let handle = thread::spawn(move || loop_base.start().unwrap());
        thread::sleep(Duration::from_millis(150));
        base.stop();
        handle.join().unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
