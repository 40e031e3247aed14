//! BSD/macOS backend: `kqueue` + `kevent`, one filter per interest.

use std::collections::HashMap;
use std::ptr;
use std::sync::Mutex;

use super::{OsPoller, PollEvent};
use crate::error::{Error, Result};
use crate::net::socket::Fd;

pub(crate) struct KqueuePoller {
    kq: Fd,
    /// Current interest set per fd, needed to diff on `modify`.
    registered: Mutex<HashMap<Fd, (bool, bool)>>,
    events: Mutex<Vec<libc::kevent>>,
}

impl KqueuePoller {
    pub(crate) fn new(capacity: usize) -> Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq == -1 {
            return Err(Error::last_os("kqueue"));
        }
        let empty = unsafe { std::mem::zeroed::<libc::kevent>() };
        Ok(Self {
            kq,
            registered: Mutex::new(HashMap::new()),
            events: Mutex::new(vec![empty; capacity.clamp(64, 4096)]),
        })
    }

    fn change(&self, fd: Fd, filter: i16, flags: u16, context: &str) -> Result<()> {
        let change = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        let rc = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc == -1 {
            Err(Error::last_os(context))
        } else {
            Ok(())
        }
    }

    fn apply(&self, fd: Fd, read: bool, write: bool, had: (bool, bool)) -> Result<()> {
        if read && !had.0 {
            self.change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE, "kevent(EV_ADD read)")?;
        } else if !read && had.0 {
            self.change(fd, libc::EVFILT_READ, libc::EV_DELETE, "kevent(EV_DELETE read)")?;
        }
        if write && !had.1 {
            self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ENABLE, "kevent(EV_ADD write)")?;
        } else if !write && had.1 {
            self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, "kevent(EV_DELETE write)")?;
        }
        Ok(())
    }
}

impl OsPoller for KqueuePoller {
    fn add(&self, fd: Fd, read: bool, write: bool) -> Result<()> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        self.apply(fd, read, write, (false, false))?;
        registered.insert(fd, (read, write));
        Ok(())
    }

    fn modify(&self, fd: Fd, read: bool, write: bool) -> Result<()> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        let had = registered.get(&fd).copied().ok_or_else(|| {
            Error::IllegalState(format!("fd {fd} is not registered with kqueue"))
        })?;
        self.apply(fd, read, write, had)?;
        registered.insert(fd, (read, write));
        Ok(())
    }

    fn delete(&self, fd: Fd) -> Result<()> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((read, write)) = registered.remove(&fd) {
            // A closed fd drops its filters on its own; ignore those errors.
            if read {
                let _ = self.change(fd, libc::EVFILT_READ, libc::EV_DELETE, "kevent(EV_DELETE read)");
            }
            if write {
                let _ = self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, "kevent(EV_DELETE write)");
            }
        }
        Ok(())
    }

    fn wait(&self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> Result<usize> {
        let timespec;
        let timeout_ptr = if timeout_ms < 0 {
            ptr::null()
        } else {
            timespec = libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: i64::from(timeout_ms % 1000) * 1_000_000,
            };
            &timespec as *const libc::timespec
        };

        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let n = loop {
            let rc = unsafe {
                libc::kevent(
                    self.kq,
                    ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    timeout_ptr,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(Error::io("kevent", err));
            }
        };
        for event in &events[..n] {
            out.push(PollEvent {
                fd: event.ident as Fd,
                readable: event.filter == libc::EVFILT_READ,
                writable: event.filter == libc::EVFILT_WRITE,
                closed: event.flags & libc::EV_EOF != 0,
                error: event.flags & libc::EV_ERROR != 0,
            });
        }
        Ok(n)
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
