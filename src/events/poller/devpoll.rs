//! Solaris/illumos backend: the `/dev/poll` driver.
//!
//! Interest changes are `pollfd` records written to the device; readiness is
//! collected with the `DP_POLL` ioctl. `POLLREMOVE` drops a descriptor.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Mutex;

use super::{OsPoller, PollEvent};
use crate::error::{Error, Result};
use crate::net::socket::Fd;

// From <sys/devpoll.h>: DPIOC = 0xD0 << 8, DP_POLL = DPIOC | 1.
const DP_POLL: libc::c_int = (0xD0 << 8) | 1;

#[repr(C)]
struct DvPoll {
    dp_fds: *mut libc::pollfd,
    dp_nfds: libc::c_int,
    dp_timeout: libc::c_int,
}

pub(crate) struct DevPollPoller {
    dpfd: Fd,
    registered: Mutex<HashMap<Fd, (bool, bool)>>,
    events: Mutex<Vec<libc::pollfd>>,
}

impl DevPollPoller {
    pub(crate) fn new(capacity: usize) -> Result<Self> {
        let path = CString::new("/dev/poll").expect("static path");
        let dpfd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if dpfd == -1 {
            return Err(Error::last_os("open(/dev/poll)"));
        }
        Ok(Self {
            dpfd,
            registered: Mutex::new(HashMap::new()),
            events: Mutex::new(vec![
                libc::pollfd {
                    fd: 0,
                    events: 0,
                    revents: 0,
                };
                capacity.clamp(64, 4096)
            ]),
        })
    }

    fn submit(&self, fd: Fd, events: i16, context: &str) -> Result<()> {
        let record = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let n = unsafe {
            libc::write(
                self.dpfd,
                &record as *const libc::pollfd as *const libc::c_void,
                std::mem::size_of::<libc::pollfd>(),
            )
        };
        if n != std::mem::size_of::<libc::pollfd>() as libc::ssize_t {
            Err(Error::last_os(context))
        } else {
            Ok(())
        }
    }

    fn interests(read: bool, write: bool) -> i16 {
        let mut events = 0;
        if read {
            events |= libc::POLLIN;
        }
        if write {
            events |= libc::POLLOUT;
        }
        events
    }
}

impl OsPoller for DevPollPoller {
    fn add(&self, fd: Fd, read: bool, write: bool) -> Result<()> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        self.submit(fd, Self::interests(read, write), "write(/dev/poll add)")?;
        registered.insert(fd, (read, write));
        Ok(())
    }

    fn modify(&self, fd: Fd, read: bool, write: bool) -> Result<()> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if !registered.contains_key(&fd) {
            return Err(Error::IllegalState(format!(
                "fd {fd} is not registered with /dev/poll"
            )));
        }
        // The driver accumulates interests per fd; remove before re-adding.
        self.submit(fd, libc::POLLREMOVE, "write(/dev/poll remove)")?;
        self.submit(fd, Self::interests(read, write), "write(/dev/poll add)")?;
        registered.insert(fd, (read, write));
        Ok(())
    }

    fn delete(&self, fd: Fd) -> Result<()> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if registered.remove(&fd).is_some() {
            self.submit(fd, libc::POLLREMOVE, "write(/dev/poll remove)")?;
        }
        Ok(())
    }

    fn wait(&self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> Result<usize> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let mut request = DvPoll {
            dp_fds: events.as_mut_ptr(),
            dp_nfds: events.len() as libc::c_int,
            dp_timeout: timeout_ms,
        };
        let n = loop {
            let rc = unsafe { libc::ioctl(self.dpfd, DP_POLL as _, &mut request) };
            if rc >= 0 {
                break rc as usize;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(Error::io("ioctl(DP_POLL)", err));
            }
        };
        for event in &events[..n] {
            let bits = event.revents;
            out.push(PollEvent {
                fd: event.fd,
                readable: bits & libc::POLLIN != 0,
                writable: bits & libc::POLLOUT != 0,
                closed: bits & libc::POLLHUP != 0,
                error: bits & (libc::POLLERR | libc::POLLNVAL) != 0,
            });
        }
        Ok(n)
    }
}

impl Drop for DevPollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.dpfd);
        }
    }
}
