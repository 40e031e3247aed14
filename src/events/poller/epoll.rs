//! Linux backend: `epoll_ctl` + `epoll_wait`, level-triggered.

use std::sync::Mutex;

use super::{OsPoller, PollEvent};
use crate::error::{Error, Result};
use crate::net::socket::Fd;

pub(crate) struct EpollPoller {
    epfd: Fd,
    /// Reused between `wait` calls; only the waiting thread touches it.
    events: Mutex<Vec<libc::epoll_event>>,
}

impl EpollPoller {
    pub(crate) fn new(capacity: usize) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(Error::last_os("epoll_create1"));
        }
        Ok(Self {
            epfd,
            events: Mutex::new(vec![
                libc::epoll_event { events: 0, u64: 0 };
                capacity.clamp(64, 4096)
            ]),
        })
    }

    fn interests(read: bool, write: bool) -> u32 {
        // EPOLLRDHUP lets the base observe half-closed pipes as CLOSE
        // instead of a zero-byte read.
        let mut events = libc::EPOLLRDHUP as u32;
        if read {
            events |= libc::EPOLLIN as u32;
        }
        if write {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    fn ctl(&self, op: libc::c_int, fd: Fd, events: u32, context: &str) -> Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc == -1 {
            Err(Error::last_os(context))
        } else {
            Ok(())
        }
    }
}

impl OsPoller for EpollPoller {
    fn add(&self, fd: Fd, read: bool, write: bool) -> Result<()> {
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            Self::interests(read, write),
            "epoll_ctl(ADD)",
        )
    }

    fn modify(&self, fd: Fd, read: bool, write: bool) -> Result<()> {
        self.ctl(
            libc::EPOLL_CTL_MOD,
            fd,
            Self::interests(read, write),
            "epoll_ctl(MOD)",
        )
    }

    fn delete(&self, fd: Fd) -> Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc == -1 {
            Err(Error::last_os("epoll_ctl(DEL)"))
        } else {
            Ok(())
        }
    }

    fn wait(&self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> Result<usize> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(Error::io("epoll_wait", err));
            }
        };
        for event in &events[..n] {
            let bits = event.events;
            out.push(PollEvent {
                fd: event.u64 as Fd,
                readable: bits & libc::EPOLLIN as u32 != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                closed: bits & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32) != 0,
                error: bits & libc::EPOLLERR as u32 != 0,
            });
        }
        Ok(n)
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
