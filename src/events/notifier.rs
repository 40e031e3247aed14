//! Directed wakeup primitive carrying 64-bit payloads.
//!
//! The OS side is only a readiness signal (an eventfd on Linux, a pipe on the
//! other unixes, a loopback UDP pair on Windows); the payloads themselves are
//! buffered in userspace behind a mutex so that N `notify` calls always yield
//! N `event` results in FIFO order, even on primitives that can only carry
//! one bit of readiness.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::net::socket::{self, Fd, INVALID_FD};

pub struct Notifier {
    /// `[read, write]`. On Linux both entries are the same eventfd.
    fds: [Fd; 2],
    queue: Mutex<VecDeque<u64>>,
}

impl Notifier {
    pub fn new() -> Result<Self> {
        let fds = sys::create()?;
        Ok(Self {
            fds,
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// The fd to poll for readability. Readable exactly while the internal
    /// queue is non-empty.
    pub fn read_fd(&self) -> Fd {
        self.fds[0]
    }

    /// The fd the signal is written to. Coincides with [`read_fd`] on
    /// primitives that only need one descriptor.
    ///
    /// [`read_fd`]: Notifier::read_fd
    pub fn write_fd(&self) -> Fd {
        self.fds[1]
    }

    pub fn fds(&self) -> [Fd; 2] {
        self.fds
    }

    /// Enqueues `id` and marks the read side readable. Safe from any thread,
    /// but not from signal handlers (the queue lock is not async-signal-safe).
    pub fn notify(&self, id: u64) -> Result<()> {
        // The payload goes into the queue first so a concurrent `event` that
        // observes the readiness token always finds it.
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(id);
        match sys::signal(self.fds[1]) {
            Ok(()) => Ok(()),
            // A full pipe means enough unread tokens are already pending to
            // keep the fd readable; the payload is queued regardless.
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(Error::io("notifier signal", err)),
        }
    }

    /// Consumes one queued id, oldest first.
    pub fn event(&self) -> Option<u64> {
        let id = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()?;
        sys::consume_one(self.fds[0]);
        Some(id)
    }

    /// Drains the queue and the readiness tokens.
    pub fn reset(&self) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        sys::drain(self.fds[0]);
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        socket::close(self.fds[0]);
        if self.fds[1] != self.fds[0] {
            socket::close(self.fds[1]);
        }
        self.fds = [INVALID_FD; 2];
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod sys {
    use super::Fd;
    use crate::error::{Error, Result};
    use std::io;

    pub fn create() -> Result<[Fd; 2]> {
        let fd = unsafe {
            libc::eventfd(
                0,
                libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE,
            )
        };
        if fd == -1 {
            return Err(Error::last_os("eventfd"));
        }
        Ok([fd, fd])
    }

    /// One semaphore tick per notification, so each `consume_one` strips
    /// exactly one readiness token.
    pub fn signal(fd: Fd) -> io::Result<()> {
        let value = 1u64.to_ne_bytes();
        let n = unsafe { libc::write(fd, value.as_ptr() as *const libc::c_void, value.len()) };
        if n == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn consume_one(fd: Fd) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        }
    }

    pub fn drain(fd: Fd) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
mod sys {
    use super::Fd;
    use crate::error::{Error, Result};
    use std::io;

    pub fn create() -> Result<[Fd; 2]> {
        let mut fds = [0 as Fd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(Error::last_os("pipe"));
        }
        for fd in fds {
            crate::net::socket::set_nonblocking(fd, true)?;
            crate::net::socket::set_close_on_exec(fd)?;
        }
        Ok(fds)
    }

    /// One byte per notification.
    pub fn signal(fd: Fd) -> io::Result<()> {
        let n = unsafe { libc::write(fd, [1u8].as_ptr() as *const libc::c_void, 1) };
        if n == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn consume_one(fd: Fd) {
        let mut buf = [0u8; 1];
        unsafe {
            libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 1);
        }
    }

    pub fn drain(fd: Fd) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::Fd;
    use crate::error::{Error, Result};
    use std::io;
    use std::mem;
    use windows_sys::Win32::Networking::WinSock as ws;

    /// A pair of connected loopback UDP sockets; datagram boundaries make
    /// one-token-per-notification trivial.
    pub fn create() -> Result<[Fd; 2]> {
        crate::events::poller::winsock_init();
        unsafe {
            let recv = ws::socket(ws::AF_INET as i32, ws::SOCK_DGRAM as i32, ws::IPPROTO_UDP as i32);
            let send = ws::socket(ws::AF_INET as i32, ws::SOCK_DGRAM as i32, ws::IPPROTO_UDP as i32);
            if recv == ws::INVALID_SOCKET || send == ws::INVALID_SOCKET {
                return Err(Error::last_os("socket(AF_INET, SOCK_DGRAM)"));
            }
            let mut addr: ws::SOCKADDR_IN = mem::zeroed();
            addr.sin_family = ws::AF_INET;
            addr.sin_addr.S_un.S_addr = u32::from_ne_bytes([127, 0, 0, 1]);
            if ws::bind(
                recv,
                &addr as *const _ as *const ws::SOCKADDR,
                mem::size_of::<ws::SOCKADDR_IN>() as i32,
            ) == ws::SOCKET_ERROR
            {
                return Err(Error::last_os("bind(loopback)"));
            }
            let mut bound: ws::SOCKADDR_IN = mem::zeroed();
            let mut len = mem::size_of::<ws::SOCKADDR_IN>() as i32;
            if ws::getsockname(recv, &mut bound as *mut _ as *mut ws::SOCKADDR, &mut len)
                == ws::SOCKET_ERROR
            {
                return Err(Error::last_os("getsockname(loopback)"));
            }
            if ws::connect(
                send,
                &bound as *const _ as *const ws::SOCKADDR,
                mem::size_of::<ws::SOCKADDR_IN>() as i32,
            ) == ws::SOCKET_ERROR
            {
                return Err(Error::last_os("connect(loopback)"));
            }
            for sock in [recv, send] {
                let mut on: u32 = 1;
                ws::ioctlsocket(sock, ws::FIONBIO, &mut on);
            }
            Ok([recv, send])
        }
    }

    pub fn signal(fd: Fd) -> io::Result<()> {
        let n = unsafe { ws::send(fd, [1u8].as_ptr(), 1, 0) };
        if n == ws::SOCKET_ERROR {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn consume_one(fd: Fd) {
        let mut buf = [0u8; 8];
        unsafe {
            ws::recv(fd, buf.as_mut_ptr(), buf.len() as i32, 0);
        }
    }

    pub fn drain(fd: Fd) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe { ws::recv(fd, buf.as_mut_ptr(), buf.len() as i32, 0) };
            if n <= 0 {
                break;
            }
        }
    }
}
