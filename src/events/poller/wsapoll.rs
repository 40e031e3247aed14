//! Windows backend: `WSAPoll` over a rebuilt descriptor array.
//!
//! Readiness-based like the unix backends; no overlapped I/O. The Winsock
//! API is started when the first poller is built and torn down when the
//! last one is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{OsPoller, PollEvent};
use crate::error::{Error, Result};
use crate::net::socket::Fd;

use windows_sys::Win32::Networking::WinSock as ws;

static WINSOCK_USERS: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn winsock_init() {
    if WINSOCK_USERS.fetch_add(1, Ordering::SeqCst) == 0 {
        let mut data: ws::WSADATA = unsafe { std::mem::zeroed() };
        // 2.2, the only version anyone has shipped this century.
        unsafe { ws::WSAStartup(0x0202, &mut data) };
    }
}

pub(crate) fn winsock_shutdown() {
    if WINSOCK_USERS.fetch_sub(1, Ordering::SeqCst) == 1 {
        unsafe { ws::WSACleanup() };
    }
}

pub(crate) struct WsaPoller {
    registered: Mutex<HashMap<Fd, (bool, bool)>>,
    capacity: usize,
}

impl WsaPoller {
    pub(crate) fn new(capacity: usize) -> Result<Self> {
        winsock_init();
        Ok(Self {
            registered: Mutex::new(HashMap::new()),
            capacity: capacity.clamp(64, 4096),
        })
    }
}

impl OsPoller for WsaPoller {
    fn add(&self, fd: Fd, read: bool, write: bool) -> Result<()> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if registered.len() >= self.capacity {
            return Err(Error::Capacity(format!(
                "WSAPoll set is limited to {} sockets",
                self.capacity
            )));
        }
        registered.insert(fd, (read, write));
        Ok(())
    }

    fn modify(&self, fd: Fd, read: bool, write: bool) -> Result<()> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        match registered.get_mut(&fd) {
            Some(entry) => {
                *entry = (read, write);
                Ok(())
            }
            None => Err(Error::IllegalState(format!(
                "socket {fd} is not registered with WSAPoll"
            ))),
        }
    }

    fn delete(&self, fd: Fd) -> Result<()> {
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&fd);
        Ok(())
    }

    fn wait(&self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> Result<usize> {
        let mut fds: Vec<ws::WSAPOLLFD> = {
            let registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
            registered
                .iter()
                .map(|(&fd, &(read, write))| {
                    let mut events = 0i16;
                    if read {
                        events |= ws::POLLRDNORM as i16;
                    }
                    if write {
                        events |= ws::POLLWRNORM as i16;
                    }
                    ws::WSAPOLLFD {
                        fd,
                        events,
                        revents: 0,
                    }
                })
                .collect()
        };
        if fds.is_empty() {
            // WSAPoll rejects an empty array; emulate a plain sleep.
            if timeout_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(timeout_ms as u64));
            }
            return Ok(0);
        }

        let rc = unsafe { ws::WSAPoll(fds.as_mut_ptr(), fds.len() as u32, timeout_ms) };
        if rc == ws::SOCKET_ERROR {
            return Err(Error::last_os("WSAPoll"));
        }
        let mut reported = 0;
        for record in &fds {
            if record.revents == 0 {
                continue;
            }
            reported += 1;
            out.push(PollEvent {
                fd: record.fd,
                readable: record.revents & ws::POLLRDNORM as i16 != 0,
                writable: record.revents & ws::POLLWRNORM as i16 != 0,
                closed: record.revents & ws::POLLHUP as i16 != 0,
                error: record.revents & (ws::POLLERR as i16 | ws::POLLNVAL as i16) != 0,
            });
        }
        Ok(reported)
    }
}

impl Drop for WsaPoller {
    fn drop(&mut self) {
        winsock_shutdown();
    }
}
