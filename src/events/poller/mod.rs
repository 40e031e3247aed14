//! OS readiness pollers behind one contract.
//!
//! Linux uses `epoll`, the BSDs and macOS use `kqueue`, Solaris/illumos use
//! `/dev/poll` and Windows uses `WSAPoll`. The event base only speaks the
//! [`OsPoller`] trait; everything platform-specific stays in this directory.

use crate::error::Result;
use crate::net::socket::Fd;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(any(target_os = "solaris", target_os = "illumos"))]
mod devpoll;
#[cfg(windows)]
mod wsapoll;

/// One readiness report. `closed` covers hangup-style conditions the OS can
/// report without the caller asking for them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub fd: Fd,
    pub readable: bool,
    pub writable: bool,
    pub closed: bool,
    pub error: bool,
}

/// Readiness poller contract. Implementations are internally synchronized so
/// registration from one thread can race a blocked `wait` on another; level
/// triggered semantics throughout.
pub(crate) trait OsPoller: Send + Sync {
    /// Starts tracking `fd`. Both interests may be false; the fd then only
    /// reports hangup/error conditions.
    fn add(&self, fd: Fd, read: bool, write: bool) -> Result<()>;
    /// Replaces the interest set of an already-tracked fd.
    fn modify(&self, fd: Fd, read: bool, write: bool) -> Result<()>;
    /// Stops tracking `fd`.
    fn delete(&self, fd: Fd) -> Result<()>;
    /// Blocks up to `timeout_ms` (`-1` blocks indefinitely, `0` polls) and
    /// appends readiness reports to `out`.
    fn wait(&self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> Result<usize>;
}

/// Builds the poller for the current OS.
pub(crate) fn new_poller(capacity: usize) -> Result<Box<dyn OsPoller>> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        return Ok(Box::new(epoll::EpollPoller::new(capacity)?));
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    {
        return Ok(Box::new(kqueue::KqueuePoller::new(capacity)?));
    }
    #[cfg(any(target_os = "solaris", target_os = "illumos"))]
    {
        return Ok(Box::new(devpoll::DevPollPoller::new(capacity)?));
    }
    #[cfg(windows)]
    {
        return Ok(Box::new(wsapoll::WsaPoller::new(capacity)?));
    }
}

/// Process-wide Winsock bootstrap, refcounted so the last poller dropped
/// shuts the API down again.
#[cfg(windows)]
pub(crate) use wsapoll::{winsock_init, winsock_shutdown};
