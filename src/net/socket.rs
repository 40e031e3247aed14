//! Cross-platform socket option surface.
//!
//! Every setter is idempotent and safe to call repeatedly on the same fd.
//! Errors carry the OS-reported message.

use crate::error::{Error, Result};

#[cfg(unix)]
pub type Fd = std::os::unix::io::RawFd;
/// On Windows the reactor tracks Winsock `SOCKET` handles; they are wide
/// enough to need their own alias.
#[cfg(windows)]
pub type Fd = usize;

/// Sentinel for "no descriptor". Descriptors are `INVALID_FD` iff closed.
#[cfg(unix)]
pub const INVALID_FD: Fd = -1;
#[cfg(windows)]
pub const INVALID_FD: Fd = usize::MAX;

/// Which direction of the socket buffer to interrogate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[cfg(unix)]
mod imp {
    use super::{Direction, Fd};
    use crate::error::{Error, Result};
    use std::io;
    use std::mem;

    fn check(rc: libc::c_int, context: &str) -> Result<()> {
        if rc == -1 {
            Err(Error::last_os(context))
        } else {
            Ok(())
        }
    }

    fn setsockopt<T>(fd: Fd, level: libc::c_int, name: libc::c_int, value: T, what: &str) -> Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        check(rc, what)
    }

    /// Toggles `O_NONBLOCK` on the descriptor.
    pub fn set_nonblocking(fd: Fd, on: bool) -> Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags == -1 {
            return Err(Error::last_os("fcntl(F_GETFL)"));
        }
        let flags = if on {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }, "fcntl(F_SETFL)")
    }

    /// Disables (or re-enables) Nagle's algorithm.
    pub fn set_nodelay(fd: Fd, on: bool) -> Result<()> {
        setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            on as libc::c_int,
            "setsockopt(TCP_NODELAY)",
        )
    }

    pub fn set_reuseaddr(fd: Fd) -> Result<()> {
        setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            1 as libc::c_int,
            "setsockopt(SO_REUSEADDR)",
        )
    }

    /// Marks the descriptor close-on-exec.
    pub fn set_close_on_exec(fd: Fd) -> Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags == -1 {
            return Err(Error::last_os("fcntl(F_GETFD)"));
        }
        check(
            unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) },
            "fcntl(F_SETFD)",
        )
    }

    pub fn set_rcvbuf(fd: Fd, bytes: usize) -> Result<()> {
        setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            bytes as libc::c_int,
            "setsockopt(SO_RCVBUF)",
        )
    }

    pub fn set_sndbuf(fd: Fd, bytes: usize) -> Result<()> {
        setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            bytes as libc::c_int,
            "setsockopt(SO_SNDBUF)",
        )
    }

    /// Enables TCP keepalive with the given idle/interval/probe-count knobs.
    /// Knobs that the platform does not expose are silently skipped.
    pub fn set_keepalive(fd: Fd, idle: u32, intvl: u32, cnt: u32) -> Result<()> {
        setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            1 as libc::c_int,
            "setsockopt(SO_KEEPALIVE)",
        )?;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPIDLE,
                idle as libc::c_int,
                "setsockopt(TCP_KEEPIDLE)",
            )?;
            setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPINTVL,
                intvl as libc::c_int,
                "setsockopt(TCP_KEEPINTVL)",
            )?;
            setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPCNT,
                cnt as libc::c_int,
                "setsockopt(TCP_KEEPCNT)",
            )?;
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            let _ = (intvl, cnt);
            setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPALIVE,
                idle as libc::c_int,
                "setsockopt(TCP_KEEPALIVE)",
            )?;
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios"
        )))]
        {
            let _ = (idle, intvl, cnt);
        }
        Ok(())
    }

    /// Suppresses SIGPIPE for writes on this descriptor. Per-fd where the
    /// platform has `SO_NOSIGPIPE`, process-wide otherwise.
    pub fn block_sigpipe(fd: Fd) -> Result<()> {
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        {
            return setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                1 as libc::c_int,
                "setsockopt(SO_NOSIGPIPE)",
            );
        }
        #[cfg(not(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        )))]
        {
            let _ = fd;
            unsafe {
                libc::signal(libc::SIGPIPE, libc::SIG_IGN);
            }
            return Ok(());
        }
    }

    /// Returns how many bytes are pending in the kernel buffer for the given
    /// direction. Platforms without a write-side query report zero.
    pub fn bytes_available(fd: Fd, direction: Direction) -> Result<usize> {
        let mut pending: libc::c_int = 0;
        match direction {
            Direction::Read => {
                check(
                    unsafe { libc::ioctl(fd, libc::FIONREAD as _, &mut pending) },
                    "ioctl(FIONREAD)",
                )?;
            }
            Direction::Write => {
                #[cfg(any(target_os = "linux", target_os = "android"))]
                check(
                    unsafe { libc::ioctl(fd, libc::TIOCOUTQ as _, &mut pending) },
                    "ioctl(TIOCOUTQ)",
                )?;
                #[cfg(any(target_os = "macos", target_os = "ios"))]
                {
                    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
                    check(
                        unsafe {
                            libc::getsockopt(
                                fd,
                                libc::SOL_SOCKET,
                                libc::SO_NWRITE,
                                &mut pending as *mut _ as *mut libc::c_void,
                                &mut len,
                            )
                        },
                        "getsockopt(SO_NWRITE)",
                    )?;
                }
            }
        }
        Ok(pending.max(0) as usize)
    }

    /// On Linux, resizes a pipe's kernel buffer; a no-op elsewhere.
    pub fn set_pipe_size(fd: Fd, bytes: usize) -> Result<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            return check(
                unsafe { libc::fcntl(fd, libc::F_SETPIPE_SZ, bytes as libc::c_int) },
                "fcntl(F_SETPIPE_SZ)",
            );
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let _ = (fd, bytes);
            return Ok(());
        }
    }

    /// Best-effort close; EBADF and friends are deliberately ignored so
    /// teardown paths can close unconditionally.
    pub fn close(fd: Fd) {
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }

    /// `read(2)` retried on EINTR. `Ok(0)` means the peer closed.
    pub fn read(fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// `write(2)` retried on EINTR.
    pub fn write(fd: Fd, buf: &[u8]) -> io::Result<usize> {
        loop {
            let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::{Direction, Fd};
    use crate::error::{Error, Result};
    use std::io;
    use windows_sys::Win32::Networking::WinSock as ws;

    fn check(rc: i32, context: &str) -> Result<()> {
        if rc == ws::SOCKET_ERROR {
            Err(Error::last_os(context))
        } else {
            Ok(())
        }
    }

    fn setsockopt(fd: Fd, level: i32, name: i32, value: i32, what: &str) -> Result<()> {
        let rc = unsafe {
            ws::setsockopt(
                fd,
                level,
                name,
                &value as *const i32 as *const u8,
                std::mem::size_of::<i32>() as i32,
            )
        };
        check(rc, what)
    }

    pub fn set_nonblocking(fd: Fd, on: bool) -> Result<()> {
        let mut mode: u32 = on as u32;
        check(
            unsafe { ws::ioctlsocket(fd, ws::FIONBIO, &mut mode) },
            "ioctlsocket(FIONBIO)",
        )
    }

    pub fn set_nodelay(fd: Fd, on: bool) -> Result<()> {
        setsockopt(
            fd,
            ws::IPPROTO_TCP,
            ws::TCP_NODELAY as i32,
            on as i32,
            "setsockopt(TCP_NODELAY)",
        )
    }

    pub fn set_reuseaddr(fd: Fd) -> Result<()> {
        setsockopt(
            fd,
            ws::SOL_SOCKET as i32,
            ws::SO_REUSEADDR as i32,
            1,
            "setsockopt(SO_REUSEADDR)",
        )
    }

    pub fn set_close_on_exec(_fd: Fd) -> Result<()> {
        // Winsock handles are not inherited through CreateProcess by default.
        Ok(())
    }

    pub fn set_rcvbuf(fd: Fd, bytes: usize) -> Result<()> {
        setsockopt(
            fd,
            ws::SOL_SOCKET as i32,
            ws::SO_RCVBUF as i32,
            bytes as i32,
            "setsockopt(SO_RCVBUF)",
        )
    }

    pub fn set_sndbuf(fd: Fd, bytes: usize) -> Result<()> {
        setsockopt(
            fd,
            ws::SOL_SOCKET as i32,
            ws::SO_SNDBUF as i32,
            bytes as i32,
            "setsockopt(SO_SNDBUF)",
        )
    }

    pub fn set_keepalive(fd: Fd, _idle: u32, _intvl: u32, _cnt: u32) -> Result<()> {
        setsockopt(
            fd,
            ws::SOL_SOCKET as i32,
            ws::SO_KEEPALIVE as i32,
            1,
            "setsockopt(SO_KEEPALIVE)",
        )
    }

    pub fn block_sigpipe(_fd: Fd) -> Result<()> {
        Ok(())
    }

    pub fn bytes_available(fd: Fd, direction: Direction) -> Result<usize> {
        match direction {
            Direction::Read => {
                let mut pending: u32 = 0;
                check(
                    unsafe { ws::ioctlsocket(fd, ws::FIONREAD, &mut pending) },
                    "ioctlsocket(FIONREAD)",
                )?;
                Ok(pending as usize)
            }
            Direction::Write => Ok(0),
        }
    }

    pub fn set_pipe_size(_fd: Fd, _bytes: usize) -> Result<()> {
        Ok(())
    }

    pub fn close(fd: Fd) {
        if fd != super::INVALID_FD {
            unsafe {
                ws::closesocket(fd);
            }
        }
    }

    pub fn read(fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { ws::recv(fd, buf.as_mut_ptr(), buf.len() as i32, 0) };
        if n >= 0 {
            Ok(n as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub fn write(fd: Fd, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { ws::send(fd, buf.as_ptr(), buf.len() as i32, 0) };
        if n >= 0 {
            Ok(n as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

pub use imp::*;

/// Parses a bandwidth string of the form `"<N>bps|kbps|Mbps|Gbps"` into a
/// kernel buffer size in bytes. Returns `Err` for anything else.
pub fn parse_bandwidth(value: &str) -> Result<usize> {
    let value = value.trim();
    let (digits, unit): (String, String) = value.chars().partition(|c| c.is_ascii_digit());
    let number: u64 = digits
        .parse()
        .map_err(|_| Error::IllegalState(format!("bandwidth value {value:?} has no number")))?;
    let bits = match unit.trim() {
        "bps" => number,
        "kbps" => number * 1_000,
        "Mbps" => number * 1_000_000,
        "Gbps" => number * 1_000_000_000,
        other => {
            return Err(Error::IllegalState(format!(
                "bandwidth unit {other:?} is not one of bps/kbps/Mbps/Gbps"
            )))
        }
    };
    Ok(((bits / 8).max(1)) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_units() {
        assert_eq!(parse_bandwidth("8bps").unwrap(), 1);
        assert_eq!(parse_bandwidth("8kbps").unwrap(), 1_000);
        assert_eq!(parse_bandwidth("16Mbps").unwrap(), 2_000_000);
        assert_eq!(parse_bandwidth("1Gbps").unwrap(), 125_000_000);
        assert!(parse_bandwidth("10").is_err());
        assert!(parse_bandwidth("fast").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn options_are_idempotent_on_a_socket() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        for _ in 0..2 {
            set_nonblocking(fd, true).unwrap();
            set_reuseaddr(fd).unwrap();
            set_close_on_exec(fd).unwrap();
            set_rcvbuf(fd, 64 * 1024).unwrap();
            set_sndbuf(fd, 64 * 1024).unwrap();
            set_nodelay(fd, true).unwrap();
            set_keepalive(fd, 30, 5, 3).unwrap();
            block_sigpipe(fd).unwrap();
        }
        set_nonblocking(fd, false).unwrap();

        close(fd);
    }

    #[cfg(unix)]
    #[test]
    fn bytes_available_counts_queued_input() {
        let mut fds = [0 as Fd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        assert_eq!(bytes_available(fds[0], Direction::Read).unwrap(), 0);
        write(fds[1], b"1234").unwrap();
        assert_eq!(bytes_available(fds[0], Direction::Read).unwrap(), 4);

        close(fds[0]);
        close(fds[1]);
    }

    #[cfg(unix)]
    #[test]
    fn option_errors_carry_the_os_message() {
        let err = set_nodelay(-1, true).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("TCP_NODELAY"), "{rendered}");
    }
}
