use std::io;

/// Error taxonomy shared by the event base, the cluster runtime and the
/// CMP codec. Every variant carries enough context to be logged on its own.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An OS-level failure. Write paths retry transparently on `EINTR`,
    /// `EAGAIN` and `EWOULDBLOCK`; everything else ends up here.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// CMP header magic or framing violation. The decoder resynchronizes
    /// and keeps the stream alive after reporting this.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Compression or encryption failure. Fatal for the chunk it occurred
    /// on, reported up to the caller.
    #[error("codec error ({algo}): {message}")]
    Codec { algo: &'static str, message: String },

    /// API misuse, e.g. a double `start` or a mode toggle on an fd that was
    /// never registered. Never fatal to a running loop.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Too many tracked sockets for the configured limit.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// The operation is not available on this platform.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Unrecoverable failure (fork failed, poller construction failed).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Wraps the current OS error (`errno` on unix) with a context string.
    pub fn last_os(context: impl Into<String>) -> Self {
        Error::Io {
            context: context.into(),
            source: io::Error::last_os_error(),
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn codec(algo: &'static str, message: impl Into<String>) -> Self {
        Error::Codec {
            algo,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
