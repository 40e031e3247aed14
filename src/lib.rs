//! Core runtime of the AWH networking framework: a readiness-based event
//! reactor portable over epoll/kqueue//dev/poll/WSAPoll, a master/worker
//! process cluster supervised through SIGCHLD, and CMP, the length-framed,
//! optionally compressed and encrypted protocol the cluster speaks over its
//! IPC pipes.
//!
//! The three layers compose bottom-up: the cluster multiplexes its pipes on
//! an [`EventBase`], the pipes carry [`cmp`](cluster::cmp) frames, and the
//! frames are sealed by the [`hash`] codecs.

pub mod cluster;
pub mod error;
pub mod events;
pub mod hash;
pub mod net;

pub use cluster::{Cluster, ProcessEvent, Transfer};
pub use error::{Error, Result};
pub use events::base::{EventBase, EventKind, EventMode};
pub use events::event::{Event, EventType};
pub use events::notifier::Notifier;
pub use events::partners::Partners;
pub use events::watch::Watch;
pub use hash::{Cipher, Hash, Level, Method};
