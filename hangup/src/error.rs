//! Errors and resolution reasons.
//!
//! Two kinds of values live here:
//! - [`Error`], returned by fallible operations (building an engine,
//!   shutting it down) and attached to failed registrations,
//! - [`Reason`], the outcome every [`Signal`](crate::Signal) resolves with.
//!
//! Both are `Clone` so one resolution can be observed by any number of
//! waiters. I/O errors are kept behind an [`Arc`] for that purpose.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced by the engine and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The engine was shut down before or while the operation ran.
    #[error("engine closed")]
    EngineClosed,

    /// The polling context could not be created.
    #[error("failed to start {platform} polling context: {source}")]
    Start {
        platform: &'static str,
        source: Arc<io::Error>,
    },

    /// The cancellation pipe could not be created.
    #[error("failed to create cancellation pipe: {0}")]
    Pipe(#[source] Arc<io::Error>),

    /// The cancellation pipe could not be written during shutdown.
    #[error("failed to signal cancellation pipe: {0}")]
    Cancel(#[source] Arc<io::Error>),

    /// The worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] Arc<io::Error>),

    /// The worker thread panicked.
    #[error("worker thread panicked")]
    WorkerPanicked,

    /// The caller's descriptor could not be duplicated.
    #[error("failed to duplicate descriptor: {0}")]
    Duplicate(#[source] Arc<io::Error>),

    /// The descriptor could not be subscribed for close notification.
    #[error("failed to subscribe descriptor {fd}: {source}")]
    Subscribe { fd: RawFd, source: Arc<io::Error> },

    /// No platform adapter exists for the target operating system.
    #[error("no close-notification facility on this platform")]
    Unsupported,
}

impl Error {
    pub(crate) fn start(platform: &'static str, err: io::Error) -> Self {
        Error::Start {
            platform,
            source: Arc::new(err),
        }
    }

    pub(crate) fn subscribe(fd: RawFd, err: io::Error) -> Self {
        Error::Subscribe {
            fd,
            source: Arc::new(err),
        }
    }
}

/// Why a wait resolved.
///
/// Every registration resolves exactly once, with exactly one of these.
#[derive(Debug, Clone)]
pub enum Reason {
    /// The peer closed its end of the descriptor.
    PeerClosed,

    /// The descriptor was already closed when it was registered.
    AlreadyClosed,

    /// The caller's token was cancelled.
    Canceled,

    /// The caller's token passed its deadline.
    DeadlineExceeded,

    /// The engine shut down before anything else happened.
    EngineClosed,

    /// The registration itself failed.
    Failed(Error),
}

impl Reason {
    /// Returns `true` if the descriptor is known to be closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Reason::PeerClosed | Reason::AlreadyClosed)
    }

    /// Returns `true` if the wait was cut short by the caller.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Reason::Canceled | Reason::DeadlineExceeded)
    }

    /// Returns the error behind a failed registration, if any.
    pub fn error(&self) -> Option<&Error> {
        match self {
            Reason::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::PeerClosed => f.write_str("peer closed"),
            Reason::AlreadyClosed => f.write_str("already closed"),
            Reason::Canceled => f.write_str("canceled"),
            Reason::DeadlineExceeded => f.write_str("deadline exceeded"),
            Reason::EngineClosed => f.write_str("engine closed"),
            Reason::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

impl From<Error> for Reason {
    fn from(err: Error) -> Self {
        match err {
            Error::EngineClosed => Reason::EngineClosed,
            err => Reason::Failed(err),
        }
    }
}
