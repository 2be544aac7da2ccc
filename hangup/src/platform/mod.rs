//! Platform-specific close notification.
//!
//! This module provides a unified interface over the readiness
//! multiplexing facility of each operating system family:
//! - `epoll` on Linux and Android,
//! - `kqueue` on macOS and the BSDs.
//!
//! The engine only ever holds an `Arc<dyn Platform>`. The concrete
//! adapter is picked at compile time by [`default_platform`], or injected
//! through [`Builder::platform`](crate::Builder::platform).

use crate::error::Error;

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::Arc;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::Epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use kqueue::Kqueue;

pub use crate::sys::{INTERRUPT_RETRIES, retry};

/// Token reserved for the cancellation descriptor.
///
/// Registry tokens carry a descriptor in their low 32 bits, which never
/// reaches `u32::MAX`, so this value cannot collide with them.
pub const CANCEL_TOKEN: u64 = u64::MAX;

/// One notification delivered by [`Platform::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// The token the descriptor was subscribed with.
    pub token: u64,

    /// Whether the event reports a hangup, peer close or error condition.
    pub closed: bool,
}

impl Event {
    /// Returns `true` if the cancellation descriptor fired.
    pub fn is_cancel(&self) -> bool {
        self.token == CANCEL_TOKEN
    }
}

/// A readiness multiplexing facility able to report descriptor closure.
///
/// Implementations must transparently retry calls interrupted by a
/// signal, for instance by wrapping them in [`retry`]. `subscribe` and
/// `unsubscribe` may run on any thread while the worker is blocked in
/// `receive` on the same polling context.
pub trait Platform: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Creates a polling context already watching `cancel` for
    /// readability under [`CANCEL_TOKEN`].
    fn start(&self, cancel: BorrowedFd<'_>) -> io::Result<OwnedFd>;

    /// Arms close notification for `fd`, reported under `token`.
    fn subscribe(&self, poll: BorrowedFd<'_>, fd: BorrowedFd<'_>, token: u64) -> io::Result<()>;

    /// Removes `fd` from the polling context. Unknown descriptors are not
    /// an error.
    fn unsubscribe(&self, poll: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> io::Result<()>;

    /// Blocks until the next event.
    fn receive(&self, poll: BorrowedFd<'_>) -> io::Result<Event>;
}

/// Returns the adapter for the target operating system family.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn default_platform() -> Result<Arc<dyn Platform>, Error> {
    Ok(Arc::new(Epoll))
}

/// Returns the adapter for the target operating system family.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub fn default_platform() -> Result<Arc<dyn Platform>, Error> {
    Ok(Arc::new(Kqueue))
}

/// Returns the adapter for the target operating system family.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
pub fn default_platform() -> Result<Arc<dyn Platform>, Error> {
    Err(Error::Unsupported)
}
