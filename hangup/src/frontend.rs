//! Connection-level entry points.
//!
//! A [`Frontend`] turns "tell me when this connection closes" into an
//! engine registration. The caller keeps its connection; the engine gets
//! a private duplicate of the descriptor, which it closes on resolution.
//!
//! Duplicates of one socket get different descriptor numbers, so the
//! frontend recognises repeated requests for the same connection by the
//! identity of the open file behind it and hands out the pending signal
//! instead of registering again.

use crate::engine::Engine;
use crate::error::{Error, Reason};
use crate::registry::WaitEntry;
use crate::signal::{CancelToken, Signal};
use crate::sys::{is_bad_descriptor, sys_dup, sys_identity};

use dashmap::DashMap;
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// `(device, inode)` of an open file.
type Identity = (u64, u64);

/// Scoped access to a connection's descriptor.
///
/// Implemented for everything that is [`AsFd`]. Types whose descriptor
/// can go away underneath them implement it directly and return `None`
/// once closed.
pub trait Connection {
    /// Runs `f` with the descriptor, or returns `None` if the connection
    /// is closed.
    fn control<R>(&self, f: impl FnOnce(BorrowedFd<'_>) -> R) -> Option<R>;
}

impl<T: AsFd + ?Sized> Connection for T {
    fn control<R>(&self, f: impl FnOnce(BorrowedFd<'_>) -> R) -> Option<R> {
        Some(f(self.as_fd()))
    }
}

struct Inner {
    engine: Engine,
    cache: Arc<DashMap<Identity, Arc<WaitEntry>>>,
}

/// Close notification for connections, backed by one [`Engine`].
#[derive(Clone)]
pub struct Frontend {
    inner: Arc<Inner>,
}

impl Frontend {
    /// Creates a frontend that registers through `engine`.
    pub fn new(engine: Engine) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                cache: Arc::new(DashMap::new()),
            }),
        }
    }

    /// The engine this frontend registers with.
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Returns a signal that fires when `conn`'s peer closes.
    ///
    /// Calls for the same connection while a wait is pending return the
    /// same signal. A connection that is already closed yields a signal
    /// fired with [`Reason::AlreadyClosed`].
    pub fn done<C: Connection + ?Sized>(&self, conn: &C) -> Signal {
        conn.control(|fd| self.watch(fd, None))
            .unwrap_or_else(|| Signal::resolved(Reason::AlreadyClosed))
    }

    /// Returns a child of `token` that is also cancelled when `conn`'s
    /// peer closes.
    ///
    /// The child's reason tells the two apart: [`Reason::PeerClosed`] for
    /// a close, the parent's reason otherwise. Cancelling the child
    /// withdraws its interest in `conn`.
    pub fn with_cancellation<C: Connection + ?Sized>(
        &self,
        token: &CancelToken,
        conn: &C,
    ) -> CancelToken {
        let derived = token.child();

        let signal = conn
            .control(|fd| self.watch(fd, Some(&derived)))
            .unwrap_or_else(|| Signal::resolved(Reason::AlreadyClosed));

        let target = derived.clone();
        let forward = signal.on_fire(move |reason| {
            target.cancel_with(reason.clone());
        });

        // The forwarder lives on the shared entry; remove it once this token fires.
        derived.signal().on_fire(move |_| forward.disarm()).forget();

        derived
    }

    fn watch(&self, fd: BorrowedFd<'_>, token: Option<&CancelToken>) -> Signal {
        let identity = match sys_identity(fd) {
            Ok(identity) => identity,
            Err(err) => return Self::unusable(err),
        };

        if let Some(entry) = self.cached(identity) {
            if self.inner.engine.attach(&entry, token) {
                debug!(fd = entry.fd(), "reusing pending wait");
                return entry.signal().clone();
            }
        }

        let dup = match sys_dup(fd) {
            Ok(dup) => dup,
            Err(err) => return Self::unusable(err),
        };

        let entry = match self.inner.engine.register_entry(dup, token) {
            Ok(entry) => entry,
            Err(reason) => return Signal::resolved(reason),
        };

        self.remember(identity, &entry);
        entry.signal().clone()
    }

    fn cached(&self, identity: Identity) -> Option<Arc<WaitEntry>> {
        self.inner
            .cache
            .get(&identity)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|entry| !entry.is_resolved())
    }

    /// Caches `entry` under `identity` until it resolves.
    fn remember(&self, identity: Identity, entry: &Arc<WaitEntry>) {
        self.inner.cache.insert(identity, Arc::clone(entry));

        let cache = Arc::downgrade(&self.inner.cache);
        let target = Arc::downgrade(entry);
        entry
            .signal()
            .on_fire(move |_| {
                if let Some(cache) = cache.upgrade() {
                    cache.remove_if(&identity, |_, current| {
                        std::ptr::eq(Arc::as_ptr(current), target.as_ptr())
                    });
                }
            })
            .forget();
    }

    fn unusable(err: std::io::Error) -> Signal {
        if is_bad_descriptor(&err) {
            return Signal::resolved(Reason::AlreadyClosed);
        }
        Signal::resolved(Reason::Failed(Error::Duplicate(Arc::new(err))))
    }

    #[cfg(test)]
    pub(crate) fn cached_len(&self) -> usize {
        self.inner.cache.len()
    }
}

impl fmt::Debug for Frontend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frontend")
            .field("engine", &self.inner.engine)
            .field("cached", &self.inner.cache.len())
            .finish()
    }
}

static DEFAULT: OnceLock<Frontend> = OnceLock::new();

/// Returns the process-wide frontend, building its engine on first use.
///
/// A failed build is not remembered; the next call tries again.
pub fn default_frontend() -> Result<Frontend, Error> {
    if let Some(frontend) = DEFAULT.get() {
        return Ok(frontend.clone());
    }

    let engine = Engine::builder().name("hangup-default").build()?;
    Ok(DEFAULT.get_or_init(|| Frontend::new(engine)).clone())
}

/// Installs `frontend` as the process-wide default.
///
/// Fails, handing `frontend` back, if a default is already in place.
pub fn install_default(frontend: Frontend) -> Result<(), Frontend> {
    DEFAULT.set(frontend)
}

/// [`Frontend::done`] on the default frontend.
///
/// If the default engine cannot be built, the signal fires with
/// [`Reason::Failed`].
pub fn done<C: Connection + ?Sized>(conn: &C) -> Signal {
    match default_frontend() {
        Ok(frontend) => frontend.done(conn),
        Err(err) => Signal::resolved(Reason::Failed(err)),
    }
}

/// [`Frontend::with_cancellation`] on the default frontend.
pub fn with_cancellation<C: Connection + ?Sized>(token: &CancelToken, conn: &C) -> CancelToken {
    match default_frontend() {
        Ok(frontend) => frontend.with_cancellation(token, conn),
        Err(err) => {
            let derived = token.child();
            derived.cancel_with(Reason::Failed(err));
            derived
        }
    }
}
