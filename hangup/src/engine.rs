//! The multiplex engine.
//!
//! An engine owns:
//! - one polling context from a [`Platform`] adapter,
//! - one worker thread blocked in [`Platform::receive`],
//! - the [`CloseRegistry`] of pending waits,
//! - the cancellation pipe that wakes the worker on shutdown.
//!
//! Registration and resolution run on caller threads. The worker only
//! turns close events into registry resolutions.
//!
//! Per descriptor the lifecycle is `unregistered → pending → resolved`,
//! where resolution comes from exactly one of: a close event, the
//! registrants' cancellation, a failed subscription, or shutdown.

use crate::builder::Builder;
use crate::error::{Error, Reason};
use crate::platform::Platform;
use crate::registry::{CloseRegistry, WaitEntry};
use crate::signal::{CancelToken, Signal};
use crate::sys::CancelPipe;

use parking_lot::Mutex;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{Dispatch, debug, error, info, trace, warn};

/// The polling context together with the adapter that drives it.
struct Poller {
    platform: Arc<dyn Platform>,
    poll: OwnedFd,
}

/// State shared by the engine handles, the worker and cancel callbacks.
struct Shared {
    name: String,
    poller: Arc<Poller>,
    registry: CloseRegistry,
    dispatch: Option<Dispatch>,

    /// Set once shutdown starts, or when the worker dies.
    closed: AtomicBool,

    /// Fires when the worker loop has exited.
    stopped: Signal,
}

struct Inner {
    shared: Arc<Shared>,
    cancel: CancelPipe,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    shutdown: OnceLock<Result<(), Error>>,
}

/// A close-notification engine.
///
/// Handles are cheap to clone and share one worker. The engine shuts
/// down when [`Engine::shutdown`] is called or the last handle is
/// dropped.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Creates an engine with the default configuration.
    pub fn new() -> Result<Self, Error> {
        Builder::new().build()
    }

    /// Returns a [`Builder`] for a custom engine.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn start(
        name: String,
        thread_name: String,
        stack_size: Option<usize>,
        dispatch: Option<Dispatch>,
        platform: Arc<dyn Platform>,
        cancel: CancelPipe,
        poll: OwnedFd,
    ) -> Result<Self, Error> {
        let poller = Arc::new(Poller { platform, poll });

        let release = {
            let poller = Arc::clone(&poller);
            Box::new(move |fd: BorrowedFd<'_>| {
                if let Err(err) = poller.platform.unsubscribe(poller.poll.as_fd(), fd) {
                    debug!(fd = fd.as_raw_fd(), error = %err, "unsubscribe failed");
                }
            })
        };

        let shared = Arc::new(Shared {
            name,
            poller,
            registry: CloseRegistry::with_release(release),
            dispatch,
            closed: AtomicBool::new(false),
            stopped: Signal::new(),
        });

        let mut thread = thread::Builder::new().name(thread_name);
        if let Some(bytes) = stack_size {
            thread = thread.stack_size(bytes);
        }

        let worker = Arc::clone(&shared);
        let handle = thread
            .spawn(move || worker.run())
            .map_err(|err| Error::Spawn(Arc::new(err)))?;

        shared.in_scope(|| {
            info!(
                engine = %shared.name,
                platform = shared.poller.platform.name(),
                poll = shared.poller.poll.as_raw_fd(),
                "engine started"
            )
        });

        Ok(Self {
            inner: Arc::new(Inner {
                worker_id: handle.thread().id(),
                shared,
                cancel,
                worker: Mutex::new(Some(handle)),
                shutdown: OnceLock::new(),
            }),
        })
    }

    /// Registers interest in `fd` closing.
    ///
    /// The engine takes ownership of `fd` and closes it once the returned
    /// signal fires, whatever the reason. If `token` is cancelled first,
    /// the registration resolves with the token's reason.
    ///
    /// After shutdown the signal fires immediately with
    /// [`Reason::EngineClosed`].
    pub fn register(&self, fd: OwnedFd, token: Option<&CancelToken>) -> Signal {
        match self.inner.shared.register(fd, token) {
            Ok(entry) => entry.signal().clone(),
            Err(reason) => Signal::resolved(reason),
        }
    }

    pub(crate) fn register_entry(
        &self,
        fd: OwnedFd,
        token: Option<&CancelToken>,
    ) -> Result<Arc<WaitEntry>, Reason> {
        self.inner.shared.register(fd, token)
    }

    /// Adds one more registrant to a pending entry.
    ///
    /// Returns `false` if the entry has already resolved.
    pub(crate) fn attach(&self, entry: &Arc<WaitEntry>, token: Option<&CancelToken>) -> bool {
        let shared = &self.inner.shared;
        if shared.closed.load(Ordering::SeqCst) || !entry.acquire() {
            return false;
        }

        if let Some(token) = token {
            shared.watch(entry, token);
        }

        true
    }

    /// Shuts the engine down.
    ///
    /// Wakes and joins the worker, then resolves every pending
    /// registration with [`Reason::EngineClosed`]. Runs once; concurrent
    /// and later calls wait for that run and return its result.
    ///
    /// Calling it from a callback fired by the shutdown drain deadlocks.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.inner.shutdown()
    }

    /// Alias for [`Engine::shutdown`].
    pub fn close(&self) -> Result<(), Error> {
        self.shutdown()
    }

    /// Returns `true` once shutdown has started or the worker has died.
    pub fn is_closed(&self) -> bool {
        self.inner.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of pending registrations.
    pub fn pending(&self) -> usize {
        self.inner.shared.registry.len()
    }

    /// Fires once the worker loop has exited.
    pub fn stopped(&self) -> Signal {
        self.inner.shared.stopped.clone()
    }

    /// The engine name given to the builder.
    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    /// The platform adapter's name.
    pub fn platform_name(&self) -> &'static str {
        self.inner.shared.poller.platform.name()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name())
            .field("platform", &self.platform_name())
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Shared {
    fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }

    fn register(
        self: &Arc<Self>,
        fd: OwnedFd,
        token: Option<&CancelToken>,
    ) -> Result<Arc<WaitEntry>, Reason> {
        self.in_scope(|| {
            let raw = fd.as_raw_fd();

            let (existed, entry) = loop {
                if self.closed.load(Ordering::SeqCst) {
                    debug!(fd = raw, "registration after shutdown");
                    return Err(Reason::EngineClosed);
                }

                let (existed, entry) = self.registry.add(raw);
                if entry.acquire() {
                    break (existed, entry);
                }
                // Lost a race with the entry's resolution; the map no longer holds it.
            };

            entry.adopt(fd);

            if !existed {
                self.subscribe(&entry);
            }

            if let Some(token) = token {
                self.watch(&entry, token);
            }

            debug!(fd = raw, existed, "registered");
            Ok(entry)
        })
    }

    /// Subscribes a freshly added entry, unless shutdown got there first.
    fn subscribe(&self, entry: &Arc<WaitEntry>) {
        let fd = entry.fd();

        // Shutdown sets `closed` before draining. If it is not visible yet,
        // the entry is already in the map and the drain will find it.
        if self.closed.load(Ordering::SeqCst) {
            self.registry.resolve_entry(entry, Reason::EngineClosed);
            return;
        }

        let poller = &self.poller;
        let armed = entry.arm(|borrowed| {
            poller
                .platform
                .subscribe(poller.poll.as_fd(), borrowed, entry.token())
        });

        match armed {
            Ok(true) => trace!(fd, token = entry.token(), "subscribed"),
            Ok(false) => trace!(fd, "resolved before subscription"),
            Err(err) => {
                warn!(fd, error = %err, "subscription failed");
                self.registry
                    .resolve_entry(entry, Reason::Failed(Error::subscribe(fd, err)));
            }
        }
    }

    /// Releases the caller's hold on `entry` when `token` fires.
    fn watch(self: &Arc<Self>, entry: &Arc<WaitEntry>, token: &CancelToken) {
        let shared = Arc::downgrade(self);
        let target = Arc::downgrade(entry);
        let slot = entry.reserve_slot();

        let guard = token.on_cancel(move |reason| {
            if let (Some(shared), Some(entry)) = (shared.upgrade(), target.upgrade()) {
                let resolved = shared.registry.release_hold(&entry, reason.clone());
                if !resolved {
                    entry.discard(slot);
                }
                shared.in_scope(|| debug!(fd = entry.fd(), %reason, resolved, "registrant cancelled"));
            }
        });

        entry.keep(slot, guard);
    }

    /// The worker loop.
    fn run(self: Arc<Self>) {
        let _stopped = StopGuard(&self.stopped);
        let _default = self.dispatch.as_ref().map(tracing::dispatcher::set_default);

        let span = tracing::info_span!(
            "hangup",
            engine = %self.name,
            platform = self.poller.platform.name()
        );
        let _entered = span.enter();

        debug!(poll = self.poller.poll.as_raw_fd(), "worker started");

        loop {
            let event = match self.poller.platform.receive(self.poller.poll.as_fd()) {
                Ok(event) => event,
                Err(err) => {
                    error!(error = %err, "receive failed, stopping worker");
                    self.closed.store(true, Ordering::SeqCst);
                    let drained = self.registry.drain_all(Reason::EngineClosed);
                    debug!(drained, "drained after worker failure");
                    return;
                }
            };

            trace!(token = event.token, closed = event.closed, "event");

            if event.is_cancel() {
                debug!("cancellation descriptor fired");
                return;
            }

            if !event.closed {
                continue;
            }

            let resolved = self
                .registry
                .resolve_token(event.token, Reason::PeerClosed);
            debug!(fd = event.token as u32 as i32, resolved, "peer closed");
        }
    }
}

/// Fires the stopped signal however the worker exits, panics included.
struct StopGuard<'a>(&'a Signal);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.0.latch().fire(Reason::EngineClosed);
    }
}

impl Inner {
    fn shutdown(&self) -> Result<(), Error> {
        self.shutdown.get_or_init(|| self.stop()).clone()
    }

    fn stop(&self) -> Result<(), Error> {
        let shared = &self.shared;

        shared.in_scope(|| {
            shared.closed.store(true, Ordering::SeqCst);
            info!(engine = %shared.name, "shutting down");

            let signaled = self.cancel.signal().map_err(|err| {
                warn!(error = %err, "failed to write cancellation pipe, closing it");
                Error::Cancel(Arc::new(err))
            });

            // A callback on the worker thread cannot wait for itself.
            let joined = if thread::current().id() == self.worker_id {
                Ok(())
            } else {
                shared.stopped.wait();
                match self.worker.lock().take() {
                    Some(handle) => handle.join().map_err(|_| Error::WorkerPanicked),
                    None => Ok(()),
                }
            };

            let drained = shared.registry.drain_all(Reason::EngineClosed);
            info!(engine = %shared.name, drained, "engine stopped");

            signaled.and(joined)
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(engine = %self.shared.name, error = %err, "shutdown on drop failed");
        }
    }
}
