//! Fire-once completion signals and cancellation tokens.
//!
//! Both [`Signal`] and [`CancelToken`] are handles to the same primitive,
//! a latch that fires at most once and remembers the [`Reason`] it fired
//! with. A `Signal` can only be observed; a `CancelToken` can also fire.
//!
//! Observers can:
//! - block on [`Signal::wait`] or [`Signal::wait_timeout`],
//! - `.await` the signal from any executor,
//! - attach callbacks that run when the latch fires.
//!
//! Callbacks run on the thread that fires the latch, after its lock has
//! been released, so a callback may freely touch other latches.

use crate::error::Reason;

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce(&Reason) + Send>;

struct State {
    reason: Option<Reason>,
    wakers: Vec<Waker>,
    callbacks: Vec<(u64, Callback)>,
    next_id: u64,
}

pub(crate) struct Latch {
    state: Mutex<State>,
    fired: Condvar,
}

impl Latch {
    fn new() -> Self {
        Self {
            state: Mutex::new(State {
                reason: None,
                wakers: Vec::new(),
                callbacks: Vec::new(),
                next_id: 0,
            }),
            fired: Condvar::new(),
        }
    }

    /// Fires the latch. Returns `false` if it had already fired.
    pub(crate) fn fire(&self, reason: Reason) -> bool {
        let (wakers, callbacks) = {
            let mut state = self.state.lock();
            if state.reason.is_some() {
                return false;
            }

            state.reason = Some(reason.clone());
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.callbacks),
            )
        };

        self.fired.notify_all();

        for waker in wakers {
            waker.wake();
        }

        for (_, callback) in callbacks {
            callback(&reason);
        }

        true
    }

    fn reason(&self) -> Option<Reason> {
        self.state.lock().reason.clone()
    }

    /// Registers `callback`, or runs it right away if the latch has fired.
    ///
    /// Returns the id to pass to [`Latch::unsubscribe`], or `None` if the
    /// callback already ran.
    pub(crate) fn subscribe(&self, callback: Callback) -> Option<u64> {
        let reason = {
            let mut state = self.state.lock();
            match &state.reason {
                Some(reason) => reason.clone(),
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    state.callbacks.push((id, callback));
                    return Some(id);
                }
            }
        };

        callback(&reason);
        None
    }

    fn unsubscribe(&self, id: u64) {
        let removed = {
            let mut state = self.state.lock();
            state
                .callbacks
                .iter()
                .position(|(candidate, _)| *candidate == id)
                .map(|index| state.callbacks.swap_remove(index))
        };

        // Dropped outside the lock: the closure may own other handles.
        drop(removed);
    }

    fn wait(&self) -> Reason {
        let mut state = self.state.lock();
        loop {
            if let Some(reason) = &state.reason {
                return reason.clone();
            }
            self.fired.wait(&mut state);
        }
    }

    fn wait_until(&self, deadline: Instant) -> Option<Reason> {
        let mut state = self.state.lock();
        loop {
            if let Some(reason) = &state.reason {
                return Some(reason.clone());
            }
            if self.fired.wait_until(&mut state, deadline).timed_out() {
                return state.reason.clone();
            }
        }
    }

    fn poll_fired(&self, cx: &mut Context<'_>) -> Poll<Reason> {
        let mut state = self.state.lock();

        if let Some(reason) = &state.reason {
            return Poll::Ready(reason.clone());
        }

        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }

        Poll::Pending
    }
}

/// A read-only view of a fire-once completion.
///
/// Returned by every registration. Cloning is cheap and every clone
/// observes the same resolution.
#[derive(Clone)]
pub struct Signal {
    latch: Arc<Latch>,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            latch: Arc::new(Latch::new()),
        }
    }

    /// Creates a signal that has already fired with `reason`.
    pub fn resolved(reason: Reason) -> Self {
        let signal = Self::new();
        signal.latch.fire(reason);
        signal
    }

    pub(crate) fn latch(&self) -> &Arc<Latch> {
        &self.latch
    }

    /// Returns `true` once the signal has fired.
    pub fn is_fired(&self) -> bool {
        self.latch.state.lock().reason.is_some()
    }

    /// The reason the signal fired with, if it has.
    pub fn reason(&self) -> Option<Reason> {
        self.latch.reason()
    }

    /// Blocks the current thread until the signal fires.
    pub fn wait(&self) -> Reason {
        self.latch.wait()
    }

    /// Blocks until the signal fires or `timeout` elapses.
    ///
    /// Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Reason> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.latch.wait_until(deadline),
            None => Some(self.latch.wait()),
        }
    }

    /// Returns `true` if both handles observe the same underlying latch.
    pub fn same_as(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.latch, &other.latch)
    }

    /// Runs `callback` when the signal fires. Dropping the guard disarms it.
    pub(crate) fn on_fire<F>(&self, callback: F) -> CancelGuard
    where
        F: FnOnce(&Reason) + Send + 'static,
    {
        let id = self.latch.subscribe(Box::new(callback));

        CancelGuard {
            latch: Arc::downgrade(&self.latch),
            id,
        }
    }

    #[cfg(test)]
    pub(crate) fn callback_count(&self) -> usize {
        self.latch.state.lock().callbacks.len()
    }
}

impl Future for Signal {
    type Output = Reason;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.latch.poll_fired(cx)
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("reason", &self.reason())
            .finish()
    }
}

/// A cancellation token.
///
/// Cancelling is idempotent; the first reason wins. Tokens form a tree
/// through [`CancelToken::child`]: a child fires when its parent does,
/// with the parent's reason, but can also fire on its own.
#[derive(Clone)]
pub struct CancelToken {
    signal: Signal,
}

impl CancelToken {
    /// Creates a token that has not been cancelled.
    pub fn new() -> Self {
        Self {
            signal: Signal::new(),
        }
    }

    /// Cancels the token with [`Reason::Canceled`].
    ///
    /// Returns `false` if it was already cancelled.
    pub fn cancel(&self) -> bool {
        self.cancel_with(Reason::Canceled)
    }

    /// Cancels the token with an explicit reason.
    pub fn cancel_with(&self, reason: Reason) -> bool {
        self.signal.latch.fire(reason)
    }

    /// Returns `true` once the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_fired()
    }

    /// Why the token was cancelled, if it was.
    pub fn reason(&self) -> Option<Reason> {
        self.signal.reason()
    }

    /// A read-only view that fires when this token is cancelled.
    pub fn signal(&self) -> Signal {
        self.signal.clone()
    }

    /// Blocks until the token is cancelled.
    pub fn wait(&self) -> Reason {
        self.signal.wait()
    }

    /// Creates a token cancelled whenever this one is.
    ///
    /// Cancelling the child does not affect the parent. Once the child
    /// fires, its link to the parent is dropped.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();

        let downstream = child.clone();
        let link = self.on_cancel(move |reason| {
            downstream.cancel_with(reason.clone());
        });

        child.signal.on_fire(move |_| link.disarm()).forget();
        child
    }

    /// Runs `callback` when the token is cancelled.
    ///
    /// If the token is already cancelled the callback runs immediately on
    /// the calling thread. Dropping the returned guard disarms it.
    pub fn on_cancel<F>(&self, callback: F) -> CancelGuard
    where
        F: FnOnce(&Reason) + Send + 'static,
    {
        self.signal.on_fire(callback)
    }

    /// Cancels the token with [`Reason::DeadlineExceeded`] after `timeout`.
    ///
    /// The timer runs on a short-lived background thread that exits early
    /// if the token is cancelled first. A deadline too far out to be
    /// represented never passes, so no timer is started for it.
    pub fn cancel_after(&self, timeout: Duration) {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            tracing::trace!(?timeout, "deadline out of range, ignoring");
            return;
        };

        let token = self.clone();

        let spawned = thread::Builder::new()
            .name("hangup-deadline".into())
            .spawn(move || {
                if token.signal.latch.wait_until(deadline).is_none() {
                    token.cancel_with(Reason::DeadlineExceeded);
                }
            });

        if let Err(err) = spawned {
            tracing::warn!(error = %err, "deadline thread unavailable, cancelling now");
            self.cancel_with(Reason::DeadlineExceeded);
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Keeps a cancellation callback armed.
///
/// Dropping the guard disarms the callback. A guard whose callback has
/// already run does nothing.
#[must_use = "dropping the guard disarms the callback"]
pub struct CancelGuard {
    latch: Weak<Latch>,
    id: Option<u64>,
}

impl CancelGuard {
    /// Disarms the callback now.
    pub fn disarm(mut self) {
        self.release();
    }

    /// Keeps the callback armed for the lifetime of the token.
    pub fn forget(mut self) {
        self.id = None;
    }

    /// Returns `true` once the callback can no longer run: it was
    /// disarmed, its latch is gone, or the latch has fired.
    pub(crate) fn is_spent(&self) -> bool {
        match (self.id, self.latch.upgrade()) {
            (Some(_), Some(latch)) => latch.state.lock().reason.is_some(),
            _ => true,
        }
    }

    fn release(&mut self) {
        if let (Some(id), Some(latch)) = (self.id.take(), self.latch.upgrade()) {
            latch.unsubscribe(id);
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_once_with_first_reason() {
        let token = CancelToken::new();

        assert!(token.cancel());
        assert!(!token.cancel_with(Reason::PeerClosed));
        assert!(matches!(token.reason(), Some(Reason::Canceled)));
    }

    #[test]
    fn wait_returns_after_fire_from_other_thread() {
        let token = CancelToken::new();
        let signal = token.signal();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            token.cancel_with(Reason::PeerClosed);
        });

        assert!(matches!(signal.wait(), Reason::PeerClosed));
        handle.join().expect("Thread panicked");
    }

    #[test]
    fn wait_timeout_expires() {
        let signal = Signal::new();
        assert!(signal.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn callbacks_run_once_and_guards_disarm() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let kept = token.on_cancel(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let counter = hits.clone();
        let dropped = token.on_cancel(move |_| {
            counter.fetch_add(10, Ordering::SeqCst);
        });
        drop(dropped);

        token.cancel();
        token.cancel();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(kept);
    }

    #[test]
    fn on_cancel_after_fire_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _guard = token.on_cancel(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn child_follows_parent_but_not_the_reverse() {
        let parent = CancelToken::new();
        let child = parent.child();
        let sibling = parent.child();

        sibling.cancel_with(Reason::PeerClosed);
        assert!(!parent.is_cancelled());
        assert!(!child.is_cancelled());

        parent.cancel_with(Reason::DeadlineExceeded);
        assert!(matches!(child.reason(), Some(Reason::DeadlineExceeded)));
        assert!(matches!(sibling.reason(), Some(Reason::PeerClosed)));
    }

    #[test]
    fn cancel_after_fires_with_deadline() {
        let token = CancelToken::new();
        token.cancel_after(Duration::from_millis(20));

        let reason = token
            .signal()
            .wait_timeout(Duration::from_secs(5))
            .expect("Deadline never fired");
        assert!(matches!(reason, Reason::DeadlineExceeded));
    }

    #[test]
    fn unbounded_timeouts_do_not_overflow() {
        let token = CancelToken::new();
        token.cancel_after(Duration::MAX);
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(matches!(
            token.signal().wait_timeout(Duration::MAX),
            Some(Reason::Canceled)
        ));
    }

    #[test]
    fn disarmed_fire_callbacks_are_removed() {
        let signal = Signal::new();

        for _ in 0..100 {
            signal.on_fire(|_| {}).disarm();
        }
        let kept = signal.on_fire(|_| {});

        assert_eq!(signal.callback_count(), 1);
        drop(kept);
        assert_eq!(signal.callback_count(), 0);
    }

    #[test]
    fn signal_is_a_future() {
        struct Noop;
        impl std::task::Wake for Noop {
            fn wake(self: Arc<Self>) {}
        }

        let waker = Waker::from(Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);

        let token = CancelToken::new();
        let mut signal = token.signal();

        assert!(Pin::new(&mut signal).poll(&mut cx).is_pending());
        token.cancel();
        assert!(matches!(
            Pin::new(&mut signal).poll(&mut cx),
            Poll::Ready(Reason::Canceled)
        ));
    }
}
