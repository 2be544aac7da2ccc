//! The close registry.
//!
//! Maps each watched descriptor to the single [`WaitEntry`] waiting for it
//! to close. A descriptor is present in the map exactly as long as its
//! entry is unresolved.
//!
//! Resolution is the only mutation that matters and it happens once per
//! entry, whoever triggers it first:
//! - the worker, on a close event,
//! - a registrant's cancellation token, when the last hold is released,
//! - shutdown, through [`CloseRegistry::drain_all`],
//! - a failed subscription.
//!
//! Each entry carries its own lock. The registry never holds a map-wide
//! lock while an entry lock is taken, and never holds a map lock across
//! a syscall other than the release hook.

use crate::error::Reason;
use crate::signal::{CancelGuard, Signal};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Called with an entry's descriptor right before its owned duplicates are
/// closed, if the descriptor was subscribed.
pub(crate) type Release = Box<dyn Fn(BorrowedFd<'_>) + Send + Sync>;

/// One outstanding interest in a descriptor's closure.
pub(crate) struct WaitEntry {
    fd: RawFd,
    generation: u32,
    signal: Signal,
    state: Mutex<EntryState>,
}

struct EntryState {
    resolved: bool,
    subscribed: bool,
    /// Live registrations. Cancellation resolves the entry when this hits zero.
    holds: usize,
    /// Cancellation callbacks of live token holds, keyed by slot.
    guards: Vec<(u64, CancelGuard)>,
    next_slot: u64,
    owned: Vec<OwnedFd>,
}

impl WaitEntry {
    fn new(fd: RawFd, generation: u32) -> Self {
        Self {
            fd,
            generation,
            signal: Signal::new(),
            state: Mutex::new(EntryState {
                resolved: false,
                subscribed: false,
                holds: 0,
                guards: Vec::new(),
                next_slot: 0,
                owned: Vec::new(),
            }),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// The value handed to the platform and echoed back in its events.
    ///
    /// Low 32 bits: descriptor. High 32 bits: generation.
    pub(crate) fn token(&self) -> u64 {
        ((self.generation as u64) << 32) | (self.fd as u32 as u64)
    }

    pub(crate) fn signal(&self) -> &Signal {
        &self.signal
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.state.lock().resolved
    }

    /// Takes ownership of a descriptor released when the entry resolves.
    ///
    /// If the entry has already resolved, the descriptor is closed now.
    pub(crate) fn adopt(&self, fd: OwnedFd) {
        let mut state = self.state.lock();
        if state.resolved {
            drop(state);
            drop(fd);
            return;
        }
        state.owned.push(fd);
    }

    /// Records one more registration. Fails once the entry has resolved.
    pub(crate) fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.resolved {
            return false;
        }
        state.holds += 1;
        true
    }

    /// Reserves the slot a registrant's cancellation guard is kept under.
    pub(crate) fn reserve_slot(&self) -> u64 {
        let mut state = self.state.lock();
        let slot = state.next_slot;
        state.next_slot += 1;
        slot
    }

    /// Keeps a registrant's cancellation callback armed until resolution.
    ///
    /// A guard whose callback already ran, or that can no longer run, is
    /// dropped instead of kept.
    pub(crate) fn keep(&self, slot: u64, guard: CancelGuard) {
        let mut state = self.state.lock();
        if state.resolved || guard.is_spent() {
            drop(state);
            drop(guard);
            return;
        }
        state.guards.push((slot, guard));
    }

    /// Forgets the guard kept under `slot`, once its hold is released.
    pub(crate) fn discard(&self, slot: u64) {
        let removed = {
            let mut state = self.state.lock();
            state
                .guards
                .iter()
                .position(|(candidate, _)| *candidate == slot)
                .map(|index| state.guards.swap_remove(index))
        };

        drop(removed);
    }

    #[cfg(test)]
    pub(crate) fn guard_count(&self) -> usize {
        self.state.lock().guards.len()
    }

    #[cfg(test)]
    pub(crate) fn holds(&self) -> usize {
        self.state.lock().holds
    }

    /// Runs `subscribe` under the entry lock and marks the entry subscribed
    /// on success.
    ///
    /// Returns `Ok(false)` without calling `subscribe` if the entry has
    /// already resolved.
    pub(crate) fn arm<E, F>(&self, subscribe: F) -> Result<bool, E>
    where
        F: FnOnce(BorrowedFd<'_>) -> Result<(), E>,
    {
        let mut state = self.state.lock();
        if state.resolved {
            return Ok(false);
        }

        // Open until the entry resolves, which cannot happen under this lock.
        subscribe(unsafe { BorrowedFd::borrow_raw(self.fd) })?;

        state.subscribed = true;
        Ok(true)
    }
}

/// Concurrent map from descriptor to its pending [`WaitEntry`].
pub(crate) struct CloseRegistry {
    entries: DashMap<RawFd, Arc<WaitEntry>>,
    generation: AtomicU32,
    release: Release,
}

impl CloseRegistry {
    #[cfg(test)]
    /// Creates a registry with no release hook.
    pub(crate) fn new() -> Self {
        Self::with_release(Box::new(|_| {}))
    }

    /// Creates a registry that calls `release` for every subscribed entry
    /// it resolves.
    pub(crate) fn with_release(release: Release) -> Self {
        Self {
            entries: DashMap::new(),
            generation: AtomicU32::new(1),
            release,
        }
    }

    /// Inserts a fresh entry for `fd`, or returns the pending one.
    ///
    /// The boolean is `true` when the entry already existed. Only the
    /// caller that sees `false` is responsible for subscribing it.
    pub(crate) fn add(&self, fd: RawFd) -> (bool, Arc<WaitEntry>) {
        match self.entries.entry(fd) {
            Entry::Occupied(occupied) => (true, Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let entry = Arc::new(WaitEntry::new(fd, generation));
                vacant.insert(Arc::clone(&entry));
                (false, entry)
            }
        }
    }

    #[cfg(test)]
    /// Resolves the pending entry for `fd`, if any.
    ///
    /// Returns `false` if there was nothing left to resolve.
    pub(crate) fn resolve(&self, fd: RawFd, reason: Reason) -> bool {
        match self.lookup(fd) {
            Some(entry) => self.settle(&entry, reason, |_| true),
            None => false,
        }
    }

    /// Resolves the entry an event token was issued for.
    ///
    /// A token from an older generation is ignored, so a late event for a
    /// recycled descriptor number cannot resolve a newer entry.
    pub(crate) fn resolve_token(&self, token: u64, reason: Reason) -> bool {
        let fd = token as u32 as RawFd;
        let generation = (token >> 32) as u32;

        match self.lookup(fd) {
            Some(entry) if entry.generation == generation => self.settle(&entry, reason, |_| true),
            _ => false,
        }
    }

    /// Resolves a specific entry, regardless of what the map holds now.
    pub(crate) fn resolve_entry(&self, entry: &Arc<WaitEntry>, reason: Reason) -> bool {
        self.settle(entry, reason, |_| true)
    }

    /// Drops one hold on `entry`; the last one resolves it with `reason`.
    pub(crate) fn release_hold(&self, entry: &Arc<WaitEntry>, reason: Reason) -> bool {
        self.settle(entry, reason, |state| {
            state.holds = state.holds.saturating_sub(1);
            state.holds == 0
        })
    }

    /// Resolves every pending entry. Returns how many were resolved.
    pub(crate) fn drain_all(&self, reason: Reason) -> usize {
        let pending: Vec<Arc<WaitEntry>> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        pending
            .iter()
            .filter(|entry| self.settle(entry, reason.clone(), |_| true))
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, fd: RawFd) -> bool {
        self.entries.contains_key(&fd)
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<WaitEntry>> {
        self.entries.get(&fd).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolves `entry` if it is still pending and `ready` agrees.
    ///
    /// Under the entry lock: mark resolved, unsubscribe, remove from the
    /// map. Outside it: disarm callbacks, close duplicates, fire.
    fn settle<F>(&self, entry: &Arc<WaitEntry>, reason: Reason, ready: F) -> bool
    where
        F: FnOnce(&mut EntryState) -> bool,
    {
        let (guards, owned) = {
            let mut state = entry.state.lock();
            if state.resolved || !ready(&mut state) {
                return false;
            }

            state.resolved = true;

            if state.subscribed {
                // Owned duplicates are still open here; they close below.
                (self.release)(unsafe { BorrowedFd::borrow_raw(entry.fd) });
            }

            self.entries
                .remove_if(&entry.fd, |_, current| Arc::ptr_eq(current, entry));

            (
                std::mem::take(&mut state.guards),
                std::mem::take(&mut state.owned),
            )
        };

        drop(guards);
        drop(owned);

        entry.signal.latch().fire(reason);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::CancelToken;
    use std::io::Read;
    use std::os::fd::{AsFd, AsRawFd};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn add_returns_the_pending_entry() {
        let registry = CloseRegistry::new();

        let (existed, first) = registry.add(7);
        assert!(!existed);

        let (existed, second) = registry.add(7);
        assert!(existed);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resolve_is_exactly_once() {
        let registry = CloseRegistry::new();
        let (_, entry) = registry.add(3);

        assert!(registry.resolve(3, Reason::PeerClosed));
        assert!(!registry.resolve(3, Reason::Canceled));
        assert!(registry.is_empty());
        assert!(matches!(entry.signal().reason(), Some(Reason::PeerClosed)));

        let (existed, fresh) = registry.add(3);
        assert!(!existed);
        assert!(!Arc::ptr_eq(&entry, &fresh));
    }

    #[test]
    fn stale_tokens_are_ignored() {
        let registry = CloseRegistry::new();

        let (_, old) = registry.add(9);
        let stale = old.token();
        registry.resolve(9, Reason::Canceled);

        let (_, current) = registry.add(9);
        assert_ne!(stale, current.token());

        assert!(!registry.resolve_token(stale, Reason::PeerClosed));
        assert!(registry.contains(9));
        assert!(registry.resolve_token(current.token(), Reason::PeerClosed));
        assert!(!registry.contains(9));
    }

    #[test]
    fn drain_resolves_everything() {
        let registry = CloseRegistry::new();
        let entries: Vec<_> = (0..16).map(|fd| registry.add(fd).1).collect();

        registry.resolve(4, Reason::PeerClosed);

        assert_eq!(registry.drain_all(Reason::EngineClosed), 15);
        assert!(registry.is_empty());
        assert!(matches!(entries[4].signal().reason(), Some(Reason::PeerClosed)));
        assert!(
            entries
                .iter()
                .enumerate()
                .filter(|(fd, _)| *fd != 4)
                .all(|(_, e)| matches!(e.signal().reason(), Some(Reason::EngineClosed)))
        );
    }

    #[test]
    fn last_hold_resolves() {
        let registry = CloseRegistry::new();
        let (_, entry) = registry.add(5);

        assert!(entry.acquire());
        assert!(entry.acquire());

        assert!(!registry.release_hold(&entry, Reason::Canceled));
        assert!(registry.contains(5));
        assert!(registry.release_hold(&entry, Reason::Canceled));
        assert!(!registry.contains(5));
        assert!(!entry.acquire());
    }

    #[test]
    fn resolution_closes_owned_descriptors_and_disarms_guards() {
        let registry = CloseRegistry::new();
        let (mut local, peer) = UnixStream::pair().expect("Failed to create socket pair");
        let dup = peer
            .as_fd()
            .try_clone_to_owned()
            .expect("Failed to duplicate");
        drop(peer);
        let raw = dup.as_raw_fd();

        let (_, entry) = registry.add(raw);
        entry.adopt(dup);

        let token = CancelToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let slot = entry.reserve_slot();
        entry.keep(
            slot,
            token.on_cancel(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(entry.guard_count(), 1);

        assert!(registry.resolve(raw, Reason::PeerClosed));

        // The duplicate was the last handle on the peer side.
        local
            .set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .expect("Failed to set timeout");
        let mut buf = [0u8; 1];
        assert_eq!(local.read(&mut buf).expect("Failed to read"), 0);

        token.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn spent_and_discarded_guards_are_not_kept() {
        let registry = CloseRegistry::new();
        let (_, entry) = registry.add(13);

        let cancelled = CancelToken::new();
        cancelled.cancel();
        let slot = entry.reserve_slot();
        entry.keep(slot, cancelled.on_cancel(|_| {}));
        assert_eq!(entry.guard_count(), 0);

        let live = CancelToken::new();
        let slot = entry.reserve_slot();
        entry.keep(slot, live.on_cancel(|_| {}));
        assert_eq!(entry.guard_count(), 1);

        entry.discard(slot);
        assert_eq!(entry.guard_count(), 0);
        assert_eq!(live.signal().callback_count(), 0);
    }

    #[test]
    fn release_hook_runs_only_for_subscribed_entries() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let registry = CloseRegistry::with_release(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let (_, plain) = registry.add(11);
        let (_, armed) = registry.add(12);
        let armed_ok: Result<bool, ()> = armed.arm(|_| Ok(()));
        assert!(armed_ok.unwrap());

        registry.resolve(11, Reason::PeerClosed);
        registry.resolve(12, Reason::PeerClosed);

        assert!(plain.is_resolved());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_adds_converge() {
        let registry = Arc::new(CloseRegistry::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    let mut tokens = Vec::new();
                    for fd in 0..64 {
                        let (existed, entry) = registry.add(fd);
                        if !existed {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                        tokens.push(entry.token());
                    }
                    tokens
                })
            })
            .collect();

        let results: Vec<Vec<u64>> = handles
            .into_iter()
            .map(|h| h.join().expect("Thread panicked"))
            .collect();

        assert_eq!(winners.load(Ordering::SeqCst), 64);
        assert_eq!(registry.len(), 64);
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn concurrent_resolution_fires_once() {
        for _ in 0..32 {
            let registry = Arc::new(CloseRegistry::new());
            let (_, entry) = registry.add(1);
            let wins = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = [Reason::PeerClosed, Reason::Canceled, Reason::EngineClosed]
                .into_iter()
                .map(|reason| {
                    let registry = registry.clone();
                    let wins = wins.clone();
                    thread::spawn(move || {
                        let won = if matches!(reason, Reason::EngineClosed) {
                            registry.drain_all(reason) == 1
                        } else {
                            registry.resolve(1, reason)
                        };
                        if won {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().expect("Thread panicked");
            }

            assert_eq!(wins.load(Ordering::SeqCst), 1);
            assert!(entry.signal().is_fired());
            assert!(registry.is_empty());
        }
    }
}
