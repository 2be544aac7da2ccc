#[cfg(test)]
mod tests {
    use hangup::{CancelToken, Engine, Frontend, Reason};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    fn init_test_tracing() {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::new("debug"))
            .with(tracing_subscriber::fmt::layer().compact().with_test_writer())
            .try_init();
    }

    fn frontend() -> Frontend {
        init_test_tracing();
        Frontend::new(Engine::new().expect("Failed to build engine"))
    }

    #[test]
    fn test_derived_token_fires_on_peer_close() {
        let frontend = frontend();
        let (local, peer) = UnixStream::pair().expect("Failed to create socket pair");

        let parent = CancelToken::new();
        let derived = frontend.with_cancellation(&parent, &local);
        assert!(!derived.is_cancelled());

        drop(peer);

        let reason = derived
            .signal()
            .wait_timeout(Duration::from_secs(2))
            .expect("Derived token did not fire");
        assert!(matches!(reason, Reason::PeerClosed));
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_cancelling_derived_token_releases_registration() {
        let frontend = frontend();
        let (local, _peer) = UnixStream::pair().expect("Failed to create socket pair");

        let parent = CancelToken::new();
        let derived = frontend.with_cancellation(&parent, &local);
        assert_eq!(frontend.engine().pending(), 1);

        derived.cancel();

        assert!(matches!(derived.reason(), Some(Reason::Canceled)));
        assert_eq!(frontend.engine().pending(), 0);
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_parent_cancellation_propagates_its_reason() {
        let frontend = frontend();
        let (local, _peer) = UnixStream::pair().expect("Failed to create socket pair");

        let parent = CancelToken::new();
        let derived = frontend.with_cancellation(&parent, &local);

        parent.cancel_with(Reason::EngineClosed);

        assert!(matches!(derived.reason(), Some(Reason::EngineClosed)));
        assert_eq!(frontend.engine().pending(), 0);
    }

    #[test]
    fn test_deadline_cancels_the_wait() {
        let frontend = frontend();
        let (local, _peer) = UnixStream::pair().expect("Failed to create socket pair");

        let parent = CancelToken::new();
        parent.cancel_after(Duration::from_millis(50));

        let start = Instant::now();
        let derived = frontend.with_cancellation(&parent, &local);
        let reason = derived
            .signal()
            .wait_timeout(Duration::from_secs(2))
            .expect("Deadline did not fire");

        assert!(matches!(reason, Reason::DeadlineExceeded));
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(frontend.engine().pending(), 0);
    }

    #[test]
    fn test_already_cancelled_token_resolves_immediately() {
        let frontend = frontend();
        let (local, _peer) = UnixStream::pair().expect("Failed to create socket pair");

        let parent = CancelToken::new();
        parent.cancel();

        let derived = frontend.with_cancellation(&parent, &local);

        assert!(matches!(derived.reason(), Some(Reason::Canceled)));
        assert_eq!(frontend.engine().pending(), 0);
    }

    #[test]
    fn test_engine_register_with_token() {
        init_test_tracing();
        let engine = Engine::new().expect("Failed to build engine");
        let (local, _peer) = UnixStream::pair().expect("Failed to create socket pair");

        let dup = local
            .as_fd()
            .try_clone_to_owned()
            .expect("Failed to duplicate");
        let token = CancelToken::new();
        let signal = engine.register(dup, Some(&token));

        assert_eq!(engine.pending(), 1);
        token.cancel_with(Reason::DeadlineExceeded);

        assert!(matches!(signal.reason(), Some(Reason::DeadlineExceeded)));
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_one_cancellation_leaves_other_waiters_pending() {
        let frontend = frontend();
        let (local, peer) = UnixStream::pair().expect("Failed to create socket pair");

        let first = frontend.with_cancellation(&CancelToken::new(), &local);
        let second = frontend.with_cancellation(&CancelToken::new(), &local);

        first.cancel();
        assert!(!second.is_cancelled());
        assert_eq!(frontend.engine().pending(), 1);

        drop(peer);
        let reason = second
            .signal()
            .wait_timeout(Duration::from_secs(2))
            .expect("Close not observed");
        assert!(matches!(reason, Reason::PeerClosed));
    }
}
