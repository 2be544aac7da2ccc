use crate::engine::Engine;
use crate::error::Error;
use crate::platform::{self, Platform};
use crate::sys::CancelPipe;

use std::fmt;
use std::sync::Arc;
use tracing::Dispatch;

/// Builder for configuring and creating an [`Engine`].
///
/// # Examples
///
/// ```rust,ignore
/// let engine = Engine::builder()
///     .name("api")
///     .stack_size(64 * 1024)
///     .build()?;
/// ```
pub struct Builder {
    /// Name used in logs and as the worker thread name prefix.
    name: String,

    /// Explicit worker thread name.
    thread_name: Option<String>,

    /// Worker thread stack size, in bytes.
    stack_size: Option<usize>,

    /// Platform adapter. Defaults to the one for the target OS.
    platform: Option<Arc<dyn Platform>>,

    /// Diagnostic sink for the engine's own events.
    dispatch: Option<Dispatch>,
}

impl Builder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self {
            name: "hangup".to_owned(),
            thread_name: None,
            stack_size: None,
            platform: None,
            dispatch: None,
        }
    }

    /// Sets the engine name reported in logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the worker thread name. Defaults to `"<name>-worker"`.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Sets the worker thread stack size.
    ///
    /// # Panics
    ///
    /// Panics if `bytes == 0`.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        assert!(bytes > 0, "stack_size must be > 0");

        self.stack_size = Some(bytes);
        self
    }

    /// Uses `platform` instead of the default adapter for this OS.
    pub fn platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Routes the engine's diagnostics to `dispatch` instead of the
    /// global subscriber.
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Builds the engine and starts its worker thread.
    ///
    /// Fails if the polling context, the cancellation pipe or the worker
    /// thread cannot be created.
    pub fn build(self) -> Result<Engine, Error> {
        let platform = match self.platform {
            Some(platform) => platform,
            None => platform::default_platform()?,
        };

        let cancel = CancelPipe::new().map_err(|err| Error::Pipe(Arc::new(err)))?;

        let poll = platform
            .start(cancel.reader())
            .map_err(|err| Error::start(platform.name(), err))?;

        let thread_name = self
            .thread_name
            .unwrap_or_else(|| format!("{}-worker", self.name));

        Engine::start(
            self.name,
            thread_name,
            self.stack_size,
            self.dispatch,
            platform,
            cancel,
            poll,
        )
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("thread_name", &self.thread_name)
            .field("stack_size", &self.stack_size)
            .field("platform", &self.platform.as_ref().map(|p| p.name()))
            .field("dispatch", &self.dispatch.is_some())
            .finish()
    }
}
