//! # Hangup
//!
//! **Hangup** tells you when the other end of a connection goes away,
//! without reading from it.
//!
//! A single background worker per engine waits on the operating system's
//! readiness facility (`epoll` on Linux, `kqueue` on macOS and the BSDs)
//! for hangup and error conditions on every watched descriptor. Waiting on
//! a connection never consumes its data, so the caller's protocol code
//! keeps full ownership of the stream.
//!
//! It offers:
//!
//! - [`done`] and [`Frontend::done`], returning a [`Signal`] that fires when
//!   the peer closes
//! - [`with_cancellation`], deriving a [`CancelToken`] that also fires on
//!   peer close
//! - an [`Engine`] with explicit lifecycle, configured through [`Builder`]
//! - a pluggable [`platform::Platform`] adapter
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::net::TcpStream;
//!
//! let stream = TcpStream::connect("127.0.0.1:8080")?;
//! let closed = hangup::done(&stream);
//!
//! // ... serve the request ...
//!
//! if closed.is_fired() {
//!     println!("client left: {}", closed.wait());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`platform`]: platform adapters and the retry helper

mod builder;
mod engine;
mod error;
mod frontend;
mod registry;
mod signal;
mod sys;

pub mod platform;

pub use builder::Builder;
pub use engine::Engine;
pub use error::{Error, Reason};
pub use frontend::{Connection, Frontend, default_frontend, done, install_default, with_cancellation};
pub use signal::{CancelGuard, CancelToken, Signal};
