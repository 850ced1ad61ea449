//! acomm - asynchronous Request/Response correlation over unix sockets
//! and HTTP.
//!
//! A requester tracks a [`Request`] with a [`Tracker`], sends it to a
//! provider, and receives the [`Response`] later on its own socket (the
//! response hook). Providers run [`TaskHandler`]s behind a [`TaskServer`].
//!
//! # Architecture
//!
//! ```text
//!  requester                                   provider
//! ┌──────────────────────┐   Request       ┌──────────────────┐
//! │ Tracker              │ ──────────────► │ TaskServer       │
//! │  id → Request map    │                 │  task → handler  │
//! │  SocketTransport ◄───┼──── Response ── │  Dispatcher      │
//! │  StreamBroker        │                 └──────────────────┘
//! └──────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`transport`] - unix socket server with graceful drain
//! - [`codec`] - one JSON envelope per connection
//! - [`protocol`] - Request/Response model
//! - [`tracker`] - correlation, timeouts, proxying
//! - [`multi`] - fan-out/fan-in
//! - [`stream`] - out-of-band byte streams
//! - [`dispatch`] - unix/HTTP delivery
//! - [`handler`] - task providers
//! - [`config`] - configuration loading/saving

pub mod codec;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod multi;
pub mod protocol;
pub mod stream;
pub mod tracker;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::Dispatcher;
pub use endpoint::Endpoint;
pub use error::{AcommError, Result};
pub use handler::{EchoHandler, TaskHandler, TaskServer};
pub use multi::MultiRequest;
pub use protocol::{ErrorKind, Request, Response, ResponseError, ResponseHandler, TaskOutput};
pub use stream::{open_stream, StreamBroker};
pub use tracker::{Tracker, TrackerState};
pub use transport::{Connection, SocketTransport};
