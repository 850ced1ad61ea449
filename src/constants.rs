//! Crate-wide constants for acomm.
//!
//! Centralizes magic numbers for the socket transport, the envelope codec
//! and the HTTP dispatcher.
//!
//! # Categories
//!
//! - **Sockets**: path limits, queue depth, accept back-off
//! - **Envelopes**: size limits
//! - **Timeouts**: HTTP and default request timeouts

use std::time::Duration;

// ============================================================================
// Sockets
// ============================================================================

/// Maximum unix socket path length.
///
/// `sun_path` is 104 bytes on macOS and 108 on Linux; the smaller limit is
/// used so paths are portable.
pub const MAX_SOCKET_PATH: usize = 104;

/// Number of accepted connections that may wait in a transport's queue
/// before the accept loop stops pulling new ones off the listener.
pub const CONN_QUEUE_DEPTH: usize = 64;

/// Back-off after a failed `accept` before the loop tries again.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// URL scheme for local unix-socket addresses.
pub const UNIX_SCHEME: &str = "unix";

// ============================================================================
// Envelopes
// ============================================================================

/// Maximum size of one encoded Request or Response document (16 MB).
///
/// Bulk data belongs in a stream, not in the envelope.
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for remote hooks.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout applied by the CLI when none is given.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
