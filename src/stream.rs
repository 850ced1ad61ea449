//! Out-of-band byte streams.
//!
//! A [`StreamBroker`] moves a large byte sequence outside the
//! Request/Response envelope. Each stream gets a throwaway
//! [`SocketTransport`]; the first consumer to connect receives the source
//! bytes until EOF, then the listener is torn down.
//!
//! ```text
//! new_stream(src) ──► unix:///dir/stream-<id>.sock   (returned at once)
//!                         │
//! consumer connects ──────┘  copy src → conn, close src, stop listener
//! ```
//!
//! There is no length field: a consumer must treat an early EOF as a
//! failed transfer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::endpoint::Endpoint;
use crate::error::{AcommError, Result};
use crate::transport::SocketTransport;

type StreamMap = Arc<Mutex<HashMap<String, Arc<SocketTransport>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes byte sources as one-shot unix socket URLs.
#[derive(Debug, Clone)]
pub struct StreamBroker {
    dir: PathBuf,
    connect_timeout: Option<Duration>,
    streams: StreamMap,
}

impl StreamBroker {
    /// Broker creating its sockets in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            connect_timeout: None,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Tear a stream down if no consumer connects within `timeout`.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Publish `source` and return its URL without waiting for a consumer.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream socket cannot be bound.
    pub fn new_stream<R>(&self, source: R) -> Result<String>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let transport = Arc::new(SocketTransport::new(
            self.dir.join(format!("stream-{id}.sock")),
        ));
        transport.start()?;
        let url = transport.url();

        lock(&self.streams).insert(id.clone(), Arc::clone(&transport));
        log::debug!("[Stream] Published {} at {}", id, url);

        tokio::spawn(serve_stream(
            id,
            transport,
            source,
            self.connect_timeout,
            Arc::clone(&self.streams),
        ));
        Ok(url)
    }

    /// Streams published but not yet finished.
    pub fn num_streams(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Tear down every pending stream and wait for in-flight copies.
    pub async fn close(&self) {
        let transports: Vec<Arc<SocketTransport>> =
            lock(&self.streams).values().cloned().collect();
        for transport in transports {
            transport.stop().await;
        }
    }
}

/// Hand `source` to the first consumer, then clean up.
async fn serve_stream<R>(
    id: String,
    transport: Arc<SocketTransport>,
    mut source: R,
    connect_timeout: Option<Duration>,
    streams: StreamMap,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    // Bookkeeping goes last, even if this task is aborted.
    let _cleanup = scopeguard::guard(Arc::clone(&streams), |streams| {
        lock(&streams).remove(&id);
    });

    let conn = match connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, transport.next_conn())
            .await
            .unwrap_or_else(|_elapsed| {
                log::warn!("[Stream] No consumer for {} within {:?}", transport.url(), timeout);
                None
            }),
        None => transport.next_conn().await,
    };

    if let Some(mut conn) = conn {
        match tokio::io::copy(&mut source, conn.stream_mut()).await {
            Ok(bytes) => {
                log::debug!("[Stream] Sent {} bytes on {}", bytes, transport.url());
                if let Err(e) = conn.stream_mut().shutdown().await {
                    log::debug!("[Stream] Shutdown error on {}: {e}", transport.url());
                }
            }
            Err(e) => {
                log::warn!("[Stream] Copy to {} failed: {e}", transport.url());
            }
        }
        transport.done_conn(conn);
    }

    drop(source);
    // Late consumers still hold a wait token in the queue; release them
    // while stop drains or it never returns.
    tokio::join!(transport.stop(), async {
        while let Some(extra) = transport.next_conn().await {
            log::debug!("[Stream] Dropping extra connection {} on {}", extra.id(), transport.url());
            transport.done_conn(extra);
        }
    });
}

/// Connect to a stream URL and return the readable end.
pub async fn open_stream(url: &str) -> Result<UnixStream> {
    match Endpoint::parse(url)? {
        Endpoint::Unix(path) => Ok(UnixStream::connect(path).await?),
        Endpoint::Http(_) => Err(AcommError::invalid_url(url, "streams are served over unix sockets")),
    }
}
