//! Transport-agnostic delivery of Requests and Responses.
//!
//! The destination URL picks the transport:
//!
//! ```text
//! unix://path      connect, write one envelope, half-close
//! http(s)://...    POST the JSON document; a 200 reply body is an
//!                  empty acknowledgement Response
//! ```

use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use tokio::net::UnixStream;

use crate::codec;
use crate::constants::HTTP_REQUEST_TIMEOUT;
use crate::endpoint::Endpoint;
use crate::error::{AcommError, Result};
use crate::protocol::{Request, Response};

/// Sends envelopes to unix or HTTP destinations.
///
/// Cheap to clone; clones share one HTTP connection pool.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: Client,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Dispatcher with the default HTTP timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(HTTP_REQUEST_TIMEOUT)
    }

    /// Dispatcher with a custom HTTP timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("[Dispatch] Falling back to default HTTP client: {e}");
                Client::new()
            });
        Self { client }
    }

    /// Send a Request to a provider.
    ///
    /// Failures are reported synchronously; a caller that already tracked
    /// the Request should remove it.
    pub async fn send(&self, dest: &str, req: &Request) -> Result<()> {
        log::debug!("[Dispatch] Request {} ({}) -> {}", req.id(), req.task, dest);
        match Endpoint::parse(dest)? {
            Endpoint::Unix(path) => send_unix(&path, req).await,
            Endpoint::Http(url) => {
                let resp = self.post(url, req).await?;
                if resp.status() != StatusCode::OK {
                    return Err(AcommError::protocol(format!(
                        "{dest} answered {}",
                        resp.status()
                    )));
                }
                Ok(())
            }
        }
    }

    /// Deliver a Response to its response hook.
    pub async fn send_response(&self, hook: &str, resp: &Response) -> Result<()> {
        log::debug!("[Dispatch] Response {} -> {}", resp.id, hook);
        match Endpoint::parse(hook)? {
            Endpoint::Unix(path) => send_unix(&path, resp).await,
            Endpoint::Http(url) => {
                let reply = self.post(url, resp).await?;
                let status = reply.status();
                let body = reply.bytes().await?;
                if status != StatusCode::OK {
                    return Err(AcommError::protocol(format!("{hook} answered {status}")));
                }
                check_ack(hook, &body)
            }
        }
    }

    async fn post<T: Serialize>(&self, url: Url, body: &T) -> Result<reqwest::Response> {
        Ok(self.client.post(url).json(body).send().await?)
    }
}

async fn send_unix<T: Serialize>(path: &std::path::Path, value: &T) -> Result<()> {
    let mut stream = UnixStream::connect(path).await?;
    codec::write_envelope(&mut stream, value).await
}

/// A 200 reply body is an acknowledgement Response. An empty body is
/// tolerated; an acknowledgement carrying an error is surfaced.
fn check_ack(hook: &str, body: &[u8]) -> Result<()> {
    let ack: Response = if body.iter().all(u8::is_ascii_whitespace) {
        Response::ack()
    } else {
        codec::decode(body)?
    };
    if let Some(error) = ack.error {
        log::warn!("[Dispatch] {hook} rejected response: {error}");
        return Err(AcommError::Remote(error));
    }
    if !ack.is_ack() {
        log::debug!("[Dispatch] {hook} acknowledged with a non-empty body");
    }
    Ok(())
}
