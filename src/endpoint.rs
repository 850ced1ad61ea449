//! Destination URLs.
//!
//! Requests and Responses are addressed by URL:
//!
//! - `unix:///run/acomm/tracker.sock`: a local unix socket path
//! - `http://host:port/path`, `https://...`: a remote HTTP endpoint

use std::fmt;
use std::path::{Path, PathBuf};

use reqwest::Url;

use crate::constants::UNIX_SCHEME;
use crate::error::{AcommError, Result};

/// A parsed destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Local unix-domain socket.
    Unix(PathBuf),
    /// Remote HTTP(S) endpoint.
    Http(Url),
}

impl Endpoint {
    /// Parse a destination URL.
    pub fn parse(url: &str) -> Result<Self> {
        if let Some(path) = url.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(AcommError::invalid_url(url, "missing socket path"));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let parsed = Url::parse(url).map_err(|e| AcommError::invalid_url(url, e.to_string()))?;
        match parsed.scheme() {
            "http" | "https" => Ok(Self::Http(parsed)),
            other => Err(AcommError::invalid_url(
                url,
                format!("unsupported scheme '{other}'"),
            )),
        }
    }

    /// `unix://` URL for a socket path.
    pub fn unix_url(path: &Path) -> String {
        format!("{UNIX_SCHEME}://{}", path.display())
    }

    /// Whether this endpoint is a local unix socket.
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{UNIX_SCHEME}://{}", path.display()),
            Self::Http(url) => write!(f, "{url}"),
        }
    }
}
