//! Fan-out/fan-in over a [`Tracker`].
//!
//! A [`MultiRequest`] tracks several named Requests and gathers their
//! Responses into one map. Sending stays with the caller:
//!
//! ```ignore
//! let multi = MultiRequest::new(&tracker);
//! for (name, dest, req) in work {
//!     multi.add_request(name, &req, timeout)?;
//!     if dispatcher.send(dest, &req).await.is_err() {
//!         multi.remove_request(&req);
//!     }
//! }
//! let responses = multi.responses().await;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{AcommError, Result};
use crate::protocol::{Request, Response, ResponseHandler};
use crate::tracker::Tracker;

#[derive(Debug, Default)]
struct Gathered {
    /// Request ID to caller-chosen name.
    names: HashMap<String, String>,
    responses: HashMap<String, Response>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Named group of Requests awaited together.
#[derive(Debug)]
pub struct MultiRequest {
    tracker: Tracker,
    gathered: Arc<Mutex<Gathered>>,
    pending: Arc<watch::Sender<usize>>,
}

impl MultiRequest {
    /// Empty group tracking through `tracker`.
    pub fn new(tracker: &Tracker) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            tracker: tracker.clone(),
            gathered: Arc::new(Mutex::new(Gathered::default())),
            pending: Arc::new(pending),
        }
    }

    /// Track `req` under `name`.
    ///
    /// Handlers already installed on `req` still run. The caller sends the
    /// Request afterwards.
    ///
    /// # Errors
    ///
    /// [`AcommError::DuplicateName`] if `name` was added before, or any
    /// [`Tracker::track_request`] error. The group is unchanged on error.
    pub fn add_request(&self, name: impl Into<String>, req: &Request, timeout: Duration) -> Result<()> {
        let name = name.into();
        {
            let mut gathered = lock(&self.gathered);
            if gathered.names.values().any(|n| *n == name)
                || gathered.responses.contains_key(&name)
            {
                return Err(AcommError::DuplicateName(name));
            }
            gathered.names.insert(req.id().to_string(), name.clone());
        }

        let mut wrapped = req.clone();
        wrapped.set_handlers(
            Some(self.collector(&name, req.success_handler().cloned())),
            Some(self.collector(&name, req.error_handler().cloned())),
        );

        // Counted first: a fast Response may conclude before tracking returns.
        self.pending.send_modify(|n| *n += 1);
        if let Err(e) = self.tracker.track_request(&wrapped, timeout) {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            lock(&self.gathered).names.remove(req.id());
            return Err(e);
        }

        log::debug!("[Multi] Added {} as {}", req.id(), name);
        Ok(())
    }

    /// Handler that records the Response under `name` after running the
    /// caller's own handler.
    fn collector(&self, name: &str, original: Option<ResponseHandler>) -> ResponseHandler {
        let name = name.to_string();
        let gathered = Arc::clone(&self.gathered);
        let pending = Arc::clone(&self.pending);
        Arc::new(move |req: &Request, resp: &Response| {
            if let Some(original) = &original {
                original(req, resp);
            }
            {
                let mut gathered = lock(&gathered);
                gathered.names.remove(req.id());
                gathered.responses.insert(name.clone(), resp.clone());
            }
            pending.send_modify(|n| *n = n.saturating_sub(1));
        })
    }

    /// Withdraw a Request whose send failed.
    ///
    /// Returns whether the Tracker still held it; only then is the
    /// wait-count decremented.
    pub fn remove_request(&self, req: &Request) -> bool {
        if !self.tracker.remove_request(req.id()) {
            return false;
        }
        if let Some(name) = lock(&self.gathered).names.remove(req.id()) {
            log::debug!("[Multi] Removed {} ({})", name, req.id());
        }
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
        true
    }

    /// Requests added and not yet concluded or removed.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Wait for every added, non-removed Request to conclude and return
    /// the Responses by name. Timeouts count as concluded.
    pub async fn responses(&self) -> HashMap<String, Response> {
        let mut pending = self.pending.subscribe();
        // The sender is owned by self, so this cannot observe a close.
        let _ = pending.wait_for(|n| *n == 0).await;
        lock(&self.gathered).responses.clone()
    }
}
