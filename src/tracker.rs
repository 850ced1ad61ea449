//! Request/Response correlation.
//!
//! The [`Tracker`] keeps every outstanding Request in a map keyed by ID and
//! owns the unix socket its Responses come back on (its *response hook*).
//! A Response is matched by ID, its entry removed, and exactly one handler
//! invoked. Requests tracked with a timeout get a synthesized `timeout`
//! error if nothing arrives in time.
//!
//! ```text
//! track_request(req, t) ──► map[id] = req  ── timer(t) ──┐
//!                                 ▲                       │ expire
//! response socket ──► decode ──► handle_response(resp)    ▼
//!                                 │           remove map[id] (first wins)
//!                                 ▼
//!              proxied? relay to original hook : invoke handler
//! ```
//!
//! # Lifecycle
//!
//! `Stopped → Started → Stopping → Stopped`. `stop` waits until every
//! tracked Request has concluded before closing the response socket.
//!
//! # Proxying
//!
//! [`Tracker::proxy_unix`] lets local-only task machinery service a Request
//! whose hook is remote: the derived Request points at this Tracker, and
//! the eventual Response is relayed verbatim to the real hook.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::endpoint::Endpoint;
use crate::error::{AcommError, Result};
use crate::protocol::{Request, Response, ResponseError, ResponseHandler};
use crate::stream::StreamBroker;
use crate::transport::SocketTransport;

/// Lifecycle state of a [`Tracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// Not accepting work.
    Stopped,
    /// Tracking requests and receiving responses.
    Started,
    /// Waiting for outstanding requests before stopping.
    Stopping,
}

/// A Request awaiting its Response.
struct Tracked {
    req: Request,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    state: TrackerState,
    requests: HashMap<String, Tracked>,
    transport: Option<Arc<SocketTransport>>,
    consumer: Option<JoinHandle<()>>,
}

struct Inner {
    socket_path: PathBuf,
    response_hook: String,
    dispatcher: Dispatcher,
    streams: StreamBroker,
    shared: Mutex<Shared>,
    /// Requests tracked and not yet concluded. Decremented only after the
    /// handler or relay has run, so `stop` never cuts a delivery short.
    outstanding: watch::Sender<usize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Correlates outstanding Requests with their eventual Responses.
///
/// Cheap to clone; clones share state. Independent Trackers may coexist in
/// one process as long as their socket paths differ.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("response_hook", &self.inner.response_hook)
            .field("state", &self.state())
            .field("requests", &self.num_requests())
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// Tracker listening on `socket_path`. Streams are created next to it.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let socket_path = socket_path.into();
        let stream_dir = socket_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::with_parts(socket_path, Dispatcher::new(), StreamBroker::new(stream_dir))
    }

    /// Tracker using the socket directory and timeouts from `config`.
    ///
    /// The socket name is unique per Tracker.
    pub fn from_config(config: &Config) -> Self {
        let name = format!(
            "tracker-{}-{}.sock",
            std::process::id(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self::with_parts(
            config.socket_dir.join(name),
            Dispatcher::with_timeout(config.http_timeout()),
            StreamBroker::new(config.stream_dir())
                .with_connect_timeout(config.stream_connect_timeout()),
        )
    }

    /// Tracker with an explicit dispatcher and stream broker.
    pub fn with_parts(
        socket_path: impl Into<PathBuf>,
        dispatcher: Dispatcher,
        streams: StreamBroker,
    ) -> Self {
        let socket_path = socket_path.into();
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                response_hook: Endpoint::unix_url(&socket_path),
                socket_path,
                dispatcher,
                streams,
                shared: Mutex::new(Shared {
                    state: TrackerState::Stopped,
                    requests: HashMap::new(),
                    transport: None,
                    consumer: None,
                }),
                outstanding,
            }),
        }
    }

    /// Bind the response socket and start consuming Responses.
    ///
    /// No-op if already started. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`AcommError::Stopping`] while a stop is in progress, or the bind
    /// error of the response socket.
    pub fn start(&self) -> Result<()> {
        let mut shared = lock(&self.inner.shared);
        match shared.state {
            TrackerState::Started => return Ok(()),
            TrackerState::Stopping => return Err(AcommError::Stopping),
            TrackerState::Stopped => {}
        }

        let transport = Arc::new(SocketTransport::new(&self.inner.socket_path));
        transport.start()?;

        shared.consumer = Some(tokio::spawn(Self::consume(
            Arc::downgrade(&self.inner),
            Arc::clone(&transport),
        )));
        shared.transport = Some(transport);
        shared.state = TrackerState::Started;
        log::info!("[Tracker] Started on {}", self.inner.response_hook);
        Ok(())
    }

    /// Consume Response connections, one task per connection.
    async fn consume(inner: Weak<Inner>, transport: Arc<SocketTransport>) {
        while let Some(mut conn) = transport.next_conn().await {
            let Some(inner) = inner.upgrade() else {
                transport.done_conn(conn);
                continue;
            };
            let tracker = Tracker { inner };
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                match codec::read_response(conn.stream_mut()).await {
                    Ok(resp) => {
                        if let Err(e) = tracker.handle_response(resp).await {
                            log::warn!("[Tracker] {e}");
                        }
                    }
                    Err(e) => {
                        log::warn!("[Tracker] Dropping connection {}: {e}", conn.id());
                    }
                }
                transport.done_conn(conn);
            });
        }
    }

    /// Start tracking `req`.
    ///
    /// With a non-zero `timeout`, a `timeout` error Response is delivered if
    /// no real Response arrives first.
    ///
    /// # Errors
    ///
    /// [`AcommError::NotStarted`] if the Tracker is stopped,
    /// [`AcommError::Stopping`] while stopping, [`AcommError::DuplicateId`]
    /// if the ID is already tracked. Nothing is changed on error.
    pub fn track_request(&self, req: &Request, timeout: Duration) -> Result<()> {
        let mut shared = lock(&self.inner.shared);
        match shared.state {
            TrackerState::Started => {}
            TrackerState::Stopped => return Err(AcommError::NotStarted),
            TrackerState::Stopping => return Err(AcommError::Stopping),
        }
        if shared.requests.contains_key(req.id()) {
            return Err(AcommError::DuplicateId(req.id().to_string()));
        }

        let timer = (!timeout.is_zero()).then(|| self.spawn_timer(req.id().to_string(), timeout));
        shared.requests.insert(
            req.id().to_string(),
            Tracked {
                req: req.clone(),
                timer,
            },
        );
        self.inner.outstanding.send_modify(|n| *n += 1);

        log::debug!(
            "[Tracker] Tracking {} ({}) timeout={:?}",
            req.id(),
            req.task,
            timeout
        );
        Ok(())
    }

    fn spawn_timer(&self, id: String, timeout: Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                Tracker { inner }.expire(&id, timeout).await;
            }
        })
    }

    /// Deliver a synthesized timeout, unless a real Response won the race.
    async fn expire(&self, id: &str, timeout: Duration) {
        // The timer handle is left alone here: this runs inside it.
        let Some(tracked) = self.take(id) else {
            return;
        };
        log::info!("[Tracker] Request {} ({}) timed out after {:?}", id, tracked.req.task, timeout);

        let resp = Response::failure(
            id,
            ResponseError::timeout(timeout).with_context("task", tracked.req.task.clone()),
        );
        if let Err(e) = self.deliver(&tracked.req, &resp).await {
            log::warn!("[Tracker] Timeout delivery for {} failed: {e}", id);
        }
        self.conclude();
    }

    /// Stop tracking without waiting for a Response (e.g. after a failed
    /// send). Returns whether the ID was tracked.
    pub fn remove_request(&self, id: &str) -> bool {
        match self.take(id) {
            Some(tracked) => {
                if let Some(timer) = tracked.timer {
                    timer.abort();
                }
                log::debug!("[Tracker] Removed {}", id);
                self.conclude();
                true
            }
            None => false,
        }
    }

    /// Match a Response to its Request and deliver it.
    ///
    /// A proxied Request has the Response relayed to its original hook;
    /// otherwise the success or error handler runs, exactly once.
    ///
    /// # Errors
    ///
    /// [`AcommError::UntrackedResponse`] if no Request has this ID (the
    /// Response is dropped), [`AcommError::Protocol`] for an invalid
    /// Response, or the relay error for a proxied Request.
    pub async fn handle_response(&self, resp: Response) -> Result<()> {
        resp.validate()?;

        let Some(tracked) = self.take(&resp.id) else {
            log::warn!("[Tracker] Dropping untracked response {}", resp.id);
            return Err(AcommError::UntrackedResponse(resp.id));
        };
        if let Some(timer) = tracked.timer {
            timer.abort();
        }

        let result = self.deliver(&tracked.req, &resp).await;
        self.conclude();
        result
    }

    /// Remove an entry. Whoever gets `Some` owns the delivery.
    fn take(&self, id: &str) -> Option<Tracked> {
        lock(&self.inner.shared).requests.remove(id)
    }

    fn conclude(&self) {
        self.inner.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    async fn deliver(&self, req: &Request, resp: &Response) -> Result<()> {
        if req.is_proxied() {
            log::debug!("[Tracker] Relaying {} to {}", resp.id, req.response_hook);
            return self.inner.dispatcher.send_response(&req.response_hook, resp).await;
        }
        if !req.dispatch(resp) {
            log::debug!("[Tracker] No handler for {} ({})", resp.id, req.task);
        }
        Ok(())
    }

    /// Wait for every tracked Request to conclude, then close the response
    /// socket.
    pub async fn stop(&self) {
        {
            let mut shared = lock(&self.inner.shared);
            if shared.state == TrackerState::Stopped {
                return;
            }
            shared.state = TrackerState::Stopping;
        }

        let mut outstanding = self.inner.outstanding.subscribe();
        let pending = *outstanding.borrow();
        if pending > 0 {
            log::info!("[Tracker] Waiting for {} outstanding request(s)", pending);
        }
        // The sender lives in `inner`, so this only returns once drained.
        let _ = outstanding.wait_for(|n| *n == 0).await;

        let (transport, consumer) = {
            let mut shared = lock(&self.inner.shared);
            (shared.transport.take(), shared.consumer.take())
        };
        if let Some(transport) = transport {
            transport.stop().await;
        }
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.await {
                log::error!("[Tracker] Response consumer panicked: {e}");
            }
        }

        lock(&self.inner.shared).state = TrackerState::Stopped;
        log::info!("[Tracker] Stopped {}", self.inner.response_hook);
    }

    /// Track `req`, send it to `dest`, and wait for its Response.
    ///
    /// The Request's hook is pointed at this Tracker. A zero `timeout`
    /// waits indefinitely.
    ///
    /// # Errors
    ///
    /// The send error (the Request is untracked again),
    /// [`AcommError::Timeout`] if nothing arrived in time, or any
    /// [`track_request`](Self::track_request) error. A Response that
    /// arrives in time is returned unchanged, whatever its error kind.
    pub async fn sync_request(
        &self,
        dest: &str,
        mut req: Request,
        timeout: Duration,
    ) -> Result<Response> {
        let (reply_tx, reply_rx) = oneshot::channel::<Response>();
        let reply_tx = Mutex::new(Some(reply_tx));
        let handler: ResponseHandler = Arc::new(move |_: &Request, resp: &Response| {
            if let Some(tx) = lock(&reply_tx).take() {
                let _ = tx.send(resp.clone());
            }
        });
        req.response_hook = self.inner.response_hook.clone();
        req.set_handlers(Some(Arc::clone(&handler)), Some(handler));

        // The deadline is enforced here so a provider's own timeout-kind
        // Response is returned as is.
        self.track_request(&req, Duration::ZERO)?;
        if let Err(e) = self.inner.dispatcher.send(dest, &req).await {
            self.remove_request(req.id());
            return Err(e);
        }

        let id = req.id().to_string();
        drop(req);
        let mut reply_rx = reply_rx;
        if !timeout.is_zero() {
            match tokio::time::timeout(timeout, &mut reply_rx).await {
                Ok(reply) => return reply.map_err(|_closed| AcommError::NotTracked(id)),
                Err(_elapsed) => {
                    if self.remove_request(&id) {
                        log::debug!("[Tracker] sync_request {id} timed out after {timeout:?}");
                        return Err(AcommError::Timeout(timeout));
                    }
                    // A delivery already claimed the entry; its reply is on the way.
                }
            }
        }
        reply_rx.await.map_err(|_closed| AcommError::NotTracked(id))
    }

    /// Publish `source` as a one-shot stream; returns its `unix://` URL.
    pub fn new_stream_unix<R>(&self, source: R) -> Result<String>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.inner.streams.new_stream(source)
    }

    /// Make a Request with a remote hook serviceable over local transport.
    ///
    /// A Request whose hook is already `unix://` is returned unchanged.
    /// Otherwise the original is tracked as proxied (no timeout) and a
    /// derived Request, same ID and task but hooked to this Tracker, is
    /// returned for local dispatch.
    ///
    /// # Errors
    ///
    /// An invalid hook URL, or any [`track_request`](Self::track_request)
    /// error.
    pub fn proxy_unix(&self, req: Request) -> Result<Request> {
        if Endpoint::parse(&req.response_hook)?.is_unix() {
            return Ok(req);
        }

        let derived = req.derive_with_hook(self.inner.response_hook.clone());
        let mut original = req;
        original.mark_proxied();
        self.track_request(&original, Duration::ZERO)?;
        log::debug!(
            "[Tracker] Proxying {} from {} via {}",
            original.id(),
            original.response_hook,
            self.inner.response_hook
        );
        Ok(derived)
    }

    /// Copy of a tracked Request.
    pub fn get(&self, id: &str) -> Option<Request> {
        lock(&self.inner.shared).requests.get(id).map(|t| t.req.clone())
    }

    /// Number of Requests currently tracked.
    pub fn num_requests(&self) -> usize {
        lock(&self.inner.shared).requests.len()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TrackerState {
        lock(&self.inner.shared).state
    }

    /// `unix://` URL Responses should be sent to.
    pub fn response_hook(&self) -> &str {
        &self.inner.response_hook
    }

    /// Path of the response socket.
    pub fn socket_path(&self) -> &Path {
        &self.inner.socket_path
    }

    /// Dispatcher used for sends and relays.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Broker behind [`new_stream_unix`](Self::new_stream_unix).
    pub fn stream_broker(&self) -> &StreamBroker {
        &self.inner.streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn started_tracker(dir: &tempfile::TempDir) -> Tracker {
        let tracker = Tracker::new(dir.path().join("tracker.sock"));
        tracker.start().unwrap();
        tracker
    }

    /// Request whose handlers forward every delivery into a channel.
    fn observed_request(task: &str) -> (Request, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let err_tx = tx.clone();
        let req = Request::new(task, json!({"k": "v"}), "unix:///unused.sock")
            .on_success(move |_, resp| {
                let _ = tx.send(resp.clone());
            })
            .on_error(move |_, resp| {
                let _ = err_tx.send(resp.clone());
            });
        (req, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Response>) -> Response {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for delivery")
            .expect("Handler channel closed")
    }

    #[tokio::test]
    async fn test_track_requires_start() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = Tracker::new(tmp.path().join("t.sock"));
        let req = Request::new("echo", json!(null), "unix:///x.sock");
        assert!(matches!(
            tracker.track_request(&req, Duration::ZERO),
            Err(AcommError::NotStarted)
        ));
        assert_eq!(tracker.num_requests(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_without_mutation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        let req = Request::new("echo", json!(null), "unix:///x.sock");

        tracker.track_request(&req, Duration::ZERO).unwrap();
        let err = tracker.track_request(&req, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, AcommError::DuplicateId(ref id) if id == req.id()));
        assert_eq!(tracker.num_requests(), 1);

        assert!(tracker.remove_request(req.id()));
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_success_handler_fires_exactly_once() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_c = Arc::clone(&calls);
        let req = Request::new("echo", json!(1), "unix:///x.sock").on_success(move |r, resp| {
            assert_eq!(r.id(), resp.id);
            calls_c.fetch_add(1, Ordering::SeqCst);
        });
        tracker.track_request(&req, Duration::ZERO).unwrap();

        let resp = Response::success(req.id(), json!({"ok": true}));
        tracker.handle_response(resp.clone()).await.unwrap();
        let again = tracker.handle_response(resp).await.unwrap_err();

        assert!(matches!(again, AcommError::UntrackedResponse(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.num_requests(), 0);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_error_response_goes_to_error_handler() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        let (req, mut rx) = observed_request("zfs-destroy");
        tracker.track_request(&req, Duration::ZERO).unwrap();

        tracker
            .handle_response(Response::failure(req.id(), ResponseError::task("dataset busy")))
            .await
            .unwrap();
        let resp = recv(&mut rx).await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::Task));
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_synthesizes_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        let seen_tracked = Arc::new(AtomicUsize::new(usize::MAX));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let probe = tracker.clone();
        let seen = Arc::clone(&seen_tracked);
        let req = Request::new("echo", json!(null), "unix:///x.sock").on_error(move |_, resp| {
            seen.store(probe.num_requests(), Ordering::SeqCst);
            let _ = tx.send(resp.clone());
        });

        tracker.track_request(&req, Duration::from_millis(100)).unwrap();
        let resp = recv(&mut rx).await;

        assert_eq!(resp.id, req.id());
        assert_eq!(resp.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(resp.error.as_ref().unwrap().context["task"], "echo");
        assert_eq!(seen_tracked.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.num_requests(), 0);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_real_response_cancels_timeout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        let (req, mut rx) = observed_request("echo");
        tracker.track_request(&req, Duration::from_millis(150)).unwrap();

        tracker
            .handle_response(Response::success(req.id(), json!("done")))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await.result, Some(json!("done")));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err(), "timeout fired after a real response");
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_removed_request_ignores_late_response() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        let (req, mut rx) = observed_request("echo");
        tracker.track_request(&req, Duration::from_millis(100)).unwrap();

        assert!(tracker.remove_request(req.id()));
        assert!(!tracker.remove_request(req.id()));

        let err = tracker
            .handle_response(Response::success(req.id(), json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AcommError::UntrackedResponse(_)));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(rx.try_recv().is_err(), "no handler should run after removal");
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_response_over_socket() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        let (req, mut rx) = observed_request("echo");
        tracker.track_request(&req, Duration::ZERO).unwrap();

        tracker
            .dispatcher()
            .send_response(tracker.response_hook(), &Response::success(req.id(), json!(7)))
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await.result, Some(json!(7)));
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_connection_does_not_stop_listener() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        let (req, mut rx) = observed_request("echo");
        tracker.track_request(&req, Duration::ZERO).unwrap();

        let mut bad = tokio::net::UnixStream::connect(tracker.socket_path()).await.unwrap();
        bad.write_all(b"{\"id\": 12, garbage").await.unwrap();
        bad.shutdown().await.unwrap();

        let mut ambiguous = tokio::net::UnixStream::connect(tracker.socket_path()).await.unwrap();
        let both = format!(
            r#"{{"id":"{}","result":1,"error":{{"kind":"task","message":"x"}}}}"#,
            req.id()
        );
        ambiguous.write_all(both.as_bytes()).await.unwrap();
        ambiguous.shutdown().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tracker.num_requests(), 1, "ambiguous response must not match");

        tracker
            .dispatcher()
            .send_response(tracker.response_hook(), &Response::success(req.id(), json!("ok")))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await.result, Some(json!("ok")));
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_outstanding_requests() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        let (req, _rx) = observed_request("echo");
        tracker.track_request(&req, Duration::ZERO).unwrap();

        let stopper = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!stopper.is_finished());
        assert_eq!(tracker.state(), TrackerState::Stopping);

        // No new work while draining.
        let late = Request::new("echo", json!(null), "unix:///x.sock");
        assert!(matches!(
            tracker.track_request(&late, Duration::ZERO),
            Err(AcommError::Stopping)
        ));
        assert!(matches!(tracker.start(), Err(AcommError::Stopping)));

        // The response socket keeps serving until drained.
        tracker
            .dispatcher()
            .send_response(tracker.response_hook(), &Response::success(req.id(), json!(1)))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), stopper)
            .await
            .expect("stop did not finish")
            .unwrap();
        assert_eq!(tracker.state(), TrackerState::Stopped);
        assert!(!tracker.socket_path().exists());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        tracker.stop().await;
        tracker.start().unwrap();
        assert_eq!(tracker.state(), TrackerState::Started);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_trackers_coexist() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = Tracker::new(tmp.path().join("a.sock"));
        let b = Tracker::new(tmp.path().join("b.sock"));
        a.start().unwrap();
        b.start().unwrap();

        let req = Request::new("echo", json!(null), "unix:///x.sock");
        a.track_request(&req, Duration::ZERO).unwrap();
        assert_eq!(a.num_requests(), 1);
        assert_eq!(b.num_requests(), 0);
        assert!(matches!(
            b.handle_response(Response::success(req.id(), json!(1))).await,
            Err(AcommError::UntrackedResponse(_))
        ));

        a.remove_request(req.id());
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_each_fire_once() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut ids = Vec::new();
        for i in 0..32 {
            let calls = Arc::clone(&calls);
            let req = Request::new("echo", json!(i), "unix:///x.sock").on_success(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
            tracker.track_request(&req, Duration::from_secs(5)).unwrap();
            ids.push(req.id().to_string());
        }

        let mut sends = Vec::new();
        for id in &ids {
            let dispatcher = tracker.dispatcher().clone();
            let hook = tracker.response_hook().to_string();
            let resp = Response::success(id.clone(), json!("ok"));
            sends.push(tokio::spawn(async move {
                dispatcher.send_response(&hook, &resp).await.unwrap();
            }));
        }
        for send in sends {
            send.await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), tracker.stop())
            .await
            .expect("stop should finish once all responses arrived");
        assert_eq!(calls.load(Ordering::SeqCst), 32);
    }

    #[tokio::test]
    async fn test_proxy_unix_is_noop_for_local_hook() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        let req = Request::new("echo", json!(null), "unix:///run/caller.sock");
        let id = req.id().to_string();

        let same = tracker.proxy_unix(req).unwrap();
        assert_eq!(same.id(), id);
        assert_eq!(same.response_hook, "unix:///run/caller.sock");
        assert_eq!(tracker.num_requests(), 0);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_proxy_unix_relays_to_remote_hook() {
        let server = MockServer::start().await;
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);

        let hook = format!("{}/responses", server.uri());
        let req = Request::new("dhcp-lease", json!({"mac": "aa"}), hook.clone());
        let id = req.id().to_string();

        Mock::given(method("POST"))
            .and(path("/responses"))
            .and(body_partial_json(json!({"id": id, "result": {"ip": "10.0.0.5"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": ""})))
            .expect(1)
            .mount(&server)
            .await;

        let derived = tracker.proxy_unix(req).unwrap();
        assert_eq!(derived.id(), id);
        assert_eq!(derived.task, "dhcp-lease");
        assert_eq!(derived.response_hook, tracker.response_hook());

        let original = tracker.get(&id).expect("original should be tracked");
        assert!(original.is_proxied());
        assert_eq!(original.response_hook, hook);

        // Local task machinery answers the derived request's hook.
        tracker
            .dispatcher()
            .send_response(
                &derived.response_hook,
                &Response::success(derived.id(), json!({"ip": "10.0.0.5"})),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), tracker.stop())
            .await
            .expect("stop should finish after the relay");
        assert!(tracker.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_proxy_unix_relays_unknown_kind_and_structured_context() {
        let server = MockServer::start().await;
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);

        let hook = format!("{}/responses", server.uri());
        let req = Request::new("zfs-destroy", json!({"dataset": "tank/vm1"}), hook);
        let id = req.id().to_string();

        Mock::given(method("POST"))
            .and(path("/responses"))
            .and(body_partial_json(json!({
                "id": id,
                "error": {"kind": "zfs_busy", "message": "busy", "context": {"code": 16}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": ""})))
            .expect(1)
            .mount(&server)
            .await;

        let derived = tracker.proxy_unix(req).unwrap();

        // Raw bytes from a provider newer than this build.
        let raw = json!({
            "id": id,
            "error": {"kind": "zfs_busy", "message": "busy", "context": {"code": 16}}
        });
        let Endpoint::Unix(hook_path) = Endpoint::parse(&derived.response_hook).unwrap() else {
            panic!("derived hook should be unix");
        };
        let mut conn = tokio::net::UnixStream::connect(hook_path).await.unwrap();
        conn.write_all(raw.to_string().as_bytes()).await.unwrap();
        conn.shutdown().await.unwrap();
        drop(conn);

        tokio::time::timeout(Duration::from_secs(5), tracker.stop())
            .await
            .expect("stop should finish after the relay");
        assert!(tracker.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_sync_request_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);

        // Minimal provider: read one request, answer its hook.
        let provider_path = tmp.path().join("provider.sock");
        let listener = tokio::net::UnixListener::bind(&provider_path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let req = codec::read_request(&mut stream).await.unwrap();
            let resp = Response::success(req.id(), req.args.clone());
            Dispatcher::new().send_response(&req.response_hook, &resp).await.unwrap();
        });

        let req = Request::new("echo", json!({"hello": "world"}), "");
        let resp = tracker
            .sync_request(&Endpoint::unix_url(&provider_path), req, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.result, Some(json!({"hello": "world"})));
        assert_eq!(tracker.num_requests(), 0);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_sync_request_times_out() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);

        // Accepts but never answers.
        let provider_path = tmp.path().join("silent.sock");
        let listener = tokio::net::UnixListener::bind(&provider_path).unwrap();
        let _keep = tokio::spawn(async move {
            let _conn = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let req = Request::new("echo", json!(null), "");
        let err = tracker
            .sync_request(&Endpoint::unix_url(&provider_path), req, Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, AcommError::Timeout(_)), "got: {err:?}");
        assert_eq!(tracker.num_requests(), 0);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_sync_request_returns_provider_timeout_response() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);

        // Provider whose own work timed out; that is an answer, not a local timeout.
        let provider_path = tmp.path().join("stalled.sock");
        let listener = tokio::net::UnixListener::bind(&provider_path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let req = codec::read_request(&mut stream).await.unwrap();
            let resp = Response::failure(
                req.id(),
                ResponseError::new(ErrorKind::Timeout, "zfs send stalled"),
            );
            Dispatcher::new().send_response(&req.response_hook, &resp).await.unwrap();
        });

        let req = Request::new("zfs-send", json!({"dataset": "tank/vm1"}), "");
        let resp = tracker
            .sync_request(&Endpoint::unix_url(&provider_path), req, Duration::from_secs(5))
            .await
            .expect("provider response should be returned");
        assert_eq!(resp.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(resp.error.unwrap().message, "zfs send stalled");
        assert_eq!(tracker.num_requests(), 0);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_sync_request_send_failure_untracks() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        let dest = Endpoint::unix_url(&tmp.path().join("nobody.sock"));

        let err = tracker
            .sync_request(&dest, Request::new("echo", json!(null), ""), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AcommError::Io(_)), "got: {err:?}");
        assert_eq!(tracker.num_requests(), 0);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_new_stream_unix() {
        use tokio::io::AsyncReadExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let tracker = started_tracker(&tmp);
        let url = tracker.new_stream_unix(std::io::Cursor::new(b"payload".to_vec())).unwrap();

        let mut conn = crate::stream::open_stream(&url).await.unwrap();
        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"payload");
        tracker.stop().await;
    }
}
