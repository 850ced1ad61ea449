//! Task providers.
//!
//! A [`TaskServer`] listens on a unix socket for Requests, runs the
//! [`TaskHandler`] registered for each Request's task, and delivers the
//! outcome to the Request's response hook.
//!
//! ```text
//! Request ──► TaskServer socket ──► handlers[task].handle(&req)
//!                                        │
//!            response hook ◄── Dispatcher ┘  (unix:// or http(s)://)
//! ```
//!
//! Each connection is handled in its own task and held until the Response
//! has been delivered, so [`TaskServer::stop`] waits for in-flight work.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::codec;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::protocol::{ErrorKind, Request, Response, ResponseError, TaskOutput};
use crate::transport::SocketTransport;

/// Runs one kind of task.
///
/// The return type encodes "exactly one of result or error".
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Service `req`.
    async fn handle(&self, req: &Request) -> std::result::Result<TaskOutput, ResponseError>;
}

/// Returns its args as the result, passing any input stream through.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, req: &Request) -> std::result::Result<TaskOutput, ResponseError> {
        let output = TaskOutput::new(req.args.clone());
        Ok(match &req.stream_url {
            Some(url) => output.with_stream_url(url.clone()),
            None => output,
        })
    }
}

type HandlerMap = Arc<RwLock<HashMap<String, Arc<dyn TaskHandler>>>>;

/// Serves registered tasks on a unix socket.
pub struct TaskServer {
    transport: Arc<SocketTransport>,
    handlers: HandlerMap,
    dispatcher: Dispatcher,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskServer")
            .field("path", &self.transport.path())
            .field("tasks", &self.tasks())
            .finish_non_exhaustive()
    }
}

impl TaskServer {
    /// Server listening on `socket_path` once started.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self::with_dispatcher(socket_path, Dispatcher::new())
    }

    /// Server delivering Responses through `dispatcher`.
    pub fn with_dispatcher(socket_path: impl Into<PathBuf>, dispatcher: Dispatcher) -> Self {
        Self {
            transport: Arc::new(SocketTransport::new(socket_path)),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            dispatcher,
            worker: Mutex::new(None),
        }
    }

    /// Register `handler` for `task`, replacing any previous one.
    pub fn register<H>(&self, task: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        let task = task.into();
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.clone(), Arc::new(handler));
        if previous.is_some() {
            log::info!("[TaskServer] Replaced handler for '{}'", task);
        }
    }

    /// Registered task names, sorted.
    pub fn tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tasks.sort();
        tasks
    }

    /// Bind the socket and start serving. Must be called inside a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns the transport's bind error, or
    /// [`AlreadyStopped`](crate::AcommError::AlreadyStopped) after `stop`.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Ok(());
        }
        self.transport.start()?;
        *worker = Some(tokio::spawn(serve(
            Arc::clone(&self.transport),
            Arc::clone(&self.handlers),
            self.dispatcher.clone(),
        )));
        log::info!("[TaskServer] Serving {:?} on {}", self.tasks(), self.url());
        Ok(())
    }

    /// Stop accepting and wait for in-flight Requests to be answered.
    pub async fn stop(&self) {
        self.transport.stop().await;
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::error!("[TaskServer] Accept consumer panicked: {e}");
            }
        }
    }

    /// `unix://` URL Requests should be sent to.
    pub fn url(&self) -> String {
        self.transport.url()
    }

    /// Path of the listening socket.
    pub fn path(&self) -> &Path {
        self.transport.path()
    }
}

async fn serve(transport: Arc<SocketTransport>, handlers: HandlerMap, dispatcher: Dispatcher) {
    while let Some(mut conn) = transport.next_conn().await {
        let transport = Arc::clone(&transport);
        let handlers = Arc::clone(&handlers);
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            match codec::read_request(conn.stream_mut()).await {
                Ok(req) => answer(&req, &handlers, &dispatcher).await,
                Err(e) => log::warn!("[TaskServer] Dropping connection {}: {e}", conn.id()),
            }
            transport.done_conn(conn);
        });
    }
}

/// Run the task and deliver its Response.
async fn answer(req: &Request, handlers: &HandlerMap, dispatcher: &Dispatcher) {
    let handler = handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&req.task)
        .cloned();

    let outcome = match handler {
        Some(handler) => handler.handle(req).await,
        None => {
            log::warn!("[TaskServer] No handler for task '{}' ({})", req.task, req.id());
            Err(
                ResponseError::new(ErrorKind::UnknownTask, format!("no handler for task '{}'", req.task))
                    .with_context("task", req.task.clone()),
            )
        }
    };

    let resp = Response::from_outcome(req.id(), outcome);
    if let Err(e) = dispatcher.send_response(&req.response_hook, &resp).await {
        log::warn!(
            "[TaskServer] Could not deliver {} to {}: {e}",
            req.id(),
            req.response_hook
        );
    }
}
