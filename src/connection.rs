use crate::codec::JsonRpcCodec;
use crate::error::{Result, SnapError};
use crate::protocol::{Incoming, Method, Notification, Request, Response};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Receiver of unsolicited server pushes, called in wire order
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;

/// Consumer of a successful result, run by the reader before it handles
/// the next incoming message
///
/// An error it returns becomes the result seen by the caller.
pub type ResponseHook = Box<dyn FnOnce(&Value) -> Result<()> + Send>;

/// Why a connection stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called or the connection was dropped
    Local,
    /// The server closed the socket
    RemoteClosed,
    /// The server sent data that could not be decoded
    Protocol(String),
    /// Socket read or write failed
    Io(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::RemoteClosed => f.write_str("closed by server"),
            CloseReason::Protocol(msg) => write!(f, "protocol error: {}", msg),
            CloseReason::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

/// An in-flight request waiting for its response
struct PendingRequest {
    method: Method,
    issued_at: Instant,
    hook: Option<ResponseHook>,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct PendingRequests {
    requests: HashMap<u64, PendingRequest>,
    closed: bool,
}

/// Notifications that arrived before a handler was registered are kept
/// here and flushed, in order, on registration
#[derive(Default)]
struct NotificationSlot {
    handler: Option<NotificationHandler>,
    backlog: Vec<Notification>,
}

/// State shared between the connection handle and its I/O tasks
struct Shared {
    pending: Mutex<PendingRequests>,
    notifications: Mutex<NotificationSlot>,
    close_reason: Mutex<Option<CloseReason>>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(PendingRequests::default()),
            notifications: Mutex::new(NotificationSlot::default()),
            close_reason: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Match a response to its pending request
    fn resolve(&self, response: Response) {
        let Some(id) = response.id else {
            tracing::warn!(error = ?response.error, "Dropping response without id");
            return;
        };

        let pending = lock(&self.pending).requests.remove(&id);
        match pending {
            Some(request) => {
                tracing::debug!(
                    id,
                    method = %request.method,
                    elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
                    "Received response"
                );
                let result = match (request.hook, response.into_result()) {
                    (Some(hook), Ok(value)) => hook(&value).map(|()| value),
                    (_, result) => result,
                };
                let _ = request.tx.send(result);
            }
            None => {
                tracing::warn!(id, "Dropping response with no pending request");
            }
        }
    }

    /// Hand a notification to the registered handler
    fn dispatch(&self, notification: Notification) {
        tracing::debug!(method = %notification.method, "Received notification");
        let mut slot = lock(&self.notifications);
        match &slot.handler {
            Some(handler) => handler(notification),
            None => slot.backlog.push(notification),
        }
    }

    /// Tear the connection down and fail every pending request
    fn fail(&self, reason: CloseReason) {
        {
            let mut close_reason = lock(&self.close_reason);
            if close_reason.is_none() {
                match &reason {
                    CloseReason::Local => tracing::info!("Connection closed locally"),
                    other => tracing::warn!(reason = %other, "Connection lost"),
                }
                *close_reason = Some(reason);
            }
        }

        let drained: Vec<PendingRequest> = {
            let mut pending = lock(&self.pending);
            pending.closed = true;
            pending.requests.drain().map(|(_, request)| request).collect()
        };
        for request in drained {
            let _ = request.tx.send(Err(SnapError::ConnectionClosed));
        }

        self.shutdown.cancel();
    }
}

/// Removes a pending request if the caller gives up before it resolves
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).requests.remove(&self.id);
    }
}

/// A live JSON-RPC session over one TCP socket
///
/// Requests are written by a dedicated writer task so each message reaches
/// the socket whole. A reader task decodes incoming lines, resolves pending
/// requests by id and forwards notifications to the registered handler.
pub struct Connection {
    host: String,
    port: u16,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Request>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a TCP connection to a snapserver control port
    pub async fn open(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        tracing::info!("Connecting to {}:{}", host, port);

        let stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(SnapError::ConnectRefused {
                    host: host.to_string(),
                    port,
                    source,
                })
            }
            Err(_) => {
                return Err(SnapError::ConnectTimeout {
                    host: host.to_string(),
                    port,
                })
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, JsonRpcCodec::new());
        let mut writer = FramedWrite::new(write_half, JsonRpcCodec::new());

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Request>();
        let shared = Arc::new(Shared::new());

        // Forward outgoing requests to the socket, one whole frame at a time
        let write_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_shared.shutdown.cancelled() => break,
                    request = outgoing_rx.recv() => {
                        let Some(request) = request else { break };
                        if let Err(e) = writer.send(request).await {
                            tracing::error!("Failed to send request: {}", e);
                            write_shared.fail(CloseReason::Io(e.to_string()));
                            break;
                        }
                    }
                }
            }
            let _ = writer.close().await;
        });

        // Receive and demultiplex incoming messages
        let read_shared = shared.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    biased;
                    _ = read_shared.shutdown.cancelled() => break CloseReason::Local,
                    frame = reader.next() => match frame {
                        Some(Ok(Incoming::Response(response))) => read_shared.resolve(response),
                        Some(Ok(Incoming::Notification(notification))) => {
                            read_shared.dispatch(notification);
                        }
                        Some(Err(SnapError::Protocol(msg))) => break CloseReason::Protocol(msg),
                        Some(Err(e)) => break CloseReason::Io(e.to_string()),
                        None => break CloseReason::RemoteClosed,
                    }
                }
            };
            read_shared.fail(reason);
        });

        Ok(Self {
            host: host.to_string(),
            port,
            next_id: AtomicU64::new(1),
            shared,
            outgoing,
        })
    }

    /// Get the server host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the server port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send a request and wait for its response
    ///
    /// Concurrent calls are matched to their responses by id, in whatever
    /// order the server answers. On timeout the request is forgotten and a
    /// late response for it is dropped.
    pub async fn call(
        &self,
        method: Method,
        params: Option<Value>,
        request_timeout: Duration,
    ) -> Result<Value> {
        self.send_request(method, params, request_timeout, None).await
    }

    /// Like [`call`](Self::call), but hand the result to `hook` in wire order
    ///
    /// The hook runs on the reader task, so it sees the result before any
    /// notification the server sent after it. It does not run if the call
    /// times out or the connection closes first.
    pub async fn call_ordered<F>(
        &self,
        method: Method,
        params: Option<Value>,
        request_timeout: Duration,
        hook: F,
    ) -> Result<Value>
    where
        F: FnOnce(&Value) -> Result<()> + Send + 'static,
    {
        self.send_request(method, params, request_timeout, Some(Box::new(hook)))
            .await
    }

    async fn send_request(
        &self,
        method: Method,
        params: Option<Value>,
        request_timeout: Duration,
        hook: Option<ResponseHook>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = lock(&self.shared.pending);
            if pending.closed {
                return Err(SnapError::ConnectionClosed);
            }
            pending.requests.insert(
                id,
                PendingRequest {
                    method,
                    issued_at: Instant::now(),
                    hook,
                    tx,
                },
            );
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let request = match params {
            Some(params) => Request::new(id, method).with_params(params),
            None => Request::new(id, method),
        };
        tracing::debug!(id, %method, "Sending request");

        self.outgoing
            .send(request)
            .map_err(|_| SnapError::ConnectionClosed)?;

        match timeout(request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SnapError::ConnectionClosed),
            Err(_) => {
                tracing::warn!(id, %method, "Request timed out");
                Err(SnapError::RequestTimeout {
                    id,
                    method: method.to_string(),
                })
            }
        }
    }

    /// Register the single receiver of server notifications
    ///
    /// Replaces any previous handler. Notifications received before the
    /// first registration are delivered immediately, in order.
    pub fn on_notification(&self, handler: NotificationHandler) {
        let mut slot = lock(&self.shared.notifications);
        for notification in std::mem::take(&mut slot.backlog) {
            handler(notification);
        }
        slot.handler = Some(handler);
    }

    /// Close the connection, failing all pending requests
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        self.shared.fail(CloseReason::Local);
    }

    /// Whether the connection has stopped
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Wait until the connection stops for any reason
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await;
    }

    /// Why the connection stopped, if it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.shared.close_reason).clone()
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).requests.len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.fail(CloseReason::Local);
    }
}
