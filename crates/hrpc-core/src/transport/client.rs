//! Request correlator: the client side of the transport.
//!
//! [`Correlator::send`] registers a pending call and queues its frame on a
//! lazily opened, shared connection, then returns a [`ResponseFuture`]. Each
//! connection has a writer task that owns the socket's write half and writes
//! queued frames whole, and a reader task that routes every inbound frame to
//! the pending call with the same request id. Calls end exactly once, with
//! their response, a timeout, or the failure of their connection.

use super::frame::{encode_frame, read_frame, Frame};
use super::pending::PendingCalls;
use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::message::{RequestIdGen, RpcRequest, RpcResponse};
use crate::serialization::Serializer;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// An encoded request waiting for the connection's writer task.
struct OutboundFrame {
    request_id: u64,
    deadline: Instant,
    bytes: Bytes,
}

/// One outbound connection, shared by every call to the same address.
struct Connection {
    id: u64,
    address: String,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    closed: AtomicBool,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Hand a frame to the writer task. Returns `false` if the writer has
    /// already stopped.
    fn enqueue(&self, frame: OutboundFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

struct CorrelatorInner {
    serializer: Arc<dyn Serializer>,
    pending: PendingCalls,
    ids: RequestIdGen,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    next_connection_id: AtomicU64,
    request_timeout: Duration,
    connect_timeout: Duration,
    sweep_interval: Duration,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl CorrelatorInner {
    async fn live_connection(&self, address: &str) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock().await;
        match connections.get(address) {
            Some(existing) if !existing.is_closed() => Some(Arc::clone(existing)),
            Some(_) => {
                connections.remove(address);
                None
            }
            None => None,
        }
    }

    async fn connection(self: &Arc<Self>, address: &str) -> Result<Arc<Connection>> {
        if let Some(existing) = self.live_connection(address).await {
            return Ok(existing);
        }

        // The map stays unlocked while connecting.
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(RpcError::connection(address, e.to_string())),
            Err(_) => {
                return Err(RpcError::connection(
                    address,
                    format!("connect timed out after {:?}", self.connect_timeout),
                ))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", address, e);
        }

        let mut connections = self.connections.lock().await;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(RpcError::Shutdown);
        }
        if let Some(existing) = connections.get(address) {
            if !existing.is_closed() {
                debug!("Another caller connected to {} first; reusing it", address);
                return Ok(Arc::clone(existing));
            }
        }

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_responses(
            Arc::downgrade(self),
            id,
            address.to_string(),
            read_half,
        ));
        let writer = tokio::spawn(write_requests(
            Arc::downgrade(self),
            id,
            address.to_string(),
            write_half,
            queue,
        ));

        let connection = Arc::new(Connection {
            id,
            address: address.to_string(),
            outbound,
            closed: AtomicBool::new(false),
            reader,
            writer,
        });
        connections.insert(address.to_string(), Arc::clone(&connection));

        info!("Connected to {} (connection {})", address, id);
        Ok(connection)
    }

    fn deliver(&self, frame: Frame) {
        let request_id = frame.request_id;
        let outcome = self
            .serializer
            .decode_response(&frame.payload)
            .and_then(|response| {
                if response.request_id() == request_id {
                    Ok(response)
                } else {
                    Err(RpcError::Protocol {
                        message: format!(
                            "frame id {} does not match response id {}",
                            request_id,
                            response.request_id()
                        ),
                    })
                }
            });

        if !self.pending.complete(request_id, outcome) {
            warn!(
                "Discarding response for request {} with no pending call",
                request_id
            );
        }
    }

    async fn connection_lost(&self, connection_id: u64, address: &str, reason: &str) {
        let removed = {
            let mut connections = self.connections.lock().await;
            let current = connections
                .get(address)
                .is_some_and(|connection| connection.id == connection_id);
            if current {
                connections.remove(address)
            } else {
                None
            }
        };
        if let Some(connection) = &removed {
            connection.closed.store(true, Ordering::SeqCst);
        }

        let failed = self.pending.fail_connection(connection_id, address, reason);
        if removed.is_some() || failed > 0 {
            warn!(
                "Connection {} to {} lost: {} ({} pending call(s) failed)",
                connection_id, address, reason, failed
            );
        }
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        let Ok(mut slot) = self.sweeper.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let expired = inner.pending.expire_elapsed(Instant::now());
                if expired > 0 {
                    debug!("Timeout sweep expired {} call(s)", expired);
                }
            }
        }));
    }
}

impl Drop for CorrelatorInner {
    fn drop(&mut self) {
        if let Ok(slot) = self.sweeper.get_mut() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

async fn read_responses(
    inner: Weak<CorrelatorInner>,
    connection_id: u64,
    address: String,
    mut reader: OwnedReadHalf,
) {
    let reason = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "connection closed by peer".to_string(),
            Err(e) => break e.to_string(),
        };
        match inner.upgrade() {
            Some(inner) => inner.deliver(frame),
            None => return,
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.connection_lost(connection_id, &address, &reason).await;
    }
}

/// Writes queued frames in order, each one whole. A write that has not
/// finished by its call's deadline leaves a partial frame on the stream, so
/// the connection is failed.
async fn write_requests(
    inner: Weak<CorrelatorInner>,
    connection_id: u64,
    address: String,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    let reason = loop {
        let Some(frame) = queue.recv().await else {
            return;
        };
        let wanted = match inner.upgrade() {
            Some(inner) => inner.pending.contains(frame.request_id),
            None => return,
        };
        if !wanted {
            debug!(
                "Skipping write of request {}; its call already ended",
                frame.request_id
            );
            continue;
        }

        let write = async {
            writer.write_all(&frame.bytes).await?;
            writer.flush().await
        };
        match tokio::time::timeout_at(frame.deadline, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => break e.to_string(),
            Err(_) => {
                if let Some(inner) = inner.upgrade() {
                    inner.pending.expire(frame.request_id);
                }
                break format!(
                    "write of request {} stalled past its deadline",
                    frame.request_id
                )
            }
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.connection_lost(connection_id, &address, &reason).await;
    }
}

/// Handle to the outcome of one sent request.
pub struct ResponseFuture {
    request_id: u64,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Result<RpcResponse>>,
    inner: Arc<CorrelatorInner>,
}

impl ResponseFuture {
    /// Id of the request this handle waits on.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Wait for the response, bounded by the call's deadline.
    pub async fn wait(mut self) -> Result<RpcResponse> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Shutdown),
            Err(_) => {
                self.inner.pending.expire(self.request_id);
                // A response that won the race to the table is still honoured.
                match self.rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(RpcError::Timeout {
                        request_id: self.request_id,
                        after: self.timeout,
                    }),
                }
            }
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        self.inner.pending.cancel(self.request_id);
    }
}

/// Sends requests and pairs responses with their callers.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<CorrelatorInner>,
}

impl Correlator {
    pub fn new(serializer: Arc<dyn Serializer>, config: &RpcConfig) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                serializer,
                pending: PendingCalls::new(),
                ids: RequestIdGen::new(),
                connections: Mutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(1),
                request_timeout: config.request_timeout(),
                connect_timeout: config.connect_timeout(),
                sweep_interval: config.sweep_interval(),
                sweeper: std::sync::Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Fresh request id, unique for this correlator.
    pub fn next_request_id(&self) -> u64 {
        self.inner.ids.next()
    }

    /// Deadline applied by [`send`](Self::send).
    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    /// Send `request` to `address` with the configured deadline.
    pub async fn send(&self, address: &str, request: RpcRequest) -> Result<ResponseFuture> {
        self.send_with_timeout(address, request, self.inner.request_timeout)
            .await
    }

    /// Send `request` to `address`, failing the call if no response arrives
    /// within `timeout`.
    pub async fn send_with_timeout(
        &self,
        address: &str,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<ResponseFuture> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            return Err(RpcError::Shutdown);
        }
        inner.ensure_sweeper();

        let request_id = request.request_id();
        let payload = inner.serializer.encode_request(&request)?;
        let bytes = encode_frame(request_id, &payload)?;
        let connection = inner.connection(address).await?;

        let (reply_tx, rx) = oneshot::channel();
        let deadline = inner
            .pending
            .insert(request_id, connection.id, timeout, reply_tx)?;

        let response = ResponseFuture {
            request_id,
            deadline,
            timeout,
            rx,
            inner: Arc::clone(inner),
        };

        debug!(
            "Sending request {} ({}.{}) to {}",
            request_id,
            request.service_name(),
            request.method_name(),
            connection.address
        );
        let queued = !connection.is_closed()
            && connection.enqueue(OutboundFrame {
                request_id,
                deadline,
                bytes,
            });
        if !queued {
            inner.pending.complete(
                request_id,
                Err(RpcError::connection(address, "connection closed")),
            );
        }

        Ok(response)
    }

    /// Number of calls still awaiting an outcome.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether `request_id` is still awaiting an outcome.
    pub fn is_pending(&self, request_id: u64) -> bool {
        self.inner.pending.contains(request_id)
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    /// Fail every pending call with `Shutdown` and close all connections.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut slot) = inner.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }

        let closed = {
            let mut connections = inner.connections.lock().await;
            let closed = connections.len();
            for connection in connections.values() {
                connection.closed.store(true, Ordering::SeqCst);
            }
            connections.clear();
            closed
        };
        let failed = inner.pending.fail_all();

        info!(
            "Correlator shut down ({} connection(s) closed, {} pending call(s) failed)",
            closed, failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::JsonSerializer;
    use crate::transport::frame::write_frame;
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::net::{TcpListener, TcpSocket};

    fn correlator(request_timeout: Duration) -> Correlator {
        let config = RpcConfig::default()
            .with_request_timeout(request_timeout)
            .with_sweep_interval(Duration::from_millis(20));
        Correlator::new(Arc::new(JsonSerializer), &config)
    }

    fn echo_request(correlator: &Correlator, text: &str) -> RpcRequest {
        RpcRequest::from_args(
            correlator.next_request_id(),
            "EchoService",
            "echo",
            (text.to_string(),),
        )
        .unwrap()
    }

    /// Answers every request with its first argument after `delay`.
    async fn spawn_echo_server(delay: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, writer) = stream.into_split();
                    let writer = Arc::new(Mutex::new(writer));
                    while let Ok(Some(frame)) = read_frame(&mut reader).await {
                        let writer = Arc::clone(&writer);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let request = JsonSerializer.decode_request(&frame.payload).unwrap();
                            let value = request.arguments()[0].clone();
                            let response = RpcResponse::success(frame.request_id, value);
                            let payload = JsonSerializer.encode_response(&response).unwrap();
                            let mut writer = writer.lock().await;
                            let _ = write_frame(&mut *writer, frame.request_id, &payload).await;
                        });
                    }
                });
            }
        });
        addr
    }

    /// Accepts connections and never reads from them.
    async fn spawn_silent_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    /// Listener with a full accept backlog, so further connects hang.
    async fn saturated_listener() -> (TcpListener, Vec<TcpStream>, SocketAddr) {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(0).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut queued = Vec::new();
        for _ in 0..4 {
            if let Ok(Ok(stream)) =
                tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await
            {
                queued.push(stream);
            }
        }
        (listener, queued, addr)
    }

    fn bulky_request(correlator: &Correlator, size: usize) -> RpcRequest {
        echo_request(correlator, &"x".repeat(size))
    }

    async fn wait_for_connections(correlator: &Correlator, expected: usize) {
        let give_up = Instant::now() + Duration::from_secs(2);
        while correlator.connection_count().await != expected && Instant::now() < give_up {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(correlator.connection_count().await, expected);
    }

    #[tokio::test]
    async fn test_send_receives_matching_response() {
        let addr = spawn_echo_server(Duration::ZERO).await;
        let correlator = correlator(Duration::from_secs(5));

        let request = echo_request(&correlator, "ping");
        let id = request.request_id();
        let response = correlator
            .send(&addr.to_string(), request)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(response.request_id(), id);
        assert_eq!(response.into_result().unwrap(), json!("ping"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let addr = spawn_echo_server(Duration::ZERO).await.to_string();
        let correlator = correlator(Duration::from_secs(5));

        for text in ["a", "b", "c"] {
            let request = echo_request(&correlator, text);
            let response = correlator.send(&addr, request).await.unwrap().wait().await;
            assert_eq!(response.unwrap().into_result().unwrap(), json!(text));
        }
        assert_eq!(correlator.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_independently() {
        let addr = spawn_echo_server(Duration::from_millis(10)).await.to_string();
        let correlator = correlator(Duration::from_secs(5));

        let mut waiters = Vec::new();
        for i in 0..20 {
            let request = echo_request(&correlator, &format!("msg-{}", i));
            waiters.push((i, correlator.send(&addr, request).await.unwrap()));
        }

        for (i, waiter) in waiters {
            let value = waiter.wait().await.unwrap().into_result().unwrap();
            assert_eq!(value, json!(format!("msg-{}", i)));
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_call() {
        let addr = spawn_echo_server(Duration::from_secs(60)).await.to_string();
        let correlator = correlator(Duration::from_millis(100));

        let request = echo_request(&correlator, "slow");
        let id = request.request_id();
        let waiter = correlator.send(&addr, request).await.unwrap();
        assert!(correlator.is_pending(id));

        match waiter.wait().await {
            Err(RpcError::Timeout { request_id, .. }) => assert_eq!(request_id, id),
            other => panic!("Expected Timeout, got: {:?}", other),
        }
        assert!(!correlator.is_pending(id));
    }

    #[tokio::test]
    async fn test_late_response_is_discarded() {
        let addr = spawn_echo_server(Duration::from_millis(300)).await.to_string();
        let correlator = correlator(Duration::from_millis(50));

        let request = echo_request(&correlator, "late");
        let result = correlator.send(&addr, request).await.unwrap().wait().await;
        assert!(matches!(result, Err(RpcError::Timeout { .. })));

        // The late frame arrives on the same connection and must not disturb
        // the next call.
        let request = echo_request(&correlator, "next");
        let next = correlator
            .send_with_timeout(&addr, request, Duration::from_secs(5))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(next.into_result().unwrap(), json!("next"));
        assert_eq!(correlator.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_connection_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let correlator = correlator(Duration::from_secs(1));
        let request = echo_request(&correlator, "nobody");
        let result = correlator.send(&addr, request).await;
        assert!(matches!(result, Err(RpcError::Connection { .. })));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_reset_fails_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut stream).await;
            // Drop the socket without answering
        });

        let correlator = correlator(Duration::from_secs(5));
        let request = echo_request(&correlator, "doomed");
        let result = correlator.send(&addr, request).await.unwrap().wait().await;

        assert!(matches!(result, Err(RpcError::Connection { .. })));
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_rejects_new_calls() {
        let addr = spawn_echo_server(Duration::from_secs(60)).await.to_string();
        let correlator = correlator(Duration::from_secs(30));

        let request = echo_request(&correlator, "stuck");
        let waiter = correlator.send(&addr, request).await.unwrap();
        correlator.shutdown().await;

        assert!(matches!(waiter.wait().await, Err(RpcError::Shutdown)));
        let request = echo_request(&correlator, "after");
        assert!(matches!(
            correlator.send(&addr, request).await,
            Err(RpcError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_sweeper_expires_abandoned_calls() {
        let addr = spawn_echo_server(Duration::from_secs(60)).await.to_string();
        let correlator = correlator(Duration::from_millis(50));

        let request = echo_request(&correlator, "abandoned");
        let id = request.request_id();
        let waiter = correlator.send(&addr, request).await.unwrap();
        // Keep the handle alive without waiting on it
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!correlator.is_pending(id));
        assert!(matches!(waiter.wait().await, Err(RpcError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_call_to_unread_peer_is_bounded_by_deadline() {
        let addr = spawn_silent_server().await.to_string();
        let correlator = correlator(Duration::from_secs(30));

        let request = bulky_request(&correlator, 15 * 1024 * 1024);
        let started = Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(3), async {
            correlator
                .send_with_timeout(&addr, request, Duration::from_millis(300))
                .await?
                .wait()
                .await
        })
        .await
        .expect("call ran past its deadline");

        assert!(matches!(outcome, Err(RpcError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(correlator.pending_count(), 0);

        // The half-written frame poisons the stream, so the connection goes.
        wait_for_connections(&correlator, 0).await;
    }

    #[tokio::test]
    async fn test_abandoned_calls_leave_connection_usable() {
        let addr = spawn_echo_server(Duration::ZERO).await.to_string();
        let correlator = correlator(Duration::from_secs(5));

        // Give up on a large call while its frame may still be in flight.
        let request = bulky_request(&correlator, 8 * 1024 * 1024);
        let _ = tokio::time::timeout(Duration::from_millis(1), async {
            correlator.send(&addr, request).await?.wait().await
        })
        .await;

        // Drop a handle without waiting on it.
        let request = bulky_request(&correlator, 1024 * 1024);
        drop(correlator.send(&addr, request).await.unwrap());

        let request = echo_request(&correlator, "next");
        let next = correlator
            .send_with_timeout(&addr, request, Duration::from_secs(5))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(next.into_result().unwrap(), json!("next"));
        assert_eq!(correlator.connection_count().await, 1);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_connect_does_not_stall_other_addresses() {
        let (_listener, _queued, stuck_addr) = saturated_listener().await;
        let healthy_addr = spawn_echo_server(Duration::ZERO).await.to_string();
        let config = RpcConfig::default()
            .with_request_timeout(Duration::from_secs(5))
            .with_connect_timeout(Duration::from_secs(2));
        let correlator = Correlator::new(Arc::new(JsonSerializer), &config);

        let stuck = {
            let correlator = correlator.clone();
            let request = echo_request(&correlator, "stuck");
            tokio::spawn(async move {
                correlator.send(&stuck_addr.to_string(), request).await.map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let request = echo_request(&correlator, "healthy");
        let response = correlator
            .send(&healthy_addr, request)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(response.into_result().unwrap(), json!("healthy"));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!stuck.is_finished());

        assert!(matches!(
            stuck.await.unwrap(),
            Err(RpcError::Connection { .. })
        ));
    }
}
