//! # Pipelined Connection
//!
//! Purpose: Own one authenticated TCP session, multiplex concurrent requests
//! over it by id, and re-establish it transparently after failures.
//!
//! ## Design Principles
//! 1. **Single Writer**: Buffer append and socket write share one async mutex,
//!    so frames never interleave.
//! 2. **Single Reader**: One task reads frames and completes requests by id;
//!    response order does not matter.
//! 3. **Bounded Pipeline**: A semaphore caps in-flight requests. Each pending
//!    entry owns one permit and whoever removes the entry returns it.
//! 4. **Batched Writes**: Frames are buffered and flushed by size, by low load,
//!    or by a short timer.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Ready
//!                     ^                            |
//!                     +------- Reconnecting <------+  (I/O or protocol error)
//!
//! any state --stop()--> Stopped (terminal)
//! ```
//!
//! `connect` reports a failed first attempt to the caller; `start` hands the
//! first attempt to the supervisor as well, which retries it with back-off.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use arbor_common::wire::{self, Frame};
use arbor_common::{Flags, Op, Request, Response, TableRef};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket};
use tokio::sync::{oneshot, watch, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::auth;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::metrics::ClientMetrics;
use crate::router::InvalidationHandler;

/// Session state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
    Stopped,
}

struct PendingEntry {
    tx: oneshot::Sender<ClientResult<Bytes>>,
    sent_at: Instant,
}

struct WriterState {
    buf: BytesMut,
    stream: Option<OwnedWriteHalf>,
    /// Wakes the reader of the current session when a write fails.
    broken: Arc<Notify>,
}

/// Read side of an established session.
struct Session {
    reader: OwnedReadHalf,
    broken: Arc<Notify>,
}

struct Shared {
    index: usize,
    config: Arc<ClientConfig>,
    state: watch::Sender<ConnState>,
    next_id: AtomicU64,
    pending: DashMap<u64, PendingEntry>,
    permits: Semaphore,
    writer: Mutex<WriterState>,
    /// Signals the flush task that frames are waiting in the buffer.
    flush_wanted: Notify,
    handler: RwLock<Option<Arc<dyn InvalidationHandler>>>,
    metrics: Arc<ClientMetrics>,
    /// Tables subscribed for pushes; replayed after every reconnect.
    subscriptions: parking_lot::Mutex<Vec<TableRef>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one in-flight request.
///
/// Resolves exactly once: with the response body, an application error, or
/// the failure of the connection. Dropping it does not cancel the request.
#[derive(Debug)]
pub struct PendingResult {
    id: u64,
    rx: oneshot::Receiver<ClientResult<Bytes>>,
}

impl PendingResult {
    /// Request id on its connection.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingResult {
    type Output = ClientResult<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without a verdict: the connection went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Shutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One pipelined, self-healing session with the server.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("index", &self.inner.index)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Connection {
    /// Opens the session and starts its background tasks.
    ///
    /// The first attempt is made inline and its error returned; later
    /// failures are retried in the background until `stop()`.
    pub async fn connect(
        index: usize,
        config: Arc<ClientConfig>,
        metrics: Arc<ClientMetrics>,
    ) -> ClientResult<Self> {
        let shared = Shared::new(index, config, metrics);
        let session = match shared.establish().await {
            Ok(session) => session,
            Err(err) => {
                shared.set_state(ConnState::Disconnected);
                return Err(err);
            }
        };
        Ok(Self::spawn(shared, Some(session)))
    }

    /// Starts a connection whose first session is opened in the background.
    ///
    /// Never fails: connect and auth errors are retried with back-off, and
    /// requests sent before the session is `Ready` fail with `Transport`.
    /// Must be called inside a Tokio runtime.
    pub fn start(index: usize, config: Arc<ClientConfig>, metrics: Arc<ClientMetrics>) -> Self {
        Self::spawn(Shared::new(index, config, metrics), None)
    }

    fn spawn(shared: Arc<Shared>, session: Option<Session>) -> Self {
        let supervisor = tokio::spawn(Arc::clone(&shared).supervise(session));
        let flusher = tokio::spawn(Arc::clone(&shared).flush_loop());
        shared.tasks.lock().extend([supervisor, flusher]);
        Connection { inner: shared }
    }

    /// Position of this connection in its pool.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.borrow()
    }

    /// Requests sent and not yet answered.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Pipeline permits currently free.
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Installs the handler that receives server pushes.
    pub fn set_invalidation_handler(&self, handler: Arc<dyn InvalidationHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Waits until the session is `Ready` (or stopped) or `limit` elapses.
    pub async fn wait_ready(&self, limit: Duration) -> ClientResult<()> {
        let mut rx = self.inner.state.subscribe();
        let reached = timeout(
            limit,
            rx.wait_for(|state| matches!(state, ConnState::Ready | ConnState::Stopped)),
        )
        .await;
        match reached {
            Ok(Ok(state)) if *state == ConnState::Ready => Ok(()),
            Ok(_) => Err(ClientError::Shutdown),
            Err(_) => Err(ClientError::Transport(format!(
                "connection {} not ready after {limit:?}",
                self.inner.index
            ))),
        }
    }

    /// Queues one request and returns its completion handle.
    ///
    /// Waits up to `permit_timeout` for a pipeline permit; the socket is not
    /// touched when none frees up.
    pub async fn send(
        &self,
        op: Op,
        target: TableRef,
        key: impl Into<String>,
        payload: Bytes,
        flags: Flags,
    ) -> ClientResult<PendingResult> {
        self.inner.send(op, target, key.into(), payload, flags).await
    }

    /// Sends a request and waits for its outcome.
    pub async fn request(
        &self,
        op: Op,
        target: TableRef,
        key: impl Into<String>,
        payload: Bytes,
        flags: Flags,
    ) -> ClientResult<Bytes> {
        self.send(op, target, key, payload, flags).await?.await
    }

    /// Asks the server to push invalidations for `target` on this session.
    ///
    /// The subscription is remembered and sent again after each reconnect.
    pub async fn subscribe(&self, target: TableRef) -> ClientResult<()> {
        {
            let mut subscriptions = self.inner.subscriptions.lock();
            if !subscriptions.contains(&target) {
                subscriptions.push(target.clone());
            }
        }
        self.request(Op::Subscribe, target, String::new(), Bytes::new(), Flags::SAFE)
            .await
            .map(|_| ())
    }

    /// Stops the connection for good.
    ///
    /// Buffered frames get one last flush, the socket is closed and every
    /// request still pending fails with `ClientError::Shutdown`.
    pub async fn stop(&self) {
        let shared = &self.inner;
        if shared.state.send_replace(ConnState::Stopped) == ConnState::Stopped {
            return;
        }

        {
            let mut writer = shared.writer.lock().await;
            if let Err(err) = shared.flush_locked(&mut writer).await {
                debug!(conn = shared.index, error = %err, "final flush failed");
            }
            if let Some(mut stream) = writer.stream.take() {
                let _ = stream.shutdown().await;
            }
        }

        let failed = shared.fail_pending(&ClientError::Shutdown);
        shared.permits.close();

        let tasks = std::mem::take(&mut *shared.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        debug!(conn = shared.index, failed, "connection stopped");
    }
}

impl Shared {
    fn new(index: usize, config: Arc<ClientConfig>, metrics: Arc<ClientMetrics>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnState::Disconnected);
        Arc::new(Shared {
            index,
            permits: Semaphore::new(config.pipeline_limit),
            writer: Mutex::new(WriterState {
                buf: BytesMut::with_capacity(config.flush_threshold),
                stream: None,
                broken: Arc::new(Notify::new()),
            }),
            config,
            state,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            flush_wanted: Notify::new(),
            handler: RwLock::new(None),
            metrics,
            subscriptions: parking_lot::Mutex::new(Vec::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn is_stopped(&self) -> bool {
        *self.state.borrow() == ConnState::Stopped
    }

    async fn send(
        &self,
        op: Op,
        target: TableRef,
        key: String,
        payload: Bytes,
        flags: Flags,
    ) -> ClientResult<PendingResult> {
        if self.is_stopped() {
            return Err(ClientError::Shutdown);
        }

        let mut request = Request {
            id: 0,
            op,
            target,
            key,
            payload,
            flags,
        };
        wire::request_body_len(&request).map_err(ClientError::InvalidRequest)?;

        let started = Instant::now();
        let permit = match timeout(self.config.permit_timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ClientError::Shutdown),
            Err(_) => {
                self.metrics.record_pipeline_full();
                return Err(ClientError::PipelineFull {
                    limit: self.config.pipeline_limit,
                    waited: started.elapsed(),
                });
            }
        };
        // The pending entry owns the permit from here on.
        permit.forget();

        request.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request.id,
            PendingEntry {
                tx,
                sent_at: Instant::now(),
            },
        );
        self.metrics.record_request();
        let handle = PendingResult { id: request.id, rx };

        let mut writer = self.writer.lock().await;
        if !self.pending.contains_key(&request.id) {
            // Failed by teardown or stop while waiting for the lock. Its frame
            // must not reach a session installed since.
            return Ok(handle);
        }
        if writer.stream.is_none() {
            drop(writer);
            return self.abandon(handle, ClientError::Transport("not connected".into()));
        }
        if let Err(err) = wire::encode_request(&request, &mut writer.buf) {
            drop(writer);
            return self.abandon(handle, ClientError::InvalidRequest(err));
        }

        let config = &self.config;
        let eager =
            config.eager_flush_pending > 0 && self.pending.len() <= config.eager_flush_pending;
        if writer.buf.len() >= config.flush_threshold || eager {
            if let Err(err) = self.flush_locked(&mut writer).await {
                drop(writer);
                return self.abandon(handle, ClientError::transport(err));
            }
        } else {
            self.flush_wanted.notify_one();
        }

        trace!(conn = self.index, id = request.id, op = %op, "request queued");
        Ok(handle)
    }

    /// Moves to `next` unless the connection is stopped.
    fn set_state(&self, next: ConnState) {
        self.state.send_if_modified(|state| {
            if *state == ConnState::Stopped || *state == next {
                return false;
            }
            debug!(conn = self.index, from = ?*state, to = ?next, "state change");
            *state = next;
            true
        });
    }

    /// Connects, authenticates and installs the write half.
    async fn establish(&self) -> ClientResult<Session> {
        self.set_state(ConnState::Connecting);
        let config = &self.config;

        let addr = lookup_host(config.addr.as_str())
            .await
            .map_err(|err| ClientError::Config(format!("resolving {}: {err}", config.addr)))?
            .next()
            .ok_or_else(|| ClientError::Config(format!("{} resolved to nothing", config.addr)))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_send_buffer_size(config.send_buffer)?;
        socket.set_recv_buffer_size(config.recv_buffer)?;
        socket.set_keepalive(true)?;

        let mut stream = timeout(config.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| ClientError::Transport(format!("connect to {addr} timed out")))??;
        stream.set_nodelay(true)?;

        self.set_state(ConnState::Authenticating);
        let mode = timeout(
            config.connect_timeout,
            auth::handshake(&mut stream, config.secret.as_deref()),
        )
        .await
        .map_err(|_| ClientError::Auth("handshake timed out".into()))??;

        let (reader, write_half) = stream.into_split();
        let broken = Arc::new(Notify::new());
        {
            let mut writer = self.writer.lock().await;
            if self.is_stopped() {
                return Err(ClientError::Shutdown);
            }
            writer.buf.clear();
            writer.stream = Some(write_half);
            writer.broken = Arc::clone(&broken);
        }

        self.set_state(ConnState::Ready);
        debug!(conn = self.index, %addr, ?mode, "session ready");
        Ok(Session { reader, broken })
    }

    /// Reader loop plus reconnection, for the life of the connection.
    ///
    /// Without an initial session the first attempt is made right away.
    async fn supervise(self: Arc<Self>, initial: Option<Session>) {
        let mut state_rx = self.state.subscribe();
        let mut session = match initial {
            Some(session) => session,
            None => match self.open_with_retry(&mut state_rx, Duration::ZERO).await {
                Some(session) => {
                    info!(conn = self.index, "connected");
                    self.resubscribe().await;
                    session
                }
                None => return,
            },
        };

        loop {
            let reason = self.read_loop(&mut session, &mut state_rx).await;
            if self.is_stopped() {
                return;
            }
            warn!(conn = self.index, error = %reason, "session lost");
            self.teardown(&reason).await;

            let backoff = self.config.reconnect_backoff;
            session = match self.open_with_retry(&mut state_rx, backoff).await {
                Some(session) => session,
                None => return,
            };
            self.metrics.record_reconnect();
            info!(conn = self.index, "reconnected");
            self.resubscribe().await;
        }
    }

    /// Establishes a session, doubling the delay after each failed attempt.
    /// Returns `None` once the connection is stopped.
    async fn open_with_retry(
        &self,
        state_rx: &mut watch::Receiver<ConnState>,
        first_delay: Duration,
    ) -> Option<Session> {
        let mut delay = first_delay;
        loop {
            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = stopped(state_rx) => return None,
                }
            }
            let attempt = tokio::select! {
                attempt = self.establish() => attempt,
                _ = stopped(state_rx) => return None,
            };
            match attempt {
                Ok(session) => return Some(session),
                Err(ClientError::Shutdown) => return None,
                Err(err) => {
                    delay = if delay.is_zero() {
                        self.config.reconnect_backoff
                    } else {
                        (delay * 2).min(self.config.reconnect_backoff_max)
                    };
                    warn!(conn = self.index, error = %err, retry_in = ?delay, "connect attempt failed");
                    self.set_state(ConnState::Reconnecting);
                }
            }
        }
    }

    /// Replays subscriptions on a fresh session.
    ///
    /// Only the frames are queued here; answers arrive once the reader runs,
    /// so they are awaited on a separate task.
    async fn resubscribe(&self) {
        let targets = self.subscriptions.lock().clone();
        if targets.is_empty() {
            return;
        }
        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            match self
                .send(Op::Subscribe, target, String::new(), Bytes::new(), Flags::SAFE)
                .await
            {
                Ok(handle) => handles.push(handle),
                Err(err) => warn!(conn = self.index, error = %err, "resubscribe failed"),
            }
        }
        let index = self.index;
        tokio::spawn(async move {
            for handle in handles {
                if let Err(err) = handle.await {
                    warn!(conn = index, error = %err, "resubscribe rejected");
                }
            }
        });
    }

    /// Reads frames until the session fails; returns the reason.
    async fn read_loop(
        &self,
        session: &mut Session,
        state_rx: &mut watch::Receiver<ConnState>,
    ) -> ClientError {
        let mut buf = BytesMut::with_capacity(self.config.recv_buffer as usize);
        loop {
            loop {
                match wire::split_frame(&mut buf) {
                    Ok(Some(body)) => {
                        if let Err(err) = self.dispatch(body) {
                            return err;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => return ClientError::Protocol(err),
                }
            }

            tokio::select! {
                read = session.reader.read_buf(&mut buf) => match read {
                    Ok(0) => return ClientError::Transport("connection closed by server".into()),
                    Ok(_) => {}
                    Err(err) => return ClientError::transport(err),
                },
                _ = session.broken.notified() => {
                    return ClientError::Transport("write to socket failed".into());
                }
                _ = stopped(state_rx) => return ClientError::Shutdown,
            }
        }
    }

    fn dispatch(&self, body: Bytes) -> ClientResult<()> {
        match wire::decode_frame(body)? {
            Frame::Push(event) => {
                self.metrics.record_push();
                let handler = self.handler.read().clone();
                match handler {
                    Some(handler) => handler.on_invalidate(&event),
                    None => trace!(conn = self.index, table = %event.table, "push without handler"),
                }
            }
            Frame::Response(response) => self.complete(response),
        }
        Ok(())
    }

    fn complete(&self, response: Response) {
        let Some((_, entry)) = self.pending.remove(&response.id) else {
            warn!(conn = self.index, id = response.id, "response for unknown request id");
            return;
        };
        self.permits.add_permits(1);

        let is_error = response.is_error();
        self.metrics.record_response(entry.sent_at.elapsed(), is_error);
        let result = if is_error {
            Err(ClientError::Application {
                status: response.status,
                message: String::from_utf8_lossy(&response.body).into_owned(),
            })
        } else {
            Ok(response.body)
        };
        // The caller may have stopped waiting.
        let _ = entry.tx.send(result);
    }

    /// Drops the dead session and fails everything pending on it.
    async fn teardown(&self, reason: &ClientError) {
        {
            let mut writer = self.writer.lock().await;
            writer.stream = None;
            writer.buf.clear();
        }
        self.set_state(ConnState::Reconnecting);

        let failed = self.fail_pending(&ClientError::Transport(format!(
            "connection lost: {reason}"
        )));
        if failed > 0 {
            debug!(conn = self.index, failed, "failed pending requests");
        }
    }

    /// Resolves every pending entry with `err`, returning their permits.
    fn fail_pending(&self, err: &ClientError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                self.permits.add_permits(1);
                self.metrics.record_failure();
                let _ = entry.tx.send(Err(err.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Fails a request that never reached the socket.
    ///
    /// If failure cleanup already claimed the entry, the handle carries that
    /// verdict instead.
    fn abandon(&self, handle: PendingResult, err: ClientError) -> ClientResult<PendingResult> {
        match self.pending.remove(&handle.id) {
            Some(_) => {
                self.permits.add_permits(1);
                self.metrics.record_failure();
                Err(err)
            }
            None => Ok(handle),
        }
    }

    /// Writes the buffer out; a failed write drops the socket and wakes the reader.
    async fn flush_locked(&self, writer: &mut WriterState) -> std::io::Result<()> {
        let WriterState {
            buf,
            stream,
            broken,
        } = writer;
        if buf.is_empty() {
            return Ok(());
        }
        let Some(socket) = stream.as_mut() else {
            // Frames of a dead session; their requests fail in teardown.
            buf.clear();
            return Ok(());
        };

        let result = socket.write_all(&buf[..]).await;
        buf.clear();
        match result {
            Ok(()) => {
                self.metrics.record_flush();
                Ok(())
            }
            Err(err) => {
                *stream = None;
                broken.notify_one();
                Err(err)
            }
        }
    }

    /// Flushes frames left behind by the size and low-load triggers.
    async fn flush_loop(self: Arc<Self>) {
        let mut state_rx = self.state.subscribe();
        loop {
            tokio::select! {
                _ = self.flush_wanted.notified() => {}
                _ = stopped(&mut state_rx) => return,
            }
            tokio::select! {
                _ = sleep(self.config.flush_interval) => {}
                _ = stopped(&mut state_rx) => return,
            }
            let mut writer = self.writer.lock().await;
            if let Err(err) = self.flush_locked(&mut writer).await {
                debug!(conn = self.index, error = %err, "timed flush failed");
            }
        }
    }
}

async fn stopped(rx: &mut watch::Receiver<ConnState>) {
    let _ = rx.wait_for(|state| *state == ConnState::Stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one client, greets it without auth and returns every byte it
    /// sends until the socket closes.
    async fn recording_server() -> (String, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 1 + auth::NONCE_LEN];
            greeting[0] = auth::MODE_OPEN;
            stream.write_all(&greeting).await.unwrap();

            let mut seen = Vec::new();
            let _ = timeout(Duration::from_secs(2), stream.read_to_end(&mut seen)).await;
            seen
        });
        (addr, server)
    }

    #[tokio::test]
    async fn request_failed_while_waiting_for_the_writer_is_never_written() {
        let (addr, server) = recording_server().await;
        let config = Arc::new(ClientConfig {
            addr,
            ..ClientConfig::default()
        });
        let conn = Connection::connect(0, config, Arc::new(ClientMetrics::new()))
            .await
            .unwrap();

        let writer = conn.inner.writer.lock().await;
        let sender = conn.clone();
        let send = tokio::spawn(async move {
            sender
                .send(Op::Get, TableRef::ids(1, 1), "k", Bytes::new(), Flags::SAFE)
                .await
        });
        while conn.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        // Session failure resolves the request before its sender gets the lock.
        assert_eq!(
            conn.inner
                .fail_pending(&ClientError::Transport("connection lost".into())),
            1
        );
        drop(writer);

        let handle = send.await.unwrap().expect("handle carries the failure");
        assert!(matches!(handle.await, Err(ClientError::Transport(_))));
        assert_eq!(conn.available_permits(), conn.inner.config.pipeline_limit);

        conn.stop().await;
        assert!(server.await.unwrap().is_empty());
    }
}
