//! In-process mock server speaking the client wire protocol.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbor_client::auth::{verify_token, MODE_HMAC, MODE_OPEN, NONCE_LEN, TOKEN_LEN};
use arbor_client::ClientConfig;
use arbor_common::wire::{self, WireFormat};
use arbor_common::{Flags, Op, PushEvent, Request, Response, TableRef};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// What the server does with one request.
pub enum Reply {
    Respond(Response),
    /// Never answer.
    Silent,
    /// Answer after a delay.
    After(Duration, Response),
}

pub type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

struct Session {
    tx: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct State {
    handler: Handler,
    secret: Option<Vec<u8>>,
    format: WireFormat,
    sessions: Mutex<Vec<Session>>,
    requests: Mutex<Vec<Request>>,
    accepted: AtomicUsize,
    /// Connections still to be closed right after accept.
    refuse: AtomicUsize,
}

pub struct MockServer {
    pub addr: String,
    state: Arc<State>,
    accept: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
        self.kill_all();
    }
}

impl MockServer {
    pub async fn start(handler: Handler) -> Self {
        Self::start_with(handler, None, WireFormat::Compact).await
    }

    pub async fn start_with(handler: Handler, secret: Option<&str>, format: WireFormat) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let state = Arc::new(State {
            handler,
            secret: secret.map(|s| s.as_bytes().to_vec()),
            format,
            sessions: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            refuse: AtomicUsize::new(0),
        });

        let accept_state = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let refused = accept_state
                    .refuse
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if refused {
                    drop(stream);
                    continue;
                }
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        MockServer { addr, state, accept }
    }

    /// Connections accepted so far, including failed handshakes.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.state.sessions.lock().len()
    }

    pub async fn wait_for_sessions(&self, count: usize) {
        assert!(
            wait_until(Duration::from_secs(2), || self.live_sessions() >= count).await,
            "expected {count} sessions"
        );
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.requests.lock().clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.state.requests.lock().iter().filter(|req| req.op == op).count()
    }

    /// Closes the next `count` connections before the greeting.
    pub fn refuse_next(&self, count: usize) {
        self.state.refuse.store(count, Ordering::SeqCst);
    }

    /// Drops every live socket.
    pub fn kill_all(&self) {
        for session in self.state.sessions.lock().drain(..) {
            session.reader.abort();
            session.writer.abort();
        }
    }

    /// Pushes an invalidation to every live session.
    pub fn push(&self, event: &PushEvent) {
        let mut out = BytesMut::new();
        wire::encode_push(event, &mut out).expect("encode push");
        self.send_raw(out.freeze());
    }

    /// Writes arbitrary bytes to every live session.
    pub fn send_raw(&self, bytes: Bytes) {
        for session in self.state.sessions.lock().iter() {
            let _ = session.tx.send(bytes.clone());
        }
    }
}

async fn serve(mut stream: TcpStream, state: Arc<State>) {
    let nonce: [u8; NONCE_LEN] = [7, 1, 7, 1, 7, 1, 7, 1];
    let mode = if state.secret.is_some() { MODE_HMAC } else { MODE_OPEN };
    let mut hello = vec![mode];
    hello.extend_from_slice(&nonce);
    if stream.write_all(&hello).await.is_err() {
        return;
    }
    if let Some(secret) = &state.secret {
        let mut token = [0u8; TOKEN_LEN];
        if stream.read_exact(&mut token).await.is_err() {
            return;
        }
        if !verify_token(secret, &nonce, &token) {
            return;
        }
    }

    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                return;
            }
        }
    });

    let reply_tx = tx.clone();
    let reader_state = Arc::clone(&state);
    let reader = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            match read_half.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            while let Ok(Some(body)) = wire::split_frame(&mut buf) {
                let Ok(request) = wire::decode_request(body, reader_state.format) else {
                    return;
                };
                reader_state.requests.lock().push(request.clone());
                match (reader_state.handler)(&request) {
                    Reply::Respond(response) => {
                        let _ = reply_tx.send(encode_response(&response));
                    }
                    Reply::Silent => {}
                    Reply::After(delay, response) => {
                        let tx = reply_tx.clone();
                        tokio::spawn(async move {
                            sleep(delay).await;
                            let _ = tx.send(encode_response(&response));
                        });
                    }
                }
            }
        }
    });

    state.sessions.lock().push(Session { tx, reader, writer });
}

pub fn encode_response(response: &Response) -> Bytes {
    let mut out = BytesMut::new();
    wire::encode_response(response, &mut out).expect("encode response");
    out.freeze()
}

pub fn error_response(id: u64, status: u32, message: &str) -> Response {
    Response {
        id,
        status,
        body: Bytes::copy_from_slice(message.as_bytes()),
    }
}

/// Handler answering every request with an empty success.
pub fn echo_handler() -> Handler {
    Arc::new(|req: &Request| Reply::Respond(Response::ok(req.id, Bytes::new())))
}

/// Handler that never answers.
pub fn silent_handler() -> Handler {
    Arc::new(|_: &Request| Reply::Silent)
}

/// Small key/value store behind the mock server.
#[derive(Default)]
pub struct KvStore {
    data: Mutex<HashMap<(TableRef, String), Bytes>>,
    tables: Mutex<HashMap<String, u16>>,
    failing: Mutex<Vec<String>>,
}

impl KvStore {
    pub fn handler(self: &Arc<Self>) -> Handler {
        let store = Arc::clone(self);
        Arc::new(move |req: &Request| Reply::Respond(store.apply(req)))
    }

    /// Requests for `key` are answered with status 500 from now on.
    pub fn fail_key(&self, key: &str) {
        self.failing.lock().push(key.to_string());
    }

    pub fn value(&self, target: &TableRef, key: &str) -> Option<Bytes> {
        self.data.lock().get(&(target.clone(), key.to_string())).cloned()
    }

    pub fn put(&self, target: &TableRef, key: &str, value: Bytes) {
        self.data.lock().insert((target.clone(), key.to_string()), value);
    }

    pub fn apply(&self, req: &Request) -> Response {
        let id = req.id;
        if self.failing.lock().contains(&req.key) {
            return error_response(id, 500, "boom");
        }
        let slot = (req.target.clone(), req.key.clone());
        match req.op {
            Op::Get => Response::ok(id, self.data.lock().get(&slot).cloned().unwrap_or_default()),
            Op::Set => {
                let value = if req.flags.contains(Flags::TTL_PREFIXED) {
                    wire::split_ttl_payload(req.payload.clone())
                        .map(|(_, value)| value)
                        .unwrap_or_default()
                } else {
                    req.payload.clone()
                };
                self.data.lock().insert(slot, value);
                Response::ok(id, Bytes::new())
            }
            Op::Delete => {
                self.data.lock().remove(&slot);
                Response::ok(id, Bytes::new())
            }
            Op::Exists => {
                let present = self.data.lock().contains_key(&slot);
                Response::ok(id, vec![present as u8])
            }
            Op::Mget => {
                let keys = wire::decode_mget_keys(req.payload.clone()).unwrap_or_default();
                let data = self.data.lock();
                let entries: Vec<(String, Bytes)> = keys
                    .into_iter()
                    .map(|key| {
                        let value = data
                            .get(&(req.target.clone(), key.clone()))
                            .cloned()
                            .unwrap_or_default();
                        (key, value)
                    })
                    .collect();
                Response::ok(id, wire::encode_mget_values(&entries).expect("mget body"))
            }
            Op::RegisterSchema => {
                let schema: serde_json::Value =
                    serde_json::from_slice(&req.payload).unwrap_or_default();
                let table = schema["table"].as_str().unwrap_or_default().to_string();
                let mut tables = self.tables.lock();
                let next = tables.len() as u16 + 1;
                let table_id = *tables.entry(table).or_insert(next);
                Response::ok(id, wire::encode_schema_ids(1, table_id))
            }
            Op::Subscribe => Response::ok(id, Bytes::new()),
            Op::QueryCount => {
                let count = self
                    .data
                    .lock()
                    .keys()
                    .filter(|(target, _)| *target == req.target)
                    .count();
                Response::ok(id, count.to_string().into_bytes())
            }
            _ => error_response(id, 400, "unsupported"),
        }
    }
}

/// Single-connection configuration with short timers.
pub fn test_config(addr: &str) -> ClientConfig {
    ClientConfig {
        addr: addr.to_string(),
        pool_size: 1,
        permit_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        reconnect_backoff: Duration::from_millis(20),
        reconnect_backoff_max: Duration::from_millis(200),
        ..ClientConfig::default()
    }
}

pub async fn wait_until(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
