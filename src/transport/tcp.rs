use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::endpoint::parse_endpoint;
use super::frame::{Frame, read_frame, write_frame};
use super::queue::CompletionQueue;
use super::{
    Callback, Completion, Context, Handler, MethodId, PeerAddr, Request, Responder, RpcIn, RpcOut,
    Transport,
};
use crate::error::TransportError;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct Method {
    name: String,
    handler: Option<Handler>,
}

type MethodTable = Arc<DashMap<MethodId, Method>>;

/// TCP endpoint class: the local address, the optional listener, and the
/// methods registered on it.
pub struct TcpTransport {
    local: SocketAddr,
    listener: Option<std::net::TcpListener>,
    methods: MethodTable,
}

impl TcpTransport {
    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .unwrap_or(self.local)
    }
}

impl Transport for TcpTransport {
    type Context = TcpContext;

    fn init(local: &str, listen: bool) -> Result<Self, TransportError> {
        let local = parse_endpoint(local)?;
        let listener = if listen { Some(bind_listener(local)?) } else { None };

        let transport = Self {
            local,
            listener,
            methods: Arc::new(DashMap::new()),
        };
        if transport.listener.is_some() {
            info!("Listening on {}", transport.local_addr());
        }
        Ok(transport)
    }

    fn create_context(&self) -> Result<TcpContext, TransportError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let queue = Arc::new(CompletionQueue::new());

        let accept = match &self.listener {
            Some(listener) => {
                let listener = {
                    let _guard = runtime.enter();
                    TcpListener::from_std(listener.try_clone()?)?
                };
                let task = runtime.spawn(accept_loop(listener, queue.clone(), self.methods.clone()));
                Some(task.abort_handle())
            }
            None => None,
        };

        Ok(TcpContext {
            runtime,
            local: self.local,
            queue,
            methods: self.methods.clone(),
            peers: Arc::new(DashMap::new()),
            next_peer: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            accept,
        })
    }

    fn register_method(&self, name: &str, handler: Option<Handler>) -> Result<MethodId, TransportError> {
        let id = MethodId::from_name(name);
        if let Some(existing) = self.methods.get(&id) {
            if existing.name != name {
                return Err(TransportError::MethodCollision {
                    name: name.to_string(),
                    existing: existing.name.clone(),
                });
            }
        }

        self.methods.insert(
            id,
            Method {
                name: name.to_string(),
                handler,
            },
        );
        debug!("Registered method {} as {}", name, id);
        Ok(id)
    }

    fn finalize(self) -> Result<(), TransportError> {
        debug!("Finalizing endpoint {}", self.local);
        Ok(())
    }
}

/// One context per instance. Owns a current-thread runtime that is only
/// driven from [`Context::progress`], so all socket work happens on the
/// progress thread.
pub struct TcpContext {
    runtime: Runtime,
    local: SocketAddr,
    queue: Arc<CompletionQueue>,
    methods: MethodTable,
    peers: Arc<DashMap<u64, Link>>,
    next_peer: AtomicU64,
    next_seq: AtomicU64,
    accept: Option<AbortHandle>,
}

impl Context for TcpContext {
    fn resolve_address(&self, addr: &str, patience: Duration, callback: Callback) -> Result<(), TransportError> {
        let remote = parse_endpoint(addr)?;
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let label = addr.to_string();
        let local = self.local;
        let queue = self.queue.clone();
        let peers = self.peers.clone();
        let methods = self.methods.clone();

        self.runtime.spawn(async move {
            match connect_with_retry(local, remote, patience).await {
                Ok(stream) => {
                    debug!("Connected to {} from {:?}", remote, stream.local_addr().ok());
                    let link = Link::open(stream, queue.clone(), methods);
                    peers.insert(id, link);
                    queue.complete(callback, Ok(Completion::Lookup(PeerAddr::new(id, label))));
                }
                Err(e) => queue.complete(callback, Err(e)),
            }
        });
        Ok(())
    }

    fn forward(
        &self,
        peer: &PeerAddr,
        method: MethodId,
        input: RpcIn,
        callback: Callback,
    ) -> Result<(), TransportError> {
        let link = self
            .peers
            .get(&peer.id())
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::UnknownPeer(peer.id()))?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        {
            let mut calls = link.calls();
            if !calls.open {
                return Err(TransportError::Disconnected);
            }
            calls.waiting.insert(seq, callback);
        }

        let frame = Frame::Request { seq, method, input };
        if link.outbound.send(Outbound { frame, sent: None }).is_err() {
            link.calls().waiting.remove(&seq);
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    fn free_address(&self, peer: PeerAddr) -> Result<(), TransportError> {
        let (_, link) = self
            .peers
            .remove(&peer.id())
            .ok_or(TransportError::UnknownPeer(peer.id()))?;
        debug!("Releasing peer {}", peer.label());
        link.close();
        Ok(())
    }

    fn trigger(&self, max: usize) -> Result<usize, TransportError> {
        Ok(self.queue.run(max))
    }

    fn progress(&self, timeout: Duration) -> Result<bool, TransportError> {
        if !self.queue.is_empty() {
            return Ok(true);
        }
        let queue = self.queue.clone();
        let woke = self
            .runtime
            .block_on(async move { tokio::time::timeout(timeout, queue.wait()).await.is_ok() });
        Ok(woke || !self.queue.is_empty())
    }

    fn destroy(self) -> Result<(), TransportError> {
        if let Some(accept) = &self.accept {
            accept.abort();
        }
        for entry in self.peers.iter() {
            entry.value().close();
        }
        self.peers.clear();
        let dropped = self.queue.len();
        if dropped > 0 {
            debug!("Dropping {} untriggered completions", dropped);
        }
        self.runtime.shutdown_timeout(Duration::from_millis(100));
        Ok(())
    }
}

struct Outbound {
    frame: Frame,
    sent: Option<Callback>,
}

struct Calls {
    open: bool,
    waiting: HashMap<u64, Callback>,
}

/// One connection: a writer task draining `outbound`, a reader task
/// dispatching inbound frames.
#[derive(Clone)]
struct Link {
    outbound: mpsc::UnboundedSender<Outbound>,
    calls: Arc<Mutex<Calls>>,
    tasks: [AbortHandle; 2],
}

impl Link {
    fn open(stream: TcpStream, queue: Arc<CompletionQueue>, methods: MethodTable) -> Self {
        if let Err(e) = configure_stream(&stream) {
            warn!("Failed to tune socket: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(Mutex::new(Calls {
            open: true,
            waiting: HashMap::new(),
        }));

        let writer = tokio::spawn(write_loop(write_half, rx, queue.clone()));
        let reader = tokio::spawn(read_loop(read_half, tx.clone(), calls.clone(), queue, methods));

        Self {
            outbound: tx,
            calls,
            tasks: [reader.abort_handle(), writer.abort_handle()],
        }
    }

    fn calls(&self) -> MutexGuard<'_, Calls> {
        lock(&self.calls)
    }

    fn close(&self) {
        self.calls().open = false;
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct TcpResponder {
    seq: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Responder for TcpResponder {
    fn respond(self: Box<Self>, output: RpcOut, callback: Callback) -> Result<(), TransportError> {
        let frame = Frame::Reply {
            seq: self.seq,
            output,
        };
        self.outbound
            .send(Outbound {
                frame,
                sent: Some(callback),
            })
            .map_err(|_| TransportError::Disconnected)
    }
}

async fn accept_loop(listener: TcpListener, queue: Arc<CompletionQueue>, methods: MethodTable) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("New connection from {}", peer);
                // the link lives as long as its tasks do
                Link::open(stream, queue.clone(), methods.clone());
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    outbound: mpsc::UnboundedSender<Outbound>,
    calls: Arc<Mutex<Calls>>,
    queue: Arc<CompletionQueue>,
    methods: MethodTable,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Request { seq, method, input })) => {
                dispatch(seq, method, input, &outbound, &queue, &methods);
            }
            Ok(Some(Frame::Reply { seq, output })) => {
                settle(&calls, &queue, seq, Ok(Completion::Forward(output)));
            }
            Ok(Some(Frame::Fault { seq, reason })) => {
                settle(&calls, &queue, seq, Err(TransportError::Remote(reason)));
            }
            Ok(None) => {
                debug!("Peer closed connection");
                break;
            }
            Err(e) => {
                warn!("Dropping connection after read error: {}", e);
                break;
            }
        }
    }

    let orphans: Vec<Callback> = {
        let mut calls = lock(&calls);
        calls.open = false;
        calls.waiting.drain().map(|(_, cb)| cb).collect()
    };
    for callback in orphans {
        queue.complete(callback, Err(TransportError::Disconnected));
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    queue: Arc<CompletionQueue>,
) {
    while let Some(Outbound { frame, sent }) = outbound.recv().await {
        match write_frame(&mut writer, &frame).await {
            Ok(()) => {
                if let Some(callback) = sent {
                    queue.complete(callback, Ok(Completion::Respond));
                }
            }
            Err(e) => {
                warn!("Failed to write frame {}: {}", frame.seq(), e);
                if let Some(callback) = sent {
                    queue.complete(callback, Err(e));
                }
                break;
            }
        }
    }

    outbound.close();
    while let Ok(Outbound { sent, .. }) = outbound.try_recv() {
        if let Some(callback) = sent {
            queue.complete(callback, Err(TransportError::Disconnected));
        }
    }
}

fn dispatch(
    seq: u64,
    method: MethodId,
    input: RpcIn,
    outbound: &mpsc::UnboundedSender<Outbound>,
    queue: &CompletionQueue,
    methods: &MethodTable,
) {
    let handler = methods.get(&method).and_then(|m| m.handler.clone());
    match handler {
        Some(handler) => {
            let responder = TcpResponder {
                seq,
                outbound: outbound.clone(),
            };
            queue.push(Box::new(move || {
                handler(Request::new(method, input, Box::new(responder)))
            }));
        }
        None => {
            warn!("No handler for method {}", method);
            let frame = Frame::Fault {
                seq,
                reason: format!("no handler for method {}", method),
            };
            if outbound.send(Outbound { frame, sent: None }).is_err() {
                debug!("Connection closed before fault for call {} was sent", seq);
            }
        }
    }
}

fn settle(
    calls: &Mutex<Calls>,
    queue: &CompletionQueue,
    seq: u64,
    outcome: Result<Completion, TransportError>,
) {
    let callback = lock(calls).waiting.remove(&seq);
    match callback {
        Some(callback) => queue.complete(callback, outcome),
        None => warn!("Reply for unknown call {}", seq),
    }
}

async fn connect_with_retry(
    local: SocketAddr,
    remote: SocketAddr,
    patience: Duration,
) -> Result<TcpStream, TransportError> {
    let started = Instant::now();
    loop {
        let remaining = patience.saturating_sub(started.elapsed());
        let attempt = match tokio::time::timeout(remaining, connect_from(local, remote)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        };

        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) if started.elapsed() + CONNECT_RETRY_DELAY < patience => {
                debug!("Connect to {} failed ({}), retrying", remote, e);
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(TransportError::Unreachable {
                    addr: remote.to_string(),
                    source: e,
                });
            }
        }
    }
}

async fn connect_from(local: SocketAddr, remote: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    if local.is_ipv4() == remote.is_ipv4() {
        socket.bind(local)?;
    }
    socket.connect(remote).await
}

fn bind_listener(addr: SocketAddr) -> Result<std::net::TcpListener, TransportError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    let sock_ref = socket2::SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30)) // probe after 30 seconds of idle
        .with_interval(Duration::from_secs(10));

    sock_ref.set_tcp_keepalive(&keepalive)?;

    stream.set_nodelay(true)?;

    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
