//! The narrow interface the instance engine drives.
//!
//! A transport is split the same way the engine uses it: a [`Transport`]
//! class owns the local endpoint and the method table, a [`Context`] owns the
//! in-flight operations. Every asynchronous operation finishes by queueing
//! its [`Callback`]; nothing runs until [`Context::trigger`] is called, and
//! network I/O only advances inside [`Context::progress`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;

pub mod endpoint;
pub mod frame;
pub mod queue;
pub mod tcp;

pub use queue::CompletionQueue;
pub use tcp::{TcpContext, TcpTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcIn {
    pub value: i32,
}

impl RpcIn {
    pub fn new(value: i32) -> Self {
        Self { value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcOut {
    pub value: i32,
}

impl RpcOut {
    pub fn new(value: i32) -> Self {
        Self { value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodId(u64);

impl MethodId {
    /// FNV-1a over the method name, so both processes derive the same id.
    pub fn from_name(name: &str) -> Self {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let hash = name
            .bytes()
            .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME));
        Self(hash)
    }

}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A resolved remote endpoint. Owned by whoever resolved it and handed back
/// to [`Context::free_address`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct PeerAddr {
    id: u64,
    label: String,
}

impl PeerAddr {
    pub fn new(id: u64, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Debug)]
pub enum Completion {
    Lookup(PeerAddr),
    Forward(RpcOut),
    Respond,
}

impl Completion {
    pub fn kind(&self) -> CompletionKind {
        match self {
            Completion::Lookup(_) => CompletionKind::Lookup,
            Completion::Forward(_) => CompletionKind::Forward,
            Completion::Respond => CompletionKind::Respond,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Lookup,
    Forward,
    Respond,
}

impl fmt::Display for CompletionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionKind::Lookup => write!(f, "lookup"),
            CompletionKind::Forward => write!(f, "forward"),
            CompletionKind::Respond => write!(f, "respond"),
        }
    }
}

pub type Callback = Box<dyn FnOnce(Result<Completion, TransportError>) + Send>;

pub type Handler = Arc<dyn Fn(Request) + Send + Sync>;

/// Sends the reply for one inbound request.
pub trait Responder: Send {
    fn respond(self: Box<Self>, output: RpcOut, callback: Callback) -> Result<(), TransportError>;
}

/// An inbound call, handed to the registered [`Handler`] on the trigger
/// thread.
pub struct Request {
    method: MethodId,
    input: RpcIn,
    responder: Box<dyn Responder>,
}

impl Request {
    pub fn new(method: MethodId, input: RpcIn, responder: Box<dyn Responder>) -> Self {
        Self {
            method,
            input,
            responder,
        }
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn input(&self) -> RpcIn {
        self.input
    }

    /// Queue the reply; `callback` runs once it has been handed to the wire.
    pub fn respond(self, output: RpcOut, callback: Callback) -> Result<(), TransportError> {
        self.responder.respond(output, callback)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

pub trait Transport: Sized + Send + 'static {
    type Context: Context;

    /// Bring up the local endpoint. `listen` accepts inbound connections.
    fn init(local: &str, listen: bool) -> Result<Self, TransportError>;

    fn create_context(&self) -> Result<Self::Context, TransportError>;

    /// Register `name`. A `None` handler is a client-only registration.
    fn register_method(&self, name: &str, handler: Option<Handler>) -> Result<MethodId, TransportError>;

    fn finalize(self) -> Result<(), TransportError>;
}

pub trait Context: Send + Sync + Sized + 'static {
    /// Start resolving `addr`; keep trying for up to `patience`.
    fn resolve_address(&self, addr: &str, patience: Duration, callback: Callback) -> Result<(), TransportError>;

    fn forward(
        &self,
        peer: &PeerAddr,
        method: MethodId,
        input: RpcIn,
        callback: Callback,
    ) -> Result<(), TransportError>;

    fn free_address(&self, peer: PeerAddr) -> Result<(), TransportError>;

    /// Run up to `max` ready callbacks on the calling thread. Returns how many ran.
    fn trigger(&self, max: usize) -> Result<usize, TransportError>;

    /// Advance network I/O for at most `timeout`. Returns true when there is
    /// something to trigger.
    fn progress(&self, timeout: Duration) -> Result<bool, TransportError>;

    fn destroy(self) -> Result<(), TransportError>;
}
