use std::io;
use thiserror::Error;

use crate::transport::CompletionKind;

/// Failures raised by a transport implementation or reported through a
/// completion callback.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unsupported endpoint {0:?}")]
    BadEndpoint(String),

    #[error("{addr} unreachable: {source}")]
    Unreachable { addr: String, source: io::Error },

    #[error("unknown peer handle {0}")]
    UnknownPeer(u64),

    #[error("method {name:?} collides with registered method {existing:?}")]
    MethodCollision { name: String, existing: String },

    #[error("connection closed")]
    Disconnected,

    #[error("remote fault: {0}")]
    Remote(String),

    #[error("expected {expected} completion, got {got}")]
    UnexpectedCompletion {
        expected: CompletionKind,
        got: CompletionKind,
    },

    #[error("context still referenced at teardown")]
    ContextInUse,
}

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read config {path}: {source}")]
    ConfigFile { path: String, source: io::Error },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("{instance}: {op} failed: {source}")]
    Init {
        instance: usize,
        op: &'static str,
        source: TransportError,
    },

    #[error("{instance}: lookup of {addr} failed: {source}")]
    Resolve {
        instance: usize,
        addr: String,
        source: TransportError,
    },

    #[error("{instance}: call {seq} failed: {source}")]
    Call {
        instance: usize,
        seq: u32,
        source: TransportError,
    },

    #[error("{instance}: reply failed: {source}")]
    Reply {
        instance: usize,
        source: TransportError,
    },

    #[error("{instance}: network progress failed: {source}")]
    Progress {
        instance: usize,
        source: TransportError,
    },

    #[error("{instance}: network engine stopped")]
    EngineStopped { instance: usize },

    #[error("{instance}: teardown ({op}) failed: {source}")]
    Teardown {
        instance: usize,
        op: &'static str,
        source: TransportError,
    },

    #[error("{instance}: timed out waiting for {what} ({count}/{threshold})")]
    Timeout {
        instance: usize,
        what: &'static str,
        count: u64,
        threshold: u64,
    },

    #[error("{instance}: {role} thread panicked")]
    Panicked { instance: usize, role: &'static str },

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),
}

impl BenchError {
    /// Instance the failure belongs to, if it is tied to one.
    pub fn instance(&self) -> Option<usize> {
        match self {
            BenchError::Init { instance, .. }
            | BenchError::Resolve { instance, .. }
            | BenchError::Call { instance, .. }
            | BenchError::Reply { instance, .. }
            | BenchError::Progress { instance, .. }
            | BenchError::EngineStopped { instance }
            | BenchError::Teardown { instance, .. }
            | BenchError::Timeout { instance, .. }
            | BenchError::Panicked { instance, .. } => Some(*instance),
            _ => None,
        }
    }
}
