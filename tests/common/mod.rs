//! Common test utilities: an in-memory transport whose completions follow a
//! script, and config builders.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use sndrcv::config::{BenchConfig, Deadline, InstanceConfig, SendMode};
use sndrcv::transport::{
    Callback, Completion, CompletionQueue, Context, Handler, MethodId, PeerAddr, Request, Responder, RpcIn,
    RpcOut, Transport,
};
use sndrcv::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Issued(i32),
    Completed(i32),
    Replied(i32),
    Freed,
    Destroyed,
    Finalized,
}

/// Where a scripted reply goes wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFault {
    /// `respond` itself is rejected.
    Submit,
    /// The reply is accepted but its completion reports an error.
    Delivery,
}

/// How the scripted transport behaves.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Held calls are released, newest first, once this many are in flight.
    pub release_at: usize,
    /// Lookups fail.
    pub unreachable: bool,
    /// The call carrying this input completes with an error.
    pub fail_input: Option<i32>,
    /// Forwards complete with `Completion::Respond` instead of a reply.
    pub wrong_kind: bool,
    /// Requests delivered to the registered handler on the first progress call.
    pub inbound: Vec<i32>,
    pub reply_fault: Option<ReplyFault>,
}

struct Shared {
    script: Script,
    events: Mutex<Vec<Event>>,
    handler: Mutex<Option<(MethodId, Handler)>>,
}

impl Shared {
    fn record(&self, event: Event) {
        lock(&self.events).push(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle the test keeps to inspect what happened after the run.
#[derive(Clone)]
pub struct Recorder(Arc<Shared>);

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        lock(&self.0.events).clone()
    }

    pub fn count(&self, wanted: &Event) -> usize {
        self.events().iter().filter(|e| *e == wanted).count()
    }
}

pub struct ScriptedTransport {
    shared: Arc<Shared>,
}

impl ScriptedTransport {
    pub fn new(script: Script) -> (Self, Recorder) {
        let shared = Arc::new(Shared {
            script,
            events: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
        });
        (
            Self {
                shared: shared.clone(),
            },
            Recorder(shared),
        )
    }
}

impl Transport for ScriptedTransport {
    type Context = ScriptedContext;

    fn init(_local: &str, _listen: bool) -> Result<Self, TransportError> {
        Ok(Self::new(Script::default()).0)
    }

    fn create_context(&self) -> Result<ScriptedContext, TransportError> {
        Ok(ScriptedContext {
            shared: self.shared.clone(),
            queue: Arc::new(CompletionQueue::new()),
            held: Mutex::new(Vec::new()),
            delivered: Mutex::new(false),
        })
    }

    fn register_method(&self, name: &str, handler: Option<Handler>) -> Result<MethodId, TransportError> {
        let id = MethodId::from_name(name);
        if let Some(handler) = handler {
            *lock(&self.shared.handler) = Some((id, handler));
        }
        Ok(id)
    }

    fn finalize(self) -> Result<(), TransportError> {
        self.shared.record(Event::Finalized);
        Ok(())
    }
}

pub struct ScriptedContext {
    shared: Arc<Shared>,
    queue: Arc<CompletionQueue>,
    held: Mutex<Vec<(RpcIn, Callback)>>,
    delivered: Mutex<bool>,
}

impl ScriptedContext {
    fn release(&self, input: RpcIn, callback: Callback) {
        let value = input.value;
        let outcome = if self.shared.script.fail_input == Some(value) {
            Err(TransportError::Disconnected)
        } else if self.shared.script.wrong_kind {
            Ok(Completion::Respond)
        } else {
            Ok(Completion::Forward(RpcOut::new(value.wrapping_neg())))
        };
        let shared = self.shared.clone();
        self.queue.complete(
            Box::new(move |outcome| {
                shared.record(Event::Completed(value));
                callback(outcome);
            }),
            outcome,
        );
    }

    fn deliver_inbound(&self) {
        let mut delivered = lock(&self.delivered);
        if *delivered {
            return;
        }
        *delivered = true;

        let Some((method, handler)) = lock(&self.shared.handler).clone() else {
            return;
        };
        for &value in &self.shared.script.inbound {
            let handler = handler.clone();
            let responder = ScriptedResponder {
                shared: self.shared.clone(),
                queue: self.queue.clone(),
            };
            self.queue.push(Box::new(move || {
                handler(Request::new(method, RpcIn::new(value), Box::new(responder)));
            }));
        }
    }
}

impl Context for ScriptedContext {
    fn resolve_address(&self, addr: &str, _patience: Duration, callback: Callback) -> Result<(), TransportError> {
        let outcome = if self.shared.script.unreachable {
            Err(TransportError::Unreachable {
                addr: addr.to_string(),
                source: std::io::ErrorKind::ConnectionRefused.into(),
            })
        } else {
            Ok(Completion::Lookup(PeerAddr::new(1, addr)))
        };
        self.queue.complete(callback, outcome);
        Ok(())
    }

    fn forward(&self, _peer: &PeerAddr, _method: MethodId, input: RpcIn, callback: Callback) -> Result<(), TransportError> {
        self.shared.record(Event::Issued(input.value));

        let mut held = lock(&self.held);
        held.push((input, callback));
        if held.len() >= self.shared.script.release_at.max(1) {
            for (input, callback) in held.drain(..).rev() {
                self.release(input, callback);
            }
        }
        Ok(())
    }

    fn free_address(&self, _peer: PeerAddr) -> Result<(), TransportError> {
        self.shared.record(Event::Freed);
        Ok(())
    }

    fn trigger(&self, max: usize) -> Result<usize, TransportError> {
        Ok(self.queue.run(max))
    }

    fn progress(&self, timeout: Duration) -> Result<bool, TransportError> {
        self.deliver_inbound();
        if self.queue.is_empty() {
            thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        Ok(!self.queue.is_empty())
    }

    fn destroy(self) -> Result<(), TransportError> {
        self.shared.record(Event::Destroyed);
        Ok(())
    }
}

struct ScriptedResponder {
    shared: Arc<Shared>,
    queue: Arc<CompletionQueue>,
}

impl Responder for ScriptedResponder {
    fn respond(self: Box<Self>, output: RpcOut, callback: Callback) -> Result<(), TransportError> {
        match self.shared.script.reply_fault {
            Some(ReplyFault::Submit) => Err(TransportError::Disconnected),
            Some(ReplyFault::Delivery) => {
                self.queue.complete(callback, Err(TransportError::Disconnected));
                Ok(())
            }
            None => {
                self.shared.record(Event::Replied(output.value));
                self.queue.complete(callback, Ok(Completion::Respond));
                Ok(())
            }
        }
    }
}

pub fn client_config(count: u32, send_mode: SendMode) -> InstanceConfig {
    let config = BenchConfig {
        instances: 1,
        remote_spec: Some("tcp://127.0.0.1:%d".into()),
        count,
        send_mode,
        progress_timeout_ms: 5,
        ..BenchConfig::default()
    };
    config
        .client_instances(Deadline::after(Duration::from_secs(10)))
        .unwrap()
        .remove(0)
}

pub fn server_config(count: u32) -> InstanceConfig {
    let config = BenchConfig {
        instances: 1,
        count,
        progress_timeout_ms: 5,
        ..BenchConfig::default()
    };
    config
        .server_instances(Deadline::after(Duration::from_secs(10)))
        .unwrap()
        .remove(0)
}

/// Two-sided config for running real client and server sets in one process.
pub fn loopback_config(instances: usize, base_port: u16, count: u32, send_mode: SendMode) -> BenchConfig {
    BenchConfig {
        instances,
        local_spec: "tcp://127.0.0.1:%d".into(),
        remote_spec: Some("tcp://127.0.0.1:%d".into()),
        base_port,
        count,
        send_mode,
        timeout_secs: 20,
        resolve_timeout_ms: 5_000,
        progress_timeout_ms: 20,
        ..BenchConfig::default()
    }
}
