use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{BenchConfig, Deadline, InstanceConfig, Role, SendMode};
use crate::engine::{self, CompletionCounter, EngineStats, ProgressEngine, Wake};
use crate::error::{BenchError, TransportError};
use crate::instance_set;
use crate::server::answer;
use crate::transport::{Completion, CompletionKind, Context, MethodId, PeerAddr, RpcIn, Transport};

/// One finished call: what was sent and what came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    pub input: i32,
    pub reply: i32,
}

#[derive(Debug, Clone)]
pub struct ClientReport {
    pub instance: usize,
    pub calls: u32,
    pub elapsed: Duration,
    pub peak_in_flight: u64,
    /// In completion order.
    pub exchanges: Vec<Exchange>,
    pub engine: EngineStats,
}

impl ClientReport {
    pub fn mean_per_call(&self) -> Duration {
        self.elapsed / self.calls.max(1)
    }

    /// Every input `1..=calls` came back exactly once, negated.
    pub fn round_trips_hold(&self) -> bool {
        let mut inputs: Vec<i32> = self.exchanges.iter().map(|e| e.input).collect();
        inputs.sort_unstable();
        let expected: Vec<i32> = (1..=self.calls as i32).collect();
        inputs == expected && self.exchanges.iter().all(|e| e.reply == answer(e.input))
    }
}

/// State the control thread shares with the completion callbacks.
struct Shared {
    instance: usize,
    quiet: bool,
    replied: Arc<CompletionCounter>,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
    exchanges: Mutex<Vec<Exchange>>,
}

impl Shared {
    fn exchanges(&self) -> MutexGuard<'_, Vec<Exchange>> {
        self.exchanges.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An outstanding call, consumed by its completion callback.
struct PendingCall {
    seq: u32,
    input: RpcIn,
    shared: Arc<Shared>,
}

impl PendingCall {
    fn finish(self, outcome: Result<Completion, TransportError>) {
        let PendingCall { seq, input, shared } = self;
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);

        let reply = match outcome {
            Ok(Completion::Forward(out)) => out,
            Ok(other) => {
                shared.replied.fail(BenchError::Call {
                    instance: shared.instance,
                    seq,
                    source: TransportError::UnexpectedCompletion {
                        expected: CompletionKind::Forward,
                        got: other.kind(),
                    },
                });
                return;
            }
            Err(source) => {
                shared.replied.fail(BenchError::Call {
                    instance: shared.instance,
                    seq,
                    source,
                });
                return;
            }
        };

        per_call!(
            shared.quiet,
            "{}: forw complete (code=0), sent {} got {}",
            shared.instance,
            input.value,
            reply.value
        );
        shared.exchanges().push(Exchange {
            input: input.value,
            reply: reply.value,
        });
        shared.replied.advance();
    }
}

pub struct ClientInstance<T: Transport> {
    config: InstanceConfig,
    class: T,
}

impl<T: Transport> ClientInstance<T> {
    pub fn init(config: InstanceConfig) -> Result<Self, BenchError> {
        let class = T::init(&config.local_endpoint, false).map_err(|source| BenchError::Init {
            instance: config.index,
            op: "init",
            source,
        })?;
        Ok(Self::with_transport(config, class))
    }

    pub fn with_transport(config: InstanceConfig, class: T) -> Self {
        Self { config, class }
    }

    pub fn run(self) -> Result<ClientReport, BenchError> {
        let ClientInstance { config, class } = self;
        let instance = config.index;
        let init_err = move |op: &'static str| move |source: TransportError| BenchError::Init { instance, op, source };

        let remote = config
            .remote_endpoint
            .clone()
            .ok_or_else(|| BenchError::Config(format!("client {} has no remote endpoint", instance)))?;
        let ctx = Arc::new(class.create_context().map_err(init_err("create context"))?);
        let method = class
            .register_method(&config.method_name(), None)
            .map_err(init_err("register method"))?;
        info!("{}: instance running, {} -> {}", instance, config.local_endpoint, remote);

        let wake = match config.send_mode {
            SendMode::Serial => Wake::EveryAdvance,
            SendMode::Parallel => Wake::AtTarget,
        };
        let shared = Arc::new(Shared {
            instance,
            quiet: config.quiet,
            replied: Arc::new(CompletionCounter::new(instance, u64::from(config.count), wake)),
            in_flight: AtomicU64::new(0),
            peak_in_flight: AtomicU64::new(0),
            exchanges: Mutex::new(Vec::new()),
        });

        let sends_done = Arc::new(AtomicBool::new(false));
        let engine = {
            let done = sends_done.clone();
            let replied = shared.replied.clone();
            ProgressEngine::start(
                instance,
                ctx.clone(),
                move || done.load(Ordering::Acquire) || replied.is_faulted(),
                shared.replied.clone(),
                config.progress_timeout,
                config.deadline,
            )?
        };

        let mut peer = None;
        let exchanged = exchange(&*ctx, &config, &remote, method, &shared, &mut peer);

        debug!("{}: draining", instance);
        sends_done.store(true, Ordering::Release);
        let stats = engine.join();

        let torn_down = engine::teardown(instance, class, ctx, peer);
        let (elapsed, stats) = match engine::settle_outcome(exchanged, stats) {
            Ok(done) => done,
            Err(e) => {
                if let Err(teardown) = torn_down {
                    warn!("{}: {}", instance, teardown);
                }
                return Err(e);
            }
        };
        torn_down?;

        let exchanges = std::mem::take(&mut *shared.exchanges());
        let report = ClientReport {
            instance,
            calls: config.count,
            elapsed,
            peak_in_flight: shared.peak_in_flight.load(Ordering::SeqCst),
            exchanges,
            engine: stats,
        };
        info!(
            "{}: average time per rpc = {} nsec",
            instance,
            report.mean_per_call().as_nanos()
        );
        info!("{}: done", instance);
        Ok(report)
    }
}

/// Resolve, then issue every call and wait for the replies. The resolved
/// handle is left in `peer` so teardown can free it whatever happens here.
fn exchange<C: Context>(
    ctx: &C,
    config: &InstanceConfig,
    remote: &str,
    method: MethodId,
    shared: &Arc<Shared>,
    peer: &mut Option<PeerAddr>,
) -> Result<Duration, BenchError> {
    let instance = config.index;

    debug!("{}: resolving {}", instance, remote);
    let resolved: &PeerAddr = peer.insert(engine::resolve(
        ctx,
        instance,
        remote,
        config.resolve_timeout,
        config.deadline,
        || shared.replied.is_faulted(),
    )?);
    info!("{}: resolved {}", instance, resolved.label());

    let count = config.count;
    let replied = &shared.replied;
    info!(
        "{}: launching {} rpcs ({})",
        instance,
        count,
        match config.send_mode {
            SendMode::Parallel => "parallel",
            SendMode::Serial => "serial",
        }
    );

    let start = Instant::now();
    for seq in 0..count {
        let input = RpcIn::new(seq as i32 + 1);
        let in_flight = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let call = PendingCall {
            seq,
            input,
            shared: shared.clone(),
        };
        if let Err(source) = ctx.forward(resolved, method, input, Box::new(move |outcome| call.finish(outcome))) {
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(BenchError::Call { instance, seq, source });
        }
        per_call!(config.quiet, "{}: forwarded input {}", instance, input.value);

        if config.send_mode == SendMode::Serial {
            replied.await_at_least(u64::from(seq) + 1, config.deadline, "reply")?;
        }
    }

    replied.await_at_least(u64::from(count), config.deadline, "replies")?;
    let elapsed = start.elapsed();
    info!("{}: all {} replies in", instance, count);
    Ok(elapsed)
}

/// Run one client instance per configured index, each on its own thread.
pub fn run_clients<T: Transport>(
    config: &BenchConfig,
    deadline: Deadline,
) -> Result<Vec<ClientReport>, BenchError> {
    let instances = config.client_instances(deadline)?;
    instance_set::launch(Role::Client, instances, |config| {
        ClientInstance::<T>::init(config)?.run()
    })
}
