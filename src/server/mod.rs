use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{BenchConfig, Deadline, InstanceConfig, Role};
use crate::engine::{self, CompletionCounter, EngineStats, ProgressEngine, Wake};
use crate::error::{BenchError, TransportError};
use crate::instance_set;
use crate::transport::{Completion, CompletionKind, Handler, Request, RpcOut, Transport};

/// What the server sends back for `value`.
pub fn answer(value: i32) -> i32 {
    value.wrapping_neg()
}

#[derive(Debug, Clone)]
pub struct ServerReport {
    pub instance: usize,
    pub served: u64,
    pub elapsed: Duration,
    pub engine: EngineStats,
}

struct Served {
    instance: usize,
    quiet: bool,
    replied: Arc<CompletionCounter>,
}

impl Served {
    /// Runs on the progress thread for every inbound call.
    fn serve(self: &Arc<Self>, request: Request) {
        let input = request.input().value;
        per_call!(self.quiet, "{}: got remote input {}", self.instance, input);

        let this = self.clone();
        let submitted = request.respond(
            RpcOut::new(answer(input)),
            Box::new(move |outcome| this.replied_to(input, outcome)),
        );
        if let Err(source) = submitted {
            self.replied.fail(BenchError::Reply {
                instance: self.instance,
                source,
            });
        }
    }

    fn replied_to(&self, input: i32, outcome: Result<Completion, TransportError>) {
        let source = match outcome {
            Ok(Completion::Respond) => {
                let served = self.replied.advance();
                per_call!(self.quiet, "{}: replied to {} ({} served)", self.instance, input, served);
                return;
            }
            Ok(other) => TransportError::UnexpectedCompletion {
                expected: CompletionKind::Respond,
                got: other.kind(),
            },
            Err(e) => e,
        };
        self.replied.fail(BenchError::Reply {
            instance: self.instance,
            source,
        });
    }
}

pub struct ServerInstance<T: Transport> {
    config: InstanceConfig,
    class: T,
}

impl<T: Transport> ServerInstance<T> {
    pub fn init(config: InstanceConfig) -> Result<Self, BenchError> {
        let class = T::init(&config.local_endpoint, true).map_err(|source| BenchError::Init {
            instance: config.index,
            op: "init",
            source,
        })?;
        Ok(Self::with_transport(config, class))
    }

    pub fn with_transport(config: InstanceConfig, class: T) -> Self {
        Self { config, class }
    }

    pub fn run(self) -> Result<ServerReport, BenchError> {
        let ServerInstance { config, class } = self;
        let instance = config.index;
        let init_err = move |op: &'static str| move |source: TransportError| BenchError::Init { instance, op, source };

        let ctx = Arc::new(class.create_context().map_err(init_err("create context"))?);
        let served = Arc::new(Served {
            instance,
            quiet: config.quiet,
            replied: Arc::new(CompletionCounter::new(
                instance,
                u64::from(config.count),
                Wake::EveryAdvance,
            )),
        });
        let handler: Handler = {
            let served = served.clone();
            Arc::new(move |request: Request| served.serve(request))
        };
        class
            .register_method(&config.method_name(), Some(handler))
            .map_err(init_err("register method"))?;
        info!(
            "{}: instance running on {}, expecting {} rpcs",
            instance, config.local_endpoint, config.count
        );

        let start = Instant::now();
        let engine = {
            let replied = served.replied.clone();
            ProgressEngine::start(
                instance,
                ctx.clone(),
                move || replied.settled(),
                served.replied.clone(),
                config.progress_timeout,
                config.deadline,
            )?
        };

        let waited = served
            .replied
            .await_at_least(u64::from(config.count), config.deadline, "replies")
            .map(|n| (n, start.elapsed()));
        let stats = engine.join();

        let torn_down = engine::teardown(instance, class, ctx, None);
        let ((count, elapsed), stats) = match engine::settle_outcome(waited, stats) {
            Ok(done) => done,
            Err(e) => {
                if let Err(teardown) = torn_down {
                    warn!("{}: {}", instance, teardown);
                }
                return Err(e);
            }
        };
        torn_down?;

        info!("{}: served {} rpcs in {:?}", instance, count, elapsed);
        Ok(ServerReport {
            instance,
            served: count,
            elapsed,
            engine: stats,
        })
    }
}

/// Run one server instance per configured index, each on its own thread.
pub fn run_servers<T: Transport>(
    config: &BenchConfig,
    deadline: Deadline,
) -> Result<Vec<ServerReport>, BenchError> {
    let instances = config.server_instances(deadline)?;
    instance_set::launch(Role::Server, instances, |config| {
        ServerInstance::<T>::init(config)?.run()
    })
}
