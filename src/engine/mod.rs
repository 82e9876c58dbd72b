//! Per-instance machinery shared by clients and servers: the completion
//! counter, the progress thread, and the blocking address lookup.

mod counter;
mod progress;
mod resolve;

pub use counter::{CompletionCounter, Wake};
pub use progress::{EngineStats, ProgressEngine};
pub use resolve::resolve;

use std::sync::Arc;
use tracing::debug;

use crate::error::{BenchError, TransportError};
use crate::transport::{Context, PeerAddr, Transport};

/// Free the peer (if any), destroy the context, finalize the class, in that
/// order. Must only run after the progress engine has been joined.
pub fn teardown<T: Transport>(
    instance: usize,
    class: T,
    ctx: Arc<T::Context>,
    peer: Option<PeerAddr>,
) -> Result<(), BenchError> {
    let step = move |op: &'static str| move |source: TransportError| BenchError::Teardown { instance, op, source };

    if let Some(peer) = peer {
        debug!("{}: freeing {}", instance, peer.label());
        ctx.free_address(peer).map_err(step("free address"))?;
    }
    let ctx = Arc::try_unwrap(ctx).map_err(|_| step("destroy context")(TransportError::ContextInUse))?;
    ctx.destroy().map_err(step("destroy context"))?;
    class.finalize().map_err(step("finalize"))?;
    Ok(())
}

/// Combine what the control thread saw with how the progress thread ended.
/// When the control side only saw the engine stop, the engine's own error
/// is the one worth reporting.
pub fn settle_outcome<R>(
    control: Result<R, BenchError>,
    engine: Result<EngineStats, BenchError>,
) -> Result<(R, EngineStats), BenchError> {
    match (control, engine) {
        (Err(BenchError::EngineStopped { .. }), Err(real)) => Err(real),
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Ok(r), Ok(stats)) => Ok((r, stats)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_replaces_engine_stopped() {
        let out = settle_outcome::<()>(
            Err(BenchError::EngineStopped { instance: 0 }),
            Err(BenchError::Progress {
                instance: 0,
                source: TransportError::Disconnected,
            }),
        );
        assert!(matches!(out, Err(BenchError::Progress { .. })));
    }

    #[test]
    fn control_error_wins_otherwise() {
        let out = settle_outcome::<()>(
            Err(BenchError::Timeout {
                instance: 1,
                what: "replies",
                count: 0,
                threshold: 2,
            }),
            Ok(EngineStats::default()),
        );
        assert!(matches!(out, Err(BenchError::Timeout { instance: 1, .. })));

        let (value, stats) = settle_outcome(Ok(7), Ok(EngineStats::default())).unwrap();
        assert_eq!((value, stats.triggered), (7, 0));
    }
}
