use std::thread;
use tracing::{error, info};

use crate::config::{InstanceConfig, Role};
use crate::error::BenchError;

/// Run every instance on its own named thread and wait for all of them.
///
/// Every thread is joined even after a failure; the first error by instance
/// index is returned.
pub fn launch<R, F>(role: Role, configs: Vec<InstanceConfig>, run: F) -> Result<Vec<R>, BenchError>
where
    R: Send,
    F: Fn(InstanceConfig) -> Result<R, BenchError> + Sync,
{
    let role = role.as_str();
    info!("main: starting {} {} instances", configs.len(), role);

    let outcomes: Vec<Result<R, BenchError>> = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(configs.len());
        for config in configs {
            let index = config.index;
            let run = &run;
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", role, index))
                .spawn_scoped(scope, move || run(config));
            handles.push((index, spawned));
        }

        info!("main: collecting");
        handles
            .into_iter()
            .map(|(instance, spawned)| match spawned {
                Ok(handle) => handle
                    .join()
                    .unwrap_or(Err(BenchError::Panicked { instance, role })),
                Err(e) => Err(BenchError::Spawn(e)),
            })
            .collect()
    });
    info!("main: collection done");

    let mut reports = Vec::with_capacity(outcomes.len());
    let mut first_failure = None;
    for outcome in outcomes {
        match outcome {
            Ok(report) => reports.push(report),
            Err(e) => {
                match e.instance() {
                    Some(instance) => error!("main: {} {} failed: {}", role, instance, e),
                    None => error!("main: {} failed: {}", role, e),
                }
                first_failure.get_or_insert(e);
            }
        }
    }

    match first_failure {
        Some(e) => Err(e),
        None => Ok(reports),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BenchConfig, Deadline};
    use std::time::Duration;

    fn servers(n: usize) -> Vec<InstanceConfig> {
        let config = BenchConfig {
            instances: n,
            ..BenchConfig::default()
        };
        config
            .server_instances(Deadline::after(Duration::from_secs(5)))
            .unwrap()
    }

    #[test]
    fn runs_each_instance_on_a_named_thread() {
        let mut names = launch(Role::Server, servers(3), |config| {
            let name = thread::current().name().map(str::to_string);
            Ok((config.index, name))
        })
        .unwrap();
        names.sort();

        assert_eq!(
            names,
            vec![
                (0, Some("server-0".to_string())),
                (1, Some("server-1".to_string())),
                (2, Some("server-2".to_string())),
            ]
        );
    }

    #[test]
    fn first_failure_is_returned_after_all_join() {
        let finished = std::sync::atomic::AtomicUsize::new(0);
        let err = launch(Role::Client, servers(3), |config| {
            finished.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if config.index == 0 {
                Ok(())
            } else {
                Err(BenchError::EngineStopped {
                    instance: config.index,
                })
            }
        })
        .unwrap_err();

        assert!(matches!(err, BenchError::EngineStopped { instance: 1 }));
        assert_eq!(finished.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_instance_is_reported() {
        let err = launch(Role::Server, servers(2), |config| {
            if config.index == 1 {
                panic!("instance blew up");
            }
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(
            err,
            BenchError::Panicked {
                instance: 1,
                role: "server"
            }
        ));
    }
}
