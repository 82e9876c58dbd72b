use clap::Args;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::BenchConfig;
use crate::error::BenchError;

const DEFAULT_FILTER: &str = "sndrcv=info,warn";

/// Options shared by both binaries.
#[derive(Debug, Args)]
pub struct CommonArgs {
    /// TOML file with defaults; positional arguments and the environment
    /// override it.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// First port; instance n uses base + n on the server side.
    #[arg(short = 'p', long)]
    pub base_port: Option<u16>,

    /// Give up on the whole run after this many seconds.
    #[arg(short, long)]
    pub timeout_secs: Option<u64>,
}

impl CommonArgs {
    /// Layer the config file, then the command line, then `COUNT`,
    /// `SERIALSEND` and `QUIET`.
    pub fn resolve(
        &self,
        instances: usize,
        local_spec: String,
        remote_spec: Option<String>,
    ) -> Result<BenchConfig, BenchError> {
        let mut config = match &self.config {
            Some(path) => BenchConfig::from_file(path)?,
            None => BenchConfig::default(),
        };
        config.instances = instances;
        config.local_spec = local_spec;
        if remote_spec.is_some() {
            config.remote_spec = remote_spec;
        }
        if let Some(port) = self.base_port {
            config.base_port = port;
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout_secs = secs;
        }
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }
}

/// `RUST_LOG` wins over the built-in filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_overrides_file_defaults() {
        let args = CommonArgs {
            config: None,
            base_port: Some(21000),
            timeout_secs: Some(7),
        };
        let config = args
            .resolve(3, "tcp://127.0.0.1:%d".into(), Some("tcp://127.0.0.1:%d".into()))
            .unwrap();
        assert_eq!(config.instances, 3);
        assert_eq!(config.base_port, 21000);
        assert_eq!(config.timeout_secs, 7);
    }

    #[test]
    fn missing_config_file_is_reported() {
        let args = CommonArgs {
            config: Some(PathBuf::from("/nonexistent/sndrcv.toml")),
            base_port: None,
            timeout_secs: None,
        };
        let err = args.resolve(1, "tcp://127.0.0.1:%d".into(), None).unwrap_err();
        assert!(matches!(err, BenchError::ConfigFile { .. }));
    }
}
