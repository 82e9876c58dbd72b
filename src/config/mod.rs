use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::BenchError;

pub const BASE_PORT: u16 = 19900;
pub const DEFAULT_COUNT: u32 = 5;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

const PORT_PLACEHOLDER: &str = "%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    /// Every call is issued before waiting on any reply.
    #[default]
    Parallel,
    /// At most one call in flight.
    Serial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// Point in time after which every wait in a run gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BenchConfig {
    pub instances: usize,
    pub local_spec: String,
    pub remote_spec: Option<String>,
    pub base_port: u16,
    pub count: u32,
    pub send_mode: SendMode,
    pub quiet: bool,
    pub timeout_secs: u64,
    pub resolve_timeout_ms: u64,
    pub progress_timeout_ms: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            instances: 1,
            local_spec: "tcp://127.0.0.1:%d".to_string(),
            remote_spec: None,
            base_port: BASE_PORT,
            count: DEFAULT_COUNT,
            send_mode: SendMode::Parallel,
            quiet: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            resolve_timeout_ms: 10_000,
            progress_timeout_ms: 100,
        }
    }
}

impl BenchConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BenchError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| BenchError::ConfigFile {
            path: path.display().to_string(),
            source,
        })?;
        let config: BenchConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Overlay `COUNT`, `SERIALSEND` and `QUIET`. `var` is `std::env::var`
    /// in the binaries.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = var("COUNT") {
            // anything that is not a positive number means "use the default"
            self.count = match raw.trim().parse::<i64>() {
                Ok(n) if n > 0 && n <= i64::from(i32::MAX) => n as u32,
                _ => DEFAULT_COUNT,
            };
        }
        if var("SERIALSEND").is_some() {
            self.send_mode = SendMode::Serial;
        }
        if var("QUIET").is_some() {
            self.quiet = true;
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), BenchError> {
        if self.instances == 0 {
            return Err(BenchError::Config("instance count must be positive".into()));
        }
        if self.count == 0 || self.count > i32::MAX as u32 {
            return Err(BenchError::Config(format!(
                "exchange count {} out of range",
                self.count
            )));
        }
        if self.progress_timeout_ms == 0 {
            return Err(BenchError::Config("progress timeout must be positive".into()));
        }
        fill_port(&self.local_spec, self.base_port)?;
        if let Some(remote) = &self.remote_spec {
            fill_port(remote, self.base_port)?;
        }
        // the highest port handed out is the last client's local port
        let highest = self
            .instances
            .checked_mul(2)
            .ok_or_else(|| BenchError::Config(format!("instance count {} is too large", self.instances)))?;
        port_at(self.base_port, highest - 1)?;
        Ok(())
    }

    pub fn server_instances(&self, deadline: Deadline) -> Result<Vec<InstanceConfig>, BenchError> {
        self.validate()?;
        (0..self.instances)
            .map(|index| {
                let local = fill_port(&self.local_spec, port_at(self.base_port, index)?)?;
                Ok(self.instance(Role::Server, index, local, None, deadline))
            })
            .collect()
    }

    pub fn client_instances(&self, deadline: Deadline) -> Result<Vec<InstanceConfig>, BenchError> {
        self.validate()?;
        let remote_spec = self
            .remote_spec
            .as_deref()
            .ok_or_else(|| BenchError::Config("client needs a remote address template".into()))?;

        (0..self.instances)
            .map(|index| {
                // stay clear of the ports the server side listens on
                let local_port = port_at(self.base_port, self.instances + index)?;
                let local = fill_port(&self.local_spec, local_port)?;
                let remote = fill_port(remote_spec, port_at(self.base_port, index)?)?;
                Ok(self.instance(Role::Client, index, local, Some(remote), deadline))
            })
            .collect()
    }

    fn instance(
        &self,
        role: Role,
        index: usize,
        local_endpoint: String,
        remote_endpoint: Option<String>,
        deadline: Deadline,
    ) -> InstanceConfig {
        InstanceConfig {
            role,
            index,
            instances: self.instances,
            local_endpoint,
            remote_endpoint,
            count: self.count,
            send_mode: self.send_mode,
            quiet: self.quiet,
            deadline,
            resolve_timeout: Duration::from_millis(self.resolve_timeout_ms),
            progress_timeout: Duration::from_millis(self.progress_timeout_ms),
        }
    }
}

/// Everything one instance needs, fixed before its threads start.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub role: Role,
    pub index: usize,
    pub instances: usize,
    pub local_endpoint: String,
    pub remote_endpoint: Option<String>,
    pub count: u32,
    pub send_mode: SendMode,
    pub quiet: bool,
    pub deadline: Deadline,
    pub resolve_timeout: Duration,
    pub progress_timeout: Duration,
}

impl InstanceConfig {
    /// Both sides of instance `n` agree on the method name `f<n>`.
    pub fn method_name(&self) -> String {
        format!("f{}", self.index)
    }
}

/// Substitute the single `%d` in an address template.
pub fn fill_port(template: &str, port: u16) -> Result<String, BenchError> {
    if template.matches(PORT_PLACEHOLDER).count() != 1 {
        return Err(BenchError::Config(format!(
            "address template {:?} must contain exactly one {}",
            template, PORT_PLACEHOLDER
        )));
    }
    Ok(template.replacen(PORT_PLACEHOLDER, &port.to_string(), 1))
}

fn port_at(base: u16, offset: usize) -> Result<u16, BenchError> {
    u16::try_from(offset)
        .ok()
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(|| BenchError::Config(format!("port {} + {} is out of range", base, offset)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn client_config(instances: usize) -> BenchConfig {
        BenchConfig {
            instances,
            local_spec: "bmi+tcp://10.93.1.146:%d".into(),
            remote_spec: Some("bmi+tcp://10.93.1.154:%d".into()),
            ..BenchConfig::default()
        }
    }

    #[test]
    fn fill_port_replaces_placeholder() {
        assert_eq!(
            fill_port("cci+tcp://10.0.0.1:%d", 19900).unwrap(),
            "cci+tcp://10.0.0.1:19900"
        );
    }

    #[test]
    fn fill_port_rejects_missing_or_repeated_placeholder() {
        assert!(fill_port("tcp://10.0.0.1:19900", 1).is_err());
        assert!(fill_port("tcp://%d:%d", 1).is_err());
    }

    #[test]
    fn client_ports_are_offset_by_instance_count() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let instances = client_config(2).client_instances(deadline).unwrap();

        assert_eq!(instances[0].local_endpoint, "bmi+tcp://10.93.1.146:19902");
        assert_eq!(instances[0].remote_endpoint.as_deref(), Some("bmi+tcp://10.93.1.154:19900"));
        assert_eq!(instances[1].local_endpoint, "bmi+tcp://10.93.1.146:19903");
        assert_eq!(instances[1].remote_endpoint.as_deref(), Some("bmi+tcp://10.93.1.154:19901"));
        assert_eq!(instances[1].method_name(), "f1");
    }

    #[test]
    fn server_ports_start_at_base() {
        let config = BenchConfig {
            instances: 2,
            base_port: 20000,
            ..BenchConfig::default()
        };
        let instances = config
            .server_instances(Deadline::after(Duration::from_secs(1)))
            .unwrap();
        let locals: Vec<_> = instances.iter().map(|i| i.local_endpoint.as_str()).collect();
        assert_eq!(locals, ["tcp://127.0.0.1:20000", "tcp://127.0.0.1:20001"]);
        assert!(instances.iter().all(|i| i.remote_endpoint.is_none()));
    }

    #[test]
    fn client_without_remote_template_is_rejected() {
        let config = BenchConfig::default();
        let err = config
            .client_instances(Deadline::after(Duration::from_secs(1)))
            .unwrap_err();
        assert!(matches!(err, BenchError::Config(_)));
    }

    #[test]
    fn env_overlay_follows_count_rules() {
        let mut config = BenchConfig::default();
        config.apply_env(env(&[("COUNT", "12"), ("SERIALSEND", ""), ("QUIET", "1")]));
        assert_eq!(config.count, 12);
        assert_eq!(config.send_mode, SendMode::Serial);
        assert!(config.quiet);

        for bad in ["0", "-4", "lots"] {
            let mut config = BenchConfig {
                count: 40,
                ..BenchConfig::default()
            };
            config.apply_env(env(&[("COUNT", bad)]));
            assert_eq!(config.count, DEFAULT_COUNT, "COUNT={bad}");
        }
    }

    #[test]
    fn unset_env_leaves_config_alone() {
        let mut config = BenchConfig {
            count: 9,
            ..BenchConfig::default()
        };
        config.apply_env(env(&[]));
        assert_eq!(config.count, 9);
        assert_eq!(config.send_mode, SendMode::Parallel);
        assert!(!config.quiet);
    }

    #[test]
    fn parses_toml_with_defaults() {
        let config: BenchConfig = toml::from_str(
            r#"
            instances = 4
            remote_spec = "tcp://10.0.0.2:%d"
            send_mode = "serial"
            count = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.instances, 4);
        assert_eq!(config.send_mode, SendMode::Serial);
        assert_eq!(config.count, 100);
        assert_eq!(config.base_port, BASE_PORT);
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn port_overflow_is_a_config_error() {
        let config = BenchConfig {
            instances: 10,
            base_port: u16::MAX - 3,
            ..client_config(10)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn absurd_instance_count_is_a_config_error() {
        let config = BenchConfig {
            instances: usize::MAX / 2 + 1,
            ..client_config(1)
        };
        assert!(matches!(config.validate(), Err(BenchError::Config(_))));
    }

    #[test]
    fn deadline_in_the_past_is_expired() {
        assert!(Deadline::at(Instant::now()).expired());
        assert!(!Deadline::after(Duration::from_secs(60)).expired());
    }
}
