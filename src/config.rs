use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::input::InputConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/netrecond.conf";

const ENV_PREFIX: &str = "NETRECON_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Capture interface; `None` picks the first usable one.
    pub interface: Option<String>,
    pub queue_depth: usize,
    /// Dispatcher workers; 0 uses the available parallelism.
    pub workers: usize,
    pub worker_queue_depth: usize,
    pub conntrack_timeout: Duration,
    pub expiry_interval: Duration,
    pub max_stack_depth: usize,
    pub max_conntracks: usize,
    pub payload_max_bytes: u64,
    pub input_retry_delay: Duration,
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interface: None,
            queue_depth: 1024,
            workers: 0,
            worker_queue_depth: 256,
            conntrack_timeout: Duration::from_secs(120),
            expiry_interval: Duration::from_secs(5),
            max_stack_depth: 16,
            max_conntracks: 65536,
            payload_max_bytes: 256 * 1024 * 1024,
            input_retry_delay: Duration::ZERO,
            log_filter: "info".to_string(),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

const KEYS: [&str; 11] = [
    "interface",
    "queue_depth",
    "workers",
    "worker_queue_depth",
    "conntrack_timeout_secs",
    "expiry_interval_secs",
    "max_stack_depth",
    "max_conntracks",
    "payload_max_bytes",
    "input_retry_delay_ms",
    "log_filter",
];

impl EngineConfig {
    /// Read `path` if it exists, then apply `NETRECON_*` environment
    /// overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = EngineConfig::default();

        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    config.apply(key.trim(), value.trim())?;
                }
            }
        }

        // Allow environment variable overrides
        for key in KEYS {
            if let Ok(value) = std::env::var(format!("{}{}", ENV_PREFIX, key.to_uppercase())) {
                config.apply(key, value.trim())?;
            }
        }

        Ok(config)
    }

    /// Set one key. Unknown keys are ignored.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "interface" => {
                self.interface = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "queue_depth" => self.queue_depth = parse(key, value)?,
            "workers" => self.workers = parse(key, value)?,
            "worker_queue_depth" => self.worker_queue_depth = parse(key, value)?,
            "conntrack_timeout_secs" => {
                self.conntrack_timeout = Duration::from_secs(parse(key, value)?)
            }
            "expiry_interval_secs" => {
                self.expiry_interval = Duration::from_secs(parse(key, value)?)
            }
            "max_stack_depth" => self.max_stack_depth = parse(key, value)?,
            "max_conntracks" => self.max_conntracks = parse(key, value)?,
            "payload_max_bytes" => self.payload_max_bytes = parse(key, value)?,
            "input_retry_delay_ms" => {
                self.input_retry_delay = Duration::from_millis(parse(key, value)?)
            }
            "log_filter" => self.log_filter = value.to_string(),
            _ => {}
        }
        Ok(())
    }

    /// Worker count with 0 resolved to the available parallelism.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn input(&self) -> InputConfig {
        InputConfig {
            capacity: self.queue_depth,
            retry_delay: self.input_retry_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(format!("{}{}", ENV_PREFIX, key.to_uppercase()));
        }
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        clear_env();
        let config = EngineConfig::load(Path::new("/nonexistent/netrecond.conf")).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.conntrack_timeout, Duration::from_secs(120));
        assert_eq!(config.payload_max_bytes, 268435456);
    }

    #[test]
    #[serial]
    fn test_file_values() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# capture settings").unwrap();
        writeln!(file, "interface = eth1").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "workers=2").unwrap();
        writeln!(file, "conntrack_timeout_secs = 30").unwrap();
        writeln!(file, "input_retry_delay_ms = 250").unwrap();
        writeln!(file, "colour = blue").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.interface.as_deref(), Some("eth1"));
        assert_eq!(config.workers, 2);
        assert_eq!(config.effective_workers(), 2);
        assert_eq!(config.conntrack_timeout, Duration::from_secs(30));
        assert_eq!(config.input().retry_delay, Duration::from_millis(250));
        assert_eq!(config.max_stack_depth, 16);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "queue_depth = 10").unwrap();
        std::env::set_var("NETRECON_QUEUE_DEPTH", "20");
        std::env::set_var("NETRECON_LOG_FILTER", "netrecon=debug");

        let config = EngineConfig::load(file.path());
        clear_env();
        let config = config.unwrap();
        assert_eq!(config.queue_depth, 20);
        assert_eq!(config.log_filter, "netrecon=debug");
    }

    #[test]
    #[serial]
    fn test_invalid_number() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_conntracks = lots").unwrap();
        match EngineConfig::load(file.path()) {
            Err(ConfigError::InvalidValue { key, value }) => {
                assert_eq!(key, "max_conntracks");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
