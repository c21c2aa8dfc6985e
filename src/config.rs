use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: String,
    pub bind_port: u16,
    pub max_frame_bytes: usize,
    pub cancel_timeout: Duration,
    pub outbound_queue: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("RPC_BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("RPC_MAX_FRAME_BYTES must be a positive integer")]
    InvalidMaxFrameBytes,
    #[error("RPC_CANCEL_TIMEOUT_MS must be a positive integer")]
    InvalidCancelTimeout,
    #[error("RPC_OUTBOUND_QUEUE must be a positive integer")]
    InvalidOutboundQueue,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 7070,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_addr = env::var("RPC_BIND_ADDR")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.bind_addr);
        let bind_port = env::var("RPC_BIND_PORT")
            .ok()
            .map(|value| value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(defaults.bind_port);
        let max_frame_bytes = positive_var("RPC_MAX_FRAME_BYTES", ConfigError::InvalidMaxFrameBytes)?
            .map(|value| value as usize)
            .unwrap_or(defaults.max_frame_bytes);
        let cancel_timeout = positive_var("RPC_CANCEL_TIMEOUT_MS", ConfigError::InvalidCancelTimeout)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.cancel_timeout);
        let outbound_queue = positive_var("RPC_OUTBOUND_QUEUE", ConfigError::InvalidOutboundQueue)?
            .map(|value| value as usize)
            .unwrap_or(defaults.outbound_queue);

        let config = Self {
            bind_addr,
            bind_port,
            max_frame_bytes,
            cancel_timeout,
            outbound_queue,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

fn positive_var(name: &str, error: ConfigError) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(parsed) if parsed > 0 => Ok(Some(parsed)),
            _ => Err(error),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Every scenario lives in one test: the variables are process-global and
    // the test harness runs tests in parallel.
    #[test]
    fn parse_from_environment() {
        for name in [
            "RPC_BIND_ADDR",
            "RPC_BIND_PORT",
            "RPC_MAX_FRAME_BYTES",
            "RPC_CANCEL_TIMEOUT_MS",
            "RPC_OUTBOUND_QUEUE",
        ] {
            env::remove_var(name);
        }

        let config = Config::from_env().expect("defaults should parse");
        assert_eq!(config, Config::default());
        assert_eq!(
            config.bind_socket().expect("default socket").to_string(),
            "127.0.0.1:7070"
        );

        env::set_var("RPC_BIND_ADDR", "0.0.0.0");
        env::set_var("RPC_BIND_PORT", "9000");
        env::set_var("RPC_CANCEL_TIMEOUT_MS", "250");
        let config = Config::from_env().expect("overrides should parse");
        assert_eq!(config.bind_addr, "0.0.0.0");
        assert_eq!(config.bind_port, 9000);
        assert_eq!(config.cancel_timeout, Duration::from_millis(250));

        env::set_var("RPC_BIND_PORT", "70000");
        let err = Config::from_env().expect_err("port out of range");
        assert!(matches!(err, ConfigError::InvalidPort));
        env::remove_var("RPC_BIND_PORT");

        env::set_var("RPC_MAX_FRAME_BYTES", "0");
        let err = Config::from_env().expect_err("zero frame size");
        assert!(matches!(err, ConfigError::InvalidMaxFrameBytes));
        env::remove_var("RPC_MAX_FRAME_BYTES");

        env::set_var("RPC_OUTBOUND_QUEUE", "lots");
        let err = Config::from_env().expect_err("non-numeric queue depth");
        assert!(matches!(err, ConfigError::InvalidOutboundQueue));
        env::remove_var("RPC_OUTBOUND_QUEUE");

        env::set_var("RPC_BIND_ADDR", "not an address");
        let err = Config::from_env().expect_err("bad bind address");
        assert!(matches!(err, ConfigError::InvalidSocket));

        env::remove_var("RPC_BIND_ADDR");
        env::remove_var("RPC_CANCEL_TIMEOUT_MS");
    }
}
