use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sharebox_crypto::KdfParams;
use sharebox_transfer::DEFAULT_BUFFER_SIZE;

use crate::session::ConnectionOptions;

/// Ports outside this open range are refused.
pub const PORT_RANGE: (u16, u16) = (1024, 49151);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("port {0} is outside {min}..{max}", min = PORT_RANGE.0, max = PORT_RANGE.1)]
    PortOutOfRange(u16),
}

/// What to do when no integrity tags exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityPolicy {
    Enforce,
    Disable,
    /// Ask the operator on stdin.
    Prompt,
}

impl FromStr for IntegrityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enforce" => Ok(Self::Enforce),
            "disable" => Ok(Self::Disable),
            "prompt" => Ok(Self::Prompt),
            other => Err(format!("expected enforce, disable or prompt, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub keys_dir: PathBuf,
    pub buffer_size: usize,
    /// `None` disables socket timeouts.
    pub socket_timeout: Option<Duration>,
    /// `None` allows unlimited password attempts.
    pub max_auth_attempts: Option<u32>,
    pub integrity: IntegrityPolicy,
    pub admin_passphrase: Option<String>,
    pub kdf: KdfParams,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 12345,
            data_dir: "./server_files".into(),
            keys_dir: "./keystore".into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            socket_timeout: Some(Duration::from_secs(300)),
            max_auth_attempts: None,
            integrity: IntegrityPolicy::Prompt,
            admin_passphrase: None,
            kdf: KdfParams::default(),
        }
    }
}

impl ServerConfig {
    /// Read `SHAREBOX_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from any variable source. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(host) = lookup("SHAREBOX_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_var(&lookup, "SHAREBOX_PORT")? {
            config.port = port;
        }
        if let Some(dir) = lookup("SHAREBOX_DATA_DIR") {
            config.data_dir = dir.into();
        }
        if let Some(dir) = lookup("SHAREBOX_KEYS_DIR") {
            config.keys_dir = dir.into();
        }
        if let Some(size) = parse_var::<usize>(&lookup, "SHAREBOX_BUFFER_SIZE")? {
            if size == 0 {
                return Err(invalid("SHAREBOX_BUFFER_SIZE", "0", "must be positive"));
            }
            config.buffer_size = size;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "SHAREBOX_SOCKET_TIMEOUT_SECS")? {
            config.socket_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(max) = parse_var::<u32>(&lookup, "SHAREBOX_MAX_AUTH_ATTEMPTS")? {
            config.max_auth_attempts = (max > 0).then_some(max);
        }
        if let Some(policy) = lookup("SHAREBOX_INTEGRITY") {
            config.integrity = policy
                .parse()
                .map_err(|reason| invalid("SHAREBOX_INTEGRITY", &policy, reason))?;
        }
        config.admin_passphrase = lookup("SHAREBOX_ADMIN_PASSPHRASE").filter(|p| !p.is_empty());
        if let Some(memory) = parse_var(&lookup, "SHAREBOX_KDF_MEMORY_KIB")? {
            config.kdf.memory_kib = memory;
        }
        if let Some(iterations) = parse_var(&lookup, "SHAREBOX_KDF_ITERATIONS")? {
            config.kdf.iterations = iterations;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port <= PORT_RANGE.0 || self.port >= PORT_RANGE.1 {
            return Err(ConfigError::PortOutOfRange(self.port));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            buffer_size: self.buffer_size,
            socket_timeout: self.socket_timeout,
            max_auth_attempts: self.max_auth_attempts,
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid { var, value: value.to_string(), reason: reason.to_string() }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|e: T::Err| invalid(var, &value, e)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ServerConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = config(&[]).unwrap();
        assert_eq!(config.port, 12345);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.integrity, IntegrityPolicy::Prompt);
        assert_eq!(config.max_auth_attempts, None);
        assert_eq!(config.bind_addr(), "0.0.0.0:12345");
    }

    #[test]
    fn overrides_are_applied() {
        let config = config(&[
            ("SHAREBOX_PORT", "23456"),
            ("SHAREBOX_BUFFER_SIZE", "4096"),
            ("SHAREBOX_SOCKET_TIMEOUT_SECS", "0"),
            ("SHAREBOX_MAX_AUTH_ATTEMPTS", "3"),
            ("SHAREBOX_INTEGRITY", "Enforce"),
            ("SHAREBOX_KDF_ITERATIONS", "5"),
        ])
        .unwrap();
        assert_eq!(config.port, 23456);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.socket_timeout, None);
        assert_eq!(config.max_auth_attempts, Some(3));
        assert_eq!(config.integrity, IntegrityPolicy::Enforce);
        assert_eq!(config.kdf.iterations, 5);
    }

    #[test]
    fn port_range_is_exclusive() {
        assert!(matches!(config(&[("SHAREBOX_PORT", "1024")]), Err(ConfigError::PortOutOfRange(1024))));
        assert!(matches!(config(&[("SHAREBOX_PORT", "49151")]), Err(ConfigError::PortOutOfRange(49151))));
        assert!(config(&[("SHAREBOX_PORT", "1025")]).is_ok());
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = config(&[("SHAREBOX_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("SHAREBOX_PORT"));
        assert!(config(&[("SHAREBOX_INTEGRITY", "maybe")]).is_err());
        assert!(config(&[("SHAREBOX_BUFFER_SIZE", "0")]).is_err());
    }
}
