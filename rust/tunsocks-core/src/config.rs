use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Relay configuration, immutable for the lifetime of a handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub proxy_host: String,
    pub proxy_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Idle time after which a UDP flow is torn down
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout_secs: u64,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    #[serde(default)]
    pub fake_ip: FakeIpConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeIpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fake_ip_range")]
    pub range: String,
    #[serde(default)]
    pub filter: Vec<String>,
}

impl Default for FakeIpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            range: default_fake_ip_range(),
            filter: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatsConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Debug,
    Silent,
}

fn default_udp_timeout() -> u64 {
    30
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_fake_ip_range() -> String {
    tunsocks_dns::DEFAULT_FAKE_IP_RANGE.to_string()
}

impl RelayConfig {
    /// Minimal configuration pointing at `host:port` with default timeouts
    pub fn new<S: Into<String>>(proxy_host: S, proxy_port: u16) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            proxy_port,
            username: None,
            password: None,
            udp_timeout_secs: default_udp_timeout(),
            dial_timeout_secs: default_dial_timeout(),
            fake_ip: FakeIpConfig::default(),
            stats: StatsConfig::default(),
            log_level: LogLevel::default(),
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::config_with_source("Failed to parse relay configuration", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config_with_source(format!("Failed to read {}", path.display()), e)
        })?;
        let config = Self::from_yaml_str(&content)?;
        tracing::info!("Configuration loaded from: {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxy_host.trim().is_empty() {
            return Err(Error::config("proxy_host cannot be empty"));
        }
        if self.proxy_port == 0 {
            return Err(Error::config(
                "Invalid proxy_port: must be between 1 and 65535",
            ));
        }
        if self.udp_timeout_secs == 0 {
            return Err(Error::config("udp_timeout_secs must be greater than 0"));
        }
        if self.dial_timeout_secs == 0 {
            return Err(Error::config("dial_timeout_secs must be greater than 0"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::config(
                "username and password must be configured together",
            ));
        }
        for (field, value) in [("username", &self.username), ("password", &self.password)] {
            if value.as_ref().is_some_and(|v| v.is_empty() || v.len() > 255) {
                return Err(Error::config(format!(
                    "{} must be between 1 and 255 bytes",
                    field
                )));
            }
        }
        if self.fake_ip.enabled {
            self.fake_ip
                .range
                .parse::<ipnet::Ipv4Net>()
                .map_err(|e| Error::config_with_source("Invalid fake_ip.range", e))?;
        }
        Ok(())
    }

    /// Proxy address in `host:port` form, with IPv6 literals bracketed
    pub fn proxy_addr(&self) -> String {
        crate::conn::join_host_port(&self.proxy_host, self.proxy_port)
    }

    pub fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Build the Fake-IP pool if Fake-IP mode is enabled
    pub fn build_fake_ip_pool(&self) -> Result<Option<tunsocks_dns::FakeIpPool>> {
        if !self.fake_ip.enabled {
            return Ok(None);
        }
        let pool = tunsocks_dns::FakeIpPool::new(&self.fake_ip.range, self.fake_ip.filter.clone())?;
        Ok(Some(pool))
    }
}
