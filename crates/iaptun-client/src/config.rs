//! Tunnel manager configuration

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::Duration;

/// Default local port range. Kept below the ephemeral port range so that
/// short-lived outbound connections do not collide with tunnel listeners.
pub const DEFAULT_PORT_RANGE: Range<u16> = 10000..49000;

/// Tunnel manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// First candidate local port (inclusive)
    pub port_range_start: u16,
    /// Last candidate local port (exclusive)
    pub port_range_end: u16,
    /// Command used to launch the tunnel helper (Cloud SDK)
    pub helper_program: String,
    /// How many times the helper's port is polled within the connect timeout
    pub helper_poll_attempts: u32,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            port_range_start: DEFAULT_PORT_RANGE.start,
            port_range_end: DEFAULT_PORT_RANGE.end,
            helper_program: default_helper_program().to_string(),
            helper_poll_attempts: 10,
            connect_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

fn default_helper_program() -> &'static str {
    if cfg!(windows) {
        "gcloud.cmd"
    } else {
        "gcloud"
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    pub fn port_range(&self) -> Range<u16> {
        self.port_range_start..self.port_range_end
    }
}

/// Builder for TunnelConfig
#[derive(Default)]
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
}

impl TunnelConfigBuilder {
    pub fn port_range(mut self, range: Range<u16>) -> Self {
        self.config.port_range_start = range.start;
        self.config.port_range_end = range.end;
        self
    }

    pub fn helper_program(mut self, program: impl Into<String>) -> Self {
        self.config.helper_program = program.into();
        self
    }

    pub fn helper_poll_attempts(mut self, attempts: u32) -> Self {
        self.config.helper_poll_attempts = attempts;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<TunnelConfig, String> {
        if self.config.port_range_start >= self.config.port_range_end {
            return Err(format!(
                "port range {}-{} is empty",
                self.config.port_range_start, self.config.port_range_end
            ));
        }
        if self.config.helper_program.trim().is_empty() {
            return Err("helper_program must not be empty".to_string());
        }
        if self.config.helper_poll_attempts == 0 {
            return Err("helper_poll_attempts must be at least 1".to_string());
        }
        if self.config.connect_timeout.is_zero() {
            return Err("connect_timeout must be greater than zero".to_string());
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TunnelConfig::default();
        assert_eq!(config.port_range(), 10000..49000);
        assert_eq!(config.helper_poll_attempts, 10);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = TunnelConfig::builder()
            .port_range(20000..20100)
            .helper_program("/opt/google-cloud-sdk/bin/gcloud")
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(config.port_range(), 20000..20100);
        assert_eq!(config.helper_program, "/opt/google-cloud-sdk/bin/gcloud");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_builder_empty_range() {
        let result = TunnelConfig::builder().port_range(20000..20000).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_builder_zero_poll_attempts() {
        let result = TunnelConfig::builder().helper_poll_attempts(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = TunnelConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["connect_timeout"], 30);

        let partial: TunnelConfig =
            serde_json::from_str(r#"{"helper_program": "gcloud-beta", "probe_timeout": 3}"#)
                .unwrap();
        assert_eq!(partial.helper_program, "gcloud-beta");
        assert_eq!(partial.probe_timeout, Duration::from_secs(3));
        assert_eq!(partial.port_range(), DEFAULT_PORT_RANGE);
    }
}
