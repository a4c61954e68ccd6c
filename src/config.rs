use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: &str = "9512";

/// Connection and pacing settings for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: String,
    /// How long to wait for the TCP connect to complete.
    pub connect_timeout: Duration,
    /// Budget of the blocking request helpers.
    pub request_timeout: Duration,
    /// Sleep between pumps while a blocking helper waits.
    pub pump_interval: Duration,
    /// Frames larger than this are treated as a broken stream.
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT.to_string(),
            connect_timeout: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(1000),
            pump_interval: Duration::from_millis(1),
            max_frame_len: 1 << 20,
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with `PSM_*` environment variables.
    ///
    /// Recognized: `PSM_HOST`, `PSM_PORT`, `PSM_CONNECT_TIMEOUT_MS`,
    /// `PSM_REQUEST_TIMEOUT_MS`, `PSM_PUMP_INTERVAL_MS`. Unparseable values
    /// keep the default.
    pub fn from_env() -> Self {
        let defaults = ClientConfig::default();
        let config = ClientConfig {
            host: read_env_string("PSM_HOST", &defaults.host),
            port: read_env_string("PSM_PORT", &defaults.port),
            connect_timeout: read_env_millis("PSM_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            request_timeout: read_env_millis("PSM_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            pump_interval: read_env_millis("PSM_PUMP_INTERVAL_MS", defaults.pump_interval),
            max_frame_len: defaults.max_frame_len,
        };
        log::debug!("Client config: {:?}", config);
        config
    }

    pub fn with_endpoint(mut self, host: &str, port: &str) -> Self {
        self.host = host.to_string();
        self.port = port.to_string();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn read_env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, "9512");
        assert_eq!(cfg.request_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_env_overrides_and_fallbacks() {
        std::env::set_var("PSM_TEST_CFG_MS", "250");
        assert_eq!(
            read_env_millis("PSM_TEST_CFG_MS", Duration::from_millis(5)),
            Duration::from_millis(250)
        );
        std::env::set_var("PSM_TEST_CFG_MS", "soon");
        assert_eq!(
            read_env_millis("PSM_TEST_CFG_MS", Duration::from_millis(5)),
            Duration::from_millis(5)
        );
        std::env::set_var("PSM_TEST_CFG_HOST", "  ");
        assert_eq!(read_env_string("PSM_TEST_CFG_HOST", "localhost"), "localhost");
        std::env::remove_var("PSM_TEST_CFG_MS");
        std::env::remove_var("PSM_TEST_CFG_HOST");
    }

    #[test]
    fn test_builders() {
        let cfg = ClientConfig::default()
            .with_endpoint("10.0.0.2", "9000")
            .with_request_timeout(Duration::from_millis(20));
        assert_eq!(cfg.host, "10.0.0.2");
        assert_eq!(cfg.port, "9000");
        assert_eq!(cfg.request_timeout, Duration::from_millis(20));
    }
}
