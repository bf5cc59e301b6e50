use serde::Deserialize;
use std::convert::TryFrom;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Configuration for the router and the server hosting it.
///
/// Every field has a default, so an empty configuration is valid. Values are
/// read from an optional `config` file and then from environment variables
/// with the `SWITCHYARD_` prefix (`SWITCHYARD_PORT=8080`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Maximum number of worker threads. Defaults to CPU count * 15.
    pub max_workers: usize,
    /// Keep-alive duration in seconds for idle worker threads. Defaults to 6 seconds.
    pub worker_keep_alive_secs: u64,
    /// Server host address. Defaults to "127.0.0.1".
    pub host: String,
    /// Server port number. Defaults to 3000.
    pub port: u16,
    /// Deadline for each asynchronous phase. Defaults to 10 seconds.
    pub phase_timeout_secs: u64,
    /// Port used when upgrading plain requests to TLS. Defaults to 443.
    pub tls_port: u16,
    /// Where anonymous requests for protected routes are sent.
    pub login_page: Option<String>,
    /// Paths that never require a login (regex).
    pub public_paths: Option<String>,
    /// Paths that require a login (regex).
    pub protected_paths: Option<String>,
    /// Honour `X-Forwarded-Proto` from a TLS-terminating proxy.
    pub trust_forwarded_proto: bool,
    /// Locale used when the client sends no usable `Accept-Language`.
    pub default_locale: String,
    /// Initial slot capacity of each object pool.
    pub pool_capacity: usize,
    /// Largest request body buffered before dispatch. Defaults to 1mb.
    pub max_body_size: usize,
    pub http1_keep_alive: bool,
    pub http1_half_close: bool,
    /// Maximum buffer size for HTTP/1.x requests. Defaults to 512kb (524,288 bytes).
    pub http1_max_buf_size: usize,
    pub http1_pipeline_flush: bool,
    pub http1_writev: bool,
    pub http1_title_case_headers: bool,
    pub http1_preserve_header_case: bool,
    pub http1_only: bool,
    #[cfg(feature = "http2")]
    pub http2_only: bool,
    #[cfg(feature = "http2")]
    pub http2_initial_stream_window_size: Option<u32>,
    #[cfg(feature = "http2")]
    pub http2_initial_connection_window_size: Option<u32>,
    #[cfg(feature = "http2")]
    pub http2_adaptive_window: bool,
    #[cfg(feature = "http2")]
    pub http2_max_frame_size: Option<u32>,
    #[cfg(feature = "http2")]
    pub http2_max_concurrent_streams: Option<u32>,
    #[cfg(feature = "http2")]
    pub http2_max_send_buf_size: usize,
    /// Chance that a phase is delayed before its work runs.
    #[cfg(feature = "fault-injection")]
    pub fault_delay_probability: f64,
    /// Chance that a phase fails instead of running its work.
    #[cfg(feature = "fault-injection")]
    pub fault_failure_probability: f64,
    #[cfg(feature = "fault-injection")]
    pub fault_max_delay_ms: u64,
}

/// Implements conversion from the config crate's Config type to RouterConfig.
impl TryFrom<config::Config> for RouterConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl RouterConfig {
    /// Creates a new RouterConfig from the environment and config file.
    ///
    /// This method will:
    /// 1. Load environment variables from a .env file if present
    /// 2. Load configuration from a "config" file (if it exists)
    /// 3. Override with environment variables prefixed with "SWITCHYARD_"
    ///
    /// # Errors
    /// Returns a ConfigError if configuration loading or parsing fails.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("SWITCHYARD"));

        builder.build()?.try_into()
    }

    /// Converts the worker_keep_alive_secs value into a Duration.
    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_secs(self.worker_keep_alive_secs)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    /// Resolves `host:port` to the address the server binds.
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{} did not resolve to an address", self.host),
                )
            })
    }
}

/// Provides default values for all configuration options.
impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get() * 15,
            worker_keep_alive_secs: 6,
            host: String::from("127.0.0.1"),
            port: 3000,
            phase_timeout_secs: 10,
            tls_port: 443,
            login_page: None,
            public_paths: None,
            protected_paths: None,
            trust_forwarded_proto: true,
            default_locale: String::from("en"),
            pool_capacity: 64,
            max_body_size: 1_048_576, // 1mb
            http1_keep_alive: true,
            http1_half_close: false,
            http1_max_buf_size: 524_288, // 512kb
            http1_pipeline_flush: false,
            http1_writev: true,
            http1_title_case_headers: false,
            http1_preserve_header_case: false,
            http1_only: false,
            #[cfg(feature = "http2")]
            http2_only: false,
            #[cfg(feature = "http2")]
            http2_initial_stream_window_size: None,
            #[cfg(feature = "http2")]
            http2_initial_connection_window_size: None,
            #[cfg(feature = "http2")]
            http2_adaptive_window: false,
            #[cfg(feature = "http2")]
            http2_max_frame_size: None,
            #[cfg(feature = "http2")]
            http2_max_concurrent_streams: None,
            #[cfg(feature = "http2")]
            http2_max_send_buf_size: 524_288, // 512kb
            #[cfg(feature = "fault-injection")]
            fault_delay_probability: 0.0,
            #[cfg(feature = "fault-injection")]
            fault_failure_probability: 0.0,
            #[cfg(feature = "fault-injection")]
            fault_max_delay_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Tests that the default configuration values are set correctly.
    #[test]
    fn test_default_config() {
        let config = RouterConfig::default();
        assert_eq!(config.max_workers, num_cpus::get() * 15);
        assert_eq!(config.port, 3000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.phase_timeout(), Duration::from_secs(10));
        assert_eq!(config.tls_port, 443);
        assert!(config.login_page.is_none());
        assert_eq!(config.max_body_size, 1_048_576);
    }

    /// Tests configuration loading from environment variables.
    /// Verifies that the RouterConfig correctly reads and applies
    /// values from environment variables with the "SWITCHYARD_" prefix,
    /// keeping defaults for everything else.
    #[test]
    fn test_config_from_env() {
        env::set_var("SWITCHYARD_PORT", "9000");
        env::set_var("SWITCHYARD_LOGIN_PAGE", "/login");
        env::set_var("SWITCHYARD_MAX_WORKERS", "4");

        let config = RouterConfig::new().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.login_page.as_deref(), Some("/login"));
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.phase_timeout_secs, 10);

        // Cleanup
        env::remove_var("SWITCHYARD_PORT");
        env::remove_var("SWITCHYARD_LOGIN_PAGE");
        env::remove_var("SWITCHYARD_MAX_WORKERS");
    }

    #[test]
    fn test_socket_addr() {
        let config = RouterConfig {
            port: 8123,
            ..RouterConfig::default()
        };
        assert_eq!(config.socket_addr().unwrap(), "127.0.0.1:8123".parse().unwrap());
    }

    /// Tests HTTP/2 specific default configuration values.
    #[cfg(feature = "http2")]
    #[test]
    fn test_http2_config() {
        let config = RouterConfig::default();
        assert_eq!(config.http2_max_send_buf_size, 524288);
        assert!(!config.http2_only);
    }
}
