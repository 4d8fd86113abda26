//! Agent configuration
//!
//! Command-line arguments are validated once at startup into an immutable
//! [`AgentConfig`] that is shared by reference with every component.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use udpu_shared::timing;

/// Default store file name, placed beside the executable
pub const STORE_FILE_NAME: &str = "udpu_config.json";

/// Firmware environment key holding the device secret
pub const SECRET_ENV_KEY: &str = "UDPU_SECRET_KEY";

/// Firmware environment key holding the tunnel private key
pub const TUNNEL_KEY_ENV_KEY: &str = "WG_PRIVATE_KEY";

const LOCAL_TEST_SERVER_HOST: &str = "host.docker.internal";
const LOCAL_TEST_SERVER_PORT: u16 = 8888;
const LOCAL_TEST_REPO_HOST: &str = "host.docker.internal";
const LOCAL_TEST_REPO_PORT: u16 = 8887;

#[derive(Parser, Debug)]
#[command(name = "udpu-agent")]
#[command(version, about = "uDPU device agent")]
pub struct Args {
    /// Discovery service host
    #[arg(long, env = "UDPU_DISCOVERY_HOST")]
    pub discovery_host: Option<String>,

    /// Discovery service port
    #[arg(long, env = "UDPU_DISCOVERY_PORT")]
    pub discovery_port: Option<u16>,

    /// Directory for downloaded software
    #[arg(long, default_value = "/tmp", env = "UDPU_DOWNLOAD_PATH")]
    pub download_path: PathBuf,

    /// Interface whose MAC address identifies this device
    #[arg(long, default_value = "br-lan", env = "UDPU_MAC_INTERFACE")]
    pub mac_interface: String,

    /// Local testing mode: fixed server/repo addresses, file-backed secret
    #[arg(long, env = "UDPU_LOCAL_TEST")]
    pub local_test: bool,

    /// MAC address used in local testing mode
    #[arg(long, default_value = "00:11:22:33:44:55", env = "LOCAL_TEST_MAC")]
    pub local_test_mac: String,

    /// Path of the persisted state file (default: beside the executable)
    #[arg(long, env = "UDPU_STORE_PATH")]
    pub store_path: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, env = "UDPU_DEBUG")]
    pub debug: bool,
}

impl Args {
    /// Log filter from `RUST_LOG`, falling back to the `--debug` level
    pub fn log_filter(&self) -> EnvFilter {
        self.log_filter_from(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
    }

    fn log_filter_from(&self, directives: Option<&str>) -> EnvFilter {
        directives
            .and_then(|d| EnvFilter::try_new(d).ok())
            .unwrap_or_else(|| EnvFilter::new(if self.debug { "debug" } else { "info" }))
    }
}

/// Host/port pair of a control-plane service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddr {
    pub host: String,
    pub port: u16,
}

impl ServiceAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `scheme://host:port`, bracketing IPv6 literals
    pub fn base_url(&self, scheme: &str) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

impl fmt::Display for ServiceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Resolved control-plane services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub server: ServiceAddr,
    pub repo: ServiceAddr,
}

impl Endpoints {
    pub fn local_test() -> Self {
        Self {
            server: ServiceAddr::new(LOCAL_TEST_SERVER_HOST, LOCAL_TEST_SERVER_PORT),
            repo: ServiceAddr::new(LOCAL_TEST_REPO_HOST, LOCAL_TEST_REPO_PORT),
        }
    }

    /// Same services, but the server reached through another host (tunnel address)
    pub fn with_server_host(&self, host: impl Into<String>) -> Self {
        Self {
            server: ServiceAddr::new(host, self.server.port),
            repo: self.repo.clone(),
        }
    }
}

/// Intervals and timeouts of the agent lifecycle
#[derive(Debug, Clone)]
pub struct Timings {
    pub descriptor_poll: Duration,
    pub unregistered_tick: Duration,
    pub status_interval: Duration,
    pub push_reconnect: Duration,
    pub discovery_retry: Duration,
    pub http_timeout: Duration,
    pub health_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            descriptor_poll: timing::DESCRIPTOR_POLL_INTERVAL,
            unregistered_tick: timing::UNREGISTERED_TICK_INTERVAL,
            status_interval: timing::STATUS_INTERVAL,
            push_reconnect: timing::PUSH_RECONNECT_DELAY,
            discovery_retry: timing::DISCOVERY_RETRY_DELAY,
            http_timeout: timing::HTTP_TIMEOUT,
            health_timeout: timing::HEALTH_CHECK_TIMEOUT,
        }
    }
}

/// Local testing overrides
#[derive(Debug, Clone)]
pub struct LocalTest {
    pub mac: String,
}

/// Validated agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub discovery: ServiceAddr,
    pub download_dir: PathBuf,
    pub mac_interface: String,
    pub store_path: PathBuf,
    pub local_test: Option<LocalTest>,
    pub timings: Timings,
}

impl AgentConfig {
    /// Validate arguments; fails before any network activity
    pub fn from_args(args: Args) -> Result<Self> {
        let host = args
            .discovery_host
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| anyhow!("--discovery-host is required"))?;
        let port = args
            .discovery_port
            .filter(|p| *p != 0)
            .ok_or_else(|| anyhow!("--discovery-port is required"))?;

        let store_path = match args.store_path {
            Some(path) => path,
            None => default_store_path(),
        };

        let local_test = args.local_test.then(|| LocalTest {
            mac: args.local_test_mac.trim().to_string(),
        });

        Ok(Self {
            discovery: ServiceAddr::new(host, port),
            download_dir: args.download_path,
            mac_interface: args.mac_interface,
            store_path,
            local_test,
            timings: Timings::default(),
        })
    }

    pub fn is_local_test(&self) -> bool {
        self.local_test.is_some()
    }
}

/// `udpu_config.json` next to the (symlink-resolved) executable
fn default_store_path() -> PathBuf {
    std::env::current_exe()
        .and_then(|exe| exe.canonicalize())
        .ok()
        .as_deref()
        .and_then(Path::parent)
        .map(|dir| dir.join(STORE_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(STORE_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["udpu-agent"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_rust_log_overrides_debug_flag() {
        use tracing::level_filters::LevelFilter;

        let debug = args(&["--debug"]);
        assert_eq!(
            debug.log_filter_from(Some("warn")).max_level_hint(),
            Some(LevelFilter::WARN)
        );
        assert_eq!(
            debug.log_filter_from(None).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
        // Unparseable directives fall back to the flag
        assert_eq!(
            debug.log_filter_from(Some("udpu_agent=loud")).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
    }

    #[test]
    fn test_missing_discovery_is_rejected() {
        assert!(AgentConfig::from_args(args(&[])).is_err());
        assert!(AgentConfig::from_args(args(&["--discovery-host", "disc"])).is_err());
    }

    #[test]
    fn test_valid_config() {
        let config = AgentConfig::from_args(args(&[
            "--discovery-host",
            "disc.local",
            "--discovery-port",
            "7000",
            "--store-path",
            "/var/lib/udpu/state.json",
        ]))
        .unwrap();

        assert_eq!(config.discovery, ServiceAddr::new("disc.local", 7000));
        assert_eq!(config.store_path, PathBuf::from("/var/lib/udpu/state.json"));
        assert_eq!(config.mac_interface, "br-lan");
        assert!(!config.is_local_test());
    }

    #[test]
    fn test_local_test_mode() {
        let config = AgentConfig::from_args(args(&[
            "--discovery-host",
            "disc",
            "--discovery-port",
            "7000",
            "--local-test",
            "--local-test-mac",
            "aa:bb:cc:00:11:22",
        ]))
        .unwrap();

        assert_eq!(config.local_test.unwrap().mac, "aa:bb:cc:00:11:22");
    }

    #[test]
    fn test_base_url() {
        assert_eq!(
            ServiceAddr::new("10.0.0.1", 8888).base_url("http"),
            "http://10.0.0.1:8888"
        );
        assert_eq!(
            ServiceAddr::new("fd00::1", 8888).base_url("ws"),
            "ws://[fd00::1]:8888"
        );
    }

    #[test]
    fn test_server_host_override_keeps_port() {
        let endpoints = Endpoints::local_test().with_server_host("10.66.0.2");
        assert_eq!(endpoints.server, ServiceAddr::new("10.66.0.2", 8888));
        assert_eq!(endpoints.repo, Endpoints::local_test().repo);
    }
}
