//! Controller configuration, read from the command line and the environment.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;

use crate::process::child::DEFAULT_READY_MARKER;

/// Registry address as seen from an emulator, where the host is reachable at `10.0.2.2`.
pub const EMULATED_REGISTRY: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 2, 2)), 15001);

/// Registry address used when none is configured outside an emulator.
pub const LOCAL_REGISTRY: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 15001);

#[derive(Clone, Debug, Parser)]
#[command(
    name = "testctl",
    version,
    about = "Starts test-suite executables on behalf of a remote test driver"
)]
pub struct ControllerConfig {
    /// Address of the process controller registry.
    #[arg(long, env = "TESTCTL_REGISTRY")]
    pub registry: Option<SocketAddr>,

    /// Address accepting direct connections from test drivers.
    #[arg(long, env = "TESTCTL_LISTEN", default_value = "0.0.0.0:0")]
    pub listen: SocketAddr,

    /// Directory holding the test-suite executables.
    #[arg(long, env = "TESTCTL_TESTS_DIR", default_value = ".")]
    pub tests_dir: PathBuf,

    /// Output line through which a server announces it is ready.
    #[arg(long, env = "TESTCTL_READY_MARKER", default_value = DEFAULT_READY_MARKER)]
    pub ready_marker: String,

    /// Delay before registering again after a failure or a disconnection.
    #[arg(long, env = "TESTCTL_BACKOFF_MS", default_value_t = 500)]
    pub backoff_ms: u64,

    /// Timeout of the connection to the registry.
    #[arg(long, env = "TESTCTL_CONNECT_TIMEOUT_MS", default_value_t = 1000)]
    pub connect_timeout_ms: u64,

    /// Interval between heartbeats sent to the registry.
    #[arg(long, env = "TESTCTL_HEARTBEAT_SECS", default_value_t = 5)]
    pub heartbeat_secs: u64,

    /// Time given to a terminated process to exit before it is killed.
    #[arg(long, env = "TESTCTL_STOP_GRACE_MS", default_value_t = 2000)]
    pub stop_grace_ms: u64,

    /// Overrides the emulator detection.
    #[arg(long, env = "TESTCTL_EMULATED")]
    pub emulated: Option<bool>,

    /// IPv4 address returned to drivers asking for the controller host.
    #[arg(long, env = "TESTCTL_HOST_IPV4")]
    pub host_ipv4: Option<Ipv4Addr>,

    /// IPv6 address returned to drivers asking for the controller host.
    #[arg(long, env = "TESTCTL_HOST_IPV6")]
    pub host_ipv6: Option<Ipv6Addr>,
}

impl ControllerConfig {
    /// The registry endpoint, fixed for the lifetime of the controller.
    pub fn registry_endpoint(&self, emulated: bool) -> SocketAddr {
        match self.registry {
            Some(registry) => registry,
            None if emulated => EMULATED_REGISTRY,
            None => LOCAL_REGISTRY,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::try_parse_from(["testctl"]).unwrap();
        assert_eq!(config.backoff(), Duration::from_millis(500));
        assert_eq!(config.connect_timeout(), Duration::from_secs(1));
        assert_eq!(config.heartbeat(), Duration::from_secs(5));
        assert_eq!(config.ready_marker, "ready");
        assert_eq!(config.registry_endpoint(true), EMULATED_REGISTRY);
        assert_eq!(config.registry_endpoint(false), LOCAL_REGISTRY);
    }

    #[test]
    fn test_explicit_registry_wins() {
        let config = ControllerConfig::try_parse_from([
            "testctl",
            "--registry",
            "192.168.1.10:15001",
            "--backoff-ms",
            "50",
            "--emulated",
            "true",
        ])
        .unwrap();
        assert_eq!(
            config.registry_endpoint(true),
            "192.168.1.10:15001".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.backoff(), Duration::from_millis(50));
        assert_eq!(config.emulated, Some(true));
    }
}
