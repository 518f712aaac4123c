//! Host environment of the controller: emulator detection and local addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use sysinfo::{Networks, System};
use tracing::debug;

/// Host facts the controller depends on.
pub trait HostEnvironment {
    /// Whether the controller runs inside an emulator, where the host is reached through a
    /// forwarded loopback rather than through a real interface.
    fn is_emulated(&self) -> bool;

    /// Addresses bound to the local network interfaces.
    fn interface_addresses(&self) -> Vec<IpAddr>;
}

/// Environment of the running system.
#[derive(Clone, Debug, Default)]
pub struct SystemEnvironment {
    emulated: Option<bool>,
}

impl SystemEnvironment {
    /// `emulated` forces the emulator detection result.
    pub fn new(emulated: Option<bool>) -> Self {
        Self { emulated }
    }
}

impl HostEnvironment for SystemEnvironment {
    fn is_emulated(&self) -> bool {
        self.emulated.unwrap_or_else(|| {
            let kernel = System::kernel_version().unwrap_or_default();
            let host = System::host_name().unwrap_or_default();
            let os = System::long_os_version().unwrap_or_default();
            looks_emulated(&kernel, &host, &os)
        })
    }

    fn interface_addresses(&self) -> Vec<IpAddr> {
        let networks = Networks::new_with_refreshed_list();
        networks
            .list()
            .iter()
            .flat_map(|(_name, data)| data.ip_networks().iter().map(|network| network.addr))
            .collect()
    }
}

fn looks_emulated(kernel: &str, host: &str, os: &str) -> bool {
    ["goldfish", "ranchu"]
        .iter()
        .any(|board| kernel.contains(board))
        || host.starts_with("generic")
        || os.contains("sdk_gphone")
        || os.contains("Emulator")
}

/// Answers `getHost` requests.
pub struct HostResolver<E> {
    environment: E,
    emulated: bool,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
}

impl<E: HostEnvironment> HostResolver<E> {
    /// The emulator detection runs once, here.
    pub fn new(environment: E) -> Self {
        let emulated = environment.is_emulated();
        Self {
            environment,
            emulated,
            ipv4: None,
            ipv6: None,
        }
    }

    /// Pins the addresses returned for each family instead of looking at the interfaces.
    pub fn with_overrides(mut self, ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) -> Self {
        self.ipv4 = ipv4;
        self.ipv6 = ipv6;
        self
    }

    pub fn is_emulated(&self) -> bool {
        self.emulated
    }

    /// Address peers should use to reach the controller.
    pub fn get_host(&self, protocol: &str, ipv6: bool) -> String {
        if self.emulated {
            return Ipv4Addr::LOCALHOST.to_string();
        }

        let host = match (ipv6, self.ipv4, self.ipv6) {
            (false, Some(addr), _) => IpAddr::V4(addr),
            (true, _, Some(addr)) => IpAddr::V6(addr),
            _ => self.interface_address(ipv6),
        };
        debug!("host for {protocol} (ipv6: {ipv6}): {host}");
        host.to_string()
    }

    fn interface_address(&self, ipv6: bool) -> IpAddr {
        self.environment
            .interface_addresses()
            .into_iter()
            .find(|addr| match addr {
                IpAddr::V4(addr) => !ipv6 && !addr.is_loopback() && !addr.is_unspecified(),
                IpAddr::V6(addr) => {
                    ipv6 && !addr.is_loopback()
                        && !addr.is_unspecified()
                        && !addr.is_unicast_link_local()
                }
            })
            .unwrap_or(if ipv6 {
                IpAddr::V6(Ipv6Addr::LOCALHOST)
            } else {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    struct FakeEnvironment {
        emulated: bool,
        addresses: Vec<IpAddr>,
    }

    impl HostEnvironment for FakeEnvironment {
        fn is_emulated(&self) -> bool {
            self.emulated
        }

        fn interface_addresses(&self) -> Vec<IpAddr> {
            self.addresses.clone()
        }
    }

    fn device() -> FakeEnvironment {
        FakeEnvironment {
            emulated: false,
            addresses: vec![
                "127.0.0.1".parse().unwrap(),
                "::1".parse().unwrap(),
                "fe80::1c2e:5ff:fe41:8a2b".parse().unwrap(),
                "192.168.1.42".parse().unwrap(),
                "2001:db8::42".parse().unwrap(),
            ],
        }
    }

    #[test]
    fn test_emulated_uses_loopback() {
        let resolver = HostResolver::new(FakeEnvironment {
            emulated: true,
            addresses: device().addresses,
        });
        assert!(resolver.is_emulated());
        assert_eq!(resolver.get_host("tcp", false), "127.0.0.1");
        assert_eq!(resolver.get_host("ssl", true), "127.0.0.1");
    }

    #[test]
    fn test_interface_address_per_family() {
        let resolver = HostResolver::new(device());
        assert_eq!(resolver.get_host("tcp", false), "192.168.1.42");
        assert_eq!(resolver.get_host("tcp", true), "2001:db8::42");
    }

    #[test]
    fn test_overrides() {
        let resolver = HostResolver::new(device())
            .with_overrides(Some(Ipv4Addr::new(10, 0, 0, 7)), None);
        assert_eq!(resolver.get_host("ws", false), "10.0.0.7");
        assert_eq!(resolver.get_host("ws", true), "2001:db8::42");
    }

    #[test]
    fn test_loopback_when_no_interface() {
        let resolver = HostResolver::new(FakeEnvironment {
            emulated: false,
            addresses: vec!["127.0.0.1".parse().unwrap()],
        });
        assert_eq!(resolver.get_host("tcp", false), "127.0.0.1");
        assert_eq!(resolver.get_host("tcp", true), "::1");
    }

    #[test]
    fn test_emulator_heuristics() {
        assert!(looks_emulated(
            "5.10.66-android12-9-00041-gfa9c9074531e-ab7914766 ranchu",
            "localhost",
            ""
        ));
        assert!(looks_emulated("4.4.124+", "generic_x86", ""));
        assert!(!looks_emulated(
            "6.8.0-45-generic",
            "build-host",
            "Linux 24.04 Ubuntu"
        ));
    }

    #[test]
    fn test_forced_detection() {
        assert!(SystemEnvironment::new(Some(true)).is_emulated());
        assert!(!SystemEnvironment::new(Some(false)).is_emulated());
    }
}
