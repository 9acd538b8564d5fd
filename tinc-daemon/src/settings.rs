//! Daemon settings: the configuration keys of `tinc.conf` and of our own
//! host file, coerced into one typed value at startup.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tinc_core::{valid_node_name, Config, Error, NodeOptions, Result};
use tinc_routing::Subnet;

use crate::route::RouteMode;

/// `AddressFamily`: restricts listening and outgoing sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    Any,
}

impl AddressFamily {
    pub fn admits(self, addr: &IpAddr) -> bool {
        match self {
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
            AddressFamily::Any => true,
        }
    }
}

/// Everything the daemon reads from its configuration tree at startup.
#[derive(Debug)]
pub struct Settings {
    pub name: String,
    pub confbase: PathBuf,
    pub netname: Option<String>,

    pub mode: RouteMode,
    pub address_family: AddressFamily,
    pub bind_address: Option<IpAddr>,
    pub bind_interface: Option<String>,
    pub port: u16,
    pub device: PathBuf,
    pub interface: String,

    pub mac_expire: Duration,
    pub max_timeout: Duration,
    pub ping_timeout: Duration,
    pub key_expire: Duration,

    pub tunnel_server: bool,
    pub priority_inheritance: bool,
    pub hostnames: bool,

    pub connect_to: Vec<String>,
    pub subnets: Vec<Subnet>,
    pub options: NodeOptions,
    pub pmtu: Option<u16>,
}

impl Settings {
    /// Read `<confbase>/tinc.conf` and `<confbase>/hosts/<Name>`.
    pub fn load(confbase: &Path, netname: Option<&str>) -> Result<Settings> {
        let mut main = Config::new();
        main.read_file(&confbase.join("tinc.conf"))?;

        let name = main
            .get_string("Name", None)
            .ok_or_else(|| Error::config("Name required in tinc.conf"))?;
        if !valid_node_name(&name) {
            return Err(Error::config(format!("invalid name \"{name}\"")));
        }

        let mut host = Config::new();
        host.read_file(&confbase.join("hosts").join(&name))?;

        Settings::from_configs(confbase, netname, name, &main, &host)
    }

    /// Build settings out of already-parsed configuration trees.
    pub fn from_configs(
        confbase: &Path,
        netname: Option<&str>,
        name: String,
        main: &Config,
        host: &Config,
    ) -> Result<Settings> {
        let mode = main.get_choice(
            "Mode",
            &[
                ("Router", RouteMode::Router),
                ("Switch", RouteMode::Switch),
                ("Hub", RouteMode::Hub),
            ],
            RouteMode::Router,
        )?;

        let address_family = main.get_choice(
            "AddressFamily",
            &[
                ("IPv4", AddressFamily::Ipv4),
                ("IPv6", AddressFamily::Ipv6),
                ("Any", AddressFamily::Any),
            ],
            AddressFamily::Any,
        )?;

        let bind_address = match main.first("BindToAddress") {
            Some(entry) => Some(entry.value.parse::<IpAddr>().map_err(|_| {
                Error::config(format!(
                    "invalid BindToAddress in {} line {}",
                    entry.file, entry.line
                ))
            })?),
            None => None,
        };

        let port = match host.get_string("Port", Some("655")) {
            Some(text) => text
                .parse::<u16>()
                .map_err(|_| Error::config(format!("invalid Port \"{text}\"")))?,
            None => 655,
        };

        let interface = main
            .get_string("Interface", netname)
            .unwrap_or_else(|| "vpn".to_owned());
        let device = PathBuf::from(
            main.get_string("Device", Some("/dev/net/tun"))
                .unwrap_or_else(|| "/dev/net/tun".to_owned()),
        );

        let mut connect_to = Vec::new();
        for entry in main.iter("ConnectTo") {
            if !valid_node_name(&entry.value) {
                return Err(Error::config(format!(
                    "invalid name for outgoing connection in {} line {}",
                    entry.file, entry.line
                )));
            }
            connect_to.push(entry.value.clone());
        }

        let mut subnets = Vec::new();
        for entry in host.iter("Subnet") {
            let subnet: Subnet = entry.value.parse().map_err(|_| {
                Error::config(format!(
                    "invalid subnet for configuration variable {} in {} line {}",
                    entry.variable, entry.file, entry.line
                ))
            })?;
            if !subnet.is_network_address() {
                return Err(Error::config(format!(
                    "network address and prefix length do not match in {} line {}",
                    entry.file, entry.line
                )));
            }
            subnets.push(subnet);
        }

        let mut options = NodeOptions::empty();
        if host.get_bool("IndirectData", false)? {
            options |= NodeOptions::INDIRECT;
        }
        if host.get_bool("TCPOnly", false)? {
            options |= NodeOptions::TCP_ONLY | NodeOptions::INDIRECT;
        }
        if host.get_bool("PMTUDiscovery", false)? {
            options |= NodeOptions::PMTU_DISCOVERY;
        }

        let pmtu = match host.first("PMTU") {
            Some(entry) => Some(entry.as_int()? as u16),
            None => None,
        };

        Ok(Settings {
            name,
            confbase: confbase.to_owned(),
            netname: netname.map(str::to_owned),
            mode,
            address_family,
            bind_address,
            bind_interface: main.get_string("BindToInterface", None),
            port,
            device,
            interface,
            mac_expire: main.get_period("MACExpire", Duration::from_secs(600))?,
            max_timeout: main.get_period("MaxTimeout", Duration::from_secs(900))?,
            ping_timeout: main.get_period("PingTimeout", Duration::from_secs(60))?,
            key_expire: main.get_period("KeyExpire", Duration::from_secs(3600))?,
            tunnel_server: main.get_bool("TunnelServer", false)?,
            priority_inheritance: main.get_bool("PriorityInheritance", false)?,
            hostnames: main.get_bool("Hostnames", false)?,
            connect_to,
            subnets,
            options,
            pmtu,
        })
    }

    /// Parse the per-host file for `name`, if present.
    pub fn host_config(&self, name: &str) -> Result<Config> {
        let mut cfg = Config::new();
        cfg.read_file(&self.confbase.join("hosts").join(name))?;
        Ok(cfg)
    }

    /// Whether a host file for `name` exists at all (peer admission).
    pub fn knows_host(&self, name: &str) -> bool {
        valid_node_name(name) && self.confbase.join("hosts").join(name).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_tree(main: &str, name: &str, host: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tinc.conf"), main).unwrap();
        fs::create_dir(dir.path().join("hosts")).unwrap();
        fs::write(dir.path().join("hosts").join(name), host).unwrap();
        dir
    }

    #[test]
    fn loads_a_full_tree() {
        let dir = write_tree(
            "Name = alpha\nMode = Switch\nMACExpire = 5m\nConnectTo = beta\nConnectTo = gamma\nPriorityInheritance = yes\n",
            "alpha",
            "Port = 700\nSubnet = 10.1.0.0/16\nSubnet = fec0::/64\nIndirectData = yes\n",
        );
        let settings = Settings::load(dir.path(), Some("mynet")).unwrap();

        assert_eq!(settings.name, "alpha");
        assert_eq!(settings.mode, RouteMode::Switch);
        assert_eq!(settings.mac_expire, Duration::from_secs(300));
        assert_eq!(settings.port, 700);
        assert_eq!(settings.connect_to, ["beta", "gamma"]);
        assert_eq!(settings.subnets.len(), 2);
        assert!(settings.options.contains(NodeOptions::INDIRECT));
        assert!(settings.priority_inheritance);
        assert_eq!(settings.interface, "mynet");
        assert_eq!(settings.ping_timeout, Duration::from_secs(60));
    }

    #[test]
    fn missing_name_is_fatal() {
        let dir = write_tree("Mode = Router\n", "alpha", "");
        assert!(matches!(
            Settings::load(dir.path(), None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn host_subnet_must_be_a_network_address() {
        let dir = write_tree("Name = alpha\n", "alpha", "Subnet = 10.0.0.1/24\n");
        assert!(Settings::load(dir.path(), None).is_err());
    }

    #[test]
    fn knows_host_checks_the_hosts_directory() {
        let dir = write_tree("Name = alpha\n", "alpha", "");
        let settings = Settings::load(dir.path(), None).unwrap();
        assert!(settings.knows_host("alpha"));
        assert!(!settings.knows_host("beta"));
        assert!(!settings.knows_host("../alpha"));
    }
}
