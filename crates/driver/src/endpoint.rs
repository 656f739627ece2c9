//! Endpoint resolution — a pure function over an inspected container's
//! network settings. No I/O, no Docker handle; kept isolated so the three
//! connect modes can be unit tested without a daemon.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How the orchestrator reaches a container's HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMode {
    ContainerNetwork,
    HostPort,
    Auto,
}

/// A single published port binding, as reported by `NetworkSettings.Ports`.
#[derive(Debug, Clone)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

/// The subset of `docker inspect` network info endpoint resolution needs.
/// Built by the docker driver from a `ContainerInspectResponse`; kept as a
/// plain struct so it can be constructed by hand in tests.
#[derive(Debug, Clone, Default)]
pub struct NetworkInspectInfo {
    /// network name -> IP address, as seen in `NetworkSettings.Networks`.
    pub networks: HashMap<String, String>,
    /// "<port>/<proto>" -> bindings, as seen in `NetworkSettings.Ports`.
    pub ports: HashMap<String, Vec<PortBinding>>,
}

fn resolve_container_ip(info: &NetworkInspectInfo, preferred_network: Option<&str>) -> Option<String> {
    if info.networks.is_empty() {
        return None;
    }
    if let Some(name) = preferred_network {
        if let Some(ip) = info.networks.get(name) {
            return Some(ip.clone());
        }
    }
    // Fall back to the first attached network in insertion order is not
    // guaranteed by HashMap; callers that care about determinism should
    // pass a BTreeMap-backed info or a single network. We take any entry.
    info.networks.values().next().cloned()
}

fn resolve_host_port(
    info: &NetworkInspectInfo,
    runtime_port: u16,
    host_address: &str,
) -> Option<(String, u16)> {
    let key = format!("{runtime_port}/tcp");
    let bindings = info.ports.get(&key)?;
    for binding in bindings {
        if let Some(port_str) = &binding.host_port {
            if let Ok(port) = port_str.parse::<u16>() {
                return Some((host_address.to_string(), port));
            }
        }
    }
    None
}

fn endpoint_from_hostport(host: &str, port: u16) -> String {
    format!("http://{host}:{port}")
}

fn endpoint_from_container_ip(ip: &str, port: u16) -> String {
    format!("http://{ip}:{port}")
}

/// Resolve the HTTP endpoint for a freshly-started container.
///
/// `auto` prefers `container_network`, falling back to `host_port` when no
/// network IP is attached. Returns `None` ("no_endpoint") rather than
/// panicking on malformed inspection data.
pub fn resolve_endpoint(
    mode: ConnectMode,
    info: &NetworkInspectInfo,
    runtime_port: u16,
    preferred_network: Option<&str>,
    host_address: &str,
) -> Option<String> {
    let try_container_network = || {
        resolve_container_ip(info, preferred_network)
            .map(|ip| endpoint_from_container_ip(&ip, runtime_port))
    };
    let try_host_port = || {
        resolve_host_port(info, runtime_port, host_address)
            .map(|(host, port)| endpoint_from_hostport(&host, port))
    };

    match mode {
        ConnectMode::ContainerNetwork => try_container_network(),
        ConnectMode::HostPort => try_host_port(),
        ConnectMode::Auto => try_container_network().or_else(try_host_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn both_available() -> NetworkInspectInfo {
        let mut networks = HashMap::new();
        networks.insert("bay-net".to_string(), "172.20.0.100".to_string());
        let mut ports = HashMap::new();
        ports.insert(
            "8123/tcp".to_string(),
            vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("33333".to_string()),
            }],
        );
        NetworkInspectInfo { networks, ports }
    }

    #[test]
    fn resolves_container_ip_from_named_network() {
        let info = both_available();
        let ip = resolve_container_ip(&info, Some("bay-net"));
        assert_eq!(ip.as_deref(), Some("172.20.0.100"));
    }

    #[test]
    fn falls_back_to_first_network_when_named_missing() {
        let info = both_available();
        let ip = resolve_container_ip(&info, Some("nonexistent"));
        assert_eq!(ip.as_deref(), Some("172.20.0.100"));
    }

    #[test]
    fn no_networks_returns_none() {
        let info = NetworkInspectInfo::default();
        assert_eq!(resolve_container_ip(&info, None), None);
    }

    #[test]
    fn host_port_resolves_when_bound() {
        let info = both_available();
        let result = resolve_host_port(&info, 8123, "127.0.0.1");
        assert_eq!(result, Some(("127.0.0.1".to_string(), 33333)));
    }

    #[test]
    fn host_port_none_when_no_bindings() {
        let info = NetworkInspectInfo::default();
        assert_eq!(resolve_host_port(&info, 8123, "127.0.0.1"), None);
    }

    #[test]
    fn host_port_none_when_port_not_bound() {
        let info = both_available();
        assert_eq!(resolve_host_port(&info, 9999, "127.0.0.1"), None);
    }

    #[test]
    fn invalid_host_port_string_does_not_panic() {
        let mut ports = HashMap::new();
        ports.insert(
            "8123/tcp".to_string(),
            vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("not-a-port".to_string()),
            }],
        );
        let info = NetworkInspectInfo { networks: HashMap::new(), ports };
        assert_eq!(resolve_host_port(&info, 8123, "127.0.0.1"), None);
    }

    #[test]
    fn empty_host_port_string_does_not_panic() {
        let mut ports = HashMap::new();
        ports.insert(
            "8123/tcp".to_string(),
            vec![PortBinding { host_ip: Some("0.0.0.0".to_string()), host_port: Some(String::new()) }],
        );
        let info = NetworkInspectInfo { networks: HashMap::new(), ports };
        assert_eq!(resolve_host_port(&info, 8123, "127.0.0.1"), None);
    }

    #[test]
    fn endpoint_formatting() {
        assert_eq!(endpoint_from_hostport("127.0.0.1", 32768), "http://127.0.0.1:32768");
        assert_eq!(endpoint_from_container_ip("172.18.0.5", 8123), "http://172.18.0.5:8123");
    }

    #[test]
    fn container_network_mode_prefers_container_ip() {
        let info = both_available();
        let endpoint = resolve_endpoint(ConnectMode::ContainerNetwork, &info, 8123, Some("bay-net"), "127.0.0.1");
        assert_eq!(endpoint.as_deref(), Some("http://172.20.0.100:8123"));
    }

    #[test]
    fn host_port_mode_ignores_container_ip() {
        let info = both_available();
        let endpoint = resolve_endpoint(ConnectMode::HostPort, &info, 8123, Some("bay-net"), "127.0.0.1");
        assert_eq!(endpoint.as_deref(), Some("http://127.0.0.1:33333"));
    }

    #[test]
    fn auto_mode_prefers_container_network() {
        let info = both_available();
        let endpoint = resolve_endpoint(ConnectMode::Auto, &info, 8123, Some("bay-net"), "127.0.0.1");
        assert_eq!(endpoint.as_deref(), Some("http://172.20.0.100:8123"));
    }

    #[test]
    fn auto_mode_falls_back_to_host_port_without_network() {
        let mut ports = HashMap::new();
        ports.insert(
            "8123/tcp".to_string(),
            vec![PortBinding { host_ip: Some("0.0.0.0".to_string()), host_port: Some("44444".to_string()) }],
        );
        let info = NetworkInspectInfo { networks: HashMap::new(), ports };
        let endpoint = resolve_endpoint(ConnectMode::Auto, &info, 8123, None, "127.0.0.1");
        assert_eq!(endpoint.as_deref(), Some("http://127.0.0.1:44444"));
    }
}
