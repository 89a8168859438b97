use crate::network::NetworkConfig;
use anyhow::Context;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Document joined when none is given on the command line
    pub document: String,
    pub broadcast_port: u16,
    pub broadcast_addr: IpAddr,
    pub listen_base_port: u16,
    pub find_timeout_ms: u64,
    pub repair_settle_ms: u64,
    pub repair_window_ms: u64,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            document: "untitled".to_string(),
            broadcast_port: 1337,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            listen_base_port: 1338,
            find_timeout_ms: 200,
            repair_settle_ms: 200,
            repair_window_ms: 1000,
            debug: false,
        }
    }
}

impl Config {
    /// Network settings derived from this configuration.
    pub fn network(&self) -> NetworkConfig {
        NetworkConfig::new()
            .broadcast_port(self.broadcast_port)
            .broadcast_addr(self.broadcast_addr)
            .listen_base_port(self.listen_base_port)
            .find_timeout(Duration::from_millis(self.find_timeout_ms))
            .repair_timings(
                Duration::from_millis(self.repair_settle_ms),
                Duration::from_millis(self.repair_window_ms),
            )
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    load_config_from(|key| std::env::var(key).ok())
}

/// Build a configuration from `SYNCEDIT_*` variables supplied by `lookup`.
///
/// Unparseable numbers fall back to their defaults; an unparseable
/// broadcast address is an error.
pub fn load_config_from(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
    let defaults = Config::default();

    let document = lookup("SYNCEDIT_DOCUMENT").unwrap_or(defaults.document);

    let broadcast_port = lookup("SYNCEDIT_BROADCAST_PORT")
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.broadcast_port);

    let broadcast_addr = match lookup("SYNCEDIT_BROADCAST_ADDR") {
        Some(v) => v
            .parse()
            .with_context(|| format!("invalid SYNCEDIT_BROADCAST_ADDR '{}'", v))?,
        None => defaults.broadcast_addr,
    };

    let listen_base_port = lookup("SYNCEDIT_LISTEN_PORT")
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.listen_base_port);

    let find_timeout_ms = lookup("SYNCEDIT_FIND_TIMEOUT_MS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.find_timeout_ms);

    let repair_settle_ms = lookup("SYNCEDIT_REPAIR_SETTLE_MS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.repair_settle_ms);

    let repair_window_ms = lookup("SYNCEDIT_REPAIR_WINDOW_MS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.repair_window_ms);

    let debug = lookup("DEBUG").is_some();

    Ok(Config {
        document,
        broadcast_port,
        broadcast_addr,
        listen_base_port,
        find_timeout_ms,
        repair_settle_ms,
        repair_window_ms,
        debug,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        load_config_from(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.document, "untitled");
        assert_eq!(cfg.broadcast_port, 1337);
        assert_eq!(cfg.listen_base_port, 1338);
        assert!(!cfg.debug);
    }

    #[test]
    fn test_load_config_defaults() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.document, "untitled");
        assert_eq!(cfg.broadcast_addr, IpAddr::V4(Ipv4Addr::BROADCAST));
        assert_eq!(cfg.repair_window_ms, 1000);
    }

    #[test]
    fn test_load_config_with_custom_values() {
        let cfg = load(&[
            ("SYNCEDIT_DOCUMENT", "notes"),
            ("SYNCEDIT_BROADCAST_PORT", "4337"),
            ("SYNCEDIT_BROADCAST_ADDR", "192.168.1.255"),
            ("SYNCEDIT_LISTEN_PORT", "4338"),
            ("SYNCEDIT_REPAIR_SETTLE_MS", "50"),
            ("SYNCEDIT_REPAIR_WINDOW_MS", "500"),
        ])
        .unwrap();
        assert_eq!(cfg.document, "notes");
        assert_eq!(cfg.broadcast_port, 4337);
        assert_eq!(cfg.broadcast_addr, "192.168.1.255".parse::<IpAddr>().unwrap());
        assert_eq!(cfg.listen_base_port, 4338);
        assert_eq!(cfg.repair_settle_ms, 50);
        assert_eq!(cfg.repair_window_ms, 500);
    }

    #[test]
    fn test_load_config_with_debug() {
        let cfg = load(&[("DEBUG", "1")]).unwrap();
        assert!(cfg.debug);
    }

    #[test]
    fn test_load_config_parse_error_uses_default() {
        let cfg = load(&[
            ("SYNCEDIT_BROADCAST_PORT", "not-a-port"),
            ("SYNCEDIT_LISTEN_PORT", "70000"),
        ])
        .unwrap();
        assert_eq!(cfg.broadcast_port, 1337);
        assert_eq!(cfg.listen_base_port, 1338);
    }

    #[test]
    fn test_load_config_rejects_bad_address() {
        let err = load(&[("SYNCEDIT_BROADCAST_ADDR", "everyone")]).unwrap_err();
        assert!(err.to_string().contains("SYNCEDIT_BROADCAST_ADDR"));
    }

    #[test]
    fn test_network_config_from_config() {
        let cfg = load(&[("SYNCEDIT_REPAIR_SETTLE_MS", "75")]).unwrap();
        let network = cfg.network();
        assert_eq!(network.broadcast_port, 1337);
        assert_eq!(network.repair_settle, Duration::from_millis(75));
        assert_eq!(network.repair_window, Duration::from_millis(1000));
        assert!(network.validate().is_ok());
    }
}
