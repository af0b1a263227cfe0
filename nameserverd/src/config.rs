use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use shared::protocol::DEFAULT_BROADCAST_PORT;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Where and how to ask ChannelFinder for override addresses.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_resource_path")]
    pub resource_path: String,
    /// Query parameter carrying the PV name
    #[serde(default = "default_name_filter")]
    pub name_filter: String,
    /// Only match channels whose status property says they are active
    #[serde(default)]
    pub active_only: bool,
    #[serde(default = "default_status_property")]
    pub status_property: String,
    #[serde(default = "default_active_value")]
    pub active_value: String,
    #[serde(default = "default_host_property")]
    pub host_property: String,
    #[serde(default = "default_port_property")]
    pub port_property: String,
    /// Lookup deadline; fractions of a second are allowed
    #[serde(default = "default_timeout")]
    pub timeout_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port the search listener binds
    #[serde(default = "default_port")]
    pub server_port: u16,
    /// UDP port relayed searches are sent to
    #[serde(default = "default_port")]
    pub broadcast_port: u16,
    #[serde(default = "default_true")]
    pub ipv6: bool,
    /// Searches being looked up or relayed at once; more are dropped
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Add the broadcast address of every local IPv4 interface
    #[serde(default = "default_true")]
    pub auto_address_list: bool,
    /// Extra targets, `host[:port][,ttl][@interface]`
    #[serde(default)]
    pub address_list: Vec<String>,
    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,
}

fn default_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_resource_path() -> String {
    "/ChannelFinder/resources/channels".to_string()
}

fn default_name_filter() -> String {
    "~name".to_string()
}

fn default_status_property() -> String {
    "pvStatus".to_string()
}

fn default_active_value() -> String {
    "Active".to_string()
}

fn default_host_property() -> String {
    "iocIP".to_string()
}

fn default_port_property() -> String {
    "pvaPort".to_string()
}

fn default_timeout() -> f64 {
    15.0
}

fn default_port() -> u16 {
    DEFAULT_BROADCAST_PORT
}

fn default_true() -> bool {
    true
}

fn default_max_in_flight() -> usize {
    256
}

fn default_multicast_ttl() -> u32 {
    1
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            resource_path: default_resource_path(),
            name_filter: default_name_filter(),
            active_only: false,
            status_property: default_status_property(),
            active_value: default_active_value(),
            host_property: default_host_property(),
            port_property: default_port_property(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            server_port: default_port(),
            broadcast_port: default_port(),
            ipv6: true,
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_address_list: true,
            address_list: Vec::new(),
            multicast_ttl: default_multicast_ttl(),
        }
    }
}

impl DirectoryConfig {
    /// Lookup deadline. Out-of-range values, which `Config::validate`
    /// rejects, fall back to the default.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_timeout()))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let timeout = self.directory.timeout_secs;
        if !timeout.is_finite() || timeout <= 0.0 {
            bail!("directory.timeout_secs must be greater than zero");
        }
        Duration::try_from_secs_f64(timeout)
            .with_context(|| format!("directory.timeout_secs is out of range: {}", timeout))?;
        if self.discovery.server_port == 0 || self.discovery.broadcast_port == 0 {
            bail!("discovery ports must be non-zero");
        }
        if self.discovery.max_in_flight == 0 {
            bail!("discovery.max_in_flight must be greater than zero");
        }
        reqwest::Url::parse(&self.directory.url)
            .with_context(|| format!("directory.url is not a valid URL: {}", self.directory.url))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.directory.url, "http://localhost:8080");
        assert_eq!(config.directory.host_property, "iocIP");
        assert_eq!(config.directory.port_property, "pvaPort");
        assert_eq!(config.directory.timeout(), Duration::from_secs(15));
        assert_eq!(config.discovery.server_port, 5076);
        assert_eq!(config.discovery.broadcast_port, 5076);
        assert_eq!(config.discovery.max_in_flight, 256);
        assert!(config.relay.enabled);
        assert!(config.relay.auto_address_list);
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [directory]
            url = "http://cf.example.org:8080"
            active_only = true
            timeout_secs = 2.5

            [relay]
            address_list = ["224.0.2.3,255@eth0", "10.1.255.255"]
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.directory.url, "http://cf.example.org:8080");
        assert!(config.directory.active_only);
        assert_eq!(config.directory.resource_path, "/ChannelFinder/resources/channels");
        assert_eq!(config.directory.timeout(), Duration::from_millis(2500));
        assert_eq!(config.relay.address_list.len(), 2);
        assert_eq!(config.relay.multicast_ttl, 1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.directory.timeout_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.directory.timeout_secs = 1e20;
        assert!(config.validate().is_err());
        assert_eq!(config.directory.timeout(), Duration::from_secs(15));

        let mut config = Config::default();
        config.discovery.broadcast_port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.discovery.max_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.directory.url = "not a url".to_string();
        assert!(config.validate().is_err());
    }
}
