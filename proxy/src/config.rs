use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::Path;

pub const DEFAULT_PROXY_PORT: u16 = 3128;
pub const DEFAULT_CONTROL_API_PORT: u16 = 8080;
pub const DEFAULT_DNS_PORT: u16 = 53;
pub const DEFAULT_UPSTREAM: &str = "1.1.1.1:53";

/// The merged session configuration the launcher serializes to JSON before
/// starting the proxy. Unknown keys are ignored so launcher and proxy can
/// evolve independently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProxyConfig {
    pub allow_http: Vec<String>,
    pub allow_dns: Vec<String>,
    pub block_cidr: Vec<String>,
    pub allow_host_ports: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_ip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_gateway: Option<IpAddr>,
    pub proxy_port: u16,
    pub control_api_port: u16,
    pub dns_port: u16,
    /// 0 disables the OTLP receiver entirely.
    pub otlp_port: u16,
    pub upstream: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            allow_http: Vec::new(),
            allow_dns: Vec::new(),
            block_cidr: Vec::new(),
            allow_host_ports: Vec::new(),
            proxy_ip: None,
            host_gateway: None,
            proxy_port: DEFAULT_PROXY_PORT,
            control_api_port: DEFAULT_CONTROL_API_PORT,
            dns_port: DEFAULT_DNS_PORT,
            otlp_port: 0,
            upstream: DEFAULT_UPSTREAM.to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Upstream resolver address. A bare IP gets the standard DNS port.
    pub fn upstream_addr(&self) -> Result<SocketAddr> {
        let trimmed = self.upstream.trim();
        if let Ok(addr) = trimmed.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let ip: IpAddr = trimmed
            .parse()
            .with_context(|| format!("invalid upstream resolver address: {}", self.upstream))?;
        Ok(SocketAddr::new(ip, DEFAULT_DNS_PORT))
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.proxy_port))
    }

    pub fn control_api_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.control_api_port))
    }

    pub fn dns_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.dns_port))
    }

    pub fn otlp_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.otlp_port))
    }

    pub fn otlp_enabled(&self) -> bool {
        self.otlp_port > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn missing_fields_use_defaults() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{
                "allow-http": ["github.com:443"],
                "proxy-port": 4000,
                "control-api-port": 4001
            }"#,
        )
        .unwrap();
        assert_eq!(config.allow_http, vec!["github.com:443".to_string()]);
        assert_eq!(config.dns_port, 53);
        assert_eq!(config.upstream, "1.1.1.1:53");
        assert_eq!(config.otlp_port, 0);
        assert!(!config.otlp_enabled());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{
                "allow-dns": ["example.com"],
                "future-flag": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.allow_dns, vec!["example.com".to_string()]);
    }

    #[test]
    fn full_config_round_trips() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{
                "allow-http": ["*.example.com:443"],
                "allow-dns": ["example.com"],
                "block-cidr": ["100.64.0.0/10"],
                "allow-host-ports": [9200],
                "proxy-ip": "172.30.0.2",
                "host-gateway": "192.0.2.1",
                "proxy-port": 3128,
                "control-api-port": 8443,
                "dns-port": 53,
                "otlp-port": 4318,
                "upstream": "9.9.9.9"
            }"#,
        )
        .unwrap();
        assert_eq!(config.proxy_ip, Some("172.30.0.2".parse().unwrap()));
        assert_eq!(config.host_gateway, Some("192.0.2.1".parse().unwrap()));
        assert!(config.otlp_enabled());
        assert_eq!(
            config.upstream_addr().unwrap(),
            "9.9.9.9:53".parse().unwrap()
        );

        let json = serde_json::to_string(&config).unwrap();
        let back: ProxyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn load_reads_the_launcher_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            r#"{"allow-http": ["github.com:443"], "otlp-port": 4318}"#,
        )
        .unwrap();
        let config = ProxyConfig::load(&path).unwrap();
        assert_eq!(config.allow_http, vec!["github.com:443".to_string()]);
        assert_eq!(config.otlp_port, 4318);

        assert!(ProxyConfig::load(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn upstream_with_port_is_used_verbatim() {
        let config = ProxyConfig {
            upstream: "10.1.2.3:5353".to_string(),
            ..ProxyConfig::default()
        };
        assert_eq!(
            config.upstream_addr().unwrap(),
            "10.1.2.3:5353".parse().unwrap()
        );
    }

    #[test]
    fn invalid_upstream_is_an_error() {
        let config = ProxyConfig {
            upstream: "not-an-ip".to_string(),
            ..ProxyConfig::default()
        };
        assert!(config.upstream_addr().is_err());
    }
}
