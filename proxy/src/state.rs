use crate::cidr::CidrBlocker;
use crate::config::ProxyConfig;
use crate::presets::PresetRegistry;
use crate::request_log::Decision;
use crate::request_log::RequestLog;
use crate::rules::DnsAllowlist;
use crate::rules::HostPortPolicy;
use crate::rules::HttpAllowlist;
use crate::telemetry::TelemetryBuffer;
use anyhow::Context;
use anyhow::Result;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;

/// The reserved pseudo-hostname through which the sandbox reaches the proxy
/// (DNS) and the developer host (HTTP, port-gated).
pub const HOST_GATEWAY_NAME: &str = "host.vibepit";

/// Everything the filters and the control API share for one session. Owned
/// by the orchestrator; handed out as `Arc<SessionState>`. The allowlists
/// are the only concurrently mutated pieces and handle that internally.
pub struct SessionState {
    pub http_allowlist: HttpAllowlist,
    pub dns_allowlist: DnsAllowlist,
    pub cidr_blocker: CidrBlocker,
    pub host_ports: HostPortPolicy,
    pub request_log: RequestLog,
    pub telemetry: Option<TelemetryBuffer>,
    pub presets: PresetRegistry,
    pub proxy_ip: Option<Ipv4Addr>,
    pub host_gateway: Option<IpAddr>,
    pub upstream: SocketAddr,
    base_config: ProxyConfig,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState").finish_non_exhaustive()
    }
}

impl SessionState {
    pub fn from_config(config: ProxyConfig) -> Result<Self> {
        let http_allowlist =
            HttpAllowlist::new(&config.allow_http).context("invalid allow-http entry in config")?;
        let dns_allowlist =
            DnsAllowlist::new(&config.allow_dns).context("invalid allow-dns entry in config")?;
        let cidr_blocker = CidrBlocker::new(&config.block_cidr);
        let host_ports = HostPortPolicy::new(config.allow_host_ports.clone());
        let telemetry = config.otlp_enabled().then(TelemetryBuffer::new);
        let presets = PresetRegistry::embedded().context("invalid embedded preset document")?;
        let upstream = config.upstream_addr()?;
        Ok(Self {
            http_allowlist,
            dns_allowlist,
            cidr_blocker,
            host_ports,
            request_log: RequestLog::new(),
            telemetry,
            presets,
            proxy_ip: config.proxy_ip,
            host_gateway: config.host_gateway,
            upstream,
            base_config: config,
        })
    }

    /// The merged configuration as it currently stands, with runtime-added
    /// allow rules folded back in.
    pub fn current_config(&self) -> ProxyConfig {
        ProxyConfig {
            allow_http: self.http_allowlist.entries(),
            allow_dns: self.dns_allowlist.entries(),
            ..self.base_config.clone()
        }
    }

    /// DNS admission: the DNS allowlist, with allow-http domains as a
    /// permissive fallback so a single entry covers both layers.
    pub fn dns_allows(&self, host: &str) -> bool {
        self.dns_allowlist.allows(host) || self.http_allowlist.allows_domain(host)
    }

    pub fn record(&self, decision: Decision) -> u64 {
        self.request_log.add(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn state_with(config: ProxyConfig) -> SessionState {
        SessionState::from_config(config).unwrap()
    }

    #[test]
    fn from_config_rejects_malformed_rules() {
        let config = ProxyConfig {
            allow_http: vec!["github.com".to_string()],
            ..ProxyConfig::default()
        };
        assert!(SessionState::from_config(config).is_err());
    }

    #[test]
    fn dns_admission_merges_http_domains() {
        let state = state_with(ProxyConfig {
            allow_dns: vec!["dns-only.test".to_string()],
            allow_http: vec!["http-only.test:443".to_string()],
            ..ProxyConfig::default()
        });
        assert!(state.dns_allows("dns-only.test"));
        assert!(state.dns_allows("sub.dns-only.test"));
        assert!(state.dns_allows("http-only.test"));
        assert!(!state.dns_allows("neither.test"));
    }

    #[test]
    fn current_config_reflects_runtime_additions() {
        let state = state_with(ProxyConfig {
            allow_http: vec!["a.test:443".to_string()],
            ..ProxyConfig::default()
        });
        state
            .http_allowlist
            .add(&["b.test:443".to_string()])
            .unwrap();
        let config = state.current_config();
        assert_eq!(
            config.allow_http,
            vec!["a.test:443".to_string(), "b.test:443".to_string()]
        );
    }

    #[test]
    fn telemetry_buffer_tracks_otlp_port() {
        let disabled = state_with(ProxyConfig::default());
        assert!(disabled.telemetry.is_none());

        let enabled = state_with(ProxyConfig {
            otlp_port: 4318,
            ..ProxyConfig::default()
        });
        assert!(enabled.telemetry.is_some());
    }
}
