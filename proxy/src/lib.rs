#![deny(clippy::print_stdout, clippy::print_stderr)]

mod cidr;
mod config;
mod control_api;
mod dns;
mod http_proxy;
mod otlp;
mod presets;
mod reasons;
mod request_log;
mod responses;
mod rules;
mod server;
mod state;
mod telemetry;

pub use cidr::CidrBlocker;
pub use config::ProxyConfig;
pub use control_api::TLS_CA_ENV;
pub use control_api::TLS_CERT_ENV;
pub use control_api::TLS_KEY_ENV;
pub use control_api::TlsMaterial;
pub use control_api::run_control_api;
pub use control_api::run_control_api_with_listener;
pub use control_api::server_tls_config;
pub use dns::run_dns;
pub use dns::run_dns_with_sockets;
pub use http_proxy::run_http_proxy;
pub use http_proxy::run_http_proxy_with_listener;
pub use otlp::run_otlp;
pub use otlp::run_otlp_with_listener;
pub use presets::Preset;
pub use presets::PresetRegistry;
pub use request_log::Decision;
pub use request_log::DomainStats;
pub use request_log::LogAction;
pub use request_log::LogSource;
pub use request_log::RequestLog;
pub use request_log::RequestLogEntry;
pub use rules::DnsAllowlist;
pub use rules::HostPortPolicy;
pub use rules::HttpAllowlist;
pub use rules::RuleParseError;
pub use rules::port_glob_match;
pub use server::ProxyServer;
pub use state::HOST_GATEWAY_NAME;
pub use state::SessionState;
pub use telemetry::EventInput;
pub use telemetry::MetricSummary;
pub use telemetry::TelemetryBuffer;
pub use telemetry::TelemetryEvent;
