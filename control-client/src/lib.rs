//! Host-side client for the proxy's mTLS control API.
//!
//! Loads the per-session credential directory the launcher persisted and
//! dials `https://127.0.0.1:<control-api-port>`. Requests use a short
//! timeout: the control API is local and answers from memory, so anything
//! slow means the session is gone.

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const CA_CERT_FILE: &str = "ca.pem";
pub const CLIENT_CERT_FILE: &str = "client-cert.pem";
pub const CLIENT_KEY_FILE: &str = "client-key.pem";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogAction {
    Allow,
    Block,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Proxy,
    Dns,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RequestLogEntry {
    pub id: u64,
    pub timestamp: i64,
    pub domain: String,
    pub port: Option<String>,
    pub action: LogAction,
    pub source: LogSource,
    pub reason: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct DomainStats {
    pub allowed: u64,
    pub blocked: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TelemetryEvent {
    pub id: u64,
    pub timestamp: i64,
    pub agent: String,
    pub event_name: String,
    #[serde(default)]
    pub attrs: HashMap<String, String>,
    #[serde(default)]
    pub raw_log: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricSummary {
    pub name: String,
    pub agent: String,
    pub value: f64,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub raw: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct EntriesRequest<'a> {
    entries: &'a [String],
}

#[derive(Deserialize)]
struct AddedResponse {
    added: Vec<String>,
}

pub struct ControlClient {
    base_url: String,
    http: reqwest::Client,
}

impl ControlClient {
    /// Load `ca.pem`, `client-cert.pem`, and `client-key.pem` from a
    /// per-session credential directory.
    pub fn from_credentials_dir(dir: &Path, control_api_port: u16) -> Result<Self> {
        let read = |name: &str| {
            std::fs::read(dir.join(name))
                .with_context(|| format!("read {name} from {}", dir.display()))
        };
        Self::new(
            &read(CA_CERT_FILE)?,
            &read(CLIENT_CERT_FILE)?,
            &read(CLIENT_KEY_FILE)?,
            control_api_port,
        )
    }

    pub fn new(
        ca_pem: &[u8],
        client_cert_pem: &[u8],
        client_key_pem: &[u8],
        control_api_port: u16,
    ) -> Result<Self> {
        let ca = reqwest::Certificate::from_pem(ca_pem)
            .context("invalid session CA certificate")?;
        let identity_pem = [client_cert_pem, client_key_pem].concat();
        let identity = reqwest::Identity::from_pem(&identity_pem)
            .context("invalid client certificate or key")?;
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .identity(identity)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build control API client")?;
        Ok(Self {
            base_url: format!("https://127.0.0.1:{control_api_port}"),
            http,
        })
    }

    pub async fn health(&self) -> Result<()> {
        self.http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .context("control API /health request failed")?
            .error_for_status()
            .context("control API /health returned error")?;
        Ok(())
    }

    /// Log tail. `after` of `None` fetches the full buffer snapshot; an
    /// `after` of 0 fetches the last 25 entries.
    pub async fn logs(&self, after: Option<u64>) -> Result<Vec<RequestLogEntry>> {
        let mut url = format!("{}/logs", self.base_url);
        if let Some(after) = after {
            url.push_str(&format!("?after={after}"));
        }
        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("control API /logs request failed")?
            .error_for_status()
            .context("control API /logs returned error")?;
        response
            .json()
            .await
            .context("control API /logs returned invalid JSON")
    }

    pub async fn stats(&self) -> Result<HashMap<String, DomainStats>> {
        let response = self
            .http
            .get(format!("{}/stats", self.base_url))
            .send()
            .await
            .context("control API /stats request failed")?
            .error_for_status()
            .context("control API /stats returned error")?;
        response
            .json()
            .await
            .context("control API /stats returned invalid JSON")
    }

    /// Current merged configuration, as arbitrary JSON so the client stays
    /// compatible as config keys evolve.
    pub async fn config(&self) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(format!("{}/config", self.base_url))
            .send()
            .await
            .context("control API /config request failed")?
            .error_for_status()
            .context("control API /config returned error")?;
        response
            .json()
            .await
            .context("control API /config returned invalid JSON")
    }

    /// Read-only preset listing, as arbitrary JSON.
    pub async fn presets(&self) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(format!("{}/presets", self.base_url))
            .send()
            .await
            .context("control API /presets request failed")?
            .error_for_status()
            .context("control API /presets returned error")?;
        response
            .json()
            .await
            .context("control API /presets returned invalid JSON")
    }

    pub async fn allow_http(&self, entries: &[String]) -> Result<Vec<String>> {
        self.post_entries("/allow-http", entries).await
    }

    pub async fn allow_dns(&self, entries: &[String]) -> Result<Vec<String>> {
        self.post_entries("/allow-dns", entries).await
    }

    async fn post_entries(&self, path: &str, entries: &[String]) -> Result<Vec<String>> {
        if entries.is_empty() {
            return Err(anyhow!("no entries supplied"));
        }
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(&EntriesRequest { entries })
            .send()
            .await
            .with_context(|| format!("control API {path} request failed"))?;
        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let message = response.text().await.unwrap_or_default();
            return Err(anyhow!("control API rejected entries: {message}"));
        }
        let payload: AddedResponse = response
            .error_for_status()
            .with_context(|| format!("control API {path} returned error"))?
            .json()
            .await
            .with_context(|| format!("control API {path} returned invalid JSON"))?;
        Ok(payload.added)
    }

    pub async fn telemetry_events(
        &self,
        after: Option<u64>,
        agent: Option<&str>,
        raw: bool,
    ) -> Result<Vec<TelemetryEvent>> {
        let mut params = Vec::new();
        if let Some(after) = after {
            params.push(format!("after={after}"));
        }
        if let Some(agent) = agent {
            params.push(format!("agent={agent}"));
        }
        if raw {
            params.push("raw=true".to_string());
        }
        let mut url = format!("{}/telemetry/events", self.base_url);
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("control API /telemetry/events request failed")?
            .error_for_status()
            .context("control API /telemetry/events returned error")?;
        response
            .json()
            .await
            .context("control API /telemetry/events returned invalid JSON")
    }

    pub async fn telemetry_metrics(&self, raw: bool) -> Result<Vec<MetricSummary>> {
        let mut url = format!("{}/telemetry/metrics", self.base_url);
        if raw {
            url.push_str("?raw=true");
        }
        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("control API /telemetry/metrics request failed")?
            .error_for_status()
            .context("control API /telemetry/metrics returned error")?;
        response
            .json()
            .await
            .context("control API /telemetry/metrics returned invalid JSON")
    }
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
