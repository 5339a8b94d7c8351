use crate::responses::ProxyBody;
use crate::responses::json_response;
use crate::responses::text_response;
use crate::rules::RuleParseError;
use crate::state::SessionState;
use crate::telemetry::MetricSummary;
use crate::telemetry::TelemetryEvent;
use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::Limited;
use hyper::Request;
use hyper::Response;
use hyper::StatusCode;
use hyper::Uri;
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::RootCertStore;
use rustls::ServerConfig;
use rustls::server::WebPkiClientVerifier;
use serde::Deserialize;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::debug;
use tracing::info;

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// PEM material for the control plane, handed over by the launcher through
/// the environment. All three variables are required; the control API never
/// runs in the clear.
pub struct TlsMaterial {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
}

pub const TLS_CERT_ENV: &str = "PROXY_TLS_CERT";
pub const TLS_KEY_ENV: &str = "PROXY_TLS_KEY";
pub const TLS_CA_ENV: &str = "PROXY_CA_CERT";

impl TlsMaterial {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            cert_pem: require_env(TLS_CERT_ENV)?,
            key_pem: require_env(TLS_KEY_ENV)?,
            ca_pem: require_env(TLS_CA_ENV)?,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("{name} must carry the control-plane TLS material; refusing to start"),
    }
}

pub(crate) fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// TLS 1.3 server config that requires and verifies client certificates
/// against the session CA.
pub fn server_tls_config(material: &TlsMaterial) -> Result<ServerConfig> {
    ensure_crypto_provider();

    let certs = rustls_pemfile::certs(&mut material.cert_pem.as_bytes())
        .collect::<std::io::Result<Vec<_>>>()
        .context("failed to parse server certificate PEM")?;
    if certs.is_empty() {
        bail!("server certificate PEM contains no certificates");
    }
    let key = rustls_pemfile::private_key(&mut material.key_pem.as_bytes())
        .context("failed to parse server key PEM")?
        .context("server key PEM contains no private key")?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut material.ca_pem.as_bytes()) {
        let cert = cert.context("failed to parse CA certificate PEM")?;
        roots
            .add(cert)
            .context("failed to add CA certificate to the client trust store")?;
    }
    if roots.is_empty() {
        bail!("CA certificate PEM contains no certificates");
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("failed to build client certificate verifier")?;

    let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("failed to build control API TLS config")?;
    Ok(config)
}

pub async fn run_control_api(
    state: Arc<SessionState>,
    addr: SocketAddr,
    tls_config: ServerConfig,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind control API: {addr}"))?;
    run_control_api_with_listener(state, listener, tls_config).await
}

pub async fn run_control_api_with_listener(
    state: Arc<SessionState>,
    listener: TcpListener,
    tls_config: ServerConfig,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("read control API listener local addr")?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    info!("control API listening on {addr} (mTLS)");

    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("control API accept failed")?;
        let state = state.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    debug!("control API TLS handshake with {peer} failed: {err}");
                    return;
                }
            };
            let io = TokioIo::new(tls_stream);
            let service = service_fn(move |req| {
                let state = state.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(handle_request(&state, req).await)
                }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!("control API connection from {peer} ended: {err}");
            }
        });
    }
}

#[derive(Debug, Deserialize)]
struct EntriesRequest {
    entries: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AddedResponse {
    added: Vec<String>,
}

pub(crate) async fn handle_request<B>(state: &SessionState, req: Request<B>) -> Response<ProxyBody>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let uri = req.uri().clone();
    match (method.as_str(), uri.path()) {
        ("GET", "/health") => text_response(StatusCode::OK, "ok"),
        ("GET", "/logs") => match query_param(&uri, "after") {
            None => json_response(&state.request_log.entries()),
            Some(raw) => match raw.parse::<u64>() {
                Ok(after) => json_response(&state.request_log.entries_after(after)),
                Err(_) => text_response(StatusCode::BAD_REQUEST, "invalid after cursor"),
            },
        },
        ("GET", "/stats") => json_response(&state.request_log.stats()),
        ("GET", "/config") => json_response(&state.current_config()),
        ("GET", "/presets") => match query_param(&uri, "expand") {
            None => json_response(&state.presets.all()),
            Some(names) => {
                let names: Vec<String> = names
                    .split(',')
                    .filter(|name| !name.is_empty())
                    .map(ToString::to_string)
                    .collect();
                json_response(&state.presets.expand(&names))
            }
        },
        ("POST", "/allow-http") => match read_entries(req.into_body()).await {
            Ok(entries) => match state.http_allowlist.add(&entries) {
                Ok(added) => json_response(&AddedResponse { added }),
                Err(err) => rule_error_response(&err),
            },
            Err(response) => *response,
        },
        ("POST", "/allow-dns") => match read_entries(req.into_body()).await {
            Ok(entries) => match state.dns_allowlist.add(&entries) {
                Ok(added) => json_response(&AddedResponse { added }),
                Err(err) => rule_error_response(&err),
            },
            Err(response) => *response,
        },
        ("GET", "/telemetry/events") => {
            let after = match query_param(&uri, "after").map(|raw| raw.parse::<u64>()) {
                Some(Err(_)) => {
                    return text_response(StatusCode::BAD_REQUEST, "invalid after cursor");
                }
                Some(Ok(after)) => after,
                None => 0,
            };
            let agent = query_param(&uri, "agent");
            let raw = bool_param(&uri, "raw");
            let events: Vec<TelemetryEvent> = state
                .telemetry
                .as_ref()
                .map(|telemetry| telemetry.events_after(after))
                .unwrap_or_default()
                .into_iter()
                .filter(|event| agent.as_ref().is_none_or(|agent| &event.agent == agent))
                .map(|mut event| {
                    if !raw {
                        event.raw_log = None;
                    }
                    event
                })
                .collect();
            json_response(&events)
        }
        ("GET", "/telemetry/metrics") => {
            let raw = bool_param(&uri, "raw");
            let metrics: Vec<MetricSummary> = state
                .telemetry
                .as_ref()
                .map(crate::telemetry::TelemetryBuffer::metrics)
                .unwrap_or_default()
                .into_iter()
                .map(|mut metric| {
                    if !raw {
                        metric.raw = None;
                    }
                    metric
                })
                .collect();
            json_response(&metrics)
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn rule_error_response(err: &RuleParseError) -> Response<ProxyBody> {
    text_response(StatusCode::BAD_REQUEST, &err.to_string())
}

/// All-or-nothing body parse for rule additions: malformed JSON or an
/// oversized body rejects the whole request without touching the lists.
async fn read_entries<B>(body: B) -> Result<Vec<String>, Box<Response<ProxyBody>>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let limited = Limited::new(body, MAX_REQUEST_BODY_BYTES);
    let bytes = match limited.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return Err(Box::new(text_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "body too large",
            )));
        }
    };
    match serde_json::from_slice::<EntriesRequest>(&bytes) {
        Ok(request) => Ok(request.entries),
        Err(err) => Err(Box::new(text_response(
            StatusCode::BAD_REQUEST,
            &format!("invalid request body: {err}"),
        ))),
    }
}

fn query_param(uri: &Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        (name == key).then(|| value.to_string())
    })
}

fn bool_param(uri: &Uri, key: &str) -> bool {
    matches!(query_param(uri, key).as_deref(), Some("true") | Some("1"))
}
