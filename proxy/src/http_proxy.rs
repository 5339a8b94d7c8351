use crate::reasons::REASON_HOST_PORT_NOT_ALLOWED;
use crate::reasons::REASON_NOT_IN_ALLOWLIST;
use crate::reasons::resolved_ip_blocked;
use crate::request_log::Decision;
use crate::request_log::LogAction;
use crate::request_log::LogSource;
use crate::responses::ProxyBody;
use crate::responses::blocked_response;
use crate::responses::empty_body;
use crate::responses::text_response;
use crate::rules::normalize_host;
use crate::state::HOST_GATEWAY_NAME;
use crate::state::SessionState;
use anyhow::Context;
use anyhow::Result;
use http_body_util::BodyExt;
use hyper::Method;
use hyper::Request;
use hyper::Response;
use hyper::StatusCode;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);
const TUNNEL_IDLE_CAP: Duration = Duration::from_secs(30 * 60);

type UpstreamClient = Client<HttpConnector, Incoming>;

pub async fn run_http_proxy(state: Arc<SessionState>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind HTTP proxy: {addr}"))?;
    run_http_proxy_with_listener(state, listener).await
}

pub async fn run_http_proxy_with_listener(
    state: Arc<SessionState>,
    listener: TcpListener,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("read HTTP proxy listener local addr")?;
    let client: UpstreamClient = Client::builder(TokioExecutor::new()).build_http();
    info!("HTTP proxy listening on {addr}");

    loop {
        let (stream, peer) = listener.accept().await.context("HTTP proxy accept failed")?;
        let state = state.clone();
        let client = client.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let state = state.clone();
                let client = client.clone();
                async move { handle_request(state, client, req).await }
            });
            if let Err(err) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!("proxy connection from {peer} ended: {err}");
            }
        });
    }
}

async fn handle_request(
    state: Arc<SessionState>,
    client: UpstreamClient,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
    if req.method() == Method::CONNECT {
        Ok(handle_connect(state, req).await)
    } else {
        Ok(handle_plain(state, client, req).await)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CheckOutcome {
    /// Request admitted; `connect_host` is the destination to dial, which
    /// differs from the requested host only on the `host.vibepit` path.
    Allow { connect_host: String },
    Block { reason: String },
}

/// The single admission decision shared by plain HTTP and CONNECT.
async fn check_request(state: &SessionState, host: &str, port: u16) -> CheckOutcome {
    let port_str = port.to_string();

    // host.vibepit is answered by policy alone: the gateway address it maps
    // to is private by construction, so the CIDR re-check cannot apply.
    if host == HOST_GATEWAY_NAME {
        let Some(gateway) = state.host_gateway else {
            return CheckOutcome::Block {
                reason: REASON_NOT_IN_ALLOWLIST.to_string(),
            };
        };
        if state.host_ports.permits(port) || state.http_allowlist.allows(host, &port_str) {
            return CheckOutcome::Allow {
                connect_host: gateway.to_string(),
            };
        }
        return CheckOutcome::Block {
            reason: REASON_HOST_PORT_NOT_ALLOWED.to_string(),
        };
    }

    if !state.http_allowlist.allows(host, &port_str) {
        return CheckOutcome::Block {
            reason: REASON_NOT_IN_ALLOWLIST.to_string(),
        };
    }

    // Re-check the resolved addresses so a permissive allow rule cannot be
    // combined with DNS tricks to reach internal ranges.
    if let Some(ip) = resolve_blocked_address(state, host, port).await {
        return CheckOutcome::Block {
            reason: resolved_ip_blocked(ip),
        };
    }

    CheckOutcome::Allow {
        connect_host: host.to_string(),
    }
}

async fn resolve_blocked_address(state: &SessionState, host: &str, port: u16) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return state.cidr_blocker.is_blocked(ip).then_some(ip);
    }
    match timeout(RESOLVE_TIMEOUT, lookup_host((host, port))).await {
        Ok(Ok(addrs)) => addrs
            .map(|addr| addr.ip())
            .find(|ip| state.cidr_blocker.is_blocked(*ip)),
        Ok(Err(err)) => {
            // Leave unresolvable names to the dial, which will fail with a
            // gateway error of its own.
            debug!("resolution of {host} failed during CIDR re-check: {err}");
            None
        }
        Err(_) => {
            debug!("resolution of {host} timed out during CIDR re-check");
            None
        }
    }
}

fn log_decision(state: &SessionState, host: &str, port: u16, reason: Option<&str>) {
    state.record(Decision {
        domain: host.to_string(),
        port: Some(port.to_string()),
        action: if reason.is_some() {
            LogAction::Block
        } else {
            LogAction::Allow
        },
        source: LogSource::Proxy,
        reason: reason.map(ToString::to_string),
    });
}

async fn handle_connect(state: Arc<SessionState>, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        return text_response(StatusCode::BAD_REQUEST, "missing CONNECT authority");
    };
    let host = host_for_policy(authority.host());
    if host.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "invalid host");
    }
    let port = authority.port_u16().unwrap_or(443);

    match check_request(&state, &host, port).await {
        CheckOutcome::Block { reason } => {
            log_decision(&state, &host, port, Some(&reason));
            warn!("CONNECT blocked (host={host}, port={port}, reason={reason})");
            blocked_response(&host, &port.to_string(), &reason)
        }
        CheckOutcome::Allow { connect_host } => {
            log_decision(&state, &host, port, None);
            info!("CONNECT allowed (host={host}, port={port})");
            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => {
                        if let Err(err) = tunnel(upgraded, &connect_host, port).await {
                            debug!("tunnel to {connect_host}:{port} closed: {err}");
                        }
                    }
                    Err(err) => {
                        warn!("CONNECT upgrade for {host}:{port} failed: {err}");
                    }
                }
            });
            Response::new(empty_body())
        }
    }
}

async fn tunnel(upgraded: hyper::upgrade::Upgraded, host: &str, port: u16) -> Result<()> {
    let mut server = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("dial {host}:{port}"))?;
    let mut client = TokioIo::new(upgraded);
    // The cap bounds tunnels whose peers hang; normal closes finish earlier.
    match timeout(
        TUNNEL_IDLE_CAP,
        tokio::io::copy_bidirectional(&mut client, &mut server),
    )
    .await
    {
        Ok(result) => {
            result.with_context(|| format!("forward tunnel to {host}:{port}"))?;
            Ok(())
        }
        Err(_) => {
            info!("tunnel to {host}:{port} hit the idle cap, closing");
            Ok(())
        }
    }
}

async fn handle_plain(
    state: Arc<SessionState>,
    client: UpstreamClient,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let Some(host) = req.uri().host().map(host_for_policy) else {
        return text_response(
            StatusCode::BAD_REQUEST,
            "proxy requests must use absolute-form URIs",
        );
    };
    let port = req.uri().port_u16().unwrap_or(80);
    let method = req.method().clone();

    match check_request(&state, &host, port).await {
        CheckOutcome::Block { reason } => {
            log_decision(&state, &host, port, Some(&reason));
            warn!("request blocked (host={host}, port={port}, method={method}, reason={reason})");
            blocked_response(&host, &port.to_string(), &reason)
        }
        CheckOutcome::Allow { connect_host } => {
            log_decision(&state, &host, port, None);
            info!("request allowed (host={host}, port={port}, method={method})");
            let req = match prepare_upstream_request(req, &host, &connect_host, port) {
                Ok(req) => req,
                Err(err) => {
                    warn!("failed to prepare upstream request for {host}: {err}");
                    return text_response(StatusCode::BAD_REQUEST, "invalid request target");
                }
            };
            match client.request(req).await {
                Ok(response) => response.map(BodyExt::boxed),
                Err(err) => {
                    warn!("upstream request to {connect_host}:{port} failed: {err}");
                    text_response(StatusCode::BAD_GATEWAY, "upstream request failed")
                }
            }
        }
    }
}

/// Strip hop-by-hop headers and, on the `host.vibepit` path, retarget the
/// URI and `Host` header at the gateway. The original `Host` header is
/// preserved for every other destination.
fn prepare_upstream_request(
    req: Request<Incoming>,
    host: &str,
    connect_host: &str,
    port: u16,
) -> Result<Request<Incoming>> {
    let (mut parts, body) = req.into_parts();
    remove_hop_by_hop_headers(&mut parts.headers);

    if connect_host != host {
        let authority = format_authority(connect_host, port);
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        parts.uri = format!("http://{authority}{path_and_query}")
            .parse()
            .with_context(|| format!("rebuild URI for gateway target {authority}"))?;
        parts.headers.insert(
            hyper::header::HOST,
            HeaderValue::from_str(&authority)
                .with_context(|| format!("rebuild Host header for {authority}"))?,
        );
    }

    Ok(Request::from_parts(parts, body))
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn host_for_policy(host: &str) -> String {
    normalize_host(host.trim_matches(|c| c == '[' || c == ']'))
}

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn remove_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    // Connection can name additional per-hop headers; drop those first.
    let connection_values: Vec<HeaderValue> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .cloned()
        .collect();
    headers.remove(hyper::header::CONNECTION);
    for value in connection_values {
        if let Ok(tokens) = value.to_str() {
            for token in tokens.split(',') {
                let token = token.trim().to_ascii_lowercase();
                if !token.is_empty() {
                    headers.remove(token.as_str());
                }
            }
        }
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
