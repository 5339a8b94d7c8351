use crate::reasons::REASON_NOT_IN_ALLOWLIST;
use crate::reasons::REASON_RESOLVED_IP_BLOCKED;
use crate::request_log::Decision;
use crate::request_log::LogAction;
use crate::request_log::LogSource;
use crate::rules::normalize_host;
use crate::state::HOST_GATEWAY_NAME;
use crate::state::SessionState;
use anyhow::Context;
use anyhow::Result;
use hickory_proto::op::Message;
use hickory_proto::op::MessageType;
use hickory_proto::op::OpCode;
use hickory_proto::op::Query;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RData;
use hickory_proto::rr::Record;
use hickory_proto::rr::RecordType;
use hickory_proto::rr::rdata::A;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_MESSAGE_BYTES: usize = 4096;
const SYNTHETIC_TTL: u32 = 60;

/// Bind UDP and TCP listeners on `addr` and serve until one of them fails.
pub async fn run_dns(state: Arc<SessionState>, addr: SocketAddr) -> Result<()> {
    let udp = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("bind DNS UDP listener: {addr}"))?;
    let tcp = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind DNS TCP listener: {addr}"))?;
    run_dns_with_sockets(state, udp, tcp).await
}

pub async fn run_dns_with_sockets(
    state: Arc<SessionState>,
    udp: UdpSocket,
    tcp: TcpListener,
) -> Result<()> {
    let addr = udp.local_addr().context("read DNS listener local addr")?;
    info!("DNS filter listening on {addr} (udp+tcp)");
    tokio::try_join!(serve_udp(state.clone(), udp), serve_tcp(state, tcp))?;
    Ok(())
}

async fn serve_udp(state: Arc<SessionState>, socket: UdpSocket) -> Result<()> {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
    loop {
        let (len, peer) = socket
            .recv_from(&mut buf)
            .await
            .context("DNS UDP receive failed")?;
        let query = buf[..len].to_vec();
        let state = state.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            let response = handle_query(&state, &query).await;
            if !response.is_empty()
                && let Err(err) = socket.send_to(&response, peer).await
            {
                debug!("DNS UDP send to {peer} failed: {err}");
            }
        });
    }
}

async fn serve_tcp(state: Arc<SessionState>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("DNS TCP accept failed")?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_tcp_conn(&state, stream).await {
                debug!("DNS TCP connection from {peer} ended: {err}");
            }
        });
    }
}

/// TCP DNS frames every message with a two-byte length prefix.
async fn serve_tcp_conn(state: &SessionState, mut stream: TcpStream) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_MESSAGE_BYTES {
            return Ok(());
        }
        let mut query = vec![0u8; len];
        stream
            .read_exact(&mut query)
            .await
            .context("short DNS TCP message")?;

        let response = handle_query(state, &query).await;
        if response.is_empty() {
            return Ok(());
        }
        let response_len =
            u16::try_from(response.len()).context("DNS response exceeds TCP frame limit")?;
        stream.write_all(&response_len.to_be_bytes()).await?;
        stream.write_all(&response).await?;
    }
}

/// Filter one DNS query and produce the wire-format response.
pub async fn handle_query(state: &SessionState, query_bytes: &[u8]) -> Vec<u8> {
    let query_id = query_bytes
        .get(..2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .unwrap_or_default();
    let Ok(query) = Message::from_vec(query_bytes) else {
        return error_response(query_id, ResponseCode::ServFail, &[]);
    };
    let Some(question) = query.queries().first().cloned() else {
        return error_response(query.id(), ResponseCode::ServFail, &[]);
    };
    let name = normalize_host(&question.name().to_utf8());

    // The sandbox needs a stable way to reach the proxy itself; this name is
    // answered locally, bypassing both upstream and the CIDR scan.
    if name == HOST_GATEWAY_NAME
        && question.query_type() == RecordType::A
        && let Some(proxy_ip) = state.proxy_ip
    {
        state.record(Decision {
            domain: name,
            port: None,
            action: LogAction::Allow,
            source: LogSource::Dns,
            reason: None,
        });
        let record =
            Record::from_rdata(question.name().clone(), SYNTHETIC_TTL, RData::A(A(proxy_ip)));
        let mut response = Message::new();
        response
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(query.recursion_desired())
            .set_recursion_available(true)
            .set_response_code(ResponseCode::NoError)
            .add_query(question)
            .add_answer(record);
        return response.to_vec().unwrap_or_default();
    }

    if !state.dns_allows(&name) {
        state.record(Decision {
            domain: name,
            port: None,
            action: LogAction::Block,
            source: LogSource::Dns,
            reason: Some(REASON_NOT_IN_ALLOWLIST.to_string()),
        });
        return error_response(query.id(), ResponseCode::NXDomain, &[question]);
    }

    let answer_bytes = match forward_upstream(state.upstream, query_bytes).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("DNS upstream exchange for {name} failed: {err}");
            return error_response(query.id(), ResponseCode::ServFail, &[question]);
        }
    };
    let Ok(answer) = Message::from_vec(&answer_bytes) else {
        warn!("DNS upstream returned an unparseable answer for {name}");
        return error_response(query.id(), ResponseCode::ServFail, &[question]);
    };

    // Rebinding guard: a permissive allowlist must not let a public name
    // resolve into internal ranges.
    if let Some(ip) = first_blocked_address(state, &answer) {
        debug!("DNS answer for {name} resolves to blocked address {ip}");
        state.record(Decision {
            domain: name,
            port: None,
            action: LogAction::Block,
            source: LogSource::Dns,
            reason: Some(REASON_RESOLVED_IP_BLOCKED.to_string()),
        });
        return error_response(query.id(), ResponseCode::NXDomain, &[question]);
    }

    state.record(Decision {
        domain: name,
        port: None,
        action: LogAction::Allow,
        source: LogSource::Dns,
        reason: None,
    });
    answer_bytes
}

async fn forward_upstream(upstream: SocketAddr, query_bytes: &[u8]) -> Result<Vec<u8>> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))
        .await
        .context("bind upstream DNS socket")?;
    socket
        .send_to(query_bytes, upstream)
        .await
        .with_context(|| format!("send DNS query to upstream {upstream}"))?;
    let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
    let (len, _) = timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .with_context(|| format!("upstream {upstream} timed out"))?
        .with_context(|| format!("receive DNS answer from upstream {upstream}"))?;
    buf.truncate(len);
    Ok(buf)
}

fn first_blocked_address(state: &SessionState, answer: &Message) -> Option<IpAddr> {
    answer
        .answers()
        .iter()
        .chain(answer.additionals())
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .find(|ip| state.cidr_blocker.is_blocked(*ip))
}

fn error_response(id: u16, code: ResponseCode, questions: &[Query]) -> Vec<u8> {
    let mut response = Message::new();
    response
        .set_id(id)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_available(true)
        .set_response_code(code);
    for question in questions {
        response.add_query(question.clone());
    }
    response.to_vec().unwrap_or_default()
}
