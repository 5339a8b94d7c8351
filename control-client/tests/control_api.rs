//! End-to-end tests for the control plane: a live control API behind mTLS,
//! driven through [`vibepit_control_client::ControlClient`].

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use vibepit_control_client::ControlClient;
use vibepit_control_client::LogAction;
use vibepit_control_client::LogSource;
use vibepit_pki::SessionPki;
use vibepit_proxy::Decision;
use vibepit_proxy::ProxyConfig;
use vibepit_proxy::SessionState;
use vibepit_proxy::TlsMaterial;
use vibepit_proxy::run_control_api_with_listener;
use vibepit_proxy::server_tls_config;

async fn start_control_api(
    config: ProxyConfig,
    pki: &SessionPki,
) -> (Arc<SessionState>, u16) {
    let material = TlsMaterial {
        cert_pem: pki.server_cert_pem.clone(),
        key_pem: pki.server_key_pem.clone(),
        ca_pem: pki.ca_cert_pem.clone(),
    };
    let tls_config = server_tls_config(&material).unwrap();
    let state = Arc::new(SessionState::from_config(config).unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server_state = state.clone();
    tokio::spawn(async move {
        let _ = run_control_api_with_listener(server_state, listener, tls_config).await;
    });
    (state, port)
}

fn client_for(pki: &SessionPki, port: u16) -> ControlClient {
    ControlClient::new(
        pki.ca_cert_pem.as_bytes(),
        pki.client_cert_pem.as_bytes(),
        pki.client_key_pem.as_bytes(),
        port,
    )
    .unwrap()
}

#[tokio::test]
async fn health_round_trips_over_mtls() {
    let pki = SessionPki::generate(Duration::from_secs(3600)).unwrap();
    let (_state, port) = start_control_api(ProxyConfig::default(), &pki).await;
    client_for(&pki, port).health().await.unwrap();
}

#[tokio::test]
async fn credentials_directory_round_trips() {
    let pki = SessionPki::generate(Duration::from_secs(3600)).unwrap();
    let (_state, port) = start_control_api(ProxyConfig::default(), &pki).await;

    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("session-1");
    pki.write_client_credentials(&dir).unwrap();
    let client = ControlClient::from_credentials_dir(&dir, port).unwrap();
    client.health().await.unwrap();
}

#[tokio::test]
async fn runtime_rule_addition_takes_effect() {
    let pki = SessionPki::generate(Duration::from_secs(3600)).unwrap();
    let (state, port) = start_control_api(ProxyConfig::default(), &pki).await;
    let client = client_for(&pki, port);

    assert!(!state.http_allowlist.allows("bun.sh", "443"));
    let added = client
        .allow_http(&["bun.sh:443".to_string()])
        .await
        .unwrap();
    assert_eq!(added, vec!["bun.sh:443".to_string()]);
    assert!(state.http_allowlist.allows("bun.sh", "443"));

    // A portless entry is rejected as a whole and mutates nothing.
    let err = client
        .allow_http(&["github.com".to_string()])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("rejected"));
    assert!(!state.http_allowlist.allows("github.com", "443"));

    let config = client.config().await.unwrap();
    assert_eq!(config["allow-http"][0], "bun.sh:443");
}

#[tokio::test]
async fn logs_and_stats_are_visible_to_the_client() {
    let pki = SessionPki::generate(Duration::from_secs(3600)).unwrap();
    let (state, port) = start_control_api(ProxyConfig::default(), &pki).await;
    let client = client_for(&pki, port);

    for _ in 0..3 {
        state.record(Decision {
            domain: "evil.example".to_string(),
            port: Some("443".to_string()),
            action: vibepit_proxy::LogAction::Block,
            source: vibepit_proxy::LogSource::Proxy,
            reason: Some("domain not in allowlist".to_string()),
        });
    }

    let logs = client.logs(Some(0)).await.unwrap();
    assert_eq!(logs.len(), 3);
    assert_eq!(logs[0].action, LogAction::Block);
    assert_eq!(logs[0].source, LogSource::Proxy);
    assert_eq!(logs[0].reason.as_deref(), Some("domain not in allowlist"));

    let newer = client.logs(Some(logs[2].id)).await.unwrap();
    assert!(newer.is_empty());

    let stats = client.stats().await.unwrap();
    assert_eq!(stats["evil.example"].blocked, 3);
}

#[tokio::test]
async fn telemetry_endpoints_answer_even_when_disabled() {
    let pki = SessionPki::generate(Duration::from_secs(3600)).unwrap();
    let (_state, port) = start_control_api(ProxyConfig::default(), &pki).await;
    let client = client_for(&pki, port);

    assert!(client.telemetry_events(None, None, false).await.unwrap().is_empty());
    assert!(client.telemetry_metrics(false).await.unwrap().is_empty());
}

#[tokio::test]
async fn client_cert_from_a_different_ca_fails_the_handshake() {
    let real = SessionPki::generate(Duration::from_secs(3600)).unwrap();
    let imposter = SessionPki::generate(Duration::from_secs(3600)).unwrap();
    let (_state, port) = start_control_api(ProxyConfig::default(), &real).await;

    // Trusts the real server CA, but presents a foreign client cert.
    let client = ControlClient::new(
        real.ca_cert_pem.as_bytes(),
        imposter.client_cert_pem.as_bytes(),
        imposter.client_key_pem.as_bytes(),
        port,
    )
    .unwrap();
    assert!(client.health().await.is_err());
}

#[tokio::test]
async fn server_from_an_unknown_ca_is_rejected_by_the_client() {
    let real = SessionPki::generate(Duration::from_secs(3600)).unwrap();
    let imposter = SessionPki::generate(Duration::from_secs(3600)).unwrap();
    let (_state, port) = start_control_api(ProxyConfig::default(), &real).await;

    // Presents valid-looking client material but pins the wrong root.
    let client = ControlClient::new(
        imposter.ca_cert_pem.as_bytes(),
        real.client_cert_pem.as_bytes(),
        real.client_key_pem.as_bytes(),
        port,
    )
    .unwrap();
    assert!(client.health().await.is_err());
}
