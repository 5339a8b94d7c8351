use crate::responses::ProxyBody;
use crate::responses::json_response;
use crate::responses::text_response;
use crate::state::SessionState;
use crate::telemetry::EventInput;
use crate::telemetry::MetricSummary;
use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use bytes::Bytes;
use governor::DefaultDirectRateLimiter;
use governor::Quota;
use governor::RateLimiter;
use http_body_util::BodyExt;
use http_body_util::LengthLimitError;
use http_body_util::Limited;
use hyper::Request;
use hyper::Response;
use hyper::StatusCode;
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::common::v1::AnyValue;
use opentelemetry_proto::tonic::common::v1::KeyValue;
use opentelemetry_proto::tonic::common::v1::any_value::Value;
use opentelemetry_proto::tonic::metrics::v1::AggregationTemporality;
use opentelemetry_proto::tonic::metrics::v1::NumberDataPoint;
use opentelemetry_proto::tonic::metrics::v1::metric::Data;
use opentelemetry_proto::tonic::metrics::v1::number_data_point;
use prost::Message as _;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;

pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
const RATE_LIMIT_PER_SECOND: u32 = 100;
const RATE_LIMIT_BURST: u32 = 20;
const BODY_READ_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECTION_CAP: Duration = Duration::from_secs(60);
const UNKNOWN_AGENT: &str = "unknown";
const DEFAULT_EVENT_NAME: &str = "log";

fn rate_limiter() -> DefaultDirectRateLimiter {
    let per_second = NonZeroU32::new(RATE_LIMIT_PER_SECOND).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(RATE_LIMIT_BURST).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_second(per_second).allow_burst(burst))
}

pub async fn run_otlp(state: Arc<SessionState>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind OTLP receiver: {addr}"))?;
    run_otlp_with_listener(state, listener).await
}

pub async fn run_otlp_with_listener(
    state: Arc<SessionState>,
    listener: TcpListener,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("read OTLP listener local addr")?;
    let limiter = Arc::new(rate_limiter());
    info!("OTLP receiver listening on {addr}");

    loop {
        let (stream, peer) = listener.accept().await.context("OTLP accept failed")?;
        let state = state.clone();
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let state = state.clone();
                let limiter = limiter.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(handle_request(&state, &limiter, req).await)
                }
            });
            let conn = http1::Builder::new()
                .header_read_timeout(BODY_READ_TIMEOUT)
                .serve_connection(io, service);
            match timeout(CONNECTION_CAP, conn).await {
                Ok(Err(err)) => debug!("OTLP connection from {peer} ended: {err}"),
                Err(_) => debug!("OTLP connection from {peer} hit the idle cap"),
                Ok(Ok(())) => {}
            }
        });
    }
}

pub(crate) async fn handle_request<B>(
    state: &SessionState,
    limiter: &DefaultDirectRateLimiter,
    req: Request<B>,
) -> Response<ProxyBody>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = req.uri().path().to_string();
    let is_ingest_path = matches!(path.as_str(), "/v1/logs" | "/v1/metrics");
    if !is_ingest_path {
        return text_response(StatusCode::NOT_FOUND, "not found");
    }
    if req.method() != hyper::Method::POST {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    if limiter.check().is_err() {
        return text_response(StatusCode::TOO_MANY_REQUESTS, "rate limited");
    }

    let body = match read_body(req.into_body()).await {
        Ok(body) => body,
        Err(BodyError::TooLarge) => {
            return text_response(StatusCode::PAYLOAD_TOO_LARGE, "body too large");
        }
        Err(BodyError::Read) => {
            return text_response(StatusCode::BAD_REQUEST, "failed to read body");
        }
    };

    let result = match path.as_str() {
        "/v1/logs" => ingest_logs(state, &body),
        _ => ingest_metrics(state, &body),
    };
    match result {
        Ok(()) => json_response(&serde_json::json!({})),
        Err(err) => {
            debug!("rejecting OTLP payload on {path}: {err}");
            text_response(StatusCode::BAD_REQUEST, "invalid protobuf payload")
        }
    }
}

enum BodyError {
    TooLarge,
    Read,
}

async fn read_body<B>(body: B) -> Result<Bytes, BodyError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let limited = Limited::new(body, MAX_BODY_BYTES);
    match timeout(BODY_READ_TIMEOUT, limited.collect()).await {
        Ok(Ok(collected)) => Ok(collected.to_bytes()),
        Ok(Err(err)) => {
            if err.downcast_ref::<LengthLimitError>().is_some() {
                Err(BodyError::TooLarge)
            } else {
                Err(BodyError::Read)
            }
        }
        Err(_) => Err(BodyError::Read),
    }
}

pub(crate) fn ingest_logs(state: &SessionState, body: &[u8]) -> Result<()> {
    let request =
        ExportLogsServiceRequest::decode(body).context("invalid OTLP logs protobuf")?;
    let Some(telemetry) = &state.telemetry else {
        bail!("telemetry ingest is disabled");
    };
    for resource_logs in &request.resource_logs {
        let agent = resource_logs
            .resource
            .as_ref()
            .and_then(|resource| attr_string(&resource.attributes, "service.name"))
            .unwrap_or_else(|| UNKNOWN_AGENT.to_string());
        for scope_logs in &resource_logs.scope_logs {
            for record in &scope_logs.log_records {
                let event_name = attr_string(&record.attributes, "event.name")
                    .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string());
                let mut attrs = BTreeMap::new();
                for attribute in &record.attributes {
                    if attribute.key == "event.name" {
                        continue;
                    }
                    if let Some(value) = attribute.value.as_ref().and_then(any_value_to_string) {
                        attrs.insert(attribute.key.clone(), value);
                    }
                }
                let raw_log = serde_json::to_value(record).ok();
                telemetry.record_event(EventInput {
                    agent: agent.clone(),
                    event_name,
                    attrs,
                    raw_log,
                });
            }
        }
    }
    Ok(())
}

pub(crate) fn ingest_metrics(state: &SessionState, body: &[u8]) -> Result<()> {
    let request =
        ExportMetricsServiceRequest::decode(body).context("invalid OTLP metrics protobuf")?;
    let Some(telemetry) = &state.telemetry else {
        bail!("telemetry ingest is disabled");
    };
    for resource_metrics in &request.resource_metrics {
        let agent = resource_metrics
            .resource
            .as_ref()
            .and_then(|resource| attr_string(&resource.attributes, "service.name"))
            .unwrap_or_else(|| UNKNOWN_AGENT.to_string());
        for scope_metrics in &resource_metrics.scope_metrics {
            for metric in &scope_metrics.metrics {
                let (points, delta) = match &metric.data {
                    Some(Data::Sum(sum)) => (
                        &sum.data_points,
                        sum.aggregation_temporality == AggregationTemporality::Delta as i32,
                    ),
                    Some(Data::Gauge(gauge)) => (&gauge.data_points, false),
                    // Histograms and exponential histograms are not
                    // summarizable into a single value; skip them.
                    _ => continue,
                };
                let raw = serde_json::to_value(metric).ok();
                for point in points {
                    let Some(value) = number_point_value(point) else {
                        continue;
                    };
                    let mut attributes = BTreeMap::new();
                    for attribute in &point.attributes {
                        if let Some(value) = attribute.value.as_ref().and_then(any_value_to_string)
                        {
                            attributes.insert(attribute.key.clone(), value);
                        }
                    }
                    if delta {
                        attributes.insert("temporality".to_string(), "delta".to_string());
                    }
                    telemetry.record_metric(MetricSummary {
                        name: metric.name.clone(),
                        agent: agent.clone(),
                        value,
                        attributes,
                        raw: raw.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn attr_string(attributes: &[KeyValue], key: &str) -> Option<String> {
    attributes
        .iter()
        .find(|attribute| attribute.key == key)
        .and_then(|attribute| attribute.value.as_ref())
        .and_then(any_value_to_string)
}

/// String/int/double/bool values flatten to strings; composite values are
/// dropped (they remain visible through `raw_log`).
fn any_value_to_string(value: &AnyValue) -> Option<String> {
    match value.value.as_ref()? {
        Value::StringValue(s) => Some(s.clone()),
        Value::IntValue(i) => Some(i.to_string()),
        Value::DoubleValue(d) => Some(d.to_string()),
        Value::BoolValue(b) => Some(b.to_string()),
        _ => None,
    }
}

fn number_point_value(point: &NumberDataPoint) -> Option<f64> {
    match point.value.as_ref()? {
        number_data_point::Value::AsDouble(value) => Some(*value),
        number_data_point::Value::AsInt(value) => Some(*value as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::ProxyConfig;
    use http_body_util::Full;
    use hyper::Method;
    use opentelemetry_proto::tonic::common::v1::InstrumentationScope;
    use opentelemetry_proto::tonic::logs::v1::LogRecord;
    use opentelemetry_proto::tonic::logs::v1::ResourceLogs;
    use opentelemetry_proto::tonic::logs::v1::ScopeLogs;
    use opentelemetry_proto::tonic::metrics::v1::Gauge;
    use opentelemetry_proto::tonic::metrics::v1::Metric;
    use opentelemetry_proto::tonic::metrics::v1::ResourceMetrics;
    use opentelemetry_proto::tonic::metrics::v1::ScopeMetrics;
    use opentelemetry_proto::tonic::metrics::v1::Sum;
    use opentelemetry_proto::tonic::resource::v1::Resource;
    use pretty_assertions::assert_eq;

    fn telemetry_state() -> SessionState {
        SessionState::from_config(ProxyConfig {
            otlp_port: 4318,
            ..ProxyConfig::default()
        })
        .unwrap()
    }

    fn string_attr(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(Value::StringValue(value.to_string())),
            }),
        }
    }

    fn int_attr(key: &str, value: i64) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(Value::IntValue(value)),
            }),
        }
    }

    fn logs_request(agent: Option<&str>, records: Vec<LogRecord>) -> ExportLogsServiceRequest {
        ExportLogsServiceRequest {
            resource_logs: vec![ResourceLogs {
                resource: agent.map(|name| Resource {
                    attributes: vec![string_attr("service.name", name)],
                    ..Resource::default()
                }),
                scope_logs: vec![ScopeLogs {
                    scope: Some(InstrumentationScope::default()),
                    log_records: records,
                    ..ScopeLogs::default()
                }],
                ..ResourceLogs::default()
            }],
        }
    }

    fn gauge_request(agent: &str, name: &str, value: f64) -> ExportMetricsServiceRequest {
        ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: Some(Resource {
                    attributes: vec![string_attr("service.name", agent)],
                    ..Resource::default()
                }),
                scope_metrics: vec![ScopeMetrics {
                    metrics: vec![Metric {
                        name: name.to_string(),
                        data: Some(Data::Gauge(Gauge {
                            data_points: vec![NumberDataPoint {
                                value: Some(number_data_point::Value::AsDouble(value)),
                                ..NumberDataPoint::default()
                            }],
                        })),
                        ..Metric::default()
                    }],
                    ..ScopeMetrics::default()
                }],
                ..ResourceMetrics::default()
            }],
        }
    }

    #[test]
    fn logs_flatten_into_events() {
        let state = telemetry_state();
        let request = logs_request(
            Some("agent-1"),
            vec![LogRecord {
                attributes: vec![
                    string_attr("event.name", "tool_call"),
                    string_attr("tool", "bash"),
                    int_attr("attempt", 2),
                ],
                ..LogRecord::default()
            }],
        );
        ingest_logs(&state, &request.encode_to_vec()).unwrap();

        let events = state.telemetry.as_ref().unwrap().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent, "agent-1");
        assert_eq!(events[0].event_name, "tool_call");
        assert_eq!(events[0].attrs.get("tool").map(String::as_str), Some("bash"));
        assert_eq!(events[0].attrs.get("attempt").map(String::as_str), Some("2"));
        assert!(!events[0].attrs.contains_key("event.name"));
        assert!(events[0].raw_log.is_some());
    }

    #[test]
    fn missing_service_name_falls_back_to_unknown() {
        let state = telemetry_state();
        let request = logs_request(None, vec![LogRecord::default()]);
        ingest_logs(&state, &request.encode_to_vec()).unwrap();
        let events = state.telemetry.as_ref().unwrap().events();
        assert_eq!(events[0].agent, "unknown");
        assert_eq!(events[0].event_name, "log");
    }

    #[test]
    fn gauge_points_become_metric_summaries() {
        let state = telemetry_state();
        let request = gauge_request("agent-1", "cpu.usage", 0.75);
        ingest_metrics(&state, &request.encode_to_vec()).unwrap();

        let metrics = state.telemetry.as_ref().unwrap().metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "cpu.usage");
        assert_eq!(metrics[0].agent, "agent-1");
        assert_eq!(metrics[0].value, 0.75);
    }

    #[test]
    fn delta_sums_are_flagged() {
        let state = telemetry_state();
        let request = ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: None,
                scope_metrics: vec![ScopeMetrics {
                    metrics: vec![Metric {
                        name: "tokens".to_string(),
                        data: Some(Data::Sum(Sum {
                            data_points: vec![NumberDataPoint {
                                value: Some(number_data_point::Value::AsInt(42)),
                                ..NumberDataPoint::default()
                            }],
                            aggregation_temporality: AggregationTemporality::Delta as i32,
                            is_monotonic: true,
                        })),
                        ..Metric::default()
                    }],
                    ..ScopeMetrics::default()
                }],
                ..ResourceMetrics::default()
            }],
        };
        ingest_metrics(&state, &request.encode_to_vec()).unwrap();

        let metrics = state.telemetry.as_ref().unwrap().metrics();
        assert_eq!(metrics[0].value, 42.0);
        assert_eq!(
            metrics[0].attributes.get("temporality").map(String::as_str),
            Some("delta")
        );
    }

    #[test]
    fn invalid_protobuf_is_an_error() {
        let state = telemetry_state();
        assert!(ingest_logs(&state, &[0xff; 8]).is_err());
        assert!(ingest_metrics(&state, &[0xff; 8]).is_err());
    }

    #[tokio::test]
    async fn http_surface_maps_errors_to_status_codes() {
        let state = telemetry_state();
        let limiter = rate_limiter();

        let ok = handle_request(
            &state,
            &limiter,
            Request::builder()
                .method(Method::POST)
                .uri("/v1/logs")
                .body(Full::new(Bytes::from(
                    logs_request(Some("a"), vec![LogRecord::default()]).encode_to_vec(),
                )))
                .unwrap(),
        )
        .await;
        assert_eq!(ok.status(), StatusCode::OK);

        let bad = handle_request(
            &state,
            &limiter,
            Request::builder()
                .method(Method::POST)
                .uri("/v1/metrics")
                .body(Full::new(Bytes::from_static(&[0xff; 8])))
                .unwrap(),
        )
        .await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let wrong_method = handle_request(
            &state,
            &limiter,
            Request::builder()
                .method(Method::GET)
                .uri("/v1/logs")
                .body(Full::new(Bytes::new()))
                .unwrap(),
        )
        .await;
        assert_eq!(wrong_method.status(), StatusCode::METHOD_NOT_ALLOWED);

        let not_found = handle_request(
            &state,
            &limiter,
            Request::builder()
                .method(Method::POST)
                .uri("/v1/traces")
                .body(Full::new(Bytes::new()))
                .unwrap(),
        )
        .await;
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversize_bodies_get_413() {
        let state = telemetry_state();
        let limiter = rate_limiter();
        let response = handle_request(
            &state,
            &limiter,
            Request::builder()
                .method(Method::POST)
                .uri("/v1/logs")
                .body(Full::new(Bytes::from(vec![0u8; MAX_BODY_BYTES + 1])))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn burst_beyond_the_bucket_is_rate_limited() {
        let state = telemetry_state();
        let limiter = rate_limiter();
        let mut limited = 0;
        for _ in 0..40 {
            let response = handle_request(
                &state,
                &limiter,
                Request::builder()
                    .method(Method::POST)
                    .uri("/v1/logs")
                    .body(Full::new(Bytes::from(
                        logs_request(Some("a"), vec![]).encode_to_vec(),
                    )))
                    .unwrap(),
            )
            .await;
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                limited += 1;
            }
        }
        assert!(limited > 0, "expected at least one 429 in a 40-request burst");
    }
}
