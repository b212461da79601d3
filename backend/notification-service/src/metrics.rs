use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_http_requests_total",
            "Total HTTP requests handled by the realtime notification service",
        ),
        &["method", "path", "status"],
    )
    .expect("failed to create realtime_http_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register realtime_http_requests_total");
    counter
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "realtime_http_request_duration_seconds",
            "HTTP request latency for the realtime notification service",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["method", "path", "status"],
    )
    .expect("failed to create realtime_http_request_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register realtime_http_request_duration_seconds");
    histogram
});

static WS_ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "realtime_ws_active_connections",
        "WebSocket connections currently in the registry",
    )
    .expect("failed to create realtime_ws_active_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register realtime_ws_active_connections");
    gauge
});

static WS_MESSAGES_SENT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_ws_messages_sent_total",
            "Event frames queued to WebSocket connections",
        ),
        &["event"],
    )
    .expect("failed to create realtime_ws_messages_sent_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register realtime_ws_messages_sent_total");
    counter
});

static WS_DELIVERY_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "realtime_ws_delivery_retries_total",
        "Unacknowledged messages resent",
    )
    .expect("failed to create realtime_ws_delivery_retries_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register realtime_ws_delivery_retries_total");
    counter
});

static WS_DELIVERY_EXHAUSTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "realtime_ws_delivery_exhausted_total",
        "Messages abandoned after the final retry",
    )
    .expect("failed to create realtime_ws_delivery_exhausted_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register realtime_ws_delivery_exhausted_total");
    counter
});

static WS_AUTH_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_ws_auth_failures_total",
            "WebSocket handshakes refused by the authenticator",
        ),
        &["reason"],
    )
    .expect("failed to create realtime_ws_auth_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register realtime_ws_auth_failures_total");
    counter
});

static WS_HEARTBEAT_TERMINATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "realtime_ws_heartbeat_terminations_total",
        "Connections terminated for missing a heartbeat pong",
    )
    .expect("failed to create realtime_ws_heartbeat_terminations_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register realtime_ws_heartbeat_terminations_total");
    counter
});

pub fn observe_http_request(method: &str, path: &str, status: u16, elapsed: Duration) {
    let status_label = status.to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status_label])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path, &status_label])
        .observe(elapsed.as_secs_f64());
}

pub fn connection_opened() {
    WS_ACTIVE_CONNECTIONS.inc();
}

pub fn connection_closed() {
    WS_ACTIVE_CONNECTIONS.dec();
}

/// Staff routes accept arbitrary event names; only known ones become label values
fn event_label(event: &str) -> &'static str {
    use crate::websocket::messages::events::*;

    const KNOWN: &[&str] = &[
        CONNECTED,
        SUBSCRIBED,
        UNSUBSCRIBED,
        PONG,
        NOTIFICATION,
        ANNOUNCEMENT_NEW,
        ANNOUNCEMENT_UPDATED,
        RESULT_PUBLISHED,
        EXAM_AUTO_SUBMITTED,
        EXAM_TIMER_WARNING,
        ERROR,
    ];
    KNOWN
        .iter()
        .copied()
        .find(|known| *known == event)
        .unwrap_or("other")
}

pub fn message_sent(event: &str) {
    WS_MESSAGES_SENT_TOTAL
        .with_label_values(&[event_label(event)])
        .inc();
}

pub fn delivery_retried() {
    WS_DELIVERY_RETRIES_TOTAL.inc();
}

pub fn delivery_exhausted() {
    WS_DELIVERY_EXHAUSTED_TOTAL.inc();
}

pub fn auth_failed(reason: &str) {
    WS_AUTH_FAILURES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn heartbeat_terminated() {
    WS_HEARTBEAT_TERMINATIONS_TOTAL.inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::time::Instant;

/// Records request count and latency, labelled by route pattern so
/// `/api/v1/ws/status/{user_id}` stays one series
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let path = req
            .match_pattern()
            .unwrap_or_else(|| "unmatched".to_string());
        let method = req.method().to_string();
        let start = Instant::now();

        Box::pin(async move {
            let result = service.call(req).await;
            let elapsed = start.elapsed();
            match &result {
                Ok(response) => {
                    observe_http_request(&method, &path, response.status().as_u16(), elapsed);
                }
                Err(_) => {
                    observe_http_request(&method, &path, 500, elapsed);
                }
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_metrics_are_exported() {
        message_sent("notification");
        delivery_retried();
        auth_failed("expired");

        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"realtime_ws_messages_sent_total".to_string()));
        assert!(names.contains(&"realtime_ws_delivery_retries_total".to_string()));
        assert!(names.contains(&"realtime_ws_auth_failures_total".to_string()));
    }

    #[test]
    fn test_unknown_events_share_one_label() {
        assert_eq!(event_label("notification"), "notification");
        assert_eq!(event_label("exam:timer-warning"), "exam:timer-warning");
        assert_eq!(event_label("room:7:custom"), "other");

        message_sent("made-up-event-1");
        message_sent("made-up-event-2");
        let family = prometheus::gather()
            .into_iter()
            .find(|family| family.get_name() == "realtime_ws_messages_sent_total")
            .unwrap();
        let labels: Vec<String> = family
            .get_metric()
            .iter()
            .flat_map(|m| m.get_label().iter().map(|l| l.get_value().to_string()))
            .collect();
        assert!(labels.contains(&"other".to_string()));
        assert!(!labels.iter().any(|l| l.starts_with("made-up-event")));
    }
}
