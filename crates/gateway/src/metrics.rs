use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static SESSION_CACHE_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static SESSION_EVICTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static TASKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static TICKET_VALIDATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static WORK_QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn counter_vec(
    cell: &'static OnceLock<IntCounterVec>,
    name: &'static str,
    help: &'static str,
    labels: &[&str],
) -> &'static IntCounterVec {
    cell.get_or_init(|| {
        register_collector(
            IntCounterVec::new(Opts::new(name, help), labels)
                .unwrap_or_else(|err| panic!("create {}: {}", name, err)),
        )
    })
}

fn http_requests_total() -> &'static IntCounterVec {
    counter_vec(
        &HTTP_REQUESTS_TOTAL,
        "rpb_gateway_http_requests_total",
        "Gateway HTTP request count.",
        &["route", "method", "status"],
    )
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "rpb_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create rpb_gateway_http_request_duration_seconds"),
        )
    })
}

fn session_cache_events_total() -> &'static IntCounterVec {
    counter_vec(
        &SESSION_CACHE_EVENTS_TOTAL,
        "rpb_gateway_session_cache_events_total",
        "Session cache lookups by outcome.",
        &["event"],
    )
}

fn session_evictions_total() -> &'static IntCounterVec {
    counter_vec(
        &SESSION_EVICTIONS_TOTAL,
        "rpb_gateway_session_evictions_total",
        "Session cache removals by cause.",
        &["cause"],
    )
}

fn tasks_total() -> &'static IntCounterVec {
    counter_vec(
        &TASKS_TOTAL,
        "rpb_gateway_tasks_total",
        "Tracked tasks reaching a terminal state.",
        &["task_type", "state"],
    )
}

fn ticket_validations_total() -> &'static IntCounterVec {
    counter_vec(
        &TICKET_VALIDATIONS_TOTAL,
        "rpb_gateway_ticket_validations_total",
        "Side-channel ticket validations by outcome.",
        &["outcome"],
    )
}

fn work_queue_depth() -> &'static IntGauge {
    WORK_QUEUE_DEPTH.get_or_init(|| {
        register_collector(
            IntGauge::new(
                "rpb_gateway_work_queue_depth",
                "Guarded mutations queued or running on the worker pool.",
            )
            .expect("create rpb_gateway_work_queue_depth"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_session_cache_event(event: &str) {
    session_cache_events_total().with_label_values(&[event]).inc();
}

pub fn observe_session_eviction(cause: &str) {
    session_evictions_total().with_label_values(&[cause]).inc();
}

pub fn observe_task(task_type: &str, state: &str) {
    tasks_total().with_label_values(&[task_type, state]).inc();
}

pub fn observe_ticket_validation(outcome: &str) {
    ticket_validations_total().with_label_values(&[outcome]).inc();
}

pub fn set_work_queue_depth(depth: usize) {
    work_queue_depth().set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = work_queue_depth();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_output_contains_observed_series() {
        observe_session_eviction("expired");
        observe_ticket_validation("accepted");
        set_work_queue_depth(3);

        let (body, content_type) = render().expect("render should succeed");
        let text = String::from_utf8(body).expect("metrics are utf-8");
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("rpb_gateway_session_evictions_total{cause=\"expired\"}"));
        assert!(text.contains("rpb_gateway_ticket_validations_total{outcome=\"accepted\"}"));
        assert!(text.contains("rpb_gateway_work_queue_depth"));
    }
}
