use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static GRANTS_ISSUED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static GRANT_DENIALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static MUTATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RATE_LIMITED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

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

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("lista_http_requests_total", "Batch-link HTTP request count."),
                &["route", "method", "status"],
            )
            .expect("create lista_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "lista_http_request_duration_seconds",
                    "Batch-link HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create lista_http_request_duration_seconds"),
        )
    })
}

fn grants_issued_total() -> &'static IntCounterVec {
    GRANTS_ISSUED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("lista_grants_issued_total", "Batch grants issued."),
                &["item_type", "action_kind"],
            )
            .expect("create lista_grants_issued_total"),
        )
    })
}

fn grant_denials_total() -> &'static IntCounterVec {
    GRANT_DENIALS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "lista_grant_denials_total",
                    "Batch-link accesses denied by the policy gate.",
                ),
                &["reason"],
            )
            .expect("create lista_grant_denials_total"),
        )
    })
}

fn mutations_total() -> &'static IntCounterVec {
    MUTATIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "lista_mutations_total",
                    "Recipient mutations applied through batch links.",
                ),
                &["action"],
            )
            .expect("create lista_mutations_total"),
        )
    })
}

fn rate_limited_total() -> &'static IntCounterVec {
    RATE_LIMITED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "lista_rate_limited_total",
                    "Requests rejected by the sliding-window rate limiter.",
                ),
                &["surface"],
            )
            .expect("create lista_rate_limited_total"),
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

pub fn observe_grant_issued(item_type: &str, action_kind: &str) {
    grants_issued_total()
        .with_label_values(&[item_type, action_kind])
        .inc();
}

pub fn observe_grant_denial(reason: &str) {
    grant_denials_total().with_label_values(&[reason]).inc();
}

pub fn observe_mutation(action: &str) {
    mutations_total().with_label_values(&[action]).inc();
}

pub fn observe_rate_limited(surface: &str) {
    rate_limited_total().with_label_values(&[surface]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = grants_issued_total();
    let _ = grant_denials_total();
    let _ = mutations_total();
    let _ = rate_limited_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
