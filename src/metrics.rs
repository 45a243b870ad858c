//! Metrics instruments for the request pipeline.
//!
//! Instruments are created lazily on the OpenTelemetry global meter. The
//! library never installs a meter provider: until the embedding application
//! sets one, every recording is a no-op.
//!
//! Provided metrics:
//! * `httpproxy_requests_total` (counter, labels: proxy, status)
//! * `httpproxy_stage_rejections_total` (counter, labels: proxy, stage)
//! * `httpproxy_fallbacks_total` (counter, labels: proxy, stage)
//! * `httpproxy_request_rate` (observable gauge, labels: proxy)
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Meter, ObservableGauge},
};

use crate::core::{FallbackStage, RateCounter};

pub const HTTPPROXY_REQUESTS_TOTAL: &str = "httpproxy_requests_total";
pub const HTTPPROXY_STAGE_REJECTIONS_TOTAL: &str = "httpproxy_stage_rejections_total";
pub const HTTPPROXY_FALLBACKS_TOTAL: &str = "httpproxy_fallbacks_total";
pub const HTTPPROXY_REQUEST_RATE: &str = "httpproxy_request_rate";

static METER: Lazy<Meter> = Lazy::new(|| global::meter("httpproxy"));

static REQUESTS_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter(HTTPPROXY_REQUESTS_TOTAL)
        .with_description("Total number of requests handled by a proxy.")
        .build()
});

static STAGE_REJECTIONS_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter(HTTPPROXY_STAGE_REJECTIONS_TOTAL)
        .with_description("Requests rejected by the validator, rate limiter or circuit breaker.")
        .build()
});

static FALLBACKS_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter(HTTPPROXY_FALLBACKS_TOTAL)
        .with_description("Number of times the fallback responder was consulted.")
        .build()
});

/// Count a completed request with its final status code.
pub fn increment_request_total(proxy: &str, status: u16) {
    REQUESTS_TOTAL.add(
        1,
        &[
            KeyValue::new("proxy", proxy.to_string()),
            KeyValue::new("status", i64::from(status)),
        ],
    );
}

pub fn increment_stage_rejection(proxy: &str, stage: &'static str) {
    STAGE_REJECTIONS_TOTAL.add(
        1,
        &[
            KeyValue::new("proxy", proxy.to_string()),
            KeyValue::new("stage", stage),
        ],
    );
}

pub fn increment_fallback_consulted(proxy: &str, stage: FallbackStage) {
    FALLBACKS_TOTAL.add(
        1,
        &[
            KeyValue::new("proxy", proxy.to_string()),
            KeyValue::new("stage", stage.as_str()),
        ],
    );
}

/// Registration of the request rate gauge of one proxy lineage.
///
/// The gauge reports the rate counter for as long as this value is alive,
/// labelled with the current proxy name.
pub struct RateGauge {
    proxy: Arc<ArcSwap<String>>,
    _gauge: ObservableGauge<f64>,
}

impl RateGauge {
    /// Name the gauge reports under.
    pub fn proxy(&self) -> String {
        self.proxy.load().as_ref().clone()
    }

    /// Report under `proxy` from the next collection on.
    pub fn rename(&self, proxy: &str) {
        if self.proxy.load().as_str() != proxy {
            tracing::debug!(from = %self.proxy.load().as_str(), to = %proxy, "relabelling request rate gauge");
            self.proxy.store(Arc::new(proxy.to_string()));
        }
    }
}

/// Publish `rate` as `httpproxy_request_rate{proxy = name}`.
pub fn register_rate_gauge(proxy: &str, rate: Arc<RateCounter>) -> RateGauge {
    let name = Arc::new(ArcSwap::from_pointee(proxy.to_string()));
    let label = Arc::clone(&name);
    let gauge = METER
        .f64_observable_gauge(HTTPPROXY_REQUEST_RATE)
        .with_description("Exponentially weighted one minute request rate, per second.")
        .with_callback(move |observer| {
            let proxy = label.load();
            observer.observe(rate.rate(), &[KeyValue::new("proxy", proxy.as_str().to_string())]);
        })
        .build();
    tracing::debug!(%proxy, "registered request rate gauge");
    RateGauge {
        proxy: name,
        _gauge: gauge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_provider_is_noop() {
        increment_request_total("test", 200);
        increment_stage_rejection("test", "validator");
        increment_fallback_consulted("test", FallbackStage::Backend);
    }

    #[test]
    fn test_register_rate_gauge() {
        let rate = Arc::new(RateCounter::one_minute());
        let _gauge = register_rate_gauge("test", rate.clone());
        rate.update(1);
        assert_eq!(rate.count(), 1);
    }

    #[test]
    fn test_rate_gauge_rename() {
        let gauge = register_rate_gauge("orders-v1", Arc::new(RateCounter::one_minute()));
        assert_eq!(gauge.proxy(), "orders-v1");

        gauge.rename("orders-v2");
        assert_eq!(gauge.proxy(), "orders-v2");
    }
}
