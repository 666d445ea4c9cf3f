//! Prometheus metrics for calls and served connections

use anyhow::Result;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

/// Outcome label of a finished call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    Timeout,
    Exhausted,
}

impl CallOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            CallOutcome::Ok => "ok",
            CallOutcome::Timeout => "timeout",
            CallOutcome::Exhausted => "exhausted",
        }
    }
}

/// Prometheus metrics collector shared by the call executors and the server
#[derive(Clone)]
pub struct MetricsCollector {
    /// Finished logical calls by outcome
    pub calls_total: CounterVec,
    /// Individual attempts by result
    pub call_attempts_total: CounterVec,
    /// Logical call latency in seconds
    pub call_duration_seconds: HistogramVec,
    /// Dials by result
    pub dials_total: CounterVec,
    /// Accepted server connections by protocol
    pub connections_accepted_total: CounterVec,
    /// Server connections refused by the rate limiter
    pub connections_rejected_total: CounterVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let calls_total = CounterVec::new(
            Opts::new("conduit_calls_total", "Total logical calls by outcome"),
            &["service", "protocol", "outcome"],
        )?;

        let call_attempts_total = CounterVec::new(
            Opts::new("conduit_call_attempts_total", "Total call attempts by result"),
            &["service", "result"],
        )?;

        let call_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "conduit_call_duration_seconds",
                "Logical call latency in seconds, retries included",
            ),
            &["service", "protocol"],
        )?;

        let dials_total = CounterVec::new(
            Opts::new("conduit_dials_total", "Total connection dials by result"),
            &["service", "result"],
        )?;

        let connections_accepted_total = CounterVec::new(
            Opts::new(
                "conduit_connections_accepted_total",
                "Total accepted server connections",
            ),
            &["protocol"],
        )?;

        let connections_rejected_total = CounterVec::new(
            Opts::new(
                "conduit_connections_rejected_total",
                "Total server connections refused by the rate limiter",
            ),
            &["protocol"],
        )?;

        registry.register(Box::new(calls_total.clone()))?;
        registry.register(Box::new(call_attempts_total.clone()))?;
        registry.register(Box::new(call_duration_seconds.clone()))?;
        registry.register(Box::new(dials_total.clone()))?;
        registry.register(Box::new(connections_accepted_total.clone()))?;
        registry.register(Box::new(connections_rejected_total.clone()))?;

        Ok(Self {
            calls_total,
            call_attempts_total,
            call_duration_seconds,
            dials_total,
            connections_accepted_total,
            connections_rejected_total,
            registry,
        })
    }

    pub fn record_call(
        &self,
        service: &str,
        protocol: &str,
        outcome: CallOutcome,
        elapsed: Duration,
    ) {
        self.calls_total
            .with_label_values(&[service, protocol, outcome.as_label()])
            .inc();
        self.call_duration_seconds
            .with_label_values(&[service, protocol])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_attempt(&self, service: &str, ok: bool) {
        self.call_attempts_total
            .with_label_values(&[service, if ok { "ok" } else { "error" }])
            .inc();
    }

    pub fn record_dial(&self, service: &str, ok: bool) {
        self.dials_total
            .with_label_values(&[service, if ok { "ok" } else { "error" }])
            .inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
