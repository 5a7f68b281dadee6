//! Metrics sink for deployd-rs.
//!
//! The engine only ever talks to [`MetricsSink`]: gauges are set, timers
//! started and stopped, counters bumped. Nothing reads a value back.
//!
//! [`OtelMetrics`] maps these onto the OTel Meter API using the globally
//! registered `MeterProvider`; all instruments come from the `"deployd"`
//! meter and are prefixed `deployd.`. [`NoopMetrics`] drops everything.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use opentelemetry::metrics::Meter;
use parking_lot::Mutex;

use crate::error::Error;

/// Key/value tags attached to an instrument.
pub type Tags<'a> = &'a [(&'a str, &'a str)];

pub trait Gauge: Send + Sync {
    fn set(&self, value: f64);
}

pub trait Timer: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

pub trait Counter: Send + Sync {
    fn count(&self);
}

/// Fire-and-forget metrics backend.
pub trait MetricsSink: Send + Sync {
    fn create_gauge(&self, name: &str, tags: Tags<'_>) -> Arc<dyn Gauge>;
    fn create_timer(&self, name: &str, tags: Tags<'_>) -> Arc<dyn Timer>;
    fn create_counter(&self, name: &str, tags: Tags<'_>) -> Arc<dyn Counter>;
}

// ---------------------------------------------------------------------------
// Provider selection
// ---------------------------------------------------------------------------

/// Which metrics backend the daemon reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricsProvider {
    #[default]
    None,
    Otel,
}

impl MetricsProvider {
    pub fn build(self) -> Arc<dyn MetricsSink> {
        match self {
            MetricsProvider::None => Arc::new(NoopMetrics),
            MetricsProvider::Otel => Arc::new(OtelMetrics::new()),
        }
    }
}

impl FromStr for MetricsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(MetricsProvider::None),
            "otel" | "opentelemetry" => Ok(MetricsProvider::Otel),
            other => Err(Error::Config(format!("unknown metrics provider: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// OpenTelemetry
// ---------------------------------------------------------------------------

/// Returns the shared meter for deployd instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("deployd")
}

fn attributes(tags: Tags<'_>) -> Vec<KeyValue> {
    tags.iter()
        .map(|(k, v)| KeyValue::new(k.to_string(), v.to_string()))
        .collect()
}

fn instrument_name(name: &str) -> String {
    format!("deployd.{name}")
}

/// Metrics backed by the global OTel meter provider.
#[derive(Debug, Default)]
pub struct OtelMetrics;

impl OtelMetrics {
    pub fn new() -> Self {
        Self
    }
}

impl MetricsSink for OtelMetrics {
    fn create_gauge(&self, name: &str, tags: Tags<'_>) -> Arc<dyn Gauge> {
        Arc::new(OtelGauge {
            gauge: meter().f64_gauge(instrument_name(name)).build(),
            attributes: attributes(tags),
        })
    }

    fn create_timer(&self, name: &str, tags: Tags<'_>) -> Arc<dyn Timer> {
        Arc::new(OtelTimer {
            histogram: meter()
                .f64_histogram(instrument_name(name))
                .with_unit("ms")
                .build(),
            attributes: attributes(tags),
            started: Mutex::new(None),
        })
    }

    fn create_counter(&self, name: &str, tags: Tags<'_>) -> Arc<dyn Counter> {
        Arc::new(OtelCounter {
            counter: meter().u64_counter(instrument_name(name)).build(),
            attributes: attributes(tags),
        })
    }
}

struct OtelGauge {
    gauge: opentelemetry::metrics::Gauge<f64>,
    attributes: Vec<KeyValue>,
}

impl Gauge for OtelGauge {
    fn set(&self, value: f64) {
        self.gauge.record(value, &self.attributes);
    }
}

struct OtelTimer {
    histogram: opentelemetry::metrics::Histogram<f64>,
    attributes: Vec<KeyValue>,
    started: Mutex<Option<Instant>>,
}

impl Timer for OtelTimer {
    fn start(&self) {
        *self.started.lock() = Some(Instant::now());
    }

    /// Records the elapsed time since the last `start`. A stop without a
    /// matching start records nothing.
    fn stop(&self) {
        if let Some(started) = self.started.lock().take() {
            let ms = started.elapsed().as_secs_f64() * 1000.0;
            self.histogram.record(ms, &self.attributes);
        }
    }
}

struct OtelCounter {
    counter: opentelemetry::metrics::Counter<u64>,
    attributes: Vec<KeyValue>,
}

impl Counter for OtelCounter {
    fn count(&self) {
        self.counter.add(1, &self.attributes);
    }
}

// ---------------------------------------------------------------------------
// No-op
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

struct Noop;

impl Gauge for Noop {
    fn set(&self, _value: f64) {}
}

impl Timer for Noop {
    fn start(&self) {}
    fn stop(&self) {}
}

impl Counter for Noop {
    fn count(&self) {}
}

impl MetricsSink for NoopMetrics {
    fn create_gauge(&self, _name: &str, _tags: Tags<'_>) -> Arc<dyn Gauge> {
        Arc::new(Noop)
    }

    fn create_timer(&self, _name: &str, _tags: Tags<'_>) -> Arc<dyn Timer> {
        Arc::new(Noop)
    }

    fn create_counter(&self, _name: &str, _tags: Tags<'_>) -> Arc<dyn Counter> {
        Arc::new(Noop)
    }
}
