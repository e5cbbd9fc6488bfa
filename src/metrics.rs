//! Per-event throttle metrics.

use std::borrow::Cow;
use std::time::Duration;

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::MetricsConfig;
use crate::error::Result;
use crate::event::EventFields;

/// Namespace every Floodgate metric is registered under.
const NAMESPACE: &str = "floodgate";

/// Label value for event fields that are absent.
pub const UNKNOWN_LABEL: &str = "UNKNOWN";

/// Name of the trailing label carrying the decision.
const THROTTLED_LABEL: &str = "throttled";

/// Counts processed events by configured event fields plus a `throttled`
/// label (`y`/`n`).
#[derive(Clone)]
pub struct ThrottleMetrics {
    registry: Registry,
    events: IntCounterVec,
    fields: Vec<String>,
}

impl ThrottleMetrics {
    /// Build the counter vector described by `config` in a fresh registry.
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let mut label_names = config.label_names();
        label_names.push(THROTTLED_LABEL.to_string());
        let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();

        let opts = Opts::new(config.name.clone(), "Events seen by the limiter").namespace(NAMESPACE);
        let events = IntCounterVec::new(opts, &label_refs)?;

        let registry = Registry::new();
        registry.register(Box::new(events.clone()))?;

        Ok(Self {
            registry,
            events,
            fields: config.fields(),
        })
    }

    /// Label values for `event`, without the trailing `throttled` label.
    pub fn label_values<'e, E: EventFields + ?Sized>(&self, event: &'e E) -> Vec<Cow<'e, str>> {
        self.fields
            .iter()
            .map(|field| event.render(field).unwrap_or(Cow::Borrowed(UNKNOWN_LABEL)))
            .collect()
    }

    /// Count one event.
    pub fn observe<E: EventFields + ?Sized>(&self, event: &E, throttled: bool) {
        let values = self.label_values(event);
        let mut refs: Vec<&str> = values.iter().map(|v| v.as_ref()).collect();
        refs.push(if throttled { "y" } else { "n" });
        self.events.with_label_values(&refs).inc();
    }

    /// Current count for a full set of label values, decision included.
    pub fn count(&self, label_values: &[&str]) -> u64 {
        self.events
            .get_metric_with_label_values(label_values)
            .map(|c| c.get())
            .unwrap_or(0)
    }

    /// Drop every series.
    pub fn reset(&self) {
        self.events.reset();
    }

    /// Reset every `period` until `cancel` fires, bounding label cardinality.
    pub async fn run_resets(&self, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    debug!("Resetting throttle metrics");
                    self.reset();
                }
            }
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of the registry.
    pub fn encode(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
