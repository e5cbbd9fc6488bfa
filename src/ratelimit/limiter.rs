//! Limiter pool: routes events to per-key bucket counters under a remotely
//! managed policy.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::counter::BucketCounter;
use super::policy::{ActivePolicy, PolicyDocument};
use super::source::{HttpPolicySource, PolicySource};
use crate::config::FloodgateConfig;
use crate::error::{FloodgateError, Result};
use crate::event::EventFields;

/// Identity used for events that lack the identity field.
pub const UNKNOWN_IDENTITY: &str = "UNKNOWN";

/// Default event field carrying the event time.
const DEFAULT_TIMESTAMP_FIELD: &str = "ts";

thread_local! {
    /// Per-thread buffer the routing key is assembled in.
    static ROUTING_KEY: RefCell<String> = RefCell::new(String::with_capacity(128));
}

/// Everything a routing decision reads, guarded by one lock so a refresh and
/// a lookup never see each other half done.
struct PoolState {
    policy: Arc<ActivePolicy>,
    counters: HashMap<String, Arc<BucketCounter>>,
}

/// A pool of bucket counters keyed by `identity value + rule match key`.
///
/// Counters are created on the first event routed to them and dropped by the
/// refresh sweep once idle for a full window. Until a policy has loaded the
/// pool admits everything.
pub struct LimiterPool {
    source: Arc<dyn PolicySource>,
    bucket_span_secs: u64,
    window_size: u64,
    timestamp_field: String,
    /// Idle time after which a counter is swept; `None` disables the sweep
    idle_ttl: Option<TimeDelta>,
    state: Mutex<PoolState>,
}

impl LimiterPool {
    /// Create an empty pool. `bucket_span_secs` and `window_size` must be positive.
    pub fn new(
        source: Arc<dyn PolicySource>,
        bucket_span_secs: u64,
        window_size: u64,
    ) -> Result<Self> {
        if bucket_span_secs == 0 || window_size == 0 {
            return Err(FloodgateError::Config(format!(
                "bucket span ({}s) and window size ({}) must be positive",
                bucket_span_secs, window_size
            )));
        }

        let ttl_secs = i64::try_from(bucket_span_secs.saturating_mul(window_size)).unwrap_or(i64::MAX);

        Ok(Self {
            source,
            bucket_span_secs,
            window_size,
            timestamp_field: DEFAULT_TIMESTAMP_FIELD.to_string(),
            idle_ttl: TimeDelta::try_seconds(ttl_secs),
            state: Mutex::new(PoolState {
                policy: Arc::new(ActivePolicy::empty()),
                counters: HashMap::new(),
            }),
        })
    }

    /// Create a pool fetching its policy over HTTP as configured.
    pub fn from_config(config: &FloodgateConfig) -> Result<Self> {
        let source = HttpPolicySource::new(config.policy.url.clone(), config.policy.request_timeout())?;
        Ok(Self::new(
            Arc::new(source),
            config.window.bucket_size_secs,
            config.window.buckets,
        )?
        .with_timestamp_field(config.window.timestamp_field.clone()))
    }

    /// Read event time from `field` instead of `ts`.
    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = field.into();
        self
    }

    /// Decide whether `event` is admitted.
    pub fn allow<E: EventFields + ?Sized>(&self, event: &E) -> bool {
        let now = Utc::now();
        let ts = self.event_time(event).unwrap_or(now);

        match self.route(event, ts, now) {
            Some(counter) => counter.allow_at(ts, now),
            // No policy has loaded yet.
            None => true,
        }
    }

    /// Event time from the timestamp field; `None` when absent or unparsable.
    fn event_time<E: EventFields + ?Sized>(&self, event: &E) -> Option<DateTime<Utc>> {
        let raw = event.text(&self.timestamp_field)?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Find the counter for `event` under the active policy, creating it with
    /// `reference` as its newest bucket.
    ///
    /// Matching, lookup and the touch at `now` happen in one hold of the pool
    /// lock, so a concurrent sweep either runs before the lookup or sees the
    /// counter as fresh.
    fn route<E: EventFields + ?Sized>(
        &self,
        event: &E,
        reference: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<Arc<BucketCounter>> {
        ROUTING_KEY.with(|cell| {
            let mut key = cell.borrow_mut();
            key.clear();

            let mut guard = self.state.lock();
            let state = &mut *guard;
            match event.render(&state.policy.identity_field) {
                Some(identity) => key.push_str(&identity),
                None => key.push_str(UNKNOWN_IDENTITY),
            }

            let rule = state.policy.rules.iter().find(|rule| rule.match_into(event, &mut key))?;

            let counter = match state.counters.get(key.as_str()) {
                Some(counter) => counter.clone(),
                None => {
                    debug!(key = %key, limit = rule.limit(), "Creating bucket counter");
                    let counter = Arc::new(BucketCounter::new(
                        self.bucket_span_secs,
                        rule.limit(),
                        self.window_size,
                        reference,
                    ));
                    state.counters.insert(key.as_str().to_owned(), counter.clone());
                    counter
                }
            };
            counter.touch(now);
            trace!(key = %key, "Routed event");
            Some(counter)
        })
    }

    /// Fetch the policy, swap it in, and sweep idle counters.
    ///
    /// The fetch runs without any lock held. On failure the active policy is
    /// left untouched and the error is returned; idle counters are swept
    /// either way.
    pub async fn update(&self) -> Result<()> {
        let fetched = self.fetch_policy().await;
        let now = Utc::now();

        match fetched {
            Ok(policy) => {
                let policy = Arc::new(policy);
                let removed = {
                    let mut state = self.state.lock();
                    state.policy = policy.clone();
                    self.sweep_locked(&mut state, now)
                };
                info!(
                    source = %self.source.describe(),
                    identity_field = %policy.identity_field,
                    rules = policy.rules.len(),
                    removed_counters = removed,
                    "Limit policies updated"
                );
                Ok(())
            }
            Err(e) => {
                // The active policy stays; only idle counters are dropped.
                let removed = self.sweep_idle(now);
                debug!(removed_counters = removed, "Swept idle counters after failed update");
                Err(e)
            }
        }
    }

    async fn fetch_policy(&self) -> Result<ActivePolicy> {
        let body = self.source.fetch().await?;
        let document = PolicyDocument::from_yaml(&body)?;
        Ok(document.build())
    }

    /// Remove counters untouched since `now - bucket span * window size`.
    /// Returns how many were removed.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        self.sweep_locked(&mut state, now)
    }

    fn sweep_locked(&self, state: &mut PoolState, now: DateTime<Utc>) -> usize {
        let Some(threshold) = self.idle_ttl.and_then(|ttl| now.checked_sub_signed(ttl)) else {
            return 0;
        };

        let before = state.counters.len();
        state
            .counters
            .retain(|_, counter| counter.last_touched() >= threshold);
        before - state.counters.len()
    }

    /// Run one update bounded by `timeout`. Returns whether a policy loaded;
    /// on failure the pool keeps its previous (possibly empty) policy.
    pub async fn initial_update(&self, timeout: Duration) -> bool {
        info!(source = %self.source.describe(), "Initial update for policies");

        match tokio::time::timeout(timeout, self.update()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "Failed to make initial policy update, using default");
                false
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Initial policy update timed out, using default"
                );
                false
            }
        }
    }

    /// Call [`update`](Self::update) every `period` until `cancel` fires.
    ///
    /// The first call happens one `period` after start. An update already in
    /// flight runs to completion before cancellation is observed.
    pub async fn run_updates(&self, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            source = %self.source.describe(),
            interval_secs = period.as_secs_f64(),
            "Policy refresh started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Policy refresh stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.update().await {
                        error!(
                            error = %e,
                            source = %self.source.describe(),
                            "Failed to update limit policies"
                        );
                    }
                }
            }
        }
    }

    /// The policy currently in force.
    pub fn policy(&self) -> Arc<ActivePolicy> {
        self.state.lock().policy.clone()
    }

    pub fn identity_field(&self) -> String {
        self.policy().identity_field.clone()
    }

    pub fn rule_count(&self) -> usize {
        self.policy().rules.len()
    }

    /// Get the number of live counters.
    pub fn counter_count(&self) -> usize {
        self.state.lock().counters.len()
    }

    pub fn counter(&self, key: &str) -> Option<Arc<BucketCounter>> {
        self.state.lock().counters.get(key).cloned()
    }

    pub fn has_counter(&self, key: &str) -> bool {
        self.state.lock().counters.contains_key(key)
    }

    pub fn bucket_span_secs(&self) -> u64 {
        self.bucket_span_secs
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    /// Dump every live counter followed by the active rules.
    pub fn write_status<W: Write>(&self, w: &mut W) -> fmt::Result {
        let (policy, mut counters) = {
            let state = self.state.lock();
            let counters: Vec<(String, Arc<BucketCounter>)> = state
                .counters
                .iter()
                .map(|(k, c)| (k.clone(), c.clone()))
                .collect();
            (state.policy.clone(), counters)
        };
        counters.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, counter) in &counters {
            writeln!(w, "#{}\n", key)?;
            counter.write_status(w)?;
            writeln!(w, "---------")?;
        }

        writeln!(w, "rules:\n")?;
        if !policy.identity_field.is_empty() {
            writeln!(w, "key: {}", policy.identity_field)?;
        }
        for rule in &policy.rules {
            writeln!(w, "{}", rule)?;
        }
        Ok(())
    }

    /// [`write_status`](Self::write_status) into a fresh string.
    pub fn status(&self) -> String {
        let mut out = String::new();
        let _ = self.write_status(&mut out);
        out
    }
}
