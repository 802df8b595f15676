use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BusEvent, EventBus, EventKind};

/// Supplies resource samples (metric name to value) to the ticker.
pub trait MetricSource: Send + Sync {
    fn sample(&self) -> BTreeMap<String, f64>;
}

/// Raise an alert when `metric` goes above `above` or below `below`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub metric: String,
    #[serde(default)]
    pub above: Option<f64>,
    #[serde(default)]
    pub below: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl AlertRule {
    fn breached(&self, value: f64) -> bool {
        self.above.is_some_and(|limit| value > limit) || self.below.is_some_and(|limit| value < limit)
    }
}

/// Edge-triggered threshold check: one alert per crossing, re-armed once
/// the metric is back within bounds.
pub struct ThresholdMonitor {
    rules: Vec<AlertRule>,
    breached: Vec<bool>,
}

impl ThresholdMonitor {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        let breached = vec![false; rules.len()];
        Self { rules, breached }
    }

    pub fn check(&mut self, samples: &BTreeMap<String, f64>) -> Vec<BusEvent> {
        let mut alerts = Vec::new();
        for (rule, was_breached) in self.rules.iter().zip(self.breached.iter_mut()) {
            let Some(&value) = samples.get(&rule.metric) else {
                continue;
            };
            let now = rule.breached(value);
            if now && !*was_breached {
                let message = rule
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{} out of bounds: {}", rule.metric, value));
                alerts.push(BusEvent::new(EventKind::Alert).with_payload(serde_json::json!({
                    "metric": rule.metric,
                    "value": value,
                    "above": rule.above,
                    "below": rule.below,
                    "message": message,
                })));
            }
            *was_breached = now;
        }
        alerts
    }
}

/// Bus-level samples merged into every reading.
fn bus_samples(bus: &EventBus) -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("bus_subscribers".to_string(), bus.subscriber_count() as f64),
        ("bus_history".to_string(), bus.history_len() as f64),
        ("bus_dropped".to_string(), bus.dropped_count() as f64),
    ])
}

/// Spawn the background ticker: heartbeats every `heartbeat_every`, and a
/// resource sample every `sample_every` that feeds the alert rules. Runs
/// until `cancel` fires.
pub fn spawn_ticker(
    bus: EventBus,
    source: Arc<dyn MetricSource>,
    heartbeat_every: Duration,
    sample_every: Duration,
    rules: Vec<AlertRule>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut monitor = ThresholdMonitor::new(rules);
        let mut latest: BTreeMap<String, f64> = BTreeMap::new();
        let mut heartbeat = tokio::time::interval(heartbeat_every.max(Duration::from_millis(1)));
        let mut sampler = tokio::time::interval(sample_every.max(Duration::from_millis(1)));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sampler.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = heartbeat.tick() => {
                    bus.publish(BusEvent::new(EventKind::Heartbeat).with_payload(serde_json::json!({
                        "uptime_s": started.elapsed().as_secs_f64(),
                        "samples": latest,
                    })));
                }
                _ = sampler.tick() => {
                    let mut samples = source.sample();
                    samples.extend(bus_samples(&bus));
                    for alert in monitor.check(&samples) {
                        warn!(payload = %alert.payload, "Resource alert");
                        bus.publish(alert);
                    }
                    latest = samples;
                }
            }
        }
        debug!("Bus ticker stopped");
    })
}
