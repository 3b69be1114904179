use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Histograms keep only the most recent observations.
const HISTOGRAM_WINDOW: usize = 4096;

struct Histogram {
    observations: Mutex<VecDeque<f64>>,
    total_count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::with_capacity(64)),
            total_count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == HISTOGRAM_WINDOW {
            obs.pop_front();
        }
        obs.push_back(value);
        self.total_count.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.observations.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        let pick = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
        HistogramSummary {
            count: self.total_count.load(Ordering::Relaxed),
            window: n as u64,
            sum: sorted.iter().sum(),
            min: sorted[0],
            max: sorted[n - 1],
            p50: pick(0.50),
            p95: pick(0.95),
            p99: pick(0.99),
        }
    }
}

/// Summary statistics over the histogram window.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    /// Observations ever recorded.
    pub count: u64,
    /// Observations the percentiles were computed over.
    pub window: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric key: name + sorted labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }

    fn label_map(&self) -> BTreeMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterValue {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaugeValue {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramValue {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub summary: HistogramSummary,
}

/// Point-in-time view of every recorded metric, sorted by name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub counters: Vec<CounterValue>,
    pub gauges: Vec<GaugeValue>,
    pub histograms: Vec<HistogramValue>,
}

/// Thread-safe in-memory metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, AtomicU64>>,
    gauges: RwLock<HashMap<MetricKey, AtomicI64>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(counter) = self.counters.read().get(&key) {
            counter.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_gauge(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        let key = MetricKey::new(name, labels);
        if let Some(gauge) = self.gauges.read().get(&key) {
            gauge.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = MetricKey::new(name, labels);
        if let Some(gauge) = self.gauges.read().get(&key) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(hist) = self.histograms.read().get(&key) {
            hist.observe(value);
            return;
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        self.gauges
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0, |g| g.load(Ordering::Relaxed))
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read()
            .get(&MetricKey::new(name, labels))
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut counters: Vec<CounterValue> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| CounterValue {
                name: k.name.clone(),
                labels: k.label_map(),
                value: v.load(Ordering::Relaxed),
            })
            .collect();
        counters.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));

        let mut gauges: Vec<GaugeValue> = self
            .gauges
            .read()
            .iter()
            .map(|(k, v)| GaugeValue {
                name: k.name.clone(),
                labels: k.label_map(),
                value: v.load(Ordering::Relaxed),
            })
            .collect();
        gauges.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));

        let mut histograms: Vec<HistogramValue> = self
            .histograms
            .read()
            .iter()
            .map(|(k, h)| HistogramValue {
                name: k.name.clone(),
                labels: k.label_map(),
                summary: h.summary(),
            })
            .collect();
        histograms.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));

        MetricsSnapshot {
            captured_at: Utc::now(),
            counters,
            gauges,
            histograms,
        }
    }
}
