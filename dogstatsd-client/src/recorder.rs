use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit,
};
use metrics_util::registry::{AtomicStorage, Registry};

use crate::{client::Client, serializer::label_to_tag, MetricType};

/// A recorder that sends metrics to a DogStatsD server through a [`Client`].
///
/// Every update is sent as it happens, subject to the client's buffering configuration:
///
/// - counter increments are sent as counts, and absolute values as the difference from the previous absolute value
/// - gauges are tracked locally and their resulting value is sent on every update
/// - histograms are sent as distributions, or as histograms if configured to do so
pub struct DogStatsDRecorder {
    client: Arc<Client>,
    registry: Registry<Key, AtomicStorage>,
    histograms_as_distributions: bool,
}

impl DogStatsDRecorder {
    pub(crate) fn new(client: Arc<Client>, histograms_as_distributions: bool) -> Self {
        DogStatsDRecorder { client, registry: Registry::atomic(), histograms_as_distributions }
    }

    /// Returns the client used by this recorder.
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    fn target(&self, key: &Key) -> Target {
        Target {
            client: Arc::clone(&self.client),
            name: key.name().to_string(),
            tags: key.labels().map(label_to_tag).collect(),
        }
    }
}

struct Target {
    client: Arc<Client>,
    name: String,
    tags: Vec<String>,
}

impl Target {
    fn report<V: Into<crate::MetricValue>>(&self, metric_type: MetricType, value: V) {
        let tags = self.tags.iter().map(String::as_str).collect::<Vec<_>>();
        self.client.report(&self.name, metric_type, value, &tags, None);
    }
}

struct DogStatsDCounter {
    target: Target,
    last_absolute: Arc<AtomicU64>,
}

impl CounterFn for DogStatsDCounter {
    fn increment(&self, value: u64) {
        self.target.report(MetricType::Count, value);
    }

    fn absolute(&self, value: u64) {
        let previous = self.last_absolute.fetch_max(value, Ordering::AcqRel);
        if value > previous {
            self.target.report(MetricType::Count, value - previous);
        }
    }
}

struct DogStatsDGauge {
    target: Target,
    value: Arc<AtomicU64>,
}

impl DogStatsDGauge {
    fn send_current(&self) {
        let value = f64::from_bits(self.value.load(Ordering::Acquire));
        self.target.report(MetricType::Gauge, value);
    }
}

impl GaugeFn for DogStatsDGauge {
    fn increment(&self, value: f64) {
        GaugeFn::increment(&*self.value, value);
        self.send_current();
    }

    fn decrement(&self, value: f64) {
        GaugeFn::decrement(&*self.value, value);
        self.send_current();
    }

    fn set(&self, value: f64) {
        GaugeFn::set(&*self.value, value);
        self.send_current();
    }
}

struct DogStatsDHistogram {
    target: Target,
    metric_type: MetricType,
}

impl HistogramFn for DogStatsDHistogram {
    fn record(&self, value: f64) {
        self.target.report(self.metric_type, value);
    }
}

impl Recorder for DogStatsDRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        let last_absolute = self.registry.get_or_create_counter(key, Arc::clone);
        Counter::from_arc(Arc::new(DogStatsDCounter { target: self.target(key), last_absolute }))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        let value = self.registry.get_or_create_gauge(key, Arc::clone);
        Gauge::from_arc(Arc::new(DogStatsDGauge { target: self.target(key), value }))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        let metric_type =
            if self.histograms_as_distributions { MetricType::Distribution } else { MetricType::Histogram };
        Histogram::from_arc(Arc::new(DogStatsDHistogram { target: self.target(key), metric_type }))
    }
}
