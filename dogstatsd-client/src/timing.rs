use quanta::Instant;

use crate::{client::Client, serializer::MetricType};

/// Reports the time elapsed since its creation when dropped.
///
/// Created by [`Client::time`] and [`Client::distributed`]. The elapsed time is reported exactly once, when the guard
/// goes out of scope, including while unwinding from a panic.
///
/// Elapsed time is reported in seconds, or in milliseconds if the client was configured with
/// [`DogStatsDBuilder::with_timing_in_milliseconds`][crate::DogStatsDBuilder::with_timing_in_milliseconds]. Both the
/// unit and the sample rate can be overridden per guard.
#[must_use = "the elapsed time is reported when the guard is dropped"]
pub struct TimedGuard<'a> {
    client: &'a Client,
    name: &'a str,
    tags: &'a [&'a str],
    metric_type: MetricType,
    sample_rate: Option<f64>,
    use_ms: bool,
    start: Instant,
}

impl<'a> TimedGuard<'a> {
    fn new(client: &'a Client, name: &'a str, tags: &'a [&'a str], metric_type: MetricType) -> Self {
        let use_ms = client.use_ms();
        Self { client, name, tags, metric_type, sample_rate: None, use_ms, start: client.clock().now() }
    }

    /// Sets the sample rate the elapsed time is reported with, instead of the client's default sample rate.
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    /// Sets whether the elapsed time is reported in milliseconds rather than seconds.
    #[must_use]
    pub fn in_milliseconds(mut self, use_ms: bool) -> Self {
        self.use_ms = use_ms;
        self
    }
}

impl Drop for TimedGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.client.clock().now().saturating_duration_since(self.start);
        let value = if self.use_ms { elapsed.as_nanos() as f64 / 1_000_000.0 } else { elapsed.as_secs_f64() };

        self.client.report(self.name, self.metric_type, value, self.tags, self.sample_rate);
    }
}

impl Client {
    /// Starts timing a scope, reporting the elapsed time as a timing when the returned guard is dropped.
    pub fn time<'a>(&'a self, name: &'a str, tags: &'a [&'a str]) -> TimedGuard<'a> {
        TimedGuard::new(self, name, tags, MetricType::Timing)
    }

    /// Starts timing a scope, reporting the elapsed time as a distribution when the returned guard is dropped.
    pub fn distributed<'a>(&'a self, name: &'a str, tags: &'a [&'a str]) -> TimedGuard<'a> {
        TimedGuard::new(self, name, tags, MetricType::Distribution)
    }

    /// Runs `f`, reporting how long it took as a timing.
    ///
    /// If `sample_rate` is `None`, the client's default sample rate is used.
    pub fn timed<F, R>(&self, name: &str, tags: &[&str], sample_rate: Option<f64>, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let mut guard = self.time(name, tags);
        guard.sample_rate = sample_rate;
        let result = f();
        drop(guard);
        result
    }
}
