use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use bytes::{BufMut as _, Bytes, BytesMut};
use parking_lot::Mutex;
use quanta::{Clock, Instant};
use tracing::debug;

const TELEMETRY_PREFIX: &str = "datadog.dogstatsd.client.";

/// Point-in-time copy of the client telemetry counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TelemetrySnapshot {
    /// Number of metrics reported, before sampling.
    pub metrics: u64,

    /// Number of events reported.
    pub events: u64,

    /// Number of service checks reported.
    pub service_checks: u64,

    /// Number of bytes successfully sent.
    pub bytes_sent: u64,

    /// Number of bytes dropped.
    pub bytes_dropped: u64,

    /// Number of payloads successfully sent.
    pub packets_sent: u64,

    /// Number of payloads dropped.
    pub packets_dropped: u64,
}

#[derive(Default)]
struct Counters {
    metrics: AtomicU64,
    events: AtomicU64,
    service_checks: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_dropped: AtomicU64,
    packets_sent: AtomicU64,
    packets_dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            metrics: self.metrics.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            service_checks: self.service_checks.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }

    // Increments racing with a flush carry over into the next window.
    fn subtract(&self, snapshot: &TelemetrySnapshot) {
        self.metrics.fetch_sub(snapshot.metrics, Ordering::Relaxed);
        self.events.fetch_sub(snapshot.events, Ordering::Relaxed);
        self.service_checks.fetch_sub(snapshot.service_checks, Ordering::Relaxed);
        self.bytes_sent.fetch_sub(snapshot.bytes_sent, Ordering::Relaxed);
        self.bytes_dropped.fetch_sub(snapshot.bytes_dropped, Ordering::Relaxed);
        self.packets_sent.fetch_sub(snapshot.packets_sent, Ordering::Relaxed);
        self.packets_dropped.fetch_sub(snapshot.packets_dropped, Ordering::Relaxed);
    }
}

/// Client telemetry.
///
/// `TelemetryRecorder` collects information about the client's behavior and periodically sends it, as a set of
/// counters, to the telemetry destination.
pub(crate) struct TelemetryRecorder {
    enabled: AtomicBool,
    interval: Duration,
    clock: Clock,
    last_flush: Mutex<Instant>,
    counters: Counters,
    tags: String,
}

impl TelemetryRecorder {
    /// Creates a new `TelemetryRecorder`.
    ///
    /// `transport` is the transport ID of the main destination, and `constant_tags` are appended to the telemetry
    /// tags.
    pub fn new(enabled: bool, interval: Duration, clock: Clock, transport: &str, constant_tags: &[String]) -> Self {
        let mut tags =
            format!("client:rust,client_version:{},client_transport:{}", env!("CARGO_PKG_VERSION"), transport);
        for tag in constant_tags {
            tags.push(',');
            tags.push_str(tag);
        }

        let last_flush = Mutex::new(clock.now());
        Self { enabled: AtomicBool::new(enabled), interval, clock, last_flush, counters: Counters::default(), tags }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enables or disables tracking and sending telemetry.
    ///
    /// Counters accumulated so far are kept, and sent at the next flush once telemetry is enabled again.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn track_metric(&self) {
        if self.is_enabled() {
            self.counters.metrics.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn track_event(&self) {
        if self.is_enabled() {
            self.counters.events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn track_service_check(&self) {
        if self.is_enabled() {
            self.counters.service_checks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Tracks a successful payload send.
    pub fn track_payload_sent(&self, len: usize) {
        if self.is_enabled() {
            self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
            self.counters.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        }
    }

    /// Tracks a dropped payload.
    pub fn track_payload_dropped(&self, len: usize) {
        if self.is_enabled() {
            self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
            self.counters.bytes_dropped.fetch_add(len as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.counters.snapshot()
    }

    /// Returns `true` if telemetry is enabled and the telemetry interval has elapsed since the last flush.
    #[cfg(test)]
    pub fn should_flush(&self) -> bool {
        self.is_enabled() && self.is_due(*self.last_flush.lock())
    }

    fn is_due(&self, last_flush: Instant) -> bool {
        self.clock.now().saturating_duration_since(last_flush) > self.interval
    }

    /// Encodes a snapshot as a telemetry payload.
    pub fn encode(&self, snapshot: &TelemetrySnapshot) -> Bytes {
        let values = [
            ("metrics", snapshot.metrics),
            ("events", snapshot.events),
            ("service_checks", snapshot.service_checks),
            ("bytes_sent", snapshot.bytes_sent),
            ("bytes_dropped", snapshot.bytes_dropped),
            ("packets_sent", snapshot.packets_sent),
            ("packets_dropped", snapshot.packets_dropped),
        ];

        let mut int_writer = itoa::Buffer::new();
        let mut buf = BytesMut::with_capacity(values.len() * (TELEMETRY_PREFIX.len() + self.tags.len() + 32));
        for (name, value) in values {
            buf.put_slice(TELEMETRY_PREFIX.as_bytes());
            buf.put_slice(name.as_bytes());
            buf.put_u8(b':');
            buf.put_slice(int_writer.format(value).as_bytes());
            buf.put_slice(b"|c|#");
            buf.put_slice(self.tags.as_bytes());
            buf.put_u8(b'\n');
        }

        buf.freeze()
    }

    /// Sends the telemetry payload through `send` if the telemetry interval has elapsed.
    ///
    /// Only one caller at a time can flush: if another thread is already flushing, this returns immediately. `send`
    /// must return `true` if the payload was sent.
    pub fn flush_if_due<F>(&self, send: F)
    where
        F: FnOnce(&[u8]) -> bool,
    {
        if !self.is_enabled() {
            return;
        }

        let Some(mut last_flush) = self.last_flush.try_lock() else {
            return;
        };
        if !self.is_due(*last_flush) {
            return;
        }

        let snapshot = self.counters.snapshot();
        let payload = self.encode(&snapshot);
        let sent = send(&payload);
        *last_flush = self.clock.now();

        if sent {
            self.counters.subtract(&snapshot);
            self.track_payload_sent(payload.len());
        } else {
            debug!(payload_len = payload.len(), "Failed to send telemetry, keeping counters for the next window.");
            self.track_payload_dropped(payload.len());
        }
    }
}
