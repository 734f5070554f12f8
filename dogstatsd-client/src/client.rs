use std::{
    cell::RefCell,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::{BufMut as _, Bytes, BytesMut};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use quanta::Clock;
use rand::{Rng as _, SeedableRng as _};
use rand_xoshiro::Xoshiro256StarStar;
use thiserror::Error;
use tracing::{debug, error};

use crate::{
    buffer::PacketBuffer,
    builder::DogStatsDBuilder,
    scheduler::{FlushScheduler, MIN_FLUSH_INTERVAL},
    serializer::{Event, MetricType, MetricValue, Serializer, ServiceCheck, MAX_EVENT_SIZE},
    telemetry::{TelemetryRecorder, TelemetrySnapshot},
    transport::{Destination, RemoteAddr, Transport},
};

/// Errors that could occur while reporting to a DogStatsD client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The event is too large to be sent.
    #[error(
        "event '{title}' is {size} bytes when encoded, exceeding the limit of {limit} bytes",
        limit = MAX_EVENT_SIZE
    )]
    EventTooLarge {
        /// Title of the rejected event.
        title: String,

        /// Encoded size of the rejected event, in bytes.
        size: usize,
    },

    /// A batch is already open on this client.
    #[error("a batch is already in progress for this client")]
    BatchInProgress,
}

pub(crate) struct ClientConfiguration {
    pub default_sample_rate: f64,
    pub flush_interval: Duration,
    pub max_payload_len: usize,
    pub use_ms: bool,
    pub enabled: bool,
    pub clock: Clock,
}

/// Source of randomness for sampling decisions.
pub(crate) enum Sampler {
    /// Per-thread RNG, seeded from the operating system.
    ThreadLocal,

    /// Single deterministic RNG, shared by all threads.
    Seeded(Mutex<Xoshiro256StarStar>),
}

impl Sampler {
    pub fn seeded(seed: u64) -> Self {
        Sampler::Seeded(Mutex::new(Xoshiro256StarStar::seed_from_u64(seed)))
    }

    /// Returns `true` if a packet reported with the given sample rate should be kept.
    fn keep(&self, sample_rate: f64) -> bool {
        if sample_rate >= 1.0 {
            return true;
        }

        let draw: f64 = match self {
            Sampler::ThreadLocal => rand::rng().random(),
            Sampler::Seeded(rng) => rng.lock().random(),
        };
        draw <= sample_rate
    }
}

struct ToggleState {
    buffering: bool,
    scheduler: Option<FlushScheduler>,
}

/// State shared between the client and its flush thread.
///
/// Locks are always acquired in the same order: the toggle lock, then the buffer lock, then the lock of the connection
/// being sent to. None of them are ever acquired in reverse.
struct Shared {
    config: ClientConfiguration,
    serializer: Serializer,
    transport: Transport,
    telemetry: TelemetryRecorder,
    sampler: Sampler,

    // Whether packets go to the buffer (`true`) or straight to the transport (`false`). Read without locking on every
    // send, and only written while holding the toggle lock.
    buffered: AtomicBool,
    buffer: Mutex<PacketBuffer>,

    // The batch scope holds this lock for its whole lifetime, and may toggle buffering from the same thread while
    // doing so.
    toggle: ReentrantMutex<RefCell<ToggleState>>,
    batch_open: AtomicBool,
}

impl Shared {
    fn send_packet(&self, packet: Bytes) {
        if !self.buffered.load(Ordering::Acquire) {
            self.send_direct(&packet);
            return;
        }

        let mut buffer = self.buffer.lock();
        if buffer.exceeds_capacity(packet.len()) {
            // Will never fit in a payload, so drain whatever is buffered to keep ordering and send it on its own.
            if let Some(payload) = buffer.take_payload() {
                self.send_payload(&payload);
            }
            debug!(
                packet_len = packet.len(),
                max_payload_len = buffer.capacity(),
                "Packet exceeds maximum payload length."
            );
            self.send_direct(&packet);
            return;
        }

        if buffer.would_overflow(packet.len()) {
            if let Some(payload) = buffer.take_payload() {
                self.send_payload(&payload);
            }
        }
        buffer.push(packet);
    }

    fn send_direct(&self, packet: &[u8]) {
        let mut payload = BytesMut::with_capacity(packet.len() + 1);
        payload.put_slice(packet);
        payload.put_u8(b'\n');
        self.send_payload(&payload);
    }

    fn send_payload(&self, payload: &[u8]) {
        if self.transport.send(payload, Destination::Main) {
            self.telemetry.track_payload_sent(payload.len());
        } else {
            self.telemetry.track_payload_dropped(payload.len());
        }

        self.telemetry.flush_if_due(|telemetry| self.transport.send(telemetry, Destination::Telemetry));
    }

    fn flush(&self) {
        let mut buffer = self.buffer.lock();
        if let Some(payload) = buffer.take_payload() {
            self.send_payload(&payload);
        }
    }

    fn start_scheduler(self: &Arc<Self>) -> io::Result<Option<FlushScheduler>> {
        let flush_interval = self.config.flush_interval;
        if flush_interval <= MIN_FLUSH_INTERVAL {
            debug!(?flush_interval, "Flush interval too short, periodic flushing disabled.");
            return Ok(None);
        }

        let shared = Arc::downgrade(self);
        FlushScheduler::spawn(flush_interval, move || flush_tick(&shared)).map(Some)
    }
}

fn flush_tick(shared: &Weak<Shared>) -> bool {
    match shared.upgrade() {
        Some(shared) => {
            shared.flush();
            true
        }
        None => false,
    }
}

/// A DogStatsD client.
///
/// `Client` serializes metrics, events, and service checks into DogStatsD packets and sends them to the configured
/// destination, either one packet at a time or, when buffering is enabled, batched into payloads of up to the maximum
/// payload length. Sending never blocks and never fails from the caller's perspective: packets that cannot be sent are
/// dropped and accounted for in the client telemetry.
///
/// All methods take `&self`, so a single client can be shared across threads, for example in an `Arc`.
///
/// Dropping the client flushes any buffered packets and closes its connections.
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Creates a builder for configuring a `Client`.
    pub fn builder() -> DogStatsDBuilder {
        DogStatsDBuilder::default()
    }

    pub(crate) fn new(
        config: ClientConfiguration,
        serializer: Serializer,
        transport: Transport,
        telemetry: TelemetryRecorder,
        sampler: Sampler,
    ) -> Self {
        let buffer = PacketBuffer::new(config.max_payload_len);
        let shared = Shared {
            config,
            serializer,
            transport,
            telemetry,
            sampler,
            buffered: AtomicBool::new(false),
            buffer: Mutex::new(buffer),
            toggle: ReentrantMutex::new(RefCell::new(ToggleState { buffering: false, scheduler: None })),
            batch_open: AtomicBool::new(false),
        };

        Self { shared: Arc::new(shared) }
    }

    /// Returns the address packets are sent to.
    pub fn remote_addr(&self) -> &RemoteAddr {
        self.shared.transport.remote_addr()
    }

    pub(crate) fn use_ms(&self) -> bool {
        self.shared.config.use_ms
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.shared.config.clock
    }

    /// Reports a metric.
    ///
    /// If `sample_rate` is `None`, the client's default sample rate is used. Sampled-out observations are still counted
    /// in the client telemetry.
    pub fn report<V>(&self, name: &str, metric_type: MetricType, value: V, tags: &[&str], sample_rate: Option<f64>)
    where
        V: Into<MetricValue>,
    {
        let shared = &self.shared;
        if !shared.config.enabled {
            return;
        }

        shared.telemetry.track_metric();

        let sample_rate = sample_rate.unwrap_or(shared.config.default_sample_rate);
        if !shared.sampler.keep(sample_rate) {
            return;
        }

        let packet = shared.serializer.metric(name, metric_type, &value.into(), tags, sample_rate);
        shared.send_packet(packet);
    }

    /// Records the current value of a gauge.
    pub fn gauge<V: Into<MetricValue>>(&self, name: &str, value: V, tags: &[&str]) {
        self.report(name, MetricType::Gauge, value, tags, None);
    }

    /// Adds `value` to a counter.
    pub fn count<V: Into<MetricValue>>(&self, name: &str, value: V, tags: &[&str]) {
        self.report(name, MetricType::Count, value, tags, None);
    }

    /// Increments a counter by one.
    pub fn increment(&self, name: &str, tags: &[&str]) {
        self.increment_by(name, 1, tags);
    }

    /// Increments a counter by `value`.
    pub fn increment_by<V: Into<MetricValue>>(&self, name: &str, value: V, tags: &[&str]) {
        self.report(name, MetricType::Count, value, tags, None);
    }

    /// Decrements a counter by one.
    pub fn decrement(&self, name: &str, tags: &[&str]) {
        self.decrement_by(name, 1, tags);
    }

    /// Decrements a counter by `value`.
    pub fn decrement_by<V: Into<MetricValue>>(&self, name: &str, value: V, tags: &[&str]) {
        self.report(name, MetricType::Count, MetricValue::negate(value.into()), tags, None);
    }

    /// Records a value in a histogram.
    pub fn histogram<V: Into<MetricValue>>(&self, name: &str, value: V, tags: &[&str]) {
        self.report(name, MetricType::Histogram, value, tags, None);
    }

    /// Records a value in a distribution.
    pub fn distribution<V: Into<MetricValue>>(&self, name: &str, value: V, tags: &[&str]) {
        self.report(name, MetricType::Distribution, value, tags, None);
    }

    /// Records a timing, in milliseconds.
    pub fn timing<V: Into<MetricValue>>(&self, name: &str, value: V, tags: &[&str]) {
        self.report(name, MetricType::Timing, value, tags, None);
    }

    /// Records a member of a set.
    pub fn set<V: Into<MetricValue>>(&self, name: &str, value: V, tags: &[&str]) {
        self.report(name, MetricType::Set, value, tags, None);
    }

    /// Sends an event.
    ///
    /// # Errors
    ///
    /// If the encoded event is larger than 8KiB, an error is returned and nothing is sent or counted.
    pub fn event(&self, event: &Event) -> Result<(), ClientError> {
        let shared = &self.shared;
        if !shared.config.enabled {
            return Ok(());
        }

        let packet = shared.serializer.event(event)?;
        shared.telemetry.track_event();
        shared.send_packet(packet);
        Ok(())
    }

    /// Sends a service check.
    pub fn service_check(&self, check: &ServiceCheck) {
        let shared = &self.shared;
        if !shared.config.enabled {
            return;
        }

        let packet = shared.serializer.service_check(check);
        shared.telemetry.track_service_check();
        shared.send_packet(packet);
    }

    /// Sends all buffered packets.
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Enables or disables buffering.
    ///
    /// When buffering is enabled, packets are batched together and sent when the buffer is full, when [`Client::flush`]
    /// is called, or periodically by a background thread running at the configured flush interval. Disabling buffering
    /// stops the background thread and flushes the buffer.
    pub fn set_buffering(&self, enabled: bool) {
        if let Err(e) = self.toggle_buffering(enabled) {
            error!(
                error = %e,
                "Failed to spawn flush thread, buffered packets are only sent when the buffer fills up or is flushed."
            );
        }
    }

    pub(crate) fn toggle_buffering(&self, enabled: bool) -> io::Result<()> {
        let shared = &self.shared;
        let toggle = shared.toggle.lock();
        let mut state = toggle.borrow_mut();
        if state.buffering == enabled {
            return Ok(());
        }
        state.buffering = enabled;

        if enabled {
            debug!("Buffering enabled.");
            shared.buffered.store(true, Ordering::Release);
            state.scheduler = shared.start_scheduler()?;
        } else {
            debug!("Buffering disabled.");
            if !shared.batch_open.load(Ordering::Acquire) {
                shared.buffered.store(false, Ordering::Release);
            }
            let scheduler = state.scheduler.take();
            drop(state);

            if let Some(scheduler) = scheduler {
                scheduler.stop();
            }
            shared.flush();
        }

        Ok(())
    }

    /// Returns `true` if buffering is enabled.
    ///
    /// This reflects the configured mode, and is not affected by an open [`Batch`].
    pub fn buffering_enabled(&self) -> bool {
        self.shared.toggle.lock().borrow().buffering
    }

    /// Opens a batch.
    ///
    /// Until the returned [`Batch`] is dropped, everything reported through the client is buffered, even if buffering
    /// is otherwise disabled. Dropping the batch flushes the buffer and restores the configured mode. Other threads
    /// that try to change the buffering mode while the batch is open will block until it closes.
    ///
    /// # Errors
    ///
    /// Only one batch can be open at a time: if one is already open, [`ClientError::BatchInProgress`] is returned.
    pub fn batch(&self) -> Result<Batch<'_>, ClientError> {
        let shared = &self.shared;
        if shared.batch_open.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(ClientError::BatchInProgress);
        }

        let toggle = shared.toggle.lock();
        shared.buffered.store(true, Ordering::Release);

        Ok(Batch { client: self, toggle })
    }

    /// Flushes buffered packets and closes all connections.
    ///
    /// The periodic flush thread, if running, is stopped and buffering is disabled. The client remains usable:
    /// connections are recreated on the next send, and buffering can be enabled again with [`Client::set_buffering`].
    pub fn close(&self) {
        let shared = &self.shared;
        let toggle = shared.toggle.lock();
        let scheduler = {
            let mut state = toggle.borrow_mut();
            state.buffering = false;
            if !shared.batch_open.load(Ordering::Acquire) {
                shared.buffered.store(false, Ordering::Release);
            }
            state.scheduler.take()
        };
        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }

        shared.flush();
        shared.transport.close();
        drop(toggle);
    }

    /// Returns the current values of the telemetry counters.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.shared.telemetry.snapshot()
    }

    /// Enables or disables client telemetry.
    ///
    /// While disabled, nothing is counted and no telemetry is sent. Counters accumulated before disabling are kept.
    pub fn set_telemetry(&self, enabled: bool) {
        debug!(enabled, "Toggling client telemetry.");
        self.shared.telemetry.set_enabled(enabled);
    }

    /// Returns `true` if client telemetry is enabled.
    pub fn telemetry_enabled(&self) -> bool {
        self.shared.telemetry.is_enabled()
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &Transport {
        &self.shared.transport
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// A batch of packets sent together.
///
/// Created by [`Client::batch`]. Dereferences to the [`Client`], so everything reported through it is buffered
/// until it is dropped.
pub struct Batch<'a> {
    client: &'a Client,
    toggle: ReentrantMutexGuard<'a, RefCell<ToggleState>>,
}

impl std::ops::Deref for Batch<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        let shared = &self.client.shared;
        if !self.toggle.borrow().buffering {
            shared.buffered.store(false, Ordering::Release);
        }
        shared.flush();
        shared.batch_open.store(false, Ordering::Release);
    }
}
