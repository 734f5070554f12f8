use std::{sync::Arc, time::Duration};

use quanta::Clock;
use thiserror::Error;
use tracing::debug;

use crate::{
    client::{Client, ClientConfiguration, Sampler},
    container::{resolve_container_id, ContainerIdProvider},
    recorder::DogStatsDRecorder,
    serializer::Serializer,
    telemetry::TelemetryRecorder,
    transport::{RemoteAddr, Transport},
};

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(300);
const DEFAULT_TELEMETRY_INTERVAL: Duration = Duration::from_secs(10);

// Smallest payload that can hold a single packet: `a:0|c\n`.
const MIN_PAYLOAD_LEN: usize = 6;

/// Errors that could occur while building or installing a DogStatsD client.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// The sample rate is not between 0 and 1.
    #[error("invalid sample rate {rate} (expected a value between 0 and 1)")]
    InvalidSampleRate {
        /// The rejected sample rate.
        rate: f64,
    },

    /// The maximum payload length is too small to hold a single packet.
    #[error("invalid maximum payload length {len} (expected at least {min} bytes)", min = MIN_PAYLOAD_LEN)]
    InvalidMaximumPayloadLength {
        /// The rejected length.
        len: usize,
    },

    /// Failed to spawn the background flush thread.
    #[error("failed to spawn background flush thread")]
    Backend,

    /// Failed to install the recorder due to an existing global recorder already being installed.
    #[error("failed to install recorder as global recorder")]
    FailedToInstall,
}

/// Builder for a DogStatsD client.
pub struct DogStatsDBuilder {
    remote_addr: RemoteAddr,
    telemetry_addr: Option<RemoteAddr>,
    namespace: Option<String>,
    constant_tags: Vec<String>,
    default_sample_rate: f64,
    buffering: bool,
    flush_interval: Duration,
    max_payload_len: Option<usize>,
    telemetry: bool,
    telemetry_interval: Duration,
    container_id: Option<String>,
    container_id_provider: Option<Box<dyn ContainerIdProvider>>,
    use_ms: bool,
    enabled: bool,
    sampling_seed: Option<u64>,
    histograms_as_distributions: bool,
    clock: Clock,
}

impl DogStatsDBuilder {
    /// Set the remote address to send packets to.
    ///
    /// For UDP, the address simply needs to be in the format of `<host>:<port>`. The host is resolved every time a new
    /// connection is created, preferring IPv4 addresses. For Unix domain sockets, an address in the format of
    /// `<scheme>://<path>`, where the scheme is either `unix` or `unixgram`. Either way, a datagram (`SOCK_DGRAM`)
    /// socket is used.
    ///
    /// Defaults to sending to `localhost:8125` over UDP.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed as a valid address, an error will be returned indicating the
    /// reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        self.remote_addr = parse_remote_address(addr.as_ref())?;
        Ok(self)
    }

    /// Set a separate remote address to send client telemetry to.
    ///
    /// Uses the same format as [`with_remote_address`][Self::with_remote_address].
    ///
    /// Defaults to sending telemetry to the same remote address as everything else.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed as a valid address, an error will be returned indicating the
    /// reason.
    pub fn with_telemetry_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        self.telemetry_addr = Some(parse_remote_address(addr.as_ref())?);
        Ok(self)
    }

    /// Set the namespace prefixed, with a dot, to every metric name.
    ///
    /// Events and service checks are not affected.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.namespace = if namespace.is_empty() { None } else { Some(namespace) };
        self
    }

    /// Set the tags added to every metric, event, and service check.
    ///
    /// Constant tags are written after the tags given when reporting.
    #[must_use]
    pub fn with_constant_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.constant_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the sample rate used when none is given when reporting.
    ///
    /// Defaults to 1, which sends every observation.
    ///
    /// # Errors
    ///
    /// If the sample rate is not between 0 and 1, inclusive, an error is returned.
    pub fn with_default_sample_rate(mut self, rate: f64) -> Result<Self, BuildError> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(BuildError::InvalidSampleRate { rate });
        }

        self.default_sample_rate = rate;
        Ok(self)
    }

    /// Sets whether or not packets are buffered.
    ///
    /// When enabled, packets are batched into payloads of up to the maximum payload length, which are sent when full,
    /// when the client is flushed, and periodically in the background at the flush interval.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_buffering(mut self, buffering: bool) -> Self {
        self.buffering = buffering;
        self
    }

    /// Set the interval at which buffered packets are flushed in the background.
    ///
    /// Intervals of 100 microseconds or less disable background flushing entirely, leaving it to the caller to flush
    /// explicitly.
    ///
    /// Defaults to 300 milliseconds.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Set the maximum payload length.
    ///
    /// This controls the maximum size of a single buffered payload. This should generally be set to the same value
    /// (or lower) as `dogstatsd_buffer_size` in the Datadog Agent.
    ///
    /// Defaults to 1432 bytes for UDP, which fits within a typical Ethernet MTU, and 8192 bytes for Unix domain
    /// sockets.
    #[must_use]
    pub fn with_maximum_payload_length(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = Some(max_payload_len);
        self
    }

    /// Sets whether or not to enable telemetry for the client.
    ///
    /// When enabled, additional metrics are periodically sent that provide insight into the operation of the client
    /// itself: how many metrics, events, and service checks were reported, and how many payloads and bytes were sent or
    /// dropped.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: bool) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Set the interval at which telemetry is sent.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_telemetry_interval(mut self, interval: Duration) -> Self {
        self.telemetry_interval = interval;
        self
    }

    /// Set the container ID attached to every packet.
    ///
    /// Takes precedence over [`with_origin_detection`][Self::with_origin_detection].
    #[must_use]
    pub fn with_container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    /// Enables origin detection, using `provider` to determine the container ID attached to every packet.
    ///
    /// The provider is called once, when the client is built.
    #[must_use]
    pub fn with_origin_detection<P>(mut self, provider: P) -> Self
    where
        P: ContainerIdProvider + 'static,
    {
        self.container_id_provider = Some(Box::new(provider));
        self
    }

    /// Sets whether or not timing guards report elapsed time in milliseconds.
    ///
    /// Defaults to `false`, which reports elapsed time in seconds.
    #[must_use]
    pub fn with_timing_in_milliseconds(mut self, use_ms: bool) -> Self {
        self.use_ms = use_ms;
        self
    }

    /// Sets whether or not the client sends anything at all.
    ///
    /// A disabled client accepts every call and does nothing with it.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set a seed for sampling decisions.
    ///
    /// By default, sampling uses a thread-local random number generator. When a seed is given, a single seeded
    /// generator is shared instead, making sampling decisions reproducible.
    #[must_use]
    pub fn with_sampling_seed(mut self, seed: u64) -> Self {
        self.sampling_seed = Some(seed);
        self
    }

    /// Sets whether or not the recorder sends histograms as distributions.
    ///
    /// Only affects [`DogStatsDRecorder`]. Histograms have a specific set of aggregates calculated locally in the
    /// Datadog Agent, whereas distributions are aggregated entirely on the Datadog backend, and provide richer support
    /// for global aggregation and percentiles.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn send_histograms_as_distributions(mut self, histograms_as_distributions: bool) -> Self {
        self.histograms_as_distributions = histograms_as_distributions;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the client.
    ///
    /// No connection is made until the first payload is sent.
    ///
    /// # Errors
    ///
    /// If the maximum payload length is too small, or if buffering is enabled and the background flush thread cannot
    /// be spawned, an error will be returned.
    pub fn build(self) -> Result<Client, BuildError> {
        self.build_inner().map(|(client, _)| client)
    }

    fn build_inner(self) -> Result<(Client, bool), BuildError> {
        let max_payload_len = self.max_payload_len.unwrap_or_else(|| self.remote_addr.default_max_payload_len());
        if max_payload_len < MIN_PAYLOAD_LEN {
            return Err(BuildError::InvalidMaximumPayloadLength { len: max_payload_len });
        }

        let container_id = resolve_container_id(self.container_id, self.container_id_provider.as_deref());
        let telemetry = TelemetryRecorder::new(
            self.telemetry,
            self.telemetry_interval,
            self.clock.clone(),
            self.remote_addr.transport_id(),
            &self.constant_tags,
        );
        let serializer = Serializer::new(self.namespace, self.constant_tags, container_id);

        debug!(
            remote_addr = ?self.remote_addr,
            telemetry_addr = ?self.telemetry_addr,
            max_payload_len,
            buffering = self.buffering,
            telemetry = self.telemetry,
            "Building DogStatsD client."
        );
        let transport = Transport::new(self.remote_addr, self.telemetry_addr);

        let config = ClientConfiguration {
            default_sample_rate: self.default_sample_rate,
            flush_interval: self.flush_interval,
            max_payload_len,
            use_ms: self.use_ms,
            enabled: self.enabled,
            clock: self.clock,
        };
        let sampler = self.sampling_seed.map_or(Sampler::ThreadLocal, Sampler::seeded);

        let client = Client::new(config, serializer, transport, telemetry, sampler);
        if self.buffering {
            client.toggle_buffering(true).map_err(|_| BuildError::Backend)?;
        }

        Ok((client, self.histograms_as_distributions))
    }

    /// Builds the client and wraps it in a [`metrics`] recorder.
    ///
    /// The recorder must be manually installed by the caller.
    ///
    /// # Errors
    ///
    /// If the client cannot be built, an error will be returned.
    pub fn build_recorder(self) -> Result<DogStatsDRecorder, BuildError> {
        let (client, histograms_as_distributions) = self.build_inner()?;
        Ok(DogStatsDRecorder::new(Arc::new(client), histograms_as_distributions))
    }

    /// Builds the recorder and installs it as the global recorder.
    ///
    /// # Errors
    ///
    /// If the client cannot be built, or if a global recorder is already installed, an error will be returned.
    pub fn install(self) -> Result<(), BuildError> {
        let recorder = self.build_recorder()?;

        metrics::set_global_recorder(recorder).map_err(|_| BuildError::FailedToInstall)
    }
}

fn parse_remote_address(addr: &str) -> Result<RemoteAddr, BuildError> {
    RemoteAddr::try_from(addr).map_err(|reason| BuildError::InvalidRemoteAddress { reason })
}

impl Default for DogStatsDBuilder {
    fn default() -> Self {
        DogStatsDBuilder {
            remote_addr: RemoteAddr::default(),
            telemetry_addr: None,
            namespace: None,
            constant_tags: Vec::new(),
            default_sample_rate: 1.0,
            buffering: false,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_payload_len: None,
            telemetry: true,
            telemetry_interval: DEFAULT_TELEMETRY_INTERVAL,
            container_id: None,
            container_id_provider: None,
            use_ms: false,
            enabled: true,
            sampling_seed: None,
            histograms_as_distributions: true,
            clock: Clock::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, net::UdpSocket, time::Duration};

    use quanta::Clock;

    use super::{BuildError, DogStatsDBuilder};
    use crate::transport::RemoteAddr;

    fn receiver() -> (UdpSocket, String) {
        let receiver = UdpSocket::bind("127.0.0.1:0").expect("failed to bind receiver");
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let addr = receiver.local_addr().unwrap().to_string();
        (receiver, addr)
    }

    fn recv(receiver: &UdpSocket) -> String {
        let mut buf = [0; 8192];
        let n = receiver.recv(&mut buf).expect("no payload received");
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[test]
    fn defaults() {
        let client = DogStatsDBuilder::default().with_telemetry(false).build().unwrap();
        assert_eq!(client.remote_addr(), &RemoteAddr::Udp { host: "localhost".to_string(), port: 8125 });
        assert!(!client.buffering_enabled());
    }

    #[test]
    fn invalid_remote_addresses() {
        for addr in ["localhost", "localhost:port", "tcp://localhost:8125"] {
            let result = DogStatsDBuilder::default().with_remote_address(addr);
            assert!(matches!(result, Err(BuildError::InvalidRemoteAddress { .. })), "addr: {addr}");

            let result = DogStatsDBuilder::default().with_telemetry_address(addr);
            assert!(matches!(result, Err(BuildError::InvalidRemoteAddress { .. })), "addr: {addr}");
        }
    }

    #[test]
    fn invalid_sample_rates() {
        for rate in [-0.1, 1.5, f64::NAN] {
            let result = DogStatsDBuilder::default().with_default_sample_rate(rate);
            assert!(matches!(result, Err(BuildError::InvalidSampleRate { .. })), "rate: {rate}");
        }

        for rate in [0.0, 0.25, 1.0] {
            assert!(DogStatsDBuilder::default().with_default_sample_rate(rate).is_ok(), "rate: {rate}");
        }
    }

    #[test]
    fn invalid_maximum_payload_length() {
        let result = DogStatsDBuilder::default().with_maximum_payload_length(5).build();
        assert!(matches!(result, Err(BuildError::InvalidMaximumPayloadLength { len: 5 })));

        assert!(DogStatsDBuilder::default().with_maximum_payload_length(6).with_telemetry(false).build().is_ok());
    }

    #[test]
    fn namespace_constant_tags_and_container_id() {
        let (receiver, addr) = receiver();
        let client = DogStatsDBuilder::default()
            .with_remote_address(&addr)
            .unwrap()
            .with_telemetry(false)
            .with_namespace("app")
            .with_constant_tags(["env:prod"])
            .with_container_id("abc123")
            .with_origin_detection(|| -> io::Result<Option<String>> { Ok(Some("ignored".to_string())) })
            .build()
            .unwrap();

        client.increment("requests", &["route:home"]);
        assert_eq!(recv(&receiver), "app.requests:1|c|#route:home,env:prod|c:abc123\n");
    }

    #[test]
    fn origin_detection() {
        let (receiver, addr) = receiver();
        let client = DogStatsDBuilder::default()
            .with_remote_address(&addr)
            .unwrap()
            .with_telemetry(false)
            .with_origin_detection(|| -> io::Result<Option<String>> { Ok(Some("def456".to_string())) })
            .build()
            .unwrap();

        client.increment("requests", &[]);
        assert_eq!(recv(&receiver), "requests:1|c|c:def456\n");
    }

    #[test]
    fn empty_namespace_is_ignored() {
        let (receiver, addr) = receiver();
        let client = DogStatsDBuilder::default()
            .with_remote_address(&addr)
            .unwrap()
            .with_telemetry(false)
            .with_namespace("")
            .build()
            .unwrap();

        client.increment("requests", &[]);
        assert_eq!(recv(&receiver), "requests:1|c\n");
    }

    #[test]
    fn telemetry_is_sent_to_telemetry_address() {
        let (main_receiver, addr) = receiver();
        let (telemetry_receiver, telemetry_addr) = receiver();
        let (clock, mock) = Clock::mock();
        let client = DogStatsDBuilder::default()
            .with_remote_address(&addr)
            .unwrap()
            .with_telemetry_address(&telemetry_addr)
            .unwrap()
            .with_constant_tags(["env:prod"])
            .with_clock(clock)
            .build()
            .unwrap();

        client.increment("requests", &[]);
        assert_eq!(recv(&main_receiver), "requests:1|c|#env:prod\n");

        mock.increment(Duration::from_secs(11));
        client.increment("requests", &[]);
        assert_eq!(recv(&main_receiver), "requests:1|c|#env:prod\n");

        let tags = format!("client:rust,client_version:{},client_transport:udp,env:prod", env!("CARGO_PKG_VERSION"));
        let payload_len = "requests:1|c|#env:prod\n".len() * 2;
        let expected = format!(
            "datadog.dogstatsd.client.metrics:2|c|#{tags}\n\
             datadog.dogstatsd.client.events:0|c|#{tags}\n\
             datadog.dogstatsd.client.service_checks:0|c|#{tags}\n\
             datadog.dogstatsd.client.bytes_sent:{payload_len}|c|#{tags}\n\
             datadog.dogstatsd.client.bytes_dropped:0|c|#{tags}\n\
             datadog.dogstatsd.client.packets_sent:2|c|#{tags}\n\
             datadog.dogstatsd.client.packets_dropped:0|c|#{tags}\n"
        );
        assert_eq!(recv(&telemetry_receiver), expected);

        // The telemetry payload itself is counted in the next window.
        let snapshot = client.telemetry();
        assert_eq!(snapshot.metrics, 0);
        assert_eq!(snapshot.packets_sent, 1);
        assert_eq!(snapshot.bytes_sent, expected.len() as u64);
    }
}
