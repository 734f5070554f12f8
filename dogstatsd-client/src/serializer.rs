use bytes::Bytes;

use crate::client::ClientError;

/// Maximum encoded size of a single event.
pub(crate) const MAX_EVENT_SIZE: usize = 8 * 1024;

/// DogStatsD metric type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricType {
    /// A gauge (`g`).
    Gauge,

    /// A counter (`c`).
    Count,

    /// A histogram (`h`).
    Histogram,

    /// A distribution (`d`).
    Distribution,

    /// A timing, in milliseconds (`ms`).
    Timing,

    /// A set of unique values (`s`).
    Set,
}

impl MetricType {
    /// Returns the wire representation of the metric type.
    pub const fn as_str(self) -> &'static str {
        match self {
            MetricType::Gauge => "g",
            MetricType::Count => "c",
            MetricType::Histogram => "h",
            MetricType::Distribution => "d",
            MetricType::Timing => "ms",
            MetricType::Set => "s",
        }
    }
}

/// The value of a single metric observation.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    /// An integer value.
    Integer(i64),

    /// A floating-point value.
    Float(f64),

    /// A free-form value, used for set members.
    Text(String),
}

impl MetricValue {
    /// Returns the negated value.
    ///
    /// Text values are returned unchanged.
    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            MetricValue::Integer(v) => MetricValue::Integer(v.wrapping_neg()),
            MetricValue::Float(v) => MetricValue::Float(-v),
            MetricValue::Text(v) => MetricValue::Text(v),
        }
    }
}

macro_rules! impl_from_integer {
    ($($t:ty),*) => {
        $(
            impl From<$t> for MetricValue {
                fn from(value: $t) -> Self {
                    MetricValue::Integer(i64::from(value))
                }
            }
        )*
    };
}

impl_from_integer!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(MetricValue::Float(value as f64), MetricValue::Integer)
    }
}

impl From<usize> for MetricValue {
    fn from(value: usize) -> Self {
        MetricValue::from(value as u64)
    }
}

impl From<f32> for MetricValue {
    fn from(value: f32) -> Self {
        MetricValue::Float(f64::from(value))
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

struct MetricValueFormatter {
    int_writer: itoa::Buffer,
    float_writer: ryu::Buffer,
}

impl MetricValueFormatter {
    fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), float_writer: ryu::Buffer::new() }
    }

    fn format<'a>(&'a mut self, value: &'a MetricValue) -> &'a str {
        match value {
            MetricValue::Integer(v) => self.int_writer.format(*v),
            MetricValue::Float(v) => self.float_writer.format(*v),
            MetricValue::Text(v) => v.as_str(),
        }
    }
}

/// Event priority.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Priority {
    /// Normal priority.
    Normal,

    /// Low priority.
    Low,
}

impl Priority {
    const fn as_str(self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Event alert type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlertType {
    /// An error.
    Error,

    /// A warning.
    Warning,

    /// Informational.
    Info,

    /// A success.
    Success,
}

impl AlertType {
    const fn as_str(self) -> &'static str {
        match self {
            AlertType::Error => "error",
            AlertType::Warning => "warning",
            AlertType::Info => "info",
            AlertType::Success => "success",
        }
    }
}

/// An event, as understood by the Datadog event stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    title: String,
    text: String,
    timestamp: Option<u64>,
    hostname: Option<String>,
    aggregation_key: Option<String>,
    priority: Option<Priority>,
    source_type_name: Option<String>,
    alert_type: Option<AlertType>,
    tags: Vec<String>,
}

impl Event {
    /// Creates a new `Event` with the given title and text.
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            timestamp: None,
            hostname: None,
            aggregation_key: None,
            priority: None,
            source_type_name: None,
            alert_type: None,
            tags: Vec::new(),
        }
    }

    /// Sets the time the event happened, in seconds since the Unix epoch.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the hostname the event originated from.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Sets the aggregation key, used to group events in the event stream.
    #[must_use]
    pub fn with_aggregation_key(mut self, key: impl Into<String>) -> Self {
        self.aggregation_key = Some(key.into());
        self
    }

    /// Sets the event priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the source type name.
    #[must_use]
    pub fn with_source_type_name(mut self, source: impl Into<String>) -> Self {
        self.source_type_name = Some(source.into());
        self
    }

    /// Sets the alert type.
    #[must_use]
    pub fn with_alert_type(mut self, alert_type: AlertType) -> Self {
        self.alert_type = Some(alert_type);
        self
    }

    /// Sets the event tags.
    #[must_use]
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the event title.
    pub fn title(&self) -> &str {
        &self.title
    }
}

/// Status of a service check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceCheckStatus {
    /// The service is healthy.
    Ok = 0,

    /// The service is degraded.
    Warning = 1,

    /// The service is failing.
    Critical = 2,

    /// The service state could not be determined.
    Unknown = 3,
}

/// A service check run.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceCheck {
    name: String,
    status: ServiceCheckStatus,
    timestamp: Option<u64>,
    hostname: Option<String>,
    message: Option<String>,
    tags: Vec<String>,
}

impl ServiceCheck {
    /// Creates a new `ServiceCheck` with the given check name and status.
    pub fn new(name: impl Into<String>, status: ServiceCheckStatus) -> Self {
        Self {
            name: name.into(),
            status,
            timestamp: None,
            hostname: None,
            message: None,
            tags: Vec::new(),
        }
    }

    /// Sets the time of the check run, in seconds since the Unix epoch.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the hostname the check ran on.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Sets the message describing the check result.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Sets the check tags.
    #[must_use]
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Turns metrics, events and service checks into DogStatsD packets.
///
/// The serializer carries the parts of the configuration that end up in every packet: the namespace, the constant
/// tags, and the container ID. It holds no other state, and every packet it produces is independent of it once
/// returned.
pub(crate) struct Serializer {
    namespace: Option<String>,
    constant_tags: Vec<String>,
    container_id: Option<String>,
}

impl Serializer {
    pub fn new(
        namespace: Option<String>,
        constant_tags: Vec<String>,
        container_id: Option<String>,
    ) -> Self {
        Self { namespace, constant_tags, container_id }
    }

    /// Serializes a single metric observation.
    pub fn metric(
        &self,
        name: &str,
        metric_type: MetricType,
        value: &MetricValue,
        tags: &[&str],
        sample_rate: f64,
    ) -> Bytes {
        let mut buf = Vec::with_capacity(64);

        if let Some(namespace) = self.namespace.as_deref() {
            buf.extend_from_slice(namespace.as_bytes());
            buf.push(b'.');
        }
        buf.extend_from_slice(name.as_bytes());

        let mut formatter = MetricValueFormatter::new();
        buf.push(b':');
        buf.extend_from_slice(formatter.format(value).as_bytes());

        buf.push(b'|');
        buf.extend_from_slice(metric_type.as_str().as_bytes());

        // Write the sample rate if it's not 1.0, as that is the implied default.
        #[allow(clippy::float_cmp)]
        if sample_rate != 1.0 {
            let mut float_writer = ryu::Buffer::new();
            buf.extend_from_slice(b"|@");
            buf.extend_from_slice(float_writer.format(sample_rate).as_bytes());
        }

        let all_tags = tags.iter().copied().chain(self.constant_tags.iter().map(String::as_str));
        write_tags(&mut buf, all_tags, true);
        self.write_container_id(&mut buf);

        Bytes::from(buf)
    }

    /// Serializes an event.
    ///
    /// # Errors
    ///
    /// If the encoded event is larger than 8KiB, an error is returned and no packet is produced.
    pub fn event(&self, event: &Event) -> Result<Bytes, ClientError> {
        let title = escape_event_content(&event.title);
        let text = escape_event_content(&event.text);

        let mut buf = Vec::with_capacity(title.len() + text.len() + 64);
        let mut int_writer = itoa::Buffer::new();

        buf.extend_from_slice(b"_e{");
        buf.extend_from_slice(int_writer.format(title.len()).as_bytes());
        buf.push(b',');
        buf.extend_from_slice(int_writer.format(text.len()).as_bytes());
        buf.extend_from_slice(b"}:");
        buf.extend_from_slice(title.as_bytes());
        buf.push(b'|');
        buf.extend_from_slice(text.as_bytes());

        if let Some(timestamp) = event.timestamp {
            write_field(&mut buf, b"|d:", int_writer.format(timestamp));
        }
        if let Some(hostname) = event.hostname.as_deref() {
            write_field(&mut buf, b"|h:", hostname);
        }
        if let Some(key) = event.aggregation_key.as_deref() {
            write_field(&mut buf, b"|k:", key);
        }
        if let Some(priority) = event.priority {
            write_field(&mut buf, b"|p:", priority.as_str());
        }
        if let Some(source) = event.source_type_name.as_deref() {
            write_field(&mut buf, b"|s:", source);
        }
        if let Some(alert_type) = event.alert_type {
            write_field(&mut buf, b"|t:", alert_type.as_str());
        }

        let all_tags = event.tags.iter().chain(self.constant_tags.iter()).map(String::as_str);
        write_tags(&mut buf, all_tags, false);
        self.write_container_id(&mut buf);

        if buf.len() > MAX_EVENT_SIZE {
            return Err(ClientError::EventTooLarge { title: event.title.clone(), size: buf.len() });
        }

        Ok(Bytes::from(buf))
    }

    /// Serializes a service check.
    pub fn service_check(&self, check: &ServiceCheck) -> Bytes {
        let mut buf = Vec::with_capacity(64);
        let mut int_writer = itoa::Buffer::new();

        buf.extend_from_slice(b"_sc|");
        buf.extend_from_slice(check.name.as_bytes());
        buf.push(b'|');
        buf.extend_from_slice(int_writer.format(check.status as u8).as_bytes());

        if let Some(timestamp) = check.timestamp {
            write_field(&mut buf, b"|d:", int_writer.format(timestamp));
        }
        if let Some(hostname) = check.hostname.as_deref() {
            write_field(&mut buf, b"|h:", hostname);
        }

        let all_tags = check.tags.iter().chain(self.constant_tags.iter()).map(String::as_str);
        write_tags(&mut buf, all_tags, false);

        if let Some(message) = check.message.as_deref().filter(|m| !m.is_empty()) {
            write_field(&mut buf, b"|m:", &escape_service_check_message(message));
        }
        self.write_container_id(&mut buf);

        Bytes::from(buf)
    }

    fn write_container_id(&self, buf: &mut Vec<u8>) {
        if let Some(container_id) = self.container_id.as_deref() {
            write_field(buf, b"|c:", container_id);
        }
    }
}

fn write_field(buf: &mut Vec<u8>, prefix: &[u8], value: &str) {
    buf.extend_from_slice(prefix);
    buf.extend_from_slice(value.as_bytes());
}

fn write_tags<'a, I>(buf: &mut Vec<u8>, tags: I, normalize: bool)
where
    I: Iterator<Item = &'a str>,
{
    let mut wrote_tag = false;
    for tag in tags {
        // If we haven't written a tag yet, write out the tags prefix first.
        //
        // Otherwise, write a tag separator.
        if wrote_tag {
            buf.push(b',');
        } else {
            buf.extend_from_slice(b"|#");
            wrote_tag = true;
        }

        if normalize {
            write_normalized_tag(buf, tag);
        } else {
            buf.extend_from_slice(tag.as_bytes());
        }
    }
}

fn is_valid_tag_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | ':' | '/' | '.')
}

fn write_normalized_tag(buf: &mut Vec<u8>, tag: &str) {
    if tag.chars().all(is_valid_tag_char) {
        buf.extend_from_slice(tag.as_bytes());
        return;
    }

    let mut char_buf = [0; 4];
    for c in tag.chars() {
        if is_valid_tag_char(c) {
            buf.extend_from_slice(c.encode_utf8(&mut char_buf).as_bytes());
        } else {
            buf.push(b'_');
        }
    }
}

fn escape_event_content(s: &str) -> String {
    s.replace('\n', "\\n")
}

fn escape_service_check_message(s: &str) -> String {
    escape_event_content(s).replace("m:", "m\\:")
}

/// Writes a tag derived from a `metrics` label.
///
/// If the label value is empty, we treat it as a bare tag. This means all we write is something like `label_name`,
/// instead of a more naive form, like `label_name:`.
pub(crate) fn label_to_tag(label: &metrics::Label) -> String {
    if label.value().is_empty() {
        label.key().to_string()
    } else {
        format!("{}:{}", label.key(), label.value())
    }
}
