//! A client for sending metrics, events, and service checks to a [DogStatsD][dsd]-compatible server.
//!
//! [dsd]: https://docs.datadoghq.com/developers/dogstatsd/
//!
//! # Usage
//!
//! ```no_run
//! # use dogstatsd_client::{Client, Event, ServiceCheck, ServiceCheckStatus};
//! // First, create a client through its builder.
//! //
//! // The builder can configure many aspects of the client, such as changing the remote address, adding a namespace or
//! // constant tags to every metric, enabling buffering, and more.
//! let client = Client::builder()
//!     .with_namespace("my_app")
//!     .with_constant_tags(["env:prod"])
//!     .with_buffering(true)
//!     .build()
//!     .expect("failed to build client");
//!
//! // Metrics are reported with a name, a value, and a set of tags.
//! client.increment("requests", &["route:home"]);
//! client.gauge("queue.depth", 42, &[]);
//! client.distribution("request.size", 1.5, &[]);
//!
//! // Events and service checks are built up and then sent.
//! client.event(&Event::new("Deployment", "Version 1.2.3 deployed")).expect("event too large");
//! client.service_check(&ServiceCheck::new("my_app.can_connect", ServiceCheckStatus::Ok));
//!
//! // Scopes can be timed, reporting the elapsed time when the guard is dropped.
//! {
//!     let _guard = client.time("request.duration", &[]);
//! }
//!
//! // Buffered packets are flushed periodically, and when the client is dropped.
//! client.flush();
//! ```
//!
//! For applications already instrumented with the [`metrics`] crate, the client can instead be installed as the global
//! recorder:
//!
//! ```no_run
//! # use dogstatsd_client::DogStatsDBuilder;
//! DogStatsDBuilder::default().install().expect("failed to install recorder");
//!
//! metrics::counter!("requests", "route" => "home").increment(1);
//! ```
//!
//! # Features
//!
//! ## Buffering
//!
//! By default, every packet is sent on its own as soon as it is reported. When buffering is enabled, packets are
//! batched into payloads of up to the maximum payload length, which are sent when full, when the client is flushed,
//! and periodically by a background thread. A [`Batch`] forces buffering for a bounded scope, regardless of the
//! configured mode.
//!
//! ## Transports
//!
//! Packets can be sent over UDP or, on Unix platforms, over Unix domain sockets in `SOCK_DGRAM` mode. Either way,
//! sending never blocks: payloads that cannot be sent right away are dropped. Connections are created lazily, and
//! replaced after errors that leave them unusable.
//!
//! ## Telemetry
//!
//! The client counts the metrics, events, and service checks reported through it, along with the payloads and bytes
//! sent or dropped. These counters are periodically sent, under the `datadog.dogstatsd.client` namespace, to align with
//! the telemetry emitted by official DogStatsD clients. Telemetry can go to a separate destination.
//!
//! ## Origin detection
//!
//! A container ID, either given directly or obtained from a [`ContainerIdProvider`], can be attached to every packet to
//! let the Datadog Agent enrich metrics with container-level tags.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod buffer;

mod builder;
pub use self::builder::{BuildError, DogStatsDBuilder};

mod client;
pub use self::client::{Batch, Client, ClientError};

mod container;
pub use self::container::ContainerIdProvider;

mod recorder;
pub use self::recorder::DogStatsDRecorder;

mod scheduler;

mod serializer;
pub use self::serializer::{AlertType, Event, MetricType, MetricValue, Priority, ServiceCheck, ServiceCheckStatus};

mod telemetry;
pub use self::telemetry::TelemetrySnapshot;

mod timing;
pub use self::timing::TimedGuard;

mod transport;
pub use self::transport::RemoteAddr;
