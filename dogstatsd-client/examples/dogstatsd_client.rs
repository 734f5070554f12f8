use std::time::{Duration, Instant};

use dogstatsd_client::{AlertType, Client, Event, ServiceCheck, ServiceCheckStatus};

fn main() {
    tracing_subscriber::fmt::init();

    let client = Client::builder()
        .with_remote_address("localhost:9125")
        .expect("failed to parse remote address")
        .with_namespace("example")
        .with_constant_tags(["service:dogstatsd-client-example"])
        .with_buffering(true)
        .with_timing_in_milliseconds(true)
        .build()
        .expect("failed to build DogStatsD client");

    client
        .event(&Event::new("Example started", "The example is now sending metrics.").with_alert_type(AlertType::Info))
        .expect("event too large");

    let started = Instant::now();
    let mut iterations = 0u64;
    while started.elapsed() < Duration::from_secs(60) {
        let _guard = client.time("iteration.duration", &[]);

        client.increment("iterations", &["kind:loop"]);
        client.gauge("uptime_secs", started.elapsed().as_secs_f64(), &[]);
        client.set("iteration.parity", if iterations % 2 == 0 { "even" } else { "odd" }, &[]);

        // Send a handful of related metrics together, even though buffering might be disabled later.
        if iterations % 100 == 0 {
            let batch = client.batch().expect("batch already in progress");
            for shard in 0..4 {
                batch.distribution("shard.load", shard * 10, &[format!("shard:{shard}").as_str()]);
            }
        }

        client.service_check(&ServiceCheck::new("example.alive", ServiceCheckStatus::Ok));

        iterations += 1;
        std::thread::sleep(Duration::from_millis(50));
    }

    let telemetry = client.telemetry();
    tracing::info!(
        metrics = telemetry.metrics,
        packets_sent = telemetry.packets_sent,
        packets_dropped = telemetry.packets_dropped,
        "Example finished."
    );
}
