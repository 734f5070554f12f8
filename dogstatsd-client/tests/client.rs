use std::{net::UdpSocket, sync::Arc, thread, time::Duration};

use dogstatsd_client::{
    AlertType, Client, DogStatsDBuilder, Event, MetricType, Priority, ServiceCheck, ServiceCheckStatus,
};

fn udp_receiver() -> (UdpSocket, String) {
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
fn full_wire_format_over_udp() {
    let (receiver, addr) = udp_receiver();
    let client = Client::builder()
        .with_remote_address(&addr)
        .unwrap()
        .with_telemetry(false)
        .with_namespace("svc")
        .with_constant_tags(["env:prod"])
        .build()
        .unwrap();

    client.report("latency", MetricType::Histogram, 0.25, &["route:/home", "bad tag!"], Some(1.0));
    assert_eq!(recv(&receiver), "svc.latency:0.25|h|#route:/home,bad_tag_,env:prod\n");

    let event = Event::new("Deploy", "line one\nline two")
        .with_timestamp(1_700_000_000)
        .with_hostname("web-1")
        .with_aggregation_key("deploys")
        .with_priority(Priority::Low)
        .with_source_type_name("ci")
        .with_alert_type(AlertType::Success)
        .with_tags(["version:1.2.3"]);
    client.event(&event).unwrap();
    assert_eq!(
        recv(&receiver),
        concat!(
            "_e{6,18}:Deploy|line one\\nline two|d:1700000000|h:web-1|k:deploys|p:low|s:ci|t:success",
            "|#version:1.2.3,env:prod\n",
        )
    );

    let check = ServiceCheck::new("svc.db", ServiceCheckStatus::Critical)
        .with_timestamp(1_700_000_000)
        .with_hostname("web-1")
        .with_tags(["db:main"])
        .with_message("connection refused\nm: retrying");
    client.service_check(&check);
    assert_eq!(
        recv(&receiver),
        "_sc|svc.db|2|d:1700000000|h:web-1|#db:main,env:prod|m:connection refused\\nm\\: retrying\n"
    );
}

#[test]
fn shared_client_across_threads() {
    let (receiver, addr) = udp_receiver();
    let client = Arc::new(
        Client::builder()
            .with_remote_address(&addr)
            .unwrap()
            .with_telemetry(false)
            .with_buffering(true)
            .with_flush_interval(Duration::from_millis(10))
            .build()
            .unwrap(),
    );

    let handles = (0..4)
        .map(|i| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                for _ in 0..50 {
                    client.increment("work", &[format!("worker:{i}").as_str()]);
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut received = 0;
    while received < 200 {
        received += recv(&receiver).lines().filter(|line| line.starts_with("work:1|c|#worker:")).count();
    }
    assert_eq!(received, 200);
}

#[test]
fn recorder_reports_through_client() {
    let (receiver, addr) = udp_receiver();
    let recorder = DogStatsDBuilder::default()
        .with_remote_address(&addr)
        .unwrap()
        .with_telemetry(false)
        .build_recorder()
        .unwrap();

    metrics::with_local_recorder(&recorder, || {
        metrics::counter!("jobs", "queue" => "default").increment(3);
        metrics::histogram!("job.duration").record(1.5);
    });

    assert_eq!(recv(&receiver), "jobs:3|c|#queue:default\n");
    assert_eq!(recv(&receiver), "job.duration:1.5|d\n");
}

#[cfg(unix)]
mod unixgram {
    use std::{os::unix::net::UnixDatagram, time::Duration};

    use dogstatsd_client::{Client, RemoteAddr};

    fn recv(receiver: &UnixDatagram) -> String {
        let mut buf = [0; 16384];
        let n = receiver.recv(&mut buf).expect("no payload received");
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[test]
    fn buffered_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsd.socket");
        let receiver = UnixDatagram::bind(&path).unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let client = Client::builder()
            .with_remote_address(format!("unixgram://{}", path.display()))
            .unwrap()
            .with_telemetry(false)
            .with_buffering(true)
            .build()
            .unwrap();
        assert_eq!(client.remote_addr(), &RemoteAddr::Unixgram(path.clone()));

        for i in 0..10 {
            client.gauge("temperature", i, &[]);
        }
        client.flush();

        let expected = (0..10).map(|i| format!("temperature:{i}|g\n")).collect::<String>();
        assert_eq!(recv(&receiver), expected);
    }

    #[test]
    fn telemetry_reports_uds_transport() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsd.socket");
        let receiver = UnixDatagram::bind(&path).unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let client = Client::builder()
            .with_remote_address(format!("unix://{}", path.display()))
            .unwrap()
            .with_telemetry_interval(Duration::from_millis(1))
            .build()
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        client.increment("requests", &[]);

        assert_eq!(recv(&receiver), "requests:1|c\n");

        let telemetry = recv(&receiver);
        let tags = format!("client:rust,client_version:{},client_transport:uds", env!("CARGO_PKG_VERSION"));
        assert!(telemetry.starts_with(&format!("datadog.dogstatsd.client.metrics:1|c|#{tags}\n")), "{telemetry}");
        assert!(telemetry.contains(&format!("datadog.dogstatsd.client.packets_sent:1|c|#{tags}\n")), "{telemetry}");
        assert_eq!(telemetry.lines().count(), 7);
    }
}
