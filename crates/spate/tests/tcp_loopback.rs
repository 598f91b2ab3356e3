use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, unbounded};
use spate::{Config, Engine, InstanceId, Proto, Report, ReportSink, State};

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<Report>>,
}

impl ReportSink for RecordingSink {
    fn emit(&self, report: &Report) {
        self.records.lock().unwrap().push(*report);
    }
}

impl RecordingSink {
    fn summary_bytes(&self, id: InstanceId) -> Option<u64> {
        self.records.lock().unwrap().iter().find_map(|r| match r {
            Report::Summary { id: rid, bytes, .. } if *rid == id => Some(*bytes),
            _ => None,
        })
    }

    fn connect_info(&self, id: InstanceId) -> Option<(std::net::SocketAddr, std::net::SocketAddr)> {
        self.records.lock().unwrap().iter().find_map(|r| match r {
            Report::ConnectInfo { id: rid, local, peer } if *rid == id => Some((*local, *peer)),
            _ => None,
        })
    }
}

fn watch_closed(engine: &Engine) -> Receiver<InstanceId> {
    let (closed_tx, closed_rx) = unbounded();
    engine.set_state_handler(move |id, event| {
        if event.state == State::Closed {
            let _ = closed_tx.send(id);
        }
    });
    closed_rx
}

fn wait_closed(rx: &Receiver<InstanceId>, count: usize, timeout: Duration) {
    for _ in 0..count {
        rx.recv_timeout(timeout).expect("instance did not close in time");
    }
}

#[test]
fn bandwidth_limited_tcp_client() {
    let sink = Arc::new(RecordingSink::default());
    let engine = Engine::with_sink(sink.clone());
    let closed = watch_closed(&engine);

    let mut server = Config::server(Proto::Tcp, "0.0.0.0".parse().unwrap());
    server.sport = 5311;
    server.interval_s = 5;
    server.time_s = 30;
    let server_id = engine.start_instance(&server).unwrap();

    thread::sleep(Duration::from_millis(200));

    let mut client = Config::client(Proto::Tcp, "127.0.0.1".parse().unwrap());
    client.dport = 5311;
    client.interval_s = 1;
    client.time_s = 5;
    client.bandwidth_limit = Some(10_000_000);
    let client_id = engine.start_instance(&client).unwrap();

    // the server leaves on the client's FIN, so both close without a stop
    wait_closed(&closed, 2, Duration::from_secs(30));

    let client_total = sink.summary_bytes(client_id).unwrap();
    let server_total = sink.summary_bytes(server_id).unwrap();

    // 10 Mbit/s over 5 seconds, 10 % tolerance
    let mbits = client_total as f64 * 8.0 / 5.0 / 1e6;
    assert!((9.0..=11.0).contains(&mbits), "observed {mbits} Mbits/sec");

    // a stream delivers everything sent before the close
    let diff = client_total.abs_diff(server_total);
    assert!(diff <= 16 * 1024, "client={client_total} server={server_total}");
}

#[test]
fn tcp_v6_loopback_with_source_bind() {
    let sink = Arc::new(RecordingSink::default());
    let engine = Engine::with_sink(sink.clone());
    let closed = watch_closed(&engine);

    let mut server = Config::server(Proto::Tcp, "::".parse().unwrap());
    server.sport = 5312;
    server.interval_s = 2;
    server.time_s = 30;
    let server_id = engine.start_instance(&server).unwrap();

    thread::sleep(Duration::from_millis(200));

    let mut client = Config::client(Proto::Tcp, "::1".parse().unwrap());
    client.dport = 5312;
    client.source = "::1".parse().unwrap();
    client.sport = 6666;
    client.interval_s = 1;
    client.time_s = 3;
    client.bandwidth_limit = Some(40_000_000);
    let client_id = engine.start_instance(&client).unwrap();

    wait_closed(&closed, 2, Duration::from_secs(30));

    // the accepted peer is the bound client port
    let (_, peer) = sink.connect_info(server_id).expect("server connect info");
    assert_eq!(peer.port(), 6666);
    assert!(peer.ip().is_ipv6());

    let client_total = sink.summary_bytes(client_id).unwrap();
    let server_total = sink.summary_bytes(server_id).unwrap();
    assert!(client_total > 0);
    let diff = client_total.abs_diff(server_total);
    assert!(diff <= 16 * 1024, "client={client_total} server={server_total}");
}

#[test]
fn tcp_client_without_server_closes_without_starting() {
    let engine = Engine::new();
    let started = Arc::new(Mutex::new(false));
    let (closed_tx, closed_rx) = unbounded();
    {
        let started = started.clone();
        engine.set_state_handler(move |id, event| {
            if event.state == State::Started {
                *started.lock().unwrap() = true;
            }
            if event.state == State::Closed {
                let _ = closed_tx.send(id);
            }
        });
    }

    // nothing listens on this port; connect is refused on loopback
    let mut client = Config::client(Proto::Tcp, "127.0.0.1".parse().unwrap());
    client.dport = 5313;
    client.interval_s = 1;
    client.time_s = 2;
    assert!(engine.start_instance(&client).is_ok());

    wait_closed(&closed_rx, 1, Duration::from_secs(10));
    assert!(!*started.lock().unwrap());

    // Closed lands just before the registry entry is dropped
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while !engine.instance_ids().is_empty() {
        assert!(std::time::Instant::now() < deadline, "registry did not drain");
        thread::sleep(Duration::from_millis(5));
    }
}
