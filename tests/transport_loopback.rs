use compmon::{DeliveryOutcome, TelemetryTransport, TransportConfig};
use std::net::{Ipv4Addr, UdpSocket};
use std::thread;
use std::time::Duration;

/// A receiver on loopback that answers one datagram with `reply`.
fn responder(reply: &'static str) -> (u16, thread::JoinHandle<Vec<u8>>) {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let port = socket.local_addr().unwrap().port();
    let worker = thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let (len, from) = socket.recv_from(&mut buf).unwrap();
        socket.send_to(reply.as_bytes(), from).unwrap();
        buf[..len].to_vec()
    });
    (port, worker)
}

fn transport(port: u16) -> TelemetryTransport {
    let mut transport: TelemetryTransport = TelemetryTransport::new(TransportConfig {
        max_retries: 2,
        receive_timeout: Duration::from_secs(1),
    });
    transport.initialize(port).unwrap();
    transport.set_destination(Ipv4Addr::LOCALHOST);
    transport
}

#[test]
fn acknowledged_datagram_is_sent() {
    let (port, worker) = responder(r#"{"code": 200}"#);
    let mut transport = transport(port);

    let outcome = transport.send(br#"{"CPU": {}}"#);
    assert_eq!(outcome, DeliveryOutcome::Sent);
    assert_eq!(worker.join().unwrap(), br#"{"CPU": {}}"#.to_vec());
}

#[test]
fn rejection_is_reported_with_message() {
    let (port, worker) = responder(r#"{"code": 503, "error": "busy"}"#);
    let mut transport = transport(port);

    let outcome = transport.send(b"{}");
    assert_eq!(outcome.to_string(), "Device receive error (busy)");
    worker.join().unwrap();
}

#[test]
fn silent_receiver_times_out() {
    let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = silent.local_addr().unwrap().port();
    let mut transport: TelemetryTransport = TelemetryTransport::new(TransportConfig {
        max_retries: 1,
        receive_timeout: Duration::from_secs(1),
    });
    transport.initialize(port).unwrap();
    transport.set_destination(Ipv4Addr::LOCALHOST);

    assert_eq!(transport.send(b"{}"), DeliveryOutcome::Timeout);
}

#[test]
fn uninitialized_transport_is_not_started() {
    let mut transport: TelemetryTransport = TelemetryTransport::new(TransportConfig::default());
    assert_eq!(transport.send(b"{}"), DeliveryOutcome::ServiceNotStarted);
}
