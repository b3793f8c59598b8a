//! Datagram delivery: send one snapshot, wait for an acknowledgement.

use crate::error::TransportError;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 32123;

/// Status code of an accepted reply.
pub const SUCCESS_CODE: i64 = 200;

const RECEIVE_BUFFER: usize = 1024;

/// The socket operations the delivery protocol needs.
pub trait DatagramSocket: Send {
    fn send_to(&mut self, payload: &[u8], target: SocketAddrV4) -> io::Result<usize>;
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&mut self, payload: &[u8], target: SocketAddrV4) -> io::Result<usize> {
        UdpSocket::send_to(self, payload, target)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Receive attempts after each send.
    pub max_retries: u32,
    /// Bound on each receive attempt.
    pub receive_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            receive_timeout: Duration::from_secs(2),
        }
    }
}

/// Result of one `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    DeviceError { code: i64, message: String },
    Timeout,
    ServiceNotStarted,
    MalformedResponse,
    /// The local socket refused the datagram.
    SendFailed(String),
}

impl DeliveryOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, DeliveryOutcome::Sent)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "Sent successfully."),
            Self::DeviceError { message, .. } => write!(f, "Device receive error ({})", message),
            Self::Timeout => write!(f, "Send timeout."),
            Self::ServiceNotStarted => write!(f, "Service not started."),
            Self::MalformedResponse => write!(f, "Invalid payload data"),
            Self::SendFailed(err) => write!(f, "Send failed ({})", err),
        }
    }
}

/// Acknowledgement sent back by the receiving device.
#[derive(Debug, Deserialize)]
struct Reply {
    code: i64,
    #[serde(default)]
    error: Option<Value>,
}

fn classify_reply(bytes: &[u8]) -> DeliveryOutcome {
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(e) => {
            log::debug!("undecodable reply: {}", e);
            return DeliveryOutcome::MalformedResponse;
        }
    };
    if !value.is_object() {
        return DeliveryOutcome::MalformedResponse;
    }
    let reply: Reply = match serde_json::from_value(value) {
        Ok(reply) => reply,
        Err(e) => {
            log::debug!("reply has unexpected shape: {}", e);
            return DeliveryOutcome::MalformedResponse;
        }
    };

    if reply.code == SUCCESS_CODE {
        return DeliveryOutcome::Sent;
    }
    let message = match reply.error {
        Some(Value::String(message)) => message,
        Some(Value::Null) | None => "Unknown error".to_string(),
        Some(other) => other.to_string(),
    };
    DeliveryOutcome::DeviceError {
        code: reply.code,
        message,
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Owns the datagram socket and the destination; one per collector.
pub struct TelemetryTransport<S = UdpSocket> {
    socket: Option<S>,
    destination: Ipv4Addr,
    port: u16,
    config: TransportConfig,
}

impl<S: DatagramSocket> TelemetryTransport<S> {
    /// Not started: `send` reports `ServiceNotStarted` until a socket exists.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            socket: None,
            destination: Ipv4Addr::BROADCAST,
            port: DEFAULT_PORT,
            config,
        }
    }

    /// Start with an already-open socket.
    pub fn attach(&mut self, socket: S, port: u16) {
        self.socket = Some(socket);
        self.port = port;
    }

    pub fn set_destination(&mut self, destination: Ipv4Addr) {
        self.destination = destination;
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.destination
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_started(&self) -> bool {
        self.socket.is_some()
    }

    /// Send `payload` once, then wait for a reply from the destination.
    ///
    /// Every receive attempt, including one that yields a datagram from
    /// another host, uses up one of `max_retries`. The first reply from the
    /// destination decides the outcome.
    pub fn send(&mut self, payload: &[u8]) -> DeliveryOutcome {
        let Some(socket) = self.socket.as_mut() else {
            return DeliveryOutcome::ServiceNotStarted;
        };

        let target = SocketAddrV4::new(self.destination, self.port);
        if let Err(e) = socket.send_to(payload, target) {
            log::debug!("send to {} failed: {}", target, e);
            return DeliveryOutcome::SendFailed(e.to_string());
        }

        let mut buf = [0u8; RECEIVE_BUFFER];
        for attempt in 1..=self.config.max_retries {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if from.ip() != IpAddr::V4(self.destination) {
                        log::debug!("ignoring reply from {} (attempt {})", from, attempt);
                        continue;
                    }
                    log::trace!("reply from {}: {}", from, String::from_utf8_lossy(&buf[..len]));
                    return classify_reply(&buf[..len]);
                }
                Err(e) if is_timeout(&e) => {
                    log::debug!("no reply within {:?} (attempt {})", self.config.receive_timeout, attempt);
                }
                Err(e) => {
                    log::debug!("receive failed (attempt {}): {}", attempt, e);
                }
            }
        }
        DeliveryOutcome::Timeout
    }
}

impl TelemetryTransport<UdpSocket> {
    /// Open the socket: address reuse, broadcast, fixed receive timeout.
    pub fn initialize(&mut self, port: u16) -> Result<(), TransportError> {
        let socket = reusable_socket()?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(self.config.receive_timeout))?;
        log::debug!("telemetry socket bound to {}", socket.local_addr()?);
        self.attach(socket, port);
        Ok(())
    }
}

/// UDP socket with `SO_REUSEADDR` set before binding to an ephemeral port.
#[cfg(unix)]
fn reusable_socket() -> io::Result<UdpSocket> {
    use std::mem;
    use std::os::unix::io::FromRawFd;

    // Close-on-exec, like every socket std creates.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let kind = libc::SOCK_DGRAM | libc::SOCK_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let kind = libc::SOCK_DGRAM;

    let fd = unsafe { libc::socket(libc::AF_INET, kind, libc::IPPROTO_UDP) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Owns the descriptor from here on, so early returns close it.
    let socket = unsafe { UdpSocket::from_raw_fd(fd) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    let enable: libc::c_int = 1;
    let result = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &enable as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    {
        addr.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
    }
    let result = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(socket)
}

#[cfg(not(unix))]
fn reusable_socket() -> io::Result<UdpSocket> {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
}

/// This host's IPv4 address as reported in every payload.
///
/// Host name resolution first, then the address the OS would route
/// `destination` through, then loopback.
pub fn local_address(destination: Ipv4Addr) -> String {
    resolve_host_name()
        .or_else(|| routed_address(destination))
        .unwrap_or(Ipv4Addr::LOCALHOST)
        .to_string()
}

fn resolve_host_name() -> Option<Ipv4Addr> {
    let name = host_name()?;
    let found = (name.as_str(), 0)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) if !v4.ip().is_loopback() => Some(*v4.ip()),
            _ => None,
        });
    if found.is_none() {
        log::trace!("host name {} has no routable IPv4 address", name);
    }
    found
}

#[cfg(unix)]
fn host_name() -> Option<String> {
    let mut buf = [0u8; 256];
    let result = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if result != 0 {
        return None;
    }
    let name = std::ffi::CStr::from_bytes_until_nul(&buf).ok()?;
    let name = name.to_str().ok()?.trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(not(unix))]
fn host_name() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

fn routed_address(destination: Ipv4Addr) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.set_broadcast(true).ok()?;
    socket.connect((destination, DEFAULT_PORT)).ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(v4) if !v4.ip().is_unspecified() => Some(*v4.ip()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    enum Step {
        Reply(&'static str, Ipv4Addr),
        Silence,
        Fail(io::ErrorKind),
    }

    /// Plays back scripted receive results and counts socket calls.
    #[derive(Default)]
    struct ScriptedSocket {
        steps: VecDeque<Step>,
        sent: Vec<(Vec<u8>, SocketAddrV4)>,
        receives: usize,
        refuse_send: bool,
    }

    impl ScriptedSocket {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                ..Self::default()
            }
        }
    }

    impl DatagramSocket for ScriptedSocket {
        fn send_to(&mut self, payload: &[u8], target: SocketAddrV4) -> io::Result<usize> {
            if self.refuse_send {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "broadcast not allowed"));
            }
            self.sent.push((payload.to_vec(), target));
            Ok(payload.len())
        }

        fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.receives += 1;
            match self.steps.pop_front().unwrap_or(Step::Silence) {
                Step::Reply(body, from) => {
                    buf[..body.len()].copy_from_slice(body.as_bytes());
                    Ok((body.len(), SocketAddr::V4(SocketAddrV4::new(from, 40000))))
                }
                Step::Silence => Err(io::Error::new(io::ErrorKind::WouldBlock, "timed out")),
                Step::Fail(kind) => Err(io::Error::new(kind, "receive failed")),
            }
        }
    }

    const DEVICE: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);
    const STRANGER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 99);

    fn started(steps: Vec<Step>) -> TelemetryTransport<ScriptedSocket> {
        let mut transport = TelemetryTransport::new(TransportConfig::default());
        transport.attach(ScriptedSocket::new(steps), DEFAULT_PORT);
        transport.set_destination(DEVICE);
        transport
    }

    fn receives(transport: &TelemetryTransport<ScriptedSocket>) -> usize {
        transport.socket.as_ref().map(|s| s.receives).unwrap_or_default()
    }

    #[test]
    fn not_started_touches_nothing() {
        let mut transport: TelemetryTransport<ScriptedSocket> =
            TelemetryTransport::new(TransportConfig::default());
        assert_eq!(transport.send(b"{}"), DeliveryOutcome::ServiceNotStarted);
        assert!(!transport.is_started());
    }

    #[cfg(unix)]
    #[test]
    fn telemetry_socket_is_close_on_exec() {
        use std::os::unix::io::AsRawFd;

        let socket = reusable_socket().unwrap();
        let flags = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_GETFD) };
        assert!(flags >= 0);
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn default_destination_is_broadcast() {
        let transport: TelemetryTransport<ScriptedSocket> =
            TelemetryTransport::new(TransportConfig::default());
        assert_eq!(transport.destination(), Ipv4Addr::BROADCAST);
        assert_eq!(transport.port(), 32123);
    }

    #[test]
    fn ack_on_second_attempt_is_sent() {
        let mut transport = started(vec![Step::Silence, Step::Reply(r#"{"code": 200}"#, DEVICE)]);
        assert_eq!(transport.send(b"payload"), DeliveryOutcome::Sent);
        assert_eq!(receives(&transport), 2);

        let socket = transport.socket.as_ref().unwrap();
        assert_eq!(socket.sent.len(), 1);
        assert_eq!(socket.sent[0].1, SocketAddrV4::new(DEVICE, DEFAULT_PORT));
    }

    #[test]
    fn silence_times_out_after_max_retries() {
        let mut transport = started(vec![]);
        assert_eq!(transport.send(b"payload"), DeliveryOutcome::Timeout);
        assert_eq!(receives(&transport), 2);

        let mut transport = started(vec![]);
        transport.config.max_retries = 5;
        assert_eq!(transport.send(b"payload"), DeliveryOutcome::Timeout);
        assert_eq!(receives(&transport), 5);
    }

    #[test]
    fn reply_from_other_host_is_ignored() {
        let mut transport = started(vec![
            Step::Reply(r#"{"code": 200}"#, STRANGER),
            Step::Reply(r#"{"code": 200}"#, DEVICE),
        ]);
        assert_eq!(transport.send(b"payload"), DeliveryOutcome::Sent);
        assert_eq!(receives(&transport), 2);

        let mut transport = started(vec![
            Step::Reply(r#"{"code": 200}"#, STRANGER),
            Step::Reply(r#"{"code": 200}"#, STRANGER),
        ]);
        assert_eq!(transport.send(b"payload"), DeliveryOutcome::Timeout);
    }

    #[test]
    fn rejection_carries_device_message() {
        let mut transport = started(vec![Step::Reply(r#"{"code": 503, "error": "busy"}"#, DEVICE)]);
        let outcome = transport.send(b"payload");
        assert_eq!(
            outcome,
            DeliveryOutcome::DeviceError {
                code: 503,
                message: "busy".into()
            }
        );
        assert_eq!(outcome.to_string(), "Device receive error (busy)");
        assert_eq!(receives(&transport), 1);
    }

    #[test]
    fn rejection_without_message_is_unknown() {
        let mut transport = started(vec![Step::Reply(r#"{"code": 400}"#, DEVICE)]);
        assert_eq!(transport.send(b"p").to_string(), "Device receive error (Unknown error)");
    }

    #[test]
    fn malformed_reply_stops_retrying() {
        for body in ["not json", "[200]", r#"{"error": "x"}"#, r#"{"code": "200"}"#] {
            let mut transport = started(vec![
                Step::Reply(body, DEVICE),
                Step::Reply(r#"{"code": 200}"#, DEVICE),
            ]);
            assert_eq!(transport.send(b"p"), DeliveryOutcome::MalformedResponse, "{}", body);
            assert_eq!(receives(&transport), 1);
        }
    }

    #[test]
    fn receive_error_uses_a_retry() {
        let mut transport = started(vec![
            Step::Fail(io::ErrorKind::ConnectionRefused),
            Step::Reply(r#"{"code": 200}"#, DEVICE),
        ]);
        assert_eq!(transport.send(b"p"), DeliveryOutcome::Sent);
        assert_eq!(receives(&transport), 2);
    }

    #[test]
    fn local_send_failure_is_reported() {
        let mut transport = started(vec![]);
        if let Some(socket) = transport.socket.as_mut() {
            socket.refuse_send = true;
        }
        let outcome = transport.send(b"p");
        assert!(matches!(outcome, DeliveryOutcome::SendFailed(_)));
        assert_eq!(outcome.to_string(), "Send failed (broadcast not allowed)");
        assert_eq!(receives(&transport), 0);
    }

    #[test]
    fn status_strings() {
        assert_eq!(DeliveryOutcome::Sent.to_string(), "Sent successfully.");
        assert_eq!(DeliveryOutcome::Timeout.to_string(), "Send timeout.");
        assert_eq!(DeliveryOutcome::ServiceNotStarted.to_string(), "Service not started.");
        assert_eq!(DeliveryOutcome::MalformedResponse.to_string(), "Invalid payload data");
    }

    #[test]
    fn local_address_is_ipv4() {
        let addr = local_address(Ipv4Addr::LOCALHOST);
        assert!(addr.parse::<Ipv4Addr>().is_ok(), "{}", addr);
    }
}
