use std::{
    io,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace, warn};

use super::RemoteAddr;

/// Minimum size of the socket send buffer.
///
/// Some platforms (macOS, notably) default to a send buffer that is half the size of the largest payload we'll send.
const MIN_SEND_BUFFER_SIZE: usize = 32 * 1024;

/// What to do with a connection after a failed send.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Disposition {
    /// The failure is specific to this payload: keep the connection.
    Keep,

    /// The connection is unusable: discard it and reconnect on the next send.
    Reset,
}

/// Classifies a send error.
pub(crate) fn classify(error: &io::Error) -> Disposition {
    match error.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Disposition::Keep,
        _ => match error.raw_os_error() {
            Some(code) if is_transient_os_error(code) => Disposition::Keep,
            _ => Disposition::Reset,
        },
    }
}

#[cfg(unix)]
fn is_transient_os_error(code: i32) -> bool {
    code == libc::EAGAIN || code == libc::ENOBUFS || code == libc::EMSGSIZE
}

#[cfg(not(unix))]
fn is_transient_os_error(code: i32) -> bool {
    // WSAEWOULDBLOCK, WSAEMSGSIZE, WSAENOBUFS
    matches!(code, 10035 | 10040 | 10055)
}

fn connect(remote_addr: &RemoteAddr) -> io::Result<Socket> {
    match remote_addr {
        RemoteAddr::Udp { host, port } => {
            let target = RemoteAddr::resolve(host, *port)?;
            let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))?;
            prepare_socket(&socket)?;
            socket.connect(&SockAddr::from(target))?;
            Ok(socket)
        }

        #[cfg(unix)]
        RemoteAddr::Unixgram(path) => {
            let socket = Socket::new(Domain::UNIX, Type::DGRAM, None)?;
            prepare_socket(&socket)?;
            socket.connect(&SockAddr::unix(path)?)?;
            Ok(socket)
        }
    }
}

fn prepare_socket(socket: &Socket) -> io::Result<()> {
    socket.set_nonblocking(true)?;
    ensure_min_send_buffer_size(socket);
    Ok(())
}

#[cfg(unix)]
fn ensure_min_send_buffer_size(socket: &Socket) {
    match socket.send_buffer_size() {
        Ok(size) if size <= MIN_SEND_BUFFER_SIZE => {
            if let Err(e) = socket.set_send_buffer_size(MIN_SEND_BUFFER_SIZE) {
                debug!(error = %e, "Failed to increase socket send buffer size.");
            } else {
                debug!(size = MIN_SEND_BUFFER_SIZE, "Increased socket send buffer size.");
            }
        }
        Ok(_) => {}
        Err(e) => debug!(error = %e, "Failed to query socket send buffer size."),
    }
}

#[cfg(not(unix))]
fn ensure_min_send_buffer_size(_socket: &Socket) {}

enum ConnectionState {
    // No socket has been created yet, or it was closed.
    Absent,

    // Connected and ready to send.
    Live(Socket),

    // The last send hit an error that makes the socket unusable. It will be replaced, not repaired.
    Poisoned,
}

/// A lazily-created connection to a single destination.
///
/// The connection lock is held for the entire send, which means that creating the socket, replacing it after an
/// error, and the send itself are all serialized for a given destination.
pub(crate) struct Connection {
    remote_addr: RemoteAddr,
    state: Mutex<ConnectionState>,
    connects: AtomicUsize,
}

impl Connection {
    pub fn new(remote_addr: RemoteAddr) -> Self {
        Self { remote_addr, state: Mutex::new(ConnectionState::Absent), connects: AtomicUsize::new(0) }
    }

    pub fn remote_addr(&self) -> &RemoteAddr {
        &self.remote_addr
    }

    /// Sends a payload, creating the underlying socket first if necessary.
    ///
    /// Errors are logged and returned along with how they were classified, but never require any action from the
    /// caller: the connection has already been kept or discarded accordingly.
    pub fn send(&self, payload: &[u8]) -> Result<usize, Disposition> {
        let mut state = self.state.lock();

        if matches!(*state, ConnectionState::Poisoned) {
            trace!(transport = self.remote_addr.transport_id(), "Replacing poisoned connection.");
            *state = ConnectionState::Absent;
        }

        if matches!(*state, ConnectionState::Absent) {
            match connect(&self.remote_addr) {
                Ok(socket) => {
                    self.connects.fetch_add(1, Ordering::Relaxed);
                    *state = ConnectionState::Live(socket);
                }
                Err(e) => {
                    warn!(error = %e, remote_addr = ?self.remote_addr, "Failed to connect, dropping the packet.");
                    return Err(Disposition::Reset);
                }
            }
        }

        let ConnectionState::Live(socket) = &*state else {
            return Err(Disposition::Reset);
        };

        match socket.send(payload) {
            Ok(sent) => {
                trace!(payload_len = payload.len(), "Sent payload.");
                Ok(sent)
            }
            Err(e) => {
                let disposition = classify(&e);
                match disposition {
                    Disposition::Keep => {
                        debug!(error = %e, payload_len = payload.len(), "Failed to send payload, dropping the packet.");
                    }
                    Disposition::Reset => {
                        warn!(error = %e, "Error submitting packet, dropping the packet and closing the socket.");
                        *state = ConnectionState::Poisoned;
                    }
                }
                Err(disposition)
            }
        }
    }

    /// Closes the connection, if open.
    pub fn close(&self) {
        *self.state.lock() = ConnectionState::Absent;
    }

    /// Returns the number of sockets created over the lifetime of this connection.
    #[cfg(test)]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn is_live(&self) -> bool {
        matches!(*self.state.lock(), ConnectionState::Live(_))
    }
}

#[cfg(test)]
mod tests {
    use std::{net::UdpSocket, time::Duration};

    use super::*;

    fn udp_receiver() -> (UdpSocket, RemoteAddr) {
        let receiver = UdpSocket::bind("127.0.0.1:0").expect("failed to bind receiver");
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = receiver.local_addr().unwrap().port();
        (receiver, RemoteAddr::Udp { host: "127.0.0.1".to_string(), port })
    }

    #[cfg(unix)]
    #[test]
    fn classification() {
        let cases = [
            (io::Error::from(io::ErrorKind::WouldBlock), Disposition::Keep),
            (io::Error::from(io::ErrorKind::TimedOut), Disposition::Keep),
            (io::Error::from_raw_os_error(libc::ENOBUFS), Disposition::Keep),
            (io::Error::from_raw_os_error(libc::EMSGSIZE), Disposition::Keep),
            (io::Error::from_raw_os_error(libc::EAGAIN), Disposition::Keep),
            (io::Error::from_raw_os_error(libc::ECONNREFUSED), Disposition::Reset),
            (io::Error::from_raw_os_error(libc::EBADF), Disposition::Reset),
            (io::Error::new(io::ErrorKind::Other, "boom"), Disposition::Reset),
        ];

        for (error, expected) in cases {
            assert_eq!(classify(&error), expected, "error: {error}");
        }
    }

    #[test]
    fn connects_lazily_and_reuses_socket() {
        let (receiver, remote_addr) = udp_receiver();
        let conn = Connection::new(remote_addr);
        assert_eq!(conn.connects(), 0);
        assert!(!conn.is_live());

        assert_eq!(conn.send(b"a:1|c\n"), Ok(6));
        assert_eq!(conn.send(b"b:2|c\n"), Ok(6));
        assert_eq!(conn.connects(), 1);

        let mut buf = [0; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"a:1|c\n");
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"b:2|c\n");
    }

    #[test]
    fn oversized_payload_keeps_connection() {
        let (receiver, remote_addr) = udp_receiver();
        let conn = Connection::new(remote_addr);

        assert!(conn.send(b"a:1|c\n").is_ok());
        assert_eq!(conn.send(&vec![b'x'; 70_000]), Err(Disposition::Keep));
        assert!(conn.is_live());

        assert!(conn.send(b"b:1|c\n").is_ok());
        assert_eq!(conn.connects(), 1);

        let mut buf = [0; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"a:1|c\n");
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"b:1|c\n");
    }

    #[test]
    fn resolution_failure_drops_packet() {
        let conn = Connection::new(RemoteAddr::Udp { host: "does-not-exist.invalid".to_string(), port: 8125 });
        assert_eq!(conn.send(b"a:1|c\n"), Err(Disposition::Reset));
        assert!(!conn.is_live());
        assert_eq!(conn.connects(), 0);
    }

    #[test]
    fn close_forces_reconnect() {
        let (_receiver, remote_addr) = udp_receiver();
        let conn = Connection::new(remote_addr);

        assert!(conn.send(b"a:1|c\n").is_ok());
        conn.close();
        assert!(!conn.is_live());

        assert!(conn.send(b"a:1|c\n").is_ok());
        assert_eq!(conn.connects(), 2);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unixgram_fatal_error_poisons_connection() {
        use std::os::unix::net::UnixDatagram;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsd.socket");

        let receiver = UnixDatagram::bind(&path).unwrap();
        let conn = Connection::new(RemoteAddr::Unixgram(path.clone()));
        assert!(conn.send(b"a:1|c\n").is_ok());

        // Once the receiver goes away, the connected socket is unusable.
        drop(receiver);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(conn.send(b"a:1|c\n"), Err(Disposition::Reset));
        assert!(!conn.is_live());

        // With nobody listening, reconnecting fails and the packet is dropped.
        assert_eq!(conn.send(b"a:1|c\n"), Err(Disposition::Reset));
        assert_eq!(conn.connects(), 1);

        // A new receiver gets a fresh connection.
        let receiver = UnixDatagram::bind(&path).unwrap();
        assert!(conn.send(b"b:1|c\n").is_ok());
        assert_eq!(conn.connects(), 2);

        let mut buf = [0; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"b:1|c\n");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unixgram_full_queue_keeps_connection() {
        use std::os::unix::net::UnixDatagram;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsd.socket");
        let _receiver = UnixDatagram::bind(&path).unwrap();

        let conn = Connection::new(RemoteAddr::Unixgram(path));
        let payload = vec![b'x'; 4096];

        // Nobody reads from the receiver, so the queue eventually fills up and sends start failing.
        let mut dropped = 0;
        for _ in 0..10_000 {
            match conn.send(&payload) {
                Ok(_) => {}
                Err(disposition) => {
                    assert_eq!(disposition, Disposition::Keep);
                    dropped += 1;
                }
            }
        }

        assert!(dropped > 0);
        assert!(conn.is_live());
        assert_eq!(conn.connects(), 1);
    }
}
