use std::{
    io,
    net::{SocketAddr, ToSocketAddrs as _},
};

#[cfg(unix)]
use std::path::PathBuf;

mod connection;
pub(crate) use self::connection::Connection;

/// Optimal payload length for UDP, sized to fit within a typical Ethernet MTU.
const UDP_OPTIMAL_PAYLOAD_LENGTH: usize = 1432;

/// Optimal payload length for Unix domain sockets.
const UDS_OPTIMAL_PAYLOAD_LENGTH: usize = 8192;

/// Where packets are sent to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteAddr {
    /// A DogStatsD server listening on UDP.
    ///
    /// The host is resolved every time a new connection is created.
    Udp {
        /// Hostname or IP address.
        host: String,

        /// Port.
        port: u16,
    },

    /// A DogStatsD server listening on a Unix domain socket in `SOCK_DGRAM` mode.
    #[cfg(unix)]
    Unixgram(PathBuf),
}

impl RemoteAddr {
    /// Returns the transport ID for the remote address.
    ///
    /// This is a simple acronym related to the transport that will be used for the remote address, such as `udp` for
    /// UDP, and so on.
    pub const fn transport_id(&self) -> &'static str {
        match self {
            RemoteAddr::Udp { .. } => "udp",
            #[cfg(unix)]
            RemoteAddr::Unixgram(_) => "uds",
        }
    }

    /// Returns the default maximum payload length for the transport.
    pub const fn default_max_payload_len(&self) -> usize {
        match self {
            RemoteAddr::Udp { .. } => UDP_OPTIMAL_PAYLOAD_LENGTH,
            #[cfg(unix)]
            RemoteAddr::Unixgram(_) => UDS_OPTIMAL_PAYLOAD_LENGTH,
        }
    }

    /// Resolves a UDP remote address to a socket address, preferring IPv4 when both families are available.
    fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
        (host, port)
            .to_socket_addrs()?
            .min_by_key(SocketAddr::is_ipv6)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no addresses found for '{host}'")))
    }
}

impl Default for RemoteAddr {
    fn default() -> Self {
        RemoteAddr::Udp { host: "localhost".to_string(), port: 8125 }
    }
}

impl<'a> TryFrom<&'a str> for RemoteAddr {
    type Error = String;

    fn try_from(addr: &'a str) -> Result<Self, Self::Error> {
        if let Some((scheme, path)) = addr.split_once("://") {
            return parse_socket_path(scheme, path);
        }

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in '{addr}' (expected '<host>:<port>')"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("missing host in '{addr}'"));
        }
        let port = port.parse::<u16>().map_err(|e| format!("invalid port in '{addr}': {e}"))?;

        Ok(RemoteAddr::Udp { host: host.to_string(), port })
    }
}

#[cfg(unix)]
fn parse_socket_path(scheme: &str, path: &str) -> Result<RemoteAddr, String> {
    match scheme {
        "unix" | "unixgram" if !path.is_empty() => Ok(RemoteAddr::Unixgram(PathBuf::from(path))),
        "unix" | "unixgram" => Err("socket path cannot be empty".to_string()),
        _ => Err(format!("invalid scheme '{scheme}' (expected 'unix' or 'unixgram')")),
    }
}

#[cfg(not(unix))]
fn parse_socket_path(scheme: &str, _path: &str) -> Result<RemoteAddr, String> {
    Err(format!("unsupported scheme '{scheme}' (Unix domain sockets are not available on this platform)"))
}

/// Which destination a payload should be sent to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Destination {
    Main,
    Telemetry,
}

/// Outbound datagram transport.
///
/// Holds the connection to the main destination, and optionally a dedicated connection for telemetry. When no
/// telemetry destination is configured, telemetry payloads go out over the main connection.
pub(crate) struct Transport {
    main: Connection,
    telemetry: Option<Connection>,
}

impl Transport {
    pub fn new(remote_addr: RemoteAddr, telemetry_addr: Option<RemoteAddr>) -> Self {
        Self { main: Connection::new(remote_addr), telemetry: telemetry_addr.map(Connection::new) }
    }

    pub fn remote_addr(&self) -> &RemoteAddr {
        self.main.remote_addr()
    }

    fn connection(&self, destination: Destination) -> &Connection {
        match (destination, self.telemetry.as_ref()) {
            (Destination::Telemetry, Some(telemetry)) => telemetry,
            _ => &self.main,
        }
    }

    /// Sends a payload to the given destination.
    ///
    /// Returns `true` if the payload was handed off to the operating system, or `false` if it was dropped.
    pub fn send(&self, payload: &[u8], destination: Destination) -> bool {
        self.connection(destination).send(payload).is_ok()
    }

    /// Closes all open connections.
    ///
    /// Connections are recreated lazily on the next send.
    pub fn close(&self) {
        self.main.close();
        if let Some(telemetry) = self.telemetry.as_ref() {
            telemetry.close();
        }
    }

    #[cfg(test)]
    pub fn main_connection(&self) -> &Connection {
        &self.main
    }
}

#[cfg(test)]
mod tests {
    use super::RemoteAddr;

    #[test]
    fn parse_remote_addr() {
        let cases = [
            ("localhost:8125", Ok(RemoteAddr::Udp { host: "localhost".to_string(), port: 8125 })),
            ("127.0.0.1:9125", Ok(RemoteAddr::Udp { host: "127.0.0.1".to_string(), port: 9125 })),
            ("[::1]:8125", Ok(RemoteAddr::Udp { host: "::1".to_string(), port: 8125 })),
        ];

        for (input, expected) in cases {
            assert_eq!(RemoteAddr::try_from(input), expected, "input: {input}");
        }

        for input in ["localhost", ":8125", "localhost:notaport", "localhost:70000"] {
            assert!(RemoteAddr::try_from(input).is_err(), "input: {input}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn parse_unix_remote_addr() {
        let expected = RemoteAddr::Unixgram("/var/run/datadog/dsd.socket".into());
        assert_eq!(RemoteAddr::try_from("unixgram:///var/run/datadog/dsd.socket"), Ok(expected.clone()));
        assert_eq!(RemoteAddr::try_from("unix:///var/run/datadog/dsd.socket"), Ok(expected));

        assert!(RemoteAddr::try_from("unixgram://").is_err());
        assert!(RemoteAddr::try_from("tcp://localhost:8125").is_err());
    }

    #[test]
    fn transport_defaults() {
        let udp = RemoteAddr::default();
        assert_eq!(udp.transport_id(), "udp");
        assert_eq!(udp.default_max_payload_len(), 1432);

        #[cfg(unix)]
        {
            let uds = RemoteAddr::Unixgram("/tmp/dsd.socket".into());
            assert_eq!(uds.transport_id(), "uds");
            assert_eq!(uds.default_max_payload_len(), 8192);
        }
    }
}
