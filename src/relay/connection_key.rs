use std::fmt::{Debug, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use crate::message::wire_message::{Protocol, WireMessage};

/// The routing tuple that identifies a connection. A UDP socket serves every remote endpoint, so
///  for UDP the remote part is always `0.0.0.0:0`.
///
/// The string form is what the UI registers its notification handlers for:
///  `tcp::<localPort>::<remoteIP>:<remotePort>`, and `udp::<localPort>::0:0` for UDP.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub protocol: Protocol,
    pub local_port: u16,
    pub remote: SocketAddrV4,
}

impl ConnectionKey {
    pub const NO_REMOTE: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

    pub fn tcp(local_port: u16, remote: SocketAddrV4) -> ConnectionKey {
        ConnectionKey {
            protocol: Protocol::Tcp,
            local_port,
            remote,
        }
    }

    pub fn udp(local_port: u16) -> ConnectionKey {
        ConnectionKey {
            protocol: Protocol::Udp,
            local_port,
            remote: Self::NO_REMOTE,
        }
    }

    pub fn new(protocol: Protocol, local_port: u16, remote: SocketAddrV4) -> ConnectionKey {
        match protocol {
            Protocol::Tcp => Self::tcp(local_port, remote),
            Protocol::Udp => Self::udp(local_port),
        }
    }

    /// The connection an outbound message is routed through: its source port is the local port,
    ///  its destination the remote endpoint
    pub fn for_outbound(msg: &WireMessage) -> ConnectionKey {
        Self::new(msg.protocol(), msg.src_port(), msg.dst())
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == Protocol::Tcp
    }
}

impl Display for ConnectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.protocol {
            Protocol::Tcp => write!(f, "{}::{}::{}", self.protocol, self.local_port, self.remote),
            Protocol::Udp => write!(f, "{}::{}::0:0", self.protocol, self.local_port),
        }
    }
}

impl Debug for ConnectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for ConnectionKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split("::");
        let (protocol, local_port, remote) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(p), Some(l), Some(r), None) => (p, l, r),
            _ => anyhow::bail!("connection key must have the form <proto>::<localPort>::<remoteIP>:<remotePort>, was {:?}", s),
        };

        let protocol = match protocol {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => anyhow::bail!("unknown protocol {:?}", other),
        };
        let remote = match remote {
            "0:0" => Self::NO_REMOTE,
            r => r.parse()?,
        };

        Ok(ConnectionKey::new(protocol, local_port.parse()?, remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ConnectionKey::tcp(4000, "10.0.0.1:80".parse().unwrap()), "tcp::4000::10.0.0.1:80")]
    #[case(ConnectionKey::tcp(0, "127.0.0.1:9".parse().unwrap()), "tcp::0::127.0.0.1:9")]
    #[case(ConnectionKey::udp(5353), "udp::5353::0:0")]
    fn test_display_from_str(#[case] key: ConnectionKey, #[case] expected: &str) {
        assert_eq!(key.to_string(), expected);
        assert_eq!(ConnectionKey::from_str(expected).unwrap(), key);
    }

    #[rstest]
    #[case("")]
    #[case("tcp::1")]
    #[case("TCP::1::1.2.3.4:5")]
    #[case("sctp::1::1.2.3.4:5")]
    #[case("tcp::x::1.2.3.4:5")]
    #[case("tcp::1::1.2.3.4:5::extra")]
    #[case("tcp::1::::1:5")]
    fn test_from_str_invalid(#[case] s: &str) {
        assert!(ConnectionKey::from_str(s).is_err());
    }

    #[test]
    fn test_udp_remote_is_not_part_of_the_key() {
        assert_eq!(ConnectionKey::from_str("udp::53::0.0.0.0:0").unwrap(), ConnectionKey::udp(53));
        assert_eq!(ConnectionKey::from_str("udp::53::1.2.3.4:5").unwrap(), ConnectionKey::udp(53));
    }

    #[test]
    fn test_udp_ignores_remote() {
        let a = ConnectionKey::new(Protocol::Udp, 7, "1.2.3.4:5".parse().unwrap());
        let b = ConnectionKey::new(Protocol::Udp, 7, "6.7.8.9:10".parse().unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn test_for_outbound() {
        let msg = WireMessage::new(Protocol::Tcp, "127.0.0.1:0".parse().unwrap(), "10.0.0.1:443".parse().unwrap(), b"x").unwrap();
        assert_eq!(ConnectionKey::for_outbound(&msg), ConnectionKey::tcp(0, "10.0.0.1:443".parse().unwrap()));
    }
}
