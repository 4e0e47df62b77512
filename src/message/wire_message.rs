use std::fmt::{Debug, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// The transport protocol a message is routed over, encoded in bit 7 of the flag byte
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    pub const TCP_FLAG: u8 = 0x80;

    /// The other seven bits are reserved: a flag byte is either `0x80` (TCP) or `0x00` (UDP),
    ///  anything else is rejected rather than silently ignored.
    pub fn from_flags(flags: u8) -> Result<Protocol, WireError> {
        match flags {
            Self::TCP_FLAG => Ok(Protocol::Tcp),
            0 => Ok(Protocol::Udp),
            other => Err(WireError::ReservedFlags(other)),
        }
    }

    pub fn flags(self) -> u8 {
        match self {
            Protocol::Tcp => Self::TCP_FLAG,
            Protocol::Udp => 0,
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A self-describing message as it is exchanged with the UI, all numbers big endian:
///
/// ```ascii
///  0: source IPv4 (u32)
///  4: source port (u16)
///  6: destination IPv4 (u32)
/// 10: destination port (u16)
/// 12: total message size including this header (u32)
/// 16: flags (u8) - bit 7 set for TCP, all other bits reserved
/// 17: payload
/// ```
///
/// Only the part starting at offset 12 (the *transport view*) goes over a socket: the socket
///  itself identifies the endpoints, and the receiving side stamps them back in.
#[derive(Clone, PartialEq, Eq)]
pub struct WireMessage {
    buf: BytesMut,
}

impl WireMessage {
    pub const HEADER_LEN: usize = 17;
    pub const ADDRESS_LEN: usize = 12;
    pub const TRANSPORT_HEADER_LEN: usize = Self::HEADER_LEN - Self::ADDRESS_LEN;

    const OFFS_SRC_IP: usize = 0;
    const OFFS_SRC_PORT: usize = 4;
    const OFFS_DST_IP: usize = 6;
    const OFFS_DST_PORT: usize = 10;
    const OFFS_SIZE: usize = 12;
    const OFFS_FLAGS: usize = 16;

    /// Parse a message received from the UI. The size field must match the buffer exactly.
    pub fn parse(bytes: &[u8]) -> Result<WireMessage, WireError> {
        if bytes.len() < Self::HEADER_LEN {
            return Err(WireError::TooShort { len: bytes.len(), required: Self::HEADER_LEN });
        }

        let declared: usize = (&bytes[Self::OFFS_SIZE..]).get_u32().safe_cast();
        if declared != bytes.len() {
            return Err(WireError::SizeMismatch { declared, actual: bytes.len() });
        }
        Protocol::from_flags(bytes[Self::OFFS_FLAGS])?;

        Ok(WireMessage {
            buf: BytesMut::from(bytes),
        })
    }

    /// A zeroed message (UDP, all addresses 0.0.0.0:0) of the given total size
    pub fn with_size(total_size: u32) -> Result<WireMessage, WireError> {
        let len: usize = total_size.safe_cast();
        if len < Self::HEADER_LEN {
            return Err(WireError::TooShort { len, required: Self::HEADER_LEN });
        }

        let mut buf = BytesMut::zeroed(len);
        (&mut buf[Self::OFFS_SIZE..]).put_u32(total_size);
        Ok(WireMessage { buf })
    }

    pub fn new(protocol: Protocol, src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Result<WireMessage, WireError> {
        let total = Self::checked_total_size(payload.len())?;

        let mut buf = BytesMut::with_capacity(total);
        Self::put_endpoint(&mut buf, src);
        Self::put_endpoint(&mut buf, dst);
        buf.put_u32(total.prechecked_cast());
        buf.put_u8(protocol.flags());
        buf.put_slice(payload);
        Ok(WireMessage { buf })
    }

    /// Rebuild a full message from its transport view, as read from a socket. `src` and `dst`
    ///  come from the connection the bytes arrived on.
    pub fn from_transport_bytes(transport: &[u8], src: SocketAddrV4, dst: SocketAddrV4) -> Result<WireMessage, WireError> {
        if transport.len() < Self::TRANSPORT_HEADER_LEN {
            return Err(WireError::TooShort { len: transport.len(), required: Self::TRANSPORT_HEADER_LEN });
        }

        let declared: usize = (&transport[..]).get_u32().safe_cast();
        let actual = transport.len() + Self::ADDRESS_LEN;
        if declared != actual {
            return Err(WireError::SizeMismatch { declared, actual });
        }
        Protocol::from_flags(transport[Self::OFFS_FLAGS - Self::OFFS_SIZE])?;

        let mut buf = BytesMut::with_capacity(actual);
        Self::put_endpoint(&mut buf, src);
        Self::put_endpoint(&mut buf, dst);
        buf.put_slice(transport);
        Ok(WireMessage { buf })
    }

    fn checked_total_size(payload_len: usize) -> Result<usize, WireError> {
        match payload_len.checked_add(Self::HEADER_LEN) {
            Some(total) if total <= u32::MAX.safe_cast() => Ok(total),
            _ => Err(WireError::TooLarge(payload_len)),
        }
    }

    fn put_endpoint(buf: &mut BytesMut, endpoint: SocketAddrV4) {
        buf.put_u32(u32::from(*endpoint.ip()));
        buf.put_u16(endpoint.port());
    }

    fn u32_at(&self, offs: usize) -> u32 {
        (&self.buf[offs..]).get_u32()
    }

    fn u16_at(&self, offs: usize) -> u16 {
        (&self.buf[offs..]).get_u16()
    }

    pub fn src_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.u32_at(Self::OFFS_SRC_IP))
    }

    pub fn src_port(&self) -> u16 {
        self.u16_at(Self::OFFS_SRC_PORT)
    }

    pub fn dst_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.u32_at(Self::OFFS_DST_IP))
    }

    pub fn dst_port(&self) -> u16 {
        self.u16_at(Self::OFFS_DST_PORT)
    }

    pub fn src(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.src_ip(), self.src_port())
    }

    pub fn dst(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst_ip(), self.dst_port())
    }

    pub fn total_size(&self) -> u32 {
        self.u32_at(Self::OFFS_SIZE)
    }

    pub fn flags(&self) -> u8 {
        self.buf[Self::OFFS_FLAGS]
    }

    pub fn protocol(&self) -> Protocol {
        if self.flags() & Protocol::TCP_FLAG != 0 {
            Protocol::Tcp
        }
        else {
            Protocol::Udp
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[Self::HEADER_LEN..]
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len() - Self::HEADER_LEN
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// size, flags and payload - the part of the message that is written to a socket
    pub fn transport_view(&self) -> &[u8] {
        &self.buf[Self::ADDRESS_LEN..]
    }

    pub fn set_src_ip(&mut self, ip: Ipv4Addr) {
        (&mut self.buf[Self::OFFS_SRC_IP..]).put_u32(u32::from(ip));
    }

    pub fn set_src_port(&mut self, port: u16) {
        (&mut self.buf[Self::OFFS_SRC_PORT..]).put_u16(port);
    }

    pub fn set_dst_ip(&mut self, ip: Ipv4Addr) {
        (&mut self.buf[Self::OFFS_DST_IP..]).put_u32(u32::from(ip));
    }

    pub fn set_dst_port(&mut self, port: u16) {
        (&mut self.buf[Self::OFFS_DST_PORT..]).put_u16(port);
    }

    pub fn set_src(&mut self, endpoint: SocketAddrV4) {
        self.set_src_ip(*endpoint.ip());
        self.set_src_port(endpoint.port());
    }

    pub fn set_dst(&mut self, endpoint: SocketAddrV4) {
        self.set_dst_ip(*endpoint.ip());
        self.set_dst_port(endpoint.port());
    }

    /// set the source from its "a.b.c.d:port" representation
    pub fn set_src_str(&mut self, endpoint: &str) -> Result<(), WireError> {
        self.set_src(Self::parse_endpoint(endpoint)?);
        Ok(())
    }

    /// set the destination from its "a.b.c.d:port" representation
    pub fn set_dst_str(&mut self, endpoint: &str) -> Result<(), WireError> {
        self.set_dst(Self::parse_endpoint(endpoint)?);
        Ok(())
    }

    fn parse_endpoint(s: &str) -> Result<SocketAddrV4, WireError> {
        SocketAddrV4::from_str(s.trim())
            .map_err(|_| WireError::InvalidEndpoint(s.to_string()))
    }

    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.buf[Self::OFFS_FLAGS] = protocol.flags();
    }

    /// Replacing the payload changes the size, so this is the one mutator that reallocates
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<(), WireError> {
        let total = Self::checked_total_size(payload.len())?;

        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(&self.buf[..Self::OFFS_SIZE]);
        buf.put_u32(total.prechecked_cast());
        buf.put_u8(self.flags());
        buf.put_slice(payload);
        self.buf = buf;
        Ok(())
    }
}

impl AsRef<[u8]> for WireMessage {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Debug for WireMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "WireMessage{{{} {} -> {}, {} payload bytes}}", self.protocol(), self.src(), self.dst(), self.payload_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn endpoint(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[rstest]
    #[case(Protocol::Tcp, "10.0.0.1:4000", "192.168.1.20:80", b"hello".as_slice())]
    #[case(Protocol::Udp, "127.0.0.1:0", "8.8.8.8:53", b"".as_slice())]
    #[case(Protocol::Tcp, "255.255.255.255:65535", "0.0.0.0:1", &[0u8, 1, 2, 0xff, 0x80])]
    fn test_new_parse(#[case] protocol: Protocol, #[case] src: &str, #[case] dst: &str, #[case] payload: &[u8]) {
        let original = WireMessage::new(protocol, endpoint(src), endpoint(dst), payload).unwrap();
        let parsed = WireMessage::parse(original.as_bytes()).unwrap();

        assert_eq!(parsed, original);
        assert_eq!(parsed.protocol(), protocol);
        assert_eq!(parsed.src(), endpoint(src));
        assert_eq!(parsed.dst(), endpoint(dst));
        assert_eq!(parsed.payload(), payload);
        assert_eq!(parsed.total_size() as usize, payload.len() + WireMessage::HEADER_LEN);
    }

    #[test]
    fn test_layout_is_big_endian() {
        let msg = WireMessage::new(Protocol::Tcp, endpoint("1.2.3.4:258"), endpoint("5.6.7.8:772"), b"x").unwrap();
        assert_eq!(msg.as_bytes(), &[1, 2, 3, 4, 1, 2, 5, 6, 7, 8, 3, 4, 0, 0, 0, 18, 0x80, b'x']);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(16)]
    fn test_parse_too_short(#[case] len: usize) {
        let buf = vec![0u8; len];
        assert_eq!(WireMessage::parse(&buf), Err(WireError::TooShort { len, required: 17 }));
    }

    #[rstest]
    #[case(18, 17)]
    #[case(17, 20)]
    #[case(0, 17)]
    fn test_parse_size_mismatch(#[case] declared: u32, #[case] actual: usize) {
        let mut buf = vec![0u8; actual];
        buf[12..16].copy_from_slice(&declared.to_be_bytes());
        assert_eq!(WireMessage::parse(&buf), Err(WireError::SizeMismatch { declared: declared as usize, actual }));
    }

    #[rstest]
    #[case(0x01)]
    #[case(0x81)]
    #[case(0x40)]
    fn test_parse_reserved_flags(#[case] flags: u8) {
        let mut buf = WireMessage::with_size(17).unwrap().as_bytes().to_vec();
        buf[16] = flags;
        assert_eq!(WireMessage::parse(&buf), Err(WireError::ReservedFlags(flags)));
    }

    #[test]
    fn test_with_size() {
        let msg = WireMessage::with_size(20).unwrap();
        assert_eq!(msg.total_size(), 20);
        assert_eq!(msg.payload(), &[0, 0, 0]);
        assert_eq!(msg.protocol(), Protocol::Udp);

        assert_eq!(WireMessage::with_size(16), Err(WireError::TooShort { len: 16, required: 17 }));
    }

    #[test]
    fn test_setters_touch_only_their_fields() {
        let mut msg = WireMessage::new(Protocol::Udp, endpoint("1.1.1.1:1"), endpoint("2.2.2.2:2"), b"abc").unwrap();

        msg.set_src_port(1000);
        msg.set_dst_ip(Ipv4Addr::new(9, 9, 9, 9));
        msg.set_protocol(Protocol::Tcp);

        assert_eq!(msg.src(), endpoint("1.1.1.1:1000"));
        assert_eq!(msg.dst(), endpoint("9.9.9.9:2"));
        assert_eq!(msg.protocol(), Protocol::Tcp);
        assert_eq!(msg.payload(), b"abc");
        assert_eq!(msg.total_size(), 20);
    }

    #[test]
    fn test_string_setters() {
        let mut msg = WireMessage::with_size(17).unwrap();
        msg.set_src_str("127.0.0.1:5000").unwrap();
        msg.set_dst_str(" 10.1.2.3:80 ").unwrap();

        assert_eq!(msg.src(), endpoint("127.0.0.1:5000"));
        assert_eq!(msg.dst(), endpoint("10.1.2.3:80"));
        assert_eq!(msg.set_dst_str("localhost:80"), Err(WireError::InvalidEndpoint("localhost:80".to_string())));
    }

    #[test]
    fn test_set_payload_resizes() {
        let mut msg = WireMessage::new(Protocol::Tcp, endpoint("1.2.3.4:5"), endpoint("6.7.8.9:10"), b"short").unwrap();
        msg.set_payload(b"a considerably longer payload").unwrap();

        assert_eq!(msg.payload(), b"a considerably longer payload");
        assert_eq!(msg.total_size() as usize, 17 + 29);
        assert_eq!(msg.src(), endpoint("1.2.3.4:5"));
        assert_eq!(msg.protocol(), Protocol::Tcp);
        assert!(WireMessage::parse(msg.as_bytes()).is_ok());
    }

    #[test]
    fn test_transport_view() {
        let msg = WireMessage::new(Protocol::Tcp, endpoint("1.2.3.4:5"), endpoint("6.7.8.9:10"), b"hello").unwrap();
        let view = msg.transport_view();
        assert_eq!(view, &[0, 0, 0, 22, 0x80, b'h', b'e', b'l', b'l', b'o']);

        let rebuilt = WireMessage::from_transport_bytes(view, endpoint("6.7.8.9:10"), endpoint("127.0.0.1:4000")).unwrap();
        assert_eq!(rebuilt.src(), endpoint("6.7.8.9:10"));
        assert_eq!(rebuilt.dst(), endpoint("127.0.0.1:4000"));
        assert_eq!(rebuilt.payload(), b"hello");
        assert_eq!(rebuilt.protocol(), Protocol::Tcp);
    }

    #[rstest]
    #[case(&[0, 0, 0, 17], WireError::TooShort { len: 4, required: 5 })]
    #[case(&[0, 0, 0, 18, 0], WireError::SizeMismatch { declared: 18, actual: 17 })]
    #[case(&[0, 0, 0, 17, 0x7f], WireError::ReservedFlags(0x7f))]
    fn test_from_transport_bytes_invalid(#[case] transport: &[u8], #[case] expected: WireError) {
        let any = endpoint("0.0.0.0:0");
        assert_eq!(WireMessage::from_transport_bytes(transport, any, any), Err(expected));
    }
}
