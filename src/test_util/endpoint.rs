use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// convenience for test code: an endpoint on the loopback interface
pub fn localhost(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

/// The IPv4 address of a socket that was bound to an IPv4 address. Panics for IPv6.
pub fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(addr) => panic!("expected an IPv4 address, was {}", addr),
    }
}
