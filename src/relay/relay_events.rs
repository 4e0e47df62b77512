use std::fmt::{Display, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use crate::message::wire_message::Protocol;
use crate::relay::connection_key::ConnectionKey;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    Created,
    CreateFailed,
    SendFailed,
    RecvFailed,
    Closed,
    Removed,
    RemoveFailed,
}

impl EventKind {
    const ALL: [EventKind; 7] = [
        EventKind::Created,
        EventKind::CreateFailed,
        EventKind::SendFailed,
        EventKind::RecvFailed,
        EventKind::Closed,
        EventKind::Removed,
        EventKind::RemoveFailed,
    ];

    /// the tag identifying the event in its string form
    pub fn tag(self) -> &'static str {
        match self {
            EventKind::Created => "createConn-success",
            EventKind::CreateFailed => "createConn-failed",
            EventKind::SendFailed => "send-failed",
            EventKind::RecvFailed => "recv-failed",
            EventKind::Closed => "socket-close",
            EventKind::Removed => "removeConn-success",
            EventKind::RemoveFailed => "removeConn-failed",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, EventKind::CreateFailed | EventKind::SendFailed | EventKind::RecvFailed | EventKind::RemoveFailed)
    }
}

/// A lifecycle or error notification for a single connection. The string form is
///  `<proto>::<localPort>::<remoteIP>:<remotePort>-<event>[-<detail>]`, which is what the UI
///  side dispatches on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionEvent {
    pub key: ConnectionKey,
    pub kind: EventKind,
    pub detail: Option<String>,
}

impl ConnectionEvent {
    pub fn new(key: ConnectionKey, kind: EventKind) -> ConnectionEvent {
        ConnectionEvent {
            key,
            kind,
            detail: None,
        }
    }

    pub fn with_detail(key: ConnectionKey, kind: EventKind, detail: impl Display) -> ConnectionEvent {
        ConnectionEvent {
            key,
            kind,
            detail: Some(detail.to_string()),
        }
    }
}

impl Display for ConnectionEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.key, self.kind.tag())?;
        if let Some(detail) = &self.detail {
            write!(f, "-{}", detail)?;
        }
        Ok(())
    }
}

impl FromStr for ConnectionEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, rest) = match s.split_once('-') {
            Some(x) => x,
            None => anyhow::bail!("not a connection event: {:?}", s),
        };
        let key = ConnectionKey::from_str(key)?;

        for kind in EventKind::ALL {
            if let Some(after_tag) = rest.strip_prefix(kind.tag()) {
                if after_tag.is_empty() {
                    return Ok(ConnectionEvent::new(key, kind));
                }
                if let Some(detail) = after_tag.strip_prefix('-') {
                    return Ok(ConnectionEvent::with_detail(key, kind, detail));
                }
            }
        }
        anyhow::bail!("unknown event {:?}", rest)
    }
}

/// A connection management request from the UI, sent as an out-of-band notification of the
///  form `createConn-<type>-<srcIP>-<srcPort>-<dstIP>-<dstPort>` (or `removeConn-...`).
///
/// `type` is a decimal message type, and any type with bit 7 set is TCP. The source IP is the
///  UI's own address and carries no routing information. UDP connections are identified by
///  their local port alone, so the destination of a UDP command is ignored.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdminCommand {
    Create(ConnectionKey),
    Remove(ConnectionKey),
}

impl AdminCommand {
    pub fn key(&self) -> ConnectionKey {
        match self {
            AdminCommand::Create(key) | AdminCommand::Remove(key) => *key,
        }
    }
}

impl FromStr for AdminCommand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.split('-').collect::<Vec<_>>();
        let (command, msg_type, _src_ip, src_port, dst_ip, dst_port) = match parts.as_slice() {
            [c, t, sip, sp, dip, dp] => (*c, *t, sip.parse::<Ipv4Addr>()?, *sp, *dip, *dp),
            _ => anyhow::bail!("admin command must have the form <command>-<type>-<srcIP>-<srcPort>-<dstIP>-<dstPort>, was {:?}", s),
        };

        let msg_type: u8 = msg_type.parse()?;
        let local_port: u16 = src_port.parse()?;
        let key = if msg_type & Protocol::TCP_FLAG != 0 {
            ConnectionKey::tcp(local_port, SocketAddrV4::new(dst_ip.parse()?, dst_port.parse()?))
        }
        else {
            ConnectionKey::udp(local_port)
        };

        match command {
            "createConn" => Ok(AdminCommand::Create(key)),
            "removeConn" => Ok(AdminCommand::Remove(key)),
            other => anyhow::bail!("unknown admin command {:?}", other),
        }
    }
}
