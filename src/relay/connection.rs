use std::fmt::Display;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument, Span};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::message::wire_message::WireMessage;
use crate::relay::connection_key::ConnectionKey;
use crate::relay::relay_events::{ConnectionEvent, EventKind};
use crate::util::safe_converter::SafeCast;

/// What connections hand back to the multiplexer, in the order it happened per connection
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(ConnectionKey, WireMessage),
    Event(ConnectionEvent),
}

/// The multiplexer's side of the connections: where inbound traffic and events go, and where a
///  connection reports that it ended on its own
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub config: Arc<RelayConfig>,
    pub inbound: mpsc::UnboundedSender<Inbound>,
    pub ended: mpsc::UnboundedSender<(ConnectionKey, u64)>,
}

impl ConnectionContext {
    pub fn report(&self, event: ConnectionEvent) {
        trace!("event: {}", event);
        let _ = self.inbound.send(Inbound::Event(event));
    }

    fn deliver(&self, key: ConnectionKey, msg: WireMessage) {
        let _ = self.inbound.send(Inbound::Message(key, msg));
    }
}

/// The socket a connection starts out with
pub(crate) enum Transport {
    /// an outbound TCP connection, established asynchronously by the connection itself
    TcpConnect(TcpSocket, SocketAddrV4),
    TcpAccepted(TcpStream),
    Udp(UdpSocket),
}

/// A live TCP or UDP endpoint with a sender and a receiver task. The connection is owned by its
///  registry entry; [Connection::teardown] is the only way it is shut down from the outside.
pub(crate) struct Connection {
    key: ConnectionKey,
    id: u64,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<WireMessage>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn start(
        key: ConnectionKey,
        id: u64,
        transport: Transport,
        ctx: ConnectionContext,
        parent_cancel: &CancellationToken,
        runtime: &Handle,
    ) -> Arc<Connection> {
        let cancel = parent_cancel.child_token();
        let running = Arc::new(AtomicBool::new(true));
        let (outbound, outbound_recv) = mpsc::unbounded_channel();

        let io = ConnectionIo {
            key,
            running: running.clone(),
            cancel: cancel.clone(),
            ctx,
        };
        let supervisor = runtime.spawn(
            io.run(id, transport, outbound_recv)
                .instrument(tracing::debug_span!("connection", %key))
        );

        Arc::new(Connection {
            key,
            id,
            running,
            cancel,
            outbound,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    pub fn enqueue(&self, msg: WireMessage) -> Result<(), RelayError> {
        if !self.is_running() {
            return Err(RelayError::Closed(self.key));
        }
        trace!("queueing message for {}: {:?}", self.key, msg);
        self.outbound.send(msg)
            .map_err(|_| RelayError::Closed(self.key))
    }

    /// Stop both loops and wait for them to finish. Messages that were not sent yet are dropped,
    ///  and no events are reported for this connection after this.
    pub async fn teardown(&self, max_wait: std::time::Duration) {
        self.running.store(false, Ordering::Release);
        self.cancel.cancel();

        let supervisor = self.supervisor.lock().unwrap().take();
        if let Some(mut supervisor) = supervisor {
            match timeout(max_wait, &mut supervisor).await {
                Ok(Ok(())) => debug!("connection {} terminated", self.key),
                Ok(Err(e)) => warn!("connection {} terminated abnormally: {}", self.key, e),
                Err(_) => {
                    warn!("connection {} did not terminate within {:?} - aborting", self.key, max_wait);
                    supervisor.abort();
                }
            }
        }
    }
}

/// The state shared by a connection's tasks
#[derive(Clone)]
struct ConnectionIo {
    key: ConnectionKey,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    ctx: ConnectionContext,
}

impl ConnectionIo {
    async fn run(self, id: u64, transport: Transport, outbound: mpsc::UnboundedReceiver<WireMessage>) {
        match transport {
            Transport::TcpConnect(socket, remote) => {
                if let Some(stream) = self.connect(socket, remote).await {
                    self.run_tcp(stream, outbound).await;
                }
            }
            Transport::TcpAccepted(stream) => {
                self.ctx.report(ConnectionEvent::new(self.key, EventKind::Created));
                self.run_tcp(stream, outbound).await;
            }
            Transport::Udp(socket) => {
                self.ctx.report(ConnectionEvent::new(self.key, EventKind::Created));
                self.run_udp(socket, outbound).await;
            }
        }

        self.running.store(false, Ordering::Release);
        let _ = self.ctx.ended.send((self.key, id));
    }

    async fn connect(&self, socket: TcpSocket, remote: SocketAddrV4) -> Option<TcpStream> {
        debug!("connecting to {}", remote);
        let connected = select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!("connect cancelled");
                return None;
            }
            r = socket.connect(SocketAddr::V4(remote)) => r,
        };

        match connected {
            Ok(stream) => {
                self.configure(&stream);
                debug!("connected");
                self.ctx.report(ConnectionEvent::new(self.key, EventKind::Created));
                Some(stream)
            }
            Err(e) => {
                self.abandon(EventKind::CreateFailed, e);
                None
            }
        }
    }

    fn configure(&self, stream: &TcpStream) {
        if self.ctx.config.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("could not set TCP_NODELAY: {}", e);
            }
        }
    }

    /// Stamped into inbound messages as their destination. The port is the connection's port
    ///  rather than the socket's, so that replies are routed back through this connection. For a
    ///  socket bound to an ephemeral port (a `udp::0` or `tcp::0` key) that means port 0, not the
    ///  port the OS picked.
    fn local_endpoint(&self, local_addr: io::Result<SocketAddr>) -> SocketAddrV4 {
        let ip = match local_addr {
            Ok(SocketAddr::V4(addr)) => *addr.ip(),
            _ => Ipv4Addr::UNSPECIFIED,
        };
        SocketAddrV4::new(ip, self.key.local_port)
    }

    async fn run_tcp(&self, stream: TcpStream, outbound: mpsc::UnboundedReceiver<WireMessage>) {
        let peer = match stream.peer_addr() {
            Ok(SocketAddr::V4(addr)) => addr,
            _ => self.key.remote,
        };
        let local = self.local_endpoint(stream.local_addr());
        let (read_half, write_half) = stream.into_split();

        let sender = tokio::spawn(self.clone().tcp_send_loop(write_half, outbound).instrument(Span::current()));
        let receiver = tokio::spawn(self.clone().tcp_receive_loop(read_half, peer, local).instrument(Span::current()));

        if let Err(e) = sender.await {
            warn!("TCP sender terminated abnormally: {}", e);
        }
        if let Err(e) = receiver.await {
            warn!("TCP receiver terminated abnormally: {}", e);
        }
    }

    async fn tcp_send_loop(self, mut write_half: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<WireMessage>) {
        while let Some(msg) = self.next_outbound(&mut outbound).await {
            trace!("sending {} payload bytes", msg.payload_len());
            let written = select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = write_half.write_all(msg.transport_view()) => r,
            };
            if let Err(e) = written {
                self.abandon(EventKind::SendFailed, e);
                break;
            }
        }
        trace!("TCP sender finished");
    }

    async fn next_outbound(&self, outbound: &mut mpsc::UnboundedReceiver<WireMessage>) -> Option<WireMessage> {
        select! {
            biased;
            _ = self.cancel.cancelled() => None,
            msg = outbound.recv() => msg,
        }
    }

    async fn tcp_receive_loop(self, mut read_half: OwnedReadHalf, peer: SocketAddrV4, local: SocketAddrV4) {
        let max_message_size = self.ctx.config.max_message_size;
        loop {
            let frame = select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = read_frame(&mut read_half, max_message_size) => r,
            };

            match frame {
                Ok(Some(buf)) => match WireMessage::from_transport_bytes(&buf, peer, local) {
                    Ok(msg) => {
                        trace!("received {} payload bytes", msg.payload_len());
                        self.ctx.deliver(self.key, msg);
                    }
                    Err(e) => self.report_unless_cancelled(EventKind::RecvFailed, e),
                },
                Ok(None) => {
                    self.close_orderly();
                    break;
                }
                Err(e) => {
                    self.abandon(EventKind::RecvFailed, e);
                    break;
                }
            }
        }
        trace!("TCP receiver finished");
    }

    async fn run_udp(&self, socket: UdpSocket, outbound: mpsc::UnboundedReceiver<WireMessage>) {
        let local = self.local_endpoint(socket.local_addr());
        let socket = Arc::new(socket);

        let sender = tokio::spawn(self.clone().udp_send_loop(socket.clone(), outbound).instrument(Span::current()));
        let receiver = tokio::spawn(self.clone().udp_receive_loop(socket, local).instrument(Span::current()));

        if let Err(e) = sender.await {
            warn!("UDP sender terminated abnormally: {}", e);
        }
        if let Err(e) = receiver.await {
            warn!("UDP receiver terminated abnormally: {}", e);
        }
    }

    /// A failed datagram is reported, but the socket stays in service for other destinations
    async fn udp_send_loop(self, socket: Arc<UdpSocket>, mut outbound: mpsc::UnboundedReceiver<WireMessage>) {
        while let Some(msg) = self.next_outbound(&mut outbound).await {
            let to = msg.dst();
            trace!("sending datagram with {} payload bytes to {}", msg.payload_len(), to);
            let sent = select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = socket.send_to(msg.transport_view(), SocketAddr::V4(to)) => r,
            };
            if let Err(e) = sent {
                warn!("error sending datagram to {}: {}", to, e);
                self.report_unless_cancelled(EventKind::SendFailed, format!("{}: {}", to, e));
            }
        }
        trace!("UDP sender finished");
    }

    async fn udp_receive_loop(self, socket: Arc<UdpSocket>, local: SocketAddrV4) {
        let mut buf = vec![0u8; self.ctx.config.udp_receive_buffer_size];
        loop {
            let received = select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = socket.recv_from(&mut buf) => r,
            };

            let (len, from) = match received {
                Ok((len, SocketAddr::V4(from))) => (len, from),
                Ok((_, from)) => {
                    debug!("ignoring datagram from non-IPv4 sender {}", from);
                    continue;
                }
                Err(e) => {
                    debug!("error receiving datagram: {}", e);
                    continue;
                }
            };

            if len == 0 {
                if from.ip().is_loopback() {
                    debug!("received shutdown datagram from {}", from);
                    self.close_orderly();
                    break;
                }
                continue;
            }

            match WireMessage::from_transport_bytes(&buf[..len], from, local) {
                Ok(msg) => {
                    trace!("received datagram with {} payload bytes from {}", msg.payload_len(), from);
                    self.ctx.deliver(self.key, msg);
                }
                Err(e) => {
                    debug!("dropping invalid datagram from {}: {}", from, e);
                    self.report_unless_cancelled(EventKind::RecvFailed, format!("{}: {}", from, e));
                }
            }
        }
        trace!("UDP receiver finished");
    }

    fn report_unless_cancelled(&self, kind: EventKind, detail: impl Display) {
        if !self.cancel.is_cancelled() {
            self.ctx.report(ConnectionEvent::with_detail(self.key, kind, detail));
        }
    }

    /// Give up on the connection after a failure. There is no retry: the failure is reported
    ///  once, and the connection ends.
    fn abandon(&self, kind: EventKind, detail: impl Display) {
        self.running.store(false, Ordering::Release);
        if !self.cancel.is_cancelled() {
            warn!("abandoning connection - {}: {}", kind.tag(), detail);
            self.ctx.report(ConnectionEvent::with_detail(self.key, kind, detail));
        }
        self.cancel.cancel();
    }

    fn close_orderly(&self) {
        self.running.store(false, Ordering::Release);
        if !self.cancel.is_cancelled() {
            debug!("peer closed the connection");
            self.ctx.report(ConnectionEvent::new(self.key, EventKind::Closed));
        }
        self.cancel.cancel();
    }
}

/// Read the transport view of the next message from a TCP stream, or `None` if the peer closed
///  the stream
async fn read_frame(read_half: &mut OwnedReadHalf, max_message_size: u32) -> anyhow::Result<Option<BytesMut>> {
    let mut size_buf = [0u8; 4];
    if !read_fully(read_half, &mut size_buf).await? {
        return Ok(None);
    }

    let total_size = u32::from_be_bytes(size_buf);
    if (total_size as usize) < WireMessage::HEADER_LEN {
        anyhow::bail!("received message size {} is smaller than the header - the stream is out of sync", total_size);
    }
    if total_size > max_message_size {
        anyhow::bail!("received a message that was longer than the configured maximum ({}) - closing connection because it is apparently compromised", total_size);
    }

    let total_size: usize = total_size.safe_cast();
    let mut buf = BytesMut::zeroed(total_size - WireMessage::ADDRESS_LEN);
    buf[..4].copy_from_slice(&size_buf);
    if !read_fully(read_half, &mut buf[4..]).await? {
        return Ok(None);
    }
    Ok(Some(buf))
}

/// `false` if the stream ended before `buf` was filled
async fn read_fully(read_half: &mut OwnedReadHalf, buf: &mut [u8]) -> io::Result<bool> {
    match read_half.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
