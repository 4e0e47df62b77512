use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use shm_relay::channel::bridge::{ChannelBridge, PeerNotifier};
use shm_relay::channel::duplex_channel::DuplexChannel;
use shm_relay::config::RelayConfig;
use shm_relay::message::wire_message::{Protocol, WireMessage};
use shm_relay::relay::connection_key::ConnectionKey;
use shm_relay::relay::multiplexer::Multiplexer;
use shm_relay::relay::relay_events::{ConnectionEvent, EventKind};
use shm_relay::test_util::endpoint::{localhost, v4};
use shm_relay::test_util::recording_handler::RecordingHandler;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::Level;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

fn multiplexer() -> (Multiplexer, RecordingHandler) {
    let handler = RecordingHandler::new();
    let multiplexer = Multiplexer::new(Arc::new(RelayConfig::localhost()), Arc::new(handler.clone())).unwrap();
    (multiplexer, handler)
}

#[tokio::test(flavor = "multi_thread")]
async fn inbound_tcp_message_is_stamped_with_routing_tuple() {
    let (multiplexer, handler) = multiplexer();
    let port = multiplexer.start_listening(0).await.unwrap();

    let mut client = TcpStream::connect(localhost(port)).await.unwrap();
    let client_addr = v4(client.local_addr().unwrap());
    let key = ConnectionKey::tcp(port, client_addr);
    assert_eq!(handler.next_event().await, ConnectionEvent::new(key, EventKind::Created));

    client.write_all(&[0, 0, 0, 22, 0x80, b'h', b'e', b'l', b'l', b'o']).await.unwrap();

    let msg = handler.next_message().await;
    assert_eq!(msg.payload(), b"hello");
    assert_eq!(msg.protocol(), Protocol::Tcp);
    assert_eq!(msg.total_size(), 22);
    assert_eq!(msg.src(), client_addr);
    assert_eq!(msg.dst_port(), port);

    // answering with swapped addresses goes back to the client
    let reply = WireMessage::new(Protocol::Tcp, msg.dst(), msg.src(), b"world").unwrap();
    multiplexer.send(reply.as_bytes()).unwrap();
    let mut buf = [0u8; 10];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, &[0, 0, 0, 22, 0x80, b'w', b'o', b'r', b'l', b'd']);
    assert_eq!(multiplexer.connection_count(), 1);

    multiplexer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn removing_a_connection_with_a_blocked_receiver_is_bounded() {
    let (multiplexer, handler) = multiplexer();
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = v4(server.local_addr().unwrap());
    let key = ConnectionKey::tcp(0, server_addr);

    multiplexer.create_connection(key).unwrap();
    // the peer stays silent, so the receiver is blocked reading
    let (_stream, _) = server.accept().await.unwrap();
    assert_eq!(handler.next_event().await, ConnectionEvent::new(key, EventKind::Created));

    let started = Instant::now();
    multiplexer.remove_connection(key).await.unwrap();
    assert!(started.elapsed() < RelayConfig::localhost().teardown_timeout + Duration::from_secs(1));

    assert_eq!(handler.next_event().await, ConnectionEvent::new(key, EventKind::Removed));
    handler.assert_no_event_within(Duration::from_millis(200)).await;
    assert!(!multiplexer.has_connection(&key));

    multiplexer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn udp_sockets_are_per_local_port() {
    let (multiplexer, handler) = multiplexer();
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = v4(peer.local_addr().unwrap());

    let placeholder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let pinned_port = placeholder.local_addr().unwrap().port();
    drop(placeholder);

    for (src_port, payload) in [(0, b"a"), (0, b"b"), (pinned_port, b"c")] {
        let msg = WireMessage::new(Protocol::Udp, localhost(src_port), peer_addr, payload).unwrap();
        multiplexer.send(msg.as_bytes()).unwrap();
    }
    assert_eq!(multiplexer.connection_count(), 2);

    let mut created = vec![handler.next_event().await, handler.next_event().await];
    created.sort_by_key(|e| e.key.local_port);
    assert_eq!(created, vec![
        ConnectionEvent::new(ConnectionKey::udp(0), EventKind::Created),
        ConnectionEvent::new(ConnectionKey::udp(pinned_port), EventKind::Created),
    ]);

    let mut from_pinned = None;
    for _ in 0..3 {
        let mut buf = [0u8; 16];
        let (len, from) = timeout(Duration::from_secs(5), peer.recv_from(&mut buf)).await.unwrap().unwrap();
        if &buf[5..len] == b"c" {
            from_pinned = Some(from.port());
        }
    }
    assert_eq!(from_pinned, Some(pinned_port));

    multiplexer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pinned_tcp_source_port_needs_an_existing_connection() {
    let (multiplexer, handler) = multiplexer();
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = v4(server.local_addr().unwrap());

    let msg = WireMessage::new(Protocol::Tcp, localhost(45678), server_addr, b"x").unwrap();
    assert!(multiplexer.send(msg.as_bytes()).is_err());

    let event = handler.next_event().await;
    assert_eq!(event.key, ConnectionKey::tcp(45678, server_addr));
    assert_eq!(event.kind, EventKind::CreateFailed);
    assert_eq!(multiplexer.connection_count(), 0);
    assert!(timeout(Duration::from_millis(200), server.accept()).await.is_err());

    multiplexer.close().await;
}

struct CountingNotifier(Mutex<mpsc::Sender<()>>);

impl PeerNotifier for CountingNotifier {
    fn data_ready(&self) {
        self.0.lock().unwrap().send(()).ok();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_bridge_relays_both_directions() {
    let (relay_side, mut ui_side) = DuplexChannel::pair(64 * 1024).unwrap();
    relay_side.initialize();

    let (notify_send, notify_recv) = mpsc::channel();
    let bridge = ChannelBridge::new(relay_side, Arc::new(CountingNotifier(Mutex::new(notify_send))));

    let (events_send, events_recv) = mpsc::channel();
    let events_send = Mutex::new(events_send);
    let handler = bridge.handler(move |event| { events_send.lock().unwrap().send(event).ok(); });
    let multiplexer = Multiplexer::new(Arc::new(RelayConfig::localhost()), Arc::new(handler)).unwrap();
    bridge.start_pump(Arc::new(multiplexer.clone())).unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = v4(peer.local_addr().unwrap());

    // UI -> network
    let outbound = WireMessage::new(Protocol::Udp, localhost(0), peer_addr, b"ping").unwrap();
    ui_side.write_message(outbound.as_bytes()).unwrap();
    bridge.data_ready();

    let mut buf = [0u8; 16];
    let (len, relay_addr) = timeout(Duration::from_secs(5), peer.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..len], &[0, 0, 0, 21, 0x00, b'p', b'i', b'n', b'g']);

    let event = tokio::task::block_in_place(|| events_recv.recv_timeout(Duration::from_secs(5))).unwrap();
    assert_eq!(event, ConnectionEvent::new(ConnectionKey::udp(0), EventKind::Created));

    // network -> UI
    peer.send_to(&[0, 0, 0, 21, 0x00, b'p', b'o', b'n', b'g'], relay_addr).await.unwrap();
    tokio::task::block_in_place(|| notify_recv.recv_timeout(Duration::from_secs(5))).unwrap();

    let inbound = WireMessage::parse(&ui_side.read_next().unwrap().unwrap()).unwrap();
    assert_eq!(inbound.payload(), b"pong");
    assert_eq!(inbound.src(), peer_addr);
    assert_eq!(inbound.protocol(), Protocol::Udp);

    bridge.shutdown().await;
    multiplexer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn admin_commands_from_the_ui_manage_connections() {
    let (relay_side, _ui_side) = DuplexChannel::pair(64 * 1024).unwrap();
    relay_side.initialize();
    let (notify_send, _notify_recv) = mpsc::channel();
    let bridge = ChannelBridge::new(relay_side, Arc::new(CountingNotifier(Mutex::new(notify_send))));

    let (events_send, events_recv) = mpsc::channel();
    let events_send = Mutex::new(events_send);
    let handler = bridge.handler(move |event| { events_send.lock().unwrap().send(event).ok(); });
    let multiplexer = Multiplexer::new(Arc::new(RelayConfig::localhost()), Arc::new(handler)).unwrap();
    bridge.start_pump(Arc::new(multiplexer.clone())).unwrap();
    let next_event = || tokio::task::block_in_place(|| events_recv.recv_timeout(Duration::from_secs(5))).unwrap();

    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = v4(server.local_addr().unwrap());
    let key = ConnectionKey::tcp(0, server_addr);

    let create = format!("createConn-128-192.168.1.5-0-127.0.0.1-{}", server_addr.port());
    assert!(bridge.on_notification(&create));
    let (_stream, _) = timeout(Duration::from_secs(5), server.accept()).await.unwrap().unwrap();
    assert_eq!(next_event().to_string(), format!("tcp::0::{}-createConn-success", server_addr));
    assert!(multiplexer.has_connection(&key));

    assert!(bridge.on_notification(&create.replace("createConn", "removeConn")));
    assert_eq!(next_event(), ConnectionEvent::new(key, EventKind::Removed));
    assert!(!multiplexer.has_connection(&key));

    assert!(bridge.on_notification(&create.replace("createConn", "removeConn")));
    assert_eq!(next_event().kind, EventKind::RemoveFailed);

    bridge.shutdown().await;
    multiplexer.close().await;
}
