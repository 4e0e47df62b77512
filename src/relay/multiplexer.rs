use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::message::wire_message::WireMessage;
use crate::relay::connection::{Connection, ConnectionContext, Inbound, Transport};
use crate::relay::connection_key::ConnectionKey;
use crate::relay::relay_events::{ConnectionEvent, EventKind};
use crate::relay::relay_handler::RelayHandler;
use crate::util::worker_pool::WorkerPool;

/// The Multiplexer is where the relay comes together: it maps each routing tuple to a live
///  [Connection], creating connections on demand for outbound messages and for inbound TCP
///  connections on the listening socket, and it hands everything the connections receive to the
///  [RelayHandler] through a worker pool.
///
/// Operations never block on network I/O: TCP connects happen in the background, and messages
///  sent while a connection is being established are queued.
///
/// A multiplexer must be created inside a tokio runtime, and it is cheap to clone.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

struct Listener {
    port: u16,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: Arc<RelayConfig>,
    runtime: Handle,
    registry: Mutex<FxHashMap<ConnectionKey, Arc<Connection>>>,
    /// serializes creation of connections, without holding the registry lock while sockets are
    ///  set up
    creation_lock: Mutex<()>,
    listener: tokio::sync::Mutex<Option<Listener>>,
    ctx: ConnectionContext,
    pool: Arc<WorkerPool>,
    root_cancel: CancellationToken,
    next_connection_id: AtomicU64,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.root_cancel.cancel();
    }
}

impl Multiplexer {
    pub fn new(config: Arc<RelayConfig>, handler: Arc<dyn RelayHandler>) -> anyhow::Result<Multiplexer> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| RelayError::NoRuntime)?;

        let (inbound_send, inbound_recv) = mpsc::unbounded_channel();
        let (ended_send, ended_recv) = mpsc::unbounded_channel();
        let pool = Arc::new(WorkerPool::new(config.worker_pool_size, &runtime));
        let root_cancel = CancellationToken::new();

        let inner = Arc::new(Inner {
            config: config.clone(),
            runtime: runtime.clone(),
            registry: Default::default(),
            creation_lock: Mutex::new(()),
            listener: tokio::sync::Mutex::new(None),
            ctx: ConnectionContext {
                config: config.clone(),
                inbound: inbound_send,
                ended: ended_send,
            },
            pool: pool.clone(),
            root_cancel: root_cancel.clone(),
            next_connection_id: AtomicU64::new(0),
            background_tasks: Default::default(),
        });

        let dispatcher = runtime.spawn(
            dispatch_loop(inbound_recv, handler, pool, config.dispatch_batch_size, root_cancel.clone())
                .instrument(tracing::debug_span!("dispatcher"))
        );
        let reaper = runtime.spawn(
            reap_loop(Arc::downgrade(&inner), ended_recv, root_cancel)
                .instrument(tracing::debug_span!("reaper"))
        );
        inner.background_tasks.lock().unwrap()
            .extend([dispatcher, reaper]);

        Ok(Multiplexer { inner })
    }

    /// Route a raw wire message from the UI to its connection, creating the connection if
    ///  necessary. This returns as soon as the message is queued.
    pub fn send(&self, raw: &[u8]) -> Result<(), RelayError> {
        let msg = WireMessage::parse(raw)?;
        let key = ConnectionKey::for_outbound(&msg);
        trace!("routing {:?} through {}", msg, key);

        let (connection, _) = self.inner.get_or_create(key, true)?;
        connection.enqueue(msg)
    }

    /// Get or create a connection for an explicit routing tuple. For TCP, a non-zero local port is
    ///  bound before connecting. Success is reported as an event once the connection is usable.
    pub fn create_connection(&self, key: ConnectionKey) -> Result<(), RelayError> {
        let (_, is_new) = self.inner.get_or_create(key, false)?;
        if !is_new {
            self.inner.ctx.report(ConnectionEvent::new(key, EventKind::Created));
        }
        Ok(())
    }

    pub async fn remove_connection(&self, key: ConnectionKey) -> Result<(), RelayError> {
        let removed = self.inner.registry.lock().unwrap().remove(&key);
        match removed {
            Some(connection) => {
                debug!("removing connection {}", key);
                connection.teardown(self.inner.config.teardown_timeout).await;
                self.inner.ctx.report(ConnectionEvent::new(key, EventKind::Removed));
                Ok(())
            }
            None => {
                debug!("no connection {} to remove", key);
                self.inner.ctx.report(ConnectionEvent::with_detail(key, EventKind::RemoveFailed, "no such connection"));
                Err(RelayError::NotFound(key))
            }
        }
    }

    /// Listen for inbound TCP connections, returning the port that is actually bound. Listening
    ///  on the port that is already listening does nothing, as does port 0 while listening; a
    ///  different port replaces the current listener.
    pub async fn start_listening(&self, port: u16) -> Result<u16, RelayError> {
        let mut listener = self.inner.listener.lock().await;
        if let Some(current) = listener.as_ref() {
            if port == 0 || port == current.port {
                return Ok(current.port);
            }
        }
        if let Some(previous) = listener.take() {
            self.inner.stop_listener(previous).await;
        }

        let addr = SocketAddrV4::new(self.inner.config.listen_addr_v4, port);
        let tcp_listener = TcpListener::bind(addr).await
            .map_err(|source| RelayError::Listen { port, source })?;
        let actual_port = tcp_listener.local_addr()
            .map_err(|source| RelayError::Listen { port, source })?
            .port();
        info!("listening for TCP connections on {}:{}", addr.ip(), actual_port);

        let cancel = self.inner.root_cancel.child_token();
        let task = self.inner.runtime.spawn(
            accept_loop(Arc::downgrade(&self.inner), tcp_listener, actual_port, cancel.clone())
                .instrument(tracing::info_span!("listener", port = actual_port))
        );

        *listener = Some(Listener {
            port: actual_port,
            cancel,
            task,
        });
        Ok(actual_port)
    }

    pub async fn stop_listening(&self) {
        let previous = self.inner.listener.lock().await.take();
        if let Some(previous) = previous {
            self.inner.stop_listener(previous).await;
        }
    }

    pub async fn listening_port(&self) -> Option<u16> {
        self.inner.listener.lock().await
            .as_ref()
            .map(|l| l.port)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.lock().unwrap().len()
    }

    pub fn has_connection(&self, key: &ConnectionKey) -> bool {
        self.inner.registry.lock().unwrap().contains_key(key)
    }

    /// Stop listening and tear down every connection. The multiplexer stays usable, and this can
    ///  be called any number of times.
    pub async fn shutdown_all(&self) {
        self.stop_listening().await;

        let connections: Vec<_> = self.inner.registry.lock().unwrap()
            .drain()
            .map(|(_, c)| c)
            .collect();
        if connections.is_empty() {
            return;
        }

        info!("shutting down {} connections", connections.len());
        let teardown_timeout = self.inner.config.teardown_timeout;
        let teardowns: Vec<_> = connections.into_iter()
            .map(|c| self.inner.runtime.spawn(async move { c.teardown(teardown_timeout).await }))
            .collect();
        for teardown in teardowns {
            if let Err(e) = teardown.await {
                warn!("error tearing down connection: {}", e);
            }
        }
    }

    /// Shut down everything, deliver what is still queued to the handler, and stop the
    ///  multiplexer's own tasks
    pub async fn close(&self) {
        self.shutdown_all().await;
        self.inner.root_cancel.cancel();

        let background_tasks = std::mem::take(&mut *self.inner.background_tasks.lock().unwrap());
        for task in background_tasks {
            if let Err(e) = task.await {
                warn!("background task terminated abnormally: {}", e);
            }
        }
        self.inner.pool.shutdown().await;
        debug!("multiplexer closed");
    }
}

impl Inner {
    fn lookup_running(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.registry.lock().unwrap()
            .get(key)
            .filter(|c| c.is_running())
            .cloned()
    }

    /// Returns the connection, and whether it was created by this call. `implicit` creation on
    ///  behalf of an outbound message never opens a TCP connection from a pinned source port.
    fn get_or_create(&self, key: ConnectionKey, implicit: bool) -> Result<(Arc<Connection>, bool), RelayError> {
        // the common case
        if let Some(connection) = self.lookup_running(&key) {
            return Ok((connection, false));
        }

        // This is a std lock, and sockets are created and bound while holding it. Binding is a
        //  local syscall that does not wait for the network (TCP connects happen later in the
        //  connection's own task), so the lock is held briefly and only serializes creation.
        let _creation_guard = self.creation_lock.lock().unwrap();

        // check again now that we are the only ones creating connections
        let stale = {
            let registry = self.registry.lock().unwrap();
            match registry.get(&key) {
                Some(connection) if connection.is_running() => return Ok((connection.clone(), false)),
                Some(connection) => Some(connection.clone()),
                None => None,
            }
        };
        if let Some(stale) = stale {
            debug!("replacing connection {} that is no longer running", key);
            self.remove_if_same(&stale);
            self.teardown_in_background(stale);
        }

        if implicit && key.is_tcp() && key.local_port != 0 {
            debug!("no connection {} for a pinned source port - dropping message", key);
            self.ctx.report(ConnectionEvent::with_detail(key, EventKind::CreateFailed, "no active connection for pinned source port"));
            return Err(RelayError::NoRoute(key));
        }

        let transport = match self.open_transport(&key) {
            Ok(transport) => transport,
            Err(source) => {
                warn!("failed to create connection {}: {}", key, source);
                self.ctx.report(ConnectionEvent::with_detail(key, EventKind::CreateFailed, &source));
                return Err(RelayError::CreateFailed { key, source });
            }
        };

        debug!("creating connection {}", key);
        let connection = self.start_and_register(key, transport);
        Ok((connection, true))
    }

    fn open_transport(&self, key: &ConnectionKey) -> io::Result<Transport> {
        let _runtime_guard = self.runtime.enter();
        let local_addr = SocketAddrV4::new(self.config.listen_addr_v4, key.local_port);

        if key.is_tcp() {
            let socket = TcpSocket::new_v4()?;
            if key.local_port != 0 {
                socket.set_reuseaddr(true)?;
                socket.bind(SocketAddr::V4(local_addr))?;
            }
            Ok(Transport::TcpConnect(socket, key.remote))
        }
        else {
            let socket = std::net::UdpSocket::bind(local_addr)?;
            socket.set_nonblocking(true)?;
            let socket = UdpSocket::from_std(socket)?;
            info!("bound UDP socket to {:?}", socket.local_addr()?);
            Ok(Transport::Udp(socket))
        }
    }

    /// A connection reports its own creation, and whoever reacts to that event finds it through
    ///  the registry. The registry lock is held from start to insert so that nobody can see the
    ///  event without seeing the connection.
    fn start_and_register(&self, key: ConnectionKey, transport: Transport) -> Arc<Connection> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.registry.lock().unwrap();
        let connection = Connection::start(key, id, transport, self.ctx.clone(), &self.root_cancel, &self.runtime);
        if let Some(previous) = registry.insert(key, connection.clone()) {
            debug!("connection {} replaces an existing connection", key);
            self.teardown_in_background(previous);
        }
        connection
    }

    fn register_accepted(&self, port: u16, stream: TcpStream, peer: SocketAddrV4) {
        if self.config.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("could not set TCP_NODELAY: {}", e);
            }
        }

        let key = ConnectionKey::tcp(port, peer);
        debug!("accepted connection {}", key);
        self.start_and_register(key, Transport::TcpAccepted(stream));
    }

    fn remove_if_same(&self, connection: &Arc<Connection>) -> bool {
        let mut registry = self.registry.lock().unwrap();
        match registry.get(&connection.key()) {
            Some(registered) if registered.id() == connection.id() => {
                registry.remove(&connection.key());
                true
            }
            _ => false,
        }
    }

    fn teardown_in_background(&self, connection: Arc<Connection>) {
        let teardown_timeout = self.config.teardown_timeout;
        self.runtime.spawn(async move {
            connection.teardown(teardown_timeout).await;
        });
    }

    async fn stop_listener(&self, listener: Listener) {
        debug!("stopping listener on port {}", listener.port);
        listener.cancel.cancel();

        let mut task = listener.task;
        match timeout(self.config.teardown_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("listener terminated abnormally: {}", e),
            Err(_) => {
                warn!("listener did not terminate in time - aborting");
                task.abort();
            }
        }
    }
}

async fn accept_loop(inner: Weak<Inner>, listener: TcpListener, port: u16, cancel: CancellationToken) {
    loop {
        let accepted = select! {
            biased;
            _ = cancel.cancelled() => break,
            r = listener.accept() => r,
        };

        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };

        match accepted {
            Ok((stream, SocketAddr::V4(peer))) => inner.register_accepted(port, stream, peer),
            Ok((_, peer)) => debug!("ignoring connection from non-IPv4 peer {}", peer),
            Err(e) => {
                error!("error accepting connection: {}", e);
                drop(inner);
                // e.g. running out of file descriptors: give the system some time to recover
                select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        }
    }
    info!("stopped listening");
}

/// Deliver inbound messages and events to the handler. Deliveries for a connection are keyed to
///  the same worker so they arrive in order.
async fn dispatch_loop(
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    handler: Arc<dyn RelayHandler>,
    pool: Arc<WorkerPool>,
    batch_size: usize,
    cancel: CancellationToken,
) {
    let mut batch = Vec::with_capacity(batch_size);
    loop {
        let num_received = select! {
            biased;
            _ = cancel.cancelled() => break,
            n = inbound.recv_many(&mut batch, batch_size) => n,
        };
        if num_received == 0 {
            break;
        }

        trace!("dispatching {} inbound items", num_received);
        for item in batch.drain(..) {
            schedule_delivery(&pool, &handler, item);
        }
    }

    while let Ok(item) = inbound.try_recv() {
        schedule_delivery(&pool, &handler, item);
    }
    debug!("dispatcher finished");
}

fn schedule_delivery(pool: &WorkerPool, handler: &Arc<dyn RelayHandler>, item: Inbound) {
    let handler = handler.clone();
    match item {
        Inbound::Message(key, msg) => {
            pool.execute_keyed(&key, move || handler.on_message(msg.into_bytes()));
        }
        Inbound::Event(event) => {
            if event.kind.is_failure() {
                info!("connection event: {}", event);
            }
            else {
                debug!("connection event: {}", event);
            }
            let key = event.key;
            pool.execute_keyed(&key, move || handler.on_event(event));
        }
    }
}

/// Remove connections that ended on their own (peer close, I/O failure) from the registry
async fn reap_loop(inner: Weak<Inner>, mut ended: mpsc::UnboundedReceiver<(ConnectionKey, u64)>, cancel: CancellationToken) {
    loop {
        let (key, id) = select! {
            biased;
            _ = cancel.cancelled() => break,
            e = ended.recv() => match e {
                Some(x) => x,
                None => break,
            },
        };

        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        let reaped = {
            let mut registry = inner.registry.lock().unwrap();
            match registry.get(&key) {
                Some(connection) if connection.id() == id => registry.remove(&key),
                _ => None,
            }
        };
        let teardown_timeout = inner.config.teardown_timeout;
        drop(inner);

        if let Some(connection) = reaped {
            debug!("reaping connection {}", key);
            connection.teardown(teardown_timeout).await;
        }
    }
}
