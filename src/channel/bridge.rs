use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn, Instrument};

use crate::channel::duplex_channel::{ChannelReader, ChannelWriter, DuplexChannel};
use crate::error::{ChannelError, RelayError};
use crate::relay::multiplexer::Multiplexer;
use crate::relay::connection_key::ConnectionKey;
use crate::relay::relay_events::{AdminCommand, ConnectionEvent};
use crate::relay::relay_handler::RelayHandler;

/// The out-of-band signal telling the UI side that there is data in the channel for it
#[cfg_attr(test, automock)]
pub trait PeerNotifier: Send + Sync + 'static {
    fn data_ready(&self);
}

/// Where the bridge sends messages and admin commands it receives from the UI. This is the
///  multiplexer, and a seam for testing the bridge in isolation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OutboundSink: Send + Sync + 'static {
    fn send(&self, raw: &[u8]) -> Result<(), RelayError>;
    fn create_connection(&self, key: ConnectionKey) -> Result<(), RelayError>;
    async fn remove_connection(&self, key: ConnectionKey) -> Result<(), RelayError>;
}

#[async_trait]
impl OutboundSink for Multiplexer {
    fn send(&self, raw: &[u8]) -> Result<(), RelayError> {
        Multiplexer::send(self, raw)
    }

    fn create_connection(&self, key: ConnectionKey) -> Result<(), RelayError> {
        Multiplexer::create_connection(self, key)
    }

    async fn remove_connection(&self, key: ConnectionKey) -> Result<(), RelayError> {
        Multiplexer::remove_connection(self, key).await
    }
}

/// The relay's end of the shared memory channel: a pump task reads the UI's messages from the
///  channel whenever the UI signals "data ready" and passes them to an [OutboundSink], and
///  inbound messages are written into the channel with [ChannelBridge::deliver].
///
/// The UI's other out-of-band notifications are admin commands (see [AdminCommand]). The pump
///  executes them in the order they arrive, interleaved with draining the channel.
///
/// The multiplexer needs the bridge's [BridgeHandler] and the pump needs the multiplexer, so the
///  pump is started separately after both exist.
pub struct ChannelBridge {
    writer: Mutex<ChannelWriter>,
    reader: Mutex<Option<ChannelReader>>,
    notifier: Arc<dyn PeerNotifier>,
    data_ready: Arc<Notify>,
    admin_send: mpsc::UnboundedSender<AdminCommand>,
    admin_recv: Mutex<Option<mpsc::UnboundedReceiver<AdminCommand>>>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelBridge {
    pub fn new(channel: DuplexChannel, notifier: Arc<dyn PeerNotifier>) -> Arc<ChannelBridge> {
        let (writer, reader) = channel.split();
        let (admin_send, admin_recv) = mpsc::unbounded_channel();
        Arc::new(ChannelBridge {
            writer: Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            notifier,
            data_ready: Default::default(),
            admin_send,
            admin_recv: Mutex::new(Some(admin_recv)),
            cancel: CancellationToken::new(),
            pump: Mutex::new(None),
        })
    }

    pub fn start_pump(&self, sink: Arc<dyn OutboundSink>) -> anyhow::Result<()> {
        let runtime = Handle::try_current()
            .map_err(|_| RelayError::NoRuntime)?;
        let (reader, admin_recv) = match (self.reader.lock().unwrap().take(), self.admin_recv.lock().unwrap().take()) {
            (Some(reader), Some(admin_recv)) => (reader, admin_recv),
            _ => anyhow::bail!("the pump is already running"),
        };

        let task = runtime.spawn(
            pump_loop(reader, admin_recv, sink, self.data_ready.clone(), self.cancel.clone())
                .instrument(tracing::debug_span!("channel_pump"))
        );
        *self.pump.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Called by the host when the UI signals that it wrote to the channel
    pub fn data_ready(&self) {
        self.data_ready.notify_one();
    }

    /// Called by the host for every out-of-band notification from the UI: `dataReady` or an
    ///  admin command. Returns `false` for anything else, which the host may handle itself.
    pub fn on_notification(&self, notification: &str) -> bool {
        if notification == DATA_READY {
            self.data_ready();
            return true;
        }

        match AdminCommand::from_str(notification) {
            Ok(command) => {
                debug!("admin command from the UI: {:?}", command);
                if self.admin_send.send(command).is_err() {
                    warn!("channel pump is gone, dropping {:?}", command);
                }
                true
            }
            Err(e) => {
                debug!("not a relay notification: {:?}: {}", notification, e);
                false
            }
        }
    }

    /// Write an inbound message into the channel and signal the UI. A message that does not fit
    ///  is rejected as a whole.
    pub fn deliver(&self, msg: &[u8]) -> Result<(), ChannelError> {
        self.writer.lock().unwrap()
            .write_message(msg)?;
        self.notifier.data_ready();
        Ok(())
    }

    pub fn available_to_write(&self) -> usize {
        self.writer.lock().unwrap().available_to_write()
    }

    /// A [RelayHandler] that delivers inbound messages through this bridge and passes events
    ///  on to `on_event`
    pub fn handler(self: &Arc<Self>, on_event: impl Fn(ConnectionEvent) + Send + Sync + 'static) -> BridgeHandler {
        BridgeHandler {
            bridge: self.clone(),
            on_event: Box::new(on_event),
        }
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let pump = self.pump.lock().unwrap().take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!("channel pump terminated abnormally: {}", e);
            }
        }
    }
}

/// The notification the UI sends after writing to the channel
pub const DATA_READY: &str = "dataReady";

async fn pump_loop(mut reader: ChannelReader, mut admin_recv: mpsc::UnboundedReceiver<AdminCommand>, sink: Arc<dyn OutboundSink>, data_ready: Arc<Notify>, cancel: CancellationToken) {
    debug!("starting channel pump");
    loop {
        // drain first: the UI may have written before the pump started
        match drain(&mut reader, sink.as_ref()) {
            Ok(0) => {}
            Ok(n) => trace!("relayed {} messages from the channel", n),
            Err(e) => {
                error!("shared channel is unusable, stopping the pump: {}", e);
                break;
            }
        }

        select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(command) = admin_recv.recv() => execute(command, sink.as_ref()).await,
            _ = data_ready.notified() => {}
        }
    }
    debug!("channel pump finished");
}

async fn execute(command: AdminCommand, sink: &dyn OutboundSink) {
    // the outcome reaches the UI as a connection event
    let result = match command {
        AdminCommand::Create(key) => sink.create_connection(key),
        AdminCommand::Remove(key) => sink.remove_connection(key).await,
    };
    if let Err(e) = result {
        debug!("{:?} failed: {}", command, e);
    }
}

fn drain(reader: &mut ChannelReader, sink: &dyn OutboundSink) -> Result<usize, ChannelError> {
    let mut num_relayed = 0;
    while let Some(msg) = reader.read_next()? {
        // failures are reported to the UI as connection events by the multiplexer
        if let Err(e) = sink.send(&msg) {
            debug!("message from the channel was not relayed: {}", e);
        }
        num_relayed += 1;
    }
    Ok(num_relayed)
}

pub struct BridgeHandler {
    bridge: Arc<ChannelBridge>,
    on_event: Box<dyn Fn(ConnectionEvent) + Send + Sync>,
}

impl RelayHandler for BridgeHandler {
    fn on_message(&self, message: Bytes) {
        if let Err(e) = self.bridge.deliver(&message) {
            warn!("dropping inbound message of {} bytes: {}", message.len(), e);
        }
    }

    fn on_event(&self, event: ConnectionEvent) {
        (self.on_event)(event);
    }
}
