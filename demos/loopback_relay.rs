use clap::Parser;
use shm_relay::channel::bridge::{ChannelBridge, PeerNotifier, DATA_READY};
use shm_relay::channel::duplex_channel::DuplexChannel;
use shm_relay::config::RelayConfig;
use shm_relay::message::wire_message::WireMessage;
use shm_relay::relay::multiplexer::Multiplexer;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::select;
use tokio::sync::Notify;
use tracing::{info, warn, Level};

/// Runs the relay with a simulated UI on the other end of the shared channel. The UI answers
///  every inbound message by sending its payload back to where it came from, which makes the relay
///  a TCP and UDP echo server.
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 7000)]
    port: u16,

    #[clap(long, default_value_t = Ipv4Addr::LOCALHOST)]
    bind: Ipv4Addr,

    #[clap(long, default_value_t = 1024 * 1024)]
    channel_size: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

struct NotifyUi(Arc<Notify>);

impl PeerNotifier for NotifyUi {
    fn data_ready(&self) {
        self.0.notify_one();
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let config = RelayConfig {
        listen_addr_v4: args.bind,
        channel_size: args.channel_size,
        ..RelayConfig::default_ipv4()
    };
    let config = Arc::new(config);

    let (relay_side, ui_side) = DuplexChannel::pair(config.channel_size)?;
    relay_side.initialize();

    let ui_notify = Arc::new(Notify::new());
    let bridge = ChannelBridge::new(relay_side, Arc::new(NotifyUi(ui_notify.clone())));
    let handler = bridge.handler(|event| info!("event: {}", event));
    let multiplexer = Multiplexer::new(config, Arc::new(handler))?;
    bridge.start_pump(Arc::new(multiplexer.clone()))?;

    let port = multiplexer.start_listening(args.port).await?;
    info!("relay listening on {}:{}", args.bind, port);

    let result = select! {
        r = run_ui(ui_side, ui_notify, bridge.clone()) => r,
        r = tokio::signal::ctrl_c() => {
            info!("shutting down");
            r.map_err(anyhow::Error::from)
        }
    };

    bridge.shutdown().await;
    multiplexer.close().await;
    result
}

/// The UI's side of the channel: echo every message back to its sender
async fn run_ui(mut channel: DuplexChannel, data_ready: Arc<Notify>, bridge: Arc<ChannelBridge>) -> anyhow::Result<()> {
    loop {
        data_ready.notified().await;

        let mut num_replies = 0;
        while let Some(raw) = channel.read_next()? {
            let inbound = WireMessage::parse(&raw)?;
            info!("UI received {:?}: {:?}", inbound, String::from_utf8_lossy(inbound.payload()));

            let mut reply = WireMessage::parse(&raw)?;
            reply.set_src(inbound.dst());
            reply.set_dst(inbound.src());
            match channel.write_message(reply.as_bytes()) {
                Ok(_) => num_replies += 1,
                Err(e) => warn!("UI could not send reply: {}", e),
            }
        }
        if num_replies > 0 {
            bridge.on_notification(DATA_READY);
        }
    }
}
