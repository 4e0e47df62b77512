use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::bail;

use crate::channel::duplex_channel::DuplexChannel;
use crate::message::wire_message::WireMessage;

pub struct RelayConfig {
    /// The local address sockets are bound to: the listening socket, UDP sockets and TCP client
    ///  sockets with a pinned source port. Use `0.0.0.0` to accept traffic on all interfaces,
    ///  or `127.0.0.1` to keep everything on the local machine.
    pub listen_addr_v4: Ipv4Addr,

    /// The number of workers delivering messages and events to the handler. Deliveries for a
    ///  single connection always go to the same worker, so this bounds the number of connections
    ///  whose deliveries can make progress concurrently.
    pub worker_pool_size: usize,

    /// The receive buffer of each UDP socket. Datagrams bigger than this are truncated by the
    ///  OS and subsequently dropped because their size field does not match.
    pub udp_receive_buffer_size: usize,

    /// Upper bound for a message arriving on a TCP stream. A bigger size field means the stream
    ///  is out of sync or hostile, and it is abandoned.
    pub max_message_size: u32,

    /// The maximum number of inbound messages and events the dispatcher takes from its queue
    ///  before scheduling them
    pub dispatch_batch_size: usize,

    /// How long teardown waits for a connection's tasks before aborting them
    pub teardown_timeout: Duration,

    pub tcp_nodelay: bool,

    /// Size of the shared memory region between the relay and the UI, covering both directions
    pub channel_size: usize,
}

impl RelayConfig {
    pub fn default_ipv4() -> RelayConfig {
        RelayConfig {
            listen_addr_v4: Ipv4Addr::UNSPECIFIED,
            worker_pool_size: 4,
            udp_receive_buffer_size: 64 * 1024,
            max_message_size: 16 * 1024 * 1024,
            dispatch_batch_size: 64,
            teardown_timeout: Duration::from_secs(2),
            tcp_nodelay: true,
            channel_size: 10 * 1024 * 1024,
        }
    }

    /// everything bound to the loopback interface only
    pub fn localhost() -> RelayConfig {
        RelayConfig {
            listen_addr_v4: Ipv4Addr::LOCALHOST,
            ..Self::default_ipv4()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_pool_size == 0 || self.worker_pool_size > 64 {
            bail!("worker pool size must be between 1 and 64, was {}", self.worker_pool_size);
        }
        if self.udp_receive_buffer_size < WireMessage::TRANSPORT_HEADER_LEN {
            bail!("UDP receive buffer of {} bytes cannot hold a message header", self.udp_receive_buffer_size);
        }
        if (self.max_message_size as usize) < WireMessage::HEADER_LEN {
            bail!("max message size {} is smaller than the message header", self.max_message_size);
        }
        if self.dispatch_batch_size == 0 {
            bail!("dispatch batch size must be positive");
        }
        if self.teardown_timeout.is_zero() {
            bail!("teardown timeout must be positive");
        }
        if self.channel_size < DuplexChannel::MIN_REGION_LEN {
            bail!("channel size {} is too small for two ring buffers", self.channel_size);
        }
        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::default_ipv4()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_smallest_valid_channel_is_usable() {
        let config = RelayConfig { channel_size: DuplexChannel::MIN_REGION_LEN, ..RelayConfig::localhost() };
        config.validate().unwrap();

        let (_relay_side, mut ui_side) = DuplexChannel::pair(config.channel_size).unwrap();
        assert_eq!(ui_side.read_next(), Ok(None));
    }

    #[test]
    fn test_defaults_are_valid() {
        RelayConfig::default_ipv4().validate().unwrap();
        RelayConfig::localhost().validate().unwrap();
    }

    #[rstest]
    #[case::no_workers(RelayConfig { worker_pool_size: 0, ..RelayConfig::default_ipv4() })]
    #[case::too_many_workers(RelayConfig { worker_pool_size: 65, ..RelayConfig::default_ipv4() })]
    #[case::tiny_udp_buffer(RelayConfig { udp_receive_buffer_size: 4, ..RelayConfig::default_ipv4() })]
    #[case::tiny_max_message(RelayConfig { max_message_size: 16, ..RelayConfig::default_ipv4() })]
    #[case::no_batch(RelayConfig { dispatch_batch_size: 0, ..RelayConfig::default_ipv4() })]
    #[case::no_timeout(RelayConfig { teardown_timeout: Duration::ZERO, ..RelayConfig::default_ipv4() })]
    #[case::tiny_channel(RelayConfig { channel_size: 25, ..RelayConfig::default_ipv4() })]
    #[case::channel_without_room_for_a_message(RelayConfig { channel_size: 26, ..RelayConfig::default_ipv4() })]
    fn test_invalid(#[case] config: RelayConfig) {
        assert!(config.validate().is_err());
    }
}
