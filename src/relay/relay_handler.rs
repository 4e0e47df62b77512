use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::relay::relay_events::ConnectionEvent;

/// The UI-facing side of the relay. Callbacks run on the worker pool, never on an I/O task, so
///  a slow implementation delays other deliveries but not socket traffic. Deliveries for a single
///  connection happen in order.
#[cfg_attr(test, automock)]
pub trait RelayHandler: Send + Sync + 'static {
    /// a complete wire message received on one of the connections, with source and destination
    ///  stamped in
    fn on_message(&self, message: Bytes);

    fn on_event(&self, event: ConnectionEvent);
}
