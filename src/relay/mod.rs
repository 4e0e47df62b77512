pub mod connection_key;
pub mod relay_events;
pub mod relay_handler;
pub mod multiplexer;
pub(crate) mod connection;
