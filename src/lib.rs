//! A user-space network relay for a UI that cannot open sockets itself: the UI exchanges framed
//!  wire messages with the relay over a shared memory channel, and the relay maps each distinct
//!  routing tuple to a real TCP or UDP connection.

pub mod config;
pub mod error;
pub mod message;
pub mod channel;
pub mod relay;
pub mod util;
pub mod test_util;
