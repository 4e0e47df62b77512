pub mod shared_buffer;
pub mod duplex_channel;
pub mod bridge;
