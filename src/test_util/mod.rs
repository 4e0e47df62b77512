//! Utilities for testing code that uses the relay. They are used by the crate's own tests, but
//!  they are also exported for application testing, which is why they are part of the regular
//!  (non-#[cfg(test)]) code.

pub mod endpoint;
pub mod recording_handler;
