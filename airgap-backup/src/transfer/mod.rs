//! Byte movement between sources, payload files and destinations.

pub mod progress;
pub mod stream;
