//! Core parley library (buffer, transcript extraction, transports, rendering).

pub mod buffer;
pub mod config;
pub mod filters;
pub mod logging;
pub mod markup;
pub mod playback;
pub mod request;
pub mod session;
pub mod transcript;
pub mod transport;
