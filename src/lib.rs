//! Core library for the labrelay toolkit.
//!
//! This library contains the instrument buses, instrument sessions and the
//! TCP measurement relay (server, dispatcher and client). It is used by the
//! `labrelay` binary and by acquisition scripts that link it directly.

pub mod bus;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod output;
pub mod relay;
pub mod retry;
pub mod session;

pub use error::{RelayError, RelayResult};
