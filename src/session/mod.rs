//! Instrument sessions
//!
//! A session resets an instrument, pushes the configuration for one
//! [`MeasurementProfile`], and performs blocking acquisitions
//! (initiate, wait for operation complete, fetch).

pub mod instrument_session;
pub mod options;
pub mod profile;

pub use instrument_session::{parse_samples, InstrumentSession};
pub use options::{Coupling, Impedance, MeasurementOptions, Slope};
pub use profile::MeasurementProfile;
