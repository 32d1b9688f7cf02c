//! Core library for the timelapse application.
//!
//! This library schedules a repeating two-phase microscopy time-lapse: every cycle runs
//! acquisition A1 then A2, each at its own remembered focus position, then waits out the
//! rest of a fixed interval. The microscope itself is reached through the
//! [`instrument::Microscope`] trait so vendor backends and the simulator plug in the same way.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod laser;
pub mod reaper;
pub mod scheduler;
pub mod session;
pub mod settings_store;
pub mod stopwatch;

pub use error::{AppResult, TimelapseError};
