//! FleetNode device core.
//!
//! Firmware update and credential rotation agents for a fleet endpoint,
//! plus the event, state machine and pub/sub plumbing they share.  Every
//! module builds on host targets; ESP-IDF specifics are guarded by
//! `#[cfg(target_os = "espidf")]` inside the adapters.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod cert;
pub mod config;
pub mod error;
pub mod events;
pub mod fsm;
pub mod jobs;
pub mod mqtt;
pub mod ota;
pub mod patch;
pub mod pool;

pub use error::{Error, Result};
