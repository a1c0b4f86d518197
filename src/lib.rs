//! Core library for the daq_fleet orchestrator.
//!
//! Drives a fleet of ECC device controllers through the shared
//! Idle → Described → Prepared → Ready → Running protocol, tracks the run
//! lifecycle of the active experiment and runs post-run bookkeeping on the
//! worker hosts. It is used by the `daq-fleet` binary and the integration
//! tests.

pub mod client;
pub mod config;
pub mod control;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod experiment;
pub mod export;
pub mod fleet;
pub mod ids;
pub mod inventory;
pub mod jobs;
pub mod log_capture;
pub mod logging;
pub mod orchestrator;
pub mod store;
pub mod topology;
pub mod worker;
