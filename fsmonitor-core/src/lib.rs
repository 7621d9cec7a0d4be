//! Core functionality for fsmonitor
//!
//! This crate contains the file monitoring engine: change detection against
//! previously recorded state, real-time watching with debouncing, a bounded
//! event queue consumed by a rate-limited processing loop, and a
//! behavior-decorated processor chain, all orchestrated per monitored
//! location.

pub mod error;
pub mod monitor;
pub mod storage;
pub mod store;

pub use error::{MonitorError, Result};
pub use monitor::{FileEvent, EventType, LocationOptions, ScanContext};
