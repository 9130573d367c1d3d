// twsgate/src/lib.rs
// Main entry point for the gateway runtime library

//! # twsgate
//!
//! Client-side runtime for TWS / IB Gateway sessions that turns the gateway's
//! callback stream into blocking request/response calls:
//!
//! - Per result-type request trackers with exactly-once resolution
//! - Bounded waits with timeout cleanup of late events
//! - Connection state machine with automatic, schedule-driven reconnection
//! - Atomic order id reservation for bracket orders
//!
//! The wire protocol is behind the [`session::GatewaySession`] trait;
//! [`session_mock::MockSession`] is a scripted in-process implementation.

mod base;
pub mod account;
pub mod config;
pub mod connection;
pub mod contract;
pub mod data;
pub mod dispatcher;
pub mod order;
pub mod order_ids;
pub mod session;
pub mod session_mock;
pub mod tracker;

pub use base::{GatewayError, GatewayErrorReport};
pub use config::GatewayConfig;
pub use connection::{ConnectionManager, ConnectionState};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
