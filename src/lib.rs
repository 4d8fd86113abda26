//! uDPU device agent
//!
//! Core functionality of the agent:
//! - Crash-safe persistent store for the client, jobs and queues
//! - Control-plane discovery and device registration
//! - Push-channel session with status heartbeats
//! - Job and queue execution with periodic scheduling
//! - Software artifact retrieval and WireGuard tunnel setup

pub mod agent;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod probe;
pub mod registration;
pub mod session;
pub mod shutdown;
pub mod software;
pub mod state;
pub mod store;
pub mod transport;
pub mod tunnel;
