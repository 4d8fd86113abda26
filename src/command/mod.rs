//! Job execution for the device runtime
//!
//! This module handles:
//! - Decoding job and queue messages from the push channel
//! - Running job commands through the shell
//! - Periodic scheduling of stored jobs
//! - Boot-time job processing

mod executor;
pub mod handlers;
pub mod scheduler;
pub mod shell;

pub use executor::{CommandResult, JobExecutor};
pub use scheduler::JobScheduler;
