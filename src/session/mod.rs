//! Registered runtime of the device
//!
//! Once the device has an identity the supervisor brings up the tunnel,
//! the push channel, the status heartbeat and boot job processing.

mod heartbeat;
mod supervisor;

pub use heartbeat::spawn_status_heartbeat;
pub use supervisor::SessionSupervisor;
