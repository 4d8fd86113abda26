//! Push-channel connection management
//!
//! This module handles:
//! - The persistent WebSocket connection to the control plane
//! - Fixed-delay reconnection until shutdown
//! - Delivering inbound messages as events and outbound responses in order

mod manager;

pub use manager::{PushChannel, PushConfig, PushEvent, PushSender};
