//! uDPU Shared Protocol Types
//!
//! This crate provides the wire types, push-message codec and registration
//! state machine shared by the device agent and its tests.

pub mod codec;
pub mod state_machine;

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Public API version segment used in every control-plane path
pub const API_VERSION: &str = "v1.0";

/// MAC value the control plane returns until an identity has been assigned
pub const ZERO_MAC: &str = "00:00:00:00:00:00";

/// Sentinel meaning "this job needs no artifacts"
pub const NO_SOFTWARE: &str = "none";

/// Timing parameters for the agent lifecycle
pub mod timing {
    use std::time::Duration;

    /// Descriptor poll interval while the device is unregistered
    pub const DESCRIPTOR_POLL_INTERVAL: Duration = Duration::from_secs(5);

    /// Interval of the "unregistered device" heartbeat
    pub const UNREGISTERED_TICK_INTERVAL: Duration = Duration::from_secs(5);

    /// Interval of the "online" status heartbeat
    pub const STATUS_INTERVAL: Duration = Duration::from_secs(5);

    /// Delay before a push-channel reconnect attempt
    pub const PUSH_RECONNECT_DELAY: Duration = Duration::from_secs(5);

    /// Delay between discovery rounds
    pub const DISCOVERY_RETRY_DELAY: Duration = Duration::from_secs(5);

    /// Per-request timeout for control-plane HTTP calls
    pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

    /// Per-request timeout for discovery health checks
    pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

    /// WireGuard persistent keepalive
    pub const TUNNEL_KEEPALIVE: Duration = Duration::from_secs(25);
}

/// Client boot status values
pub mod boot_status {
    pub const FIRST_BOOT: &str = "first_boot";
    pub const EVERY_BOOT: &str = "every_boot";
}

/// Job/queue execution frequency.
///
/// Periodic values are minute counts from a fixed enumeration; everything
/// else is a sentinel or an unsupported value that is never auto-scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frequency {
    /// One of the periodic cadences, in minutes
    Every(u32),
    FirstBoot,
    EveryBoot,
    Once,
    /// Anything the agent does not know how to schedule
    Other(String),
}

impl Frequency {
    /// Minute cadences the scheduler accepts
    pub const PERIODIC_MINUTES: [u32; 4] = [1, 15, 60, 1440];

    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "first_boot" => Self::FirstBoot,
            "every_boot" => Self::EveryBoot,
            "once" => Self::Once,
            other => match other.parse::<u32>() {
                Ok(minutes) if Self::PERIODIC_MINUTES.contains(&minutes) => Self::Every(minutes),
                _ => Self::Other(other.to_string()),
            },
        }
    }

    /// Scheduling period, `None` for sentinels and unsupported values
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Every(minutes) => Some(Duration::from_secs(u64::from(*minutes) * 60)),
            _ => None,
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.period().is_some()
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frequency::Every(minutes) => write!(f, "{}", minutes),
            Frequency::FirstBoot => write!(f, "first_boot"),
            Frequency::EveryBoot => write!(f, "every_boot"),
            Frequency::Once => write!(f, "once"),
            Frequency::Other(value) => write!(f, "{}", value),
        }
    }
}

/// Flags travel as strings; only the literal `"true"` sets one.
pub fn flag_is_true(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some(v) if v.eq_ignore_ascii_case("true"))
}

/// A job or queue runs only when `locked` is exactly `"false"`.
pub fn flag_is_unlocked(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some(v) if v.eq_ignore_ascii_case("false"))
}

/// Split a comma-list of artifact ids, honouring the "none" sentinel.
pub fn parse_software_list(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    if value.trim().eq_ignore_ascii_case(NO_SOFTWARE) {
        return Vec::new();
    }
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

/// Control-plane description of this device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDescriptor {
    pub subscriber_uid: String,
    pub location: String,
    pub mac_address: String,
    pub role: String,
    pub upstream_qos: String,
    pub downstream_qos: String,
    pub hostname: String,

    /// Server WireGuard public key
    pub wg_server_public_key: String,
    /// Tunnel interface name, `wg0` when empty
    pub wg_interface: String,
    /// Server tunnel address in CIDR form, e.g. `10.66.0.2/31`
    pub wg_server_ip: String,
    pub wg_server_port: String,
    /// Address assigned to this device in CIDR form
    pub wg_client_ip: String,
    /// Extra comma-separated networks routed through the tunnel
    pub wg_routes: String,
    pub wg_allowed_ips: String,
    /// Public endpoint host of the server peer
    pub endpoint: String,
}

impl DeviceDescriptor {
    /// True while the control plane has not assigned an identity yet
    pub fn is_placeholder(&self) -> bool {
        self.mac_address.trim().eq_ignore_ascii_case(ZERO_MAC)
    }
}

/// Job definition as sent by the control plane.
///
/// Every field except `name` is optional so that a partial definition only
/// touches the fields it carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_software: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vbuser_id: Option<String>,
}

impl JobDefinition {
    pub fn is_unlocked(&self) -> bool {
        flag_is_unlocked(self.locked.as_deref())
    }

    pub fn requires_output(&self) -> bool {
        flag_is_true(self.require_output.as_deref())
    }

    pub fn required_software(&self) -> Vec<String> {
        parse_software_list(self.required_software.as_deref())
    }
}

/// Queue definition as sent by the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Comma-list of job names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<String>,
}

impl QueueDefinition {
    pub fn is_unlocked(&self) -> bool {
        flag_is_unlocked(self.locked.as_deref())
    }
}

/// Inbound push-channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
    Job(JobDefinition),
    Queue(QueueDefinition),
}

/// Outbound push-channel message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub response: String,
}

/// First-boot stamp assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampData {
    pub mac_address: String,
    pub body: String,
}

/// Stamp recorded by the server for a MAC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampRecord {
    pub body: String,
}

/// Status heartbeat payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub subscriber_uid: String,
    pub state: String,
    pub status: String,
}

/// Heartbeat payload for devices without an assigned identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisteredDevice {
    pub subscriber_uid: String,
    pub last_call_home_dt: String,
    pub ip_address: String,
}

/// Execution record posted to the log sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLog {
    pub client: String,
    pub name: String,
    pub command: String,
    pub std_out: String,
    pub std_err: String,
    pub status_code: String,
    pub timestamp: String,
}

/// Tunnel peer registration payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRegistration {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
}

/// Repository lookup result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    #[serde(default)]
    pub url: Option<String>,
}

/// Entry returned by the discovery service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub host: String,
    #[serde(deserialize_with = "port_from_string_or_number")]
    pub port: u16,
    #[serde(default)]
    pub service_type: String,
}

fn port_from_string_or_number<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}
