//! Persisted record types and their partial-update patches

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use udpu_shared::{
    flag_is_true, flag_is_unlocked, parse_software_list, DeviceDescriptor, Frequency,
    JobDefinition, QueueDefinition,
};

/// On-disk layout: one client, jobs by name, queues by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreData {
    pub client: ClientRecord,
    pub jobs: BTreeMap<String, JobRecord>,
    pub queues: BTreeMap<String, QueueRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientRecord {
    pub name: String,
    pub client_frequency: String,
    pub boot_status: String,
    pub udpu_upstream_qos: String,
    pub udpu_downstream_qos: String,
    pub udpu_hostname: String,
    pub udpu_location: String,
    pub udpu_role: String,
    pub udpu_secret_key: String,
}

impl ClientRecord {
    /// A client exists once it has a name (or, for older files, a hostname)
    pub fn exists(&self) -> bool {
        !self.name.is_empty() || !self.udpu_hostname.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobRecord {
    pub name: String,
    pub command: String,
    pub frequency: String,
    pub locked: String,
    pub require_output: String,
    pub required_software: String,
    pub job_type: String,
    pub vbuser_id: String,
}

impl JobRecord {
    pub fn frequency(&self) -> Frequency {
        Frequency::parse(&self.frequency)
    }

    pub fn is_unlocked(&self) -> bool {
        flag_is_unlocked(Some(&self.locked))
    }

    pub fn requires_output(&self) -> bool {
        flag_is_true(Some(&self.require_output))
    }

    pub fn required_software(&self) -> Vec<String> {
        parse_software_list(Some(&self.required_software))
    }

    pub fn vbuser_id(&self) -> Option<&str> {
        Some(self.vbuser_id.trim()).filter(|id| !id.is_empty())
    }

    pub fn apply(&mut self, patch: &JobPatch) {
        set(&mut self.command, &patch.command);
        set(&mut self.frequency, &patch.frequency);
        set(&mut self.locked, &patch.locked);
        set(&mut self.require_output, &patch.require_output);
        set(&mut self.required_software, &patch.required_software);
        set(&mut self.job_type, &patch.job_type);
        set(&mut self.vbuser_id, &patch.vbuser_id);
    }
}

impl From<&JobDefinition> for JobRecord {
    fn from(definition: &JobDefinition) -> Self {
        let mut job = JobRecord {
            name: definition.name.clone(),
            ..Default::default()
        };
        job.apply(&JobPatch::from(definition));
        job
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueRecord {
    pub name: String,
    pub description: String,
    /// Comma-list of job names
    pub queue: String,
    pub role: String,
    pub require_output: String,
    pub frequency: String,
    pub locked: String,
}

impl QueueRecord {
    pub fn frequency(&self) -> Frequency {
        Frequency::parse(&self.frequency)
    }

    pub fn apply(&mut self, patch: &QueuePatch) {
        set(&mut self.description, &patch.description);
        set(&mut self.queue, &patch.jobs);
        set(&mut self.role, &patch.role);
        set(&mut self.require_output, &patch.require_output);
        set(&mut self.frequency, &patch.frequency);
        set(&mut self.locked, &patch.locked);
    }
}

/// Fields present in a job update; `None` leaves the stored value untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPatch {
    pub command: Option<String>,
    pub frequency: Option<String>,
    pub locked: Option<String>,
    pub require_output: Option<String>,
    pub required_software: Option<String>,
    pub job_type: Option<String>,
    pub vbuser_id: Option<String>,
}

impl From<&JobDefinition> for JobPatch {
    fn from(job: &JobDefinition) -> Self {
        Self {
            command: job.command.clone(),
            frequency: job.frequency.clone(),
            locked: job.locked.clone(),
            require_output: job.require_output.clone(),
            required_software: job.required_software.clone(),
            job_type: job.job_type.clone(),
            vbuser_id: job.vbuser_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueuePatch {
    pub description: Option<String>,
    pub jobs: Option<String>,
    pub role: Option<String>,
    pub require_output: Option<String>,
    pub frequency: Option<String>,
    pub locked: Option<String>,
}

impl From<&QueueDefinition> for QueuePatch {
    fn from(queue: &QueueDefinition) -> Self {
        Self {
            description: queue.description.clone(),
            jobs: queue.jobs.clone(),
            role: queue.role.clone(),
            require_output: queue.require_output.clone(),
            frequency: queue.frequency.clone(),
            locked: queue.locked.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientPatch {
    pub name: Option<String>,
    pub boot_status: Option<String>,
    pub upstream_qos: Option<String>,
    pub downstream_qos: Option<String>,
    pub hostname: Option<String>,
    pub location: Option<String>,
    pub role: Option<String>,
    pub secret_key: Option<String>,
}

impl ClientPatch {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Mirror the descriptor's identity and attributes
    pub fn from_descriptor(descriptor: &DeviceDescriptor, boot_status: &str) -> Self {
        Self {
            name: Some(descriptor.subscriber_uid.clone()),
            boot_status: Some(boot_status.to_string()),
            upstream_qos: Some(descriptor.upstream_qos.clone()),
            downstream_qos: Some(descriptor.downstream_qos.clone()),
            hostname: Some(descriptor.hostname.clone()),
            location: Some(descriptor.location.clone()),
            role: Some(descriptor.role.clone()),
            secret_key: None,
        }
    }
}

impl ClientRecord {
    pub fn apply(&mut self, patch: &ClientPatch) {
        set(&mut self.name, &patch.name);
        set(&mut self.boot_status, &patch.boot_status);
        set(&mut self.udpu_upstream_qos, &patch.upstream_qos);
        set(&mut self.udpu_downstream_qos, &patch.downstream_qos);
        set(&mut self.udpu_hostname, &patch.hostname);
        set(&mut self.udpu_location, &patch.location);
        set(&mut self.udpu_role, &patch.role);
        set(&mut self.udpu_secret_key, &patch.secret_key);
    }
}

fn set(field: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        field.clone_from(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_fields_untouched() {
        let mut job = JobRecord {
            name: "ping".into(),
            command: "echo hi".into(),
            frequency: "15".into(),
            locked: "false".into(),
            ..Default::default()
        };

        job.apply(&JobPatch {
            command: Some("echo bye".into()),
            ..Default::default()
        });

        assert_eq!(job.command, "echo bye");
        assert_eq!(job.frequency, "15");
        assert_eq!(job.locked, "false");
    }

    #[test]
    fn test_job_flags() {
        let job = JobRecord {
            locked: "false".into(),
            require_output: "true".into(),
            required_software: "none".into(),
            vbuser_id: "  ".into(),
            ..Default::default()
        };
        assert!(job.is_unlocked());
        assert!(job.requires_output());
        assert!(job.required_software().is_empty());
        assert_eq!(job.vbuser_id(), None);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<StoreData, _> =
            serde_json::from_str(r#"{"client":{},"jobs":{},"queues":{},"extra":1}"#);
        assert!(result.is_err());

        let result: Result<StoreData, _> =
            serde_json::from_str(r#"{"client":{"name":"a","bogus":"b"}}"#);
        assert!(result.is_err());
    }
}
