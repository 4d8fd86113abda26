//! HTTP client for the control-plane and repository services

use crate::config::{Endpoints, ServiceAddr};
use anyhow::{anyhow, bail, Context, Result};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use udpu_shared::{
    ArtifactLocation, DeviceDescriptor, JobDefinition, JobLog, PeerRegistration, StampData,
    StampRecord, StatusReport, UnregisteredDevice, API_VERSION,
};

/// Outcome of a first-boot stamp assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampSubmission {
    Accepted,
    /// The server answered 403: the MAC is already bound to another secret
    Duplicate,
}

/// Build `scheme://host:port/api/v1.0/<segments...>`, escaping each segment
pub fn api_url(addr: &ServiceAddr, scheme: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(&addr.base_url(scheme))
        .with_context(|| format!("invalid service address {}", addr))?;
    url.path_segments_mut()
        .map_err(|()| anyhow!("service address {} cannot carry a path", addr))?
        .clear()
        .extend(["api", API_VERSION])
        .extend(segments);
    Ok(url)
}

/// Typed wrapper over the control-plane REST API
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    endpoints: Endpoints,
}

impl ControlPlaneClient {
    pub fn new(endpoints: Endpoints, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, endpoints })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn server_url(&self, segments: &[&str]) -> Result<Url> {
        api_url(&self.endpoints.server, "http", segments)
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub async fn submit_stamp(&self, stamp: &StampData) -> Result<StampSubmission> {
        let resp = self
            .http
            .post(self.server_url(&["stamps"])?)
            .json(stamp)
            .send()
            .await?;

        if resp.status() == StatusCode::FORBIDDEN {
            return Ok(StampSubmission::Duplicate);
        }
        info!("Stamp POST response: {}", resp.status());
        Ok(StampSubmission::Accepted)
    }

    /// Server-recorded stamp for `mac`; `None` when the server has none to give
    pub async fn fetch_stamp(&self, mac: &str) -> Result<Option<String>> {
        let resp = self
            .http
            .get(self.server_url(&["stamps", mac])?)
            .send()
            .await?;

        if resp.status() != StatusCode::OK {
            warn!("Stamp lookup for {} returned {}", mac, resp.status());
            return Ok(None);
        }
        let record: StampRecord = resp.json().await.context("invalid stamp record")?;
        Ok(Some(record.body))
    }

    /// Device descriptor keyed by MAC; any non-200 status is an error
    pub async fn fetch_descriptor(&self, mac: &str, subscriber: &str) -> Result<DeviceDescriptor> {
        let mut url = self.server_url(&["adapter", mac, "udpu"])?;
        url.query_pairs_mut().append_pair("subscriber", subscriber);

        let resp = self.http.get(url).send().await?;
        if resp.status() != StatusCode::OK {
            bail!("unexpected HTTP status: {}", resp.status());
        }
        let descriptor: DeviceDescriptor = resp.json().await.context("invalid device descriptor")?;
        debug!("Device descriptor: {:?}", descriptor);
        Ok(descriptor)
    }

    // ========================================================================
    // Heartbeats
    // ========================================================================

    pub async fn send_status(&self, report: &StatusReport) -> Result<()> {
        self.post_json(&["udpu", "status"], report).await
    }

    pub async fn send_unregistered(&self, device: &UnregisteredDevice) -> Result<()> {
        self.post_json(&["unregistered_device"], device).await
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Jobs attached to a role, used on first boot
    pub async fn role_jobs(&self, role: &str) -> Result<Vec<JobDefinition>> {
        self.get_json(self.server_url(&["roles", role, "jobs"])?).await
    }

    pub async fn every_boot_jobs(&self) -> Result<Vec<JobDefinition>> {
        self.get_json(self.server_url(&["jobs", "frequency", "every_boot"])?)
            .await
    }

    /// Live definitions of the named jobs (comma-list)
    pub async fn filtered_jobs(&self, names: &str) -> Result<Vec<JobDefinition>> {
        let mut url = self.server_url(&["jobs", ""])?;
        url.query_pairs_mut().append_pair("filter_by", names);
        self.get_json(url).await
    }

    pub async fn send_job_log(&self, log: &JobLog) -> Result<()> {
        self.post_json(&["logs", "jobs"], log).await
    }

    /// Partial update of a subscriber resource
    pub async fn patch_vbuser(&self, vbuser_id: &str, fields: &BTreeMap<&str, String>) -> Result<()> {
        let resp = self
            .http
            .patch(self.server_url(&["vbuser", vbuser_id])?)
            .json(fields)
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("vbuser update returned {}", resp.status());
        }
        Ok(())
    }

    // ========================================================================
    // Tunnel
    // ========================================================================

    pub async fn register_peer(&self, peer: &PeerRegistration) -> Result<()> {
        let resp = self
            .http
            .post(self.server_url(&["wireguard", "peer", "add"])?)
            .json(peer)
            .send()
            .await?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("peer registration failed: {}", body);
        }
        Ok(())
    }

    // ========================================================================
    // Repository
    // ========================================================================

    /// Download URL for an artifact id; `None` if the repository has none
    pub async fn artifact_url(&self, id: &str) -> Result<Option<String>> {
        let url = api_url(&self.endpoints.repo, "http", &["repo", id])?;
        let location: ArtifactLocation = self.get_json(url).await?;
        Ok(location.url.filter(|u| !u.trim().is_empty()))
    }

    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.http.get(url).send().await?.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let resp = self.http.get(url.clone()).send().await?;
        if resp.status() != StatusCode::OK {
            bail!("GET {} returned {}", url, resp.status());
        }
        resp.json()
            .await
            .with_context(|| format!("invalid response body from {}", url))
    }

    async fn post_json<T: Serialize + ?Sized>(&self, segments: &[&str], body: &T) -> Result<()> {
        let url = self.server_url(segments)?;
        let resp = self.http.post(url.clone()).json(body).send().await?;
        if resp.status() != StatusCode::OK {
            info!("Received non-200 response for {}: {}", url.path(), resp.status());
        }
        Ok(())
    }
}
