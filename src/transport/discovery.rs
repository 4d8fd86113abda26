//! Service discovery: pick the lowest-latency instance of a service type

use super::http::api_url;
use crate::config::{ServiceAddr, Timings};
use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use udpu_shared::ServiceInstance;

/// Discover `service_type`, retrying until found or `token` is cancelled
pub async fn discover(
    discovery: &ServiceAddr,
    service_type: &str,
    timings: &Timings,
    token: &CancellationToken,
) -> Option<ServiceAddr> {
    let http = match reqwest::Client::builder()
        .timeout(timings.health_timeout)
        .build()
    {
        Ok(http) => http,
        Err(e) => {
            error!("Failed to build discovery client: {}", e);
            return None;
        }
    };

    loop {
        match discover_once(&http, discovery, service_type).await {
            Ok(Some(addr)) => {
                info!("Discovered {}: {}", service_type, addr);
                return Some(addr);
            }
            Ok(None) => info!("No {} discovered, retrying...", service_type),
            Err(e) => info!("Server discovery error for {}: {:#}", service_type, e),
        }

        tokio::select! {
            _ = token.cancelled() => return None,
            _ = tokio::time::sleep(timings.discovery_retry) => {}
        }
    }
}

/// One discovery round: list candidates, health-check each, keep the fastest
async fn discover_once(
    http: &reqwest::Client,
    discovery: &ServiceAddr,
    service_type: &str,
) -> Result<Option<ServiceAddr>> {
    let mut url = api_url(discovery, "http", &["services"])?;
    url.query_pairs_mut().append_pair("service_type", service_type);
    debug!("Requesting server list from: {}", url);

    let resp = http.get(url).send().await.context("can't get list of servers")?;
    if !resp.status().is_success() {
        bail!("discovery service returned {}", resp.status());
    }
    let candidates: Vec<ServiceInstance> = resp.json().await.context("invalid server list")?;

    let mut best: Option<(ServiceAddr, Duration)> = None;
    for candidate in candidates {
        let addr = ServiceAddr::new(candidate.host, candidate.port);
        let health = api_url(&addr, "http", &["health"])?;

        let start = Instant::now();
        if let Err(e) = http.get(health).send().await {
            debug!("Skipping unreachable {}: {}", addr, e);
            continue;
        }
        let elapsed = start.elapsed();

        if best.as_ref().map_or(true, |(_, fastest)| elapsed < *fastest) {
            debug!("Current best: {}, time: {:?}", addr, elapsed);
            best = Some((addr, elapsed));
        }
    }

    Ok(best.map(|(addr, _)| addr))
}
