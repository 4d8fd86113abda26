//! Periodic "online" status report

use crate::transport::ControlPlaneClient;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use udpu_shared::StatusReport;

const ONLINE: &str = "online";

/// Send the online status every `period` until `token` is cancelled
pub fn spawn_status_heartbeat(
    tracker: &TaskTracker,
    client: ControlPlaneClient,
    subscriber_uid: String,
    period: Duration,
    token: CancellationToken,
) {
    tracker.spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Stopping status heartbeat");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let report = StatusReport {
                subscriber_uid: subscriber_uid.clone(),
                state: String::new(),
                status: ONLINE.to_string(),
            };
            match client.send_status(&report).await {
                Ok(()) => debug!("Status sent"),
                Err(e) => info!("Error sending status: {:#}", e),
            }
        }
    });
}
