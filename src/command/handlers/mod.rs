//! Handlers for job and queue messages

mod attributes;
mod job;
mod queue;

pub use attributes::{attribute_fields, update_vbuser};
pub use job::{report_missing_software, run_job};
pub use queue::handle_queue;

use crate::software::SoftwareFetcher;
use crate::store::Store;
use crate::transport::{ControlPlaneClient, ResponseSink};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::info;

/// Context passed to job and queue handlers
#[derive(Clone)]
pub struct HandlerContext {
    pub store: Arc<Store>,
    pub client: ControlPlaneClient,
    pub sink: Arc<dyn ResponseSink>,
    pub software: SoftwareFetcher,
    /// Owner of background side effects (job logs, spawned runs)
    pub tracker: TaskTracker,
}

impl HandlerContext {
    /// Forward output over the push channel
    pub async fn respond(&self, output: &str) {
        if let Err(e) = self.sink.send_response(output).await {
            info!("Error sending response message: {:#}", e);
        }
    }
}
