//! Seams between the job engine and the push channel

use anyhow::Result;
use async_trait::async_trait;

/// Narrow "send a response" capability handed to the job engine.
///
/// The engine never sees the connection itself, so it cannot close it.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Queue `{"response": output}` for delivery to the control plane
    async fn send_response(&self, output: &str) -> Result<()>;
}
