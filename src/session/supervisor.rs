//! Session supervisor - starts the registered runtime at most once

use super::heartbeat;
use crate::command::handlers::HandlerContext;
use crate::command::JobExecutor;
use crate::config::{Endpoints, Timings};
use crate::connection::{PushChannel, PushConfig, PushEvent};
use crate::registration::RuntimeLauncher;
use crate::software::SoftwareFetcher;
use crate::store::Store;
use crate::transport::http::api_url;
use crate::transport::ControlPlaneClient;
use crate::tunnel::TunnelSetup;
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use udpu_shared::DeviceDescriptor;

/// Owns every task of the registered runtime
pub struct SessionSupervisor {
    endpoints: Endpoints,
    store: Arc<Store>,
    tunnel: Arc<dyn TunnelSetup>,
    download_dir: PathBuf,
    timings: Timings,
    token: CancellationToken,
    tracker: TaskTracker,
    started: OnceCell<()>,
}

impl SessionSupervisor {
    pub fn new(
        endpoints: Endpoints,
        store: Arc<Store>,
        tunnel: Arc<dyn TunnelSetup>,
        download_dir: impl Into<PathBuf>,
        timings: Timings,
        token: CancellationToken,
    ) -> Self {
        Self {
            endpoints,
            store,
            tunnel,
            download_dir: download_dir.into(),
            timings,
            token,
            tracker: TaskTracker::new(),
            started: OnceCell::new(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.initialized()
    }

    /// Wait for every session task to finish; call after cancelling the token
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Session tasks finished");
    }

    async fn start(&self, descriptor: Arc<DeviceDescriptor>) -> Result<()> {
        info!(subscriber = %descriptor.subscriber_uid, "Starting device session");

        let name = descriptor.subscriber_uid.clone();
        if let Err(e) = self
            .store
            .blocking(move |store| store.set_client_name(&name))
            .await
        {
            warn!("Failed to store client name: {}", e);
        }

        let endpoints = match self.tunnel.bring_up(&descriptor).await {
            Ok(Some(host)) => {
                info!("Control plane reached through tunnel at {}", host);
                self.endpoints.with_server_host(host)
            }
            Ok(None) => self.endpoints.clone(),
            Err(e) => {
                error!("Error setting up WireGuard: {:#}", e);
                self.endpoints.clone()
            }
        };

        let client = ControlPlaneClient::new(endpoints.clone(), self.timings.http_timeout)?;

        let mut url = api_url(&endpoints.server, "ws", &["pubsub"])?;
        url.query_pairs_mut()
            .append_pair("channel", &descriptor.subscriber_uid);
        let channel = PushChannel::start(
            PushConfig {
                url,
                reconnect_delay: self.timings.push_reconnect,
            },
            self.token.clone(),
            &self.tracker,
        );

        let ctx = HandlerContext {
            store: self.store.clone(),
            software: SoftwareFetcher::new(client.clone(), self.download_dir.clone()),
            client: client.clone(),
            sink: Arc::new(channel.sender()),
            tracker: self.tracker.clone(),
        };
        let executor = JobExecutor::new(ctx, self.token.clone());

        self.tracker
            .spawn(dispatch_loop(channel, executor.clone(), self.token.clone()));

        heartbeat::spawn_status_heartbeat(
            &self.tracker,
            client,
            descriptor.subscriber_uid.clone(),
            self.timings.status_interval,
            self.token.clone(),
        );

        self.tracker.spawn(async move {
            executor.process_boot(&descriptor).await;
        });

        Ok(())
    }
}

#[async_trait]
impl RuntimeLauncher for SessionSupervisor {
    async fn launch(&self, descriptor: Arc<DeviceDescriptor>) {
        // A failed start leaves the cell empty so the next descriptor retries
        if let Err(e) = self
            .started
            .get_or_try_init(|| self.start(descriptor))
            .await
        {
            error!("Failed to start device session: {:#}", e);
        }
    }
}

/// Hand every inbound push message to the executor
async fn dispatch_loop(
    mut channel: PushChannel,
    executor: Arc<JobExecutor>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = channel.recv() => event,
        };

        match event {
            Some(PushEvent::Connected) => info!("Connected to push channel"),
            Some(PushEvent::Disconnected { reason }) => {
                warn!("Push channel disconnected: {}", reason)
            }
            Some(PushEvent::Received(text)) => {
                debug!("Push message received: {}", text);
                executor.dispatch(text);
            }
            None => {
                debug!("Push channel closed");
                break;
            }
        }
    }
}
