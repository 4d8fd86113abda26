//! Agent lifecycle: identity, registration and the registered session

use crate::config::{AgentConfig, Endpoints, SECRET_ENV_KEY};
use crate::error::RegistrationError;
use crate::probe;
use crate::registration::secret::{FirmwareEnv, SecretStore, StoreSecrets};
use crate::registration::{Registrar, RuntimeLauncher};
use crate::session::SessionSupervisor;
use crate::state::{DescriptorSlot, DeviceState};
use crate::store::Store;
use crate::transport::{discovery, ControlPlaneClient};
use crate::tunnel::{TunnelSetup, WireGuardTunnel};
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Resolved identity and collaborators of one agent run
pub struct Collaborators {
    pub endpoints: Endpoints,
    pub mac: String,
    pub device_ip: String,
    pub secrets: Box<dyn SecretStore>,
    pub tunnel: Arc<dyn TunnelSetup>,
}

/// Run the agent until `token` is cancelled.
///
/// Returns `Ok` on a signalled shutdown, including one that arrives while
/// still discovering or registering.
pub async fn run(config: AgentConfig, token: CancellationToken) -> Result<()> {
    let store = Arc::new(Store::open(&config.store_path)?);
    info!(path = %config.store_path.display(), "Store loaded");

    let device_ip = probe::outbound_ip().unwrap_or_else(|e| {
        warn!("Can't determine outbound IP: {:#}", e);
        String::new()
    });
    let mac = match &config.local_test {
        Some(local) => local.mac.clone(),
        None => probe::mac_address(&config.mac_interface)?,
    };
    info!(mac = %mac, ip = %device_ip, "Device identity");

    let Some(endpoints) = resolve_endpoints(&config, &token).await else {
        info!("Shutdown during service discovery");
        return Ok(());
    };
    info!("Server: {}; repo: {}", endpoints.server, endpoints.repo);

    let secrets: Box<dyn SecretStore> = if config.is_local_test() {
        Box::new(StoreSecrets::new(store.clone()))
    } else {
        Box::new(FirmwareEnv::new(SECRET_ENV_KEY))
    };
    let client = ControlPlaneClient::new(endpoints.clone(), config.timings.http_timeout)?;

    let parts = Collaborators {
        endpoints,
        mac,
        device_ip,
        secrets,
        tunnel: Arc::new(WireGuardTunnel::new(client)),
    };
    serve(&config, store, parts, token).await
}

async fn resolve_endpoints(config: &AgentConfig, token: &CancellationToken) -> Option<Endpoints> {
    if config.is_local_test() {
        info!("Local test mode, skipping discovery");
        return Some(Endpoints::local_test());
    }

    let server = discovery::discover(&config.discovery, "server", &config.timings, token).await?;
    let repo = discovery::discover(&config.discovery, "repo", &config.timings, token).await?;
    Some(Endpoints { server, repo })
}

/// Register the device and keep the session running until shutdown
pub async fn serve(
    config: &AgentConfig,
    store: Arc<Store>,
    parts: Collaborators,
    token: CancellationToken,
) -> Result<()> {
    let Collaborators {
        endpoints,
        mac,
        device_ip,
        secrets,
        tunnel,
    } = parts;

    let client = ControlPlaneClient::new(endpoints.clone(), config.timings.http_timeout)?;
    let registrar = Arc::new(Registrar::new(
        client,
        store.clone(),
        Arc::new(DeviceState::new(device_ip)),
        Arc::new(DescriptorSlot::new()),
        config.timings.clone(),
    ));

    match registrar.verify_identity(&mac, secrets.as_ref(), &token).await {
        Ok(()) => {}
        Err(RegistrationError::Cancelled) => return Ok(()),
        Err(e) => {
            token.cancel();
            return Err(e.into());
        }
    }

    let descriptor = match registrar.wait_for_descriptor(&mac, &token).await {
        Ok(descriptor) => descriptor,
        Err(RegistrationError::Cancelled) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let supervisor = Arc::new(SessionSupervisor::new(
        endpoints,
        store,
        tunnel,
        config.download_dir.clone(),
        config.timings.clone(),
        token.clone(),
    ));

    let tracker = TaskTracker::new();
    registrar.spawn_unregistered_reporter(&tracker, token.clone());

    if descriptor.is_placeholder() {
        info!("Device is not registered yet");
        let registrar = registrar.clone();
        let supervisor = supervisor.clone();
        let token = token.clone();
        tracker.spawn(async move {
            registrar
                .poll_until_registered(&mac, &token, supervisor.as_ref())
                .await;
        });
    } else {
        supervisor.launch(descriptor).await;
    }

    token.cancelled().await;
    info!("Shutting down");

    tracker.close();
    tracker.wait().await;
    supervisor.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceAddr, Timings};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use udpu_shared::DeviceDescriptor;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    struct FixedSecret(Option<String>);

    #[async_trait]
    impl SecretStore for FixedSecret {
        async fn load(&self) -> Result<Option<String>> {
            Ok(self.0.clone())
        }

        async fn save(&self, _value: &str) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingTunnel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TunnelSetup for CountingTunnel {
        async fn bring_up(&self, _descriptor: &DeviceDescriptor) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    fn config(dir: &tempfile::TempDir) -> AgentConfig {
        AgentConfig {
            discovery: ServiceAddr::new("127.0.0.1", 9),
            download_dir: dir.path().to_path_buf(),
            mac_interface: "br-lan".into(),
            store_path: dir.path().join("udpu_config.json"),
            local_test: None,
            timings: Timings {
                descriptor_poll: Duration::from_millis(20),
                unregistered_tick: Duration::from_millis(20),
                status_interval: Duration::from_millis(50),
                push_reconnect: Duration::from_millis(20),
                http_timeout: Duration::from_secs(2),
                ..Default::default()
            },
        }
    }

    fn endpoints(server: &MockServer) -> Endpoints {
        let a = server.address();
        let addr = ServiceAddr::new(a.ip().to_string(), a.port());
        Endpoints {
            server: addr.clone(),
            repo: addr,
        }
    }

    fn descriptor(mac: &str) -> serde_json::Value {
        json!({
            "subscriber_uid": "sub-1",
            "mac_address": mac,
            "role": "edge",
        })
    }

    #[tokio::test]
    async fn test_placeholder_then_registered_starts_session_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1.0/stamps"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/api/v1\.0/adapter/.+/udpu$"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(descriptor("00:00:00:00:00:00")),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/api/v1\.0/adapter/.+/udpu$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(descriptor(MAC)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1.0/roles/edge/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let store = Arc::new(Store::open(&config.store_path).unwrap());
        let tunnel = Arc::new(CountingTunnel::default());
        let token = CancellationToken::new();

        let parts = Collaborators {
            endpoints: endpoints(&server),
            mac: MAC.into(),
            device_ip: "10.0.0.5".into(),
            secrets: Box::new(FixedSecret(None)),
            tunnel: tunnel.clone(),
        };
        let agent = {
            let store = store.clone();
            let token = token.clone();
            tokio::spawn(async move { serve(&config, store, parts, token).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while tunnel.calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never started");

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        agent.await.unwrap().unwrap();

        assert_eq!(tunnel.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.client_name().as_deref(), Some("sub-1"));
    }

    #[tokio::test]
    async fn test_duplicate_mac_stops_before_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/api/v1\.0/stamps/.+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"body": "other"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/api/v1\.0/adapter/.+/udpu$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(descriptor(MAC)))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let store = Arc::new(Store::open(&config.store_path).unwrap());
        let tunnel = Arc::new(CountingTunnel::default());
        let token = CancellationToken::new();

        let parts = Collaborators {
            endpoints: endpoints(&server),
            mac: MAC.into(),
            device_ip: "10.0.0.5".into(),
            secrets: Box::new(FixedSecret(Some("secret".into()))),
            tunnel: tunnel.clone(),
        };
        let err = serve(&config, store, parts, token.clone())
            .await
            .unwrap_err();

        assert_eq!(
            err.downcast_ref::<RegistrationError>(),
            Some(&RegistrationError::DuplicateMac(MAC.into()))
        );
        assert!(token.is_cancelled());
        assert_eq!(tunnel.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_descriptor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let store = Arc::new(Store::open(&config.store_path).unwrap());
        let token = CancellationToken::new();

        let parts = Collaborators {
            endpoints: endpoints(&server),
            mac: MAC.into(),
            device_ip: String::new(),
            secrets: Box::new(FixedSecret(None)),
            tunnel: Arc::new(CountingTunnel::default()),
        };

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        serve(&config, store, parts, token).await.unwrap();
    }
}
