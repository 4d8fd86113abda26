//! Device registration
//!
//! Drives the registration state machine against the control plane:
//! - Secret/stamp handshake and duplicate-MAC detection
//! - Descriptor polling until a non-placeholder identity is assigned
//! - The "unregistered device" heartbeat while no identity exists

pub mod secret;

use crate::config::Timings;
use crate::error::RegistrationError;
use crate::state::{DescriptorSlot, DeviceState};
use crate::store::Store;
use crate::transport::{ControlPlaneClient, StampSubmission};
use anyhow::Result;
use async_trait::async_trait;
use secret::SecretStore;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use udpu_shared::state_machine::{
    RegistrationEvent, RegistrationMachine, RegistrationState, TransitionResult,
};
use udpu_shared::{DeviceDescriptor, StampData, StatusReport, UnregisteredDevice};

/// Starts the registered runtime once an identity is confirmed
#[async_trait]
pub trait RuntimeLauncher: Send + Sync {
    async fn launch(&self, descriptor: Arc<DeviceDescriptor>);
}

pub struct Registrar {
    client: ControlPlaneClient,
    store: Arc<Store>,
    device: Arc<DeviceState>,
    slot: Arc<DescriptorSlot>,
    timings: Timings,
    machine: Mutex<RegistrationMachine>,
}

impl Registrar {
    pub fn new(
        client: ControlPlaneClient,
        store: Arc<Store>,
        device: Arc<DeviceState>,
        slot: Arc<DescriptorSlot>,
        timings: Timings,
    ) -> Self {
        Self {
            client,
            store,
            device,
            slot,
            timings,
            machine: Mutex::new(RegistrationMachine::new()),
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    fn advance(&self, event: RegistrationEvent) -> TransitionResult {
        let result = self
            .machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process_event(event);
        if let TransitionResult::Invalid { from, event } = &result {
            warn!("Ignoring registration event {:?} in state {:?}", event, from);
        }
        result
    }

    /// Establish the device secret and check this device's stamp.
    ///
    /// A fresh secret is asserted to the server; an existing one is compared
    /// with the server-recorded stamp. Network errors while fetching the
    /// recorded stamp are retried until shutdown.
    pub async fn verify_identity(
        &self,
        mac: &str,
        secrets: &dyn SecretStore,
        token: &CancellationToken,
    ) -> Result<(), RegistrationError> {
        let secret = secret::load_or_generate(secrets).await;
        self.advance(RegistrationEvent::SecretLoaded {
            existing: secret.existing,
        });

        let stamp = secret::stamp(mac, &secret.value);
        let accepted = if secret.existing {
            self.stamp_matches(mac, &stamp, token).await?
        } else {
            let data = StampData {
                mac_address: mac.to_string(),
                body: stamp,
            };
            match self.client.submit_stamp(&data).await {
                Ok(outcome) => outcome == StampSubmission::Accepted,
                Err(e) => {
                    info!("Cannot send stamp: {:#}", e);
                    true
                }
            }
        };

        let event = if accepted {
            RegistrationEvent::StampAccepted
        } else {
            RegistrationEvent::StampMismatch
        };
        match self.advance(event) {
            TransitionResult::Rejected { reason } => {
                error!(mac = %mac, "Duplicate MAC address: {}", reason);
                Err(RegistrationError::DuplicateMac(mac.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn stamp_matches(
        &self,
        mac: &str,
        stamp: &str,
        token: &CancellationToken,
    ) -> Result<bool, RegistrationError> {
        loop {
            match self.client.fetch_stamp(mac).await {
                Ok(recorded) => return Ok(recorded.as_deref() == Some(stamp)),
                Err(e) => info!("Cannot fetch stamp: {:#}", e),
            }

            tokio::select! {
                _ = token.cancelled() => return Err(RegistrationError::Cancelled),
                _ = tokio::time::sleep(self.timings.descriptor_poll) => {}
            }
        }
    }

    /// Fetch the descriptor once.
    ///
    /// Reports the registration status, updates the unregistered flag, the
    /// client name and the shared descriptor slot.
    pub async fn refresh_descriptor(&self, mac: &str) -> Result<Arc<DeviceDescriptor>> {
        let subscriber = self.store.client_name().unwrap_or_else(|| "none".into());

        let descriptor = match self.client.fetch_descriptor(mac, &subscriber).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.device.set_unregistered(true);
                return Err(e);
            }
        };

        let registered = !descriptor.is_placeholder();
        let report = StatusReport {
            subscriber_uid: descriptor.subscriber_uid.clone(),
            state: if registered { "registered" } else { "not_registered" }.into(),
            status: "online".into(),
        };
        if let Err(e) = self.client.send_status(&report).await {
            info!("Failed to send registration status: {:#}", e);
        }
        self.device.set_unregistered(!registered);

        if !descriptor.subscriber_uid.is_empty() {
            let name = descriptor.subscriber_uid.clone();
            if let Err(e) = self
                .store
                .blocking(move |store| store.set_client_name(&name))
                .await
            {
                warn!(
                    "Failed to persist subscriber UID {}: {}",
                    descriptor.subscriber_uid, e
                );
            }
        }

        Ok(self.slot.store(descriptor))
    }

    /// Feed a descriptor to the state machine
    fn observe(&self, descriptor: &DeviceDescriptor) {
        if self.advance(RegistrationEvent::DescriptorReceived {
            placeholder: descriptor.is_placeholder(),
        }) == TransitionResult::Registered
        {
            info!(mac = %descriptor.mac_address, "Device registered");
        }
    }

    /// Poll until the server returns a descriptor, placeholder or not
    pub async fn wait_for_descriptor(
        &self,
        mac: &str,
        token: &CancellationToken,
    ) -> Result<Arc<DeviceDescriptor>, RegistrationError> {
        loop {
            if token.is_cancelled() {
                return Err(RegistrationError::Cancelled);
            }

            match self.refresh_descriptor(mac).await {
                Ok(descriptor) => {
                    self.observe(&descriptor);
                    return Ok(descriptor);
                }
                Err(e) => info!("Error making request: {:#}", e),
            }

            tokio::select! {
                _ = token.cancelled() => return Err(RegistrationError::Cancelled),
                _ = tokio::time::sleep(self.timings.descriptor_poll) => {}
            }
        }
    }

    /// Poll while the identity is a placeholder, then launch the runtime
    pub async fn poll_until_registered(
        &self,
        mac: &str,
        token: &CancellationToken,
        launcher: &dyn RuntimeLauncher,
    ) {
        info!("Polling by MAC {} every {:?}", mac, self.timings.descriptor_poll);

        let period = self.timings.descriptor_poll;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let descriptor = match self.refresh_descriptor(mac).await {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    debug!("Descriptor poll failed: {:#}", e);
                    continue;
                }
            };

            self.observe(&descriptor);
            if !descriptor.is_placeholder() {
                info!("Resolved non-placeholder MAC: {}", descriptor.mac_address);
                launcher.launch(descriptor).await;
                return;
            }
        }
    }

    /// Report "unregistered device" on a fixed tick while the flag is set.
    ///
    /// At most one report is in flight; a tick that finds one running is skipped.
    pub fn spawn_unregistered_reporter(&self, tracker: &TaskTracker, token: CancellationToken) {
        let client = self.client.clone();
        let device = self.device.clone();
        let slot = self.slot.clone();
        let period = self.timings.unregistered_tick;
        let sends = tracker.clone();
        let in_flight = Arc::new(tokio::sync::Mutex::new(()));

        tracker.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Shutting down unregistered device sender");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                if !device.is_unregistered() {
                    continue;
                }
                let Ok(guard) = in_flight.clone().try_lock_owned() else {
                    debug!("Unregistered device report still in flight, skipping tick");
                    continue;
                };

                let client = client.clone();
                let device = device.clone();
                let slot = slot.clone();
                sends.spawn(async move {
                    let _guard = guard;
                    let Some(descriptor) = slot.load() else {
                        return;
                    };
                    let report = UnregisteredDevice {
                        subscriber_uid: descriptor.subscriber_uid.clone(),
                        last_call_home_dt: chrono::Utc::now()
                            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                        ip_address: device.device_ip(),
                    };
                    match client.send_unregistered(&report).await {
                        Ok(()) => debug!("Sent unregistered device status"),
                        Err(e) => info!("Failed to send unregistered device status: {:#}", e),
                    }
                });
            }
        });
    }
}
