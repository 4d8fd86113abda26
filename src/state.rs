//! Process-wide shared runtime state

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use udpu_shared::DeviceDescriptor;

#[derive(Debug, Default)]
struct DeviceFlags {
    unregistered: bool,
    device_ip: String,
}

/// Unregistered flag and cached outbound IP behind one short-lived lock
#[derive(Debug, Default)]
pub struct DeviceState {
    inner: Mutex<DeviceFlags>,
}

impl DeviceState {
    pub fn new(device_ip: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(DeviceFlags {
                unregistered: false,
                device_ip: device_ip.into(),
            }),
        }
    }

    pub fn set_unregistered(&self, unregistered: bool) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unregistered = unregistered;
    }

    pub fn is_unregistered(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unregistered
    }

    pub fn device_ip(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .device_ip
            .clone()
    }
}

/// Latest device descriptor, replaced wholesale
///
/// Readers get an `Arc` snapshot; a writer never mutates a descriptor in place.
#[derive(Debug)]
pub struct DescriptorSlot {
    tx: watch::Sender<Option<Arc<DeviceDescriptor>>>,
}

impl Default for DescriptorSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn store(&self, descriptor: DeviceDescriptor) -> Arc<DeviceDescriptor> {
        let descriptor = Arc::new(descriptor);
        self.tx.send_replace(Some(descriptor.clone()));
        descriptor
    }

    pub fn load(&self) -> Option<Arc<DeviceDescriptor>> {
        self.tx.borrow().clone()
    }
}
