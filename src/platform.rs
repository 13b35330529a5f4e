//! The platform: device discovery and exclusive acquisition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::device::Device;
use crate::errors::{Error, ErrorKind, Result};
use crate::events::{Emitter, Event, EventBus, EventKind, Subscription};
use crate::transport::{DeviceInfo, Transport};

/// Platform lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformState {
    Uninitialized,
    Initialized,
    Releasing,
}

/// Options for [`Platform::init`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Tear down any existing state first instead of failing
    /// `AlreadyInitialized`.
    pub force: bool,
}

impl InitOptions {
    pub fn force() -> Self {
        Self { force: true }
    }
}

/// Options for [`Platform::release`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseOptions {
    /// Succeed quietly when not initialized instead of failing
    /// `NotInitialized`.
    pub force: bool,
}

impl ReleaseOptions {
    pub fn force() -> Self {
        Self { force: true }
    }
}

enum AcquiredSlot {
    /// Claimed, backend open still in flight. Blocks concurrent acquirers.
    Reserved,
    Live(Device),
}

pub(crate) struct PlatformShared {
    transports: Vec<Arc<dyn Transport>>,
    state: StdMutex<PlatformState>,
    /// device id -> acquisition slot. This lock never nests with device
    /// locks: it is taken, dropped, and only then do we await the backend.
    acquired: StdMutex<HashMap<String, AcquiredSlot>>,
    pub(crate) events: EventBus,
    /// Serializes init against release.
    lifecycle: Mutex<()>,
}

impl PlatformShared {
    pub(crate) fn forget_device(&self, id: &str) {
        self.acquired.lock().unwrap().remove(id);
    }
}

/// The root of the model: enumerates devices across the registered
/// transports and hands out at most one [`Device`] per id. Clones share the
/// platform.
#[derive(Clone)]
pub struct Platform {
    shared: Arc<PlatformShared>,
}

impl Platform {
    /// A platform over an explicit set of transports. Applications normally
    /// go through [`PlatformManager`](crate::manager::PlatformManager)
    /// instead; this constructor is the dependency-injection seam.
    pub fn with_transports(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self {
            shared: Arc::new(PlatformShared {
                transports,
                state: StdMutex::new(PlatformState::Uninitialized),
                acquired: StdMutex::new(HashMap::new()),
                events: EventBus::new(),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> PlatformState {
        *self.shared.state.lock().unwrap()
    }

    /// Subscribes to the platform's event stream. Device and session events
    /// flow through here too, tagged by emitter.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, handler)
    }

    fn emit<S: Into<String>>(&self, kind: EventKind, detail: S) {
        self.shared
            .events
            .emit(Event::new(kind, Emitter::Platform, detail));
    }

    fn ensure_initialized(&self) -> Result<()> {
        match self.state() {
            PlatformState::Initialized => Ok(()),
            _ => Err(Error::new(ErrorKind::NotInitialized)),
        }
    }

    /// Brings the platform up. A second `init` fails `AlreadyInitialized`
    /// unless forced, in which case the existing state is released first.
    pub async fn init(&self, options: InitOptions) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if self.state() != PlatformState::Uninitialized {
            if !options.force {
                return Err(Error::new(ErrorKind::AlreadyInitialized));
            }
            self.release_inner().await;
        }
        for transport in &self.shared.transports {
            match transport.enumerate().await {
                Ok(devices) => {
                    debug!(
                        transport = transport.name(),
                        devices = devices.len(),
                        "transport ready"
                    );
                }
                Err(err) => {
                    warn!(transport = transport.name(), %err, "transport not reachable");
                }
            }
        }
        *self.shared.state.lock().unwrap() = PlatformState::Initialized;
        self.emit(EventKind::PlatformInitialized, "");
        Ok(())
    }

    /// Tears the platform down, releasing every live device first. Nested
    /// failures are logged and swallowed; release always completes.
    pub async fn release(&self, options: ReleaseOptions) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if self.state() != PlatformState::Initialized {
            if options.force {
                return Ok(());
            }
            return Err(Error::new(ErrorKind::NotInitialized));
        }
        self.release_inner().await;
        Ok(())
    }

    async fn release_inner(&self) {
        *self.shared.state.lock().unwrap() = PlatformState::Releasing;
        let devices: Vec<Device> = self
            .shared
            .acquired
            .lock()
            .unwrap()
            .drain()
            .filter_map(|(_, slot)| match slot {
                AcquiredSlot::Live(device) => Some(device),
                AcquiredSlot::Reserved => None,
            })
            .collect();
        for device in devices {
            if let Err(err) = device.release().await {
                warn!(device = %device.info().id, %err, "device release failed");
            }
        }
        *self.shared.state.lock().unwrap() = PlatformState::Uninitialized;
        self.emit(EventKind::PlatformReleased, "");
    }

    /// Enumerates devices across all transports, in transport registration
    /// order. A backend that fails to enumerate is skipped with a warning;
    /// the union of the rest still comes back.
    pub async fn device_info(&self) -> Result<Vec<DeviceInfo>> {
        self.ensure_initialized()?;
        let mut infos = Vec::new();
        for transport in &self.shared.transports {
            match transport.enumerate().await {
                Ok(devices) => infos.extend(devices),
                Err(err) => {
                    warn!(transport = transport.name(), %err, "enumeration failed");
                }
            }
        }
        Ok(infos)
    }

    /// Acquires exclusive ownership of one device.
    ///
    /// Exactly one concurrent caller per id wins; the rest fail
    /// `AlreadyAcquired` until the winner releases. Devices that cannot
    /// carry APDUs stay enumerable but fail `UnsupportedOperation` here.
    pub async fn acquire_device(&self, id: &str) -> Result<Device> {
        self.ensure_initialized()?;

        let mut found = None;
        for transport in &self.shared.transports {
            match transport.enumerate().await {
                Ok(devices) => {
                    if let Some(info) = devices.into_iter().find(|d| d.id == id) {
                        found = Some((Arc::clone(transport), info));
                        break;
                    }
                }
                Err(err) => {
                    warn!(transport = transport.name(), %err, "enumeration failed");
                }
            }
        }
        let (transport, info) = found
            .ok_or_else(|| Error::invalid(format!("unknown device id: {}", id)))?;
        if !info.supports_apdu {
            return Err(Error::msg(
                ErrorKind::UnsupportedOperation,
                "device does not support APDU exchange",
            ));
        }

        {
            let mut acquired = self.shared.acquired.lock().unwrap();
            if acquired.contains_key(id) {
                return Err(Error::new(ErrorKind::AlreadyAcquired));
            }
            acquired.insert(id.to_string(), AcquiredSlot::Reserved);
        }

        let (handle, capabilities) = match transport.open(id).await {
            Ok(opened) => opened,
            Err(err) => {
                self.shared.forget_device(id);
                return Err(err);
            }
        };
        let device = Device::new(&self.shared, transport, handle, capabilities, info);
        self.shared
            .acquired
            .lock()
            .unwrap()
            .insert(id.to_string(), AcquiredSlot::Live(device.clone()));
        Ok(device)
    }
}
