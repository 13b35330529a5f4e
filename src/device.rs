//! Devices: one physical card interface, exclusively owned.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, trace, warn};

use crate::errors::{Error, ErrorKind, Result};
use crate::events::{Emitter, Event, EventBus, EventKind, Subscription};
use crate::platform::PlatformShared;
use crate::session::CardSession;
use crate::task::Task;
use crate::transport::{AntennaInfo, Capabilities, DeviceHandle, DeviceInfo, Transport};

/// Default `wait_for_card_presence` timeout.
const DEFAULT_WAIT_MS: u64 = 30_000;

/// How long the presence monitor lets one backend call run before it
/// re-checks the world.
const MONITOR_SLICE: Duration = Duration::from_millis(25);

/// Device lifecycle states.
///
/// `Idle` exists only on paper: devices come out of
/// [`Platform::acquire_device`](crate::platform::Platform::acquire_device)
/// with the RF field (or contact slot) already live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    RfActive,
    CardDetected,
    SessionActive,
    Released,
}

pub(crate) struct DeviceShared {
    pub(crate) info: DeviceInfo,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) handle: DeviceHandle,
    pub(crate) capabilities: Capabilities,
    pub(crate) events: EventBus,
    state: StdMutex<DeviceState>,
    session: StdMutex<Option<CardSession>>,
    /// Card presence as last observed; flipping it is "claiming" the
    /// transition, so found/lost events fire exactly once per edge.
    presence_tx: watch::Sender<bool>,
    /// Flipped once, on release; wakes every in-flight wait.
    shutdown_tx: watch::Sender<bool>,
    monitor: StdMutex<Option<Task<()>>>,
    platform: Weak<PlatformShared>,
    /// Serializes start_session and release against each other.
    op: Mutex<()>,
}

impl DeviceShared {
    pub(crate) fn emit<S: Into<String>>(&self, kind: EventKind, detail: S) {
        self.events
            .emit(Event::new(kind, Emitter::Device(self.info.id.clone()), detail));
    }

    fn claim_lost(&self) -> bool {
        self.presence_tx.send_if_modified(|present| {
            if *present {
                *present = false;
                true
            } else {
                false
            }
        })
    }

    /// Only the monitor flips presence to true, so no claim is needed here;
    /// the borrow check collapses consecutive "found" signals. The event
    /// goes out before the watch flips, so a woken waiter cannot start a
    /// session ahead of its own CARD_FOUND.
    fn card_found(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == DeviceState::Released || *self.presence_tx.borrow() {
                return;
            }
            if *state == DeviceState::RfActive {
                *state = DeviceState::CardDetected;
            }
        }
        self.emit(EventKind::CardFound, "");
        let _ = self.presence_tx.send(true);
    }

    async fn card_lost(&self) {
        let session = {
            let mut state = self.state.lock().unwrap();
            if *state == DeviceState::Released || !self.claim_lost() {
                return;
            }
            *state = DeviceState::RfActive;
            self.session.lock().unwrap().take()
        };
        if let Some(session) = session {
            session.close_for_loss().await;
        }
        self.emit(EventKind::CardLost, "");
    }

    /// Called by a closing session. With `card_lost`, the session found out
    /// about the removal before the monitor did and the loss event fires
    /// here; otherwise this is an orderly release.
    pub(crate) fn on_session_closed(&self, card_lost: bool) {
        let mut state = self.state.lock().unwrap();
        self.session.lock().unwrap().take();
        if *state == DeviceState::Released {
            return;
        }
        if card_lost {
            let claimed = self.claim_lost();
            *state = DeviceState::RfActive;
            drop(state);
            if claimed {
                self.emit(EventKind::CardLost, "");
            }
        } else {
            *state = if *self.presence_tx.borrow() {
                DeviceState::CardDetected
            } else {
                DeviceState::RfActive
            };
        }
    }
}

/// The presence monitor: one per acquired device. While no card is present
/// it parks in the backend's `wait`; while one is, it polls `is_present`.
/// The loop holds only a weak reference, so dropping the device (or aborting
/// the task on release) tears it down.
async fn run_monitor(shared: Weak<DeviceShared>) {
    loop {
        let Some(s) = shared.upgrade() else { return };
        if *s.shutdown_tx.borrow() {
            return;
        }
        let present = *s.presence_tx.borrow();
        if !present {
            match s.transport.wait(s.handle, MONITOR_SLICE).await {
                Ok(()) => s.card_found(),
                Err(err) if err.kind() == ErrorKind::Timeout => (),
                Err(err) => {
                    trace!(device = %s.info.id, %err, "presence wait failed");
                    drop(s);
                    tokio::time::sleep(MONITOR_SLICE).await;
                    continue;
                }
            }
        } else {
            match s.transport.is_present(s.handle).await {
                Ok(true) | Err(_) => {
                    drop(s);
                    tokio::time::sleep(MONITOR_SLICE).await;
                    continue;
                }
                Ok(false) => s.card_lost().await,
            }
        }
    }
}

/// An exclusively-acquired card interface. Clones share the device.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.shared.handle)
            .field("info", &self.shared.info)
            .finish()
    }
}

impl Device {
    pub(crate) fn new(
        platform: &Arc<PlatformShared>,
        transport: Arc<dyn Transport>,
        handle: DeviceHandle,
        capabilities: Capabilities,
        info: DeviceInfo,
    ) -> Self {
        let (presence_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(DeviceShared {
            info,
            transport,
            handle,
            capabilities,
            events: platform.events.clone(),
            state: StdMutex::new(DeviceState::RfActive),
            session: StdMutex::new(None),
            presence_tx,
            shutdown_tx,
            monitor: StdMutex::new(None),
            platform: Arc::downgrade(platform),
            op: Mutex::new(()),
        });
        let monitor = Task::spawn(run_monitor(Arc::downgrade(&shared)));
        *shared.monitor.lock().unwrap() = Some(monitor);
        shared.emit(EventKind::DeviceAcquired, "");
        debug!(device = %shared.info.id, "device acquired");
        Self { shared }
    }

    /// The immutable descriptor this device was enumerated with.
    pub fn info(&self) -> DeviceInfo {
        self.shared.info.clone()
    }

    pub fn state(&self) -> DeviceState {
        *self.shared.state.lock().unwrap()
    }

    /// False once released.
    pub fn is_available(&self) -> bool {
        self.state() != DeviceState::Released
    }

    /// Card presence as last observed by the monitor.
    pub fn is_card_present(&self) -> bool {
        *self.shared.presence_tx.borrow()
    }

    /// What the transport reported this device capable of at open time.
    pub fn capabilities(&self) -> Capabilities {
        self.shared.capabilities
    }

    /// Antenna geometry, if the backend knows it.
    pub fn antenna_info(&self) -> Option<AntennaInfo> {
        self.shared.transport.antenna_info(self.shared.handle)
    }

    /// Subscribes to this device's event stream (which includes its
    /// sessions' events).
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, handler)
    }

    /// Resolves when a card is present, or fails `Timeout`.
    ///
    /// `None` waits the default 30 seconds. Zero fails immediately with
    /// `Timeout`; negative values are an `InvalidParameter`. Release during
    /// the wait also reports `Timeout`, so callers see one uniform outcome.
    pub async fn wait_for_card_presence(&self, timeout_ms: Option<i64>) -> Result<()> {
        if self.state() == DeviceState::Released {
            return Err(Error::new(ErrorKind::NotConnected));
        }
        let timeout = match timeout_ms {
            None => DEFAULT_WAIT_MS,
            Some(ms) if ms < 0 => {
                return Err(Error::invalid("timeout must not be negative"));
            }
            Some(0) => {
                self.shared.emit(EventKind::WaitTimeout, "timeout=0ms");
                return Err(Error::new(ErrorKind::Timeout));
            }
            Some(ms) => ms as u64,
        };
        if *self.shared.presence_tx.borrow() {
            return Ok(());
        }

        let mut presence = self.shared.presence_tx.subscribe();
        let mut shutdown = self.shared.shutdown_tx.subscribe();
        let expiry = tokio::time::sleep(Duration::from_millis(timeout));
        tokio::pin!(expiry);
        loop {
            tokio::select! {
                _ = &mut expiry => {
                    self.shared
                        .emit(EventKind::WaitTimeout, format!("timeout={}ms", timeout));
                    return Err(Error::new(ErrorKind::Timeout));
                }
                changed = presence.changed() => match changed {
                    Ok(()) if *presence.borrow() => return Ok(()),
                    Ok(()) => (),
                    Err(_) => return Err(Error::new(ErrorKind::Timeout)),
                },
                _ = shutdown.changed() => {
                    // Device released from under us; uniform reporting.
                    return Err(Error::new(ErrorKind::Timeout));
                }
            }
        }
    }

    /// Connects to the detected card and opens the device's one session.
    pub async fn start_session(&self) -> Result<CardSession> {
        let _op = self.shared.op.lock().await;
        match self.state() {
            DeviceState::CardDetected => (),
            DeviceState::Released => return Err(Error::new(ErrorKind::NotConnected)),
            DeviceState::SessionActive => return Err(Error::new(ErrorKind::AlreadyConnected)),
            DeviceState::Idle | DeviceState::RfActive => {
                return Err(Error::new(ErrorKind::CardNotPresent));
            }
        }

        let card = self.shared.transport.connect(self.shared.handle).await?;
        let session = CardSession::new(&self.shared, card);
        let stored = {
            // The card may have vanished between the check and the connect;
            // store-and-transition is atomic against the monitor's loss path.
            let mut state = self.shared.state.lock().unwrap();
            if *state == DeviceState::CardDetected {
                *self.shared.session.lock().unwrap() = Some(session.clone());
                *state = DeviceState::SessionActive;
                true
            } else {
                false
            }
        };
        if !stored {
            self.shared.transport.close(card).await;
            return Err(Error::new(ErrorKind::CardNotPresent));
        }
        self.shared.emit(EventKind::CardSessionStarted, "");
        Ok(session)
    }

    /// Releases the device: stops the monitor, closes any live session,
    /// hands the interface back to the transport. Idempotent; in-flight
    /// waits resolve with `Timeout`.
    pub async fn release(&self) -> Result<()> {
        let _op = self.shared.op.lock().await;
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state == DeviceState::Released {
                return Ok(());
            }
            *state = DeviceState::Released;
        }
        let _ = self.shared.shutdown_tx.send(true);
        drop(self.shared.monitor.lock().unwrap().take());

        let session = self.shared.session.lock().unwrap().take();
        if let Some(session) = session {
            if let Err(err) = session.release().await {
                warn!(device = %self.shared.info.id, %err, "session close during release failed");
            }
        }
        self.shared.transport.close_device(self.shared.handle).await;
        self.shared.emit(EventKind::DeviceReleased, "");
        debug!(device = %self.shared.info.id, "device released");
        if let Some(platform) = self.shared.platform.upgrade() {
            platform.forget_device(&self.shared.info.id);
        }
        Ok(())
    }
}
