//! Card sessions: serialized APDU exchange over one connected card.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::Mutex;
use tracing::trace;

use crate::apdu::{Command, Response};
use crate::atr;
use crate::device::DeviceShared;
use crate::errors::{Error, ErrorKind, Result};
use crate::events::{Emitter, Event, EventBus, EventKind, Subscription};
use crate::transport::{CardHandle, DeviceHandle, Transport};

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Open,
    Transmitting,
    Resetting,
    Closed,
}

struct SessionInner {
    device: Weak<DeviceShared>,
    transport: Arc<dyn Transport>,
    device_handle: DeviceHandle,
    device_id: String,
    events: EventBus,
    /// The exclusive lock: whoever holds it owns the card handle, so APDU
    /// exchanges, resets and release cannot interleave.
    card: Mutex<CardHandle>,
    phase: StdMutex<SessionPhase>,
}

/// A live session with one card, bound to its [`Device`](crate::device::Device)
/// for life. Clones share the session.
///
/// All operations queue on the session's exclusive lock; concurrent
/// `transmit` calls are served strictly one at a time, in lock acquisition
/// order. After [`CardSession::release`], everything fails `NotConnected`.
#[derive(Clone)]
pub struct CardSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for CardSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardSession")
            .field("device_handle", &self.inner.device_handle)
            .field("device_id", &self.inner.device_id)
            .finish()
    }
}

impl CardSession {
    pub(crate) fn new(device: &Arc<DeviceShared>, card: CardHandle) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                device: Arc::downgrade(device),
                transport: Arc::clone(&device.transport),
                device_handle: device.handle,
                device_id: device.info.id.clone(),
                events: device.events.clone(),
                card: Mutex::new(card),
                phase: StdMutex::new(SessionPhase::Open),
            }),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase.lock().unwrap()
    }

    /// Subscribes to lifecycle events. The stream is shared with the parent
    /// device; session events carry an [`Emitter::Session`] handle.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    fn emit<S: Into<String>>(&self, kind: EventKind, detail: S) {
        self.inner.events.emit(Event::new(
            kind,
            Emitter::Session(self.inner.device_id.clone()),
            detail,
        ));
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.inner.phase.lock().unwrap() = phase;
    }

    fn ensure_open(&self) -> Result<()> {
        match *self.inner.phase.lock().unwrap() {
            SessionPhase::Closed => Err(Error::new(ErrorKind::NotConnected)),
            _ => Ok(()),
        }
    }

    /// The card's ATR/ATS bytes, verbatim; empty when the backend has
    /// nothing to offer. When the blob parses as a full ATR, a summary goes
    /// to the trace log.
    pub async fn atr(&self) -> Result<Vec<u8>> {
        let card = self.inner.card.lock().await;
        self.ensure_open()?;
        let bytes = self.inner.transport.atr(*card).await?;
        if !bytes.is_empty() {
            trace!(device = %self.inner.device_id, atr = %hex::encode(&bytes), "read ATR");
            if let Ok(parsed) = atr::parse(&bytes) {
                trace!(
                    device = %self.inner.device_id,
                    convention = ?parsed.convention,
                    protocols = ?parsed.protocols(),
                    "parsed ATR"
                );
            }
        }
        Ok(bytes)
    }

    /// Exchanges one APDU. The status word comes back uninterpreted; `63CX`
    /// and friends are the caller's business.
    pub async fn transmit(&self, cmd: &Command) -> Result<Response> {
        let card = self.inner.card.lock().await;
        self.ensure_open()?;
        let bin = cmd.encode()?;
        self.set_phase(SessionPhase::Transmitting);
        // Length only; command bytes stay out of the event stream.
        self.emit(EventKind::ApduSent, format!("len={}", bin.len()));
        trace!(device = %self.inner.device_id, len = bin.len(), ">> TX");

        let result = self.inner.transport.transmit(*card, &bin).await;
        match result {
            Ok(bytes) => {
                self.set_phase(SessionPhase::Open);
                trace!(device = %self.inner.device_id, len = bytes.len(), "<< RX");
                let rsp = Response::decode(&bytes);
                if rsp.is_err() {
                    self.emit(EventKind::ApduFailed, "unframeable response");
                }
                rsp
            }
            Err(err) => {
                self.emit(EventKind::ApduFailed, err.kind().to_string());
                if err.kind() == ErrorKind::CardNotPresent {
                    // Card removal is fatal for the session.
                    self.set_phase(SessionPhase::Closed);
                    self.inner.transport.close(*card).await;
                    drop(card);
                    if let Some(device) = self.inner.device.upgrade() {
                        device.on_session_closed(true);
                    }
                } else {
                    self.set_phase(SessionPhase::Open);
                }
                Err(err)
            }
        }
    }

    /// Resets the card. A backend-side warm reset keeps the connection where
    /// supported; otherwise the old handle is closed and a fresh one
    /// obtained through the parent device.
    pub async fn reset(&self) -> Result<()> {
        let mut card = self.inner.card.lock().await;
        self.ensure_open()?;
        self.set_phase(SessionPhase::Resetting);

        if self.inner.transport.reset(*card).await.is_ok() {
            self.set_phase(SessionPhase::Open);
            self.emit(EventKind::CardSessionReset, "warm");
            return Ok(());
        }

        self.inner.transport.close(*card).await;
        match self.inner.transport.connect(self.inner.device_handle).await {
            Ok(fresh) => {
                *card = fresh;
                self.set_phase(SessionPhase::Open);
                self.emit(EventKind::CardSessionReset, "reconnect");
                Ok(())
            }
            Err(err) => {
                self.set_phase(SessionPhase::Closed);
                drop(card);
                if let Some(device) = self.inner.device.upgrade() {
                    device.on_session_closed(err.kind() == ErrorKind::CardNotPresent);
                }
                Err(err)
            }
        }
    }

    /// Closes the session. Idempotent; later calls are no-ops.
    pub async fn release(&self) -> Result<()> {
        let card = self.inner.card.lock().await;
        if *self.inner.phase.lock().unwrap() == SessionPhase::Closed {
            return Ok(());
        }
        self.set_phase(SessionPhase::Closed);
        self.inner.transport.close(*card).await;
        drop(card);
        if let Some(device) = self.inner.device.upgrade() {
            device.on_session_closed(false);
        }
        Ok(())
    }

    /// Closes the session without notifying the device; the caller (the
    /// device itself) already knows.
    pub(crate) async fn close_for_loss(&self) {
        let card = self.inner.card.lock().await;
        if *self.inner.phase.lock().unwrap() == SessionPhase::Closed {
            return;
        }
        self.set_phase(SessionPhase::Closed);
        self.inner.transport.close(*card).await;
    }
}
