//! An in-process [`Transport`] backend for tests and simulations.
//!
//! No native resources: devices are rows in a table, cards are scripted
//! responders, and presence is a flag the test flips. The backend also
//! records every wire frame it sees and tracks how many transmits were ever
//! in flight at once, which is how the single-writer discipline of the
//! session lock gets asserted from the outside.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use crate::errors::{Error, ErrorKind, Result};
use crate::transport::{
    AntennaInfo, Capabilities, CardHandle, DeviceHandle, DeviceInfo, Transport,
};

/// How often [`Transport::wait`] re-checks presence.
const POLL_SLICE: Duration = Duration::from_millis(5);

type ApduHandler = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

enum Responder {
    /// FIFO of canned wire responses (status bytes included).
    Script(Vec<Vec<u8>>),
    /// Computes a wire response from the request frame.
    Handler(ApduHandler),
}

/// A card that can be "presented" to a mock device.
pub struct MockCard {
    atr: Vec<u8>,
    responder: Responder,
}

impl MockCard {
    /// A card that answers from a fixed list of responses, in order. Running
    /// off the end of the script is a `TransmissionError`.
    pub fn scripted<T: Into<Vec<u8>>>(atr: T, responses: Vec<Vec<u8>>) -> Self {
        Self {
            atr: atr.into(),
            responder: Responder::Script(responses),
        }
    }

    /// A card that computes each response from the request frame.
    pub fn with_handler<T, F>(atr: T, handler: F) -> Self
    where
        T: Into<Vec<u8>>,
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        Self {
            atr: atr.into(),
            responder: Responder::Handler(Box::new(handler)),
        }
    }
}

struct CardSlot {
    atr: Vec<u8>,
    responder: Responder,
    /// Handle of the live connection, if any.
    connected: Option<u64>,
}

struct DeviceSlot {
    info: DeviceInfo,
    opened: bool,
    antenna: Option<AntennaInfo>,
    card: Option<CardSlot>,
}

struct Inner {
    devices: Mutex<Vec<DeviceSlot>>,
    /// card handle -> device index.
    card_map: Mutex<HashMap<u64, usize>>,
    next_card: AtomicU64,
    frames: Mutex<Vec<Vec<u8>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_next: Mutex<Option<ErrorKind>>,
    drop_card_next: Mutex<bool>,
}

/// The mock backend. Clones share state.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                devices: Mutex::new(Vec::new()),
                card_map: Mutex::new(HashMap::new()),
                next_card: AtomicU64::new(1),
                frames: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail_next: Mutex::new(None),
                drop_card_next: Mutex::new(false),
            }),
        }
    }

    /// Registers a device; the returned control flips its card presence.
    pub fn add_device(&self, info: DeviceInfo) -> MockDeviceCtl {
        let mut devices = self.inner.devices.lock().unwrap();
        let id = info.id.clone();
        devices.push(DeviceSlot {
            info,
            opened: false,
            antenna: None,
            card: None,
        });
        MockDeviceCtl {
            inner: Arc::clone(&self.inner),
            index: devices.len() - 1,
            id,
        }
    }

    /// Every wire frame seen by `transmit`, in order, across all cards.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.inner.frames.lock().unwrap().clone()
    }

    /// The most transmits that were ever in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Makes the next `transmit` fail with `kind`.
    pub fn fail_next_transmit(&self, kind: ErrorKind) {
        *self.inner.fail_next.lock().unwrap() = Some(kind);
    }

    /// Rips the card out mid-exchange: the next `transmit` removes it and
    /// reports `CardNotPresent`.
    pub fn drop_card_on_next_transmit(&self) {
        *self.inner.drop_card_next.lock().unwrap() = true;
    }

    fn device_index(&self, handle: DeviceHandle) -> Result<usize> {
        let devices = self.inner.devices.lock().unwrap();
        let idx = handle.0 as usize;
        if idx < devices.len() {
            Ok(idx)
        } else {
            Err(Error::new(ErrorKind::NotConnected))
        }
    }

    fn card_device(&self, card: CardHandle) -> Result<usize> {
        self.inner
            .card_map
            .lock()
            .unwrap()
            .get(&card.0)
            .copied()
            .ok_or_else(|| Error::new(ErrorKind::CardNotPresent))
    }

    fn remove_card_at(&self, index: usize) {
        let mut devices = self.inner.devices.lock().unwrap();
        if let Some(slot) = devices[index].card.take() {
            if let Some(handle) = slot.connected {
                self.inner.card_map.lock().unwrap().remove(&handle);
            }
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Test-side control over one mock device.
pub struct MockDeviceCtl {
    inner: Arc<Inner>,
    index: usize,
    id: String,
}

impl MockDeviceCtl {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Presents a card. A previously-present card (and its connection) is
    /// displaced.
    pub fn insert_card(&self, card: MockCard) {
        let mut devices = self.inner.devices.lock().unwrap();
        if let Some(old) = devices[self.index].card.take() {
            if let Some(handle) = old.connected {
                self.inner.card_map.lock().unwrap().remove(&handle);
            }
        }
        devices[self.index].card = Some(CardSlot {
            atr: card.atr,
            responder: card.responder,
            connected: None,
        });
    }

    /// Takes the card away; live connections to it go stale.
    pub fn remove_card(&self) {
        let mut devices = self.inner.devices.lock().unwrap();
        if let Some(slot) = devices[self.index].card.take() {
            if let Some(handle) = slot.connected {
                self.inner.card_map.lock().unwrap().remove(&handle);
            }
        }
    }

    pub fn set_antenna(&self, antenna: AntennaInfo) {
        self.inner.devices.lock().unwrap()[self.index].antenna = Some(antenna);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .inner
            .devices
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.info.clone())
            .collect())
    }

    async fn open(&self, id: &str) -> Result<(DeviceHandle, Capabilities)> {
        let mut devices = self.inner.devices.lock().unwrap();
        if devices.is_empty() {
            return Err(Error::new(ErrorKind::NoReaders));
        }
        let (idx, slot) = devices
            .iter_mut()
            .enumerate()
            .find(|(_, d)| d.info.id == id)
            .ok_or_else(|| Error::msg(ErrorKind::ReaderError, "no such device"))?;
        if slot.opened {
            return Err(Error::msg(ErrorKind::ReaderError, "device already open"));
        }
        slot.opened = true;
        Ok((DeviceHandle(idx as u64), Capabilities::default()))
    }

    async fn is_present(&self, device: DeviceHandle) -> Result<bool> {
        let idx = self.device_index(device)?;
        Ok(self.inner.devices.lock().unwrap()[idx].card.is_some())
    }

    async fn wait(&self, device: DeviceHandle, timeout: Duration) -> Result<()> {
        let idx = self.device_index(device)?;
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.devices.lock().unwrap()[idx].card.is_some() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::new(ErrorKind::Timeout));
            }
            sleep(POLL_SLICE.min(deadline - now)).await;
        }
    }

    async fn connect(&self, device: DeviceHandle) -> Result<CardHandle> {
        let idx = self.device_index(device)?;
        let mut devices = self.inner.devices.lock().unwrap();
        let slot = devices[idx]
            .card
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::CardNotPresent))?;
        let mut card_map = self.inner.card_map.lock().unwrap();
        if let Some(old) = slot.connected.take() {
            card_map.remove(&old);
        }
        let handle = self.inner.next_card.fetch_add(1, Ordering::Relaxed);
        slot.connected = Some(handle);
        card_map.insert(handle, idx);
        Ok(CardHandle(handle))
    }

    async fn atr(&self, card: CardHandle) -> Result<Vec<u8>> {
        let idx = self.card_device(card)?;
        let devices = self.inner.devices.lock().unwrap();
        devices[idx]
            .card
            .as_ref()
            .map(|c| c.atr.clone())
            .ok_or_else(|| Error::new(ErrorKind::CardNotPresent))
    }

    async fn transmit(&self, card: CardHandle, req: &[u8]) -> Result<Vec<u8>> {
        let n = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(n, Ordering::SeqCst);
        let res = self.transmit_inner(card, req).await;
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        res
    }

    async fn reset(&self, card: CardHandle) -> Result<()> {
        self.card_device(card).map(|_| ())
    }

    async fn close(&self, card: CardHandle) {
        // Lock order is always devices, then card_map.
        let mut devices = self.inner.devices.lock().unwrap();
        if let Some(idx) = self.inner.card_map.lock().unwrap().remove(&card.0) {
            if let Some(slot) = devices[idx].card.as_mut() {
                if slot.connected == Some(card.0) {
                    slot.connected = None;
                }
            }
        }
    }

    async fn close_device(&self, device: DeviceHandle) {
        let idx = device.0 as usize;
        let mut devices = self.inner.devices.lock().unwrap();
        if let Some(slot) = devices.get_mut(idx) {
            slot.opened = false;
        }
    }

    fn antenna_info(&self, device: DeviceHandle) -> Option<AntennaInfo> {
        let devices = self.inner.devices.lock().unwrap();
        devices.get(device.0 as usize).and_then(|d| d.antenna.clone())
    }
}

impl MockTransport {
    async fn transmit_inner(&self, card: CardHandle, req: &[u8]) -> Result<Vec<u8>> {
        self.inner.frames.lock().unwrap().push(req.to_vec());
        if let Some(kind) = self.inner.fail_next.lock().unwrap().take() {
            return Err(Error::msg(kind, "injected fault"));
        }
        let idx = self.card_device(card)?;
        if std::mem::take(&mut *self.inner.drop_card_next.lock().unwrap()) {
            self.remove_card_at(idx);
            return Err(Error::new(ErrorKind::CardNotPresent));
        }
        // A sliver of real latency, to widen the window concurrent callers
        // would need to overlap in.
        sleep(Duration::from_millis(2)).await;
        let mut devices = self.inner.devices.lock().unwrap();
        let slot = devices[idx]
            .card
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::CardNotPresent))?;
        if slot.connected != Some(card.0) {
            return Err(Error::new(ErrorKind::CardNotPresent));
        }
        match &mut slot.responder {
            Responder::Script(responses) => {
                if responses.is_empty() {
                    Err(Error::msg(
                        ErrorKind::TransmissionError,
                        "response script exhausted",
                    ))
                } else {
                    Ok(responses.remove(0))
                }
            }
            Responder::Handler(handler) => Ok(handler(req)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_exchange() {
        let transport = MockTransport::new();
        let ctl = transport.add_device(DeviceInfo::new("mock-0"));
        ctl.insert_card(MockCard::scripted(vec![0x3B, 0x00], vec![vec![0x90, 0x00]]));

        let (dev, caps) = transport.open("mock-0").await.unwrap();
        assert!(caps.extended_length);
        assert!(transport.is_present(dev).await.unwrap());

        let card = transport.connect(dev).await.unwrap();
        assert_eq!(transport.atr(card).await.unwrap(), vec![0x3B, 0x00]);
        let rsp = transport
            .transmit(card, &[0x00, 0xA4, 0x04, 0x00])
            .await
            .unwrap();
        assert_eq!(rsp, vec![0x90, 0x00]);
        assert_eq!(transport.frames(), vec![vec![0x00, 0xA4, 0x04, 0x00]]);

        // Script exhausted.
        let err = transport.transmit(card, &[0x00, 0xB0, 0x00, 0x00]).await;
        assert_eq!(err.unwrap_err().kind(), ErrorKind::TransmissionError);
    }

    #[tokio::test]
    async fn test_handler_card() {
        let transport = MockTransport::new();
        let ctl = transport.add_device(DeviceInfo::new("mock-0"));
        ctl.insert_card(MockCard::with_handler(vec![], |req| {
            // Echo the instruction byte back with 9000.
            vec![req[1], 0x90, 0x00]
        }));
        let (dev, _) = transport.open("mock-0").await.unwrap();
        let card = transport.connect(dev).await.unwrap();
        let rsp = transport
            .transmit(card, &[0x00, 0xCA, 0x00, 0x00])
            .await
            .unwrap();
        assert_eq!(rsp, vec![0xCA, 0x90, 0x00]);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_card() {
        let transport = MockTransport::new();
        transport.add_device(DeviceInfo::new("mock-0"));
        let (dev, _) = transport.open("mock-0").await.unwrap();
        let err = transport
            .wait(dev, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_wait_sees_insertion() {
        let transport = MockTransport::new();
        let ctl = transport.add_device(DeviceInfo::new("mock-0"));
        let (dev, _) = transport.open("mock-0").await.unwrap();
        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.wait(dev, Duration::from_secs(5)).await })
        };
        sleep(Duration::from_millis(20)).await;
        ctl.insert_card(MockCard::scripted(vec![], vec![]));
        waiter.await.unwrap().expect("wait should see the card");
    }

    #[tokio::test]
    async fn test_removal_goes_stale() {
        let transport = MockTransport::new();
        let ctl = transport.add_device(DeviceInfo::new("mock-0"));
        ctl.insert_card(MockCard::scripted(vec![], vec![vec![0x90, 0x00]]));
        let (dev, _) = transport.open("mock-0").await.unwrap();
        let card = transport.connect(dev).await.unwrap();
        ctl.remove_card();
        let err = transport
            .transmit(card, &[0x00, 0xB0, 0x00, 0x00])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CardNotPresent);
        assert!(!transport.is_present(dev).await.unwrap());
    }

    #[tokio::test]
    async fn test_open_unknown_device() {
        let transport = MockTransport::new();
        transport.add_device(DeviceInfo::new("mock-0"));
        let err = transport.open("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReaderError);
    }

    #[tokio::test]
    async fn test_open_empty_transport() {
        let transport = MockTransport::new();
        let err = transport.open("mock-0").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoReaders);
    }
}
