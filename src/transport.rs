//! The transport abstraction: the one contract a backend must implement.
//!
//! A transport owns the native plumbing for one family of interfaces (a
//! PC/SC context, an OS NFC adapter, an OMAPI secure element, an in-process
//! simulator) and exposes devices and cards through opaque integer handles.
//! The lifecycle objects upstairs are concrete; dynamic dispatch happens
//! here and only here.
//!
//! Error discipline: implementations normalise their native failures into
//! [`ErrorKind`](crate::errors::ErrorKind) values at this boundary. Anything
//! without a better mapping becomes `PlatformError`, with the native failure
//! attached as the cause; native error strings never leak into safe
//! messages.

use std::time::Duration;

use async_trait::async_trait;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::errors::Result;

/// Opaque handle to an opened device, scoped to the transport that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Opaque handle to a connected card, scoped to the transport that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CardHandle(pub u64);

/// How a link in the chain talks: device-to-card and platform-to-device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkProtocol {
    Iso7816,
    Nfc,
    Usb,
    Ble,
    Internal,
}

/// Immutable device descriptor, as discovered by enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Stable opaque identifier; the recommended convention is
    /// `<family>-<index>`, eg. `integrated-nfc-0`.
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub supports_apdu: bool,
    pub supports_hce: bool,
    pub is_integrated: bool,
    pub is_removable: bool,
    /// Device-to-card link.
    pub d2c_protocol: LinkProtocol,
    /// Platform-to-device link.
    pub p2d_protocol: LinkProtocol,
    /// Identifiers of the transport APIs this device is reachable through.
    pub transport_apis: Vec<String>,
}

impl DeviceInfo {
    /// A descriptor with workable defaults: APDU-capable, integrated,
    /// internal links. Builder methods adjust from there.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            supports_apdu: true,
            supports_hce: false,
            is_integrated: true,
            is_removable: false,
            d2c_protocol: LinkProtocol::Internal,
            p2d_protocol: LinkProtocol::Internal,
            transport_apis: Vec::new(),
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_protocols(mut self, d2c: LinkProtocol, p2d: LinkProtocol) -> Self {
        self.d2c_protocol = d2c;
        self.p2d_protocol = p2d;
        self
    }

    pub fn with_transport_api<S: Into<String>>(mut self, api: S) -> Self {
        self.transport_apis.push(api.into());
        self
    }

    pub fn removable(mut self) -> Self {
        self.is_integrated = false;
        self.is_removable = true;
        self
    }

    pub fn without_apdu(mut self) -> Self {
        self.supports_apdu = false;
        self
    }
}

/// What a freshly-opened device can do.
///
/// Extended-length support is assumed rather than probed; a transport that
/// cannot carry an extended frame reports the failure at transmit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub extended_length: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            extended_length: true,
        }
    }
}

/// One antenna loop, in device coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AntennaCircle {
    pub center_x: f64,
    pub center_y: f64,
    pub radius: f64,
}

/// Device form factor, as reported by the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum FormFactor {
    Phone = 0,
    Tablet = 1,
    Bifold = 2,
    Trifold = 3,
    #[num_enum(catch_all)]
    Unknown(u8) = 0xFF,
}

/// Physical antenna layout, for UIs that show tap targets. Purely
/// informational; the core never consults it.
#[derive(Debug, Clone, PartialEq)]
pub struct AntennaInfo {
    pub width_mm: f64,
    pub height_mm: f64,
    pub circles: Vec<AntennaCircle>,
    pub form_factor: FormFactor,
}

/// The async I/O contract a backend implements. One APDU is in flight per
/// card at a time; the caller guarantees it, the backend may assert it.
///
/// `transmit` returns the complete response or fails; fragmentation and
/// reassembly are the backend's responsibility. `wait` must honour
/// cancellation at its suspension points and never block the calling thread
/// for longer than a bounded slice.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for diagnostics, eg. `"pcsc"` or `"mock"`.
    fn name(&self) -> &str;

    /// Lists reachable devices, in stable order.
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>>;

    /// Opens a device for exclusive use.
    async fn open(&self, id: &str) -> Result<(DeviceHandle, Capabilities)>;

    /// Is a card currently in the field / inserted?
    async fn is_present(&self, device: DeviceHandle) -> Result<bool>;

    /// Resolves when a card shows up, or fails `Timeout` after `timeout`.
    async fn wait(&self, device: DeviceHandle, timeout: Duration) -> Result<()>;

    /// Connects to the present card.
    async fn connect(&self, device: DeviceHandle) -> Result<CardHandle>;

    /// Answer-to-Reset / Answer-to-Select bytes, empty if the backend has
    /// none to offer.
    async fn atr(&self, card: CardHandle) -> Result<Vec<u8>>;

    /// Exchanges one encoded APDU for one complete response.
    async fn transmit(&self, card: CardHandle, req: &[u8]) -> Result<Vec<u8>>;

    /// Warm-resets the card, keeping the connection.
    async fn reset(&self, card: CardHandle) -> Result<()>;

    /// Disconnects from the card. Failures are swallowed by contract.
    async fn close(&self, card: CardHandle);

    /// Releases the device. Failures are swallowed by contract.
    async fn close_device(&self, device: DeviceHandle);

    /// Antenna geometry, if the backend knows it.
    fn antenna_info(&self, _device: DeviceHandle) -> Option<AntennaInfo> {
        None
    }
}
