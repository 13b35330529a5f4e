//! Cross-platform APDU communication with contact and contactless
//! smartcards.
//!
//! One model covers every interface: a [`Platform`] enumerates and hands out
//! [`Device`]s, a device detects cards and opens a [`CardSession`], and the
//! session exchanges ISO 7816-4 APDUs one at a time. The physical plumbing
//! (PC/SC reader, NFC ISO-DEP, OMAPI secure element) hides behind the
//! [`Transport`] trait; an in-process [`mock`] backend ships for tests and
//! simulations.
//!
//! ```no_run
//! use cardlink::{apdu::Command, InitOptions, PlatformManager};
//!
//! # async fn run() -> cardlink::Result<()> {
//! let platform = PlatformManager::platform();
//! platform.init(InitOptions::default()).await?;
//!
//! let device = platform.acquire_device("integrated-nfc-0").await?;
//! device.wait_for_card_presence(None).await?;
//!
//! let session = device.start_session().await?;
//! let select = Command::new(0x00, 0xA4, 0x04, 0x0C).with_data(vec![0x3F, 0x00]);
//! let rsp = session.transmit(&select).await?;
//! assert_eq!(rsp.sw(), 0x9000);
//!
//! session.release().await?;
//! device.release().await?;
//! platform.release(Default::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod apdu;
pub mod atr;
pub mod ber;
pub mod commands;
pub mod device;
pub mod errors;
pub mod events;
pub mod manager;
pub mod mock;
pub mod platform;
pub mod schema;
pub mod session;
pub mod transport;

mod task;

pub use crate::apdu::{Command, Response, Status};
pub use crate::device::{Device, DeviceState};
pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::events::{Emitter, Event, EventKind, Subscription};
pub use crate::manager::PlatformManager;
pub use crate::platform::{InitOptions, Platform, PlatformState, ReleaseOptions};
pub use crate::session::{CardSession, SessionPhase};
pub use crate::transport::{DeviceInfo, Transport};
