//! Builders for the interindustry commands of ISO 7816-4.
//!
//! Nothing here is card-specific; these are the handful of commands every
//! file-system-bearing card speaks, expressed as small builders that convert
//! into a [`Command`]. Application-specific command sets live with the
//! applications.

use crate::apdu::Command;

/// SELECT (INS 0xA4).
///
/// Defaults to first-or-only occurrence with full FCI requested; builder
/// methods tweak P2 from there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Select {
    p1: u8,
    p2: u8,
    data: Vec<u8>,
}

impl Select {
    /// Select a DF by name (typically an application identifier).
    pub fn by_name<T: Into<Vec<u8>>>(name: T) -> Self {
        Self {
            p1: 0x04,
            p2: 0x00,
            data: name.into(),
        }
    }

    /// Select an EF or DF by its two-byte file identifier.
    pub fn by_file_id(fid: u16) -> Self {
        Self {
            p1: 0x00,
            p2: 0x00,
            data: fid.to_be_bytes().to_vec(),
        }
    }

    /// Ask for the next occurrence instead of the first; used to walk
    /// several applications sharing a partial name.
    pub fn next_occurrence(mut self) -> Self {
        self.p2 = (self.p2 & 0xF0) | 0x02;
        self
    }

    /// Ask for no FCI in the response (P2 file-control-information bits).
    pub fn without_fci(mut self) -> Self {
        self.p2 = (self.p2 & 0x03) | 0x0C;
        self
    }
}

impl From<Select> for Command {
    fn from(select: Select) -> Self {
        Command::new(0x00, 0xA4, select.p1, select.p2).with_data(select.data)
    }
}

/// READ BINARY (INS 0xB0) at a 15-bit offset into the selected EF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBinary {
    offset: u16,
    le: u32,
}

impl ReadBinary {
    pub fn at(offset: u16) -> Self {
        Self { offset, le: 256 }
    }

    pub fn expect(mut self, le: u32) -> Self {
        self.le = le;
        self
    }
}

impl From<ReadBinary> for Command {
    fn from(read: ReadBinary) -> Self {
        // Bit 16 of P1 flags short-EF addressing, which this builder doesn't
        // do; offsets are limited to 15 bits.
        let [p1, p2] = (read.offset & 0x7FFF).to_be_bytes();
        Command::new(0x00, 0xB0, p1, p2).expect(read.le)
    }
}

/// READ RECORD (INS 0xB2), one record by number, optionally from a short EF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRecord {
    sfi: Option<u8>,
    record: u8,
    le: u32,
}

impl ReadRecord {
    /// Record `record` (1-based) of the currently selected EF.
    pub fn number(record: u8) -> Self {
        Self {
            sfi: None,
            record,
            le: 256,
        }
    }

    /// Record `record` of the file with short EF identifier `sfi` (1-30).
    pub fn in_sfi(sfi: u8, record: u8) -> Self {
        Self {
            sfi: Some(sfi),
            record,
            le: 256,
        }
    }

    pub fn expect(mut self, le: u32) -> Self {
        self.le = le;
        self
    }
}

impl From<ReadRecord> for Command {
    fn from(read: ReadRecord) -> Self {
        // P2 low bits 100 = "record number in P1".
        let p2 = (read.sfi.unwrap_or(0) << 3) | 0x04;
        Command::new(0x00, 0xB2, read.record, p2).expect(read.le)
    }
}

/// GET RESPONSE (INS 0xC0), for protocols that page long responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetResponse {
    le: u32,
}

impl GetResponse {
    /// `le` as announced by the card's `61XX` status (0x00 meaning 256).
    pub fn expect(le: u32) -> Self {
        Self { le }
    }
}

impl From<GetResponse> for Command {
    fn from(get: GetResponse) -> Self {
        Command::new(0x00, 0xC0, 0x00, 0x00).expect(get.le)
    }
}
