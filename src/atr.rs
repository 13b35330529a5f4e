//! ATR (Answer-to-Reset) parsing.
//!
//! Covered by ISO 7816-3 and, more readably, by the EMV L1 Contact Interface
//! Specification, Section 8: "Answer to Reset". Contactless backends often
//! hand back an ATS or a synthesised ATR here instead; parsing is strictly
//! best-effort diagnostics, and the session layer never lets a parse failure
//! affect the raw bytes it returns.
//!
//! Useful online ATR parser: https://smartcard-atr.apdu.fr/

use nom::bytes::complete::take;
use nom::combinator::cond;
use nom::number::complete::be_u8;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::errors::{Error, Result};

pub type IResult<'a, T> = nom::IResult<&'a [u8], T>;

/// Initial character TS, a known bit pattern telling the electrical
/// transmission convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Convention {
    /// Direct convention, 1 is high.
    Direct = 0x3B,
    /// Inverse convention, 1 is low. Rare, and deprecated by EMV.
    Inverse = 0x3F,
    #[num_enum(catch_all)]
    Invalid(u8) = 0xFF,
}

/// A transmission protocol, from the low nibble of a TD byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Protocol {
    T0 = 0,
    T1 = 1,
    #[num_enum(catch_all)]
    Invalid(u8) = 0xFF,
}

/// Interface byte TDn: a protocol plus the presence mask for the next group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TdByte {
    pub protocol: Protocol,
    pub mask: u8,
}

impl From<u8> for TdByte {
    fn from(v: u8) -> Self {
        Self {
            protocol: (v & 0x0F).into(),
            mask: v >> 4,
        }
    }
}

/// One TA/TB/TC/TD interface byte group. Which members exist is dictated by
/// the previous group's TD mask (or by T0, for the first group).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceGroup {
    pub ta: Option<u8>,
    pub tb: Option<u8>,
    pub tc: Option<u8>,
    pub td: Option<TdByte>,
}

fn take_group(data: &[u8], mask: u8) -> IResult<'_, InterfaceGroup> {
    let (data, ta) = cond(mask & 1 << 0 != 0, be_u8)(data)?;
    let (data, tb) = cond(mask & 1 << 1 != 0, be_u8)(data)?;
    let (data, tc) = cond(mask & 1 << 2 != 0, be_u8)(data)?;
    let (data, td) = cond(mask & 1 << 3 != 0, be_u8)(data)?;
    Ok((
        data,
        InterfaceGroup {
            ta,
            tb,
            tc,
            td: td.map(TdByte::from),
        },
    ))
}

/// Card status from the historical bytes: a life cycle status byte and/or a
/// status word, depending on how many bytes the card spent on it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusIndicator {
    pub lcs: Option<u8>,
    pub sw: Option<u16>,
}

/// Decoded historical bytes, keyed by the leading category indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoricalBytes {
    /// No historical bytes at all.
    Empty,
    /// Categories 0x00/0x10: a bare status indicator.
    Status(StatusIndicator),
    /// Category 0x80: COMPACT-TLV data objects. High nibble is the tag
    /// (kept in place, so "pre-issuing data" is 0x60), low nibble the length.
    CompactTlv(Vec<(u8, Vec<u8>)>),
    /// Anything else, kept verbatim.
    Unknown(u8, Vec<u8>),
}

impl HistoricalBytes {
    /// Looks up a COMPACT-TLV field by its (high-nibble) tag.
    pub fn compact_field(&self, tag: u8) -> Option<&[u8]> {
        match self {
            HistoricalBytes::CompactTlv(fields) => fields
                .iter()
                .find(|(t, _)| *t == tag)
                .map(|(_, v)| v.as_slice()),
            _ => None,
        }
    }
}

fn parse_status(data: &[u8]) -> Option<StatusIndicator> {
    match *data {
        [lcs] => Some(StatusIndicator {
            lcs: Some(lcs),
            sw: None,
        }),
        [sw1, sw2] => Some(StatusIndicator {
            lcs: None,
            sw: Some(u16::from_be_bytes([sw1, sw2])),
        }),
        [lcs, sw1, sw2] => Some(StatusIndicator {
            lcs: Some(lcs),
            sw: Some(u16::from_be_bytes([sw1, sw2])),
        }),
        _ => None,
    }
}

fn parse_compact_tlv(mut data: &[u8]) -> Option<Vec<(u8, Vec<u8>)>> {
    let mut fields = Vec::new();
    while let Some((&tl, rest)) = data.split_first() {
        let len = (tl & 0x0F) as usize;
        if rest.len() < len {
            return None;
        }
        fields.push((tl & 0xF0, rest[..len].to_vec()));
        data = &rest[len..];
    }
    Some(fields)
}

fn parse_historical(data: &[u8]) -> HistoricalBytes {
    match data.split_first() {
        None => HistoricalBytes::Empty,
        Some((cat @ (0x00 | 0x10), rest)) => match parse_status(rest) {
            Some(status) => HistoricalBytes::Status(status),
            None => HistoricalBytes::Unknown(*cat, rest.to_vec()),
        },
        Some((0x80, rest)) => match parse_compact_tlv(rest) {
            Some(fields) => HistoricalBytes::CompactTlv(fields),
            None => HistoricalBytes::Unknown(0x80, rest.to_vec()),
        },
        Some((cat, rest)) => HistoricalBytes::Unknown(*cat, rest.to_vec()),
    }
}

/// A parsed ATR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atr {
    /// Electrical transmission convention (TS).
    pub convention: Convention,
    /// Interface byte groups, in chain order.
    pub groups: Vec<InterfaceGroup>,
    /// Historical bytes, decoded.
    pub historical: HistoricalBytes,
    /// Historical bytes, verbatim.
    pub historical_raw: Vec<u8>,
    /// Checksum byte; absent when T=0 is the only offered protocol. The
    /// reader is trusted to have validated it.
    pub tck: Option<u8>,
}

impl Atr {
    /// The offered protocols, in first-mention order.
    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols = Vec::new();
        for group in &self.groups {
            if let Some(td) = group.td {
                if !protocols.contains(&td.protocol) {
                    protocols.push(td.protocol);
                }
            }
        }
        protocols
    }
}

pub fn parse(data: &[u8]) -> Result<Atr> {
    let (rest, ts) = be_u8(data)?;
    let convention: Convention = ts.into();
    if let Convention::Invalid(_) = convention {
        return Err(Error::protocol("invalid TS byte"));
    }

    // T0: K (number of historical bytes) below, first group's mask above.
    let (mut rest, t0) = be_u8(rest)?;
    let historical_len = t0 & 0x0F;
    let mut mask = t0 >> 4;
    let mut groups = Vec::new();
    while mask != 0 {
        let (r, group) = take_group(rest, mask)?;
        rest = r;
        mask = group.td.map(|td| td.mask).unwrap_or(0);
        groups.push(group);
    }

    let (rest, historical_raw) = take(historical_len)(rest)?;
    let tck = match *rest {
        [] => None,
        [tck] => Some(tck),
        _ => return Err(Error::protocol("trailing bytes after ATR")),
    };

    Ok(Atr {
        convention,
        groups,
        historical: parse_historical(historical_raw),
        historical_raw: historical_raw.to_vec(),
        tck,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_t1_with_status() {
        // TS direct; T0=0x94: K=4, TA1+TD1 present. TD1 chains to TD2.
        let atr = parse(&[0x3B, 0x94, 0x96, 0x81, 0x01, 0x00, 0x00, 0x90, 0x00, 0x42])
            .expect("couldn't parse ATR");
        assert_eq!(atr.convention, Convention::Direct);
        assert_eq!(atr.groups.len(), 2);
        assert_eq!(atr.groups[0].ta, Some(0x96));
        assert_eq!(
            atr.groups[0].td,
            Some(TdByte {
                protocol: Protocol::T1,
                mask: 0b1000,
            })
        );
        assert_eq!(
            atr.groups[1].td,
            Some(TdByte {
                protocol: Protocol::T1,
                mask: 0,
            })
        );
        assert_eq!(atr.protocols(), vec![Protocol::T1]);
        assert_eq!(
            atr.historical,
            HistoricalBytes::Status(StatusIndicator {
                lcs: Some(0x00),
                sw: Some(0x9000),
            })
        );
        assert_eq!(atr.tck, Some(0x42));
    }

    #[test]
    fn test_parse_t0_only_no_tck() {
        // T0=0x25: K=5, only TB1 present; T=0 implied, so no TCK.
        let atr = parse(&[0x3B, 0x25, 0x00, 0xC0, 0x00, 0x5A, 0x91, 0x10])
            .expect("couldn't parse ATR");
        assert_eq!(atr.groups.len(), 1);
        assert_eq!(atr.groups[0].tb, Some(0x00));
        assert_eq!(atr.groups[0].td, None);
        assert_eq!(atr.protocols(), vec![]);
        assert_eq!(
            atr.historical,
            HistoricalBytes::Unknown(0xC0, vec![0x00, 0x5A, 0x91, 0x10])
        );
        assert_eq!(atr.tck, None);
    }

    #[test]
    fn test_parse_compact_tlv_historical() {
        let atr = parse(&[
            0x3B, 0x88, 0x01, 0x80, 0x31, 0xA5, 0x62, 0x0B, 0x0C, 0x41, 0x0D, 0x77,
        ])
        .expect("couldn't parse ATR");
        assert_eq!(
            atr.historical,
            HistoricalBytes::CompactTlv(vec![
                (0x30, vec![0xA5]),
                (0x60, vec![0x0B, 0x0C]),
                (0x40, vec![0x0D]),
            ])
        );
        // Pre-issuing data lives under 0x60.
        assert_eq!(atr.historical.compact_field(0x60), Some(&[0x0B, 0x0C][..]));
        assert_eq!(atr.historical.compact_field(0x50), None);
        assert_eq!(atr.historical_raw.len(), 8);
        assert_eq!(atr.tck, Some(0x77));
    }

    #[test]
    fn test_parse_no_historical() {
        let atr = parse(&[0x3B, 0x00]).expect("couldn't parse ATR");
        assert_eq!(atr.groups, vec![]);
        assert_eq!(atr.historical, HistoricalBytes::Empty);
        assert_eq!(atr.tck, None);
    }

    #[test]
    fn test_parse_truncated() {
        parse(&[0x3B]).expect_err("truncated ATR didn't fail");
        parse(&[0x3B, 0x94, 0x96]).expect_err("truncated interface bytes didn't fail");
    }

    #[test]
    fn test_parse_invalid_ts() {
        parse(&[0x42, 0x00]).expect_err("invalid TS didn't fail");
    }

    #[test]
    fn test_parse_malformed_compact_tlv_degrades() {
        // 0x67 claims 7 bytes of pre-issuing data; only one follows.
        let atr = parse(&[0x3B, 0x03, 0x80, 0x67, 0xAA]).expect("couldn't parse ATR");
        assert_eq!(
            atr.historical,
            HistoricalBytes::Unknown(0x80, vec![0x67, 0xAA])
        );
    }
}
