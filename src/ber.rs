//! ISO 7816 flavoured BER-TLV (Tag-Length-Value) parsing and encoding.
//!
//! BER is an ASN.1 encoding, originally documented in ISO 8825; the subset
//! used by smartcards is the slightly odd dialect of ISO 7816-6, also
//! restated in EMV Book 3, Annex B (freely available from EMVCo's website).
//! Notably, the ecosystem refers to tags by their hex values (0x6F rather
//! than Application 15), so [`Tag`] keeps its raw composition visible and
//! prints as hex.
//!
//! Indefinite lengths are technically valid BER but not allowed in the
//! ISO 7816 subset, and are rejected here.

use byteorder::{BigEndian, ByteOrder};
use nom::bytes::complete::take;
use nom::number::complete::be_u8;

use crate::errors::{Error, Result};

pub type IResult<'a, T> = nom::IResult<&'a [u8], T>;

/// Tag class, bits 8-7 of the leading tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    Universal,
    Application,
    ContextSpecific,
    Private,
}

impl Class {
    fn from_bits(byte: u8) -> Self {
        match byte >> 6 {
            0b00 => Class::Universal,
            0b01 => Class::Application,
            0b10 => Class::ContextSpecific,
            _ => Class::Private,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Class::Universal => 0b00,
            Class::Application => 0b01,
            Class::ContextSpecific => 0b10,
            Class::Private => 0b11,
        }
    }
}

/// A parsed tag: class, constructed flag, and tag number.
///
/// A constructed value contains further TLV tuples; a primitive value is a
/// value in itself (a string, number, etc. depending on context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    pub class: Class,
    pub constructed: bool,
    pub number: u32,
}

impl Tag {
    pub const fn new(class: Class, constructed: bool, number: u32) -> Self {
        Self {
            class,
            constructed,
            number,
        }
    }

    /// Parses a tag from its wire bytes, eg. `Tag::from_bytes(&[0x9F, 0x11])`.
    pub fn from_bytes(bin: &[u8]) -> Result<Self> {
        let (rest, tag) = take_tag(bin)?;
        if !rest.is_empty() {
            return Err(Error::protocol("trailing bytes after tag"));
        }
        Ok(tag)
    }

    /// Serialises the tag. Numbers 0-30 fit the leading byte; larger ones
    /// spill into base-128 continuation bytes, MSB first.
    pub fn to_bytes(self) -> Vec<u8> {
        let leading = self.class.bits() << 6 | (self.constructed as u8) << 5;
        if self.number <= 30 {
            return vec![leading | self.number as u8];
        }
        let mut bin = vec![leading | 0b0001_1111];
        let mut shift = (32 - self.number.leading_zeros()).div_ceil(7) * 7;
        while shift > 0 {
            shift -= 7;
            let septet = (self.number >> shift) as u8 & 0x7F;
            bin.push(if shift == 0 { septet } else { septet | 0x80 });
        }
        bin
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x")?;
        for b in self.to_bytes() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// Parses a tag.
///
/// If bits 1-5 of the first byte are all set, this is a multi-byte tag: the
/// number continues in seven-bit groups, MSB first, until and including the
/// first byte without bit 8 set.
fn take_tag(data: &[u8]) -> IResult<'_, Tag> {
    let (mut rest, first) = be_u8(data)?;
    let class = Class::from_bits(first);
    let constructed = first & 0b0010_0000 != 0;
    let mut number = (first & 0b0001_1111) as u32;
    if number == 0b0001_1111 {
        number = 0;
        loop {
            let (r, b) = be_u8(rest)?;
            rest = r;
            if number > u32::MAX >> 7 {
                // Tag number won't fit in 32 bits; nothing sane emits these.
                return Err(nom::Err::Error(nom::error::Error::new(
                    data,
                    nom::error::ErrorKind::TooLarge,
                )));
            }
            number = number << 7 | (b & 0x7F) as u32;
            if b & 0x80 == 0 {
                break;
            }
        }
    }
    Ok((
        rest,
        Tag {
            class,
            constructed,
            number,
        },
    ))
}

/// Parses a length field.
fn take_len(data_: &[u8]) -> IResult<'_, usize> {
    let (data, lenlen) = be_u8(data_)?;
    if lenlen <= 127 {
        Ok((data, lenlen as usize))
    } else {
        let lensize = (lenlen & 0b0111_1111) as usize;
        // Error out if the length is too large for the target architecture,
        // or if it's indeterminate (0b1000_0000).
        if lensize < 1 || lensize > 8 || data.len() < lensize {
            Err(nom::Err::Error(nom::error::Error::new(
                data_, // Return the full input!
                nom::error::ErrorKind::TooLarge,
            )))
        } else {
            Ok((
                &data[lensize..],
                BigEndian::read_uint(data, lensize) as usize,
            ))
        }
    }
}

/// A decoded TLV value: primitive bytes, or an ordered list of children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvValue {
    Primitive(Vec<u8>),
    Constructed(Vec<TlvNode>),
}

/// One decoded tag-length-value triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvNode {
    pub tag: Tag,
    pub value: TlvValue,
}

impl TlvNode {
    pub fn primitive<T: Into<Vec<u8>>>(tag: Tag, value: T) -> Self {
        Self {
            tag,
            value: TlvValue::Primitive(value.into()),
        }
    }

    pub fn constructed(tag: Tag, children: Vec<TlvNode>) -> Self {
        Self {
            tag,
            value: TlvValue::Constructed(children),
        }
    }

    /// The encoded length of the value part.
    pub fn length(&self) -> usize {
        match &self.value {
            TlvValue::Primitive(v) => v.len(),
            TlvValue::Constructed(children) => {
                children.iter().map(|c| c.to_bytes().len()).sum()
            }
        }
    }

    pub fn as_primitive(&self) -> Option<&[u8]> {
        match &self.value {
            TlvValue::Primitive(v) => Some(v),
            TlvValue::Constructed(_) => None,
        }
    }

    pub fn children(&self) -> Option<&[TlvNode]> {
        match &self.value {
            TlvValue::Primitive(_) => None,
            TlvValue::Constructed(c) => Some(c),
        }
    }

    /// Parses exactly one TLV; trailing bytes are an error.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (rest, node) = take_node(data)?;
        if !rest.is_empty() {
            return Err(Error::protocol(format!(
                "{} trailing bytes after TLV",
                rest.len()
            )));
        }
        Ok(node)
    }

    /// Parses a sequence of TLVs until the input is exhausted.
    pub fn parse_all(data: &[u8]) -> Result<Vec<Self>> {
        let mut nodes = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let (r, node) = take_node(rest)?;
            rest = r;
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Serialises the node, minimal-length DER style.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bin = self.tag.to_bytes();
        let value = match &self.value {
            TlvValue::Primitive(v) => v.clone(),
            TlvValue::Constructed(children) => {
                let mut v = Vec::new();
                for child in children {
                    v.extend_from_slice(&child.to_bytes());
                }
                v
            }
        };
        write_len(&mut bin, value.len());
        bin.extend_from_slice(&value);
        bin
    }
}

fn write_len(bin: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        bin.push(len as u8);
    } else {
        let mut buf = [0u8; 8];
        BigEndian::write_uint(&mut buf, len as u64, 8);
        let skip = buf.iter().take_while(|&&b| b == 0).count().min(7);
        bin.push(0x80 | (8 - skip) as u8);
        bin.extend_from_slice(&buf[skip..]);
    }
}

/// Iterates the sibling TLVs of a blob, parsing lazily. Handy for walking
/// responses whose top level is a loose sequence rather than one template.
pub fn iter(data: &[u8]) -> TlvIter<'_> {
    TlvIter { rest: data }
}

/// See [`iter`]. After yielding an error, the iterator is exhausted.
pub struct TlvIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<TlvNode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match take_node(self.rest) {
            Ok((rest, node)) => {
                self.rest = rest;
                Some(Ok(node))
            }
            Err(err) => {
                self.rest = &[];
                Some(Err(err.into()))
            }
        }
    }
}

/// Parses the next TLV node from a blob, descending into constructed values.
/// A constructed value must be covered exactly by its children; a child
/// overrunning the parent's window fails the parse.
pub fn take_node(data: &[u8]) -> IResult<'_, TlvNode> {
    let (data, tag) = take_tag(data)?;
    let (data, len) = take_len(data)?;
    let (data, val) = take(len)(data)?;
    let value = if tag.constructed {
        let mut children = Vec::new();
        let mut window = val;
        while !window.is_empty() {
            let (rest, child) = take_node(window)?;
            window = rest;
            children.push(child);
        }
        TlvValue::Constructed(children)
    } else {
        TlvValue::Primitive(val.to_vec())
    };
    Ok((data, TlvNode { tag, value }))
}
