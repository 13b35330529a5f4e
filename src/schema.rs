//! Declarative, order-sensitive schemas over BER-TLV payloads.
//!
//! Card applications return deeply nested TLV blobs whose meaning depends on
//! position as much as on tags. A [`Schema`] describes the expected shape
//! once, and decoding yields a [`Value`] tree keyed by the schema's names.
//!
//! Children are matched against the TLV's children in declaration order:
//! `required` children must appear next, `optional` children may be skipped,
//! and `repeating` children consume every consecutive match into a list.
//! Failures carry the path of schema keys leading to the offending node.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use tracing::warn;

use crate::ber::{Tag, TlvNode};
use crate::errors::{Error, Result};

/// A decoded value tree.
///
/// Maps preserve schema declaration order; [`Value::get`] does a linear key
/// lookup, which is plenty for card payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(u64),
    Text(String),
    Map(Vec<(String, Value)>),
    List(Vec<Value>),
}

impl Value {
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }
}

/// Selection policy for a child schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurs {
    /// The child must appear next; its absence fails the decode.
    Required,
    /// The child may be skipped if the next node doesn't match.
    Optional,
    /// Consecutive matching children are collected into a [`Value::List`].
    Repeating,
}

/// Decoder for a primitive node's raw value bytes.
pub type PrimitiveDecoder = Arc<dyn Fn(&[u8]) -> Result<Value> + Send + Sync>;

/// One node of a schema tree.
#[derive(Clone)]
pub struct Schema {
    key: String,
    tag: Option<Tag>,
    occurs: Occurs,
    node: SchemaNode,
}

#[derive(Clone)]
enum SchemaNode {
    Constructed(Vec<Schema>),
    Primitive(PrimitiveDecoder),
}

impl Schema {
    /// A constructed node with an ordered list of child schemas.
    pub fn constructed<S: Into<String>>(key: S, children: Vec<Schema>) -> Self {
        Self {
            key: key.into(),
            tag: None,
            occurs: Occurs::Required,
            node: SchemaNode::Constructed(children),
        }
    }

    /// A primitive node whose value bytes run through `decoder`.
    pub fn primitive<S, F>(key: S, decoder: F) -> Self
    where
        S: Into<String>,
        F: Fn(&[u8]) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            tag: None,
            occurs: Occurs::Required,
            node: SchemaNode::Primitive(Arc::new(decoder)),
        }
    }

    /// Requires the node's tag to match exactly (class, constructed flag and
    /// number). Without this, matching is purely positional.
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn optional(mut self) -> Self {
        self.occurs = Occurs::Optional;
        self
    }

    pub fn repeating(mut self) -> Self {
        self.occurs = Occurs::Repeating;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Decodes a parsed TLV against this schema.
    pub fn decode(&self, node: &TlvNode) -> Result<Value> {
        self.decode_at(node, &self.key)
    }

    /// Parses `data` as a single TLV and decodes it.
    pub fn decode_bytes(&self, data: &[u8]) -> Result<Value> {
        self.decode(&TlvNode::parse(data)?)
    }

    /// Does `node` come into question for this schema at all? Only tags are
    /// consulted; an untagged schema matches any node by position.
    fn matches(&self, node: &TlvNode) -> bool {
        match self.tag {
            Some(tag) => node.tag == tag,
            None => true,
        }
    }

    fn decode_at(&self, node: &TlvNode, path: &str) -> Result<Value> {
        if let Some(tag) = self.tag {
            if node.tag != tag {
                return Err(Error::protocol(format!(
                    "{}: expected tag {}, found {}",
                    path, tag, node.tag
                )));
            }
        }
        match &self.node {
            SchemaNode::Primitive(decoder) => {
                let bytes = node.as_primitive().ok_or_else(|| {
                    Error::protocol(format!("{}: expected a primitive value", path))
                })?;
                decoder(bytes).map_err(|e| {
                    Error::msg(
                        e.kind(),
                        format!("{}: {}", path, e.message().unwrap_or("decoder failed")),
                    )
                })
            }
            SchemaNode::Constructed(schemas) => {
                let actual = node.children().ok_or_else(|| {
                    Error::protocol(format!("{}: expected a constructed value", path))
                })?;
                let mut fields = Vec::with_capacity(schemas.len());
                let mut idx = 0;
                for schema in schemas {
                    let child_path = format!("{}.{}", path, schema.key);
                    match schema.occurs {
                        Occurs::Required => {
                            let child = actual.get(idx).ok_or_else(|| {
                                Error::protocol(format!("{}: missing required child", child_path))
                            })?;
                            fields.push((
                                schema.key.clone(),
                                schema.decode_at(child, &child_path)?,
                            ));
                            idx += 1;
                        }
                        Occurs::Optional => {
                            if let Some(child) = actual.get(idx) {
                                if schema.matches(child) {
                                    fields.push((
                                        schema.key.clone(),
                                        schema.decode_at(child, &child_path)?,
                                    ));
                                    idx += 1;
                                }
                            }
                        }
                        Occurs::Repeating => {
                            let mut items = Vec::new();
                            while let Some(child) = actual.get(idx) {
                                if !schema.matches(child) {
                                    break;
                                }
                                items.push(schema.decode_at(
                                    child,
                                    &format!("{}[{}]", child_path, items.len()),
                                )?);
                                idx += 1;
                            }
                            fields.push((schema.key.clone(), Value::List(items)));
                        }
                    }
                }
                if idx < actual.len() {
                    // Cards love appending proprietary fields; tolerate them.
                    warn!(
                        path,
                        extra = actual.len() - idx,
                        "unmatched trailing TLV children"
                    );
                }
                Ok(Value::Map(fields))
            }
        }
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Schema");
        s.field("key", &self.key);
        s.field("occurs", &self.occurs);
        if let Some(tag) = &self.tag {
            s.field("tag", tag);
        }
        match &self.node {
            SchemaNode::Constructed(children) => s.field("children", children),
            SchemaNode::Primitive(_) => s.field("decoder", &".."),
        };
        s.finish()
    }
}

/// Stock primitive decoders.
pub mod decode {
    use super::*;

    /// UTF-8 text; malformed sequences are a protocol error.
    pub fn text(bytes: &[u8]) -> Result<Value> {
        let (text, _, malformed) = encoding_rs::UTF_8.decode(bytes);
        if malformed {
            return Err(Error::protocol("malformed UTF-8 text"));
        }
        Ok(Value::Text(text.into_owned()))
    }

    /// Big-endian unsigned integer, 1-8 bytes. The empty value is zero, as
    /// some cards encode it.
    pub fn uint(bytes: &[u8]) -> Result<Value> {
        match bytes.len() {
            0 => Ok(Value::Int(0)),
            1..=8 => Ok(Value::Int(BigEndian::read_uint(bytes, bytes.len()))),
            n => Err(Error::protocol(format!("integer too wide: {} bytes", n))),
        }
    }

    /// Exactly two big-endian bytes.
    pub fn be_u16(bytes: &[u8]) -> Result<Value> {
        if bytes.len() != 2 {
            return Err(Error::protocol(format!(
                "expected 2 bytes, found {}",
                bytes.len()
            )));
        }
        Ok(Value::Int(BigEndian::read_u16(bytes) as u64))
    }

    /// The raw value bytes, untouched.
    pub fn bytes(bytes: &[u8]) -> Result<Value> {
        Ok(Value::Bytes(bytes.to_vec()))
    }

    /// Compressed numeric: packed BCD digits, right-padded with 0xF nibbles.
    /// Decodes to text so leading zeros survive.
    pub fn numeric(bytes: &[u8]) -> Result<Value> {
        let mut text = String::with_capacity(bytes.len() * 2);
        let mut padded = false;
        for &b in bytes {
            for nibble in [b >> 4, b & 0x0F] {
                match nibble {
                    0..=9 if !padded => text.push(char::from(b'0' + nibble)),
                    0..=9 => return Err(Error::protocol("digit after BCD padding")),
                    0x0F => padded = true,
                    _ => {
                        return Err(Error::protocol(format!(
                            "invalid BCD nibble: {:X}",
                            nibble
                        )))
                    }
                }
            }
        }
        Ok(Value::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::Class;
    use crate::errors::ErrorKind;

    // The recurring example: 30 08 81 02 4A 50 82 02 00 2A.
    fn country_seq() -> Vec<u8> {
        vec![0x30, 0x08, 0x81, 0x02, 0x4A, 0x50, 0x82, 0x02, 0x00, 0x2A]
    }

    fn country_schema() -> Schema {
        Schema::constructed(
            "country",
            vec![
                Schema::primitive("code", decode::text),
                Schema::primitive("seq", decode::be_u16),
            ],
        )
    }

    #[test]
    fn test_decode_positional() {
        let value = country_schema()
            .decode_bytes(&country_seq())
            .expect("couldn't decode");
        assert_eq!(value.get("code").and_then(Value::as_text), Some("JP"));
        assert_eq!(value.get("seq").and_then(Value::as_int), Some(42));
    }

    #[test]
    fn test_decode_tagged() {
        let schema = Schema::constructed(
            "country",
            vec![
                Schema::primitive("code", decode::text)
                    .tag(Tag::new(Class::ContextSpecific, false, 1)),
                Schema::primitive("seq", decode::be_u16)
                    .tag(Tag::new(Class::ContextSpecific, false, 2)),
            ],
        )
        .tag(Tag::new(Class::Universal, true, 16));
        let value = schema.decode_bytes(&country_seq()).expect("couldn't decode");
        assert_eq!(value.get("code").and_then(Value::as_text), Some("JP"));
    }

    #[test]
    fn test_order_sensitivity() {
        // Same children, swapped: 82 first, then 81. The tagged schema
        // requires 0x81 first and must refuse.
        let swapped = vec![0x30, 0x08, 0x82, 0x02, 0x00, 0x2A, 0x81, 0x02, 0x4A, 0x50];
        let schema = Schema::constructed(
            "country",
            vec![
                Schema::primitive("code", decode::text)
                    .tag(Tag::new(Class::ContextSpecific, false, 1)),
                Schema::primitive("seq", decode::be_u16)
                    .tag(Tag::new(Class::ContextSpecific, false, 2)),
            ],
        );
        let err = schema.decode_bytes(&swapped).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert!(err.message().unwrap().contains("country.code"));
    }

    #[test]
    fn test_missing_required() {
        let short = vec![0x30, 0x04, 0x81, 0x02, 0x4A, 0x50];
        let err = country_schema().decode_bytes(&short).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert!(err.message().unwrap().contains("country.seq"));
    }

    #[test]
    fn test_optional_skipped() {
        let schema = Schema::constructed(
            "country",
            vec![
                Schema::primitive("flag", decode::bytes)
                    .tag(Tag::new(Class::ContextSpecific, false, 0))
                    .optional(),
                Schema::primitive("code", decode::text)
                    .tag(Tag::new(Class::ContextSpecific, false, 1)),
                Schema::primitive("seq", decode::be_u16)
                    .tag(Tag::new(Class::ContextSpecific, false, 2)),
            ],
        );
        let value = schema.decode_bytes(&country_seq()).expect("couldn't decode");
        assert_eq!(value.get("flag"), None);
        assert_eq!(value.get("code").and_then(Value::as_text), Some("JP"));
    }

    #[test]
    fn test_repeating_collects_in_order() {
        // 30 0C with three 0x81 entries and a trailing 0x82.
        let bin = vec![
            0x30, 0x0C, 0x81, 0x01, 0x0A, 0x81, 0x01, 0x0B, 0x81, 0x01, 0x0C, 0x82, 0x01, 0x2A,
        ];
        let schema = Schema::constructed(
            "list",
            vec![
                Schema::primitive("entries", decode::uint)
                    .tag(Tag::new(Class::ContextSpecific, false, 1))
                    .repeating(),
                Schema::primitive("seq", decode::uint)
                    .tag(Tag::new(Class::ContextSpecific, false, 2)),
            ],
        );
        let value = schema.decode_bytes(&bin).expect("couldn't decode");
        let entries = value.get("entries").and_then(Value::as_list).unwrap();
        assert_eq!(
            entries,
            &[Value::Int(0x0A), Value::Int(0x0B), Value::Int(0x0C)]
        );
        assert_eq!(value.get("seq").and_then(Value::as_int), Some(42));
    }

    #[test]
    fn test_repeating_empty_is_empty_list() {
        let bin = vec![0x30, 0x03, 0x82, 0x01, 0x2A];
        let schema = Schema::constructed(
            "list",
            vec![
                Schema::primitive("entries", decode::uint)
                    .tag(Tag::new(Class::ContextSpecific, false, 1))
                    .repeating(),
                Schema::primitive("seq", decode::uint)
                    .tag(Tag::new(Class::ContextSpecific, false, 2)),
            ],
        );
        let value = schema.decode_bytes(&bin).expect("couldn't decode");
        assert_eq!(value.get("entries").and_then(Value::as_list), Some(&[][..]));
    }

    #[test]
    fn test_nested_path_diagnostics() {
        // holder > name, with a non-UTF-8 name.
        let bin = vec![0x30, 0x06, 0x30, 0x04, 0x81, 0x02, 0xFF, 0xFE];
        let schema = Schema::constructed(
            "record",
            vec![Schema::constructed(
                "holder",
                vec![Schema::primitive("name", decode::text)],
            )],
        );
        let err = schema.decode_bytes(&bin).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert!(
            err.message().unwrap().contains("record.holder.name"),
            "missing path in: {}",
            err
        );
    }

    #[test]
    fn test_primitive_vs_constructed_mismatch() {
        let bin = vec![0x81, 0x01, 0xAA];
        let schema = Schema::constructed("root", vec![]);
        let err = schema.decode_bytes(&bin).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn test_decoder_numeric() {
        assert_eq!(
            decode::numeric(&[0x12, 0x3F]).unwrap(),
            Value::Text("123".into())
        );
        assert_eq!(
            decode::numeric(&[0x01, 0x70]).unwrap(),
            Value::Text("0170".into())
        );
        assert_eq!(decode::numeric(&[]).unwrap(), Value::Text("".into()));
        decode::numeric(&[0x1A]).expect_err("non-digit nibble didn't fail");
        decode::numeric(&[0x1F, 0x23]).expect_err("digit after padding didn't fail");
    }

    #[test]
    fn test_decoder_uint_widths() {
        assert_eq!(decode::uint(&[]).unwrap(), Value::Int(0));
        assert_eq!(decode::uint(&[0x2A]).unwrap(), Value::Int(42));
        assert_eq!(
            decode::uint(&[0x01, 0x00, 0x00]).unwrap(),
            Value::Int(65536)
        );
        decode::uint(&[0u8; 9]).expect_err("9-byte integer didn't fail");
    }
}
