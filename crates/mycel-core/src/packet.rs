//! Packet encode/decode against a schema.
//!
//! A decoded packet is a schema reference, a flag byte, and a set of field
//! values keyed by the schema's field names. Encoding walks the schema's
//! field list in order; decoding is the exact inverse. Integers are
//! big-endian on the wire.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::flags::Flags;
use crate::schema::{get_schema, FieldKind, Schema, WireError, PROTOCOL_VERSION};

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    Bytes(Bytes),
}

impl FieldValue {
    /// The value as an unsigned integer, if it is one.
    pub fn as_uint(&self) -> Option<u32> {
        match self {
            FieldValue::U8(v) => Some(*v as u32),
            FieldValue::U16(v) => Some(*v as u32),
            FieldValue::U32(v) => Some(*v),
            FieldValue::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<u8> for FieldValue {
    fn from(v: u8) -> Self {
        FieldValue::U8(v)
    }
}

impl From<u16> for FieldValue {
    fn from(v: u16) -> Self {
        FieldValue::U16(v)
    }
}

impl From<Bytes> for FieldValue {
    fn from(v: Bytes) -> Self {
        FieldValue::Bytes(v)
    }
}

/// A single framed datagram: one schema-typed transport unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub schema: &'static Schema,
    pub flags: Flags,
    fields: BTreeMap<&'static str, FieldValue>,
}

impl Packet {
    pub fn new(schema: &'static Schema, flags: Flags) -> Self {
        Packet { schema, flags, fields: BTreeMap::new() }
    }

    /// Set a field by name. The name must belong to the packet's schema;
    /// unknown names are ignored at encode time, so callers can reuse one
    /// field set across schema variants.
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> &mut Self {
        if let Some(field) = self.schema.field(name) {
            self.fields.insert(field.name, value.into());
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Rolling per-sender packet id, or fragment index within a sequence.
    pub fn id(&self) -> u16 {
        self.get("packet_id").and_then(|v| v.as_uint()).unwrap_or(0) as u16
    }

    pub fn set_id(&mut self, id: u16) {
        match self.schema.field("packet_id") {
            Some(f) if f.len == 2 => self.set("packet_id", id),
            _ => self.set("packet_id", id as u8),
        };
    }

    pub fn body(&self) -> Bytes {
        self.get("body")
            .and_then(|v| v.as_bytes())
            .cloned()
            .unwrap_or_else(Bytes::new)
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.set("body", body);
    }

    pub fn seq_id(&self) -> Option<u8> {
        self.get("seq_id").and_then(|v| v.as_uint()).map(|v| v as u8)
    }

    /// Wire-encoded sequence size (actual packet count minus one).
    pub fn seq_size(&self) -> Option<u16> {
        self.get("seq_size").and_then(|v| v.as_uint()).map(|v| v as u16)
    }

    pub fn ttl(&self) -> Option<u8> {
        self.get("ttl").and_then(|v| v.as_uint()).map(|v| v as u8)
    }

    pub fn tree_state(&self) -> Option<u8> {
        self.get("tree_state").and_then(|v| v.as_uint()).map(|v| v as u8)
    }

    pub fn to_addr(&self) -> Option<[u8; 16]> {
        self.get("to_addr")
            .and_then(|v| v.as_bytes())
            .and_then(|b| b.as_ref().try_into().ok())
    }

    pub fn from_addr(&self) -> Option<[u8; 16]> {
        self.get("from_addr")
            .and_then(|v| v.as_bytes())
            .and_then(|b| b.as_ref().try_into().ok())
    }

    /// Compute `crc32(body)` into the checksum field. Returns an error for
    /// schemas that do not carry a checksum.
    pub fn set_checksum(&mut self) -> Result<(), WireError> {
        if !self.schema.has_checksum() {
            return Err(WireError::ChecksumUnsupported(self.schema.id));
        }
        let crc = crc32fast::hash(&self.body());
        self.fields
            .insert("checksum", FieldValue::Bytes(Bytes::copy_from_slice(&crc.to_be_bytes())));
        Ok(())
    }

    /// True when the packet has no checksum field, or the checksum matches
    /// `crc32(body)`.
    pub fn checksum_ok(&self) -> bool {
        match self.get("checksum").and_then(|v| v.as_bytes()) {
            None => true,
            Some(sum) => sum.as_ref() == crc32fast::hash(&self.body()).to_be_bytes(),
        }
    }

    /// Serialize to wire bytes: the uniform four-byte header followed by
    /// the schema's fields in declaration order. Absent integer fields
    /// encode as zero; absent byte fields as zeroes of their fixed length.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut out = Vec::with_capacity(4 + self.schema.max_body());
        out.push(PROTOCOL_VERSION);
        out.push(0); // reserved
        out.push(self.schema.id);
        out.push(self.flags.into());

        for field in self.schema.fields {
            match field.kind {
                FieldKind::Uint => {
                    let v = self
                        .fields
                        .get(field.name)
                        .and_then(|v| v.as_uint())
                        .unwrap_or(0);
                    match field.len {
                        1 => out.push(v as u8),
                        2 => out.extend_from_slice(&(v as u16).to_be_bytes()),
                        _ => out.extend_from_slice(&v.to_be_bytes()),
                    }
                }
                FieldKind::Bytes if field.len > 0 => {
                    match self.fields.get(field.name).and_then(|v| v.as_bytes()) {
                        Some(b) if b.len() == field.len => out.extend_from_slice(b),
                        Some(b) => {
                            return Err(WireError::FieldLength {
                                name: field.name,
                                got: b.len(),
                                expected: field.len,
                            })
                        }
                        None => out.extend(std::iter::repeat(0u8).take(field.len)),
                    }
                }
                FieldKind::Bytes => {
                    // variable trailing field
                    let b = self
                        .fields
                        .get(field.name)
                        .and_then(|v| v.as_bytes())
                        .cloned()
                        .unwrap_or_else(Bytes::new);
                    if b.len() > field.max_len {
                        return Err(WireError::BodyTooLarge { got: b.len(), max: field.max_len });
                    }
                    out.extend_from_slice(&b);
                }
            }
        }
        Ok(Bytes::from(out))
    }

    /// Decode a datagram. Rejects unknown schemas, short packets, and
    /// packets from a future protocol version.
    pub fn decode(data: &[u8]) -> Result<Packet, WireError> {
        if data.len() < 4 {
            return Err(WireError::Truncated { needed: 4, got: data.len() });
        }
        let version = data[0];
        if version > PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let schema = get_schema(data[2])?;
        let flags = Flags::new(data[3]);

        let mut packet = Packet::new(schema, flags);
        let mut at = 4;
        for field in schema.fields {
            match field.kind {
                FieldKind::Uint => {
                    if data.len() < at + field.len {
                        return Err(WireError::Truncated { needed: at + field.len, got: data.len() });
                    }
                    let raw = &data[at..at + field.len];
                    let value = match field.len {
                        1 => FieldValue::U8(raw[0]),
                        2 => FieldValue::U16(u16::from_be_bytes(raw.try_into().unwrap())),
                        _ => FieldValue::U32(u32::from_be_bytes(raw.try_into().unwrap())),
                    };
                    packet.fields.insert(field.name, value);
                    at += field.len;
                }
                FieldKind::Bytes if field.len > 0 => {
                    if data.len() < at + field.len {
                        return Err(WireError::Truncated { needed: at + field.len, got: data.len() });
                    }
                    packet.fields.insert(
                        field.name,
                        FieldValue::Bytes(Bytes::copy_from_slice(&data[at..at + field.len])),
                    );
                    at += field.len;
                }
                FieldKind::Bytes => {
                    let rest = &data[at..];
                    if rest.len() > field.max_len {
                        return Err(WireError::BodyTooLarge { got: rest.len(), max: field.max_len });
                    }
                    packet.fields.insert(field.name, FieldValue::Bytes(Bytes::copy_from_slice(rest)));
                    at = data.len();
                }
            }
        }
        Ok(packet)
    }
}
