//! Packet schema table — the on-wire layouts for all Mycel traffic.
//!
//! These tables ARE the protocol. Every field, every body size, every id is
//! part of the wire format and must be bit-identical across nodes; there is
//! no schema negotiation. Ids 0-13 are sized for the ESP-NOW 245-byte MTU,
//! ids 20-33 for the RYLR-998 LoRa 235-byte MTU.
//!
//! Every packet begins with four uniform bytes
//! (`version`, `reserved`, `schema_id`, `flags`); the schema describes what
//! follows. Only the final field may be variable-length.

use thiserror::Error;

/// Highest protocol version this node understands. Packets with a greater
/// version byte are dropped without reply.
pub const PROTOCOL_VERSION: u8 = 0;

/// How a field's bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Big-endian unsigned integer; `len` is 1, 2, or 4.
    Uint,
    /// Raw bytes. `len > 0` means exact-length; `len == 0` with
    /// `max_len > 0` means the variable trailing field.
    Bytes,
}

/// One field in a schema layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub len: usize,
    pub kind: FieldKind,
    /// Non-zero only for the variable trailing field.
    pub max_len: usize,
}

const fn uint(name: &'static str, len: usize) -> Field {
    Field { name, len, kind: FieldKind::Uint, max_len: 0 }
}

const fn fixed(name: &'static str, len: usize) -> Field {
    Field { name, len, kind: FieldKind::Bytes, max_len: 0 }
}

const fn body(max_len: usize) -> Field {
    Field { name: "body", len: 0, kind: FieldKind::Bytes, max_len }
}

/// A numbered wire layout.
#[derive(Debug, PartialEq, Eq)]
pub struct Schema {
    pub id: u8,
    pub fields: &'static [Field],
}

impl Schema {
    /// Maximum length of the trailing body field.
    pub fn max_body(&self) -> usize {
        self.fields
            .iter()
            .find(|f| f.name == "body")
            .map(|f| f.max_len)
            .unwrap_or(0)
    }

    /// Maximum number of packets in a sequence: 2^(8·|seq_size|), or 1 for
    /// schemas without sequencing.
    pub fn max_seq(&self) -> usize {
        match self.field("seq_size") {
            Some(f) => 1usize << (8 * f.len),
            None => 1,
        }
    }

    /// Largest blob this schema can carry across a full sequence.
    pub fn max_blob(&self) -> usize {
        self.max_seq() * self.max_body()
    }

    pub fn field(&self, name: &str) -> Option<&'static Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Sequencing capability: packet_id + seq_id + seq_size + body.
    pub fn supports_sequence(&self) -> bool {
        self.has("packet_id") && self.has("seq_id") && self.has("seq_size") && self.has("body")
    }

    /// Multi-hop routing capability: carries a ttl.
    pub fn supports_routing(&self) -> bool {
        self.has("ttl")
    }

    /// One-hop relay capability: addressed but without a ttl.
    pub fn supports_relay(&self) -> bool {
        self.has("to_addr") && !self.has("ttl")
    }

    pub fn has_checksum(&self) -> bool {
        self.has("checksum")
    }
}

// ── The table ─────────────────────────────────────────────────────────────────

static SCHEMAS: &[Schema] = &[
    // ESP-NOW, single packet
    Schema { id: 0, fields: &[uint("packet_id", 1), body(245)] },
    Schema { id: 1, fields: &[uint("packet_id", 1), fixed("checksum", 4), body(241)] },
    // ESP-NOW, sequenced (u8 ids)
    Schema {
        id: 2,
        fields: &[uint("packet_id", 1), uint("seq_id", 1), uint("seq_size", 1), body(243)],
    },
    Schema {
        id: 3,
        fields: &[
            uint("packet_id", 1),
            uint("seq_id", 1),
            uint("seq_size", 1),
            fixed("checksum", 4),
            body(239),
        ],
    },
    // ESP-NOW, sequenced (u16 ids)
    Schema {
        id: 4,
        fields: &[
            uint("packet_id", 2),
            uint("seq_id", 1),
            uint("seq_size", 2),
            fixed("checksum", 4),
            body(237),
        ],
    },
    // ESP-NOW, routed (ttl)
    Schema {
        id: 5,
        fields: &[
            uint("packet_id", 1),
            uint("ttl", 1),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(211),
        ],
    },
    Schema {
        id: 6,
        fields: &[
            uint("packet_id", 1),
            uint("ttl", 1),
            fixed("checksum", 4),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(207),
        ],
    },
    Schema {
        id: 7,
        fields: &[
            uint("packet_id", 1),
            uint("seq_id", 1),
            uint("seq_size", 1),
            uint("ttl", 1),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(209),
        ],
    },
    Schema {
        id: 8,
        fields: &[
            uint("packet_id", 1),
            uint("seq_id", 1),
            uint("seq_size", 1),
            uint("ttl", 1),
            fixed("checksum", 4),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(205),
        ],
    },
    Schema {
        id: 9,
        fields: &[
            uint("packet_id", 2),
            uint("seq_id", 1),
            uint("seq_size", 2),
            uint("ttl", 1),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(207),
        ],
    },
    Schema {
        id: 10,
        fields: &[
            uint("packet_id", 2),
            uint("seq_id", 1),
            uint("seq_size", 2),
            uint("ttl", 1),
            fixed("checksum", 4),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(203),
        ],
    },
    // ESP-NOW, one-hop relay (no ttl)
    Schema {
        id: 11,
        fields: &[
            uint("packet_id", 1),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(216),
        ],
    },
    Schema {
        id: 12,
        fields: &[
            uint("packet_id", 1),
            uint("seq_id", 1),
            uint("seq_size", 1),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(214),
        ],
    },
    Schema {
        id: 13,
        fields: &[
            uint("packet_id", 2),
            uint("seq_id", 1),
            uint("seq_size", 2),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(212),
        ],
    },
    // LoRa, single packet
    Schema { id: 20, fields: &[uint("packet_id", 1), body(235)] },
    Schema { id: 21, fields: &[uint("packet_id", 1), fixed("checksum", 4), body(231)] },
    // LoRa, sequenced (u8 ids)
    Schema {
        id: 22,
        fields: &[uint("packet_id", 1), uint("seq_id", 1), uint("seq_size", 1), body(233)],
    },
    Schema {
        id: 23,
        fields: &[
            uint("packet_id", 1),
            uint("seq_id", 1),
            uint("seq_size", 1),
            fixed("checksum", 4),
            body(229),
        ],
    },
    // LoRa, sequenced (u16 ids)
    Schema {
        id: 24,
        fields: &[
            uint("packet_id", 2),
            uint("seq_id", 1),
            uint("seq_size", 2),
            fixed("checksum", 4),
            body(227),
        ],
    },
    // LoRa, routed (ttl)
    Schema {
        id: 25,
        fields: &[
            uint("packet_id", 1),
            uint("ttl", 1),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(201),
        ],
    },
    Schema {
        id: 26,
        fields: &[
            uint("packet_id", 1),
            uint("ttl", 1),
            fixed("checksum", 4),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(197),
        ],
    },
    Schema {
        id: 27,
        fields: &[
            uint("packet_id", 1),
            uint("seq_id", 1),
            uint("seq_size", 1),
            uint("ttl", 1),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(199),
        ],
    },
    Schema {
        id: 28,
        fields: &[
            uint("packet_id", 1),
            uint("seq_id", 1),
            uint("seq_size", 1),
            uint("ttl", 1),
            fixed("checksum", 4),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(195),
        ],
    },
    Schema {
        id: 29,
        fields: &[
            uint("packet_id", 2),
            uint("seq_id", 1),
            uint("seq_size", 2),
            uint("ttl", 1),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(197),
        ],
    },
    Schema {
        id: 30,
        fields: &[
            uint("packet_id", 2),
            uint("seq_id", 1),
            uint("seq_size", 2),
            uint("ttl", 1),
            fixed("checksum", 4),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(193),
        ],
    },
    // LoRa, one-hop relay (no ttl)
    Schema {
        id: 31,
        fields: &[
            uint("packet_id", 1),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(206),
        ],
    },
    Schema {
        id: 32,
        fields: &[
            uint("packet_id", 1),
            uint("seq_id", 1),
            uint("seq_size", 1),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(204),
        ],
    },
    Schema {
        id: 33,
        fields: &[
            uint("packet_id", 2),
            uint("seq_id", 1),
            uint("seq_size", 2),
            uint("tree_state", 1),
            fixed("to_addr", 16),
            fixed("from_addr", 16),
            body(202),
        ],
    },
];

/// All defined schema ids, in table order.
pub fn all_schema_ids() -> Vec<u8> {
    SCHEMAS.iter().map(|s| s.id).collect()
}

/// Look up a schema by id.
pub fn get_schema(id: u8) -> Result<&'static Schema, WireError> {
    SCHEMAS
        .iter()
        .find(|s| s.id == id)
        .ok_or(WireError::UnknownSchema(id))
}

/// Look up several schemas, skipping unknown ids.
pub fn get_schemas(ids: &[u8]) -> Vec<&'static Schema> {
    ids.iter().filter_map(|id| get_schema(*id).ok()).collect()
}

/// Ids of schemas that can carry multi-packet sequences.
pub fn sequence_schema_ids() -> Vec<u8> {
    SCHEMAS.iter().filter(|s| s.supports_sequence()).map(|s| s.id).collect()
}

/// Ids of schemas that can be routed across multiple hops.
pub fn routing_schema_ids() -> Vec<u8> {
    SCHEMAS.iter().filter(|s| s.supports_routing()).map(|s| s.id).collect()
}

/// Ids of schemas that are addressed but relayed one hop at a time.
pub fn relay_schema_ids() -> Vec<u8> {
    SCHEMAS.iter().filter(|s| s.supports_relay()).map(|s| s.id).collect()
}

/// Ids of schemas that carry a CRC-32 body checksum.
pub fn checksum_schema_ids() -> Vec<u8> {
    SCHEMAS.iter().filter(|s| s.has_checksum()).map(|s| s.id).collect()
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown schema id: {0}")]
    UnknownSchema(u8),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("packet truncated: needed {needed} bytes, had {got}")]
    Truncated { needed: usize, got: usize },

    #[error("field `{name}` has length {got}, expected {expected}")]
    FieldLength { name: &'static str, got: usize, expected: usize },

    #[error("body length {got} exceeds schema maximum {max}")]
    BodyTooLarge { got: usize, max: usize },

    #[error("schema {0} is missing required field `{1}`")]
    MissingField(u8, &'static str),

    #[error("schema {0} does not carry a checksum")]
    ChecksumUnsupported(u8),
}
