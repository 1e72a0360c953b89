//! Sequence engine — fragments a blob into packets and reassembles it.
//!
//! A sequence is identified by a rolling u8 seq_id within the sender's
//! namespace. The wire `seq_size` field carries the packet count minus one;
//! this module works in actual counts and converts at the packet boundary.

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::flags::{Control, Flags};
use crate::packet::Packet;
use crate::schema::{Schema, WireError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("schema {0} does not support sequencing")]
    Unsupported(u8),

    #[error("blob of {got} bytes exceeds schema {schema} limit of {max}")]
    TooLarge { schema: u8, got: usize, max: usize },
}

/// Fragmentation / reassembly context for one blob.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub schema: &'static Schema,
    pub id: u8,
    data: Vec<u8>,
    /// Packet count (wire value is count − 1).
    pub seq_size: usize,
    max_body: usize,
    received: BTreeSet<u16>,
}

impl Sequence {
    /// Receiver-side constructor: sized from the wire seq_size field.
    pub fn for_incoming(
        schema: &'static Schema,
        id: u8,
        wire_seq_size: u16,
    ) -> Result<Self, SequenceError> {
        if !schema.supports_sequence() {
            return Err(SequenceError::Unsupported(schema.id));
        }
        let max_body = schema.max_body();
        let seq_size = wire_seq_size as usize + 1;
        Ok(Sequence {
            schema,
            id,
            data: vec![0u8; seq_size * max_body],
            seq_size,
            max_body,
            received: BTreeSet::new(),
        })
    }

    /// Sender-side constructor: empty until `set_data`.
    pub fn for_blob(schema: &'static Schema, id: u8, blob: &[u8]) -> Result<Self, SequenceError> {
        if !schema.supports_sequence() {
            return Err(SequenceError::Unsupported(schema.id));
        }
        let mut seq = Sequence {
            schema,
            id,
            data: Vec::new(),
            seq_size: 0,
            max_body: schema.max_body(),
            received: BTreeSet::new(),
        };
        seq.set_data(blob)?;
        Ok(seq)
    }

    /// Store the blob and pre-mark every fragment as present (the sender
    /// holds all of them by definition).
    pub fn set_data(&mut self, blob: &[u8]) -> Result<(), SequenceError> {
        let max = self.schema.max_blob();
        if blob.len() > max {
            return Err(SequenceError::TooLarge { schema: self.schema.id, got: blob.len(), max });
        }
        self.data = blob.to_vec();
        self.seq_size = blob.len().div_ceil(self.max_body);
        self.received = (0..self.seq_size as u16).collect();
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Build the fragment at `index`. Returns None for fragments not held.
    /// The first, middle, and last fragments demand an acknowledgement.
    pub fn get_packet(&self, index: u16, mut flags: Flags, template: &Packet) -> Option<Packet> {
        if !self.received.contains(&index) {
            return None;
        }
        let offset = index as usize * self.max_body;
        let end = (offset + self.max_body).min(self.data.len());

        if [0, self.seq_size.saturating_sub(1), self.seq_size / 2].contains(&(index as usize)) {
            flags.set_control(Control::Ask);
        }

        let mut p = template.clone();
        p.schema = self.schema;
        p.flags = flags;
        p.set_id(index);
        p.set("seq_id", self.id);
        let wire_size = (self.seq_size - 1) as u16;
        match self.schema.field("seq_size") {
            Some(f) if f.len == 2 => p.set("seq_size", wire_size),
            _ => p.set("seq_size", wire_size as u8),
        };
        p.set_body(Bytes::copy_from_slice(&self.data[offset..end]));
        if self.schema.has_checksum() {
            // infallible: guarded by has_checksum
            let _ = p.set_checksum();
        }
        Some(p)
    }

    /// Merge a received fragment into the buffer. The final fragment trims
    /// the buffer to the delivered length. Returns true once every
    /// fragment has arrived.
    pub fn add_packet(&mut self, packet: &Packet) -> Result<bool, WireError> {
        let index = packet.id();
        let body = packet.body();
        let offset = index as usize * self.max_body;
        if offset + body.len() > self.data.len() {
            return Err(WireError::BodyTooLarge {
                got: offset + body.len(),
                max: self.data.len(),
            });
        }
        let newly_seen = self.received.insert(index);
        self.data[offset..offset + body.len()].copy_from_slice(&body);
        if newly_seen && index as usize == self.seq_size - 1 {
            let trim = self.max_body - body.len();
            self.data.truncate(self.data.len() - trim);
        }
        Ok(self.received.len() == self.seq_size)
    }

    /// Indices not yet received.
    pub fn get_missing(&self) -> Vec<u16> {
        (0..self.seq_size as u16)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.seq_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::Flags;
    use crate::schema::get_schema;

    fn template(schema: &'static Schema) -> Packet {
        Packet::new(schema, Flags::default())
    }

    #[test]
    fn blob_splits_into_expected_fragments() {
        let schema = get_schema(2).unwrap(); // max_body 243
        let blob = vec![0xA5u8; 1000];
        let seq = Sequence::for_blob(schema, 1, &blob).unwrap();
        assert_eq!(seq.seq_size, 5); // ceil(1000/243)
        assert!(seq.get_missing().is_empty());
    }

    #[test]
    fn edge_fragments_demand_ack() {
        let schema = get_schema(2).unwrap();
        let blob = vec![1u8; 243 * 5];
        let seq = Sequence::for_blob(schema, 9, &blob).unwrap();
        let t = template(schema);

        for i in 0..5u16 {
            let p = seq.get_packet(i, Flags::default(), &t).unwrap();
            let expect_ask = matches!(i, 0 | 2 | 4); // first, middle, last
            assert_eq!(p.flags.ask(), expect_ask, "fragment {i}");
            assert_eq!(p.seq_id(), Some(9));
            assert_eq!(p.seq_size(), Some(4)); // wire carries count - 1
        }
    }

    #[test]
    fn reassembly_in_any_order_completes_once() {
        let schema = get_schema(2).unwrap();
        let blob: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let sender = Sequence::for_blob(schema, 3, &blob).unwrap();
        let t = template(schema);

        let mut receiver = Sequence::for_incoming(schema, 3, (sender.seq_size - 1) as u16).unwrap();
        let order = [4u16, 0, 3, 1, 2];
        let mut completions = 0;
        for (n, i) in order.iter().enumerate() {
            let p = sender.get_packet(*i, Flags::default(), &t).unwrap();
            let done = receiver.add_packet(&p).unwrap();
            if done {
                completions += 1;
                assert_eq!(n, order.len() - 1);
            }
        }
        assert_eq!(completions, 1);
        assert!(receiver.get_missing().is_empty());
        assert_eq!(receiver.data(), &blob[..]);
    }

    #[test]
    fn short_final_fragment_trims_buffer() {
        let schema = get_schema(2).unwrap();
        let blob = vec![7u8; 500]; // 243 + 243 + 14
        let sender = Sequence::for_blob(schema, 1, &blob).unwrap();
        let t = template(schema);

        let mut receiver = Sequence::for_incoming(schema, 1, 2).unwrap();
        for i in 0..3u16 {
            let p = sender.get_packet(i, Flags::default(), &t).unwrap();
            receiver.add_packet(&p).unwrap();
        }
        assert_eq!(receiver.data().len(), 500);
        assert_eq!(receiver.data(), &blob[..]);
    }

    #[test]
    fn missing_tracks_complement() {
        let schema = get_schema(2).unwrap();
        let blob = vec![1u8; 243 * 4];
        let sender = Sequence::for_blob(schema, 1, &blob).unwrap();
        let t = template(schema);

        let mut receiver = Sequence::for_incoming(schema, 1, 3).unwrap();
        for i in [0u16, 2] {
            let p = sender.get_packet(i, Flags::default(), &t).unwrap();
            assert!(!receiver.add_packet(&p).unwrap());
        }
        assert_eq!(receiver.get_missing(), vec![1, 3]);
    }

    #[test]
    fn oversized_blob_rejected() {
        let schema = get_schema(2).unwrap();
        let blob = vec![0u8; schema.max_blob() + 1];
        assert!(matches!(
            Sequence::for_blob(schema, 0, &blob),
            Err(SequenceError::TooLarge { .. })
        ));
    }

    #[test]
    fn non_sequence_schema_rejected() {
        let schema = get_schema(0).unwrap();
        assert_eq!(
            Sequence::for_blob(schema, 0, b"x").unwrap_err(),
            SequenceError::Unsupported(0)
        );
    }

    #[test]
    fn fragments_not_held_return_none() {
        let schema = get_schema(2).unwrap();
        let seq = Sequence::for_incoming(schema, 1, 3).unwrap();
        let t = template(schema);
        assert!(seq.get_packet(0, Flags::default(), &t).is_none());
    }
}
