//! Trigger-log (audit-stream) record framing.
//!
//! When a transaction is configured with a log identifier, the commit engine
//! appends one [`TriggerRecord`] per commit to the identified log, describing
//! the relations added and removed. Consumers replay the stream to drive
//! triggers or external change-data capture.

use bytes::Bytes;
use quiver_codec::{decode_varint, encode_varint, varint_len, BufReader, BufWriter, DecodeError};

/// One relation as it appears in the trigger log: the owning vertex at
/// position 0 and the physical entry written under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEntry {
    pub vertex_id: u64,
    pub column: Bytes,
    pub value: Bytes,
}

impl TriggerEntry {
    fn encode(&self, out: &mut impl BufWriter) {
        encode_varint(self.vertex_id, out);
        encode_varint(self.column.len() as u64, out);
        out.put_slice(&self.column);
        encode_varint(self.value.len() as u64, out);
        out.put_slice(&self.value);
    }

    fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let vertex_id = decode_varint(reader)?;
        let column_len = decode_varint(reader)? as usize;
        let column = Bytes::copy_from_slice(reader.get_slice(column_len)?);
        let value_len = decode_varint(reader)? as usize;
        let value = Bytes::copy_from_slice(reader.get_slice(value_len)?);
        Ok(Self {
            vertex_id,
            column,
            value,
        })
    }

    fn encoded_len(&self) -> usize {
        varint_len(self.vertex_id)
            + varint_len(self.column.len() as u64)
            + self.column.len()
            + varint_len(self.value.len() as u64)
            + self.value.len()
    }
}

/// One audit record per committed transaction.
///
/// ```text
/// <commit_time(8)><tx_id(varint)>
/// <added_count(varint)>[<entry>...]
/// <removed_count(varint)>[<entry>...]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TriggerRecord {
    pub commit_time: i64,
    pub tx_id: u64,
    pub added: Vec<TriggerEntry>,
    pub removed: Vec<TriggerEntry>,
}

impl TriggerRecord {
    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_i64(self.commit_time);
        encode_varint(self.tx_id, out);
        encode_varint(self.added.len() as u64, out);
        for entry in &self.added {
            entry.encode(out);
        }
        encode_varint(self.removed.len() as u64, out);
        for entry in &self.removed {
            entry.encode(out);
        }
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let commit_time = reader.get_i64()?;
        let tx_id = decode_varint(reader)?;
        let decode_entries = |reader: &mut _| -> Result<Vec<TriggerEntry>, DecodeError> {
            let count = decode_varint(reader)? as usize;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                entries.push(TriggerEntry::decode(reader)?);
            }
            Ok(entries)
        };
        let added = decode_entries(reader)?;
        let removed = decode_entries(reader)?;
        Ok(Self {
            commit_time,
            tx_id,
            added,
            removed,
        })
    }

    pub fn encoded_len(&self) -> usize {
        8 + varint_len(self.tx_id)
            + varint_len(self.added.len() as u64)
            + self.added.iter().map(TriggerEntry::encoded_len).sum::<usize>()
            + varint_len(self.removed.len() as u64)
            + self.removed.iter().map(TriggerEntry::encoded_len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry_strategy() -> impl Strategy<Value = TriggerEntry> {
        (
            1..u64::MAX,
            proptest::collection::vec(any::<u8>(), 0..48),
            proptest::collection::vec(any::<u8>(), 0..48),
        )
            .prop_map(|(vertex_id, column, value)| TriggerEntry {
                vertex_id,
                column: column.into(),
                value: value.into(),
            })
    }

    proptest! {
        #[test]
        fn trigger_record_roundtrip(
            commit_time in any::<i64>(),
            tx_id in any::<u64>(),
            added in proptest::collection::vec(entry_strategy(), 0..4),
            removed in proptest::collection::vec(entry_strategy(), 0..4),
        ) {
            let record = TriggerRecord { commit_time, tx_id, added, removed };
            let mut buf = Vec::new();
            record.encode(&mut buf);
            prop_assert_eq!(buf.len(), record.encoded_len());

            let mut reader = buf.as_slice();
            let decoded = TriggerRecord::decode(&mut reader).unwrap();
            prop_assert_eq!(reader.remaining(), 0);
            prop_assert_eq!(record, decoded);
        }
    }

    #[test]
    fn empty_record_is_minimal() {
        let record = TriggerRecord {
            commit_time: 9,
            tx_id: 1,
            added: vec![],
            removed: vec![],
        };
        let mut buf = Vec::new();
        record.encode(&mut buf);
        // 8 time + 1 tx id + 1 added count + 1 removed count
        assert_eq!(buf.len(), 11);
    }
}
