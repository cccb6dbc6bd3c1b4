use quiver_codec::{decode_varint, encode_varint, varint_len, BufReader, BufWriter, DecodeError};

/// Phase/status markers of transaction-log entries.
///
/// The `*_SYSTEM` statuses bracket the schema sub-transaction that runs ahead
/// of the data flush on backends without transactional isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogStatus {
    PreflushSystem = 0,
    SuccessSystem = 1,
    FailureSystem = 2,
    Precommit = 3,
    Success = 4,
    Failure = 5,
}

impl LogStatus {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(val: u8) -> Result<Self, DecodeError> {
        Ok(match val {
            0 => Self::PreflushSystem,
            1 => Self::SuccessSystem,
            2 => Self::FailureSystem,
            3 => Self::Precommit,
            4 => Self::Success,
            5 => Self::Failure,
            tag => return Err(DecodeError::InvalidTag { tag, kind: "LogStatus" }),
        })
    }

    /// Statuses that close a record: everything except the two `PRE*` markers.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::PreflushSystem | Self::Precommit)
    }
}

/// The per-transaction configuration optionally carried by a header.
///
/// Encoding: one flag byte (bit 0 `acquire_locks`, bit 1 `batch_loading`,
/// bit 2 identifier present), then the varint-length-prefixed identifier.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigBlock {
    pub acquire_locks: bool,
    pub batch_loading: bool,
    pub log_identifier: Option<String>,
}

impl ConfigBlock {
    const FLAG_ACQUIRE_LOCKS: u8 = 0b001;
    const FLAG_BATCH_LOADING: u8 = 0b010;
    const FLAG_HAS_IDENTIFIER: u8 = 0b100;

    pub fn encode(&self, out: &mut impl BufWriter) {
        let mut flags = 0u8;
        if self.acquire_locks {
            flags |= Self::FLAG_ACQUIRE_LOCKS;
        }
        if self.batch_loading {
            flags |= Self::FLAG_BATCH_LOADING;
        }
        if self.log_identifier.is_some() {
            flags |= Self::FLAG_HAS_IDENTIFIER;
        }
        out.put_u8(flags);
        if let Some(ident) = &self.log_identifier {
            encode_varint(ident.len() as u64, out);
            out.put_slice(ident.as_bytes());
        }
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let flags = reader.get_u8()?;
        let log_identifier = if flags & Self::FLAG_HAS_IDENTIFIER != 0 {
            let len = decode_varint(reader)? as usize;
            let bytes = reader.get_slice(len)?;
            let ident = std::str::from_utf8(bytes)
                .map_err(|_| DecodeError::InvalidUtf8 { kind: "log identifier" })?;
            Some(ident.to_owned())
        } else {
            None
        };
        Ok(Self {
            acquire_locks: flags & Self::FLAG_ACQUIRE_LOCKS != 0,
            batch_loading: flags & Self::FLAG_BATCH_LOADING != 0,
            log_identifier,
        })
    }

    pub fn encoded_len(&self) -> usize {
        1 + self
            .log_identifier
            .as_ref()
            .map(|i| varint_len(i.len() as u64) + i.len())
            .unwrap_or(0)
    }
}

/// Fixed-layout head of every transaction-log entry.
///
/// ```text
/// <tx_id(varint)><commit_time(8, big-endian i64)><status(1)>[0u8 | 1u8<config>]
/// ```
///
/// `commit_time` is in the units of the engine's timestamp provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxLogHeader {
    pub tx_id: u64,
    pub commit_time: i64,
    pub status: LogStatus,
    pub config: Option<ConfigBlock>,
}

impl TxLogHeader {
    pub fn encode(&self, out: &mut impl BufWriter) {
        encode_varint(self.tx_id, out);
        out.put_i64(self.commit_time);
        out.put_u8(self.status.to_u8());
        match &self.config {
            None => out.put_u8(0),
            Some(config) => {
                out.put_u8(1);
                config.encode(out);
            }
        }
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let tx_id = decode_varint(reader)?;
        let commit_time = reader.get_i64()?;
        let status = LogStatus::from_u8(reader.get_u8()?)?;
        let config = match reader.get_u8()? {
            0 => None,
            1 => Some(ConfigBlock::decode(reader)?),
            tag => return Err(DecodeError::InvalidTag { tag, kind: "config presence" }),
        };
        Ok(Self {
            tx_id,
            commit_time,
            status,
            config,
        })
    }

    pub fn encoded_len(&self) -> usize {
        varint_len(self.tx_id)
            + 8
            + 1
            + 1
            + self.config.as_ref().map(ConfigBlock::encoded_len).unwrap_or(0)
    }

    /// The log key under which entries of this transaction and phase are
    /// appended: `<tx_id(varint)><status(1)>`.
    pub fn log_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(varint_len(self.tx_id) + 1);
        encode_varint(self.tx_id, &mut key);
        key.put_u8(self.status.to_u8());
        key
    }
}

/// Details carried by a `FAILURE` trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    pub storage_success: bool,
    pub trigger_success: bool,
    /// Names of mixed/composite indexes whose commit failed, sorted.
    pub failed_indexes: Vec<String>,
}

impl FailureInfo {
    fn encode(&self, out: &mut impl BufWriter) {
        out.put_u8(self.storage_success as u8);
        out.put_u8(self.trigger_success as u8);
        encode_varint(self.failed_indexes.len() as u64, out);
        for name in &self.failed_indexes {
            encode_varint(name.len() as u64, out);
            out.put_slice(name.as_bytes());
        }
    }

    pub(crate) fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let storage_success = reader.get_u8()? != 0;
        let trigger_success = reader.get_u8()? != 0;
        let count = decode_varint(reader)? as usize;
        let mut failed_indexes = Vec::with_capacity(count);
        for _ in 0..count {
            let len = decode_varint(reader)? as usize;
            let bytes = reader.get_slice(len)?;
            let name = std::str::from_utf8(bytes)
                .map_err(|_| DecodeError::InvalidUtf8 { kind: "index name" })?;
            failed_indexes.push(name.to_owned());
        }
        Ok(Self {
            storage_success,
            trigger_success,
            failed_indexes,
        })
    }

    fn encoded_len(&self) -> usize {
        2 + varint_len(self.failed_indexes.len() as u64)
            + self
                .failed_indexes
                .iter()
                .map(|n| varint_len(n.len() as u64) + n.len())
                .sum::<usize>()
    }
}

/// The record closing a transaction: the header layout repeated with the
/// final status, plus [`FailureInfo`] when that status is `FAILURE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxLogTrailer {
    pub header: TxLogHeader,
    pub failure: Option<FailureInfo>,
}

impl TxLogTrailer {
    /// A trailer with a non-`FAILURE` terminal status.
    pub fn closing(tx_id: u64, commit_time: i64, status: LogStatus) -> Self {
        debug_assert!(status.is_terminal() && status != LogStatus::Failure);
        Self {
            header: TxLogHeader {
                tx_id,
                commit_time,
                status,
                config: None,
            },
            failure: None,
        }
    }

    /// A `FAILURE` trailer carrying reconciliation details.
    pub fn failure(tx_id: u64, commit_time: i64, info: FailureInfo) -> Self {
        Self {
            header: TxLogHeader {
                tx_id,
                commit_time,
                status: LogStatus::Failure,
                config: None,
            },
            failure: Some(info),
        }
    }

    pub fn encode(&self, out: &mut impl BufWriter) {
        self.header.encode(out);
        if self.header.status == LogStatus::Failure {
            self.failure
                .as_ref()
                .expect("FAILURE trailer constructed without failure info")
                .encode(out);
        }
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let header = TxLogHeader::decode(reader)?;
        let failure = if header.status == LogStatus::Failure {
            Some(FailureInfo::decode(reader)?)
        } else {
            None
        };
        Ok(Self { header, failure })
    }

    pub fn encoded_len(&self) -> usize {
        self.header.encoded_len()
            + match (&self.failure, self.header.status) {
                (Some(info), LogStatus::Failure) => info.encoded_len(),
                _ => 0,
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn status_strategy() -> impl Strategy<Value = LogStatus> {
        prop_oneof![
            Just(LogStatus::PreflushSystem),
            Just(LogStatus::SuccessSystem),
            Just(LogStatus::FailureSystem),
            Just(LogStatus::Precommit),
            Just(LogStatus::Success),
            Just(LogStatus::Failure),
        ]
    }

    fn config_strategy() -> impl Strategy<Value = ConfigBlock> {
        (any::<bool>(), any::<bool>(), proptest::option::of(".{0,24}")).prop_map(
            |(acquire_locks, batch_loading, log_identifier)| ConfigBlock {
                acquire_locks,
                batch_loading,
                log_identifier,
            },
        )
    }

    proptest! {
        #[test]
        fn header_roundtrip(
            tx_id in any::<u64>(),
            commit_time in any::<i64>(),
            status in status_strategy(),
            config in proptest::option::of(config_strategy()),
        ) {
            let header = TxLogHeader { tx_id, commit_time, status, config };
            let mut buf = Vec::new();
            header.encode(&mut buf);
            prop_assert_eq!(buf.len(), header.encoded_len());

            let mut reader = buf.as_slice();
            let decoded = TxLogHeader::decode(&mut reader).unwrap();
            prop_assert_eq!(reader.remaining(), 0);
            prop_assert_eq!(header, decoded);
        }

        #[test]
        fn failure_trailer_roundtrip(
            tx_id in any::<u64>(),
            commit_time in any::<i64>(),
            storage_success in any::<bool>(),
            trigger_success in any::<bool>(),
            mut names in proptest::collection::vec("[a-z_]{1,16}", 0..4),
        ) {
            names.sort();
            let trailer = TxLogTrailer::failure(tx_id, commit_time, FailureInfo {
                storage_success,
                trigger_success,
                failed_indexes: names,
            });
            let mut buf = Vec::new();
            trailer.encode(&mut buf);
            prop_assert_eq!(buf.len(), trailer.encoded_len());

            let decoded = TxLogTrailer::decode(&mut buf.as_slice()).unwrap();
            prop_assert_eq!(trailer, decoded);
        }
    }

    #[test]
    fn success_trailer_has_no_failure_section() {
        let trailer = TxLogTrailer::closing(7, 1234, LogStatus::Success);
        let mut buf = Vec::new();
        trailer.encode(&mut buf);
        assert_eq!(buf.len(), trailer.header.encoded_len());

        let decoded = TxLogTrailer::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.failure, None);
    }

    #[test]
    fn status_codes_are_stable() {
        // Recovery tooling depends on these exact codes.
        for (status, code) in [
            (LogStatus::PreflushSystem, 0u8),
            (LogStatus::SuccessSystem, 1),
            (LogStatus::FailureSystem, 2),
            (LogStatus::Precommit, 3),
            (LogStatus::Success, 4),
            (LogStatus::Failure, 5),
        ] {
            assert_eq!(status.to_u8(), code);
            assert_eq!(LogStatus::from_u8(code).unwrap(), status);
        }
        assert!(LogStatus::from_u8(6).is_err());
    }

    #[test]
    fn log_key_separates_phases() {
        let mk = |status| TxLogHeader {
            tx_id: 300,
            commit_time: 0,
            status,
            config: None,
        };
        assert_ne!(
            mk(LogStatus::Precommit).log_key(),
            mk(LogStatus::Success).log_key()
        );
    }
}
