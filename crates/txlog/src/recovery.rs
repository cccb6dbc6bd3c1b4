//! Post-crash reconciliation over a transaction log.
//!
//! Walks the raw `(key, record)` entries of a log and pairs each `PRECOMMIT`
//! record with its trailer. Transactions that show a `PRECOMMIT` but no
//! terminal status were interrupted mid-flush and need replay or repair;
//! `FAILURE` trailers carry the per-backend outcome needed to decide which.

use quiver_codec::DecodeError;

use crate::record::{FailureInfo, LogStatus, TxLogHeader};

/// The reconciled view of one transaction's log entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSummary {
    pub tx_id: u64,
    pub commit_time: i64,
    /// Whether a `PRECOMMIT` record was seen (the data flush had started).
    pub precommitted: bool,
    /// The terminal status, if any trailer was written.
    pub final_status: Option<LogStatus>,
    /// Failure details from a `FAILURE` trailer.
    pub failure: Option<FailureInfo>,
}

impl TxSummary {
    /// A transaction that started flushing but never closed its record.
    pub fn is_dangling(&self) -> bool {
        self.precommitted && self.final_status.is_none()
    }
}

/// Scan raw log records in append order and summarize per transaction.
///
/// Records are decoded header-first; payload bytes that follow a header are
/// opaque here and skipped. Entries for the schema sub-transaction
/// (`*_SYSTEM` statuses) do not produce summaries of their own but are
/// reflected in the owning transaction's summary ordering.
pub fn summarize<'a>(records: impl IntoIterator<Item = &'a [u8]>) -> Result<Vec<TxSummary>, DecodeError> {
    let mut summaries: Vec<TxSummary> = Vec::new();
    for mut record in records {
        let header = TxLogHeader::decode(&mut record)?;
        let summary = match summaries.iter_mut().find(|s| s.tx_id == header.tx_id) {
            Some(summary) => summary,
            None => {
                summaries.push(TxSummary {
                    tx_id: header.tx_id,
                    commit_time: header.commit_time,
                    precommitted: false,
                    final_status: None,
                    failure: None,
                });
                summaries.last_mut().expect("just pushed")
            }
        };
        match header.status {
            LogStatus::Precommit => summary.precommitted = true,
            LogStatus::PreflushSystem => {}
            LogStatus::SuccessSystem | LogStatus::FailureSystem => {
                // The schema sub-transaction closed; data flush outcome still pending.
            }
            status @ (LogStatus::Success | LogStatus::Failure) => {
                summary.final_status = Some(status);
                if status == LogStatus::Failure {
                    summary.failure = Some(FailureInfo::decode(&mut record)?);
                }
            }
        }
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TxLogTrailer;
    use pretty_assertions::assert_eq;

    fn header_bytes(tx_id: u64, status: LogStatus) -> Vec<u8> {
        let mut buf = Vec::new();
        TxLogHeader {
            tx_id,
            commit_time: 100,
            status,
            config: None,
        }
        .encode(&mut buf);
        buf
    }

    #[test]
    fn pairs_precommit_with_trailer() {
        let mut precommit = header_bytes(8, LogStatus::Precommit);
        precommit.extend_from_slice(b"opaque payload");
        let trailer = header_bytes(8, LogStatus::Success);

        let summaries = summarize([precommit.as_slice(), trailer.as_slice()]).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].final_status, Some(LogStatus::Success));
        assert!(!summaries[0].is_dangling());
    }

    #[test]
    fn dangling_precommit_is_detected() {
        let precommit = header_bytes(9, LogStatus::Precommit);
        let summaries = summarize([precommit.as_slice()]).unwrap();
        assert!(summaries[0].is_dangling());
    }

    #[test]
    fn failure_trailer_details_surface() {
        let precommit = header_bytes(3, LogStatus::Precommit);
        let mut trailer = Vec::new();
        TxLogTrailer::failure(
            3,
            100,
            FailureInfo {
                storage_success: true,
                trigger_success: false,
                failed_indexes: vec!["idx_text".into()],
            },
        )
        .encode(&mut trailer);

        let summaries = summarize([precommit.as_slice(), trailer.as_slice()]).unwrap();
        let failure = summaries[0].failure.as_ref().unwrap();
        assert!(failure.storage_success);
        assert_eq!(failure.failed_indexes, ["idx_text"]);
    }

    #[test]
    fn schema_records_do_not_close_the_tx() {
        let entries = [
            header_bytes(4, LogStatus::PreflushSystem),
            header_bytes(4, LogStatus::SuccessSystem),
            header_bytes(4, LogStatus::Precommit),
        ];
        let summaries = summarize(entries.iter().map(|e| e.as_slice())).unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].is_dangling());
    }
}
