//! Per-decree write batch: staged engine operations plus an arena of
//! response slots handed back by value on commit or abort.

use std::time::{Duration, Instant};

use tide_proto::{Status, UpdateResponse};

use crate::engine::{BatchOp, WriteBatch};
use crate::error::StorageError;

/// Position of a staged request's response in its batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchSlot(usize);

impl BatchSlot {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Capacity charge of one staged request, billed once the commit succeeds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Charge {
    None,
    Put { key_len: usize, value_len: usize },
    Remove { key_len: usize },
}

#[derive(Debug)]
pub(crate) struct StagedEntry {
    pub op: Option<BatchOp>,
    pub response: UpdateResponse,
    pub charge: Charge,
}

#[derive(Debug)]
pub(crate) struct BatchState {
    decree: i64,
    started: Instant,
    entries: Vec<StagedEntry>,
}

impl BatchState {
    pub fn new(decree: i64) -> Self {
        Self {
            decree,
            started: Instant::now(),
            entries: Vec::new(),
        }
    }

    pub fn decree(&self) -> i64 {
        self.decree
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stage(&mut self, entry: StagedEntry) -> BatchSlot {
        self.entries.push(entry);
        BatchSlot(self.entries.len() - 1)
    }

    /// Split into the engine batch and the per-slot responses and charges.
    pub fn into_parts(self) -> (WriteBatch, Vec<UpdateResponse>, Vec<Charge>) {
        let mut batch = WriteBatch::new(self.decree);
        let mut responses = Vec::with_capacity(self.entries.len());
        let mut charges = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            match entry.op {
                Some(BatchOp::Put { key, value }) => batch.put(key, value),
                Some(BatchOp::Delete { key }) => batch.delete(key),
                None => {}
            }
            responses.push(entry.response);
            charges.push(entry.charge);
        }
        (batch, responses, charges)
    }

    /// Responses of every staged request, all set to `status`.
    pub fn abort(self, status: Status) -> Vec<UpdateResponse> {
        self.entries
            .into_iter()
            .map(|entry| UpdateResponse {
                status,
                decree: entry.response.decree,
            })
            .collect()
    }
}

/// Result of committing one batch.
///
/// `responses` is indexed by [`BatchSlot`]. When the engine write fails,
/// `result` holds the storage error and every response carries its status.
#[derive(Debug)]
pub struct BatchOutcome {
    pub decree: i64,
    pub responses: Vec<UpdateResponse>,
    pub result: Result<(), StorageError>,
}

impl BatchOutcome {
    pub fn response(&self, slot: BatchSlot) -> Option<&UpdateResponse> {
        self.responses.get(slot.0)
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<Vec<UpdateResponse>, StorageError> {
        self.result.map(|()| self.responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(decree: i64, op: Option<BatchOp>, status: Status) -> StagedEntry {
        StagedEntry {
            op,
            response: UpdateResponse { status, decree },
            charge: Charge::None,
        }
    }

    #[test]
    fn slots_follow_staging_order() {
        let mut state = BatchState::new(3);
        let a = state.stage(staged(
            3,
            Some(BatchOp::Put {
                key: b"a".to_vec(),
                value: b"1".to_vec(),
            }),
            Status::Ok,
        ));
        let b = state.stage(staged(3, None, Status::InvalidArgument));
        let c = state.stage(staged(3, Some(BatchOp::Delete { key: b"c".to_vec() }), Status::Ok));
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        assert_eq!(state.len(), 3);

        let (batch, responses, charges) = state.into_parts();
        assert_eq!(batch.decree(), 3);
        assert_eq!(batch.len(), 2);
        assert_eq!(responses[b.index()].status, Status::InvalidArgument);
        assert_eq!(charges.len(), 3);
    }

    #[test]
    fn abort_overwrites_every_status() {
        let mut state = BatchState::new(8);
        state.stage(staged(8, None, Status::Ok));
        state.stage(staged(8, None, Status::InvalidArgument));
        let responses = state.abort(Status::IoError);
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r.status == Status::IoError && r.decree == 8));
    }

    #[test]
    fn failed_outcome_withholds_responses() {
        let outcome = BatchOutcome {
            decree: 1,
            responses: vec![UpdateResponse {
                status: Status::IoError,
                decree: 1,
            }],
            result: Err(StorageError::Io("disk gone".to_string())),
        };
        assert_eq!(outcome.response(BatchSlot(0)).map(|r| r.status), Some(Status::IoError));
        assert!(outcome.response(BatchSlot(1)).is_none());
        assert!(outcome.into_result().is_err());
    }
}
