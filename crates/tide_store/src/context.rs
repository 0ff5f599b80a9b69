//! Per-mutation metadata supplied by the replication layer.

use tide_proto::value_schema::{epoch_from_micros, epoch_now};
use tide_proto::Timetag;

/// The context of one mutation applied to the store.
///
/// Built fresh by the replication layer for every decree and never persisted;
/// only its effect survives, as the timetag inside each written envelope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteContext {
    /// Log position of the mutation; strictly increasing per replica.
    pub decree: i64,
    /// Generation time of the mutation, microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Timetag of the remote write, 0 unless the write came from duplication.
    pub remote_timetag: u64,
    /// Whether a duplicated put must first compare against the stored
    /// timetag. Costs a read per key; without it, duplication may regress a
    /// value that a newer local write already replaced.
    pub verify_timetag: bool,
}

impl WriteContext {
    pub fn empty(decree: i64) -> Self {
        Self::create(decree, 0)
    }

    /// Context for a local write.
    pub fn create(decree: i64, timestamp: u64) -> Self {
        Self {
            decree,
            timestamp,
            ..Self::default()
        }
    }

    /// Context for a write shipped from another cluster.
    pub fn create_duplicate(
        decree: i64,
        timestamp: u64,
        remote_timetag: Timetag,
        verify_timetag: bool,
    ) -> Self {
        Self {
            decree,
            timestamp,
            remote_timetag: remote_timetag.raw(),
            verify_timetag,
        }
    }

    pub fn is_duplicated(&self) -> bool {
        self.remote_timetag > 0
    }

    pub fn remote_timetag(&self) -> Timetag {
        Timetag::from_raw(self.remote_timetag)
    }

    /// Store-epoch seconds used for TTL and expiry decisions of this write.
    ///
    /// Derived from the mutation timestamp so a replayed decree computes the
    /// same expiry; contexts without a timestamp fall back to the wall clock.
    pub fn epoch_now(&self) -> u32 {
        if self.timestamp > 0 {
            epoch_from_micros(self.timestamp)
        } else {
            epoch_now()
        }
    }
}
