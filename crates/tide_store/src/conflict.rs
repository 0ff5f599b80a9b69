//! Last-writer-wins arbitration of duplicated puts by timetag.

use tide_proto::{Timetag, TimetagError, MAX_CLUSTER_ID};

use crate::context::WriteContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Write the record with this timetag.
    Apply(Timetag),
    /// The stored record is at least as new; leave it untouched.
    Skip { stored: Timetag },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConflictResolver {
    local_cluster_id: u8,
}

impl ConflictResolver {
    pub fn new(local_cluster_id: u8) -> Result<Self, TimetagError> {
        if local_cluster_id > MAX_CLUSTER_ID {
            return Err(TimetagError::ClusterIdOutOfRange(local_cluster_id));
        }
        Ok(Self { local_cluster_id })
    }

    pub fn local_cluster_id(&self) -> u8 {
        self.local_cluster_id
    }

    /// True when the stored timetag must be read before a duplicated put.
    pub fn needs_verification(ctx: &WriteContext) -> bool {
        ctx.is_duplicated() && ctx.verify_timetag
    }

    /// Fails when `ctx.timestamp` cannot be packed into a timetag.
    pub fn check_timestamp(&self, ctx: &WriteContext) -> Result<(), TimetagError> {
        Timetag::make(ctx.timestamp, self.local_cluster_id, ctx.is_duplicated()).map(|_| ())
    }

    /// Timetag written by an unarbitrated write under `ctx`.
    ///
    /// Verified duplicated writes keep the remote timetag so every cluster
    /// converges on the same record; unverified ones are stamped locally
    /// with the duplication flag set.
    pub fn timetag_for(&self, ctx: &WriteContext) -> Result<Timetag, TimetagError> {
        if !ctx.is_duplicated() {
            Timetag::make(ctx.timestamp, self.local_cluster_id, false)
        } else if ctx.verify_timetag {
            Ok(ctx.remote_timetag())
        } else {
            Timetag::make(ctx.timestamp, self.local_cluster_id, true)
        }
    }

    /// Arbitrate one put. `stored` is the timetag of the live record at the
    /// target key, or `None` when the key is absent or expired. It is only
    /// consulted for verified duplicated writes.
    pub fn resolve(
        &self,
        ctx: &WriteContext,
        stored: Option<Timetag>,
    ) -> Result<Resolution, TimetagError> {
        if !Self::needs_verification(ctx) {
            return self.timetag_for(ctx).map(Resolution::Apply);
        }
        let remote = ctx.remote_timetag();
        match stored {
            Some(stored) if stored >= remote => Ok(Resolution::Skip { stored }),
            _ => Ok(Resolution::Apply(remote)),
        }
    }
}
