//! Wire contract for the tide write path.
//!
//! This crate is kept small and dependency-light because it is shared by the
//! write service and by the duplication layer that ships writes between
//! clusters. `timetag` and `value_schema` define what is persisted next to
//! every record, `key_schema` defines the composite key layout, and `rrdb`
//! defines the typed requests, responses and the duplication envelope.

pub mod key_schema;
pub mod rrdb;
pub mod timetag;
pub mod value_schema;

pub use key_schema::{empty_write_key, generate_key, restore_key, KeyError};
pub use rrdb::{
    CheckAndMutateRequest, CheckAndMutateResponse, CheckAndSetRequest, CheckAndSetResponse,
    CheckType, DuplicateRequest, DuplicateResponse, EnvelopeError, IncrRequest, IncrResponse,
    KeyValue, MultiPutRequest, MultiRemoveRequest, MultiRemoveResponse, Mutate, MutateOperation,
    PutRequest, RemoveRequest, RequestKind, Status, UpdateResponse, WriteRequest, WriteResponse,
};
pub use timetag::{Timetag, TimetagError, MAX_CLUSTER_ID};
pub use value_schema::{ValueEnvelope, ValueError};
