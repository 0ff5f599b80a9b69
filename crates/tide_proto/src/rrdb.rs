//! Typed write requests and responses, and the duplication envelope.
//!
//! Single-key requests carry a raw composite key (see `key_schema`), the
//! multi-key and check requests carry the hash key and sort keys separately.
//! Every response carries a [`Status`] and the decree it was applied at.

use serde::{Deserialize, Serialize};

use crate::timetag::Timetag;

/// Application status carried in every response. Codes are stable on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Ok,
    NotFound,
    Corruption,
    NotSupported,
    InvalidArgument,
    IoError,
    /// The check of a check-and-set / check-and-mutate did not pass.
    TryAgain,
    /// An increment would leave the `i64` range.
    Overflow,
}

impl Status {
    pub const fn code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::NotFound => 1,
            Status::Corruption => 2,
            Status::NotSupported => 3,
            Status::InvalidArgument => 4,
            Status::IoError => 5,
            Status::TryAgain => 13,
            Status::Overflow => 15,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let status = match code {
            0 => Status::Ok,
            1 => Status::NotFound,
            2 => Status::Corruption,
            3 => Status::NotSupported,
            4 => Status::InvalidArgument,
            5 => Status::IoError,
            13 => Status::TryAgain,
            15 => Status::Overflow,
            _ => return None,
        };
        Some(status)
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Relative TTL; zero falls back to the service default TTL.
    #[serde(default)]
    pub ttl_seconds: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub key: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub status: Status,
    pub decree: i64,
}

impl UpdateResponse {
    pub fn new(decree: i64) -> Self {
        Self {
            status: Status::Ok,
            decree,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub sort_key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(sort_key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            sort_key: sort_key.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiPutRequest {
    pub hash_key: Vec<u8>,
    pub kvs: Vec<KeyValue>,
    #[serde(default)]
    pub ttl_seconds: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiRemoveRequest {
    pub hash_key: Vec<u8>,
    pub sort_keys: Vec<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiRemoveResponse {
    pub status: Status,
    pub decree: i64,
    /// Number of sort keys removed.
    pub count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrRequest {
    pub key: Vec<u8>,
    pub increment: i64,
    /// `> 0` resets the TTL, `< 0` clears it, `0` keeps the existing expiry.
    #[serde(default)]
    pub ttl_seconds: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrResponse {
    pub status: Status,
    pub decree: i64,
    pub new_value: i64,
}

/// Comparison applied by check-and-set and check-and-mutate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckType {
    NoCheck,
    ValueNotExist,
    ValueNotExistOrEmpty,
    ValueExist,
    ValueNotEmpty,
    ValueMatchAnywhere,
    ValueMatchPrefix,
    ValueMatchPostfix,
    ValueBytesLess,
    ValueBytesLessOrEqual,
    ValueBytesEqual,
    ValueBytesGreaterOrEqual,
    ValueBytesGreater,
    ValueIntLess,
    ValueIntLessOrEqual,
    ValueIntEqual,
    ValueIntGreaterOrEqual,
    ValueIntGreater,
}

impl CheckType {
    const ALL: [CheckType; 18] = [
        CheckType::NoCheck,
        CheckType::ValueNotExist,
        CheckType::ValueNotExistOrEmpty,
        CheckType::ValueExist,
        CheckType::ValueNotEmpty,
        CheckType::ValueMatchAnywhere,
        CheckType::ValueMatchPrefix,
        CheckType::ValueMatchPostfix,
        CheckType::ValueBytesLess,
        CheckType::ValueBytesLessOrEqual,
        CheckType::ValueBytesEqual,
        CheckType::ValueBytesGreaterOrEqual,
        CheckType::ValueBytesGreater,
        CheckType::ValueIntLess,
        CheckType::ValueIntLessOrEqual,
        CheckType::ValueIntEqual,
        CheckType::ValueIntGreaterOrEqual,
        CheckType::ValueIntGreater,
    ];

    /// Wire code; codes are assigned in declaration order starting at 0.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
    }

    pub fn is_int_compare(self) -> bool {
        matches!(
            self,
            CheckType::ValueIntLess
                | CheckType::ValueIntLessOrEqual
                | CheckType::ValueIntEqual
                | CheckType::ValueIntGreaterOrEqual
                | CheckType::ValueIntGreater
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckAndSetRequest {
    pub hash_key: Vec<u8>,
    pub check_sort_key: Vec<u8>,
    /// [`CheckType`] wire code; unknown codes are rejected as invalid.
    pub check_type: i32,
    pub check_operand: Vec<u8>,
    /// When false the set targets `check_sort_key`.
    pub set_diff_sort_key: bool,
    pub set_sort_key: Vec<u8>,
    pub set_value: Vec<u8>,
    #[serde(default)]
    pub set_ttl_seconds: u32,
    pub return_check_value: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckAndSetResponse {
    pub status: Status,
    pub decree: i64,
    pub check_value_returned: bool,
    pub check_value_exist: bool,
    pub check_value: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutateOperation {
    #[default]
    Put,
    Delete,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutate {
    pub operation: MutateOperation,
    pub sort_key: Vec<u8>,
    #[serde(default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub ttl_seconds: u32,
}

impl Mutate {
    pub fn put(sort_key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            operation: MutateOperation::Put,
            sort_key: sort_key.into(),
            value: value.into(),
            ttl_seconds: 0,
        }
    }

    pub fn delete(sort_key: impl Into<Vec<u8>>) -> Self {
        Self {
            operation: MutateOperation::Delete,
            sort_key: sort_key.into(),
            value: Vec::new(),
            ttl_seconds: 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckAndMutateRequest {
    pub hash_key: Vec<u8>,
    pub check_sort_key: Vec<u8>,
    pub check_type: i32,
    pub check_operand: Vec<u8>,
    pub mutate_list: Vec<Mutate>,
    pub return_check_value: bool,
}

pub type CheckAndMutateResponse = CheckAndSetResponse;

/// Kind of a write request, as carried by the duplication envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Put,
    Remove,
    MultiPut,
    MultiRemove,
    Incr,
    CheckAndSet,
    CheckAndMutate,
    Duplicate,
}

/// The closed set of write requests the write service applies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteRequest {
    Put(PutRequest),
    Remove(RemoveRequest),
    MultiPut(MultiPutRequest),
    MultiRemove(MultiRemoveRequest),
    Incr(IncrRequest),
    CheckAndSet(CheckAndSetRequest),
    CheckAndMutate(CheckAndMutateRequest),
    Duplicate(DuplicateRequest),
}

impl WriteRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            WriteRequest::Put(_) => RequestKind::Put,
            WriteRequest::Remove(_) => RequestKind::Remove,
            WriteRequest::MultiPut(_) => RequestKind::MultiPut,
            WriteRequest::MultiRemove(_) => RequestKind::MultiRemove,
            WriteRequest::Incr(_) => RequestKind::Incr,
            WriteRequest::CheckAndSet(_) => RequestKind::CheckAndSet,
            WriteRequest::CheckAndMutate(_) => RequestKind::CheckAndMutate,
            WriteRequest::Duplicate(_) => RequestKind::Duplicate,
        }
    }

    /// Single-key puts and removes may share one batch per decree.
    pub fn is_batchable(&self) -> bool {
        matches!(self, WriteRequest::Put(_) | WriteRequest::Remove(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteResponse {
    Put(UpdateResponse),
    Remove(UpdateResponse),
    MultiPut(UpdateResponse),
    MultiRemove(MultiRemoveResponse),
    Incr(IncrResponse),
    CheckAndSet(CheckAndSetResponse),
    CheckAndMutate(CheckAndMutateResponse),
    Duplicate(DuplicateResponse),
}

impl WriteResponse {
    pub fn status(&self) -> Status {
        match self {
            WriteResponse::Put(resp)
            | WriteResponse::Remove(resp)
            | WriteResponse::MultiPut(resp) => resp.status,
            WriteResponse::MultiRemove(resp) => resp.status,
            WriteResponse::Incr(resp) => resp.status,
            WriteResponse::CheckAndSet(resp) | WriteResponse::CheckAndMutate(resp) => resp.status,
            WriteResponse::Duplicate(resp) => resp.status,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("a duplicate request cannot carry another duplicate request")]
    NestedDuplication,
    #[error("payload checksum mismatch: envelope says {expected:#010x}, payload hashes to {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("malformed duplicated payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Cross-cluster envelope delivering a foreign write for local application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateRequest {
    pub kind: RequestKind,
    /// serde_json encoding of the embedded request body.
    pub payload: Vec<u8>,
    pub remote_timetag: u64,
    pub verify_timetag: bool,
    /// Id of the cluster the write originated from.
    pub cluster_id: u8,
    /// crc32 of `payload`.
    pub checksum: u32,
}

impl DuplicateRequest {
    pub fn wrap(
        request: &WriteRequest,
        remote_timetag: Timetag,
        cluster_id: u8,
        verify_timetag: bool,
    ) -> Result<Self, EnvelopeError> {
        let payload = match request {
            WriteRequest::Put(req) => serde_json::to_vec(req)?,
            WriteRequest::Remove(req) => serde_json::to_vec(req)?,
            WriteRequest::MultiPut(req) => serde_json::to_vec(req)?,
            WriteRequest::MultiRemove(req) => serde_json::to_vec(req)?,
            WriteRequest::Incr(req) => serde_json::to_vec(req)?,
            WriteRequest::CheckAndSet(req) => serde_json::to_vec(req)?,
            WriteRequest::CheckAndMutate(req) => serde_json::to_vec(req)?,
            WriteRequest::Duplicate(req) => serde_json::to_vec(req)?,
        };
        Ok(Self {
            kind: request.kind(),
            checksum: crc32fast::hash(&payload),
            payload,
            remote_timetag: remote_timetag.raw(),
            verify_timetag,
            cluster_id,
        })
    }

    pub fn remote_timetag(&self) -> Timetag {
        Timetag::from_raw(self.remote_timetag)
    }

    /// Decode the embedded request. Never returns [`WriteRequest::Duplicate`].
    pub fn decode_payload(&self) -> Result<WriteRequest, EnvelopeError> {
        let actual = crc32fast::hash(&self.payload);
        if actual != self.checksum {
            return Err(EnvelopeError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        let payload = self.payload.as_slice();
        let request = match self.kind {
            RequestKind::Put => WriteRequest::Put(serde_json::from_slice(payload)?),
            RequestKind::Remove => WriteRequest::Remove(serde_json::from_slice(payload)?),
            RequestKind::MultiPut => WriteRequest::MultiPut(serde_json::from_slice(payload)?),
            RequestKind::MultiRemove => WriteRequest::MultiRemove(serde_json::from_slice(payload)?),
            RequestKind::Incr => WriteRequest::Incr(serde_json::from_slice(payload)?),
            RequestKind::CheckAndSet => WriteRequest::CheckAndSet(serde_json::from_slice(payload)?),
            RequestKind::CheckAndMutate => {
                WriteRequest::CheckAndMutate(serde_json::from_slice(payload)?)
            }
            RequestKind::Duplicate => return Err(EnvelopeError::NestedDuplication),
        };
        Ok(request)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateResponse {
    pub status: Status,
    pub decree: i64,
    /// Human-readable reason when the envelope itself was rejected.
    pub error_hint: String,
}
