//! Per-replica write service.
//!
//! Turns decreed write requests into atomic engine batches. Every handler
//! either returns a response carrying an application [`Status`] or a
//! [`WriteError`]; only storage failures and protocol misuse are errors.
//!
//! Requests that are rejected before touching user data (invalid arguments,
//! failed checks, overflows, conflict skips of every key) still commit the
//! empty-write sentinel so the decree is consumed by the engine.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use tide_proto::key_schema::{check_hash_key, check_user_key, empty_write_key};
use tide_proto::value_schema::{encode_value, expire_ts_from_ttl};
use tide_proto::{
    generate_key, CheckAndMutateRequest, CheckAndMutateResponse, CheckAndSetRequest,
    CheckAndSetResponse, DuplicateRequest, DuplicateResponse, EnvelopeError, IncrRequest,
    IncrResponse, KeyValue, MultiPutRequest, MultiRemoveRequest, MultiRemoveResponse,
    MutateOperation, PutRequest, RemoveRequest, Status, Timetag, UpdateResponse, ValueEnvelope,
    WriteRequest, WriteResponse,
};
use tracing::{debug, warn};

use crate::batch::{BatchOutcome, BatchSlot, BatchState, Charge, StagedEntry};
use crate::capacity::{CapacitySink, CapacityUnitCalculator};
use crate::check::{check_value, needs_read, parse_i64, validate_check};
use crate::config::{ClusterRegistry, WriteServiceConfig};
use crate::conflict::{ConflictResolver, Resolution};
use crate::context::WriteContext;
use crate::engine::{read_live_record, read_user_value, BatchOp, StorageEngine, WriteBatch};
use crate::error::{StorageError, WriteError, WriteResult};

/// Write path of one replica.
///
/// Handlers take `&mut self`: a replica applies decrees strictly one at a
/// time. The type is `Send` but not `Sync`.
pub struct WriteService {
    engine: Arc<dyn StorageEngine>,
    resolver: ConflictResolver,
    registry: ClusterRegistry,
    default_ttl_seconds: u32,
    capacity: CapacityUnitCalculator,
    batch: Option<BatchState>,
    last_applied_decree: i64,
    _not_sync: PhantomData<Cell<()>>,
}

impl WriteService {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        config: WriteServiceConfig,
        sink: Arc<dyn CapacitySink>,
    ) -> WriteResult<Self> {
        let resolver = ConflictResolver::new(config.cluster.cluster_id)?;
        let last_applied_decree = engine.last_committed_decree()?;
        Ok(Self {
            engine,
            resolver,
            registry: config.cluster.registry,
            default_ttl_seconds: config.default_ttl_seconds,
            capacity: CapacityUnitCalculator::new(config.capacity, sink),
            batch: None,
            last_applied_decree,
            _not_sync: PhantomData,
        })
    }

    pub fn last_applied_decree(&self) -> i64 {
        self.last_applied_decree
    }

    pub fn local_cluster_id(&self) -> u8 {
        self.resolver.local_cluster_id()
    }

    /// Takes effect for requests applied after the call.
    pub fn set_default_ttl(&mut self, ttl_seconds: u32) {
        self.default_ttl_seconds = ttl_seconds;
    }

    pub fn is_batch_open(&self) -> bool {
        self.batch.is_some()
    }

    /// Live user value at `(hash_key, sort_key)`, judged by the wall clock.
    pub fn get(&self, hash_key: &[u8], sort_key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let Ok(key) = generate_key(hash_key, sort_key) else {
            return Ok(None);
        };
        self.get_raw(&key)
    }

    pub fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        read_user_value(self.engine.as_ref(), key, WriteContext::default().epoch_now())
    }

    /// Apply one request through its handler.
    pub fn apply_request(
        &mut self,
        ctx: &WriteContext,
        request: &WriteRequest,
    ) -> WriteResult<WriteResponse> {
        let response = match request {
            WriteRequest::Put(req) => WriteResponse::Put(self.put(ctx, req)?),
            WriteRequest::Remove(req) => WriteResponse::Remove(self.remove(ctx, req)?),
            WriteRequest::MultiPut(req) => WriteResponse::MultiPut(self.multi_put(ctx, req)?),
            WriteRequest::MultiRemove(req) => {
                WriteResponse::MultiRemove(self.multi_remove(ctx, req)?)
            }
            WriteRequest::Incr(req) => WriteResponse::Incr(self.incr(ctx, req)?),
            WriteRequest::CheckAndSet(req) => {
                WriteResponse::CheckAndSet(self.check_and_set(ctx, req)?)
            }
            WriteRequest::CheckAndMutate(req) => {
                WriteResponse::CheckAndMutate(self.check_and_mutate(ctx, req)?)
            }
            WriteRequest::Duplicate(req) => WriteResponse::Duplicate(self.duplicate(ctx, req)?),
        };
        Ok(response)
    }

    /// Commit only the sentinel record so `decree` is consumed.
    pub fn empty_put(&mut self, decree: i64) -> WriteResult<()> {
        self.ensure_idle()?;
        self.ensure_decree(decree)?;
        self.write_sentinel(decree)?;
        Ok(())
    }

    pub fn put(&mut self, ctx: &WriteContext, req: &PutRequest) -> WriteResult<UpdateResponse> {
        self.batch_prepare(ctx.decree)?;
        let slot = match self.batch_put(ctx, req) {
            Ok(slot) => slot,
            Err(err) => {
                self.batch = None;
                return Err(err);
            }
        };
        self.single_response(ctx.decree, slot)
    }

    pub fn remove(
        &mut self,
        ctx: &WriteContext,
        req: &RemoveRequest,
    ) -> WriteResult<UpdateResponse> {
        self.batch_prepare(ctx.decree)?;
        let slot = self.batch_remove(ctx, req)?;
        self.single_response(ctx.decree, slot)
    }

    /// Open the batch window for `decree`.
    pub fn batch_prepare(&mut self, decree: i64) -> WriteResult<()> {
        self.ensure_idle()?;
        self.ensure_decree(decree)?;
        self.batch = Some(BatchState::new(decree));
        Ok(())
    }

    /// Stage a put in the open batch.
    ///
    /// A storage error while verifying the stored timetag leaves the batch
    /// open; the caller is expected to `batch_abort` it.
    pub fn batch_put(&mut self, ctx: &WriteContext, req: &PutRequest) -> WriteResult<BatchSlot> {
        self.ensure_batch(ctx.decree)?;

        let entry = if let Err(reason) = self.check_stamped_write(ctx, &req.key) {
            debug!(decree = ctx.decree, reason = %reason, "rejecting put");
            StagedEntry {
                op: None,
                response: UpdateResponse {
                    status: Status::InvalidArgument,
                    decree: ctx.decree,
                },
                charge: Charge::None,
            }
        } else {
            match self.resolve_put(ctx, &req.key)? {
                Resolution::Apply(timetag) => {
                    let expire_ts = self.expire_ts(ctx, req.ttl_seconds);
                    StagedEntry {
                        op: Some(BatchOp::Put {
                            key: req.key.clone(),
                            value: encode_value(expire_ts, timetag, &req.value),
                        }),
                        response: UpdateResponse::new(ctx.decree),
                        charge: Charge::Put {
                            key_len: req.key.len(),
                            value_len: req.value.len(),
                        },
                    }
                }
                Resolution::Skip { stored } => {
                    debug!(
                        decree = ctx.decree,
                        stored = %stored,
                        remote = %ctx.remote_timetag(),
                        "skipping duplicated put older than the stored record"
                    );
                    StagedEntry {
                        op: None,
                        response: UpdateResponse::new(ctx.decree),
                        charge: Charge::None,
                    }
                }
            }
        };
        self.stage(entry)
    }

    /// Stage a remove in the open batch.
    pub fn batch_remove(
        &mut self,
        ctx: &WriteContext,
        req: &RemoveRequest,
    ) -> WriteResult<BatchSlot> {
        self.ensure_batch(ctx.decree)?;
        let entry = if let Err(err) = check_user_key(&req.key) {
            debug!(decree = ctx.decree, error = %err, "rejecting remove");
            StagedEntry {
                op: None,
                response: UpdateResponse {
                    status: Status::InvalidArgument,
                    decree: ctx.decree,
                },
                charge: Charge::None,
            }
        } else {
            StagedEntry {
                op: Some(BatchOp::Delete {
                    key: req.key.clone(),
                }),
                response: UpdateResponse::new(ctx.decree),
                charge: Charge::Remove {
                    key_len: req.key.len(),
                },
            }
        };
        self.stage(entry)
    }

    /// Write every staged operation of `decree` in one engine batch.
    ///
    /// Returns `Err` only for protocol misuse. An engine failure is reported
    /// through [`BatchOutcome::result`], with every response carrying the
    /// failure's status.
    pub fn batch_commit(&mut self, decree: i64) -> WriteResult<BatchOutcome> {
        let state = self.take_batch(decree)?;
        if state.is_empty() {
            return Ok(BatchOutcome {
                decree,
                responses: Vec::new(),
                result: Ok(()),
            });
        }

        let elapsed = state.elapsed();
        let (mut batch, mut responses, charges) = state.into_parts();
        if batch.is_empty() {
            put_sentinel(&mut batch);
        }
        let result = self.commit(&batch);
        match &result {
            Ok(()) => {
                for (response, charge) in responses.iter().zip(&charges) {
                    match charge {
                        Charge::Put { key_len, value_len } => {
                            self.capacity.add_put_cu(response.status, *key_len, *value_len)
                        }
                        Charge::Remove { key_len } => {
                            self.capacity.add_remove_cu(response.status, *key_len)
                        }
                        Charge::None => {}
                    }
                }
                debug!(
                    decree,
                    requests = responses.len(),
                    ops = batch.len(),
                    elapsed_us = elapsed.as_micros() as u64,
                    "committed write batch"
                );
            }
            Err(err) => {
                let status = err.status();
                for response in &mut responses {
                    response.status = status;
                }
            }
        }
        Ok(BatchOutcome {
            decree,
            responses,
            result,
        })
    }

    /// Drop the open batch; every staged response gets `status`.
    pub fn batch_abort(&mut self, decree: i64, status: Status) -> WriteResult<Vec<UpdateResponse>> {
        let state = self.take_batch(decree)?;
        debug!(decree, requests = state.len(), ?status, "aborted write batch");
        Ok(state.abort(status))
    }

    pub fn multi_put(
        &mut self,
        ctx: &WriteContext,
        req: &MultiPutRequest,
    ) -> WriteResult<UpdateResponse> {
        self.ensure_idle()?;
        self.ensure_decree(ctx.decree)?;
        let response = UpdateResponse::new(ctx.decree);

        if let Err(err) = check_hash_key(&req.hash_key) {
            debug!(decree = ctx.decree, error = %err, "rejecting multi_put");
            return self.reject(ctx.decree, response, Status::InvalidArgument);
        }
        if req.kvs.is_empty() {
            debug!(decree = ctx.decree, "rejecting multi_put without values");
            return self.reject(ctx.decree, response, Status::InvalidArgument);
        }
        if let Err(err) = self.resolver.check_timestamp(ctx) {
            debug!(decree = ctx.decree, error = %err, "rejecting multi_put");
            return self.reject(ctx.decree, response, Status::InvalidArgument);
        }

        let expire_ts = self.expire_ts(ctx, req.ttl_seconds);
        let mut batch = WriteBatch::new(ctx.decree);
        let mut applied: Vec<&KeyValue> = Vec::with_capacity(req.kvs.len());
        for kv in &req.kvs {
            let key = match generate_key(&req.hash_key, &kv.sort_key) {
                Ok(key) => key,
                Err(err) => {
                    debug!(decree = ctx.decree, error = %err, "rejecting multi_put");
                    return self.reject(ctx.decree, response, Status::InvalidArgument);
                }
            };
            match self.resolve_put(ctx, &key)? {
                Resolution::Apply(timetag) => {
                    batch.put(key, encode_value(expire_ts, timetag, &kv.value));
                    applied.push(kv);
                }
                Resolution::Skip { stored } => {
                    debug!(
                        decree = ctx.decree,
                        stored = %stored,
                        "skipping duplicated multi_put sort key"
                    );
                }
            }
        }
        if batch.is_empty() {
            put_sentinel(&mut batch);
        }
        self.commit(&batch)?;
        self.capacity
            .add_multi_put_cu(response.status, &req.hash_key, applied);
        Ok(response)
    }

    pub fn multi_remove(
        &mut self,
        ctx: &WriteContext,
        req: &MultiRemoveRequest,
    ) -> WriteResult<MultiRemoveResponse> {
        self.ensure_idle()?;
        self.ensure_decree(ctx.decree)?;
        let mut response = MultiRemoveResponse {
            status: Status::Ok,
            decree: ctx.decree,
            count: 0,
        };

        let keys = check_hash_key(&req.hash_key).and_then(|()| {
            req.sort_keys
                .iter()
                .map(|sort_key| generate_key(&req.hash_key, sort_key))
                .collect::<Result<Vec<_>, _>>()
        });
        let rejection = match &keys {
            Err(err) => Some(err.to_string()),
            Ok(keys) if keys.is_empty() => Some("no sort keys".to_string()),
            Ok(_) => None,
        };
        if let Some(reason) = rejection {
            debug!(decree = ctx.decree, reason = %reason, "rejecting multi_remove");
            self.write_sentinel(ctx.decree)?;
            response.status = Status::InvalidArgument;
            return Ok(response);
        }

        let mut batch = WriteBatch::new(ctx.decree);
        for key in keys.unwrap_or_default() {
            batch.delete(key);
        }
        self.commit(&batch)?;
        response.count = req.sort_keys.len() as u64;
        self.capacity
            .add_multi_remove_cu(response.status, &req.hash_key, &req.sort_keys);
        Ok(response)
    }

    pub fn incr(&mut self, ctx: &WriteContext, req: &IncrRequest) -> WriteResult<IncrResponse> {
        self.ensure_idle()?;
        self.ensure_decree(ctx.decree)?;
        let mut response = IncrResponse {
            status: Status::Ok,
            decree: ctx.decree,
            new_value: 0,
        };

        if let Err(reason) = self.check_stamped_write(ctx, &req.key) {
            debug!(decree = ctx.decree, reason = %reason, "rejecting incr");
            self.write_sentinel(ctx.decree)?;
            response.status = Status::InvalidArgument;
            return Ok(response);
        }

        let now = ctx.epoch_now();
        let existing = read_live_record(self.engine.as_ref(), &req.key, now)?;
        let read_bytes = req.key.len() + existing.as_ref().map_or(0, |e| e.user_value.len());
        // Missing, empty and non-integer values all count as zero.
        let old_value = existing
            .as_ref()
            .and_then(|envelope| parse_i64(&envelope.user_value))
            .unwrap_or(0);

        let Some(new_value) = old_value.checked_add(req.increment) else {
            debug!(
                decree = ctx.decree,
                old_value,
                increment = req.increment,
                "incr overflows"
            );
            self.write_sentinel(ctx.decree)?;
            response.status = Status::Overflow;
            response.new_value = old_value;
            self.capacity.add_incr_cu(response.status, read_bytes, 0);
            return Ok(response);
        };

        let expire_ts = match req.ttl_seconds {
            ttl if ttl > 0 => expire_ts_from_ttl(now, ttl.unsigned_abs()),
            ttl if ttl < 0 => 0,
            _ => match existing.as_ref() {
                Some(envelope) => envelope.expire_ts,
                None => expire_ts_from_ttl(now, self.default_ttl_seconds),
            },
        };
        let timetag = self.resolver.timetag_for(ctx)?;
        let new_bytes = new_value.to_string().into_bytes();
        let write_bytes = req.key.len() + new_bytes.len();

        let mut batch = WriteBatch::new(ctx.decree);
        batch.put(req.key.clone(), encode_value(expire_ts, timetag, &new_bytes));
        self.commit(&batch)?;

        response.new_value = new_value;
        self.capacity
            .add_incr_cu(response.status, read_bytes, write_bytes);
        Ok(response)
    }

    pub fn check_and_set(
        &mut self,
        ctx: &WriteContext,
        req: &CheckAndSetRequest,
    ) -> WriteResult<CheckAndSetResponse> {
        self.ensure_idle()?;
        self.ensure_decree(ctx.decree)?;
        let mut response = CheckAndSetResponse {
            decree: ctx.decree,
            ..CheckAndSetResponse::default()
        };

        let set_sort_key = if req.set_diff_sort_key {
            &req.set_sort_key
        } else {
            &req.check_sort_key
        };
        let keys = check_hash_key(&req.hash_key).and_then(|()| {
            Ok((
                generate_key(&req.hash_key, &req.check_sort_key)?,
                generate_key(&req.hash_key, set_sort_key)?,
            ))
        });
        let (check_key, set_key) = match keys {
            Ok(keys) => keys,
            Err(err) => {
                debug!(decree = ctx.decree, error = %err, "rejecting check_and_set");
                return self.reject_check(ctx.decree, response, req, Status::InvalidArgument, 0);
            }
        };
        if let Err(err) = self.resolver.check_timestamp(ctx) {
            debug!(decree = ctx.decree, error = %err, "rejecting check_and_set");
            return self.reject_check(ctx.decree, response, req, Status::InvalidArgument, 0);
        }
        let check_type = match validate_check(req.check_type, &req.check_operand) {
            Ok(check_type) => check_type,
            Err(err) => {
                debug!(decree = ctx.decree, error = %err, "rejecting check_and_set");
                return self.reject_check(ctx.decree, response, req, err.status(), 0);
            }
        };

        let (check_value_bytes, read_bytes) =
            self.read_check_value(ctx, &check_key, needs_read(check_type, req.return_check_value))?;
        if req.return_check_value {
            response.check_value_returned = true;
            response.check_value_exist = check_value_bytes.is_some();
            response.check_value = check_value_bytes.clone().unwrap_or_default();
        }

        match check_value(check_type, check_value_bytes.as_deref(), &req.check_operand) {
            Ok(true) => {}
            Ok(false) => {
                return self.reject_check(ctx.decree, response, req, Status::TryAgain, read_bytes);
            }
            Err(err) => {
                debug!(decree = ctx.decree, error = %err, "check_and_set check failed");
                return self.reject_check(ctx.decree, response, req, err.status(), read_bytes);
            }
        }

        let timetag = self.resolver.timetag_for(ctx)?;
        let expire_ts = self.expire_ts(ctx, req.set_ttl_seconds);
        let mut batch = WriteBatch::new(ctx.decree);
        batch.put(set_key, encode_value(expire_ts, timetag, &req.set_value));
        self.commit(&batch)?;

        self.capacity.add_check_and_set_cu(
            response.status,
            read_bytes,
            &req.hash_key,
            set_sort_key,
            &req.set_value,
        );
        Ok(response)
    }

    pub fn check_and_mutate(
        &mut self,
        ctx: &WriteContext,
        req: &CheckAndMutateRequest,
    ) -> WriteResult<CheckAndMutateResponse> {
        self.ensure_idle()?;
        self.ensure_decree(ctx.decree)?;
        let mut response = CheckAndMutateResponse {
            decree: ctx.decree,
            ..CheckAndMutateResponse::default()
        };

        let keys = check_hash_key(&req.hash_key).and_then(|()| {
            let check_key = generate_key(&req.hash_key, &req.check_sort_key)?;
            let mutate_keys = req
                .mutate_list
                .iter()
                .map(|mutate| generate_key(&req.hash_key, &mutate.sort_key))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((check_key, mutate_keys))
        });
        let (check_key, mutate_keys) = match keys {
            Ok(keys) => keys,
            Err(err) => {
                debug!(decree = ctx.decree, error = %err, "rejecting check_and_mutate");
                return self.reject_mutate(ctx.decree, response, req, Status::InvalidArgument, 0);
            }
        };
        if let Err(err) = self.resolver.check_timestamp(ctx) {
            debug!(decree = ctx.decree, error = %err, "rejecting check_and_mutate");
            return self.reject_mutate(ctx.decree, response, req, Status::InvalidArgument, 0);
        }
        if req.mutate_list.is_empty() {
            debug!(decree = ctx.decree, "rejecting check_and_mutate without mutations");
            return self.reject_mutate(ctx.decree, response, req, Status::InvalidArgument, 0);
        }
        let check_type = match validate_check(req.check_type, &req.check_operand) {
            Ok(check_type) => check_type,
            Err(err) => {
                debug!(decree = ctx.decree, error = %err, "rejecting check_and_mutate");
                return self.reject_mutate(ctx.decree, response, req, err.status(), 0);
            }
        };

        let (check_value_bytes, read_bytes) =
            self.read_check_value(ctx, &check_key, needs_read(check_type, req.return_check_value))?;
        if req.return_check_value {
            response.check_value_returned = true;
            response.check_value_exist = check_value_bytes.is_some();
            response.check_value = check_value_bytes.clone().unwrap_or_default();
        }

        match check_value(check_type, check_value_bytes.as_deref(), &req.check_operand) {
            Ok(true) => {}
            Ok(false) => {
                return self.reject_mutate(ctx.decree, response, req, Status::TryAgain, read_bytes);
            }
            Err(err) => {
                debug!(decree = ctx.decree, error = %err, "check_and_mutate check failed");
                return self.reject_mutate(ctx.decree, response, req, err.status(), read_bytes);
            }
        }

        let timetag = self.resolver.timetag_for(ctx)?;
        let mut batch = WriteBatch::new(ctx.decree);
        for (mutate, key) in req.mutate_list.iter().zip(mutate_keys) {
            match mutate.operation {
                MutateOperation::Put => {
                    let expire_ts = self.expire_ts(ctx, mutate.ttl_seconds);
                    batch.put(key, encode_value(expire_ts, timetag, &mutate.value));
                }
                MutateOperation::Delete => batch.delete(key),
            }
        }
        self.commit(&batch)?;

        self.capacity.add_check_and_mutate_cu(
            response.status,
            read_bytes,
            &req.hash_key,
            &req.mutate_list,
        );
        Ok(response)
    }

    /// Apply a write shipped from another cluster of the duplication group.
    pub fn duplicate(
        &mut self,
        ctx: &WriteContext,
        req: &DuplicateRequest,
    ) -> WriteResult<DuplicateResponse> {
        self.ensure_idle()?;
        self.ensure_decree(ctx.decree)?;
        let mut response = DuplicateResponse {
            decree: ctx.decree,
            ..DuplicateResponse::default()
        };

        let remote = req.remote_timetag();
        let rejection = if !self.registry.contains_id(req.cluster_id) {
            Some((
                Status::InvalidArgument,
                format!("unknown origin cluster id {}", req.cluster_id),
            ))
        } else if remote == Timetag::ZERO {
            Some((Status::InvalidArgument, "remote timetag is zero".to_string()))
        } else if remote.cluster_id() != req.cluster_id {
            Some((
                Status::InvalidArgument,
                format!(
                    "remote timetag names cluster {} but the envelope names cluster {}",
                    remote.cluster_id(),
                    req.cluster_id
                ),
            ))
        } else {
            None
        };
        if let Some((status, hint)) = rejection {
            return self.reject_duplicate(ctx.decree, response, status, hint);
        }

        let request = match req.decode_payload() {
            Ok(request) => request,
            Err(err) => {
                return self.reject_duplicate(
                    ctx.decree,
                    response,
                    Status::Corruption,
                    err.to_string(),
                );
            }
        };

        let dup_ctx =
            WriteContext::create_duplicate(ctx.decree, ctx.timestamp, remote, req.verify_timetag);
        response.status = match &request {
            WriteRequest::Put(inner) => self.put(&dup_ctx, inner)?.status,
            WriteRequest::Remove(inner) => self.remove(&dup_ctx, inner)?.status,
            WriteRequest::MultiPut(inner) => self.multi_put(&dup_ctx, inner)?.status,
            WriteRequest::MultiRemove(inner) => self.multi_remove(&dup_ctx, inner)?.status,
            WriteRequest::Incr(inner) => self.incr(&dup_ctx, inner)?.status,
            WriteRequest::CheckAndSet(inner) => self.check_and_set(&dup_ctx, inner)?.status,
            WriteRequest::CheckAndMutate(inner) => self.check_and_mutate(&dup_ctx, inner)?.status,
            WriteRequest::Duplicate(_) => {
                return self.reject_duplicate(
                    ctx.decree,
                    response,
                    Status::Corruption,
                    EnvelopeError::NestedDuplication.to_string(),
                );
            }
        };
        Ok(response)
    }

    /// Validate a write that stamps a record at `key`.
    fn check_stamped_write(&self, ctx: &WriteContext, key: &[u8]) -> Result<(), String> {
        check_user_key(key).map_err(|err| err.to_string())?;
        self.resolver
            .check_timestamp(ctx)
            .map_err(|err| err.to_string())
    }

    fn ensure_idle(&self) -> WriteResult<()> {
        match &self.batch {
            Some(state) => Err(WriteError::BatchInProgress {
                open: state.decree(),
            }),
            None => Ok(()),
        }
    }

    fn ensure_decree(&self, decree: i64) -> WriteResult<()> {
        if decree < self.last_applied_decree {
            return Err(WriteError::DecreeRegression {
                decree,
                last_applied: self.last_applied_decree,
            });
        }
        Ok(())
    }

    fn ensure_batch(&self, decree: i64) -> WriteResult<()> {
        match &self.batch {
            None => Err(WriteError::BatchNotPrepared { decree }),
            Some(state) if state.decree() != decree => Err(WriteError::DecreeMismatch {
                expected: state.decree(),
                actual: decree,
            }),
            Some(_) => Ok(()),
        }
    }

    fn take_batch(&mut self, decree: i64) -> WriteResult<BatchState> {
        self.ensure_batch(decree)?;
        self.batch
            .take()
            .ok_or(WriteError::BatchNotPrepared { decree })
    }

    fn stage(&mut self, entry: StagedEntry) -> WriteResult<BatchSlot> {
        let decree = entry.response.decree;
        let state = self
            .batch
            .as_mut()
            .ok_or(WriteError::BatchNotPrepared { decree })?;
        Ok(state.stage(entry))
    }

    /// Commit a one-request batch and surface an engine failure as `Err`.
    fn single_response(&mut self, decree: i64, slot: BatchSlot) -> WriteResult<UpdateResponse> {
        let outcome = self.batch_commit(decree)?;
        let response = outcome.response(slot).copied();
        outcome.result?;
        response.ok_or(WriteError::BatchNotPrepared { decree })
    }

    fn resolve_put(&self, ctx: &WriteContext, key: &[u8]) -> WriteResult<Resolution> {
        let stored = if ConflictResolver::needs_verification(ctx) {
            let record = read_live_record(self.engine.as_ref(), key, ctx.epoch_now())?;
            let bytes = key.len() + record.as_ref().map_or(0, |r| r.user_value.len());
            self.capacity.add_verify_read_cu(1, bytes);
            record.map(|r| r.timetag)
        } else {
            None
        };
        Ok(self.resolver.resolve(ctx, stored)?)
    }

    /// Live value of the check key plus the bytes the read cost.
    fn read_check_value(
        &self,
        ctx: &WriteContext,
        check_key: &[u8],
        read: bool,
    ) -> Result<(Option<Vec<u8>>, usize), StorageError> {
        if !read {
            return Ok((None, 0));
        }
        let value = read_live_record(self.engine.as_ref(), check_key, ctx.epoch_now())?
            .map(|envelope| envelope.user_value);
        let bytes = check_key.len() + value.as_ref().map_or(0, Vec::len);
        Ok((value, bytes))
    }

    fn expire_ts(&self, ctx: &WriteContext, ttl_seconds: u32) -> u32 {
        let ttl = if ttl_seconds == 0 {
            self.default_ttl_seconds
        } else {
            ttl_seconds
        };
        expire_ts_from_ttl(ctx.epoch_now(), ttl)
    }

    fn commit(&mut self, batch: &WriteBatch) -> Result<(), StorageError> {
        if let Err(err) = self.engine.write(batch) {
            warn!(decree = batch.decree(), error = %err, "engine write failed");
            return Err(err);
        }
        self.last_applied_decree = self.last_applied_decree.max(batch.decree());
        Ok(())
    }

    fn write_sentinel(&mut self, decree: i64) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new(decree);
        put_sentinel(&mut batch);
        self.commit(&batch)
    }

    fn reject(
        &mut self,
        decree: i64,
        mut response: UpdateResponse,
        status: Status,
    ) -> WriteResult<UpdateResponse> {
        self.write_sentinel(decree)?;
        response.status = status;
        Ok(response)
    }

    fn reject_check(
        &mut self,
        decree: i64,
        mut response: CheckAndSetResponse,
        req: &CheckAndSetRequest,
        status: Status,
        read_bytes: usize,
    ) -> WriteResult<CheckAndSetResponse> {
        self.write_sentinel(decree)?;
        response.status = status;
        self.capacity.add_check_and_set_cu(
            status,
            read_bytes,
            &req.hash_key,
            &req.set_sort_key,
            &req.set_value,
        );
        Ok(response)
    }

    fn reject_mutate(
        &mut self,
        decree: i64,
        mut response: CheckAndMutateResponse,
        req: &CheckAndMutateRequest,
        status: Status,
        read_bytes: usize,
    ) -> WriteResult<CheckAndMutateResponse> {
        self.write_sentinel(decree)?;
        response.status = status;
        self.capacity
            .add_check_and_mutate_cu(status, read_bytes, &req.hash_key, &req.mutate_list);
        Ok(response)
    }

    fn reject_duplicate(
        &mut self,
        decree: i64,
        mut response: DuplicateResponse,
        status: Status,
        hint: String,
    ) -> WriteResult<DuplicateResponse> {
        warn!(decree, ?status, hint = %hint, "rejecting duplicated write");
        self.write_sentinel(decree)?;
        response.status = status;
        response.error_hint = hint;
        Ok(response)
    }
}

fn put_sentinel(batch: &mut WriteBatch) {
    batch.put(empty_write_key(), ValueEnvelope::default().encode());
}
