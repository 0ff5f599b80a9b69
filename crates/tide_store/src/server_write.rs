//! Entry point of the replication layer: one decreed mutation at a time.

use serde::{Deserialize, Serialize};
use tide_proto::{WriteRequest, WriteResponse};
use tracing::warn;

use crate::context::WriteContext;
use crate::error::{WriteError, WriteResult};
use crate::write_service::WriteService;

/// A committed log entry: every request replicated under one decree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecreedMutation {
    pub decree: i64,
    /// Unix microseconds at which the mutation was generated.
    pub timestamp: u64,
    #[serde(default)]
    pub requests: Vec<WriteRequest>,
}

pub struct ServerWrite {
    service: WriteService,
}

impl ServerWrite {
    pub fn new(service: WriteService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &WriteService {
        &self.service
    }

    pub fn apply(&mut self, mutation: &DecreedMutation) -> WriteResult<Vec<WriteResponse>> {
        self.on_batched_write_requests(mutation.decree, mutation.timestamp, &mutation.requests)
    }

    /// Apply every request of one decree.
    ///
    /// An empty mutation consumes the decree with an empty write. A single
    /// non-batchable request goes through its own handler; otherwise every
    /// request must be a single-key put or remove and they are committed
    /// together in one batch.
    pub fn on_batched_write_requests(
        &mut self,
        decree: i64,
        timestamp: u64,
        requests: &[WriteRequest],
    ) -> WriteResult<Vec<WriteResponse>> {
        let ctx = WriteContext::create(decree, timestamp);
        match requests {
            [] => {
                self.service.empty_put(decree)?;
                Ok(Vec::new())
            }
            [request] if !request.is_batchable() => {
                Ok(vec![self.service.apply_request(&ctx, request)?])
            }
            _ => self.apply_batch(&ctx, requests),
        }
    }

    fn apply_batch(
        &mut self,
        ctx: &WriteContext,
        requests: &[WriteRequest],
    ) -> WriteResult<Vec<WriteResponse>> {
        if let Some(request) = requests.iter().find(|r| !r.is_batchable()) {
            return Err(WriteError::Unbatchable {
                decree: ctx.decree,
                kind: request.kind(),
            });
        }

        self.service.batch_prepare(ctx.decree)?;
        for request in requests {
            let staged = match request {
                WriteRequest::Put(req) => self.service.batch_put(ctx, req),
                WriteRequest::Remove(req) => self.service.batch_remove(ctx, req),
                _ => Err(WriteError::Unbatchable {
                    decree: ctx.decree,
                    kind: request.kind(),
                }),
            };
            if let Err(err) = staged {
                warn!(decree = ctx.decree, error = %err, "aborting write batch");
                self.service.batch_abort(ctx.decree, err.status())?;
                return Err(err);
            }
        }

        let outcome = self.service.batch_commit(ctx.decree)?;
        let decree = outcome.decree;
        let responses = outcome.into_result().map_err(|err| {
            warn!(decree, error = %err, "write batch failed");
            WriteError::from(err)
        })?;
        Ok(requests
            .iter()
            .zip(responses)
            .map(|(request, response)| match request {
                WriteRequest::Remove(_) => WriteResponse::Remove(response),
                _ => WriteResponse::Put(response),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capacity::CapacityUnitCounters;
    use crate::config::{ClusterIdentity, WriteServiceConfig};
    use crate::engine::MemEngine;
    use tide_proto::{IncrRequest, MultiPutRequest, PutRequest, RequestKind, Status};

    fn server() -> ServerWrite {
        let config = WriteServiceConfig::new(ClusterIdentity::single("local", 1).unwrap());
        let service = WriteService::new(
            Arc::new(MemEngine::new()),
            config,
            Arc::new(CapacityUnitCounters::new()),
        )
        .unwrap();
        ServerWrite::new(service)
    }

    #[test]
    fn mixed_mutations_are_rejected_before_any_write() {
        let mut server = server();
        let requests = vec![
            WriteRequest::Put(PutRequest::default()),
            WriteRequest::MultiPut(MultiPutRequest::default()),
        ];
        let err = server.on_batched_write_requests(3, 1, &requests).unwrap_err();
        assert!(matches!(
            err,
            WriteError::Unbatchable {
                decree: 3,
                kind: RequestKind::MultiPut
            }
        ));
        assert!(!server.service().is_batch_open());
        assert_eq!(server.service().last_applied_decree(), 0);
    }

    #[test]
    fn single_requests_use_their_own_handler() {
        let mut server = server();
        let incr = WriteRequest::Incr(IncrRequest {
            key: tide_proto::generate_key(b"h", b"counter").unwrap(),
            increment: 5,
            ttl_seconds: 0,
        });
        let responses = server.on_batched_write_requests(1, 1, &[incr]).unwrap();
        match &responses[..] {
            [WriteResponse::Incr(resp)] => {
                assert_eq!(resp.status, Status::Ok);
                assert_eq!(resp.new_value, 5);
            }
            other => panic!("unexpected responses {other:?}"),
        }
    }
}
