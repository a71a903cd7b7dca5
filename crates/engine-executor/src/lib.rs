//! The executor seam: what the engine core hands to a model executor each
//! step, and what it expects back.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use engine_common::Result;
use serde::{Deserialize, Serialize};

#[cfg(feature = "mock")]
pub mod mock;

pub type RequestId = String;
pub type TokenId = u32;
pub type BlockId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduledPhase {
    /// The request still has prompt tokens to process.
    Prefill,
    Decode,
}

/// One request's share of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledRequest {
    pub request_id: RequestId,
    /// Tokens to run this step, starting at `num_computed_tokens`.
    pub token_ids: Vec<TokenId>,
    pub num_computed_tokens: usize,
    pub num_prompt_tokens: usize,
    /// All tokens known for the request (prompt plus output so far).
    pub num_tokens: usize,
    /// Full block table of the request.
    pub block_ids: Vec<BlockId>,
    pub phase: ScheduledPhase,
    pub resumed_from_preemption: bool,
}

impl ScheduledRequest {
    pub fn num_scheduled_tokens(&self) -> usize {
        self.token_ids.len()
    }

    /// Whether this step reaches the end of the known tokens, i.e. the
    /// executor should sample for this request.
    pub fn completes_sequence(&self) -> bool {
        self.num_computed_tokens + self.token_ids.len() >= self.num_tokens
    }
}

/// The batch produced by one `schedule()` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerOutput {
    pub step_id: u64,
    pub scheduled: Vec<ScheduledRequest>,
    pub num_scheduled_tokens: HashMap<RequestId, usize>,
    pub total_num_scheduled_tokens: usize,
    pub num_prefill_tokens: usize,
    pub num_decode_tokens: usize,
    pub preempted_req_ids: Vec<RequestId>,
    /// Requests finished since the previous batch; the executor may drop
    /// any per-request state it holds for them.
    pub finished_req_ids: HashSet<RequestId>,
}

impl SchedulerOutput {
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    pub fn num_requests(&self) -> usize {
        self.scheduled.len()
    }

    pub fn request_ids(&self) -> impl Iterator<Item = &str> {
        self.scheduled.iter().map(|r| r.request_id.as_str())
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.num_scheduled_tokens.contains_key(request_id)
    }
}

/// Per-request sampled tokens, indexed in batch order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOutput {
    pub req_ids: Vec<RequestId>,
    pub req_id_to_index: HashMap<RequestId, usize>,
    pub sampled_token_ids: Vec<Vec<TokenId>>,
}

impl ModelOutput {
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<TokenId>)>,
        S: Into<RequestId>,
    {
        let mut out = Self::default();
        for (id, tokens) in pairs {
            let id = id.into();
            out.req_id_to_index.insert(id.clone(), out.req_ids.len());
            out.req_ids.push(id);
            out.sampled_token_ids.push(tokens);
        }
        out
    }

    pub fn sampled(&self, request_id: &str) -> Option<&[TokenId]> {
        let idx = *self.req_id_to_index.get(request_id)?;
        self.sampled_token_ids.get(idx).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.req_ids.is_empty()
    }
}

/// Result of submitting a batch; `wait` yields the model output.
pub enum ExecutionHandle {
    Ready(Result<ModelOutput>),
    Deferred(Box<dyn FnOnce() -> Result<ModelOutput> + Send>),
}

impl ExecutionHandle {
    pub fn wait(self) -> Result<ModelOutput> {
        match self {
            Self::Ready(res) => res,
            Self::Deferred(f) => f(),
        }
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(res) => f.debug_tuple("Ready").field(&res.is_ok()).finish(),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// Produces token ids for scheduled batches. Implementations must report
/// results for the batch's requests in batch order.
pub trait Executor: Send + Sync {
    fn execute_model(&self, batch: &SchedulerOutput) -> Result<ModelOutput>;

    /// Non-blocking submission for the pipelined step. The default runs the
    /// batch immediately.
    fn submit_model(&self, batch: &SchedulerOutput) -> ExecutionHandle {
        ExecutionHandle::Ready(self.execute_model(batch))
    }

    /// Release executor resources. Must be idempotent.
    fn shutdown(&self) {}
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute_model(&self, batch: &SchedulerOutput) -> Result<ModelOutput> {
        (**self).execute_model(batch)
    }

    fn submit_model(&self, batch: &SchedulerOutput) -> ExecutionHandle {
        (**self).submit_model(batch)
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }
}
