use std::collections::{HashMap, HashSet};

use engine_executor::{RequestId, TokenId};

use crate::request::{FinishReason, RequestEvent};

/// New tokens for one request in one step.
#[derive(Debug, Clone)]
pub struct EngineCoreOutput {
    pub request_id: RequestId,
    pub new_token_ids: Vec<TokenId>,
    pub finish_reason: Option<FinishReason>,
    pub num_cached_tokens: usize,
    /// Lifecycle events since the request's previous output.
    pub events: Vec<RequestEvent>,
}

impl EngineCoreOutput {
    pub fn finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Everything one client receives from a step.
#[derive(Debug, Clone, Default)]
pub struct EngineCoreOutputs {
    pub outputs: Vec<EngineCoreOutput>,
    /// Requests finished this step, including aborted ones that carry no
    /// output record.
    pub finished_requests: HashSet<RequestId>,
}

impl EngineCoreOutputs {
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.finished_requests.is_empty()
    }

    pub fn merge(&mut self, other: EngineCoreOutputs) {
        self.outputs.extend(other.outputs);
        self.finished_requests.extend(other.finished_requests);
    }
}

#[derive(Debug, Default)]
pub struct StepResult {
    pub outputs: HashMap<usize, EngineCoreOutputs>,
    /// False when the step returned without running the executor.
    pub executed: bool,
}

impl StepResult {
    pub fn idle(outputs: HashMap<usize, EngineCoreOutputs>) -> Self {
        Self { outputs, executed: false }
    }

    pub fn for_client(&self, client_index: usize) -> Option<&EngineCoreOutputs> {
        self.outputs.get(&client_index)
    }
}
