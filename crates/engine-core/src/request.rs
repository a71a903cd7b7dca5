//! Request state: token buffers, status machine, timestamps and event log.

use std::fmt;
use std::time::{Duration, Instant};

use engine_executor::{RequestId, TokenId};
use serde::{Deserialize, Serialize};

/// Request status. Variant order matters: everything after `Preempted` is a
/// finished state and `is_finished` compares ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Waiting,
    WaitingForFsm,
    WaitingForRemoteKvs,
    Running,
    Preempted,
    FinishedStopped,
    FinishedLengthCapped,
    FinishedAborted,
    FinishedIgnored,
    FinishedError,
}

impl RequestStatus {
    pub fn is_finished(self) -> bool {
        self > Self::Preempted
    }

    /// Statuses that hold a request in the waiting queue.
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::Waiting | Self::WaitingForFsm | Self::WaitingForRemoteKvs)
    }

    pub fn finish_reason(self) -> Option<FinishReason> {
        match self {
            Self::FinishedStopped => Some(FinishReason::Stop),
            Self::FinishedLengthCapped => Some(FinishReason::Length),
            Self::FinishedAborted => Some(FinishReason::Abort),
            Self::FinishedIgnored => Some(FinishReason::Ignored),
            Self::FinishedError => Some(FinishReason::Error),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        if self.is_finished() {
            return false;
        }
        if next.is_finished() {
            return true;
        }
        matches!(
            (self, next),
            (Waiting, Running)
                | (Waiting, WaitingForFsm)
                | (Waiting, WaitingForRemoteKvs)
                | (WaitingForFsm, Waiting)
                | (WaitingForRemoteKvs, Waiting)
                | (Running, Preempted)
                | (Preempted, Running)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// EOS or a stop token.
    Stop,
    /// `max_tokens` or the model length was reached.
    Length,
    Abort,
    Ignored,
    Error,
}

impl FinishReason {
    pub fn status(self) -> RequestStatus {
        match self {
            Self::Stop => RequestStatus::FinishedStopped,
            Self::Length => RequestStatus::FinishedLengthCapped,
            Self::Abort => RequestStatus::FinishedAborted,
            Self::Ignored => RequestStatus::FinishedIgnored,
            Self::Error => RequestStatus::FinishedError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Abort => "abort",
            Self::Ignored => "ignored",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub max_tokens: usize,
    pub stop_token_ids: Vec<TokenId>,
    pub eos_token_id: Option<TokenId>,
    pub ignore_eos: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self { max_tokens: 16, stop_token_ids: Vec::new(), eos_token_id: None, ignore_eos: false }
    }
}

impl SamplingParams {
    pub fn with_max_tokens(max_tokens: usize) -> Self {
        Self { max_tokens, ..Self::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestEventKind {
    Created,
    Queued,
    Scheduled,
    FirstToken,
    Preempted,
    Resumed,
    Finished,
    Aborted,
    Error,
}

#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub kind: RequestEventKind,
    pub at: Instant,
    pub detail: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: RequestId,
    /// Routes outputs back to the submitting client.
    pub client_index: usize,
    pub sampling: SamplingParams,
    prompt_token_ids: Vec<TokenId>,
    output_token_ids: Vec<TokenId>,
    all_token_ids: Vec<TokenId>,
    status: RequestStatus,
    num_computed_tokens: usize,
    num_cached_tokens: usize,
    num_preemptions: u32,
    arrival: Instant,
    first_scheduled: Option<Instant>,
    first_token: Option<Instant>,
    finished_at: Option<Instant>,
    events: Vec<RequestEvent>,
    events_reported: usize,
}

impl Request {
    pub fn new(
        request_id: impl Into<RequestId>,
        client_index: usize,
        prompt_token_ids: Vec<TokenId>,
        sampling: SamplingParams,
    ) -> Self {
        let mut req = Self {
            request_id: request_id.into(),
            client_index,
            sampling,
            all_token_ids: prompt_token_ids.clone(),
            prompt_token_ids,
            output_token_ids: Vec::new(),
            status: RequestStatus::Waiting,
            num_computed_tokens: 0,
            num_cached_tokens: 0,
            num_preemptions: 0,
            arrival: Instant::now(),
            first_scheduled: None,
            first_token: None,
            finished_at: None,
            events: Vec::new(),
            events_reported: 0,
        };
        req.record_event(RequestEventKind::Created, None);
        req
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.status.finish_reason()
    }

    /// Apply a validated transition. Invalid transitions are logged and
    /// ignored; returns whether the status changed.
    pub fn set_status(&mut self, next: RequestStatus) -> bool {
        if self.status == next {
            return false;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(target: "scheduler", request_id = %self.request_id, from = ?self.status, to = ?next, "invalid status transition ignored");
            return false;
        }
        let now = Instant::now();
        if next == RequestStatus::Running {
            self.first_scheduled.get_or_insert(now);
        }
        if next.is_finished() {
            self.finished_at.get_or_insert(now);
        }
        self.status = next;
        true
    }

    pub fn prompt_token_ids(&self) -> &[TokenId] {
        &self.prompt_token_ids
    }

    pub fn output_token_ids(&self) -> &[TokenId] {
        &self.output_token_ids
    }

    /// Prompt followed by output.
    pub fn all_token_ids(&self) -> &[TokenId] {
        &self.all_token_ids
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn num_output_tokens(&self) -> usize {
        self.output_token_ids.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.all_token_ids.len()
    }

    pub fn num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    /// Clamped to the number of known tokens.
    pub fn set_num_computed_tokens(&mut self, n: usize) {
        if n > self.num_tokens() {
            tracing::warn!(target: "scheduler", request_id = %self.request_id, n, num_tokens = self.num_tokens(), "computed tokens clamped");
        }
        self.num_computed_tokens = n.min(self.num_tokens());
    }

    pub fn num_cached_tokens(&self) -> usize {
        self.num_cached_tokens
    }

    pub fn set_num_cached_tokens(&mut self, n: usize) {
        self.num_cached_tokens = n;
    }

    pub fn num_preemptions(&self) -> u32 {
        self.num_preemptions
    }

    /// Tokens still to run before the next sample.
    pub fn num_remaining_tokens(&self) -> usize {
        self.num_tokens() - self.num_computed_tokens
    }

    pub fn is_prefill(&self) -> bool {
        self.num_computed_tokens < self.num_prompt_tokens()
    }

    pub fn append_output_token(&mut self, token: TokenId) {
        self.output_token_ids.push(token);
        self.all_token_ids.push(token);
        if self.first_token.is_none() {
            self.first_token = Some(Instant::now());
            self.record_event(RequestEventKind::FirstToken, None);
        }
    }

    /// Drop computed state after the request's blocks were released.
    pub fn reset_for_preemption(&mut self) {
        self.num_computed_tokens = 0;
        self.num_preemptions += 1;
    }

    pub fn record_event(&mut self, kind: RequestEventKind, detail: Option<serde_json::Value>) {
        self.events.push(RequestEvent { kind, at: Instant::now(), detail });
    }

    pub fn events(&self) -> &[RequestEvent] {
        &self.events
    }

    /// Events appended since the previous call.
    pub fn take_new_events(&mut self) -> Vec<RequestEvent> {
        let new = self.events[self.events_reported..].to_vec();
        self.events_reported = self.events.len();
        new
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    pub fn queue_time(&self) -> Option<Duration> {
        self.first_scheduled.map(|t| t.duration_since(self.arrival))
    }

    pub fn time_to_first_token(&self) -> Option<Duration> {
        self.first_token.map(|t| t.duration_since(self.arrival))
    }

    pub fn total_time(&self) -> Option<Duration> {
        self.finished_at.map(|t| t.duration_since(self.arrival))
    }
}
