//! FIFO scheduler with token and batch-size budgets.
//!
//! Each `schedule()` first extends running requests, preempting from the
//! back of the running list when blocks run out, then admits waiting
//! requests in arrival order. A waiting head that does not fit blocks the
//! queue; nothing is admitted in a step that preempted.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use engine_common::config::{EngineConfig, SchedulerConfig};
use engine_common::{EngineError, Result};
use engine_executor::{ModelOutput, RequestId, ScheduledPhase, ScheduledRequest, SchedulerOutput, TokenId};
use serde_json::json;

use crate::kv::{ComputedBlocks, KvCacheManager};
use crate::outputs::{EngineCoreOutput, EngineCoreOutputs};
use crate::queue::{FinishedHistory, WaitingQueue};
use crate::request::{FinishReason, Request, RequestEventKind, RequestStatus};

#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    kv: KvCacheManager,
    requests: HashMap<RequestId, Request>,
    waiting: WaitingQueue,
    running: Vec<RequestId>,
    /// Requests inside a submitted, not yet applied batch.
    in_flight: HashSet<RequestId>,
    history: FinishedHistory,
    finished_since_schedule: HashSet<RequestId>,
    finished_reports: Vec<(usize, RequestId)>,
    /// Waiting requests already reported as never schedulable.
    never_fits: HashSet<RequestId>,
    step_id: u64,
}

impl Scheduler {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let kv = KvCacheManager::new(&config.cache, config.prefix_cache.clone())?;
        let sc = config.scheduler.clone();
        Ok(Self {
            history: FinishedHistory::new(sc.finished_history_size, Duration::from_secs(sc.finished_history_ttl_secs)),
            config: sc,
            kv,
            requests: HashMap::new(),
            waiting: WaitingQueue::default(),
            running: Vec::new(),
            in_flight: HashSet::new(),
            finished_since_schedule: HashSet::new(),
            finished_reports: Vec::new(),
            never_fits: HashSet::new(),
            step_id: 0,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn kv(&self) -> &KvCacheManager {
        &self.kv
    }

    pub fn kv_mut(&mut self) -> &mut KvCacheManager {
        &mut self.kv
    }

    pub fn add_request(&mut self, mut req: Request) -> Result<()> {
        let id = req.request_id.clone();
        if self.requests.contains_key(&id) || self.history.contains(&id) {
            tracing::warn!(target: "scheduler", request_id = %id, "duplicate request rejected");
            return Err(EngineError::DuplicateRequest(id));
        }
        if req.num_prompt_tokens() == 0 {
            return Err(EngineError::InvalidRequest(format!("{id}: empty prompt")));
        }
        if req.num_prompt_tokens() >= self.config.max_model_len {
            return Err(EngineError::InvalidRequest(format!(
                "{id}: prompt of {} tokens does not fit max_model_len {}",
                req.num_prompt_tokens(),
                self.config.max_model_len
            )));
        }
        req.record_event(RequestEventKind::Queued, None);
        tracing::debug!(target: "scheduler", request_id = %id, prompt_len = req.num_prompt_tokens(), "request queued");
        self.waiting.push_back(id.clone());
        self.requests.insert(id, req);
        Ok(())
    }

    pub fn schedule(&mut self) -> SchedulerOutput {
        self.step_id += 1;
        let mut budget = self.config.max_num_batched_tokens;
        let mut out = SchedulerOutput {
            step_id: self.step_id,
            finished_req_ids: std::mem::take(&mut self.finished_since_schedule),
            ..Default::default()
        };
        // (id, tokens this step, resumed)
        let mut picked: Vec<(RequestId, usize, bool)> = Vec::new();

        let mut idx = 0;
        while idx < self.running.len() && budget > 0 {
            let id = self.running[idx].clone();
            if self.in_flight.contains(&id) {
                idx += 1;
                continue;
            }
            let Some(req) = self.requests.get(&id) else {
                self.running.remove(idx);
                continue;
            };
            let n = req.num_remaining_tokens().min(budget);
            if n == 0 {
                idx += 1;
                continue;
            }
            let target = req.num_computed_tokens() + n;
            let mut preempted_self = false;
            while let Err(e) = self.kv.allocate_slots(&id, target, &ComputedBlocks::default()) {
                let victim = (idx + 1..self.running.len()).rev().find(|&p| !self.in_flight.contains(&self.running[p]));
                tracing::debug!(target: "scheduler", request_id = %id, error = %e, "out of blocks, preempting");
                match victim {
                    Some(pos) => {
                        let victim = self.running.remove(pos);
                        self.preempt(&victim);
                        out.preempted_req_ids.push(victim);
                    }
                    None => {
                        self.running.remove(idx);
                        self.preempt(&id);
                        out.preempted_req_ids.push(id.clone());
                        preempted_self = true;
                        break;
                    }
                }
            }
            if preempted_self {
                break;
            }
            picked.push((id, n, false));
            budget -= n;
            idx += 1;
        }

        if out.preempted_req_ids.is_empty() {
            self.admit_waiting(&mut budget, &mut picked);
        }

        for (id, n, resumed) in picked {
            let Some(req) = self.requests.get(&id) else { continue };
            let start = req.num_computed_tokens();
            let prefill = req.is_prefill();
            if prefill {
                out.num_prefill_tokens += n;
            } else {
                out.num_decode_tokens += n;
            }
            out.total_num_scheduled_tokens += n;
            out.num_scheduled_tokens.insert(id.clone(), n);
            out.scheduled.push(ScheduledRequest {
                token_ids: req.all_token_ids()[start..start + n].to_vec(),
                num_computed_tokens: start,
                num_prompt_tokens: req.num_prompt_tokens(),
                num_tokens: req.num_tokens(),
                block_ids: self.kv.block_ids(&id).to_vec(),
                phase: if prefill { ScheduledPhase::Prefill } else { ScheduledPhase::Decode },
                resumed_from_preemption: resumed,
                request_id: id,
            });
        }

        if !out.is_empty() || !out.preempted_req_ids.is_empty() {
            tracing::debug!(
                target: "scheduler",
                step = out.step_id,
                requests = out.num_requests(),
                tokens = out.total_num_scheduled_tokens,
                prefill = out.num_prefill_tokens,
                decode = out.num_decode_tokens,
                preempted = out.preempted_req_ids.len(),
                waiting = self.waiting.len(),
                "scheduled batch"
            );
        }
        out
    }

    fn admit_waiting(&mut self, budget: &mut usize, picked: &mut Vec<(RequestId, usize, bool)>) {
        while self.running.len() < self.config.max_num_seqs && *budget > 0 {
            let Some(id) = self.next_admissible() else { break };
            let Some(req) = self.requests.get(&id) else {
                self.waiting.remove(&id);
                continue;
            };
            let num_tokens = req.num_tokens();
            let resumed = req.status() == RequestStatus::Preempted;
            let computed = self.kv.match_computed_blocks(req.all_token_ids());
            let need = num_tokens - computed.num_computed_tokens;
            let oversized = need > self.config.max_num_batched_tokens;
            if (oversized && !resumed) || self.kv.blocks_for_tokens(num_tokens) > self.kv.pool().num_blocks() {
                if self.never_fits.insert(id.clone()) {
                    tracing::warn!(
                        target: "scheduler",
                        request_id = %id,
                        need,
                        budget = self.config.max_num_batched_tokens,
                        "request exceeds scheduler capacity and stays waiting"
                    );
                }
                break;
            }
            // a resumed request longer than the token budget is recomputed in chunks
            let n = if oversized { need.min(*budget) } else { need };
            if n > *budget {
                break;
            }
            if let Err(e) = self.kv.allocate_slots(&id, computed.num_computed_tokens + n, &computed) {
                tracing::debug!(target: "scheduler", request_id = %id, error = %e, "admission deferred");
                break;
            }
            self.kv.commit_computed_blocks(&computed);
            self.waiting.remove(&id);
            let Some(req) = self.requests.get_mut(&id) else { continue };
            req.set_num_computed_tokens(computed.num_computed_tokens);
            req.set_num_cached_tokens(computed.num_computed_tokens);
            req.set_status(RequestStatus::Running);
            let kind = if resumed { RequestEventKind::Resumed } else { RequestEventKind::Scheduled };
            req.record_event(kind, Some(json!({ "num_cached_tokens": computed.num_computed_tokens })));
            self.running.push(id.clone());
            picked.push((id, n, resumed));
            *budget -= n;
        }
    }

    fn next_admissible(&self) -> Option<RequestId> {
        self.waiting
            .iter()
            .find(|id| {
                self.requests
                    .get(*id)
                    .map_or(false, |r| matches!(r.status(), RequestStatus::Waiting | RequestStatus::Preempted))
            })
            .cloned()
    }

    fn preempt(&mut self, id: &str) {
        self.kv.free(id);
        if let Some(req) = self.requests.get_mut(id) {
            req.reset_for_preemption();
            req.set_status(RequestStatus::Preempted);
            req.record_event(RequestEventKind::Preempted, Some(json!({ "num_preemptions": req.num_preemptions() })));
            tracing::debug!(target: "scheduler", request_id = %id, preemptions = req.num_preemptions(), "request preempted");
        }
        self.waiting.push_front(id.to_string());
    }

    /// Apply executor results. Requests no longer live or whose computed
    /// position moved since scheduling are skipped.
    pub fn update_from_output(&mut self, sched: &SchedulerOutput, model: &ModelOutput) -> HashMap<usize, EngineCoreOutputs> {
        let mut outputs: HashMap<usize, EngineCoreOutputs> = HashMap::new();
        for sr in &sched.scheduled {
            let id = &sr.request_id;
            let Some(sampled) = model.sampled(id) else {
                tracing::trace!(target: "scheduler", request_id = %id, "no model output for request");
                continue;
            };
            let Some(req) = self.requests.get_mut(id) else {
                tracing::debug!(target: "scheduler", request_id = %id, "output for unknown request dropped");
                continue;
            };
            if req.status() != RequestStatus::Running || req.num_computed_tokens() != sr.num_computed_tokens {
                tracing::debug!(target: "scheduler", request_id = %id, status = ?req.status(), "stale output dropped");
                continue;
            }
            req.set_num_computed_tokens(sr.num_computed_tokens + sr.num_scheduled_tokens());

            let mut new_tokens = Vec::new();
            let mut finish = None;
            if req.num_computed_tokens() == req.num_tokens() {
                for &tok in sampled {
                    req.append_output_token(tok);
                    new_tokens.push(tok);
                    finish = check_stop(req, tok, self.config.max_model_len);
                    if finish.is_some() {
                        break;
                    }
                }
            }
            self.kv.cache_full_blocks(req);

            if let Some(reason) = finish {
                req.set_status(reason.status());
                req.record_event(RequestEventKind::Finished, Some(json!({ "reason": reason.as_str() })));
            }
            if !new_tokens.is_empty() || finish.is_some() {
                let client = req.client_index;
                let record = EngineCoreOutput {
                    request_id: id.clone(),
                    new_token_ids: new_tokens,
                    finish_reason: finish,
                    num_cached_tokens: req.num_cached_tokens(),
                    events: req.take_new_events(),
                };
                let batch = outputs.entry(client).or_default();
                batch.outputs.push(record);
                if finish.is_some() {
                    batch.finished_requests.insert(id.clone());
                }
            }
            if let Some(reason) = finish {
                tracing::debug!(target: "scheduler", request_id = %id, %reason, "request finished");
                self.remove_finished(id);
            }
        }
        outputs
    }

    /// Abort live requests. Unknown or already finished ids are ignored.
    pub fn abort_requests<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.finish_requests(ids, FinishReason::Abort)
    }

    pub fn finish_requests<I, S>(&mut self, ids: I, reason: FinishReason) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut finished = 0;
        for id in ids {
            let id = id.as_ref();
            let Some(req) = self.requests.get_mut(id) else {
                tracing::debug!(target: "scheduler", request_id = %id, "finish of unknown request ignored");
                continue;
            };
            req.set_status(reason.status());
            let kind = if reason == FinishReason::Abort { RequestEventKind::Aborted } else { RequestEventKind::Finished };
            req.record_event(kind, Some(json!({ "reason": reason.as_str() })));
            let client = req.client_index;
            self.remove_finished(id);
            self.finished_reports.push((client, id.to_string()));
            finished += 1;
        }
        if finished > 0 {
            tracing::debug!(target: "scheduler", finished, %reason, "requests finished by caller");
        }
        finished
    }

    fn remove_finished(&mut self, id: &str) -> Option<Request> {
        let req = self.requests.remove(id)?;
        self.running.retain(|r| r != id);
        self.waiting.remove(id);
        self.never_fits.remove(id);
        self.kv.free(id);
        self.history.insert(id.to_string(), req.status());
        self.finished_since_schedule.insert(id.to_string());
        Some(req)
    }

    /// Finish notices for requests ended by `abort_requests` /
    /// `finish_requests`, grouped by client.
    pub fn take_finished_reports(&mut self) -> HashMap<usize, EngineCoreOutputs> {
        let mut out: HashMap<usize, EngineCoreOutputs> = HashMap::new();
        for (client, id) in self.finished_reports.drain(..) {
            out.entry(client).or_default().finished_requests.insert(id);
        }
        out
    }

    pub fn has_finished_reports(&self) -> bool {
        !self.finished_reports.is_empty()
    }

    pub fn mark_in_flight(&mut self, sched: &SchedulerOutput) {
        self.in_flight.extend(sched.request_ids().map(str::to_string));
    }

    pub fn release_in_flight(&mut self, sched: &SchedulerOutput) {
        for id in sched.request_ids() {
            self.in_flight.remove(id);
        }
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.contains(id)
    }

    /// Hold a waiting request until its structured-output grammar is ready.
    pub fn set_grammar_pending(&mut self, id: &str, pending: bool) -> bool {
        self.set_waiting_state(id, RequestStatus::WaitingForFsm, pending)
    }

    /// Hold a waiting request until its remote KV transfer completes.
    pub fn set_remote_kvs_pending(&mut self, id: &str, pending: bool) -> bool {
        self.set_waiting_state(id, RequestStatus::WaitingForRemoteKvs, pending)
    }

    fn set_waiting_state(&mut self, id: &str, held: RequestStatus, pending: bool) -> bool {
        let Some(req) = self.requests.get_mut(id) else { return false };
        let (from, to) = if pending { (RequestStatus::Waiting, held) } else { (held, RequestStatus::Waiting) };
        req.status() == from && req.set_status(to)
    }

    /// Status of a live or recently finished request.
    pub fn request_status(&self, id: &str) -> Option<RequestStatus> {
        self.requests.get(id).map(Request::status).or_else(|| self.history.get(id))
    }

    pub fn get_request(&self, id: &str) -> Option<&Request> {
        self.requests.get(id)
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn running_ids(&self) -> &[RequestId] {
        &self.running
    }

    pub fn waiting_ids(&self) -> Vec<RequestId> {
        self.waiting.iter().cloned().collect()
    }

    pub fn has_unfinished_requests(&self) -> bool {
        !self.requests.is_empty()
    }
}

fn check_stop(req: &Request, token: TokenId, max_model_len: usize) -> Option<FinishReason> {
    let sp = &req.sampling;
    if !sp.ignore_eos && sp.eos_token_id == Some(token) {
        return Some(FinishReason::Stop);
    }
    if sp.stop_token_ids.contains(&token) {
        return Some(FinishReason::Stop);
    }
    if req.num_output_tokens() >= sp.max_tokens || req.num_tokens() >= max_model_len {
        return Some(FinishReason::Length);
    }
    None
}
