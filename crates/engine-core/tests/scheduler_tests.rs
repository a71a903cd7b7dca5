use engine_common::config::EngineConfig;
use engine_common::EngineError;
use engine_core::request::{FinishReason, Request, RequestEventKind, RequestStatus, SamplingParams};
use engine_core::scheduler::Scheduler;
use engine_executor::{ModelOutput, ScheduledPhase, SchedulerOutput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rstest::rstest;

fn config(max_num_seqs: usize, max_num_batched_tokens: usize) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.scheduler.max_num_seqs = max_num_seqs;
    cfg.scheduler.max_num_batched_tokens = max_num_batched_tokens;
    cfg.cache.block_size = 4;
    cfg.cache.num_blocks = 256;
    cfg
}

/// Prompt tokens are offset by `base` so requests do not share prefixes.
fn request(id: &str, base: u32, prompt_len: u32, max_tokens: usize) -> Request {
    Request::new(id, 0, (base..base + prompt_len).collect(), SamplingParams::with_max_tokens(max_tokens))
}

/// One sampled token per scheduled request.
fn sample_all(out: &SchedulerOutput, token: u32) -> ModelOutput {
    ModelOutput::from_pairs(out.scheduled.iter().map(|r| (r.request_id.clone(), vec![token])))
}

fn ids(out: &SchedulerOutput) -> Vec<&str> {
    out.request_ids().collect()
}

#[test]
fn batch_limit_defers_third_request() {
    let mut s = Scheduler::new(&config(2, 10)).unwrap();
    s.add_request(request("r1", 0, 4, 1)).unwrap();
    s.add_request(request("r2", 100, 4, 5)).unwrap();
    s.add_request(request("r3", 200, 4, 5)).unwrap();

    let out = s.schedule();
    assert_eq!(ids(&out), vec!["r1", "r2"]);
    assert_eq!(out.total_num_scheduled_tokens, 8);
    assert_eq!(out.num_prefill_tokens, 8);
    assert_eq!(s.request_status("r3"), Some(RequestStatus::Waiting));

    let res = s.update_from_output(&out, &sample_all(&out, 7));
    let client = &res[&0];
    assert!(client.finished_requests.contains("r1"));
    assert_eq!(s.request_status("r1"), Some(RequestStatus::FinishedLengthCapped));

    let out = s.schedule();
    assert_eq!(ids(&out), vec!["r2", "r3"]);
    assert_eq!(out.num_scheduled_tokens["r2"], 1);
    assert_eq!(out.num_decode_tokens, 1);
    assert_eq!(out.num_prefill_tokens, 4);
    assert!(out.finished_req_ids.contains("r1"));
    let r2 = out.scheduled.iter().find(|r| r.request_id == "r2").unwrap();
    assert_eq!(r2.phase, ScheduledPhase::Decode);
}

#[test]
fn requests_are_admitted_in_arrival_order() {
    let mut s = Scheduler::new(&config(1, 64)).unwrap();
    let names = ["a", "b", "c", "d", "e"];
    for (i, n) in names.iter().enumerate() {
        s.add_request(request(n, i as u32 * 100, 3, 1)).unwrap();
    }
    let mut order = Vec::new();
    while s.has_unfinished_requests() {
        let out = s.schedule();
        order.extend(out.request_ids().map(str::to_string));
        s.update_from_output(&out, &sample_all(&out, 1));
    }
    assert_eq!(order, names);
}

#[test]
fn waiting_head_blocks_smaller_requests() {
    let mut s = Scheduler::new(&config(8, 10)).unwrap();
    s.add_request(request("a", 0, 6, 4)).unwrap();
    s.add_request(request("b", 100, 8, 4)).unwrap();
    s.add_request(request("c", 200, 2, 4)).unwrap();
    let out = s.schedule();
    assert_eq!(ids(&out), vec!["a"]);
    assert_eq!(s.waiting_ids(), vec!["b".to_string(), "c".to_string()]);
}

#[test]
fn oversized_request_stays_waiting() {
    let mut s = Scheduler::new(&config(8, 10)).unwrap();
    s.add_request(request("big", 0, 20, 4)).unwrap();
    s.add_request(request("small", 100, 2, 4)).unwrap();
    for _ in 0..3 {
        assert!(s.schedule().is_empty());
    }
    assert_eq!(s.request_status("big"), Some(RequestStatus::Waiting));
    assert_eq!(s.request_status("small"), Some(RequestStatus::Waiting));
    assert_eq!(s.abort_requests(["big"]), 1);
    assert_eq!(ids(&s.schedule()), vec!["small"]);
}

#[test]
fn blocked_head_does_not_count_cache_hits() {
    let mut s = Scheduler::new(&config(4, 16)).unwrap();
    s.add_request(request("a", 0, 9, 1)).unwrap();
    let out = s.schedule();
    s.update_from_output(&out, &sample_all(&out, 7));
    assert_eq!(s.request_status("a"), Some(RequestStatus::FinishedLengthCapped));
    assert_eq!(s.kv().prefix_cache().len(), 2);

    // shares a's first two blocks but needs more than the token budget
    let mut prompt: Vec<u32> = (0..8).collect();
    prompt.extend(100..130);
    s.add_request(Request::new("big", 0, prompt, SamplingParams::with_max_tokens(4))).unwrap();
    for _ in 0..10 {
        assert!(s.schedule().is_empty());
    }
    let prefix = s.kv().prefix_cache().get_metrics();
    assert_eq!(prefix.hits, 0);
    assert_eq!(prefix.hot, 0);
    assert_eq!(prefix.warm, 0);
    assert_eq!(s.kv().pool().get_metrics().hits, 0);

    s.abort_requests(["big"]);
    let mut prompt: Vec<u32> = (0..8).collect();
    prompt.extend([200, 201]);
    s.add_request(Request::new("c", 0, prompt, SamplingParams::with_max_tokens(4))).unwrap();
    let out = s.schedule();
    assert_eq!(ids(&out), vec!["c"]);
    assert_eq!(out.num_scheduled_tokens["c"], 2);
    let prefix = s.kv().prefix_cache().get_metrics();
    assert_eq!(prefix.hits, 1);
    assert_eq!(prefix.warm, 1);
    assert_eq!(s.kv().pool().get_metrics().hits, 2);
}

#[rstest]
#[case(1, 8)]
#[case(4, 16)]
#[case(16, 64)]
fn budgets_are_never_exceeded(#[case] max_num_seqs: usize, #[case] max_tokens: usize) {
    let mut rng = StdRng::seed_from_u64(max_num_seqs as u64);
    let mut s = Scheduler::new(&config(max_num_seqs, max_tokens)).unwrap();
    for i in 0..40u32 {
        let len = rng.gen_range(1..=max_tokens as u32);
        s.add_request(request(&format!("r{i}"), i * 1000, len, rng.gen_range(1..6))).unwrap();
    }
    let mut steps = 0;
    while s.has_unfinished_requests() {
        let out = s.schedule();
        assert!(out.total_num_scheduled_tokens <= max_tokens);
        assert!(out.num_requests() <= max_num_seqs);
        assert!(s.num_running() <= max_num_seqs);
        assert_eq!(out.total_num_scheduled_tokens, out.num_scheduled_tokens.values().sum::<usize>());
        s.update_from_output(&out, &sample_all(&out, 3));
        steps += 1;
        assert!(steps < 10_000, "scheduler made no progress");
    }
}

#[test]
fn abort_is_idempotent() {
    let mut s = Scheduler::new(&config(4, 64)).unwrap();
    s.add_request(request("x", 0, 4, 4)).unwrap();
    assert_eq!(s.abort_requests(["x"]), 1);
    assert_eq!(s.abort_requests(["x"]), 0);
    assert_eq!(s.abort_requests(["unknown"]), 0);
    assert_eq!(s.request_status("x"), Some(RequestStatus::FinishedAborted));

    let reports = s.take_finished_reports();
    assert_eq!(reports[&0].finished_requests.len(), 1);
    assert!(reports[&0].outputs.is_empty());
    assert!(!s.has_finished_reports());
    assert!(!s.has_unfinished_requests());
}

#[test]
fn caller_can_finish_running_requests() {
    let mut s = Scheduler::new(&config(4, 64)).unwrap();
    s.add_request(request("a", 0, 4, 8)).unwrap();
    s.add_request(request("b", 100, 4, 8)).unwrap();
    let out = s.schedule();
    s.update_from_output(&out, &sample_all(&out, 3));

    assert_eq!(s.finish_requests(["a"], FinishReason::Error), 1);
    assert_eq!(s.finish_requests(["a"], FinishReason::Error), 0);
    assert_eq!(s.request_status("a"), Some(RequestStatus::FinishedError));

    let reports = s.take_finished_reports();
    assert!(reports[&0].finished_requests.contains("a"));
    let out = s.schedule();
    assert_eq!(ids(&out), vec!["b"]);
    assert!(out.finished_req_ids.contains("a"));
}

#[test]
fn output_after_abort_is_dropped() {
    let mut s = Scheduler::new(&config(4, 64)).unwrap();
    s.add_request(request("x", 0, 4, 8)).unwrap();
    let out = s.schedule();
    assert_eq!(ids(&out), vec!["x"]);

    s.abort_requests(["x"]);
    let model = ModelOutput::from_pairs([("x", vec![11, 12])]);
    let res = s.update_from_output(&out, &model);
    assert!(res.is_empty());
    assert_eq!(s.request_status("x"), Some(RequestStatus::FinishedAborted));
    assert!(s.get_request("x").is_none());
    assert_eq!(s.kv().pool().num_free_blocks() + s.kv().pool().num_evictable_blocks(), 256);
}

#[test]
fn duplicate_ids_are_rejected() {
    let mut s = Scheduler::new(&config(4, 64)).unwrap();
    s.add_request(request("x", 0, 4, 1)).unwrap();
    assert!(matches!(s.add_request(request("x", 0, 4, 1)), Err(EngineError::DuplicateRequest(_))));

    let out = s.schedule();
    s.update_from_output(&out, &sample_all(&out, 5));
    assert!(!s.has_unfinished_requests());
    assert!(matches!(s.add_request(request("x", 0, 4, 1)), Err(EngineError::DuplicateRequest(_))));
}

#[test]
fn invalid_prompts_are_rejected() {
    let mut cfg = config(4, 64);
    cfg.scheduler.max_model_len = 16;
    let mut s = Scheduler::new(&cfg).unwrap();
    let empty = Request::new("e", 0, Vec::new(), SamplingParams::default());
    assert!(matches!(s.add_request(empty), Err(EngineError::InvalidRequest(_))));
    assert!(matches!(s.add_request(request("long", 0, 16, 1)), Err(EngineError::InvalidRequest(_))));
    assert!(!s.has_unfinished_requests());
}

#[test]
fn eos_stops_and_drops_later_tokens() {
    let mut s = Scheduler::new(&config(4, 64)).unwrap();
    let sampling = SamplingParams { max_tokens: 10, eos_token_id: Some(2), ..SamplingParams::default() };
    s.add_request(Request::new("x", 0, vec![9, 9, 9], sampling)).unwrap();
    let out = s.schedule();
    let res = s.update_from_output(&out, &ModelOutput::from_pairs([("x", vec![5, 2, 7])]));
    let o = &res[&0].outputs[0];
    assert_eq!(o.new_token_ids, vec![5, 2]);
    assert_eq!(o.finish_reason, Some(FinishReason::Stop));
    assert!(o.finished());
    assert_eq!(s.request_status("x"), Some(RequestStatus::FinishedStopped));
}

#[test]
fn ignore_eos_runs_to_length() {
    let mut s = Scheduler::new(&config(4, 64)).unwrap();
    let sampling = SamplingParams { max_tokens: 2, eos_token_id: Some(2), ignore_eos: true, ..SamplingParams::default() };
    s.add_request(Request::new("x", 0, vec![9, 9], sampling)).unwrap();
    let out = s.schedule();
    s.update_from_output(&out, &ModelOutput::from_pairs([("x", vec![2])]));
    let out = s.schedule();
    let res = s.update_from_output(&out, &ModelOutput::from_pairs([("x", vec![2])]));
    assert_eq!(res[&0].outputs[0].finish_reason, Some(FinishReason::Length));
}

#[test]
fn stop_token_finishes_request() {
    let mut s = Scheduler::new(&config(4, 64)).unwrap();
    let sampling = SamplingParams { max_tokens: 10, stop_token_ids: vec![42], ..SamplingParams::default() };
    s.add_request(Request::new("x", 0, vec![1, 2], sampling)).unwrap();
    let out = s.schedule();
    let res = s.update_from_output(&out, &ModelOutput::from_pairs([("x", vec![42])]));
    assert_eq!(res[&0].outputs[0].finish_reason, Some(FinishReason::Stop));
}

#[test]
fn block_shortage_preempts_latest_running_request() {
    let mut cfg = config(4, 64);
    cfg.cache.num_blocks = 3;
    let mut s = Scheduler::new(&cfg).unwrap();
    s.add_request(request("r1", 0, 8, 16)).unwrap();
    s.add_request(request("r2", 100, 4, 16)).unwrap();

    let out = s.schedule();
    assert_eq!(ids(&out), vec!["r1", "r2"]);
    s.update_from_output(&out, &sample_all(&out, 1));

    let out = s.schedule();
    assert_eq!(out.preempted_req_ids, vec!["r2".to_string()]);
    assert_eq!(ids(&out), vec!["r1"]);
    assert_eq!(s.request_status("r2"), Some(RequestStatus::Preempted));
    assert_eq!(s.waiting_ids(), vec!["r2".to_string()]);

    let r2 = s.get_request("r2").unwrap();
    assert_eq!(r2.num_computed_tokens(), 0);
    assert_eq!(r2.num_preemptions(), 1);
    assert!(r2.events().iter().any(|e| e.kind == RequestEventKind::Preempted));
}

#[test]
fn preempted_request_resumes_with_its_outputs() {
    let mut cfg = config(4, 64);
    cfg.cache.num_blocks = 3;
    let mut s = Scheduler::new(&cfg).unwrap();
    s.add_request(request("r1", 0, 8, 2)).unwrap();
    s.add_request(request("r2", 100, 4, 4)).unwrap();
    let out = s.schedule();
    s.update_from_output(&out, &sample_all(&out, 1));

    let out = s.schedule();
    assert_eq!(out.preempted_req_ids, vec!["r2".to_string()]);
    s.update_from_output(&out, &sample_all(&out, 2));
    assert_eq!(s.request_status("r1"), Some(RequestStatus::FinishedLengthCapped));

    let out = s.schedule();
    assert_eq!(ids(&out), vec!["r2"]);
    let resumed = &out.scheduled[0];
    assert!(resumed.resumed_from_preemption);
    assert_eq!(resumed.num_computed_tokens, 0);
    assert_eq!(resumed.token_ids, vec![100, 101, 102, 103, 1]);

    s.update_from_output(&out, &sample_all(&out, 3));
    let r2 = s.get_request("r2").unwrap();
    assert_eq!(r2.status(), RequestStatus::Running);
    assert_eq!(r2.output_token_ids(), &[1, 3]);
    assert!(r2.events().iter().any(|e| e.kind == RequestEventKind::Resumed));
}

#[test]
fn held_requests_are_skipped_until_released() {
    let mut s = Scheduler::new(&config(4, 64)).unwrap();
    s.add_request(request("a", 0, 4, 2)).unwrap();
    s.add_request(request("b", 100, 4, 2)).unwrap();
    assert!(s.set_grammar_pending("a", true));
    assert_eq!(s.request_status("a"), Some(RequestStatus::WaitingForFsm));

    let out = s.schedule();
    assert_eq!(ids(&out), vec!["b"]);

    assert!(s.set_grammar_pending("a", false));
    let out = s.schedule();
    assert!(out.contains("a"));
    assert!(!s.set_remote_kvs_pending("a", true));
}

#[test]
fn in_flight_requests_are_not_rescheduled() {
    let mut s = Scheduler::new(&config(4, 64)).unwrap();
    s.add_request(request("a", 0, 4, 4)).unwrap();
    let first = s.schedule();
    s.mark_in_flight(&first);
    assert!(s.is_in_flight("a"));
    assert!(s.schedule().is_empty());

    s.release_in_flight(&first);
    s.update_from_output(&first, &sample_all(&first, 3));
    let out = s.schedule();
    assert_eq!(ids(&out), vec!["a"]);
}

#[test]
fn stale_output_is_ignored() {
    let mut s = Scheduler::new(&config(4, 64)).unwrap();
    s.add_request(request("a", 0, 4, 4)).unwrap();
    let out = s.schedule();
    s.update_from_output(&out, &sample_all(&out, 3));
    let res = s.update_from_output(&out, &sample_all(&out, 3));
    assert!(res.is_empty());
    assert_eq!(s.get_request("a").unwrap().num_output_tokens(), 1);
}

#[test]
fn outputs_carry_lifecycle_events() {
    let mut s = Scheduler::new(&config(4, 64)).unwrap();
    s.add_request(request("a", 0, 4, 1)).unwrap();
    let out = s.schedule();
    let res = s.update_from_output(&out, &sample_all(&out, 3));
    let kinds: Vec<RequestEventKind> = res[&0].outputs[0].events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            RequestEventKind::Created,
            RequestEventKind::Queued,
            RequestEventKind::Scheduled,
            RequestEventKind::FirstToken,
            RequestEventKind::Finished,
        ]
    );
}

#[test]
fn shared_prompt_prefix_is_reused() {
    let mut s = Scheduler::new(&config(4, 64)).unwrap();
    let prompt: Vec<u32> = (0..9).collect();
    s.add_request(Request::new("a", 0, prompt.clone(), SamplingParams::with_max_tokens(1))).unwrap();
    let out = s.schedule();
    s.update_from_output(&out, &sample_all(&out, 3));

    s.add_request(Request::new("b", 0, prompt, SamplingParams::with_max_tokens(1))).unwrap();
    let out = s.schedule();
    assert_eq!(out.num_scheduled_tokens["b"], 1);
    assert_eq!(out.scheduled[0].num_computed_tokens, 8);
    assert_eq!(s.get_request("b").unwrap().num_cached_tokens(), 8);
}
