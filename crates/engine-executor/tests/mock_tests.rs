use engine_executor::mock::MockExecutor;
use engine_executor::{ExecutionHandle, Executor, ModelOutput, ScheduledPhase, ScheduledRequest, SchedulerOutput};

fn scheduled(id: &str, computed: usize, run: usize, prompt: usize, total: usize) -> ScheduledRequest {
    ScheduledRequest {
        request_id: id.to_string(),
        token_ids: (0..run as u32).collect(),
        num_computed_tokens: computed,
        num_prompt_tokens: prompt,
        num_tokens: total,
        block_ids: vec![0],
        phase: if computed < prompt { ScheduledPhase::Prefill } else { ScheduledPhase::Decode },
        resumed_from_preemption: false,
    }
}

fn batch(reqs: Vec<ScheduledRequest>) -> SchedulerOutput {
    let mut out = SchedulerOutput { step_id: 1, ..Default::default() };
    for r in reqs {
        out.num_scheduled_tokens.insert(r.request_id.clone(), r.num_scheduled_tokens());
        out.total_num_scheduled_tokens += r.num_scheduled_tokens();
        out.scheduled.push(r);
    }
    out
}

#[test]
fn output_follows_batch_order() {
    let exec = MockExecutor::new(7);
    let b = batch(vec![scheduled("b", 0, 4, 4, 4), scheduled("a", 0, 4, 4, 4)]);
    let out = exec.execute_model(&b).unwrap();
    assert_eq!(out.req_ids, vec!["b".to_string(), "a".to_string()]);
    assert_eq!(out.req_id_to_index["a"], 1);
    assert_eq!(out.sampled("a").unwrap().len(), 1);
}

#[test]
fn sampling_is_deterministic() {
    let b = batch(vec![scheduled("x", 0, 5, 5, 5)]);
    let first = MockExecutor::new(3).execute_model(&b).unwrap();
    let second = MockExecutor::new(3).execute_model(&b).unwrap();
    assert_eq!(first.sampled("x"), second.sampled("x"));
}

#[test]
fn partial_prefill_samples_nothing() {
    let exec = MockExecutor::new(0).with_tokens_per_step(2);
    let out = exec.execute_model(&batch(vec![scheduled("p", 0, 3, 8, 8)])).unwrap();
    assert_eq!(out.sampled("p"), Some(&[][..]));
    let out = exec.execute_model(&batch(vec![scheduled("p", 3, 5, 8, 8)])).unwrap();
    assert_eq!(out.sampled("p").unwrap().len(), 2);
}

#[test]
fn eos_after_n_outputs() {
    let exec = MockExecutor::new(0).with_eos(2, 2);
    let out = exec.execute_model(&batch(vec![scheduled("r", 0, 4, 4, 4)])).unwrap();
    assert_ne!(out.sampled("r").unwrap()[0], 2);
    let out = exec.execute_model(&batch(vec![scheduled("r", 4, 1, 4, 5)])).unwrap();
    assert_eq!(out.sampled("r").unwrap(), &[2]);
}

#[test]
fn injected_failures_then_recovery() {
    let exec = MockExecutor::new(0);
    exec.fail_next(1);
    let b = batch(vec![scheduled("f", 0, 2, 2, 2)]);
    assert!(exec.execute_model(&b).is_err());
    assert!(exec.execute_model(&b).is_ok());
    assert_eq!(exec.calls(), 2);
}

#[test]
fn shutdown_is_idempotent() {
    let exec = MockExecutor::new(0);
    exec.shutdown();
    exec.shutdown();
    assert!(exec.is_shut_down());
    assert!(exec.execute_model(&batch(vec![])).is_err());
}

#[test]
fn deferred_handle_runs_on_wait() {
    let handle = ExecutionHandle::Deferred(Box::new(|| Ok(ModelOutput::from_pairs([("z", vec![9])]))));
    let out = handle.wait().unwrap();
    assert_eq!(out.sampled("z"), Some(&[9][..]));
    assert!(out.sampled("missing").is_none());
}
