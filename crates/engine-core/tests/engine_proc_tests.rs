use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use engine_common::config::EngineConfig;
use engine_common::EngineError;
use engine_core::engine::EngineCore;
use engine_core::engine_proc::{EngineCoreOutputMessage, EngineCoreProc, EngineProcOptions};
use engine_core::request::{Request, RequestStatus, SamplingParams};
use engine_executor::mock::MockExecutor;
use tokio::sync::mpsc::Receiver;
use tokio::time::timeout;

fn config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.scheduler.max_num_seqs = 4;
    cfg.scheduler.max_num_batched_tokens = 64;
    cfg.cache.block_size = 4;
    cfg.cache.num_blocks = 64;
    cfg
}

fn request(id: &str, base: u32, max_tokens: usize) -> Request {
    Request::new(id, 0, (base..base + 5).collect(), SamplingParams::with_max_tokens(max_tokens))
}

async fn next(rx: &mut Receiver<EngineCoreOutputMessage>) -> EngineCoreOutputMessage {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("engine produced no output in time")
        .expect("output channel closed")
}

async fn run_to_completion(pipelined: bool) {
    let core = Arc::new(EngineCore::new(&config(), MockExecutor::new(7)).unwrap());
    let opts = EngineProcOptions { pipelined, ..EngineProcOptions::default() };
    let (handle, mut rx, task) = EngineCoreProc::start(core, opts);

    for i in 0..3u32 {
        handle.add_request(request(&format!("r{i}"), i * 100, 4)).await.unwrap();
    }
    let mut tokens: HashMap<String, usize> = HashMap::new();
    let mut finished = HashSet::new();
    while finished.len() < 3 {
        match next(&mut rx).await {
            EngineCoreOutputMessage::Outputs { client_index, outputs } => {
                assert_eq!(client_index, 0);
                for o in &outputs.outputs {
                    *tokens.entry(o.request_id.clone()).or_default() += o.new_token_ids.len();
                }
                finished.extend(outputs.finished_requests);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    for i in 0..3 {
        assert_eq!(tokens[&format!("r{i}")], 4);
    }

    let stats = handle.get_stats().await.unwrap();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.running_requests, 0);
    assert_eq!(stats.waiting_requests, 0);

    handle.shutdown().await.unwrap();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(matches!(handle.get_stats().await, Err(EngineError::ChannelClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_stream_to_completion() {
    run_to_completion(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipelined_requests_stream_to_completion() {
    run_to_completion(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_add_is_reported() {
    let core = Arc::new(EngineCore::new(&config(), MockExecutor::new(1)).unwrap());
    let (handle, mut rx, _task) = EngineCoreProc::start(core, EngineProcOptions::default());
    handle.add_request(request("a", 0, 2)).await.unwrap();
    handle.add_request(request("a", 0, 2)).await.unwrap();
    loop {
        if let EngineCoreOutputMessage::AddFailed { request_id, error } = next(&mut rx).await {
            assert_eq!(request_id, "a");
            assert!(error.contains("duplicate"));
            break;
        }
    }
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_reaches_running_request() {
    let exec = MockExecutor::new(1).with_latency(Duration::from_millis(2));
    let core = Arc::new(EngineCore::new(&config(), exec).unwrap());
    let (handle, mut rx, task) = EngineCoreProc::start(core.clone(), EngineProcOptions::default());
    handle.add_request(request("long", 0, 10_000)).await.unwrap();

    // wait until it produced something
    loop {
        if let EngineCoreOutputMessage::Outputs { outputs, .. } = next(&mut rx).await {
            if !outputs.outputs.is_empty() {
                break;
            }
        }
    }
    handle.abort_requests(vec!["long".to_string()]).await.unwrap();
    loop {
        if let EngineCoreOutputMessage::Outputs { outputs, .. } = next(&mut rx).await {
            if outputs.finished_requests.contains("long") {
                break;
            }
        }
    }
    assert!(!core.has_unfinished_requests());
    handle.shutdown().await.unwrap();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(core.executor().is_shut_down());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_step_finishes_its_batch_with_error() {
    let core = Arc::new(EngineCore::new(&config(), MockExecutor::new(1)).unwrap());
    core.executor().fail_next(1);
    let (handle, mut rx, task) = EngineCoreProc::start(core.clone(), EngineProcOptions::default());
    handle.add_request(request("bad", 0, 4)).await.unwrap();

    match next(&mut rx).await {
        EngineCoreOutputMessage::StepFailed { error } => assert!(error.contains("injected failure"), "{error}"),
        other => panic!("expected StepFailed, got {other:?}"),
    }
    match next(&mut rx).await {
        EngineCoreOutputMessage::Outputs { outputs, .. } => {
            assert!(outputs.finished_requests.contains("bad"));
            assert!(outputs.outputs.is_empty());
        }
        other => panic!("unexpected message {other:?}"),
    }
    assert_eq!(core.request_status("bad"), Some(RequestStatus::FinishedError));
    assert_eq!(core.executor().calls(), 1);

    // the engine keeps serving new requests
    handle.add_request(request("good", 100, 2)).await.unwrap();
    loop {
        if let EngineCoreOutputMessage::Outputs { outputs, .. } = next(&mut rx).await {
            if outputs.finished_requests.contains("good") {
                break;
            }
        }
    }
    assert_eq!(core.request_status("good"), Some(RequestStatus::FinishedLengthCapped));
    handle.shutdown().await.unwrap();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}
