//! In-process engine queue.
//!
//! A tokio task owns the stepping loop. Callers talk to it through an input
//! channel of `EngineCoreRequest`s and read `EngineCoreOutputMessage`s from
//! the output channel. Steps run on the blocking pool; while one runs the
//! task keeps draining the input so aborts reach the engine mid-step. A
//! failed step finishes its batch's requests with `FinishReason::Error`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use engine_common::{EngineError, Result};
use engine_executor::{Executor, RequestId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;

use crate::engine::{EngineCore, EngineStats};
use crate::outputs::EngineCoreOutputs;
use crate::request::{FinishReason, Request};

#[derive(Debug)]
pub enum EngineCoreRequest {
    AddRequest(Request),
    AbortRequests(Vec<RequestId>),
    GetStats(oneshot::Sender<EngineStats>),
    Shutdown,
}

#[derive(Debug)]
pub enum EngineCoreOutputMessage {
    Outputs { client_index: usize, outputs: EngineCoreOutputs },
    AddFailed { request_id: RequestId, error: String },
    StepFailed { error: String },
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCoreRequest>,
    /// Waiting requests after the last step.
    pub queue_depth: Arc<AtomicUsize>,
    pub last_batch_size: Arc<AtomicUsize>,
}

impl EngineHandle {
    pub async fn add_request(&self, req: Request) -> Result<()> {
        self.send(EngineCoreRequest::AddRequest(req)).await
    }

    pub async fn abort_requests(&self, ids: Vec<RequestId>) -> Result<()> {
        self.send(EngineCoreRequest::AbortRequests(ids)).await
    }

    pub async fn get_stats(&self) -> Result<EngineStats> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCoreRequest::GetStats(tx)).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(EngineCoreRequest::Shutdown).await
    }

    async fn send(&self, msg: EngineCoreRequest) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| EngineError::ChannelClosed)
    }
}

#[derive(Debug, Clone)]
pub struct EngineProcOptions {
    /// Sleep when a step could not schedule anything and no input arrives.
    pub idle_tick: Duration,
    pub pipelined: bool,
    pub channel_capacity: usize,
}

impl Default for EngineProcOptions {
    fn default() -> Self {
        Self { idle_tick: Duration::from_millis(2), pipelined: false, channel_capacity: 1024 }
    }
}

pub struct EngineCoreProc;

impl EngineCoreProc {
    /// Spawn the engine loop. Must be called inside a tokio runtime.
    pub fn start<E>(
        core: Arc<EngineCore<E>>,
        opts: EngineProcOptions,
    ) -> (EngineHandle, mpsc::Receiver<EngineCoreOutputMessage>, JoinHandle<()>)
    where
        E: Executor + 'static,
    {
        let (tx, rx) = mpsc::channel::<EngineCoreRequest>(opts.channel_capacity);
        let (out_tx, out_rx) = mpsc::channel::<EngineCoreOutputMessage>(opts.channel_capacity);
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let last_batch_size = Arc::new(AtomicUsize::new(0));
        let worker = Worker {
            core,
            rx,
            out: out_tx,
            opts,
            queue_depth: queue_depth.clone(),
            last_batch_size: last_batch_size.clone(),
        };
        let task = tokio::spawn(worker.run());
        (EngineHandle { tx, queue_depth, last_batch_size }, out_rx, task)
    }
}

struct Worker<E: Executor> {
    core: Arc<EngineCore<E>>,
    rx: mpsc::Receiver<EngineCoreRequest>,
    out: mpsc::Sender<EngineCoreOutputMessage>,
    opts: EngineProcOptions,
    queue_depth: Arc<AtomicUsize>,
    last_batch_size: Arc<AtomicUsize>,
}

impl<E: Executor + 'static> Worker<E> {
    async fn run(mut self) {
        tracing::info!(target: "engine_proc", pipelined = self.opts.pipelined, "engine loop started");
        let mut running = true;
        while running {
            while let Ok(msg) = self.rx.try_recv() {
                if !self.handle(msg).await {
                    running = false;
                    break;
                }
            }
            if !running {
                break;
            }
            if !self.core.has_pending_work() {
                self.flush(self.core.take_finished_outputs()).await;
                match self.rx.recv().await {
                    Some(msg) => running = self.handle(msg).await,
                    None => break,
                }
                continue;
            }

            let core = self.core.clone();
            let pipelined = self.opts.pipelined;
            let mut step = tokio::task::spawn_blocking(move || {
                if pipelined {
                    core.step_with_batch_queue()
                } else {
                    core.step()
                }
            });
            let joined = loop {
                tokio::select! {
                    res = &mut step => break res,
                    Some(msg) = self.rx.recv(), if running => {
                        running &= self.handle(msg).await;
                    }
                }
            };

            match joined {
                Ok(Ok(result)) => {
                    let batch: usize = result.outputs.values().map(|o| o.outputs.len()).sum();
                    self.last_batch_size.store(batch, Ordering::Relaxed);
                    let executed = result.executed;
                    self.flush(result.outputs).await;
                    if !executed && running {
                        // blocked on budget or capacity: wait for input or a tick
                        tokio::select! {
                            Some(msg) = self.rx.recv() => running &= self.handle(msg).await,
                            _ = time::sleep(self.opts.idle_tick) => {}
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!(target: "engine_proc", error = %e, "step failed");
                    // no retry: the batch's requests end with an error
                    if let EngineError::StepFailed { request_ids, .. } = &e {
                        let failed = self.core.finish_requests(request_ids, FinishReason::Error);
                        tracing::warn!(target: "engine_proc", failed, "requests of failed batch finished");
                    }
                    let _ = self.out.send(EngineCoreOutputMessage::StepFailed { error: e.to_string() }).await;
                    self.flush(self.core.take_finished_outputs()).await;
                }
                Err(e) => {
                    tracing::error!(target: "engine_proc", error = %e, "step task panicked");
                    break;
                }
            }
            self.queue_depth.store(self.core.get_stats().waiting_requests, Ordering::Relaxed);
        }
        self.core.shutdown();
        tracing::info!(target: "engine_proc", "engine loop stopped");
    }

    /// Returns false on shutdown.
    async fn handle(&self, msg: EngineCoreRequest) -> bool {
        match msg {
            EngineCoreRequest::AddRequest(req) => {
                let request_id = req.request_id.clone();
                if let Err(e) = self.core.add_request(req) {
                    let _ = self.out.send(EngineCoreOutputMessage::AddFailed { request_id, error: e.to_string() }).await;
                }
                true
            }
            EngineCoreRequest::AbortRequests(ids) => {
                self.core.abort_requests(&ids);
                true
            }
            EngineCoreRequest::GetStats(reply) => {
                let _ = reply.send(self.core.get_stats());
                true
            }
            EngineCoreRequest::Shutdown => false,
        }
    }

    async fn flush(&self, outputs: HashMap<usize, EngineCoreOutputs>) {
        for (client_index, outputs) in outputs {
            if outputs.is_empty() {
                continue;
            }
            if self.out.send(EngineCoreOutputMessage::Outputs { client_index, outputs }).await.is_err() {
                tracing::debug!(target: "engine_proc", client_index, "output receiver dropped");
            }
        }
    }
}
