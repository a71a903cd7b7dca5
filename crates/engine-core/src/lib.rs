//! Engine core: request lifecycle, scheduling, KV block pool with pluggable
//! eviction, prefix caching and the step loop that drives an executor.

pub mod arc;
pub mod block_pool;
pub mod engine;
pub mod engine_proc;
pub mod eviction;
pub mod hashing;
pub mod kv;
pub mod load_balancer;
pub mod lru;
pub mod outputs;
pub mod prefix_cache;
pub mod prefix_index;
pub mod queue;
pub mod request;
pub mod scheduler;

pub use block_pool::{BlockPool, BlockPoolMetrics, BlockState, EvictionEvent, EvictionReason};
pub use engine::{EngineCore, EngineStats};
pub use engine_proc::{EngineCoreOutputMessage, EngineCoreProc, EngineCoreRequest, EngineHandle, EngineProcOptions};
pub use engine_executor::{BlockId, RequestId, TokenId};
pub use hashing::{BlockHash, BlockHasher};
pub use kv::{ComputedBlocks, KvCacheManager};
pub use load_balancer::{P2cLoadBalancer, WorkerHealth, WorkerState};
pub use outputs::{EngineCoreOutput, EngineCoreOutputs, StepResult};
pub use prefix_cache::{CacheTier, PrefixCache, PrefixCacheMetrics, PrefixMatch};
pub use request::{FinishReason, Request, RequestEvent, RequestEventKind, RequestStatus, SamplingParams};
pub use scheduler::Scheduler;
