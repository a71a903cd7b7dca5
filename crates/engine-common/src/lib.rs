//! Shared error type and configuration for the engine crates.

pub mod config;

pub type Result<T> = core::result::Result<T, EngineError>;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// A request with this ID is live or was finished recently.
    #[error("duplicate request id: {0}")]
    DuplicateRequest(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The block pool could not satisfy an allocation even after evicting
    /// every evictable cached block.
    #[error("out of KV cache blocks: requested {requested}, available {available}")]
    OutOfBlocks { requested: usize, available: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Raised by an executor implementation.
    #[error("executor error: {0}")]
    Executor(String),

    /// An executor failure re-raised by the engine loop with batch context.
    #[error("step failed ({num_requests} requests, {num_tokens} tokens): {source}")]
    StepFailed {
        num_requests: usize,
        num_tokens: usize,
        /// Requests of the failed batch, left unapplied.
        request_ids: Vec<String>,
        #[source]
        source: Box<EngineError>,
    },

    #[error("no workers available")]
    NoWorkers,

    #[error("engine channel closed")]
    ChannelClosed,

    #[error("{0}")]
    Message(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineError {
    /// Whether the error is a capacity failure the caller may resolve by
    /// preempting or queueing.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::OutOfBlocks { .. })
    }
}
