use thiserror::Error;

/// Crate-wide error taxonomy, surfaced from startup and the pool initializer.
///
/// Steady-state operations (periodic tasks, consumer teardown) never
/// propagate these; they log and continue per the best-effort discipline
/// described on [`crate::broker`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("broker connection or channel unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("queue {queue} already exists with incompatible parameters")]
    QueueConflict { queue: String },

    #[error("exclusive lock on {queue} is held by another peer")]
    LockContended { queue: String },

    #[error("broadcast handler failed: {0}")]
    HandlerFailure(String),

    #[error("forced stop abandoned {count} in-flight delivery(ies) on {queue}")]
    ShutdownAborted { queue: String, count: usize },

    #[error("bundled peer-identity word list is empty")]
    WordListMissing,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
