use super::model::{PoolState, WorkerId};
use std::time::Duration;


pub type Result<T> = std::result::Result<T, PoolError>;

/// Ошибки управления пулом. Возвращаются синхронно вызывающему коду.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    Config(String),

    #[error("`{operation}` is not allowed while the pool is {state}")]
    State {
        operation: &'static str,
        state: PoolState,
    },

    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("requested {requested} workers, allowed range is [{min}, {max}]")]
    Bounds {
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("{worker} terminated abnormally: {reason}")]
    WorkerLost { worker: WorkerId, reason: String },
}

impl PoolError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        PoolError::Config(msg.into())
    }

    pub(crate) fn state(operation: &'static str, state: PoolState) -> Self {
        PoolError::State { operation, state }
    }

    /// Можно ли повторить операцию без изменения порядка вызовов
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::QueueFull { .. })
    }
}


/// Ошибка обработки одной задачи. Никогда не выходит за границы пула,
/// а попадает в `TaskResult`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panic(String),

    #[error("task exceeded timeout of {0:?}")]
    Timeout(Duration),
}

impl TaskError {
    pub fn failed<S: ToString>(msg: S) -> Self {
        TaskError::Failed(msg.to_string())
    }
}
