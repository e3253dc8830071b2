//! Async пул задач с динамическим числом воркеров
//!
//! # Features
//! - Ограниченная очередь с backpressure (`submit` ждёт, `try_submit` отказывает)
//! - Resize в пределах `[min_workers, max_workers]` и автомасштабирование по глубине очереди
//! - Graceful / Immediate shutdown: каждая задача даёт ровно один результат или Dropped
//! - Паники и таймауты задач остаются внутри `TaskResult`
//! - Метрики и мониторинг
//! - Конфигурация для CPU-bound и I/O-bound workloads

pub mod errors;
mod handle;
pub mod model;
pub mod pool;
pub mod result;
pub mod scaling;
mod worker;

pub use errors::{PoolError, TaskError};
pub use model::{PoolMetrics, PoolState, ShutdownMode, ShutdownReport, Task, TaskId, WorkerId};
pub use pool::{Config, TaskPool, TaskPoolInner};
pub use result::{Results, TaskOutcome, TaskResult, Timing};
pub use scaling::ScalePolicy;
pub use worker::Processor;
