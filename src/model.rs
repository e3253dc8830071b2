use std::fmt;


#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        TaskId(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}


/// Единица работы. После отправки в пул не изменяется и обрабатывается
/// ровно одним воркером.
#[derive(Debug, Clone)]
pub struct Task<P> {
    id: TaskId,
    payload: P,
}

impl<P> Task<P> {
    pub fn new(id: u64, payload: P) -> Self {
        Self::with_id(TaskId(id), payload)
    }

    pub fn with_id(id: TaskId, payload: P) -> Self {
        Self { id, payload }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub(crate) usize);

impl WorkerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}


/// Жизненный цикл пула: Created -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Created => "created",
            PoolState::Running => "running",
            PoolState::Draining => "draining",
            PoolState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Дорабатываем очередь и текущие задачи
    Graceful,
    /// Дорабатываем только текущие задачи, очередь уходит в Dropped
    Immediate,
}


#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub workers_joined: usize,
    pub dropped: usize,
    /// Graceful не уложился в дедлайн и был переведён в Immediate
    pub escalated: bool,
}


#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub state: PoolState,
    pub workers: usize,
    pub retiring: usize,
    pub busy_workers: usize,
    pub queued: usize,
    pub pending: usize,
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub dropped: usize,
}

impl PoolMetrics {
    pub fn utilization(&self) -> f64 {
        if self.workers == 0 {
            return 0.0;
        }
        (self.busy_workers as f64 / self.workers as f64).min(1.0)
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            return 1.0;
        }
        self.completed as f64 / total as f64
    }
}
