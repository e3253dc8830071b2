use super::{
    errors::TaskError,
    model::{TaskId, WorkerId},
};
use std::{sync::Arc, time::Duration};
use futures::stream::{self, Stream};
use tokio::sync::{mpsc::UnboundedReceiver, Mutex};


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome<R> {
    Completed(R),
    Failed(TaskError),
    /// Задача осталась в очереди при немедленной остановке пула
    Dropped,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub queued: Duration,
    pub execution: Duration,
}


/// Итог обработки одной задачи
#[derive(Debug, Clone)]
pub struct TaskResult<R> {
    pub task_id: TaskId,
    pub worker: Option<WorkerId>,
    pub outcome: TaskOutcome<R>,
    pub timing: Option<Timing>,
}

impl<R> TaskResult<R> {
    pub(crate) fn dropped(task_id: TaskId) -> Self {
        Self {
            task_id,
            worker: None,
            outcome: TaskOutcome::Dropped,
            timing: None,
        }
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Completed(_))
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Failed(_))
    }

    #[inline]
    pub fn is_dropped(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Dropped)
    }

    pub fn value(&self) -> Option<&R> {
        match &self.outcome {
            TaskOutcome::Completed(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match &self.outcome {
            TaskOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}


/// Ленивая последовательность результатов в порядке завершения.
///
/// Все хендлы, полученные из `results()`, читают одну и ту же очередь:
/// каждый результат достаётся ровно одному потребителю. Последовательность
/// конечна только после полной остановки пула.
pub struct Results<R> {
    receiver: Arc<Mutex<UnboundedReceiver<TaskResult<R>>>>,
}

impl<R> Clone for Results<R> {
    fn clone(&self) -> Self {
        Self {
            receiver: Arc::clone(&self.receiver),
        }
    }
}

impl<R: Send + 'static> Results<R> {
    pub(crate) fn new(receiver: Arc<Mutex<UnboundedReceiver<TaskResult<R>>>>) -> Self {
        Self { receiver }
    }

    /// Следующий результат. `None` означает, что пул остановлен и всё выдано.
    pub async fn recv(&self) -> Option<TaskResult<R>> {
        self.receiver.lock().await.recv().await
    }

    /// Неблокирующий вариант: `None`, если результата нет прямо сейчас
    /// или очередь читает другой потребитель.
    pub fn try_recv(&self) -> Option<TaskResult<R>> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }

    /// Читает до конца. Завершится только после `shutdown`.
    pub async fn collect_all(self) -> Vec<TaskResult<R>> {
        let mut out = Vec::new();
        while let Some(result) = self.recv().await {
            out.push(result);
        }
        out
    }

    pub fn into_stream(self) -> impl Stream<Item = TaskResult<R>> + Send {
        stream::unfold(self, |results| async move {
            let next = results.recv().await?;
            Some((next, results))
        })
    }
}
