use super::{
    errors::TaskError,
    model::{Task, TaskId, WorkerId},
    result::{TaskOutcome, TaskResult, Timing},
};
use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use crossbeam::deque::{Injector, Steal};
use futures::{future::BoxFuture, FutureExt};
use tokio::sync::{mpsc::UnboundedSender, Notify, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::debug;


/// Пользовательский обработчик задач
pub type Processor<P, R> =
    Arc<dyn Fn(Task<P>) -> BoxFuture<'static, Result<R, TaskError>> + Send + Sync>;

pub(crate) fn boxed_processor<P, R, F, Fut>(f: F) -> Processor<P, R>
where
    F: Fn(Task<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, TaskError>> + Send + 'static,
{
    Arc::new(move |task: Task<P>| f(task).boxed())
}


/// Задача в очереди. Permit освобождает место в ограниченной очереди,
/// как только воркер забрал задачу.
pub(crate) struct Queued<P> {
    pub task: Task<P>,
    pub enqueued_at: Instant,
    pub permit: Option<OwnedSemaphorePermit>,
}


/// Состояние, разделяемое всеми воркерами
pub(crate) struct Shared<P, R> {
    queue: Injector<Queued<P>>,
    notify: Notify,
    idle: Notify,
    /// Приём задач закрыт: дорабатываем очередь и выходим
    pub closed: CancellationToken,
    /// Немедленная остановка: доделываем текущую задачу и выходим
    pub halt: CancellationToken,
    processor: Processor<P, R>,
    task_timeout: Option<Duration>,
    pub busy: AtomicUsize,
    pub pending: AtomicUsize,
    pub submitted: AtomicUsize,
    pub completed: AtomicUsize,
    pub failed: AtomicUsize,
    pub dropped: AtomicUsize,
}

impl<P, R> Shared<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub fn new(processor: Processor<P, R>, task_timeout: Option<Duration>) -> Self {
        Self {
            queue: Injector::new(),
            notify: Notify::new(),
            idle: Notify::new(),
            closed: CancellationToken::new(),
            halt: CancellationToken::new(),
            processor,
            task_timeout,
            busy: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            submitted: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn push(&self, queued: Queued<P>) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.queue.push(queued);
        self.notify.notify_one();
    }

    /// Injector может вернуть Retry при гонке с другим воркером.
    /// Пустой результат здесь означает, что очередь действительно пуста.
    pub fn pop(&self) -> Option<Queued<P>> {
        loop {
            match self.queue.steal() {
                Steal::Success(queued) => return Some(queued),
                Steal::Empty => return None,
                Steal::Retry => std::hint::spin_loop(),
            }
        }
    }

    #[inline]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Задача получила результат (любой, включая Dropped)
    pub fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn drop_task(&self, queued: Queued<P>) -> TaskResult<R> {
        let Queued { task, .. } = queued;
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.finish_one();
        TaskResult::dropped(task.id())
    }

    async fn execute(&self, worker: WorkerId, queued: Queued<P>) -> TaskResult<R> {
        let Queued { task, enqueued_at, permit } = queued;
        drop(permit);

        let task_id = task.id();
        let started = Instant::now();
        self.busy.fetch_add(1, Ordering::Relaxed);

        let processor = Arc::clone(&self.processor);
        // Вызов внутри async-блока, чтобы синхронная паника тоже попала в catch_unwind
        let run = AssertUnwindSafe(async move { processor(task).await }).catch_unwind();

        let outcome = match self.task_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(res) => to_outcome(task_id, res),
                Err(_) => TaskOutcome::Failed(TaskError::Timeout(limit)),
            },
            None => to_outcome(task_id, run.await),
        };

        self.busy.fetch_sub(1, Ordering::Relaxed);
        match &outcome {
            TaskOutcome::Completed(_) => self.completed.fetch_add(1, Ordering::Relaxed),
            _ => self.failed.fetch_add(1, Ordering::Relaxed),
        };

        TaskResult {
            task_id,
            worker: Some(worker),
            outcome,
            timing: Some(Timing {
                queued: started.saturating_duration_since(enqueued_at),
                execution: started.elapsed(),
            }),
        }
    }
}

fn to_outcome<R>(
    task_id: TaskId,
    res: Result<Result<R, TaskError>, Box<dyn Any + Send>>,
) -> TaskOutcome<R> {
    match res {
        Ok(Ok(value)) => TaskOutcome::Completed(value),
        Ok(Err(err)) => TaskOutcome::Failed(err),
        Err(panic_info) => {
            let message = panic_message(panic_info.as_ref());
            debug!(task = %task_id, %message, "task panicked");
            TaskOutcome::Failed(TaskError::Panic(message))
        }
    }
}

fn panic_message(panic_info: &(dyn Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in task".to_string()
    }
}


pub(crate) async fn worker_loop<P, R>(
    id: WorkerId,
    shared: Arc<Shared<P, R>>,
    retire: CancellationToken,
    results: UnboundedSender<TaskResult<R>>,
)
where
    P: Send + 'static,
    R: Send + 'static,
{
    debug!(worker = %id, "worker started");

    loop {
        if shared.halt.is_cancelled() || retire.is_cancelled() {
            break;
        }

        if let Some(queued) = shared.pop() {
            // halt мог сработать между проверкой выше и pop
            if shared.halt.is_cancelled() {
                let _ = results.send(shared.drop_task(queued));
                break;
            }
            let result = shared.execute(id, queued).await;
            // Приёмник живёт в пуле, ошибка возможна только при его drop
            let _ = results.send(result);
            shared.finish_one();
            continue;
        }

        if shared.closed.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = retire.cancelled() => {}
            _ = shared.closed.cancelled() => {}
            _ = shared.halt.cancelled() => {}
        }
    }

    // Если уходим с неизрасходованным уведомлением, передаём его дальше
    if !shared.queue.is_empty() {
        shared.notify.notify_one();
    }

    debug!(worker = %id, "worker exited");
}
