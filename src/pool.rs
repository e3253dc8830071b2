use super::{
    errors::{PoolError, Result, TaskError},
    handle::WorkerHandle,
    model::{PoolMetrics, PoolState, ShutdownMode, ShutdownReport, Task, WorkerId},
    result::{Results, TaskResult},
    scaling::ScalePolicy,
    worker::{boxed_processor, worker_loop, Queued, Shared},
};
use std::{
    collections::BTreeMap,
    future::Future,
    sync::{
        atomic::Ordering,
        Arc, Weak,
    },
    time::Instant,
};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex, Semaphore, TryAcquireError},
    time::{Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};


/// Конфигурация пула задач
#[derive(Debug, Clone)]
pub struct Config {
    pub min_workers: usize,
    pub max_workers: usize,
    /// 0 означает очередь без ограничения
    pub queue_capacity: usize,
    pub task_timeout: Option<Duration>,
    pub autoscale: Option<ScalePolicy>,
}

impl Default for Config {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            min_workers: num_cpus,
            max_workers: num_cpus * 2,
            queue_capacity: num_cpus * 20,
            task_timeout: Some(Duration::from_secs(30)),
            autoscale: None,
        }
    }
}

impl Config {
    pub fn cpu_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            min_workers: num_cpus,
            max_workers: num_cpus,
            queue_capacity: num_cpus * 10,
            task_timeout: Some(Duration::from_secs(60)),
            autoscale: None,
        }
    }

    pub fn io_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            min_workers: num_cpus,
            max_workers: num_cpus * 4,
            queue_capacity: 0,
            task_timeout: Some(Duration::from_secs(30)),
            autoscale: Some(ScalePolicy::default()),
        }
    }

    /// Default, переопределённый переменными окружения TASKPOOL_*
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_usize("TASKPOOL_MIN_WORKERS")? {
            config.min_workers = v;
        }
        if let Some(v) = env_usize("TASKPOOL_MAX_WORKERS")? {
            config.max_workers = v;
        }
        if let Some(v) = env_usize("TASKPOOL_QUEUE_CAPACITY")? {
            config.queue_capacity = v;
        }
        if let Some(ms) = env_usize("TASKPOOL_TASK_TIMEOUT_MS")? {
            config.task_timeout = (ms > 0).then(|| Duration::from_millis(ms as u64));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_workers < 1 {
            return Err(PoolError::config("min_workers must be at least 1"));
        }
        if self.max_workers < self.min_workers {
            return Err(PoolError::config(format!(
                "max_workers ({}) must not be less than min_workers ({})",
                self.max_workers, self.min_workers
            )));
        }
        if self.queue_capacity > Semaphore::MAX_PERMITS {
            return Err(PoolError::config(format!(
                "queue_capacity must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if matches!(self.task_timeout, Some(t) if t.is_zero()) {
            return Err(PoolError::config("task_timeout must be greater than zero"));
        }
        if let Some(policy) = &self.autoscale {
            policy.validate()?;
        }
        Ok(())
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| PoolError::config(format!("{key}={raw}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(PoolError::config(format!("{key}: {e}"))),
    }
}


/// Всё, что меняется только под одной блокировкой
struct Registry<R> {
    state: PoolState,
    workers: BTreeMap<WorkerId, WorkerHandle>,
    retiring: Vec<WorkerHandle>,
    next_worker: usize,
    results_tx: Option<mpsc::UnboundedSender<TaskResult<R>>>,
    autoscaler: Option<CancellationToken>,
    /// Итог остановки, пишется один раз перед `stopped`
    report: Option<ShutdownReport>,
}

enum ShutdownStep {
    Done,
    Wait { deadline: Option<tokio::time::Instant> },
}


pub type TaskPool<P, R> = Arc<TaskPoolInner<P, R>>;

/// Пул задач с динамическим числом воркеров
pub struct TaskPoolInner<P, R> {
    shared: Arc<Shared<P, R>>,
    registry: Mutex<Registry<R>>,
    capacity: Option<Arc<Semaphore>>,
    results_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<TaskResult<R>>>>,
    stopped: CancellationToken,
    config: Config,
}

impl<P, R> TaskPoolInner<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// `queue_capacity == 0` означает очередь без ограничения
    pub fn create<F, Fut>(
        min_workers: usize,
        max_workers: usize,
        queue_capacity: usize,
        processor: F,
    ) -> Result<TaskPool<P, R>>
    where
        F: Fn(Task<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TaskError>> + Send + 'static,
    {
        let config = Config {
            min_workers,
            max_workers,
            queue_capacity,
            task_timeout: None,
            autoscale: None,
        };
        Self::with_config(config, processor)
    }

    pub fn with_config<F, Fut>(config: Config, processor: F) -> Result<TaskPool<P, R>>
    where
        F: Fn(Task<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TaskError>> + Send + 'static,
    {
        config.validate()?;

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let capacity = (config.queue_capacity > 0)
            .then(|| Arc::new(Semaphore::new(config.queue_capacity)));

        Ok(Arc::new(TaskPoolInner {
            shared: Arc::new(Shared::new(boxed_processor(processor), config.task_timeout)),
            registry: Mutex::new(Registry {
                state: PoolState::Created,
                workers: BTreeMap::new(),
                retiring: Vec::new(),
                next_worker: 0,
                results_tx: Some(results_tx),
                autoscaler: None,
                report: None,
            }),
            capacity,
            results_rx: Arc::new(AsyncMutex::new(results_rx)),
            stopped: CancellationToken::new(),
            config,
        }))
    }

    /// Запускает `min_workers` воркеров. Повторный вызов на работающем пуле ничего не делает.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut reg = self.registry.lock();
        match reg.state {
            PoolState::Running => return Ok(()),
            PoolState::Draining | PoolState::Stopped => {
                return Err(PoolError::state("start", reg.state));
            }
            PoolState::Created => {}
        }

        for _ in 0..self.config.min_workers {
            self.spawn_worker(&mut reg)?;
        }
        reg.state = PoolState::Running;

        if let Some(policy) = self.config.autoscale.clone() {
            if let Some(previous) = reg.autoscaler.take() {
                previous.cancel();
            }
            reg.autoscaler = Some(self.spawn_autoscaler(policy));
        }

        info!(
            workers = reg.workers.len(),
            min = self.config.min_workers,
            max = self.config.max_workers,
            queue_capacity = self.config.queue_capacity,
            "task pool started"
        );
        Ok(())
    }

    fn spawn_worker(&self, reg: &mut Registry<R>) -> Result<WorkerId> {
        let Some(results_tx) = reg.results_tx.clone() else {
            return Err(PoolError::state("spawn worker", reg.state));
        };

        let id = WorkerId(reg.next_worker);
        reg.next_worker += 1;

        let retire = CancellationToken::new();
        let join = tokio::spawn(worker_loop(
            id,
            Arc::clone(&self.shared),
            retire.clone(),
            results_tx,
        ));
        reg.workers.insert(id, WorkerHandle::new(id, retire, join));
        Ok(id)
    }

    /// Ставит задачу в очередь, ожидая свободного места
    pub async fn submit(&self, task: Task<P>) -> Result<()> {
        self.ensure_running("submit")?;

        let permit = match &self.capacity {
            Some(sem) => Some(
                Arc::clone(sem)
                    .acquire_owned()
                    .await
                    .map_err(|_| PoolError::state("submit", self.state()))?,
            ),
            None => None,
        };

        self.enqueue("submit", task, permit)
    }

    /// Как `submit`, но при заполненной очереди сразу возвращает `QueueFull`
    pub fn try_submit(&self, task: Task<P>) -> Result<()> {
        self.ensure_running("try_submit")?;

        let permit = match &self.capacity {
            Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits) => {
                    return Err(PoolError::QueueFull {
                        capacity: self.config.queue_capacity,
                    });
                }
                Err(TryAcquireError::Closed) => {
                    return Err(PoolError::state("try_submit", self.state()));
                }
            },
            None => None,
        };

        self.enqueue("try_submit", task, permit)
    }

    fn enqueue(
        &self,
        operation: &'static str,
        task: Task<P>,
        permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) -> Result<()> {
        // Состояние проверяется под той же блокировкой, что и переход в Draining,
        // поэтому после shutdown в очередь ничего не попадёт
        let reg = self.registry.lock();
        if reg.state != PoolState::Running {
            return Err(PoolError::state(operation, reg.state));
        }
        self.shared.push(Queued {
            task,
            enqueued_at: Instant::now(),
            permit,
        });
        Ok(())
    }

    #[inline]
    fn ensure_running(&self, operation: &'static str) -> Result<()> {
        let state = self.state();
        if state != PoolState::Running {
            return Err(PoolError::state(operation, state));
        }
        Ok(())
    }

    pub fn results(&self) -> Results<R> {
        Results::new(Arc::clone(&self.results_rx))
    }

    /// Меняет число воркеров. Вне `[min_workers, max_workers]` возвращает `Bounds`.
    pub fn resize(&self, workers: usize) -> Result<usize> {
        let (min, max) = (self.config.min_workers, self.config.max_workers);
        if workers < min || workers > max {
            return Err(PoolError::Bounds {
                requested: workers,
                min,
                max,
            });
        }
        self.rescale("resize", |_| Some(workers))
    }

    /// Как `resize`, но прижимает значение к допустимому диапазону
    pub fn resize_clamped(&self, workers: usize) -> Result<usize> {
        self.rescale("resize", |_| Some(workers))
    }

    /// Решение принимается под блокировкой реестра, поэтому ручной resize
    /// и автомасштабирование не гоняются друг с другом.
    fn rescale(
        &self,
        operation: &'static str,
        decide: impl FnOnce(usize) -> Option<usize>,
    ) -> Result<usize> {
        let mut reg = self.registry.lock();
        if reg.state != PoolState::Running {
            return Err(PoolError::state(operation, reg.state));
        }

        reg.retiring.retain(|h| !h.is_finished());

        let current = reg.workers.len();
        let Some(target) = decide(current) else {
            return Ok(current);
        };
        let target = target.clamp(self.config.min_workers, self.config.max_workers);

        if target > current {
            for _ in current..target {
                self.spawn_worker(&mut reg)?;
            }
        } else {
            // Выводим самых новых; каждый доделает текущую задачу
            for _ in target..current {
                if let Some((id, handle)) = reg.workers.pop_last() {
                    debug!(worker = %id, "retiring worker");
                    handle.retire();
                    reg.retiring.push(handle);
                }
            }
        }

        if target != current {
            info!(operation, from = current, to = target, "pool resized");
        }
        Ok(target)
    }

    /// Запускает автомасштабирование. Предыдущий автомасштабировщик останавливается.
    /// Из Created можно: решения начнутся после `start()`, если конфиг не задаёт свой `autoscale`.
    pub fn start_autoscaling(self: &Arc<Self>, policy: ScalePolicy) -> Result<CancellationToken> {
        policy.validate()?;

        let mut reg = self.registry.lock();
        if matches!(reg.state, PoolState::Draining | PoolState::Stopped) {
            return Err(PoolError::state("start_autoscaling", reg.state));
        }
        if let Some(previous) = reg.autoscaler.take() {
            previous.cancel();
        }
        let token = self.spawn_autoscaler(policy);
        reg.autoscaler = Some(token.clone());
        Ok(token)
    }

    fn spawn_autoscaler(self: &Arc<Self>, policy: ScalePolicy) -> CancellationToken {
        let pool: Weak<Self> = Arc::downgrade(self);
        let token = CancellationToken::new();
        let stop = token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(policy.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        if !pool.autoscale_tick(&policy) {
                            break;
                        }
                    }
                }
            }
            debug!("autoscaler stopped");
        });

        token
    }

    /// `false`, когда пул остановлен или останавливается и автомасштабирование пора завершать
    fn autoscale_tick(&self, policy: &ScalePolicy) -> bool {
        let queued = self.shared.queue_len();
        let (min, max) = (self.config.min_workers, self.config.max_workers);
        let mut before = 0;
        let res = self.rescale("autoscale", |current| {
            before = current;
            policy.decide(queued, current, min, max)
        });
        match res {
            Ok(after) => {
                if after != before {
                    debug!(queued, from = before, to = after, "autoscaler adjusted workers");
                }
                true
            }
            Err(PoolError::State { state: PoolState::Created, .. }) => true,
            Err(PoolError::State { .. }) => false,
            Err(e) => {
                warn!(error = %e, "autoscale tick failed");
                true
            }
        }
    }

    pub async fn shutdown(self: &Arc<Self>, mode: ShutdownMode) -> Result<ShutdownReport> {
        self.shutdown_inner(mode, None).await
    }

    /// Graceful с дедлайном: по его истечении очередь отбрасывается как в Immediate
    pub async fn shutdown_timeout(self: &Arc<Self>, timeout: Duration) -> Result<ShutdownReport> {
        let deadline = tokio::time::Instant::now() + timeout;
        self.shutdown_inner(ShutdownMode::Graceful, Some(deadline)).await
    }

    /// Остановку доводит до конца отдельная задача, запущенная при переходе в Draining.
    /// Вызывающие только ждут `stopped`, поэтому отмена любого из них пул не подвешивает.
    async fn shutdown_inner(
        self: &Arc<Self>,
        mode: ShutdownMode,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<ShutdownReport> {
        let step = {
            let mut reg = self.registry.lock();
            match reg.state {
                PoolState::Stopped => ShutdownStep::Done,
                PoolState::Draining => {
                    // Более жёсткий режим ускоряет уже идущую остановку
                    if mode == ShutdownMode::Immediate {
                        self.shared.halt.cancel();
                    }
                    ShutdownStep::Wait { deadline }
                }
                PoolState::Created => {
                    reg.state = PoolState::Stopped;
                    reg.results_tx = None;
                    self.shared.closed.cancel();
                    self.stopped.cancel();
                    ShutdownStep::Done
                }
                PoolState::Running => {
                    reg.state = PoolState::Draining;
                    self.shared.closed.cancel();
                    if mode == ShutdownMode::Immediate {
                        self.shared.halt.cancel();
                    }
                    if let Some(sem) = &self.capacity {
                        sem.close();
                    }
                    if let Some(token) = reg.autoscaler.take() {
                        token.cancel();
                    }
                    let mut handles: Vec<WorkerHandle> =
                        std::mem::take(&mut reg.workers).into_values().collect();
                    handles.append(&mut reg.retiring);

                    info!(?mode, workers = handles.len(), "shutting down task pool");
                    let pool = Arc::clone(self);
                    tokio::spawn(async move { pool.finalize(mode, deadline, handles).await });
                    // Дедлайн отслеживает finalize
                    ShutdownStep::Wait { deadline: None }
                }
            }
        };

        match step {
            ShutdownStep::Done => Ok(ShutdownReport::default()),
            ShutdownStep::Wait { deadline } => {
                if let Some(deadline) = deadline {
                    if tokio::time::timeout_at(deadline, self.stopped.cancelled()).await.is_err() {
                        warn!("shutdown deadline exceeded, queued tasks will be dropped");
                        self.shared.halt.cancel();
                    }
                }
                self.stopped.cancelled().await;
                let report = self.registry.lock().report.clone().unwrap_or_default();
                Ok(report)
            }
        }
    }

    async fn finalize(
        &self,
        mode: ShutdownMode,
        deadline: Option<tokio::time::Instant>,
        handles: Vec<WorkerHandle>,
    ) {
        let mut report = ShutdownReport::default();

        for mut handle in handles {
            let joined = match deadline {
                Some(deadline) if !self.shared.halt.is_cancelled() => {
                    match tokio::time::timeout_at(deadline, &mut handle).await {
                        Ok(res) => res,
                        Err(_) => {
                            warn!("shutdown deadline exceeded, queued tasks will be dropped");
                            self.shared.halt.cancel();
                            (&mut handle).await
                        }
                    }
                }
                _ => (&mut handle).await,
            };

            match joined {
                Ok(()) => report.workers_joined += 1,
                Err(e) => warn!(worker = %handle.id(), error = %e, "worker lost during shutdown"),
            }
        }
        report.escalated = mode == ShutdownMode::Graceful && self.shared.halt.is_cancelled();

        // Все воркеры вышли: остаток очереди уходит потребителю как Dropped
        let results_tx = self.registry.lock().results_tx.take();
        while let Some(queued) = self.shared.pop() {
            let result = self.shared.drop_task(queued);
            if let Some(tx) = &results_tx {
                let _ = tx.send(result);
            }
        }
        drop(results_tx);

        // Dropped бывают только при остановке, включая снятые воркером после halt
        report.dropped = self.shared.dropped.load(Ordering::Relaxed);
        if report.dropped > 0 {
            warn!(dropped = report.dropped, "queued tasks dropped on shutdown");
        }

        {
            let mut reg = self.registry.lock();
            reg.state = PoolState::Stopped;
            reg.report = Some(report.clone());
        }
        self.stopped.cancel();

        info!(
            workers_joined = report.workers_joined,
            dropped = report.dropped,
            escalated = report.escalated,
            "task pool stopped"
        );
    }

    /// Ждёт, пока каждая отправленная задача не получит результат
    pub async fn wait_idle(&self) {
        self.shared.wait_idle().await
    }

    pub async fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_idle()).await.is_ok()
    }

    #[inline]
    pub fn state(&self) -> PoolState {
        self.registry.lock().state
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.registry.lock().workers.len()
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> PoolMetrics {
        let reg = self.registry.lock();
        PoolMetrics {
            state: reg.state,
            workers: reg.workers.len(),
            retiring: reg.retiring.iter().filter(|h| !h.is_finished()).count(),
            busy_workers: self.shared.busy.load(Ordering::Relaxed),
            queued: self.shared.queue_len(),
            pending: self.shared.pending.load(Ordering::Relaxed),
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Мониторинг метрик с callback.
    /// ВАЖНО: монитор держит Arc на пул до token.cancel() или полной остановки пула
    pub fn start_monitoring<F>(self: &Arc<Self>, interval: Duration, callback: F) -> CancellationToken
    where
        F: Fn(PoolMetrics) + Send + 'static,
    {
        let pool = Arc::clone(self);
        let token = CancellationToken::new();
        let token_clone = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        callback(pool.metrics());
                    }
                    _ = pool.stopped.cancelled() => {
                        callback(pool.metrics());
                        break;
                    }
                    _ = token_clone.cancelled() => {
                        break;
                    }
                }
            }
            drop(pool);
        });

        token
    }
}

impl<P, R> Drop for TaskPoolInner<P, R> {
    fn drop(&mut self) {
        // Без shutdown воркеры дорабатывают очередь и выходят сами
        self.shared.closed.cancel();
        if let Some(token) = self.registry.get_mut().autoscaler.take() {
            token.cancel();
        }
    }
}
