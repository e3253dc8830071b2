use async_taskpool::{Config, ShutdownMode, Task, TaskError, TaskPoolInner};
use std::time::{Duration, Instant};
use tokio::runtime::Builder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};


fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "async_taskpool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rt = Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()?;

    rt.block_on(async {
        let config = Config {
            min_workers: 2,
            max_workers: 5,
            queue_capacity: 10,
            ..Config::from_env()?
        };

        let pool = TaskPoolInner::with_config(config, |task: Task<u64>| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let n = *task.payload();
            if n % 7 == 6 {
                return Err(TaskError::failed(format!("{n} is unlucky")));
            }
            Ok(n * n)
        })?;
        pool.start()?;

        let results = pool.results();
        let consumer = tokio::spawn(results.collect_all());

        let scaler = {
            let pool = pool.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                pool.resize(5)
            })
        };

        let now = Instant::now();
        for i in 0..20u64 {
            pool.submit(Task::new(i, i)).await?;
        }
        scaler.await??;

        let report = pool.shutdown(ShutdownMode::Graceful).await?;
        let results = consumer.await?;

        let ok = results.iter().filter(|r| r.is_completed()).count();
        println!(
            "elapsed: {:?}, results: {}, completed: {}, failed: {}, dropped: {}",
            now.elapsed(),
            results.len(),
            ok,
            results.iter().filter(|r| r.is_failed()).count(),
            report.dropped,
        );
        println!("metrics: {:?}", pool.metrics());

        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
