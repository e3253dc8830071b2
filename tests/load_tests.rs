#[cfg(test)]
mod tests {
    use async_taskpool::{
        errors::TaskError,
        model::{ShutdownMode, Task},
        pool::{Config, TaskPoolInner},
        scaling::ScalePolicy,
    };
    use parking_lot::Mutex;
    use std::{
        collections::HashSet,
        future::Future,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    async fn measure<F, Fut, T>(name: &str, f: F) -> (T, Duration)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let start = Instant::now();
        let result = f().await;
        let elapsed = start.elapsed();
        println!("✓ {}: {:?}", name, elapsed);
        (result, elapsed)
    }

    async fn run_sleepy_batch(resize_to: Option<usize>) -> usize {
        let pool = TaskPoolInner::create(2, 5, 10, |task: Task<u64>| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, TaskError>(task.into_payload())
        })
        .unwrap();
        pool.start().unwrap();

        let consumer = tokio::spawn(pool.results().collect_all());
        if let Some(workers) = resize_to {
            let pool = pool.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                pool.resize(workers).unwrap();
            });
        }

        for i in 0..20u64 {
            pool.submit(Task::new(i, i)).await.unwrap();
        }
        pool.shutdown(ShutdownMode::Graceful).await.unwrap();

        let results = consumer.await.unwrap();
        assert!(results.iter().all(|r| r.is_completed()));
        results.len()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_test_1_resize_speeds_up_batch() {
        println!("\n=== LOAD TEST 1: 20 задач по 50ms, min=2 max=5 ===");

        let (fixed, fixed_elapsed) = measure("2 workers", || run_sleepy_batch(None)).await;
        let (resized, resized_elapsed) = measure("resize(5) mid-run", || run_sleepy_batch(Some(5))).await;

        assert_eq!(fixed, 20);
        assert_eq!(resized, 20);
        // ceil(20 / 2) * 50ms
        assert!(fixed_elapsed >= Duration::from_millis(480), "2 воркера не могут быть быстрее 500ms");
        assert!(resized_elapsed < fixed_elapsed, "resize должен ускорить обработку");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_test_2_many_fast_tasks_with_autoscaling() {
        println!("\n=== LOAD TEST 2: 10k быстрых задач, автомасштабирование ===");
        let config = Config {
            min_workers: 2,
            max_workers: 16,
            queue_capacity: 256,
            task_timeout: Some(Duration::from_secs(5)),
            autoscale: Some(ScalePolicy {
                interval: Duration::from_millis(5),
                high_water: 32,
                low_water: 1,
                step: 2,
            }),
        };
        let pool = TaskPoolInner::with_config(config, |task: Task<u64>| async move {
            tokio::time::sleep(Duration::from_micros(100)).await;
            Ok::<_, TaskError>(task.into_payload() * 2)
        })
        .unwrap();
        pool.start().unwrap();

        let seen_workers = Arc::new(Mutex::new(Vec::new()));
        let sink = seen_workers.clone();
        let monitor = pool.start_monitoring(Duration::from_millis(5), move |m| {
            sink.lock().push(m.workers);
        });

        let consumer = tokio::spawn(pool.results().collect_all());
        let (_, _) = measure("10k tasks @ 100μs", || async {
            let submitters: Vec<_> = (0..4u64)
                .map(|s| {
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        for i in 0..2_500u64 {
                            let id = s * 10_000 + i;
                            pool.submit(Task::new(id, id)).await.unwrap();
                        }
                    })
                })
                .collect();
            for handle in submitters {
                handle.await.unwrap();
            }
            pool.shutdown(ShutdownMode::Graceful).await.unwrap()
        })
        .await;
        monitor.cancel();

        let results = consumer.await.unwrap();
        assert_eq!(results.len(), 10_000);
        let unique: HashSet<_> = results.iter().map(|r| r.task_id).collect();
        assert_eq!(unique.len(), 10_000);
        assert!(results.iter().all(|r| r.value() == Some(&(r.task_id.0 * 2))));

        let seen = seen_workers.lock();
        assert!(seen.iter().all(|&w| w <= 16), "воркеров больше max");
        println!("  Максимум воркеров: {:?}", seen.iter().max());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_test_3_resize_churn() {
        println!("\n=== LOAD TEST 3: resize во время обработки ===");
        let processed = Arc::new(AtomicUsize::new(0));
        let p = processed.clone();
        let pool = TaskPoolInner::create(1, 8, 64, move |task: Task<u64>| {
            let processed = p.clone();
            async move {
                tokio::time::sleep(Duration::from_micros(200)).await;
                processed.fetch_add(1, Ordering::Relaxed);
                Ok::<_, TaskError>(task.into_payload())
            }
        })
        .unwrap();
        pool.start().unwrap();

        let churn = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut seed = 7u64;
                let mut resizes = 0;
                while pool.resize_clamped((seed % 10) as usize).is_ok() {
                    let workers = pool.worker_count();
                    assert!((1..=8).contains(&workers));
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407) >> 3;
                    resizes += 1;
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                resizes
            })
        };

        let consumer = tokio::spawn(pool.results().collect_all());
        for i in 0..5_000u64 {
            pool.submit(Task::new(i, i)).await.unwrap();
        }
        pool.shutdown(ShutdownMode::Graceful).await.unwrap();

        let resizes = churn.await.unwrap();
        let results = consumer.await.unwrap();
        println!("  Resize вызовов: {}", resizes);

        assert_eq!(results.len(), 5_000);
        assert_eq!(processed.load(Ordering::Relaxed), 5_000);
        assert!(results.iter().all(|r| r.is_completed()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_test_4_immediate_shutdown_under_load() {
        println!("\n=== LOAD TEST 4: Immediate shutdown под нагрузкой ===");
        let pool = TaskPoolInner::create(4, 4, 0, |task: Task<u64>| async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok::<_, TaskError>(task.into_payload())
        })
        .unwrap();
        pool.start().unwrap();

        for i in 0..2_000u64 {
            pool.submit(Task::new(i, i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = pool.shutdown(ShutdownMode::Immediate).await.unwrap();
        let results = pool.results().collect_all().await;

        let completed = results.iter().filter(|r| r.is_completed()).count();
        let dropped = results.iter().filter(|r| r.is_dropped()).count();
        println!("  Выполнено: {}, отброшено: {}", completed, dropped);

        // Каждая задача ровно один раз: либо результат, либо Dropped
        assert_eq!(results.len(), 2_000);
        assert_eq!(completed + dropped, 2_000);
        assert_eq!(dropped, report.dropped);
        assert!(dropped > 0);
        let unique: HashSet<_> = results.iter().map(|r| r.task_id).collect();
        assert_eq!(unique.len(), 2_000);
    }
}
