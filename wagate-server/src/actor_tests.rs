#[cfg(test)]
mod tests {
    use crate::actor::{LimiterActor, LimiterHandle};
    use crate::config::SchedulerConfig;
    use crate::events::{EventBus, EventKind, EventPayload, Topic};
    use crate::metrics::Metrics;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_test::{assert_pending, assert_ready};
    use wagate::{Category, LimiterKey, Policy, PolicyTable, ReapPolicy, ThrottleError};

    fn api_policy(max_concurrent: u32, reservoir: u32) -> Policy {
        Policy::new(
            max_concurrent,
            Duration::ZERO,
            reservoir,
            reservoir,
            Duration::from_secs(60),
        )
    }

    fn spawn(policy: Policy, tweak: impl FnOnce(&mut SchedulerConfig)) -> (LimiterHandle, EventBus) {
        let mut config = SchedulerConfig {
            policies: PolicyTable::default().with(Category::Api, policy).unwrap(),
            ..SchedulerConfig::default()
        };
        tweak(&mut config);
        let events = EventBus::new(64);
        let handle = LimiterActor::spawn(&config, events.clone(), Arc::new(Metrics::new()));
        (handle, events)
    }

    fn key() -> LimiterKey {
        LimiterKey::new("106540352242922", Category::Api)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_and_release() {
        let (handle, _) = spawn(api_policy(2, 100), |_| {});

        let first = handle.acquire(key()).await.unwrap();
        let _second = handle.acquire(key()).await.unwrap();

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.acquire(key()).await }
        });

        // Nothing but a release can admit the third caller
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let third = waiter.await.unwrap().unwrap();
        assert_eq!(third.key(), &key());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_caller_woken_by_refill() {
        let (handle, _) = spawn(api_policy(10, 2), |_| {});
        let start = Instant::now();

        drop(handle.acquire(key()).await.unwrap());
        drop(handle.acquire(key()).await.unwrap());

        let permit = handle.acquire(key()).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(60), "admitted after {waited:?}");
        assert!(waited < Duration::from_secs(61), "admitted after {waited:?}");
        drop(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_request_emits_rate_limit_hit() {
        let (handle, events) = spawn(api_policy(1, 100), |_| {});
        let mut hits = events.subscribe(Topic::Kind(EventKind::RateLimitHit));

        let permit = handle.acquire(key()).await.unwrap();
        let mut pending = tokio_test::task::spawn(handle.acquire(key()));
        assert_pending!(pending.poll());

        let event = hits.recv().await.unwrap();
        match event.payload {
            EventPayload::RateLimitHit { limiter_key, .. } => {
                assert_eq!(limiter_key, "106540352242922:api");
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        drop(permit);
        // Round-trip through the actor so the release has been processed
        handle.limiter_count().await.unwrap();
        tokio::task::yield_now().await;
        assert!(pending.is_woken());
        assert!(assert_ready!(pending.poll()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_abandons_without_spending_budget() {
        let (handle, events) = spawn(api_policy(1, 5), |config| {
            config.queue_timeout = Some(Duration::from_secs(5));
        });
        let mut errors = events.subscribe(Topic::Kind(EventKind::Error));

        let blocker = handle.acquire(key()).await.unwrap();
        let result = handle.acquire(key()).await;
        assert_eq!(
            result.unwrap_err(),
            ThrottleError::QueueTimeout {
                key: key(),
                waited: Duration::from_secs(5),
            }
        );

        match errors.recv().await.unwrap().payload {
            EventPayload::Error { context, .. } => {
                assert_eq!(context, "rate_limiter:106540352242922:api");
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        drop(blocker);
        let _next = handle.acquire(key()).await.unwrap();

        // Two real admissions; the abandoned waiter took nothing
        let status = handle.status(vec![key()]).await.unwrap()[0].unwrap();
        assert_eq!(status.reservoir, 3);
        assert_eq!(status.running, 1);
        assert_eq!(status.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_waiter_is_skipped() {
        let (handle, _) = spawn(api_policy(1, 5), |_| {});

        let blocker = handle.acquire(key()).await.unwrap();
        let abandoned = tokio::spawn({
            let handle = handle.clone();
            async move { handle.acquire(key()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();
        let _ = abandoned.await;

        drop(blocker);
        let _next = handle.acquire(key()).await.unwrap();

        let status = handle.status(vec![key()]).await.unwrap()[0].unwrap();
        assert_eq!(status.reservoir, 3);
        assert_eq!(status.running, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_releases_slot() {
        let (handle, _) = spawn(api_policy(1, 100), |_| {});

        let job = tokio::spawn({
            let handle = handle.clone();
            async move {
                let _permit = handle.acquire(key()).await.unwrap();
                panic!("job failed");
            }
        });
        assert!(job.await.unwrap_err().is_panic());

        let permit = tokio::time::timeout(Duration::from_secs(1), handle.acquire(key())).await;
        assert!(permit.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_demand_reap_and_recreate() {
        let (handle, _) = spawn(api_policy(1, 3), |_| {});

        drop(handle.acquire(key()).await.unwrap());
        drop(handle.acquire(key()).await.unwrap());
        assert_eq!(handle.limiter_count().await.unwrap(), 1);

        assert_eq!(handle.reap().await.unwrap(), 1);
        assert_eq!(handle.limiter_count().await.unwrap(), 0);
        assert_eq!(handle.status(vec![key()]).await.unwrap(), vec![None]);

        // A fresh limiter starts full
        let _permit = handle.acquire(key()).await.unwrap();
        let status = handle.status(vec![key()]).await.unwrap()[0].unwrap();
        assert_eq!(status.reservoir, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_skips_busy_limiters() {
        let (handle, _) = spawn(api_policy(1, 3), |_| {});

        let _held = handle.acquire(key()).await.unwrap();
        drop(handle.acquire(LimiterKey::new("other", Category::Api)).await.unwrap());

        assert_eq!(handle.reap().await.unwrap(), 1);
        assert_eq!(handle.limiter_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_reap_waits_for_full_reservoir() {
        let (handle, _) = spawn(api_policy(1, 3), |config| {
            config.reap_policy = ReapPolicy::Settled;
        });

        drop(handle.acquire(key()).await.unwrap());
        assert_eq!(handle.reap().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(handle.reap().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_reaper_updates_metrics() {
        let mut config = SchedulerConfig {
            reap_interval: Duration::from_secs(10),
            ..SchedulerConfig::default()
        };
        config.policies.set(Category::Api, api_policy(1, 3)).unwrap();
        let metrics = Arc::new(Metrics::new());
        let handle = LimiterActor::spawn(&config, EventBus::new(16), metrics.clone());

        drop(handle.acquire(key()).await.unwrap());
        assert_eq!(handle.limiter_count().await.unwrap(), 1);
        assert_eq!(metrics.active_limiters.load(Ordering::Relaxed), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(handle.limiter_count().await.unwrap(), 0);
        assert_eq!(metrics.limiters_reaped.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.active_limiters.load(Ordering::Relaxed), 0);
    }
}
