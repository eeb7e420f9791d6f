use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use wagate::{Category, Policy, PolicyTable, ThrottleError};
use wagate_server::actor::LimiterActor;
use wagate_server::config::SchedulerConfig;
use wagate_server::events::{EventBus, EventKind, Topic};
use wagate_server::metrics::Metrics;
use wagate_server::scheduler::Scheduler;

const HOUR: Duration = Duration::from_secs(3600);

fn scheduler_with(policies: PolicyTable) -> (Scheduler, EventBus) {
    let config = SchedulerConfig {
        policies,
        ..SchedulerConfig::default()
    };
    let events = EventBus::new(1024);
    let limiter = LimiterActor::spawn(&config, events.clone(), Arc::new(Metrics::new()));
    (Scheduler::new(limiter), events)
}

fn unspaced(max_concurrent: u32, reservoir: u32) -> Policy {
    Policy::new(max_concurrent, Duration::ZERO, reservoir, reservoir, HOUR)
}

fn within(actual: Duration, expected: Duration) -> bool {
    actual >= expected && actual < expected + Duration::from_secs(1)
}

#[tokio::test(start_paused = true)]
async fn test_flood_never_exceeds_concurrency() {
    let policies = PolicyTable::default()
        .with(Category::Api, unspaced(3, 1000))
        .unwrap()
        .with(Category::Global, unspaced(20, 1000))
        .unwrap();
    let (scheduler, _) = scheduler_with(policies);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut jobs = Vec::new();
    for _ in 0..30 {
        let scheduler = scheduler.clone();
        let running = running.clone();
        let peak = peak.clone();
        jobs.push(tokio::spawn(async move {
            scheduler
                .schedule_api_call(
                    "/106540352242922",
                    async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    },
                    Some("106540352242922"),
                )
                .await
        }));
    }
    for job in jobs {
        job.await.unwrap().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fifo_order_on_saturated_limiter() {
    let policies = PolicyTable::default()
        .with(Category::Messaging, unspaced(1, 100))
        .unwrap()
        .with(Category::Global, unspaced(20, 1000))
        .unwrap();
    let (scheduler, _) = scheduler_with(policies);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut jobs = Vec::new();
    for name in ["A", "B", "C"] {
        let scheduler = scheduler.clone();
        let order = order.clone();
        jobs.push(tokio::spawn(async move {
            scheduler
                .schedule_message(
                    "106540352242922",
                    async {
                        order.lock().await.push(name);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    },
                    false,
                )
                .await
        }));
        // Each caller reaches the limiter before the next one is spawned
        tokio::task::yield_now().await;
    }
    for job in jobs {
        job.await.unwrap().unwrap();
    }

    assert_eq!(*order.lock().await, vec!["A", "B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_resource_blocks_despite_global_capacity() {
    let policies = PolicyTable::default()
        .with(Category::Messaging, unspaced(5, 1))
        .unwrap()
        .with(Category::Api, unspaced(5, 10))
        .unwrap()
        .with(Category::Global, unspaced(20, 1000))
        .unwrap();
    let (scheduler, _) = scheduler_with(policies);
    let start = Instant::now();

    scheduler
        .schedule_message("106540352242922", async {}, false)
        .await
        .unwrap();

    let blocked = tokio::spawn({
        let scheduler = scheduler.clone();
        async move {
            scheduler
                .schedule_message("106540352242922", async { Instant::now() }, false)
                .await
        }
    });

    // The global limiter still admits other work right away
    let api_at = scheduler
        .schedule_api_call("/106540352242922", async { Instant::now() }, None)
        .await
        .unwrap();
    assert_eq!(api_at, start);

    let sent_at = blocked.await.unwrap().unwrap();
    assert!(within(sent_at - start, HOUR));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_global_blocks_despite_resource_capacity() {
    let policies = PolicyTable::default()
        .with(Category::Messaging, unspaced(5, 80))
        .unwrap()
        .with(Category::Global, unspaced(20, 2))
        .unwrap();
    let (scheduler, _) = scheduler_with(policies);
    let start = Instant::now();

    for phone in ["111", "222"] {
        scheduler
            .schedule_message(phone, async {}, false)
            .await
            .unwrap();
    }

    // A phone number that has never sent still waits for the global refill
    let sent_at = scheduler
        .schedule_message("333", async { Instant::now() }, false)
        .await
        .unwrap();
    assert!(within(sent_at - start, HOUR));
}

#[tokio::test(start_paused = true)]
async fn test_phone_numbers_share_global_but_not_messaging() {
    let (scheduler, _) = scheduler_with(PolicyTable::default());
    let start = Instant::now();

    let first = scheduler
        .schedule_message("111", async { Instant::now() }, false)
        .await
        .unwrap();
    let second = scheduler
        .schedule_message("222", async { Instant::now() }, false)
        .await
        .unwrap();
    let again = scheduler
        .schedule_message("111", async { Instant::now() }, false)
        .await
        .unwrap();

    assert_eq!(first, start);
    // Only the 3.6s global spacing separates two different numbers
    assert!(within(second - start, Duration::from_millis(3600)));
    // The same number waits out its own 45s spacing
    assert!(within(again - start, Duration::from_secs(45)));
}

#[tokio::test(start_paused = true)]
async fn test_eighty_first_message_waits_for_refill() {
    let (scheduler, events) = scheduler_with(PolicyTable::default());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    events.on(Topic::Kind(EventKind::RateLimitHit), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let start = Instant::now();

    let mut sends = Vec::new();
    for _ in 0..81 {
        let scheduler = scheduler.clone();
        sends.push(tokio::spawn(async move {
            scheduler
                .schedule_message("106540352242922", async { Instant::now() }, false)
                .await
        }));
    }

    let mut admitted = Vec::new();
    for send in sends {
        admitted.push(send.await.unwrap().unwrap() - start);
    }
    admitted.sort();

    // 80 messages at 45s intervals drain the reservoir
    assert_eq!(admitted[0], Duration::ZERO);
    assert!(within(admitted[1], Duration::from_secs(45)));
    assert!(within(admitted[79], Duration::from_secs(79 * 45)));
    // The 81st goes out only once the hourly refill lands
    assert!(within(admitted[80], HOUR));
    assert!(hits.load(Ordering::SeqCst) > 0);
}

#[tokio::test(start_paused = true)]
async fn test_templates_use_their_own_limiter() {
    let policies = PolicyTable::default()
        .with(Category::Messaging, unspaced(5, 1))
        .unwrap()
        .with(Category::Global, unspaced(20, 1000))
        .unwrap();
    let (scheduler, _) = scheduler_with(policies);
    let start = Instant::now();

    scheduler
        .schedule_message("106540352242922", async {}, false)
        .await
        .unwrap();
    let template_at = scheduler
        .schedule_message("106540352242922", async { Instant::now() }, true)
        .await
        .unwrap();
    assert_eq!(template_at, start);

    let status = scheduler
        .rate_limit_status(Some("106540352242922"))
        .await
        .unwrap();
    assert_eq!(status.get(Category::Messaging).unwrap().reservoir, 0);
    assert_eq!(status.get(Category::Templates).unwrap().reservoir, 249);
    assert_eq!(status.get(Category::Global).unwrap().reservoir, 998);
    assert!(!status.get(Category::Api).unwrap().active);
}

#[tokio::test(start_paused = true)]
async fn test_job_error_is_returned_unchanged() {
    let (scheduler, _) = scheduler_with(PolicyTable::default());

    let result: Result<Result<(), String>, _> = scheduler
        .schedule_api_call("/me", async { Err("upstream said no".to_string()) }, None)
        .await;
    assert_eq!(result.unwrap(), Err("upstream said no".to_string()));

    // The failed job released both slots
    let status = scheduler.rate_limit_status(None).await.unwrap();
    assert_eq!(status.get(Category::Api).unwrap().running, 0);
    assert_eq!(status.get(Category::Global).unwrap().running, 0);
}

#[tokio::test(start_paused = true)]
async fn test_webhook_and_event_limiters_are_single_tier() {
    let policies = PolicyTable::default()
        .with(Category::Global, unspaced(1, 1))
        .unwrap();
    let (scheduler, _) = scheduler_with(policies);

    // Exhaust the global limiter
    scheduler
        .schedule_api_call("/me", async {}, None)
        .await
        .unwrap();

    let start = Instant::now();
    let webhook_at = scheduler
        .schedule_webhook(async { Instant::now() }, None)
        .await
        .unwrap();
    let event_at = scheduler
        .schedule_event(async { Instant::now() }, Some("106540352242922"))
        .await
        .unwrap();
    assert_eq!(webhook_at, start);
    assert_eq!(event_at, start);

    let status = scheduler.rate_limit_status(None).await.unwrap();
    assert_eq!(status.get(Category::Webhook).unwrap().reservoir, 999);
    assert!(!status.get(Category::Events).unwrap().active);
}

#[tokio::test(start_paused = true)]
async fn test_reaped_limiter_is_recreated_full() {
    let policies = PolicyTable::default()
        .with(Category::Messaging, unspaced(5, 2))
        .unwrap()
        .with(Category::Global, unspaced(20, 1000))
        .unwrap();
    let (scheduler, _) = scheduler_with(policies);
    let start = Instant::now();

    for _ in 0..2 {
        scheduler
            .schedule_message("106540352242922", async {}, false)
            .await
            .unwrap();
    }
    assert_eq!(scheduler.limiter().reap().await.unwrap(), 2);

    // Idle reaping forgets the spent reservoir
    let sent_at = scheduler
        .schedule_message("106540352242922", async { Instant::now() }, false)
        .await
        .unwrap();
    assert_eq!(sent_at, start);
}

#[tokio::test(start_paused = true)]
async fn test_resource_timeout_refunds_global_token() {
    let config = SchedulerConfig {
        policies: PolicyTable::default()
            .with(Category::Messaging, unspaced(1, 1))
            .unwrap(),
        queue_timeout: Some(Duration::from_secs(10)),
        ..SchedulerConfig::default()
    };
    let limiter = LimiterActor::spawn(&config, EventBus::new(64), Arc::new(Metrics::new()));
    let scheduler = Scheduler::new(limiter);
    let start = Instant::now();

    scheduler
        .schedule_message("106540352242922", async {}, false)
        .await
        .unwrap();

    // Global admits after its 3.6s spacing, then the drained messaging
    // limiter times out
    let result = scheduler
        .schedule_message("106540352242922", async {}, false)
        .await;
    assert!(matches!(result, Err(ThrottleError::QueueTimeout { .. })));

    let status = scheduler.rate_limit_status(None).await.unwrap();
    let global = status.get(Category::Global).unwrap();
    assert_eq!(global.reservoir, 999);
    assert_eq!(global.running, 0);

    // The global limiter admits the next call straight away
    let api_at = scheduler
        .schedule_api_call("/me", async { Instant::now() }, None)
        .await
        .unwrap();
    assert!(within(api_at - start, Duration::from_millis(13_600)));
}
