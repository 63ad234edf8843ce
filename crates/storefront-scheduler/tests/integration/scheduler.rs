use std::time::Duration;

use futures::future::join_all;
use storefront_scheduler::caching::{CacheKey, CacheName};
use storefront_scheduler::{
    EnqueueOptions, OperationKind, Priority, TaskError, TaskId, TaskResult,
};
use tokio_util::sync::CancellationToken;

use crate::{fetch, settle_worker, setup_scheduler};

const LATENCY: Duration = Duration::from_millis(200);

fn listing_key(query: &str) -> CacheKey {
    CacheKey::for_request(CacheName::Listings, "GET", query, None)
}

#[tokio::test(start_paused = true)]
async fn test_one_task_at_a_time() {
    let (scheduler, transport) = setup_scheduler(|_| {});

    let requests = ["a", "b", "c", "d", "e", "f"];
    let futures: Vec<_> = requests
        .iter()
        .enumerate()
        .map(|(i, &request)| {
            scheduler.enqueue(
                fetch(&transport, request, LATENCY),
                EnqueueOptions::new(i as i32 % 3),
            )
        })
        .collect();
    assert!(scheduler.queued_tasks() > 0);

    // everything was queued before the worker admitted the first task, so nothing was preempted
    let results = join_all(futures).await;
    for (request, result) in requests.iter().zip(results) {
        assert_eq!(result.unwrap(), format!("response for {request}"));
    }

    assert_eq!(transport.max_concurrency(), 1);
    assert_eq!(scheduler.queued_tasks(), 0);
    assert_eq!(scheduler.active_task(), None);
}

#[tokio::test(start_paused = true)]
async fn test_deduplication() {
    let (scheduler, transport) = setup_scheduler(|_| {});
    let key = listing_key("/listings?color=red");

    let options = || EnqueueOptions::new(Priority::MEDIUM).with_cache_key(key.clone());

    let active = scheduler.enqueue(fetch(&transport, "red", LATENCY), options());
    settle_worker().await;
    assert!(scheduler.active_task().is_some());

    let joined = scheduler.enqueue(fetch(&transport, "red", LATENCY), options());
    let joined_again = scheduler.enqueue(fetch(&transport, "red", LATENCY), options());

    let results = join_all([active, joined, joined_again]).await;
    for result in results {
        assert_eq!(result.unwrap(), "response for red");
    }
    assert_eq!(transport.calls("red"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deduplication_while_queued() {
    let (scheduler, transport) = setup_scheduler(|_| {});
    let key = listing_key("/listings?size=m");

    let blocker = scheduler.enqueue(
        fetch(&transport, "blocker", LATENCY),
        EnqueueOptions::new(Priority::HIGH),
    );

    let options = || EnqueueOptions::new(Priority::LOW).with_cache_key(key.clone());
    let first = scheduler.enqueue(fetch(&transport, "m", LATENCY), options());
    let second = scheduler.enqueue(fetch(&transport, "m", LATENCY), options());

    assert!(blocker.await.is_ok());
    assert_eq!(first.await, second.await);
    assert_eq!(transport.calls("m"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_preemption() {
    let (scheduler, transport) = setup_scheduler(|_| {});

    let slow = scheduler.enqueue(
        fetch(&transport, "slow", Duration::from_secs(5)),
        EnqueueOptions::new(Priority::LOW).with_id("slow"),
    );
    settle_worker().await;
    assert_eq!(scheduler.active_task(), Some(TaskId::from("slow")));

    let urgent = scheduler.enqueue(
        fetch(&transport, "urgent", LATENCY),
        EnqueueOptions::new(Priority::HIGH).with_id("urgent"),
    );

    assert_eq!(slow.await, Err(TaskError::Cancelled));
    assert_eq!(urgent.await.unwrap(), "response for urgent");
    assert_eq!(
        transport.events(),
        ["start slow", "finish slow", "start urgent", "finish urgent"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_no_preemption_by_equal_priority() {
    let (scheduler, transport) = setup_scheduler(|_| {});

    let first = scheduler.enqueue(
        fetch(&transport, "first", LATENCY),
        EnqueueOptions::new(Priority::MEDIUM),
    );
    settle_worker().await;
    let second = scheduler.enqueue(
        fetch(&transport, "second", LATENCY),
        EnqueueOptions::new(Priority::MEDIUM),
    );

    assert!(first.await.is_ok());
    assert!(second.await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_priority_order_and_fifo() {
    let (scheduler, transport) = setup_scheduler(|_| {});

    let mut futures = vec![scheduler.enqueue(
        fetch(&transport, "blocker", LATENCY),
        EnqueueOptions::new(100),
    )];
    settle_worker().await;

    for request in ["a", "b", "c"] {
        futures.push(scheduler.enqueue(
            fetch(&transport, request, LATENCY),
            EnqueueOptions::new(Priority::LOW),
        ));
    }
    futures.push(scheduler.enqueue(
        fetch(&transport, "high", LATENCY),
        EnqueueOptions::new(Priority::HIGH),
    ));
    assert_eq!(scheduler.queued_tasks(), 4);

    for result in join_all(futures).await {
        assert!(result.is_ok());
    }

    let starts: Vec<_> = transport
        .events()
        .into_iter()
        .filter(|event| event.starts_with("start"))
        .collect();
    assert_eq!(
        starts,
        ["start blocker", "start high", "start a", "start b", "start c"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_not_cached() {
    let (scheduler, transport) = setup_scheduler(|_| {});
    let key = listing_key("/listings?page=2");
    let options = || EnqueueOptions::default().with_cache_key(key.clone());

    transport.fail_next("page");
    let failed = scheduler
        .enqueue(fetch(&transport, "page", LATENCY), options())
        .await;
    assert!(matches!(failed, Err(TaskError::Transport(_))));

    let retried = scheduler
        .enqueue(fetch(&transport, "page", LATENCY), options())
        .await;
    assert_eq!(retried.unwrap(), "response for page");
    assert_eq!(transport.calls("page"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cache_ttl() {
    let (scheduler, transport) = setup_scheduler(|config| {
        config.caches.listings.ttl = Duration::from_secs(30);
    });
    let key = listing_key("/listings");
    let options = || EnqueueOptions::default().with_cache_key(key.clone());

    let first = scheduler
        .enqueue(fetch(&transport, "listings", LATENCY), options())
        .await;
    let cached = scheduler
        .enqueue(fetch(&transport, "listings", LATENCY), options())
        .await;
    assert_eq!(first, cached);
    assert_eq!(transport.calls("listings"), 1);

    tokio::time::advance(Duration::from_secs(31)).await;

    let refreshed = scheduler
        .enqueue(fetch(&transport, "listings", LATENCY), options())
        .await;
    assert!(refreshed.is_ok());
    assert_eq!(transport.calls("listings"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_and_bypass() {
    let (scheduler, transport) = setup_scheduler(|_| {});
    let key = CacheKey::for_request(CacheName::Catalog, "GET", "/products/42", None);
    let options = || EnqueueOptions::default().with_cache_key(key.clone());

    assert!(scheduler
        .enqueue(fetch(&transport, "product", LATENCY), options())
        .await
        .is_ok());
    assert!(scheduler.invalidate(&key));
    assert!(!scheduler.invalidate(&key));

    assert!(scheduler
        .enqueue(fetch(&transport, "product", LATENCY), options())
        .await
        .is_ok());
    assert!(scheduler
        .enqueue(fetch(&transport, "product", LATENCY), options().without_cache())
        .await
        .is_ok());
    assert_eq!(transport.calls("product"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_do_not_break_the_queue() {
    let (scheduler, transport) = setup_scheduler(|config| {
        config.timeouts.read = Duration::from_secs(1);
        config.timeouts.mutation = Duration::from_secs(5);
    });

    let read = scheduler.enqueue(
        fetch(&transport, "read", Duration::from_secs(3)),
        EnqueueOptions::default(),
    );
    let mutation = scheduler.enqueue(
        fetch(&transport, "cart", Duration::from_secs(3)),
        EnqueueOptions::default().with_kind(OperationKind::Mutation),
    );
    let overridden = scheduler.enqueue(
        fetch(&transport, "slow read", Duration::from_secs(3)),
        EnqueueOptions::default().with_timeout(Duration::from_secs(4)),
    );

    assert_eq!(read.await, Err(TaskError::Timeout(Duration::from_secs(1))));
    assert_eq!(mutation.await.unwrap(), "response for cart");
    assert_eq!(overridden.await.unwrap(), "response for slow read");
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_while_queued() {
    let (scheduler, transport) = setup_scheduler(|_| {});
    let signal = CancellationToken::new();

    let blocker = scheduler.enqueue(
        fetch(&transport, "blocker", LATENCY),
        EnqueueOptions::new(Priority::HIGH),
    );
    let cancelled = scheduler.enqueue(
        fetch(&transport, "filter", LATENCY),
        EnqueueOptions::new(Priority::LOW).with_signal(signal.clone()),
    );
    signal.cancel();

    assert!(blocker.await.is_ok());
    assert_eq!(cancelled.await, Err(TaskError::Cancelled));
    assert_eq!(transport.calls("filter"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_is_eager() {
    let (scheduler, transport) = setup_scheduler(|_| {});

    // the returned future is dropped right away
    drop(scheduler.enqueue(
        fetch(&transport, "fire and forget", LATENCY),
        EnqueueOptions::default(),
    ));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.calls("fire and forget"), 1);
}

async fn broken_parser(_token: CancellationToken) -> TaskResult<String> {
    panic!("broken parser")
}

#[tokio::test(start_paused = true)]
async fn test_panicking_task_does_not_stop_worker() {
    let (scheduler, transport) = setup_scheduler(|_| {});

    let panicking = scheduler.enqueue(
        broken_parser,
        EnqueueOptions::new(Priority::HIGH).with_id("broken"),
    );
    let after = scheduler.enqueue(
        fetch(&transport, "after", LATENCY),
        EnqueueOptions::new(Priority::LOW),
    );

    assert!(matches!(panicking.await, Err(TaskError::Transport(_))));
    assert_eq!(after.await.unwrap(), "response for after");
    assert_eq!(scheduler.active_task(), None);
}
