use std::time::Duration;

use storefront_scheduler::caching::{CacheKey, CacheName};
use storefront_scheduler::{EnqueueOptions, FlushOutcome, Priority, TaskError, debounce};
use tokio_util::sync::CancellationToken;

use crate::{fetch, setup_scheduler};

const DELAY: Duration = Duration::from_millis(300);

#[tokio::test(start_paused = true)]
async fn test_debounced_filters() {
    let (scheduler, transport) = setup_scheduler(|_| {});

    let filter = {
        let transport = transport.clone();
        debounce(
            move |color: &'static str, token: CancellationToken| {
                let key = CacheKey::for_request(CacheName::Listings, "GET", color, None);
                scheduler.enqueue(
                    fetch(&transport, color, Duration::from_millis(100)),
                    EnqueueOptions::new(Priority::LOW)
                        .with_cache_key(key)
                        .with_signal(token),
                )
            },
            DELAY,
        )
    };

    let red = filter.call("red");
    tokio::time::advance(Duration::from_millis(50)).await;
    let green = filter.call("green");
    tokio::time::advance(Duration::from_millis(50)).await;
    let blue = filter.call("blue");

    assert_eq!(blue.await.unwrap(), "response for blue");
    assert_eq!(red.await, Err(TaskError::Superseded));
    assert_eq!(green.await, Err(TaskError::Superseded));
    assert_eq!(transport.total_calls(), 1);

    let pending = filter.call("yellow");
    assert_eq!(
        filter.flush().await,
        FlushOutcome::Executed(Ok("response for yellow".into()))
    );
    assert_eq!(pending.await.unwrap(), "response for yellow");
    assert_eq!(filter.flush().await, FlushOutcome::NothingPending);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_call_aborts_request() {
    let (scheduler, transport) = setup_scheduler(|_| {});

    let filter = {
        let transport = transport.clone();
        debounce(
            move |size: &'static str, token: CancellationToken| {
                scheduler.enqueue(
                    fetch(&transport, size, Duration::from_secs(2)),
                    EnqueueOptions::new(Priority::LOW).with_signal(token),
                )
            },
            DELAY,
        )
    };

    let small = filter.call("small");
    // the first call fires and its request is in flight
    tokio::time::sleep(Duration::from_millis(500)).await;
    let large = filter.call("large");

    assert_eq!(small.await, Err(TaskError::Superseded));
    assert_eq!(large.await.unwrap(), "response for large");
    assert_eq!(
        transport.events(),
        ["start small", "finish small", "start large", "finish large"]
    );
}
