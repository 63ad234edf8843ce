use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use storefront_scheduler::config::SchedulerConfig;
use storefront_scheduler::{Scheduler, TaskError, TaskResult};
use storefront_scheduler_test as test;
use tokio_util::sync::CancellationToken;

pub use test::FakeTransport;

/// Setup tests and create a scheduler in front of a [`FakeTransport`].
///
/// The `update_config` closure can modify the default configuration before the scheduler is
/// started.
pub fn setup_scheduler(
    update_config: impl FnOnce(&mut SchedulerConfig),
) -> (Scheduler<String>, FakeTransport) {
    test::setup();

    let mut config = SchedulerConfig::default();
    update_config(&mut config);

    let handle = tokio::runtime::Handle::current();
    (Scheduler::new(&config, handle), FakeTransport::new())
}

/// The work of a scheduled task: performs `request` on the `transport`.
pub fn fetch(
    transport: &FakeTransport,
    request: &'static str,
    latency: Duration,
) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, TaskResult<String>> + Send + 'static {
    let transport = transport.clone();
    move |token| {
        async move {
            transport
                .fetch(request, latency, token)
                .await
                .map_err(TaskError::transport)
        }
        .boxed()
    }
}

/// Lets the scheduler worker catch up with what was enqueued.
pub async fn settle_worker() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
