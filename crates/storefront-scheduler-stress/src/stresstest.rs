use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::BoxFuture;
use rand::Rng;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use storefront_scheduler::config::{Config, SchedulerConfig};
use storefront_scheduler::{
    Debouncer, EnqueueOptions, Priority, Scheduler, TaskResult, debounce,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::backend;
use crate::workloads::{Workload, WorkloadsConfig};

/// Submits one call of a workload, returning the settlement.
#[derive(Clone)]
struct Submitter {
    scheduler: Scheduler<String>,
    workload: Arc<Workload>,
    debouncer: Option<Arc<Debouncer<usize, String>>>,
}

impl Submitter {
    fn new(scheduler: &Scheduler<String>, workload: Workload, debounce_delay: Duration) -> Self {
        let workload = Arc::new(workload);
        let debouncer = workload.debounce_delay(debounce_delay).map(|delay| {
            let scheduler = scheduler.clone();
            let workload = Arc::clone(&workload);
            let debouncer = debounce(
                move |index, token| enqueue(&scheduler, &workload, index, Some(token)),
                delay,
            );
            Arc::new(debouncer)
        });

        Self {
            scheduler: scheduler.clone(),
            workload,
            debouncer,
        }
    }

    fn submit(&self) -> BoxFuture<'static, TaskResult<String>> {
        let index = rand::rng().random_range(0..self.workload.distinct_keys.max(1));
        match &self.debouncer {
            Some(debouncer) => debouncer.call(index),
            None => Box::pin(enqueue(&self.scheduler, &self.workload, index, None)),
        }
    }
}

fn enqueue(
    scheduler: &Scheduler<String>,
    workload: &Workload,
    index: usize,
    signal: Option<CancellationToken>,
) -> storefront_scheduler::TaskFuture<String> {
    let url = workload.url(index);
    let latency = workload.latency;
    let failure_rate = workload.failure_rate;

    let mut options = EnqueueOptions::new(Priority(workload.priority)).with_kind(workload.kind);
    if let Some(key) = workload.cache_key(index) {
        options = options.with_cache_key(key);
    }
    if let Some(signal) = signal {
        options = options.with_signal(signal);
    }

    scheduler.enqueue(
        move |token| backend::request(url, latency, failure_rate, token),
        options,
    )
}

#[derive(Default)]
struct Stats {
    durations: DDSketch,
    errors: BTreeMap<&'static str, usize>,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let runtime = tokio::runtime::Handle::current();
    let scheduler = Scheduler::new(&SchedulerConfig::from(&config), runtime);
    tracing::info!(
        workloads = workloads.workloads.len(),
        ?duration,
        "Starting stresstest"
    );

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for workload in workloads.workloads {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let name = workload.name.clone();
        let concurrency = workload.concurrency.max(1);
        let submitter = Submitter::new(&scheduler, workload, config.debounce_delay);

        let task = tokio::spawn(async move {
            let stats = Arc::new(Mutex::new(Stats::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let stats = Arc::clone(&stats);
                        let task_start = Instant::now();
                        let call = submitter.submit();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let future = async move {
                            let result = call.await;

                            let mut stats = stats.lock().unwrap();
                            stats.durations.add(task_start.elapsed().as_secs_f64());
                            if let Err(error) = result {
                                *stats.errors.entry(error.kind()).or_default() += 1;
                            }

                            drop(permit);
                        };

                        tokio::spawn(future.bind_hub(hub));
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let stats: Stats = {
                let mut stats = stats.lock().unwrap();
                std::mem::take(&mut *stats)
            };

            (name, concurrency, stats)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for task in finished_tasks {
        let (name, concurrency, stats) = task?;
        let Stats { durations, errors } = stats;

        let ops = durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {name} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s"
        );
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let seconds = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(seconds)
        };
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");

        for (kind, count) in errors {
            println!("  {kind}: {count}");
        }
    }

    Ok(())
}
