use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{Workload, WorkloadsConfig, run_operation};

/// The aggregated results of one workload.
struct WorkloadResult {
    concurrency: usize,
    durations: DDSketch,
    computations: usize,
    failures: usize,
}

pub async fn perform_stresstest(
    workloads: WorkloadsConfig,
    duration: Duration,
    log_events: bool,
) -> Result<()> {
    let workloads: Vec<_> = workloads.workloads.into_iter().map(Arc::new).collect();

    // warmup: run each workload once, so that no workload pays for lazy initialization
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                run_operation(&workload, log_events).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency.max(1);
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let computations = Arc::new(AtomicUsize::new(0));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let computations = Arc::clone(&computations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            let report = run_operation(&workload, log_events).await;

                            computations.fetch_add(report.computations, Ordering::Relaxed);
                            failures.fetch_add(report.failures, Ordering::Relaxed);
                            if let Ok(mut durations) = task_durations.lock() {
                                durations.add(task_start.elapsed().as_secs_f64());
                            }

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let durations = match task_durations.lock() {
                Ok(mut durations) => std::mem::take(&mut *durations),
                Err(_) => DDSketch::default(),
            };

            WorkloadResult {
                concurrency,
                durations,
                computations: computations.load(Ordering::Relaxed),
                failures: failures.load(Ordering::Relaxed),
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let result = task?;
        print_result(i, &result, duration);
    }

    Ok(())
}

fn print_result(i: usize, result: &WorkloadResult, duration: Duration) {
    let WorkloadResult {
        concurrency,
        durations,
        computations,
        failures,
    } = result;

    let ops = durations.count();
    let ops_ps = ops as f64 / duration.as_secs_f64();
    println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

    if ops == 0 {
        return;
    }

    let quantile = |q| {
        let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
        Duration::from_secs_f64(secs)
    };
    let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
    let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
    println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");

    let per_op = *computations as f64 / ops as f64;
    println!("  computations: {computations} ({per_op:.2} per operation); failed calls: {failures}");
}

/// A one-line summary of `workload`, printed before it runs.
pub fn describe(workload: &Workload) -> String {
    let mode = if workload.cached { "cached" } else { "uncached" };
    let outcome = if workload.fail { "failing" } else { "succeeding" };
    format!(
        "{mode}, {outcome}, fanout {} over {} identifiers, latency {}",
        workload.fanout,
        workload.identifiers,
        humantime::format_duration(workload.latency),
    )
}
