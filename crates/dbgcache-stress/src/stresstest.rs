use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sketches_ddsketch::DDSketch;

use dbgcache::config::Config;
use dbgcache::context::{CacheContext, TickDriver};

use crate::workloads::{WorkloadsConfig, prepare_payload, process_payload};

pub fn perform_stresstest(
    config: &Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // start the caches
    let context = Arc::new(CacheContext::new(config).context("failed to create cache context")?);
    let driver = TickDriver::spawn(Arc::clone(&context)).context("failed to start tick driver")?;

    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .map(|workload| {
            let payload = prepare_payload(&context, workload.payload)?;
            Ok((workload.concurrency.max(1), payload))
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();
        std::thread::scope(|scope| {
            for (_, workload) in &workloads {
                let context = &context;
                scope.spawn(move || process_payload(context, workload));
            }
        });
        println!("Warmup: {:?}", start.elapsed());
    }
    println!();

    // run the workloads concurrently
    let deadline = Instant::now() + duration;
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = workloads
            .iter()
            .map(|(concurrency, workload)| {
                let task_durations = Arc::new(Mutex::new(DDSketch::default()));
                for _ in 0..*concurrency {
                    let context = &context;
                    let task_durations = Arc::clone(&task_durations);
                    scope.spawn(move || {
                        let mut durations = Vec::new();
                        while Instant::now() < deadline {
                            let task_start = Instant::now();
                            process_payload(context, workload);
                            durations.push(task_start.elapsed().as_secs_f64());
                        }
                        if let Ok(mut task_durations) = task_durations.lock() {
                            for duration in durations {
                                task_durations.add(duration);
                            }
                        }
                    });
                }
                (*concurrency, task_durations)
            })
            .collect();
        handles
    });

    for (i, (concurrency, task_durations)) in results.into_iter().enumerate() {
        let task_durations = match task_durations.lock() {
            Ok(mut task_durations) => std::mem::take(&mut *task_durations),
            Err(_) => anyhow::bail!("workload {i} panicked"),
        };

        let ops = task_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    println!();
    println!(
        "Cache: {} blobs, {} pending artifact requests, {} mapped debug infos",
        context.content().blob_count(),
        context.artifacts().pending_requests(),
        context.debug_info().mapped_count(),
    );
    drop(driver);

    Ok(())
}
