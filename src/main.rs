/*!
 * pszstress - Passive Serialization Stress Driver
 *
 * Boots a runtime context, then runs:
 * - one reader per CPU doing registry lookups and sequence lock reads
 * - a writer cycling track/untrack and two-word sequence lock updates
 *
 * Prints a JSON summary on stdout when done.
 */

use miette::IntoDiagnostic;
use psz_kernel::pmap::{PAGE_SIZE, PP_ATTRS_A};
use psz_kernel::{init_tracing, pserialize, PvTracker, RuntimeConfig, RuntimeContext, SeqLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Fixed range readers always find
const RESIDENT_BASE: u64 = 0x10_0000;
const RESIDENT_PAGES: u64 = 16;
/// Ranges the writer cycles through
const CHURN_BASE: u64 = 0x100_0000;
const CHURN_SLOTS: u64 = 8;
const CHURN_PAGES: u64 = 4;

#[derive(Debug, Default, Serialize)]
struct ReaderReport {
    cpu: usize,
    sections: u64,
    hits: u64,
    misses: u64,
    torn_reads: u64,
}

#[derive(Debug, Serialize)]
struct Summary {
    config: RuntimeConfig,
    cycles: u64,
    elapsed_ms: u64,
    readers: Vec<ReaderReport>,
    pserialize: psz_kernel::PserializeStats,
    xcall: psz_kernel::XcStats,
    ranges: Vec<psz_kernel::TrackedRange>,
}

/// Two words always written to the same value
#[derive(Default)]
struct Pair {
    lock: SeqLock,
    lo: AtomicU64,
    hi: AtomicU64,
}

fn stress_cycles() -> miette::Result<u64> {
    match std::env::var("PSZ_STRESS_CYCLES") {
        Ok(v) => v.trim().parse().into_diagnostic(),
        Err(_) => Ok(1000),
    }
}

fn main() -> miette::Result<()> {
    init_tracing();

    let config = RuntimeConfig::from_env()?;
    let cycles = stress_cycles()?;
    info!(ncpu = config.ncpu, cycles, "pszstress starting");

    let ctx = RuntimeContext::builder().config(config.clone()).build()?;
    ctx.start_mp()?;

    let pvt: PvTracker = PvTracker::new(ctx.clone());
    pvt.track(RESIDENT_BASE, RESIDENT_PAGES * PAGE_SIZE);

    let pair = Pair::default();
    let stop = AtomicBool::new(false);
    let started = Instant::now();

    let readers = std::thread::scope(|s| {
        let handles: Vec<_> = (0..ctx.ncpu())
            .map(|cpu| {
                let (ctx, pvt, pair, stop) = (&ctx, &pvt, &pair, &stop);
                s.spawn(move || reader(ctx, pvt, pair, stop, cpu))
            })
            .collect();

        for cycle in 0..cycles {
            let start = CHURN_BASE + (cycle % CHURN_SLOTS) * CHURN_PAGES * PAGE_SIZE;
            pvt.track(start, CHURN_PAGES * PAGE_SIZE);
            pair.lock.write(|| {
                pair.lo.store(cycle + 1, Ordering::Relaxed);
                pair.hi.store(cycle + 1, Ordering::Relaxed);
            });
            pvt.untrack(start, CHURN_PAGES * PAGE_SIZE);
        }
        stop.store(true, Ordering::Release);

        handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .collect::<Vec<_>>()
    });

    let elapsed = started.elapsed();
    let torn: u64 = readers.iter().map(|r| r.torn_reads).sum();
    if torn > 0 {
        warn!(torn, "readers observed torn sequence lock reads");
    }

    let summary = Summary {
        config,
        cycles,
        elapsed_ms: elapsed.as_millis() as u64,
        readers,
        pserialize: pserialize::stats(&ctx),
        xcall: ctx.xc_stats(),
        ranges: pvt.ranges(),
    };
    info!(
        elapsed_ms = summary.elapsed_ms,
        performs = summary.pserialize.performs,
        max_wait_ns = summary.xcall.max_wait_ns,
        "pszstress complete"
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).into_diagnostic()?
    );
    Ok(())
}

fn reader(
    ctx: &RuntimeContext,
    pvt: &PvTracker,
    pair: &Pair,
    stop: &AtomicBool,
    cpu: usize,
) -> ReaderReport {
    let mut report = ReaderReport {
        cpu,
        ..ReaderReport::default()
    };
    let curcpu = match ctx.bind(cpu) {
        Ok(curcpu) => curcpu,
        Err(e) => {
            warn!(cpu, error = %e, "reader could not bind");
            return report;
        }
    };

    let mut seed: u64 = cpu as u64;
    while !stop.load(Ordering::Acquire) {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let pa = if seed & 1 == 0 {
            RESIDENT_BASE + (seed >> 8) % (RESIDENT_PAGES * PAGE_SIZE)
        } else {
            CHURN_BASE + (seed >> 8) % (CHURN_SLOTS * CHURN_PAGES * PAGE_SIZE)
        };

        let hit = pvt.with_tracked(&curcpu, pa, |page| match page {
            Some(page) => {
                page.set_attrs(PP_ATTRS_A);
                true
            }
            None => false,
        });
        report.sections += 1;
        if hit {
            report.hits += 1;
        } else {
            report.misses += 1;
        }

        let (lo, hi) = pair.lock.read(|| {
            (
                pair.lo.load(Ordering::Relaxed),
                pair.hi.load(Ordering::Relaxed),
            )
        });
        if lo != hi {
            report.torn_reads += 1;
        }
    }
    report
}
