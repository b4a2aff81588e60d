// Simple benchmark for sequential vs parallel CPMM quoting
use anyhow::{bail, Result};
use rand::prelude::*;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::Serialize;
use std::time::Instant;
use tracing::info;

use crate::config::Config;
use crate::cpmm_core::{Market, Outcome, Pool};
use crate::trade::CpmmEngine;

const ITERATIONS: u32 = 3;
const SEED: u64 = 7;

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub quotes: usize,
    pub sequential_ms: f64,
    pub parallel_ms: f64,
    pub speedup: f64,
}

/// Independent market snapshots with a bet to quote against each.
fn sample_quotes(count: usize) -> Result<Vec<(Market, f64, Outcome)>> {
    let mut rng = StdRng::seed_from_u64(SEED);
    (0..count)
        .map(|_| -> Result<(Market, f64, Outcome)> {
            let pool = Pool::new(rng.gen_range(10.0..10_000.0), rng.gen_range(10.0..10_000.0));
            let market = Market::new(pool, rng.gen_range(0.05..0.95))?;
            let bet = pool.yes.min(pool.no) * rng.gen_range(0.001..0.2);
            let outcome = if rng.gen_bool(0.5) {
                Outcome::Yes
            } else {
                Outcome::No
            };
            Ok((market, bet, outcome))
        })
        .collect()
}

/// Buy then immediately sell the shares back; exercises both the closed form
/// and the bisection solver. Returns the round-trip sale value.
fn round_trip(engine: &CpmmEngine, market: &Market, bet: f64, outcome: Outcome) -> Result<f64> {
    let purchase = engine.calculate_purchase(market, bet, outcome)?;
    let sale = engine.calculate_sale(&purchase.market(), purchase.shares, outcome)?;
    Ok(sale.sale_value)
}

fn benchmark_sequential(engine: &CpmmEngine, quotes: &[(Market, f64, Outcome)]) -> Result<(f64, Vec<f64>)> {
    let start = Instant::now();
    let values = quotes
        .iter()
        .map(|(market, bet, outcome)| round_trip(engine, market, *bet, *outcome))
        .collect::<Result<Vec<_>>>()?;
    Ok((start.elapsed().as_secs_f64() * 1000.0, values))
}

fn benchmark_parallel(engine: &CpmmEngine, quotes: &[(Market, f64, Outcome)]) -> Result<(f64, Vec<f64>)> {
    let start = Instant::now();
    let values = quotes
        .par_iter()
        .map(|(market, bet, outcome)| round_trip(engine, market, *bet, *outcome))
        .collect::<Result<Vec<_>>>()?;
    Ok((start.elapsed().as_secs_f64() * 1000.0, values))
}

/// Run the benchmark comparing sequential and rayon-parallel quoting
pub fn run_quote_benchmark(config: &Config, count: usize) -> Result<BenchmarkReport> {
    let engine = CpmmEngine::new(*config)?;
    let quotes = sample_quotes(count)?;

    info!("🔥 QUOTE BENCHMARK: {} buy/sell round trips", count);

    let mut sequential_times = Vec::new();
    let mut parallel_times = Vec::new();

    for iteration in 1..=ITERATIONS {
        let (sequential_ms, sequential_values) = benchmark_sequential(&engine, &quotes)?;
        let (parallel_ms, parallel_values) = benchmark_parallel(&engine, &quotes)?;

        // Pure functions: thread scheduling must not change a single bit
        if sequential_values != parallel_values {
            bail!("parallel quotes diverged from sequential quotes in iteration {iteration}");
        }

        info!(
            "Iteration {}: sequential {:.2}ms, parallel {:.2}ms",
            iteration, sequential_ms, parallel_ms
        );
        sequential_times.push(sequential_ms);
        parallel_times.push(parallel_ms);
    }

    let avg_sequential = sequential_times.iter().sum::<f64>() / sequential_times.len() as f64;
    let avg_parallel = parallel_times.iter().sum::<f64>() / parallel_times.len() as f64;
    let speedup = if avg_parallel > 0.0 {
        avg_sequential / avg_parallel
    } else {
        1.0
    };

    info!("📊 Sequential average: {:.2}ms", avg_sequential);
    info!("📊 Parallel average:   {:.2}ms ({:.1}x)", avg_parallel, speedup);

    Ok(BenchmarkReport {
        quotes: count,
        sequential_ms: avg_sequential,
        parallel_ms: avg_parallel,
        speedup,
    })
}
