//! Stress simulation for the CPMM engine
//!
//! Runs many independent markets in parallel, each driven by simulated
//! traders, and checks after every operation that:
//! 1. **Solvency**: both pool legs stay non-negative
//! 2. **Pricing**: the implied probability stays strictly inside (0, 1)
//! 3. **Liquidity accounting**: provider weights still sum to 1
//!
//! It also reports throughput, accumulated fees, and the Brier score of the
//! final market probabilities against simulated resolutions.

use anyhow::Result;
use rand::prelude::*;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::Serialize;
use std::env;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::cpmm_core::{Market, Outcome};
use crate::error::EngineError;
use crate::liquidity::{provide_liquidity, provider_weights, LiquidityProvision};
use crate::trade::{CpmmEngine, Fees};

// Simulation Parameters (defaults; override via STRESS_* env vars)
const NUM_MARKETS: usize = 200;
const NUM_TRADERS: usize = 50;
const TRADES_PER_MARKET: usize = 1_000;
const ANTE: f64 = 100.0;
const SELL_PROBABILITY: f64 = 0.25;
const LIQUIDITY_PROBABILITY: f64 = 0.05;
const MAX_STAKE_FRACTION: f64 = 0.05; // of the smaller pool leg
const MIN_SELL_SHARES: f64 = 0.0001;
const SEED: u64 = 42;
const BENCHMARK_QUOTES: usize = 0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StressConfig {
    pub num_markets: usize,
    pub num_traders: usize,
    pub trades_per_market: usize,
    pub ante: f64,
    pub sell_probability: f64,
    pub liquidity_probability: f64,
    pub max_stake_fraction: f64,
    pub seed: u64,
    /// Quotes to time after the simulation; 0 skips the benchmark.
    pub benchmark_quotes: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            num_markets: NUM_MARKETS,
            num_traders: NUM_TRADERS,
            trades_per_market: TRADES_PER_MARKET,
            ante: ANTE,
            sell_probability: SELL_PROBABILITY,
            liquidity_probability: LIQUIDITY_PROBABILITY,
            max_stake_fraction: MAX_STAKE_FRACTION,
            seed: SEED,
            benchmark_quotes: BENCHMARK_QUOTES,
        }
    }
}

impl StressConfig {
    pub fn from_env() -> Self {
        let sell_probability =
            env_f64_clamped("STRESS_SELL_PROBABILITY", SELL_PROBABILITY, 0.0, 1.0);
        let liquidity_probability = env_f64_clamped(
            "STRESS_LIQUIDITY_PROBABILITY",
            LIQUIDITY_PROBABILITY,
            0.0,
            1.0 - sell_probability,
        );

        Self {
            num_markets: env_usize("STRESS_NUM_MARKETS", NUM_MARKETS),
            num_traders: env_usize("STRESS_NUM_TRADERS", NUM_TRADERS),
            trades_per_market: env_usize("STRESS_TRADES_PER_MARKET", TRADES_PER_MARKET),
            ante: env_f64_min("STRESS_ANTE", ANTE, f64::MIN_POSITIVE),
            sell_probability,
            liquidity_probability,
            max_stake_fraction: env_f64_clamped(
                "STRESS_MAX_STAKE_FRACTION",
                MAX_STAKE_FRACTION,
                1e-6,
                0.5,
            ),
            seed: env::var("STRESS_SEED")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(SEED),
            benchmark_quotes: env::var("STRESS_BENCHMARK_QUOTES")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(BENCHMARK_QUOTES),
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

fn env_f64_clamped(name: &str, default: f64, min: f64, max: f64) -> f64 {
    env_f64(name, default).clamp(min, max)
}

fn env_f64_min(name: &str, default: f64, min: f64) -> f64 {
    env_f64(name, default).max(min)
}

/// Aggregate results of a stress run.
#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub markets: usize,
    pub executed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub invariant_violations: u64,
    pub fees: Fees,
    pub brier_score: f64,
    pub duration_ms: u128,
    pub operations_per_second: f64,
}

/// Represents a simulated trader with a defined skill level
#[derive(Debug, Clone)]
struct TestTrader {
    id: String,
    skill: f64, // 0.0 = pure noise, 1.0 = perfect knowledge
    yes_shares: f64,
    no_shares: f64,
}

#[derive(Debug, Clone, Copy)]
enum TradeOutcome {
    Executed,
    Skipped,
}

/// Per-market tallies, merged into the report.
#[derive(Debug, Default)]
struct MarketRun {
    executed: u64,
    skipped: u64,
    failed: u64,
    invariant_violations: u64,
    fees: Fees,
    brier_score: f64,
}

/// Simulates a trader's belief based on their skill and the market's true probability
fn simulate_belief(skill: f64, true_prob: f64, noise_factor: f64) -> f64 {
    // A skilled trader's belief is closer to the true probability
    let noise = (noise_factor - 0.5) * (1.0 - skill);
    (true_prob + noise).clamp(0.01, 0.99)
}

struct MarketSimulation<'a> {
    engine: &'a CpmmEngine,
    stress: &'a StressConfig,
    rng: StdRng,
    market: Market,
    liquidities: Vec<LiquidityProvision>,
    traders: Vec<TestTrader>,
    true_prob: f64,
    run: MarketRun,
}

impl<'a> MarketSimulation<'a> {
    fn new(engine: &'a CpmmEngine, stress: &'a StressConfig, index: usize) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(stress.seed.wrapping_add(index as u64));
        // Spread hidden ground truths between 0.2 and 0.8
        let true_prob = 0.2 + (index as f64 / stress.num_markets as f64) * 0.6;
        let market = Market::from_ante(stress.ante, 0.5)?;
        let traders = (0..stress.num_traders)
            .map(|i| TestTrader {
                id: format!("trader_{i}"),
                skill: rng.gen(),
                yes_shares: 0.0,
                no_shares: 0.0,
            })
            .collect();

        Ok(Self {
            engine,
            stress,
            rng,
            market,
            liquidities: vec![LiquidityProvision::ante("creator", stress.ante)],
            traders,
            true_prob,
            run: MarketRun::default(),
        })
    }

    fn run(mut self) -> MarketRun {
        for _ in 0..self.stress.trades_per_market {
            let trader = self.rng.gen_range(0..self.traders.len());
            let roll: f64 = self.rng.gen();

            let result = if roll < self.stress.sell_probability {
                self.try_sell(trader)
            } else if roll < self.stress.sell_probability + self.stress.liquidity_probability {
                self.try_provide(trader)
            } else {
                self.try_buy(trader)
            };

            match result {
                Ok(TradeOutcome::Executed) => self.run.executed += 1,
                Ok(TradeOutcome::Skipped) => self.run.skipped += 1,
                Err(err) => {
                    self.run.failed += 1;
                    if err.is_fatal() {
                        self.run.invariant_violations += 1;
                    } else {
                        warn!("Rejected operation: {}", err);
                    }
                }
            }

            self.check_market();
        }

        self.check_weights();

        // Resolve against the hidden truth; Brier score, lower is better
        let resolved_yes = self.rng.gen_bool(self.true_prob);
        let final_prob = self.market.prob_yes();
        self.run.brier_score = (final_prob - if resolved_yes { 1.0 } else { 0.0 }).powi(2);
        self.run
    }

    fn try_buy(&mut self, trader: usize) -> Result<TradeOutcome, EngineError> {
        let noise_factor: f64 = self.rng.gen();
        let belief = simulate_belief(self.traders[trader].skill, self.true_prob, noise_factor);
        let market_prob = self.market.prob_yes();
        if (belief - market_prob).abs() < 0.01 {
            return Ok(TradeOutcome::Skipped);
        }

        let outcome = if belief > market_prob {
            Outcome::Yes
        } else {
            Outcome::No
        };
        let stake_multiplier = 0.5 + self.rng.gen::<f64>(); // 0.5 to 1.5
        let pool = self.market.pool;
        let stake = (pool.yes.min(pool.no) * self.stress.max_stake_fraction * stake_multiplier)
            .max(0.01);

        let purchase = self.engine.calculate_purchase(&self.market, stake, outcome)?;
        let holder = &mut self.traders[trader];
        match outcome {
            Outcome::Yes => holder.yes_shares += purchase.shares,
            Outcome::No => holder.no_shares += purchase.shares,
        }
        self.run.fees += purchase.fees;
        self.market = purchase.market();
        Ok(TradeOutcome::Executed)
    }

    fn try_sell(&mut self, trader: usize) -> Result<TradeOutcome, EngineError> {
        let holder = &self.traders[trader];
        let (outcome, available) = if holder.yes_shares >= holder.no_shares {
            (Outcome::Yes, holder.yes_shares)
        } else {
            (Outcome::No, holder.no_shares)
        };
        if available < MIN_SELL_SHARES {
            return Ok(TradeOutcome::Skipped);
        }

        let sell_fraction = 0.1 + self.rng.gen::<f64>() * 0.5; // 10% to 60% of holdings
        let amount = (available * sell_fraction)
            .max(MIN_SELL_SHARES)
            .min(available);

        let sale = self.engine.calculate_sale(&self.market, amount, outcome)?;
        let holder = &mut self.traders[trader];
        match outcome {
            Outcome::Yes => holder.yes_shares -= amount,
            Outcome::No => holder.no_shares -= amount,
        }
        self.run.fees += sale.fees;
        self.market = sale.market();
        Ok(TradeOutcome::Executed)
    }

    fn try_provide(&mut self, trader: usize) -> Result<TradeOutcome, EngineError> {
        let amount = self.stress.ante * self.rng.gen_range(0.05..0.25);
        let (market, provision) =
            provide_liquidity(&self.market, self.traders[trader].id.clone(), amount)?;
        self.market = market;
        self.liquidities.push(provision);
        Ok(TradeOutcome::Executed)
    }

    fn check_market(&mut self) {
        let prob = self.market.prob_yes();
        if !self.market.pool.is_non_negative() || !(prob > 0.0 && prob < 1.0) {
            error!(
                yes = self.market.pool.yes,
                no = self.market.pool.no,
                p = self.market.p,
                prob,
                "Market left a valid state"
            );
            self.run.invariant_violations += 1;
        }
    }

    fn check_weights(&mut self) {
        match provider_weights(&self.market, &self.liquidities, false) {
            Ok(weights) => {
                let total: f64 = weights.values().sum();
                if (total - 1.0).abs() > 1e-9 {
                    error!(total, "Provider weights do not sum to 1");
                    self.run.invariant_violations += 1;
                }
            }
            Err(err) => {
                error!("Provider weights failed: {}", err);
                self.run.invariant_violations += 1;
            }
        }
    }
}

/// Main stress test that simulates many independent markets under load
pub fn run_stress_test(config: &Config, stress: &StressConfig) -> Result<StressReport> {
    let engine = CpmmEngine::new(*config)?;
    let start_time = Instant::now();

    info!("🚀 Starting CPMM market simulation...");
    info!(
        "Target: {} operations ({} markets × {} operations each, {} traders per market)",
        stress.num_markets * stress.trades_per_market,
        stress.num_markets,
        stress.trades_per_market,
        stress.num_traders
    );

    let runs = (0..stress.num_markets)
        .into_par_iter()
        .map(|index| -> Result<MarketRun> {
            Ok(MarketSimulation::new(&engine, stress, index)?.run())
        })
        .collect::<Result<Vec<MarketRun>>>()?;

    let mut report = StressReport {
        markets: runs.len(),
        executed: 0,
        skipped: 0,
        failed: 0,
        invariant_violations: 0,
        fees: Fees::ZERO,
        brier_score: 0.0,
        duration_ms: 0,
        operations_per_second: 0.0,
    };
    for run in &runs {
        report.executed += run.executed;
        report.skipped += run.skipped;
        report.failed += run.failed;
        report.invariant_violations += run.invariant_violations;
        report.fees += run.fees;
        report.brier_score += run.brier_score;
    }
    if !runs.is_empty() {
        report.brier_score /= runs.len() as f64;
    }

    let duration = start_time.elapsed();
    let total = report.executed + report.skipped + report.failed;
    report.duration_ms = duration.as_millis();
    report.operations_per_second = total as f64 / duration.as_secs_f64().max(f64::MIN_POSITIVE);

    info!("🏁 Simulation finished in {:.2?}", duration);
    info!("   Executed {} operations successfully", report.executed);
    info!("   Skipped {} operations (no holdings / no edge)", report.skipped);
    info!("   Failed {} operations", report.failed);
    info!("   Performance: {:.2} operations/second", report.operations_per_second);
    info!(
        "   Fees collected: {:.4} liquidity, {:.4} platform, {:.4} creator",
        report.fees.liquidity_fee, report.fees.platform_fee, report.fees.creator_fee
    );
    info!("   Mean Brier score: {:.4}", report.brier_score);

    if report.invariant_violations > 0 {
        error!("❌ {} invariant violations detected", report.invariant_violations);
    } else {
        info!("✅ All market invariants held");
    }

    Ok(report)
}
