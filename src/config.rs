//! Configuration management for the CPMM engine
//! Supports environment variables and default values for fee rates and solver tunables

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::{EngineError, Result};

/// Configuration for the CPMM engine
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    /// Proportional fee rates applied to every trade
    pub fees: FeeSchedule,

    /// Bisection and invariant-check tunables
    pub solver: SolverConfig,
}

/// Fee rates, each a fraction of the fair-value portion of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Reinvested into the pool as new liquidity (default: 0.01)
    pub liquidity_fee: f64,

    /// Removed from the system for the platform (default: 0.0)
    pub platform_fee: f64,

    /// Removed from the system for the market creator (default: 0.02)
    pub creator_fee: f64,
}

impl FeeSchedule {
    pub const ZERO: FeeSchedule = FeeSchedule {
        liquidity_fee: 0.0,
        platform_fee: 0.0,
        creator_fee: 0.0,
    };

    pub fn new(liquidity_fee: f64, platform_fee: f64, creator_fee: f64) -> Result<Self> {
        let schedule = Self {
            liquidity_fee,
            platform_fee,
            creator_fee,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn total_rate(&self) -> f64 {
        self.liquidity_fee + self.platform_fee + self.creator_fee
    }

    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("liquidity_fee", self.liquidity_fee),
            ("platform_fee", self.platform_fee),
            ("creator_fee", self.creator_fee),
        ] {
            if !rate.is_finite() || !(0.0..1.0).contains(&rate) {
                return Err(EngineError::invalid(format!(
                    "{name} must be in [0, 1), got {rate}"
                )));
            }
        }
        if self.total_rate() >= 1.0 {
            return Err(EngineError::invalid(format!(
                "fee rates must sum to less than 1, got {}",
                self.total_rate()
            )));
        }
        Ok(())
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            liquidity_fee: 0.01,
            platform_fee: 0.0,
            creator_fee: 0.02,
        }
    }
}

/// Tunables for the sale-value bisection and post-trade invariant checks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Hard cap on bisection iterations (default: 2048)
    pub max_iterations: usize,

    /// Stop once the bracket is narrower than `epsilon` times the initial
    /// upper bound (default: f64::EPSILON, i.e. the precision limit)
    pub epsilon: f64,

    /// Allowed relative drift of `k` across a trade (default: 1e-7)
    pub invariant_tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2048,
            epsilon: f64::EPSILON,
            invariant_tolerance: 1e-7,
        }
    }
}

impl Config {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(rate) = env_parse("CPMM_LIQUIDITY_FEE") {
            config.fees.liquidity_fee = rate;
        }
        if let Some(rate) = env_parse("CPMM_PLATFORM_FEE") {
            config.fees.platform_fee = rate;
        }
        if let Some(rate) = env_parse("CPMM_CREATOR_FEE") {
            config.fees.creator_fee = rate;
        }

        if let Some(max_iterations) = env_parse("CPMM_SOLVER_MAX_ITERATIONS") {
            config.solver.max_iterations = max_iterations;
        }
        if let Some(epsilon) = env_parse("CPMM_SOLVER_EPSILON") {
            config.solver.epsilon = epsilon;
        }
        if let Some(tolerance) = env_parse("CPMM_INVARIANT_TOLERANCE") {
            config.solver.invariant_tolerance = tolerance;
        }

        config.validate();

        config
    }

    /// Validate configuration values, falling back to defaults
    fn validate(&mut self) {
        if let Err(e) = self.fees.validate() {
            warn!("Invalid fee schedule ({}), using defaults", e);
            self.fees = FeeSchedule::default();
        }

        if self.solver.max_iterations == 0 {
            warn!("Invalid solver max_iterations: 0, using default");
            self.solver.max_iterations = SolverConfig::default().max_iterations;
        }

        if !(self.solver.epsilon >= 0.0 && self.solver.epsilon < 1.0) {
            warn!("Invalid solver epsilon: {}, using default", self.solver.epsilon);
            self.solver.epsilon = SolverConfig::default().epsilon;
        }

        if !(self.solver.invariant_tolerance > 0.0 && self.solver.invariant_tolerance < 1.0) {
            warn!(
                "Invalid invariant tolerance: {}, using default",
                self.solver.invariant_tolerance
            );
            self.solver.invariant_tolerance = SolverConfig::default().invariant_tolerance;
        }
    }

    /// Log current configuration for debugging
    pub fn log_config(&self) {
        info!("CPMM Engine Configuration:");
        info!("   Liquidity Fee: {}", self.fees.liquidity_fee);
        info!("   Platform Fee: {}", self.fees.platform_fee);
        info!("   Creator Fee: {}", self.fees.creator_fee);
        info!("   Solver Max Iterations: {}", self.solver.max_iterations);
        info!("   Solver Epsilon: {:e}", self.solver.epsilon);
        info!("   Invariant Tolerance: {:e}", self.solver.invariant_tolerance);
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}
