//! Trade simulation: fees, purchases, and sales against a market snapshot.
//!
//! Buys have a closed form. Sales are the inverse problem and are solved by
//! bisection on the cash value that keeps `k` fixed once the shares return to
//! the pool. The liquidity fee is credited to both legs of the traded pool
//! and then reinvested again through
//! [`add_liquidity`](crate::cpmm_core::add_liquidity), which is the only
//! place `p` changes.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::Config;
use crate::cpmm_core::{
    add_liquidity, liquidity, pool_after_bet, probability, LiquidityAddition, Market, Outcome,
    Pool,
};
use crate::error::{EngineError, Result};

/// Fee amounts charged on a single trade.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Fees {
    pub liquidity_fee: f64,
    pub platform_fee: f64,
    pub creator_fee: f64,
}

impl Fees {
    pub const ZERO: Fees = Fees {
        liquidity_fee: 0.0,
        platform_fee: 0.0,
        creator_fee: 0.0,
    };

    pub fn total(&self) -> f64 {
        self.liquidity_fee + self.platform_fee + self.creator_fee
    }
}

impl Add for Fees {
    type Output = Fees;

    fn add(self, other: Fees) -> Fees {
        Fees {
            liquidity_fee: self.liquidity_fee + other.liquidity_fee,
            platform_fee: self.platform_fee + other.platform_fee,
            creator_fee: self.creator_fee + other.creator_fee,
        }
    }
}

impl AddAssign for Fees {
    fn add_assign(&mut self, other: Fees) {
        *self = *self + other;
    }
}

/// Fees for a prospective trade and what is left of the stake after them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeQuote {
    pub remaining_bet: f64,
    pub total_fees: f64,
    pub fees: Fees,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub shares: f64,
    pub new_pool: Pool,
    pub new_p: f64,
    pub fees: Fees,
}

impl Purchase {
    pub fn market(&self) -> Market {
        Market {
            pool: self.new_pool,
            p: self.new_p,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    pub sale_value: f64,
    pub new_pool: Pool,
    pub new_p: f64,
    pub fees: Fees,
}

impl Sale {
    pub fn market(&self) -> Market {
        Market {
            pool: self.new_pool,
            p: self.new_p,
        }
    }
}

/// Stateless pricing engine carrying the immutable fee and solver settings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CpmmEngine {
    config: Config,
}

impl CpmmEngine {
    pub fn new(config: Config) -> Result<Self> {
        config.fees.validate()?;
        if config.solver.max_iterations == 0 {
            return Err(EngineError::invalid("solver max_iterations must be positive"));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// YES probability after a fee-free bet of `bet` on `outcome`.
    pub fn probability_after_bet_before_fees(
        &self,
        market: &Market,
        outcome: Outcome,
        bet: f64,
    ) -> f64 {
        let Market { pool, p } = *market;
        probability(&pool_after_bet(&pool, p, bet, outcome), p)
    }

    /// Fees on the fair-value fraction of `bet`: each rate times the
    /// post-trade (pre-fee) probability of the bought outcome times `bet`.
    pub fn calculate_fees(&self, market: &Market, bet: f64, outcome: Outcome) -> FeeQuote {
        let prob_yes = self.probability_after_bet_before_fees(market, outcome, bet);
        let bet_p = match outcome {
            Outcome::Yes => prob_yes,
            Outcome::No => 1.0 - prob_yes,
        };

        let rates = &self.config.fees;
        let fees = Fees {
            liquidity_fee: rates.liquidity_fee * bet_p * bet,
            platform_fee: rates.platform_fee * bet_p * bet,
            creator_fee: rates.creator_fee * bet_p * bet,
        };
        let total_fees = fees.total();

        FeeQuote {
            remaining_bet: bet - total_fees,
            total_fees,
            fees,
        }
    }

    /// Shares a bet of `bet` on `outcome` would receive after fees.
    pub fn shares_after_fees(&self, market: &Market, bet: f64, outcome: Outcome) -> Result<f64> {
        Ok(self.calculate_purchase(market, bet, outcome)?.shares)
    }

    /// Probability of `outcome` itself once the full purchase has settled.
    ///
    /// Read from the settled pool under its re-solved `new_p`, not the
    /// pre-trade weight, so the quote agrees with the market the purchase
    /// actually leaves behind.
    pub fn outcome_probability_after_bet(
        &self,
        market: &Market,
        outcome: Outcome,
        bet: f64,
    ) -> Result<f64> {
        let prob_yes = self.calculate_purchase(market, bet, outcome)?.market().prob_yes();
        Ok(match outcome {
            Outcome::Yes => prob_yes,
            Outcome::No => 1.0 - prob_yes,
        })
    }

    /// YES probability once a sale of `shares` has settled, read under the
    /// post-sale `new_p` rather than the pre-trade weight.
    pub fn probability_after_sale(
        &self,
        market: &Market,
        shares: f64,
        outcome: Outcome,
    ) -> Result<f64> {
        Ok(self.calculate_sale(market, shares, outcome)?.market().prob_yes())
    }

    pub fn calculate_purchase(&self, market: &Market, bet: f64, outcome: Outcome) -> Result<Purchase> {
        market.validate()?;
        validate_amount("bet", bet)?;

        let FeeQuote {
            remaining_bet,
            fees,
            ..
        } = self.calculate_fees(market, bet, outcome);
        // Bought leg comes from `k`, never from `y + remaining_bet - shares`.
        let traded_pool = pool_after_bet(&market.pool, market.p, remaining_bet, outcome);
        let shares = market.pool.get(outcome) + remaining_bet - traded_pool.get(outcome);
        let context = || market.diagnostics(Some(outcome), bet);

        if !shares.is_finite() || shares < 0.0 {
            return Err(EngineError::violation(
                format!("purchase produced {shares} shares"),
                context(),
            ));
        }
        if !traded_pool.is_non_negative() {
            return Err(EngineError::violation(
                format!("purchase would leave pool at {traded_pool}"),
                context(),
            ));
        }
        self.check_invariant(market, &traded_pool, || context())?;

        let post_bet_pool = traded_pool.add_both(fees.liquidity_fee);
        let LiquidityAddition { new_pool, new_p, .. } =
            add_liquidity(&post_bet_pool, market.p, fees.liquidity_fee)?;

        debug!(
            outcome = %outcome,
            bet,
            shares,
            total_fees = fees.total(),
            new_yes = new_pool.yes,
            new_no = new_pool.no,
            new_p,
            "Simulated CPMM purchase"
        );

        Ok(Purchase {
            shares,
            new_pool,
            new_p,
            fees,
        })
    }

    pub fn calculate_sale(&self, market: &Market, shares: f64, outcome: Outcome) -> Result<Sale> {
        market.validate()?;
        validate_amount("shares", shares)?;

        let raw_sale_value = self.calculate_share_value(market, shares, outcome)?;

        // Selling `outcome` moves the price like buying the opposite side.
        let FeeQuote {
            remaining_bet: sale_value,
            fees,
            ..
        } = self.calculate_fees(market, raw_sale_value, outcome.opposite());

        let traded_pool = market.pool.add_both(-sale_value).add_to(outcome, shares);
        if !traded_pool.is_non_negative() {
            return Err(EngineError::violation(
                format!("cannot sell more than in pool, sale would leave {traded_pool} (sale value {sale_value})"),
                market.diagnostics(Some(outcome), shares),
            ));
        }

        let post_sale_pool = traded_pool.add_both(fees.liquidity_fee);

        let LiquidityAddition { new_pool, new_p, .. } =
            add_liquidity(&post_sale_pool, market.p, fees.liquidity_fee)?;

        debug!(
            outcome = %outcome,
            shares,
            raw_sale_value,
            sale_value,
            total_fees = fees.total(),
            new_yes = new_pool.yes,
            new_no = new_pool.no,
            new_p,
            "Simulated CPMM sale"
        );

        Ok(Sale {
            sale_value,
            new_pool,
            new_p,
            fees,
        })
    }

    /// Pre-fee cash value of `shares`: the `x` for which removing `x` from
    /// both legs and returning the shares to their leg keeps `k` fixed.
    ///
    /// The value is capped at both the share count (a share never pays more
    /// than 1) and the opposite reserve (which must not go negative); without
    /// the cap the equation has more than one root.
    fn calculate_share_value(&self, market: &Market, shares: f64, outcome: Outcome) -> Result<f64> {
        let Market { pool, p } = *market;
        let solver = &self.config.solver;

        let k = liquidity(&pool, p);
        let sale_k = |value: f64| liquidity(&pool.add_both(-value).add_to(outcome, shares), p);

        let mut low = 0.0;
        let mut high = shares.min(pool.get(outcome.opposite()));
        let min_width = solver.epsilon * high;

        for iteration in 0..solver.max_iterations {
            let mid = low + (high - low) / 2.0;

            if mid == low || mid == high || high - low <= min_width {
                let residual = (sale_k(mid) - k).abs();
                trace!(iteration, mid, residual, "Sale bisection converged");
                if residual > solver.invariant_tolerance * k {
                    return Err(EngineError::violation(
                        format!("no sale value preserves k={k} (closest value {mid} misses by {residual})"),
                        market.diagnostics(Some(outcome), shares),
                    ));
                }
                return Ok(mid);
            }

            if sale_k(mid) < k {
                high = mid;
            } else {
                low = mid;
            }
        }

        tracing::error!(
            iterations = solver.max_iterations,
            low,
            high,
            yes = pool.yes,
            no = pool.no,
            p,
            shares,
            "Sale bisection hit the iteration cap"
        );
        Err(EngineError::NonConvergence {
            iterations: solver.max_iterations,
            low,
            high,
        })
    }

    fn check_invariant(
        &self,
        market: &Market,
        traded: &Pool,
        context: impl Fn() -> crate::error::Diagnostics,
    ) -> Result<()> {
        let k_before = market.liquidity();
        let k_after = liquidity(traded, market.p);
        let drift = (k_after - k_before).abs();
        if !k_after.is_finite() || drift > self.config.solver.invariant_tolerance * k_before {
            return Err(EngineError::violation(
                format!("k drifted from {k_before} to {k_after}"),
                context(),
            ));
        }
        Ok(())
    }
}

fn validate_amount(name: &str, amount: f64) -> Result<()> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(EngineError::invalid(format!("{name} must be positive, got {amount}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeeSchedule, SolverConfig};

    fn engine(liquidity_fee: f64, platform_fee: f64, creator_fee: f64) -> CpmmEngine {
        CpmmEngine::new(Config {
            fees: FeeSchedule::new(liquidity_fee, platform_fee, creator_fee).unwrap(),
            solver: SolverConfig::default(),
        })
        .unwrap()
    }

    fn even_market() -> Market {
        Market::new(Pool::new(100.0, 100.0), 0.5).unwrap()
    }

    #[test]
    fn purchase_matches_closed_form_reference() {
        let engine = engine(0.01, 0.0, 0.02);
        let purchase = engine
            .calculate_purchase(&even_market(), 10.0, Outcome::Yes)
            .unwrap();

        // Reference computation, step by step.
        let (y, n, p, bet) = (100.0f64, 100.0f64, 0.5f64, 10.0f64);
        let k = y.powf(p) * n.powf(1.0 - p);
        let fee_free_shares = y + bet - (k * (bet + n).powf(p - 1.0)).powf(1.0 / p);
        let (fy, fn_) = (y - fee_free_shares + bet, n + bet);
        let prob_yes = p * fn_ / ((1.0 - p) * fy + p * fn_);
        let liquidity_fee = 0.01 * prob_yes * bet;
        let creator_fee = 0.02 * prob_yes * bet;
        let remaining = bet - (liquidity_fee + creator_fee);
        let shares = y + remaining - (k * (remaining + n).powf(p - 1.0)).powf(1.0 / p);
        let (ty, tn) = (y - shares + remaining, n + remaining);
        // Fee credited to both legs, then reinvested as liquidity.
        let (fy, fn_) = (ty + liquidity_fee, tn + liquidity_fee);
        let prob = p * fn_ / ((1.0 - p) * fy + p * fn_);
        let new_p = prob * (liquidity_fee + fy)
            / (liquidity_fee - fn_ * (prob - 1.0) + prob * fy);

        assert!((purchase.shares - shares).abs() < 1e-12);
        assert!((purchase.shares - 18.790706089231960).abs() < 1e-9);
        assert!((purchase.fees.liquidity_fee - liquidity_fee).abs() < 1e-15);
        assert!((purchase.fees.creator_fee - creator_fee).abs() < 1e-15);
        assert_eq!(purchase.fees.platform_fee, 0.0);
        assert!((purchase.new_pool.yes - (ty + 2.0 * liquidity_fee)).abs() < 1e-12);
        assert!((purchase.new_pool.no - (tn + 2.0 * liquidity_fee)).abs() < 1e-12);
        assert!((purchase.new_pool.yes - 91.15454277954632).abs() < 1e-9);
        assert!((purchase.new_pool.no - 109.94524886877828).abs() < 1e-9);
        assert!((purchase.new_p - new_p).abs() < 1e-12);
        assert!((purchase.new_p - 0.5000256779323565).abs() < 1e-9);

        let new_prob = purchase.market().prob_yes();
        assert!(new_prob > 0.5);
        assert!((new_prob - prob).abs() < 1e-9);
        assert!((new_prob - 0.5467453083097853).abs() < 1e-9);
    }

    #[test]
    fn huge_bets_keep_invariant() {
        let engine = CpmmEngine::default();
        let market = even_market();
        for bet in [1e7, 1e8, 1e10] {
            for outcome in [Outcome::Yes, Outcome::No] {
                let purchase = engine.calculate_purchase(&market, bet, outcome).unwrap();
                assert!(purchase.shares > 0.0 && purchase.shares.is_finite());
                assert!(purchase.new_pool.yes > 0.0 && purchase.new_pool.no > 0.0);
                assert!(purchase.new_p > 0.0 && purchase.new_p < 1.0);
            }
        }
    }

    #[test]
    fn empty_leg_market_is_rejected_before_pricing() {
        let engine = CpmmEngine::default();
        let market = Market {
            pool: Pool::new(0.0, 10.0),
            p: 0.5,
        };
        for outcome in [Outcome::Yes, Outcome::No] {
            let err = engine.calculate_purchase(&market, 1.0, outcome).unwrap_err();
            assert!(matches!(err, EngineError::InvalidInput(_)), "{err}");
            let err = engine.calculate_sale(&market, 1.0, outcome).unwrap_err();
            assert!(matches!(err, EngineError::InvalidInput(_)), "{err}");
        }
    }

    #[test]
    fn quotes_read_the_settled_market() {
        let engine = engine(0.01, 0.0, 0.02);
        let market = Market::new(Pool::new(80.0, 120.0), 0.4).unwrap();

        let purchase = engine.calculate_purchase(&market, 15.0, Outcome::Yes).unwrap();
        let quoted = engine
            .outcome_probability_after_bet(&market, Outcome::Yes, 15.0)
            .unwrap();
        assert_eq!(quoted, probability(&purchase.new_pool, purchase.new_p));

        let sale = engine.calculate_sale(&market, 6.0, Outcome::No).unwrap();
        let quoted = engine.probability_after_sale(&market, 6.0, Outcome::No).unwrap();
        assert_eq!(quoted, probability(&sale.new_pool, sale.new_p));
    }

    #[test]
    fn fee_split_sums_exactly() {
        let engine = engine(0.013, 0.007, 0.021);
        for outcome in [Outcome::Yes, Outcome::No] {
            let quote = engine.calculate_fees(&even_market(), 25.0, outcome);
            let fees = quote.fees;
            assert_eq!(
                fees.liquidity_fee + fees.platform_fee + fees.creator_fee,
                quote.total_fees
            );
            assert_eq!(quote.remaining_bet, 25.0 - quote.total_fees);

            // Every fee is its rate times one shared base.
            let base = fees.liquidity_fee / 0.013;
            assert!((fees.platform_fee - 0.007 * base).abs() < 1e-12);
            assert!((fees.creator_fee - 0.021 * base).abs() < 1e-12);
        }
    }

    #[test]
    fn zero_fee_purchase_keeps_weight() {
        let engine = engine(0.0, 0.0, 0.0);
        let market = Market::new(Pool::new(40.0, 90.0), 0.35).unwrap();
        let purchase = engine.calculate_purchase(&market, 12.0, Outcome::No).unwrap();
        assert_eq!(purchase.fees, Fees::ZERO);
        assert!((purchase.new_p - 0.35).abs() < 1e-12);
        let k = market.liquidity();
        assert!((purchase.market().liquidity() - k).abs() / k < 1e-12);
    }

    #[test]
    fn buying_no_lowers_yes_probability() {
        let engine = CpmmEngine::default();
        let market = even_market();
        let purchase = engine.calculate_purchase(&market, 10.0, Outcome::No).unwrap();
        assert!(purchase.shares > 0.0);
        assert!(purchase.market().prob_yes() < market.prob_yes());
        let prob_no = engine
            .outcome_probability_after_bet(&market, Outcome::No, 10.0)
            .unwrap();
        assert!((prob_no - (1.0 - purchase.market().prob_yes())).abs() < 1e-15);
    }

    #[test]
    fn round_trip_loses_fees() {
        let engine = engine(0.01, 0.0, 0.02);
        let purchase = engine
            .calculate_purchase(&even_market(), 10.0, Outcome::Yes)
            .unwrap();
        let sale = engine
            .calculate_sale(&purchase.market(), purchase.shares, Outcome::Yes)
            .unwrap();

        assert!(sale.sale_value > 0.0);
        assert!(sale.sale_value < 10.0, "sale_value={}", sale.sale_value);
        assert!((sale.sale_value - 9.686925654748698).abs() < 1e-6);
        assert!((sale.new_pool.yes - 100.35753724011084).abs() < 1e-6);
        assert!((sale.new_pool.no - 100.35753724011084).abs() < 1e-6);
        assert!(sale.new_pool.is_non_negative());
    }

    #[test]
    fn fee_free_round_trip_restores_pool() {
        let engine = engine(0.0, 0.0, 0.0);
        let market = Market::new(Pool::new(60.0, 140.0), 0.55).unwrap();
        let purchase = engine.calculate_purchase(&market, 20.0, Outcome::No).unwrap();
        let sale = engine
            .calculate_sale(&purchase.market(), purchase.shares, Outcome::No)
            .unwrap();

        assert!((sale.sale_value - 20.0).abs() < 1e-9);
        assert!((sale.new_pool.yes - market.pool.yes).abs() < 1e-9);
        assert!((sale.new_pool.no - market.pool.no).abs() < 1e-9);
    }

    #[test]
    fn sale_value_preserves_invariant() {
        let engine = engine(0.0, 0.0, 0.0);
        let market = Market::new(Pool::new(75.0, 30.0), 0.6).unwrap();
        let sale = engine.calculate_sale(&market, 8.0, Outcome::Yes).unwrap();
        let k = market.liquidity();
        assert!((sale.market().liquidity() - k).abs() / k < 1e-12);
        assert!(engine.probability_after_sale(&market, 8.0, Outcome::Yes).unwrap() < market.prob_yes());
    }

    #[test]
    fn overselling_is_an_invariant_violation() {
        let engine = CpmmEngine::default();
        let err = engine
            .calculate_sale(&even_market(), 1e20, Outcome::Yes)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation { .. }), "{err}");
        assert!(err.is_fatal());
    }

    #[test]
    fn iteration_cap_reports_non_convergence() {
        let engine = CpmmEngine::new(Config {
            fees: FeeSchedule::default(),
            solver: SolverConfig {
                max_iterations: 1,
                ..SolverConfig::default()
            },
        })
        .unwrap();
        let err = engine
            .calculate_sale(&even_market(), 5.0, Outcome::No)
            .unwrap_err();
        assert!(matches!(err, EngineError::NonConvergence { iterations: 1, .. }), "{err}");
    }

    #[test]
    fn coarse_epsilon_still_converges() {
        let engine = CpmmEngine::new(Config {
            fees: FeeSchedule::ZERO,
            solver: SolverConfig {
                epsilon: 1e-12,
                ..SolverConfig::default()
            },
        })
        .unwrap();
        let sale = engine.calculate_sale(&even_market(), 5.0, Outcome::No).unwrap();
        assert!(sale.sale_value > 0.0 && sale.sale_value < 5.0);
    }

    #[test]
    fn rejects_invalid_amounts() {
        let engine = CpmmEngine::default();
        let market = even_market();
        for amount in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = engine.calculate_purchase(&market, amount, Outcome::Yes).unwrap_err();
            assert!(matches!(err, EngineError::InvalidInput(_)));
            let err = engine.calculate_sale(&market, amount, Outcome::Yes).unwrap_err();
            assert!(matches!(err, EngineError::InvalidInput(_)));
        }

        let bad_weight = Market {
            pool: Pool::new(10.0, 10.0),
            p: 1.5,
        };
        let err = engine.calculate_purchase(&bad_weight, 1.0, Outcome::Yes).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn engine_rejects_invalid_schedule() {
        let config = Config {
            fees: FeeSchedule {
                liquidity_fee: 0.6,
                platform_fee: 0.6,
                creator_fee: 0.0,
            },
            solver: SolverConfig::default(),
        };
        assert!(CpmmEngine::new(config).is_err());
    }

    #[test]
    fn fees_accumulate() {
        let mut total = Fees::ZERO;
        total += Fees {
            liquidity_fee: 1.0,
            platform_fee: 2.0,
            creator_fee: 3.0,
        };
        total += Fees {
            liquidity_fee: 0.5,
            platform_fee: 0.0,
            creator_fee: 0.25,
        };
        assert_eq!(total.liquidity_fee, 1.5);
        assert_eq!(total.total(), 6.75);
    }
}
