//! src/cpmm_core.rs
//! Weighted constant-product market maker core: pool types, pricing, the
//! invariant `k = YES^p * NO^(1-p)`, and liquidity injection.
//!
//! Everything here is a pure function over `Copy` snapshots.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Diagnostics, EngineError, Result};

/// Tolerance for the probability check after a liquidity injection.
const PROBABILITY_TOLERANCE: f64 = 1e-9;

/// Binary market outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "YES",
            Outcome::No => "NO",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

impl FromStr for Outcome {
    type Err = EngineError;

    /// Parse from string (API boundary conversion)
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "yes" => Ok(Outcome::Yes),
            "no" => Ok(Outcome::No),
            _ => Err(EngineError::invalid(format!(
                "invalid outcome: '{s}', expected 'YES' or 'NO'"
            ))),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// YES/NO reserves held by the market maker.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pool {
    #[serde(rename = "YES")]
    pub yes: f64,
    #[serde(rename = "NO")]
    pub no: f64,
}

impl Pool {
    pub const EMPTY: Pool = Pool { yes: 0.0, no: 0.0 };

    pub const fn new(yes: f64, no: f64) -> Self {
        Self { yes, no }
    }

    pub fn get(&self, outcome: Outcome) -> f64 {
        match outcome {
            Outcome::Yes => self.yes,
            Outcome::No => self.no,
        }
    }

    /// Adds `amount` to both legs.
    pub fn add_both(&self, amount: f64) -> Self {
        Self::new(self.yes + amount, self.no + amount)
    }

    /// Adds `amount` to the `outcome` leg only.
    pub fn add_to(&self, outcome: Outcome, amount: f64) -> Self {
        match outcome {
            Outcome::Yes => Self::new(self.yes + amount, self.no),
            Outcome::No => Self::new(self.yes, self.no + amount),
        }
    }

    pub fn scale(&self, factor: f64) -> Self {
        Self::new(self.yes * factor, self.no * factor)
    }

    pub fn is_non_negative(&self) -> bool {
        self.yes >= 0.0 && self.no >= 0.0
    }

    /// Rejects non-finite or negative legs and the all-empty pool.
    pub fn validate(&self) -> Result<()> {
        if !self.yes.is_finite() || !self.no.is_finite() {
            return Err(EngineError::invalid(format!("pool has non-finite reserves: {self}")));
        }
        if !self.is_non_negative() {
            return Err(EngineError::invalid(format!("pool has negative reserves: {self}")));
        }
        if self.yes == 0.0 && self.no == 0.0 {
            return Err(EngineError::invalid("pool has no reserves"));
        }
        Ok(())
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{YES: {}, NO: {}}}", self.yes, self.no)
    }
}

/// Market snapshot: reserves plus the invariant weight `p`.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub pool: Pool,
    pub p: f64,
}

impl fmt::Debug for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Market")
            .field("pool", &self.pool)
            .field("p", &self.p)
            .field("prob_yes", &probability(&self.pool, self.p))
            .finish()
    }
}

impl Market {
    pub fn new(pool: Pool, p: f64) -> Result<Self> {
        let market = Self { pool, p };
        market.validate()?;
        Ok(market)
    }

    /// Seeds a market with `ante` on both legs. Equal reserves make the
    /// opening probability equal to `p`.
    pub fn from_ante(ante: f64, initial_probability: f64) -> Result<Self> {
        if !ante.is_finite() || ante <= 0.0 {
            return Err(EngineError::invalid(format!("ante must be positive, got {ante}")));
        }
        Self::new(Pool::new(ante, ante), initial_probability)
    }

    /// A tradable market needs both legs strictly positive; an empty leg
    /// pins the probability at 0 or 1.
    pub fn validate(&self) -> Result<()> {
        validate_weight(self.p)?;
        self.pool.validate()?;
        if self.pool.yes == 0.0 || self.pool.no == 0.0 {
            return Err(EngineError::invalid(format!(
                "market pool has an empty leg: {}",
                self.pool
            )));
        }
        Ok(())
    }

    /// Convenience accessor.
    pub fn prob_yes(&self) -> f64 {
        probability(&self.pool, self.p)
    }

    pub fn liquidity(&self) -> f64 {
        liquidity(&self.pool, self.p)
    }

    pub(crate) fn diagnostics(&self, outcome: Option<Outcome>, amount: f64) -> Diagnostics {
        Diagnostics {
            pool: self.pool,
            p: self.p,
            outcome,
            amount,
        }
    }
}

pub(crate) fn validate_weight(p: f64) -> Result<()> {
    if p.is_finite() && p > 0.0 && p < 1.0 {
        Ok(())
    } else {
        Err(EngineError::invalid(format!("weight p must be in (0, 1), got {p}")))
    }
}

/// Implied YES probability: `p*NO / ((1-p)*YES + p*NO)`.
#[inline]
pub fn probability(pool: &Pool, p: f64) -> f64 {
    (p * pool.no) / ((1.0 - p) * pool.yes + p * pool.no)
}

/// The invariant `k = YES^p * NO^(1-p)`.
#[inline]
pub fn liquidity(pool: &Pool, p: f64) -> f64 {
    pool.yes.powf(p) * pool.no.powf(1.0 - p)
}

/// Reserves after a fee-free bet of `bet` on `outcome`: `bet` lands on the
/// opposite leg and the bought leg is solved directly from `k`.
///
/// For YES: yes' = (k * (b+n)^(p-1))^(1/p)
/// For NO:  no'  = (k * (b+y)^(-p))^(1/(1-p))
#[inline]
pub fn pool_after_bet(pool: &Pool, p: f64, bet: f64, outcome: Outcome) -> Pool {
    let Pool { yes: y, no: n } = *pool;
    let k = liquidity(pool, p);
    match outcome {
        Outcome::Yes => Pool::new((k * (bet + n).powf(p - 1.0)).powf(1.0 / p), n + bet),
        Outcome::No => Pool::new(y + bet, (k * (bet + y).powf(-p)).powf(1.0 / (1.0 - p))),
    }
}

/// Closed-form shares for a fee-free bet of `bet` on `outcome`: the value
/// that keeps `k` fixed once `bet` is added to both legs and `shares` leave
/// the bought leg.
#[inline]
pub fn calculate_shares(pool: &Pool, p: f64, bet: f64, outcome: Outcome) -> f64 {
    pool.get(outcome) + bet - pool_after_bet(pool, p, bet, outcome).get(outcome)
}

/// Result of a symmetric liquidity injection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiquidityAddition {
    pub new_pool: Pool,
    /// Growth of `k` under the new weight; the provider's liquidity shares.
    pub liquidity: f64,
    pub new_p: f64,
}

/// Adds `amount` to both legs and re-solves `p` so the probability is
/// unchanged.
pub fn add_liquidity(pool: &Pool, p: f64, amount: f64) -> Result<LiquidityAddition> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(EngineError::invalid(format!(
            "liquidity amount must be non-negative, got {amount}"
        )));
    }
    validate_weight(p)?;
    pool.validate()?;

    let prob = probability(pool, p);
    let Pool { yes: y, no: n } = *pool;

    // p(n+a) / ((1-p)(y+a) + p(n+a)) = prob, solved for p
    let numerator = prob * (amount + y);
    let denominator = amount - n * (prob - 1.0) + prob * y;
    let new_p = numerator / denominator;

    let new_pool = pool.add_both(amount);
    let old_liquidity = liquidity(pool, new_p);
    let new_liquidity = liquidity(&new_pool, new_p);

    let context = || Diagnostics {
        pool: *pool,
        p,
        outcome: None,
        amount,
    };
    if !new_p.is_finite() || new_p <= 0.0 || new_p >= 1.0 {
        return Err(EngineError::violation(
            format!("re-solved weight {new_p} left (0, 1)"),
            context(),
        ));
    }
    let new_prob = probability(&new_pool, new_p);
    if (new_prob - prob).abs() > PROBABILITY_TOLERANCE {
        return Err(EngineError::violation(
            format!("injection moved probability from {prob} to {new_prob}"),
            context(),
        ));
    }

    Ok(LiquidityAddition {
        new_pool,
        liquidity: new_liquidity - old_liquidity,
        new_p,
    })
}
