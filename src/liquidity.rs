//! Liquidity provider accounting.
//!
//! Provider weights fold over the full provision history and value every
//! deposit under the market's *current* `p`, so early providers' weights
//! move as trading shifts the weight.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cpmm_core::{add_liquidity, liquidity, Market, Pool};
use crate::error::{EngineError, Result};

/// Historical record of a liquidity deposit. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityProvision {
    pub provider_id: String,
    /// Pool the deposit was made into (empty for an ante).
    pub pool: Pool,
    pub amount: f64,
    pub is_ante: bool,
    /// Liquidity shares minted at deposit time, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liquidity: Option<f64>,
}

impl LiquidityProvision {
    /// The record seeding a market created with [`Market::from_ante`].
    pub fn ante(provider_id: impl Into<String>, ante: f64) -> Self {
        Self {
            provider_id: provider_id.into(),
            pool: Pool::EMPTY,
            amount: ante,
            is_ante: true,
            liquidity: Some(ante),
        }
    }

    /// Growth of `k` this deposit represents under weight `p`.
    pub fn liquidity_delta(&self, p: f64) -> f64 {
        liquidity(&self.pool.add_both(self.amount), p) - liquidity(&self.pool, p)
    }

    fn validate(&self) -> Result<()> {
        let Pool { yes, no } = self.pool;
        let valid = [yes, no, self.amount]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0);
        if valid {
            Ok(())
        } else {
            Err(EngineError::invalid(format!(
                "malformed liquidity provision from '{}': pool={}, amount={}",
                self.provider_id, self.pool, self.amount
            )))
        }
    }
}

/// Deposits `amount` into `market` on behalf of `provider_id`, returning the
/// next market snapshot and the record the caller should append.
pub fn provide_liquidity(
    market: &Market,
    provider_id: impl Into<String>,
    amount: f64,
) -> Result<(Market, LiquidityProvision)> {
    if amount <= 0.0 {
        return Err(EngineError::invalid(format!(
            "liquidity amount must be positive, got {amount}"
        )));
    }
    let added = add_liquidity(&market.pool, market.p, amount)?;
    let provision = LiquidityProvision {
        provider_id: provider_id.into(),
        pool: market.pool,
        amount,
        is_ante: false,
        liquidity: Some(added.liquidity),
    };
    let next = Market {
        pool: added.new_pool,
        p: added.new_p,
    };
    Ok((next, provision))
}

/// Fraction of the pool owned by each provider.
///
/// Ante deltas are still computed when `exclude_antes` is set, then dropped
/// from both numerator and denominator, so the included weights sum to 1.
pub fn provider_weights(
    market: &Market,
    liquidities: &[LiquidityProvision],
    exclude_antes: bool,
) -> Result<BTreeMap<String, f64>> {
    market.validate()?;

    let mut shares_by_provider: BTreeMap<String, f64> = BTreeMap::new();
    let mut share_sum = 0.0;
    for provision in liquidities {
        provision.validate()?;
        let delta = provision.liquidity_delta(market.p);
        if exclude_antes && provision.is_ante {
            continue;
        }
        *shares_by_provider
            .entry(provision.provider_id.clone())
            .or_insert(0.0) += delta;
        share_sum += delta;
    }

    if share_sum <= 0.0 {
        return Ok(shares_by_provider.into_keys().map(|id| (id, 0.0)).collect());
    }

    Ok(shares_by_provider
        .into_iter()
        .map(|(id, shares)| (id, shares / share_sum))
        .collect())
}

/// Outcome tokens `user_id` could redeem by withdrawing proportionally.
pub fn user_shares(
    user_id: &str,
    market: &Market,
    liquidities: &[LiquidityProvision],
    exclude_antes: bool,
) -> Result<Pool> {
    let weights = provider_weights(market, liquidities, exclude_antes)?;
    let weight = weights.get(user_id).copied().unwrap_or(0.0);
    Ok(market.pool.scale(weight))
}
