//! CPMM Engine Library
//!
//! Pricing, trade settlement, and liquidity accounting for a binary (YES/NO)
//! prediction market run by a weighted constant-product market maker with
//! invariant `k = YES^p * NO^(1-p)`.
//!
//! Every operation is a pure function from one market snapshot to the next;
//! persisting the returned snapshot is the caller's job.

pub mod benchmark;
pub mod config;
pub mod cpmm_core;
pub mod error;
pub mod liquidity;
pub mod stress;
pub mod trade;


pub use config::{Config, FeeSchedule, SolverConfig};
pub use cpmm_core::{
    add_liquidity, calculate_shares, liquidity, pool_after_bet, probability, LiquidityAddition, Market,
    Outcome, Pool,
};
pub use error::{EngineError, Result};
pub use liquidity::{provide_liquidity, provider_weights, user_shares, LiquidityProvision};
pub use trade::{CpmmEngine, FeeQuote, Fees, Purchase, Sale};
