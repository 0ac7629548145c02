use thiserror::Error;

use crate::types::{ParticipantId, Price, Role};

pub type MarketResult<T> = Result<T, MarketError>;

/// Why a bounded bid search gave up.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SearchFailure {
    #[error("evaluation budget of {0} exhausted")]
    BudgetExhausted(u32),
    #[error("objective evaluated to NaN")]
    NotANumber,
    #[error("invalid bounds [{0}, {1}]")]
    InvalidBounds(f64, f64),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarketError {
    #[error("participant {participant}: utility argument {argument} is outside the valid domain")]
    Domain {
        participant: ParticipantId,
        argument: f64,
    },

    #[error(
        "participant {participant} ({role}): bid search failed in slot {slot}, iteration {iteration}: {reason}"
    )]
    OptimizationFailed {
        participant: ParticipantId,
        role: Role,
        slot: u64,
        iteration: u32,
        reason: SearchFailure,
    },

    #[error(
        "price search did not converge in slot {slot} after {iterations} iterations (last reference delta {last_delta:e}, price {price})"
    )]
    DidNotConverge {
        slot: u64,
        iterations: u32,
        last_delta: f64,
        price: Price,
    },

    #[error("participant {participant}: demand trace has {available} slots, round {round} requested")]
    DemandExhausted {
        participant: ParticipantId,
        round: usize,
        available: usize,
    },

    #[error("market halted: slot {slot} failed earlier: {cause}")]
    Halted { slot: u64, cause: Box<MarketError> },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid demand distribution: {0}")]
    InvalidDistribution(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}
