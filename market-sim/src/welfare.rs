//! Social welfare: the sum of absolute utility levels across participants.

use crate::error::MarketResult;
use crate::participant::Participant;

/// `Σ w * sqrt(K)`: every participant at its baseline allocation.
pub fn pre_trade_welfare(participants: &[Participant]) -> MarketResult<f64> {
    participants
        .iter()
        .map(|p| p.absolute_utility(0.0))
        .sum()
}

/// `Σ w * sqrt(trading_amount * rf + K)` at the current net positions.
pub fn post_trade_welfare(participants: &[Participant]) -> MarketResult<f64> {
    participants
        .iter()
        .map(|p| p.absolute_utility(p.trading_amount))
        .sum()
}
