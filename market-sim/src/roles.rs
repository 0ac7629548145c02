//! Role policy: who buys and who sells each slot.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tsify_next::Tsify;

use crate::error::MarketResult;
use crate::participant::{LossForecast, Participant};
use crate::types::{Price, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Tsify)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub enum RunMode {
    /// Roles classified once then frozen; the market never trades.
    Static,
    /// A fixed-size random subset buys each slot.
    Random,
    /// Buyer iff expected price is strictly above the market mean.
    #[default]
    Heuristic,
    /// Heuristic roles with lookahead loss forecasting.
    Future,
}

impl RunMode {
    pub fn trades(&self) -> bool {
        !matches!(self, RunMode::Static)
    }

    pub fn loss_forecast(&self, lookahead_factor: f64) -> LossForecast {
        match self {
            RunMode::Future => LossForecast::ScaledLookahead(lookahead_factor),
            _ => LossForecast::Persistence,
        }
    }
}

/// Heuristic classification: buyer iff strictly above the mean, otherwise
/// seller. Returns the roles and the mean.
pub fn classify_by_expected_price(expected: &[Price]) -> (Vec<Role>, Price) {
    if expected.is_empty() {
        return (Vec::new(), 0.0);
    }
    let mean = expected.iter().sum::<f64>() / expected.len() as f64;
    let roles = expected
        .iter()
        .map(|&p| if p > mean { Role::Buyer } else { Role::Seller })
        .collect();
    (roles, mean)
}

pub struct RoleAssigner {
    mode: RunMode,
    random_buyers: usize,
    frozen: bool,
}

impl RoleAssigner {
    pub fn new(mode: RunMode, random_buyers: usize) -> Self {
        Self {
            mode,
            random_buyers,
            frozen: false,
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Set every participant's role for this slot and return the mean
    /// expected price across the market.
    pub fn assign<R: Rng + ?Sized>(
        &mut self,
        participants: &mut [Participant],
        rng: &mut R,
    ) -> MarketResult<Price> {
        let expected = participants
            .iter()
            .map(|p| p.expected_price())
            .collect::<MarketResult<Vec<_>>>()?;
        let (heuristic, mean) = classify_by_expected_price(&expected);

        match self.mode {
            RunMode::Static if self.frozen => {}
            RunMode::Static => {
                apply(participants, &heuristic);
                self.frozen = true;
            }
            RunMode::Heuristic | RunMode::Future => apply(participants, &heuristic),
            RunMode::Random => {
                let n = participants.len();
                let buyers = rand::seq::index::sample(rng, n, self.random_buyers.min(n));
                let mut roles = vec![Role::Seller; n];
                for index in buyers.iter() {
                    roles[index] = Role::Buyer;
                }
                apply(participants, &roles);
            }
        }

        Ok(mean)
    }
}

fn apply(participants: &mut [Participant], roles: &[Role]) {
    for (p, role) in participants.iter_mut().zip(roles) {
        p.role = *role;
    }
}
