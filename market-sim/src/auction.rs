//! Tâtonnement price search for one slot's capacity market.
//!
//! The auctioneer announces a price, every participant answers with its
//! payoff-maximizing bid, and the price moves against excess supply until the
//! reference delta falls below `epsilon`. No blocks change hands inside the
//! search; the final net positions are handed back for apportionment.

use serde::{Deserialize, Serialize};
use tsify_next::Tsify;

use crate::config::AuctionConfig;
use crate::error::{MarketError, MarketResult};
use crate::optimizer::{BidOptimizer, SearchContext};
use crate::participant::Participant;
use crate::types::{Blocks, Price, Role};
use crate::welfare::post_trade_welfare;

/// One price announcement and the market's answer to it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi)]
pub struct IterationRecord {
    pub iteration: u32,
    /// Price the bids were formed at
    pub bid_price: Price,
    /// Price announced after this iteration's update
    pub price: Price,
    /// Blocks buyers ask for
    pub demand: Blocks,
    /// Blocks sellers release
    pub supply: Blocks,
    /// Welfare if the tentative positions were executed
    pub welfare: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Tsify)]
#[serde(rename_all = "snake_case")]
#[tsify(into_wasm_abi)]
pub enum SkipReason {
    NoBuyers,
    TooFewSellers,
    /// Roles are frozen and the market never trades
    Static,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clearing {
    /// Price after the last update
    pub clearing_price: Price,
    /// Σ sellers' assigned blocks, fixed for the search
    pub total_supply: Blocks,
    pub trace: Vec<IterationRecord>,
    /// Participant indices, in market order
    pub buyers: Vec<usize>,
    pub sellers: Vec<usize>,
}

impl Clearing {
    pub fn iterations(&self) -> u32 {
        self.trace.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarketOutcome {
    Cleared(Clearing),
    Skipped(SkipReason),
}

pub struct AuctionEngine {
    pub config: AuctionConfig,
    optimizer: BidOptimizer,
}

impl AuctionEngine {
    pub fn new(config: AuctionConfig) -> Self {
        Self {
            optimizer: BidOptimizer::new(config.search_settings()),
            config,
        }
    }

    /// Run the price search over participants' current roles.
    ///
    /// Each participant's `bid` and bid history are updated every iteration and
    /// `trading_amount` holds its tentative net position (signed) on return.
    /// Participants are otherwise unchanged.
    pub fn clear(&self, participants: &mut [Participant], slot: u64) -> MarketResult<MarketOutcome> {
        let (buyers, sellers): (Vec<usize>, Vec<usize>) =
            (0..participants.len()).partition(|&i| participants[i].role.is_buyer());

        if buyers.is_empty() {
            return Ok(MarketOutcome::Skipped(SkipReason::NoBuyers));
        }
        if sellers.len() < 2 {
            return Ok(MarketOutcome::Skipped(SkipReason::TooFewSellers));
        }

        let total_supply: Blocks = sellers.iter().map(|&i| participants[i].assigned_blocks).sum();
        let cfg = &self.config;
        let mut price = cfg.initial_price;
        let mut trace = Vec::new();
        let mut last_delta = f64::INFINITY;

        for iteration in 1..=cfg.max_iterations {
            let context = SearchContext { slot, iteration };
            let mut total_bid = 0.0;
            let mut demand = 0.0;
            let mut supply = 0.0;

            for &i in &buyers {
                let best =
                    self.optimizer
                        .optimal_bid(&participants[i], Role::Buyer, price, total_supply, context)?;
                let p = &mut participants[i];
                p.record_bid(best.bid, best.payoff, best.utility);
                p.trading_amount = best.net_blocks;
                total_bid += best.bid;
                demand += best.net_blocks;
            }

            for &i in &sellers {
                let best =
                    self.optimizer
                        .optimal_bid(&participants[i], Role::Seller, price, total_supply, context)?;
                let p = &mut participants[i];
                p.record_bid(best.bid, best.payoff, best.utility);
                p.trading_amount = best.net_blocks;
                total_bid += best.bid;
                supply -= best.net_blocks;
            }

            // Seller bids buy back retained blocks, so this is supply - demand
            let excess = total_supply - total_bid / price;
            let bid_price = price;
            price = (bid_price - cfg.step_size * excess).max(cfg.price_floor);
            last_delta = (bid_price - cfg.reference_rate * excess).max(cfg.price_floor) - bid_price;

            let welfare = post_trade_welfare(participants)?;
            trace.push(IterationRecord {
                iteration,
                bid_price,
                price,
                demand,
                supply,
                welfare,
            });

            #[cfg(feature = "instrument")]
            tracing::info!(
                target: "auction_iter",
                slot = slot,
                iteration = iteration,
                bid_price = bid_price,
                price = price,
                demand = demand,
                supply = supply,
                welfare = welfare,
            );

            if last_delta.abs() <= cfg.epsilon {
                return Ok(MarketOutcome::Cleared(Clearing {
                    clearing_price: price,
                    total_supply,
                    trace,
                    buyers,
                    sellers,
                }));
            }
        }

        Err(MarketError::DidNotConverge {
            slot,
            iterations: cfg.max_iterations,
            last_delta,
            price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Position;
    use crate::demand::DemandTrace;
    use crate::error::SearchFailure;
    use crate::participant::{LossForecast, ParticipantParams};
    use crate::types::{ParticipantId, UserClass};

    fn participant(id: u32, willingness: f64, assigned: Blocks, role: Role) -> Participant {
        Participant::new(
            ParticipantId::new(id),
            UserClass::HighBandwidth,
            ParticipantParams {
                willingness_to_keep: willingness,
                assigned_blocks: assigned,
                capacity: 100.0,
                buffer_level: 50.0,
                position: Position { x: 0.0, y: 0.0 },
                loss_forecast: LossForecast::Persistence,
            },
            DemandTrace::default(),
        )
        .with_role(role)
    }

    fn two_by_two() -> Vec<Participant> {
        vec![
            participant(1, 30.0, 50.0, Role::Buyer),
            participant(2, 30.0, 50.0, Role::Buyer),
            participant(3, 20.0, 50.0, Role::Seller),
            participant(4, 20.0, 50.0, Role::Seller),
        ]
    }

    fn fast_config() -> AuctionConfig {
        AuctionConfig {
            step_size: 0.005,
            reference_rate: 0.1,
            epsilon: 1e-6,
            bid_tolerance: 1e-9,
            ..AuctionConfig::default()
        }
    }

    #[test]
    fn skips_without_buyers_or_with_one_seller() {
        let engine = AuctionEngine::new(AuctionConfig::default());

        let mut sellers_only = vec![
            participant(1, 20.0, 50.0, Role::Seller),
            participant(2, 20.0, 50.0, Role::Seller),
        ];
        assert_eq!(
            engine.clear(&mut sellers_only, 0).unwrap(),
            MarketOutcome::Skipped(SkipReason::NoBuyers)
        );

        let mut one_seller = vec![
            participant(1, 30.0, 50.0, Role::Buyer),
            participant(2, 20.0, 50.0, Role::Seller),
        ];
        assert_eq!(
            engine.clear(&mut one_seller, 0).unwrap(),
            MarketOutcome::Skipped(SkipReason::TooFewSellers)
        );
        assert!(one_seller.iter().all(|p| p.history.bids.is_empty()));
    }

    #[test]
    fn converges_with_balanced_positions() {
        let mut market = two_by_two();
        let engine = AuctionEngine::new(fast_config());
        let MarketOutcome::Cleared(clearing) = engine.clear(&mut market, 0).unwrap() else {
            panic!("expected a cleared market");
        };

        assert_eq!(clearing.total_supply, 100.0);
        assert_eq!(clearing.buyers, vec![0, 1]);
        assert_eq!(clearing.sellers, vec![2, 3]);

        let last = clearing.trace.last().unwrap();
        assert!(
            (last.demand - last.supply).abs() < 1e-4,
            "demand {} vs supply {}",
            last.demand,
            last.supply
        );
        // Both reservation values bracket the price
        assert!(clearing.clearing_price > 1.0 && clearing.clearing_price < 1.5);

        let net: f64 = market.iter().map(|p| p.trading_amount).sum();
        assert!(net.abs() < 1e-4, "net position {net}");
        for p in &market {
            assert_eq!(p.history.bids.len(), clearing.trace.len());
        }
    }

    #[test]
    fn iteration_cap_raises_did_not_converge() {
        let mut market = two_by_two();
        let engine = AuctionEngine::new(AuctionConfig {
            max_iterations: 3,
            ..fast_config()
        });
        match engine.clear(&mut market, 7) {
            Err(MarketError::DidNotConverge { slot, iterations, .. }) => {
                assert_eq!(slot, 7);
                assert_eq!(iterations, 3);
            }
            other => panic!("expected DidNotConverge, got {other:?}"),
        }
    }

    #[test]
    fn trace_records_bid_price_and_updated_price() {
        let mut market = two_by_two();
        let engine = AuctionEngine::new(fast_config());
        let MarketOutcome::Cleared(clearing) = engine.clear(&mut market, 0).unwrap() else {
            panic!("expected a cleared market");
        };

        assert_eq!(clearing.trace[0].bid_price, engine.config.initial_price);
        assert_eq!(clearing.trace.last().unwrap().price, clearing.clearing_price);
        for pair in clearing.trace.windows(2) {
            assert_eq!(pair[1].bid_price, pair[0].price);
        }
    }

    #[test]
    fn failed_bid_search_aborts_the_slot() {
        let mut market = two_by_two();
        let engine = AuctionEngine::new(AuctionConfig {
            max_bid_evaluations: 2,
            bid_tolerance: 1e-12,
            ..fast_config()
        });
        match engine.clear(&mut market, 4) {
            Err(MarketError::OptimizationFailed {
                participant,
                role,
                slot,
                iteration,
                reason,
            }) => {
                assert_eq!(participant, ParticipantId::new(1));
                assert_eq!(role, Role::Buyer);
                assert_eq!(slot, 4);
                assert_eq!(iteration, 1);
                assert_eq!(reason, SearchFailure::BudgetExhausted(2));
            }
            other => panic!("expected OptimizationFailed, got {other:?}"),
        }
        // No fallback bid was recorded for anyone
        assert!(market.iter().all(|p| p.history.bids.is_empty()));
    }

    #[test]
    fn price_never_drops_below_floor() {
        // Sellers with no use for capacity flood the market
        let mut market = vec![
            participant(1, 1.0, 50.0, Role::Buyer),
            participant(2, 0.5, 50.0, Role::Seller),
            participant(3, 0.5, 50.0, Role::Seller),
        ];
        let engine = AuctionEngine::new(AuctionConfig {
            step_size: 0.01,
            reference_rate: 0.01,
            max_iterations: 200,
            ..AuctionConfig::default()
        });
        let trace = match engine.clear(&mut market, 0) {
            Ok(MarketOutcome::Cleared(clearing)) => clearing.trace,
            Err(MarketError::DidNotConverge { price, .. }) => {
                assert!(price >= 1e-2);
                return;
            }
            other => panic!("unexpected outcome {other:?}"),
        };
        assert!(trace.iter().all(|r| r.price >= 1e-2));
    }
}
