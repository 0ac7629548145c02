//! Slot driver: owns the participants, the configuration and the run's only
//! random generator, and advances the market one slot at a time.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::apportion::largest_remainder;
use crate::auction::{AuctionEngine, Clearing, MarketOutcome, SkipReason};
use crate::config::SimConfig;
use crate::error::{MarketError, MarketResult};
use crate::participant::{Participant, ParticipantParams};
use crate::report::{RunSummary, SlotReport};
use crate::roles::RoleAssigner;
use crate::types::{ParticipantId, Price, UserClass};
use crate::welfare::{post_trade_welfare, pre_trade_welfare};

pub struct Market {
    pub config: SimConfig,
    pub participants: Vec<Participant>,
    reports: Vec<SlotReport>,
    rng: StdRng,
    roles: RoleAssigner,
    engine: AuctionEngine,
    /// First slot failure; participants are mid-slot and cannot continue.
    halted: Option<MarketError>,
}

impl Market {
    pub fn new(config: SimConfig) -> MarketResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let participants = spawn_participants(&config, &mut rng)?;
        Ok(Self::assemble(config, participants, rng))
    }

    /// Start from a hand-built population; the generator is still seeded from
    /// the config.
    pub fn with_participants(config: SimConfig, participants: Vec<Participant>) -> MarketResult<Self> {
        config.validate()?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self::assemble(config, participants, rng))
    }

    fn assemble(config: SimConfig, participants: Vec<Participant>, rng: StdRng) -> Self {
        Self {
            roles: RoleAssigner::new(config.mode, config.random_buyers as usize),
            engine: AuctionEngine::new(config.auction),
            config,
            participants,
            reports: Vec::new(),
            rng,
            halted: None,
        }
    }

    /// Index of the next slot to run.
    pub fn current_slot(&self) -> u64 {
        self.reports.len() as u64
    }

    pub fn reports(&self) -> &[SlotReport] {
        &self.reports
    }

    pub fn report(&self, slot: u64) -> Option<&SlotReport> {
        self.reports.get(slot as usize)
    }

    /// Every announced price, across all slots, in order.
    pub fn price_trace(&self) -> Vec<Price> {
        self.reports
            .iter()
            .flat_map(|r| r.trace.iter().map(|it| it.price))
            .collect()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::new(self.config.mode, &self.participants, &self.reports)
    }

    /// Advance until `config.slots` slots have run.
    pub fn run(&mut self) -> MarketResult<RunSummary> {
        while self.current_slot() < self.config.slots {
            self.step()?;
        }
        Ok(self.summary())
    }

    /// Run one slot: move and serve every participant, assign roles, clear
    /// the auction, settle whole-block trades and record history.
    ///
    /// On error no report is stored and the market halts: every later call
    /// returns `MarketError::Halted` carrying the original failure.
    pub fn step(&mut self) -> MarketResult<&SlotReport> {
        let slot = self.current_slot();
        if let Some(cause) = &self.halted {
            return Err(MarketError::Halted {
                slot,
                cause: Box::new(cause.clone()),
            });
        }
        match self.play_slot(slot) {
            Ok(report) => {
                self.reports.push(report);
                Ok(&self.reports[slot as usize])
            }
            Err(e) => {
                self.halted = Some(e.clone());
                Err(e)
            }
        }
    }

    fn play_slot(&mut self, slot: u64) -> MarketResult<SlotReport> {
        // Phase 1: mobility, channel and buffers (served with last slot's trade)
        for p in self.participants.iter_mut() {
            p.update(&self.config.channel, &mut self.rng)?;
            p.trading_amount = 0.0;

            #[cfg(feature = "instrument")]
            tracing::info!(
                target: "participant",
                slot = slot,
                participant_id = p.id.0,
                class = p.class.label(),
                demand = p.last_flow.demand,
                served = p.last_flow.served,
                loss = p.last_flow.loss,
                waste = p.last_flow.waste,
                buffer_level = p.buffer_level,
                rate_factor = p.rate_factor,
            );
        }

        // Phase 2: roles
        let mean_expected_price = self.roles.assign(&mut self.participants, &mut self.rng)?;
        let pre_trade_welfare = pre_trade_welfare(&self.participants)?;

        // Phase 3: price search
        let outcome = if self.roles.mode().trades() {
            self.engine.clear(&mut self.participants, slot)?
        } else {
            MarketOutcome::Skipped(SkipReason::Static)
        };

        // Phase 4: settlement
        let (start_price, clearing_price, total_supply, trace, skipped) = match outcome {
            MarketOutcome::Cleared(clearing) => {
                settle(&mut self.participants, &clearing);
                (
                    self.engine.config.initial_price,
                    clearing.clearing_price,
                    clearing.total_supply,
                    clearing.trace,
                    None,
                )
            }
            MarketOutcome::Skipped(reason) => (0.0, 0.0, 0.0, Vec::new(), Some(reason)),
        };
        let welfare = post_trade_welfare(&self.participants)?;

        for p in self.participants.iter_mut() {
            p.record_slot()?;

            #[cfg(feature = "instrument")]
            if skipped.is_none() {
                tracing::info!(
                    target: "trade",
                    slot = slot,
                    participant_id = p.id.0,
                    role = %p.role,
                    bid = p.bid,
                    trading_amount = p.trading_amount,
                );
            }
        }

        let buyers = self.participants.iter().filter(|p| p.role.is_buyer()).count() as u32;
        let report = SlotReport {
            slot,
            mean_expected_price,
            start_price,
            clearing_price,
            total_supply,
            buyers,
            sellers: self.participants.len() as u32 - buyers,
            skipped,
            trace,
            pre_trade_welfare,
            welfare,
            trades: self
                .participants
                .iter()
                .map(|p| p.trading_amount as i64)
                .collect(),
        };

        #[cfg(feature = "instrument")]
        tracing::info!(
            target: "slot",
            slot = slot,
            mean_expected_price = report.mean_expected_price,
            clearing_price = report.clearing_price,
            iterations = report.iterations(),
            buyers = report.buyers,
            sellers = report.sellers,
            skipped = report.skipped.is_some(),
            pre_trade_welfare = report.pre_trade_welfare,
            welfare = report.welfare,
        );

        Ok(report)
    }
}

/// Turn the converged tentative positions into whole blocks, apportioning
/// buyers and sellers separately so each side keeps its rounded total.
pub fn settle(participants: &mut [Participant], clearing: &Clearing) {
    for side in [&clearing.buyers, &clearing.sellers] {
        let tentative: Vec<f64> = side.iter().map(|&i| participants[i].trading_amount).collect();
        for (&i, amount) in side.iter().zip(largest_remainder(&tentative)) {
            let p = &mut participants[i];
            // A seller never releases more whole blocks than it holds or can spare
            let floor = -p.assigned_blocks.min(p.max_releasable()).floor();
            let apportioned = amount as f64;
            p.trading_amount = apportioned.max(floor);

            #[cfg(feature = "instrument")]
            if p.trading_amount != apportioned {
                tracing::warn!(
                    target: "settle_clamp",
                    participant_id = p.id.0,
                    apportioned = apportioned,
                    clamped = p.trading_amount,
                );
            }
        }
    }
}

/// High-bandwidth participants first, then low-rate, with ids from 1.
/// Draw order per participant: position, buffer, willingness, demand trace.
pub fn spawn_participants<R: Rng + ?Sized>(
    config: &SimConfig,
    rng: &mut R,
) -> MarketResult<Vec<Participant>> {
    let classes = std::iter::repeat_n(UserClass::HighBandwidth, config.high_bandwidth_users as usize)
        .chain(std::iter::repeat_n(UserClass::LowRate, config.low_rate_users as usize));
    let buffer = &config.buffer;

    classes
        .enumerate()
        .map(|(index, class)| -> MarketResult<Participant> {
            let profile = match class {
                UserClass::HighBandwidth => &config.high_bandwidth,
                UserClass::LowRate => &config.low_rate,
            };
            let position = config.channel.random_position(rng);
            let buffer_level = rng.random_range(buffer.initial_min..=buffer.initial_max);
            let willingness_to_keep =
                rng.random_range(profile.willingness_min..=profile.willingness_max);
            let demand = profile.demand.sample_trace(rng, config.generations)?;

            let params = ParticipantParams {
                willingness_to_keep,
                assigned_blocks: profile.assigned_blocks,
                capacity: buffer.capacity,
                buffer_level,
                position,
                loss_forecast: config.loss_forecast(),
            };
            Ok(
                Participant::new(ParticipantId::new(index as u32 + 1), class, params, demand)
                    .with_rate_factor(config.channel.rate_factor(position)),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Position;
    use crate::demand::DemandTrace;
    use crate::participant::LossForecast;
    use crate::roles::RunMode;
    use crate::types::Role;

    fn small_config(mode: RunMode) -> SimConfig {
        SimConfig {
            mode,
            slots: 3,
            generations: 10,
            high_bandwidth_users: 2,
            low_rate_users: 2,
            random_buyers: 2,
            ..SimConfig::default()
        }
    }

    #[test]
    fn spawn_orders_classes_and_ids() {
        let config = small_config(RunMode::Heuristic);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let participants = spawn_participants(&config, &mut rng).unwrap();

        let classes: Vec<_> = participants.iter().map(|p| p.class).collect();
        assert_eq!(
            classes,
            vec![
                UserClass::HighBandwidth,
                UserClass::HighBandwidth,
                UserClass::LowRate,
                UserClass::LowRate
            ]
        );
        let ids: Vec<_> = participants.iter().map(|p| p.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        for p in &participants {
            assert_eq!(p.demand().len(), 10);
            assert!((3e7..=7e7).contains(&p.buffer_level));
            assert!(p.rate_factor > 0.0);
        }
        assert!((21.0..=23.0).contains(&participants[0].willingness_to_keep));
        assert!((23.0..=25.0).contains(&participants[3].willingness_to_keep));
    }

    #[test]
    fn same_seed_same_run() {
        let mut a = Market::new(small_config(RunMode::Random)).unwrap();
        let mut b = Market::new(small_config(RunMode::Random)).unwrap();
        assert_eq!(a.run().unwrap(), b.run().unwrap());
        assert_eq!(a.reports(), b.reports());
    }

    #[test]
    fn static_mode_never_trades() {
        let mut market = Market::new(small_config(RunMode::Static)).unwrap();
        let summary = market.run().unwrap();
        assert_eq!(summary.slots, 3);
        for report in market.reports() {
            assert_eq!(report.skipped, Some(SkipReason::Static));
            assert!(report.trades.iter().all(|t| *t == 0));
            assert_eq!(report.welfare, report.pre_trade_welfare);
        }
        assert!(market.price_trace().is_empty());
    }

    #[test]
    fn run_stops_at_configured_slots() {
        let mut market = Market::new(small_config(RunMode::Heuristic)).unwrap();
        market.run().unwrap();
        assert_eq!(market.current_slot(), 3);
        assert!(market.report(2).is_some());
        assert!(market.report(3).is_none());
        for p in &market.participants {
            // construction entry plus one per slot
            assert_eq!(p.history.buffer_levels.len(), 4);
            assert_eq!(p.round(), 3);
        }
    }

    // === FAILURE ===

    #[test]
    fn failed_slot_halts_the_market() {
        let mut config = SimConfig {
            generations: 10,
            ..SimConfig::default()
        };
        config.auction.max_iterations = 1;
        let mut market = Market::new(config).unwrap();

        let first = market.step().unwrap_err();
        assert!(matches!(first, MarketError::DidNotConverge { slot: 0, .. }), "{first:?}");
        assert!(market.is_halted());
        let rounds: Vec<usize> = market.participants.iter().map(|p| p.round()).collect();

        match market.step() {
            Err(MarketError::Halted { slot, cause }) => {
                assert_eq!(slot, 0);
                assert_eq!(*cause, first);
            }
            other => panic!("expected Halted, got {other:?}"),
        }
        assert!(matches!(market.run(), Err(MarketError::Halted { .. })));

        // Nothing consumed past the failed slot and nothing reported
        assert_eq!(market.current_slot(), 0);
        assert!(market.reports().is_empty());
        let after: Vec<usize> = market.participants.iter().map(|p| p.round()).collect();
        assert_eq!(after, rounds);
    }

    // === SETTLEMENT ===

    fn seller(id: u32, tentative: f64) -> Participant {
        let mut p = Participant::new(
            ParticipantId::new(id),
            UserClass::HighBandwidth,
            ParticipantParams {
                willingness_to_keep: 20.0,
                assigned_blocks: 50.0,
                capacity: 100.0,
                buffer_level: 50.0,
                position: Position { x: 0.0, y: 0.0 },
                loss_forecast: LossForecast::Persistence,
            },
            DemandTrace::default(),
        )
        // Can spare 100 / 3 = 33.3 blocks
        .with_rate_factor(3.0)
        .with_role(Role::Seller);
        p.trading_amount = tentative;
        p
    }

    fn sellers_only(sellers: Vec<usize>) -> Clearing {
        Clearing {
            clearing_price: 1.0,
            total_supply: 100.0,
            trace: Vec::new(),
            buyers: Vec::new(),
            sellers,
        }
    }

    #[test]
    fn settle_apportions_each_side_to_whole_blocks() {
        let mut participants = vec![seller(1, -10.6), seller(2, -4.7)];
        settle(&mut participants, &sellers_only(vec![0, 1]));
        let trades: Vec<f64> = participants.iter().map(|p| p.trading_amount).collect();
        assert_eq!(trades, vec![-10.0, -5.0]);
    }

    #[test]
    fn settle_clamps_sales_past_what_a_seller_can_spare() {
        // -33.3 and -1.29 apportion to -34 and -1; 34 blocks exceed 33.3
        let mut participants = vec![seller(1, -33.3), seller(2, -1.29)];
        settle(&mut participants, &sellers_only(vec![0, 1]));
        let trades: Vec<f64> = participants.iter().map(|p| p.trading_amount).collect();
        assert_eq!(trades, vec![-33.0, -1.0]);
    }

    #[cfg(feature = "instrument")]
    #[test]
    fn settle_clamp_is_recorded() {
        let mut participants = vec![seller(1, -33.3), seller(2, -1.29)];
        tracing::subscriber::with_default(instrument::TableSubscriber, || {
            instrument::reset();
            settle(&mut participants, &sellers_only(vec![0, 1]));
        });
        let tables = instrument::take();
        let clamps = &tables["settle_clamp"];
        assert_eq!(clamps.rows(), 1);
        let clamped = clamps.column("clamped").and_then(|c| c.as_f64()).unwrap();
        assert_eq!(clamped, &[Some(-33.0)]);

        let mut participants = vec![seller(1, -10.6), seller(2, -4.7)];
        tracing::subscriber::with_default(instrument::TableSubscriber, || {
            settle(&mut participants, &sellers_only(vec![0, 1]));
        });
        assert!(instrument::take().is_empty());
    }
}
