//! Market participants: buffer dynamics, price expectation and utility.
//!
//! `buffer_level` is the consumable backlog allowance: it is drawn down by net
//! arrivals (demand the allocation cannot serve this slot) and refilled by
//! surplus service, always staying inside `[0, capacity]`.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelConfig, Position};
use crate::demand::DemandTrace;
use crate::error::{MarketError, MarketResult};
use crate::types::{Bits, Blocks, ParticipantId, Price, Role, UserClass};

/// Radicands this far below zero (relative to capacity) are rounding noise
/// at a domain edge and are read as zero.
const DOMAIN_SLACK: f64 = 1e-12;

// === LOSS FORECAST ===

/// How a participant anticipates next slot's loss when pricing capacity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum LossForecast {
    /// Next loss equals the last realized loss.
    #[default]
    Persistence,
    /// Next loss is the last realized loss times a fixed factor.
    ScaledLookahead(f64),
}

impl LossForecast {
    pub fn forecast(&self, last_loss: Bits) -> Bits {
        match self {
            LossForecast::Persistence => last_loss,
            LossForecast::ScaledLookahead(factor) => factor * last_loss,
        }
    }
}

// === SLOT FLOW ===

/// What happened to one participant's traffic in one slot.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SlotFlow {
    pub demand: Bits,
    pub served: Bits,
    /// demand - served; negative when service capacity is left over
    pub net_arrival: Bits,
    pub loss: Bits,
    pub waste: Bits,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LossWasteCounters {
    pub loss_slots: u32,
    pub loss_amount: Bits,
    pub waste_slots: u32,
    pub waste_amount: Bits,
}

/// Append-only per-participant records. Slot series start with the state at
/// construction; bid series get one entry per auction iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantHistory {
    pub buffer_levels: Vec<Bits>,
    pub expected_prices: Vec<Price>,
    pub roles: Vec<Role>,
    pub losses: Vec<Bits>,
    pub wastes: Vec<Bits>,
    pub bids: Vec<Price>,
    pub payoffs: Vec<f64>,
    pub utilities: Vec<f64>,
}

// === PARTICIPANT ===

#[derive(Debug, Clone)]
pub struct ParticipantParams {
    pub willingness_to_keep: f64,
    pub assigned_blocks: Blocks,
    pub capacity: Bits,
    pub buffer_level: Bits,
    pub position: Position,
    pub loss_forecast: LossForecast,
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub class: UserClass,

    // Physical state
    pub position: Position,
    /// Bits carried per resource block this slot
    pub rate_factor: f64,

    // Economic state
    pub willingness_to_keep: f64,
    pub assigned_blocks: Blocks,
    pub capacity: Bits,
    pub buffer_level: Bits,
    pub role: Role,
    pub bid: Price,
    /// Net blocks gained (+) or given up (-) in the current slot
    pub trading_amount: Blocks,
    pub loss_forecast: LossForecast,

    pub last_flow: SlotFlow,
    pub counters: LossWasteCounters,
    pub history: ParticipantHistory,

    demand: DemandTrace,
    round: usize,
}

impl Participant {
    pub fn new(
        id: ParticipantId,
        class: UserClass,
        params: ParticipantParams,
        demand: DemandTrace,
    ) -> Self {
        let buffer_level = params.buffer_level.clamp(0.0, params.capacity);
        let mut participant = Self {
            id,
            class,
            position: params.position,
            rate_factor: 1.0,
            willingness_to_keep: params.willingness_to_keep,
            assigned_blocks: params.assigned_blocks,
            capacity: params.capacity,
            buffer_level,
            role: Role::Buyer,
            bid: 0.0,
            trading_amount: 0.0,
            loss_forecast: params.loss_forecast,
            last_flow: SlotFlow::default(),
            counters: LossWasteCounters::default(),
            history: ParticipantHistory::default(),
            demand,
            round: 0,
        };
        participant.history.buffer_levels.push(buffer_level);
        participant.history.roles.push(participant.role);
        // NaN keeps the history aligned by slot when the estimate is undefined
        let expected = participant.expected_price().unwrap_or(f64::NAN);
        participant.history.expected_prices.push(expected);
        participant
    }

    pub fn with_rate_factor(mut self, rate_factor: f64) -> Self {
        self.rate_factor = rate_factor;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn round(&self) -> usize {
        self.round
    }

    pub fn demand(&self) -> &DemandTrace {
        &self.demand
    }

    // === Slot dynamics ===

    /// Full per-slot update: move, refresh the channel, then absorb this
    /// slot's demand into the buffer.
    pub fn update<R: Rng + ?Sized>(
        &mut self,
        channel: &ChannelConfig,
        rng: &mut R,
    ) -> MarketResult<SlotFlow> {
        self.position = channel.next_position(rng, self.position);
        self.rate_factor = channel.rate_factor(self.position);
        self.absorb_demand()
    }

    /// Serve this slot's demand with the current allocation and rate factor.
    ///
    /// Loss is demand the backlog allowance cannot take; waste is surplus
    /// service the free space cannot take. Both are measured against the
    /// buffer before it moves.
    pub fn absorb_demand(&mut self) -> MarketResult<SlotFlow> {
        let demand = self
            .demand
            .at(self.round)
            .ok_or(MarketError::DemandExhausted {
                participant: self.id,
                round: self.round,
                available: self.demand.len(),
            })?;
        self.round += 1;

        let served = (self.assigned_blocks + self.trading_amount) * self.rate_factor;
        let net_arrival = demand - served;
        let free_space = self.capacity - self.buffer_level;

        let loss = (net_arrival - self.buffer_level).max(0.0);
        let waste = (-net_arrival - free_space).max(0.0);
        self.buffer_level = (self.buffer_level - net_arrival).clamp(0.0, self.capacity);

        if loss > 0.0 {
            self.counters.loss_slots += 1;
            self.counters.loss_amount += loss;
        }
        if waste > 0.0 {
            self.counters.waste_slots += 1;
            self.counters.waste_amount += waste;
        }

        self.last_flow = SlotFlow {
            demand,
            served,
            net_arrival,
            loss,
            waste,
        };
        Ok(self.last_flow)
    }

    /// Close the slot: append buffer, expected price, role, loss and waste.
    pub fn record_slot(&mut self) -> MarketResult<()> {
        let expected = self.expected_price()?;
        self.history.buffer_levels.push(self.buffer_level);
        self.history.expected_prices.push(expected);
        self.history.roles.push(self.role);
        self.history.losses.push(self.last_flow.loss);
        self.history.wastes.push(self.last_flow.waste);
        Ok(())
    }

    pub fn record_bid(&mut self, bid: Price, payoff: f64, utility: f64) {
        self.bid = bid;
        self.history.bids.push(bid);
        self.history.payoffs.push(payoff);
        self.history.utilities.push(utility);
    }

    // === Valuation ===

    pub fn forecast_loss(&self) -> Bits {
        self.loss_forecast.forecast(self.last_flow.loss)
    }

    /// Capacity left after the anticipated loss: the `K` under every root.
    pub fn effective_capacity(&self) -> Bits {
        self.capacity - self.forecast_loss()
    }

    /// Marginal value of one more unit of capacity at zero trade.
    pub fn expected_price(&self) -> MarketResult<Price> {
        let radicand = self.buffer_level + self.effective_capacity();
        if !(radicand > 0.0) {
            return Err(MarketError::Domain {
                participant: self.id,
                argument: radicand,
            });
        }
        Ok(0.5 / radicand.sqrt() * self.willingness_to_keep)
    }

    /// Concave, strictly increasing utility of gaining `amount` blocks,
    /// `w * (sqrt(amount * rf + K) - sqrt(K))`, with `utility(0) == 0`.
    pub fn utility(&self, amount: Blocks) -> MarketResult<f64> {
        let (t, s) = self.roots(amount)?;
        if amount == 0.0 || t + s == 0.0 {
            return Ok(0.0);
        }
        // (t - s) rewritten as x*rf / (t + s) to avoid cancellation
        Ok(self.willingness_to_keep * amount * self.rate_factor / (t + s))
    }

    /// Utility level `w * sqrt(amount * rf + K)` used for welfare.
    pub fn absolute_utility(&self, amount: Blocks) -> MarketResult<f64> {
        let (t, _) = self.roots(amount)?;
        Ok(self.willingness_to_keep * t)
    }

    /// Closed-form `∫_0^amount utility(x) dx`, never negative: below zero
    /// the utility and the orientation of the bounds are both negative.
    pub fn utility_integral(&self, amount: Blocks) -> MarketResult<f64> {
        let (t, s) = self.roots(amount)?;
        let sum = t + s;
        if amount == 0.0 || sum == 0.0 {
            return Ok(0.0);
        }
        Ok(self.willingness_to_keep * amount * amount * self.rate_factor * (2.0 * t + s)
            / (3.0 * sum * sum))
    }

    /// Largest number of blocks this participant can give up before the
    /// utility argument leaves its domain.
    pub fn max_releasable(&self) -> Blocks {
        if self.rate_factor > 0.0 {
            (self.effective_capacity() / self.rate_factor).max(0.0)
        } else {
            f64::INFINITY
        }
    }

    /// `(sqrt(amount * rf + K), sqrt(K))`, validating the domain.
    fn roots(&self, amount: Blocks) -> MarketResult<(f64, f64)> {
        let k = self.effective_capacity();
        let arg = amount * self.rate_factor + k;
        let slack = DOMAIN_SLACK * self.capacity.abs().max(1.0);
        if k < 0.0 || arg < -slack || arg.is_nan() {
            return Err(MarketError::Domain {
                participant: self.id,
                argument: if k < 0.0 { k } else { arg },
            });
        }
        Ok((arg.max(0.0).sqrt(), k.sqrt()))
    }
}
