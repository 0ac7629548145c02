//! Run configuration. Every struct deserializes from partial JSON; missing
//! fields take the defaults below.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelConfig;
use crate::demand::DemandProfile;
use crate::error::{MarketError, MarketResult};
use crate::optimizer::SearchSettings;
use crate::participant::LossForecast;
use crate::roles::RunMode;
use crate::types::{Bits, Blocks, Price};

// === AUCTION ===

/// Tâtonnement parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuctionConfig {
    /// Price every slot's search starts from
    pub initial_price: Price,
    /// Price moves by `-step_size * excess supply` each iteration
    pub step_size: f64,
    pub price_floor: Price,
    /// Convergence threshold on the reference delta
    pub epsilon: f64,
    /// Step used only for the convergence test
    pub reference_rate: f64,
    pub max_iterations: u32,
    pub bid_tolerance: f64,
    pub max_bid_evaluations: u32,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            initial_price: 1.095,
            step_size: 1e-6,
            price_floor: 1e-2,
            epsilon: 1e-5,
            reference_rate: 2e-6,
            max_iterations: 10_000,
            bid_tolerance: 1e-5,
            max_bid_evaluations: 500,
        }
    }
}

impl AuctionConfig {
    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            tolerance: self.bid_tolerance,
            max_evaluations: self.max_bid_evaluations,
        }
    }

    pub fn validate(&self) -> MarketResult<()> {
        let positive = [
            ("initial_price", self.initial_price),
            ("step_size", self.step_size),
            ("price_floor", self.price_floor),
            ("epsilon", self.epsilon),
            ("reference_rate", self.reference_rate),
            ("bid_tolerance", self.bid_tolerance),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(invalid(format!("auction.{name} must be positive, got {value}")));
            }
        }
        if self.max_iterations == 0 || self.max_bid_evaluations == 0 {
            return Err(invalid("auction iteration and evaluation budgets must be non-zero"));
        }
        Ok(())
    }
}

// === BUFFER ===

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: Bits,
    /// Initial buffer level is drawn uniformly from this range
    pub initial_min: Bits,
    pub initial_max: Bits,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1e9,
            initial_min: 3e7,
            initial_max: 7e7,
        }
    }
}

// === CLASS PROFILES ===

/// Per-class parameters shared by every participant of that class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassProfile {
    pub willingness_min: f64,
    pub willingness_max: f64,
    pub assigned_blocks: Blocks,
    pub demand: DemandProfile,
}

impl ClassProfile {
    pub fn high_bandwidth() -> Self {
        Self {
            willingness_min: 21.0,
            willingness_max: 23.0,
            assigned_blocks: 40_000.0,
            demand: DemandProfile::Pareto {
                min: 1e8,
                max: 1.5e8,
                mean: 1.08e8,
            },
        }
    }

    pub fn low_rate() -> Self {
        Self {
            willingness_min: 23.0,
            willingness_max: 25.0,
            assigned_blocks: 4_000.0,
            demand: DemandProfile::Pareto {
                min: 1e7,
                max: 1e8,
                mean: 1.1e7,
            },
        }
    }

    fn validate(&self, class: &str) -> MarketResult<()> {
        if !(self.willingness_min > 0.0 && self.willingness_max >= self.willingness_min)
            || !self.willingness_max.is_finite()
        {
            return Err(invalid(format!(
                "{class}: willingness range [{}, {}]",
                self.willingness_min, self.willingness_max
            )));
        }
        if !(self.assigned_blocks > 0.0 && self.assigned_blocks.is_finite()) {
            return Err(invalid(format!(
                "{class}: assigned_blocks must be positive, got {}",
                self.assigned_blocks
            )));
        }
        Ok(())
    }
}

// === SIM CONFIG ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub seed: u64,
    pub mode: RunMode,
    /// Slots `run()` advances through
    pub slots: u64,
    /// Length of every demand trace; must cover `slots`
    pub generations: usize,
    pub high_bandwidth_users: u32,
    pub low_rate_users: u32,
    /// Buyers per slot in RANDOM mode
    pub random_buyers: u32,
    /// Loss multiplier for FUTURE mode forecasts
    pub lookahead_factor: f64,
    pub channel: ChannelConfig,
    pub buffer: BufferConfig,
    pub auction: AuctionConfig,
    pub high_bandwidth: ClassProfile,
    pub low_rate: ClassProfile,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 2025,
            mode: RunMode::default(),
            slots: 1,
            generations: 2000,
            high_bandwidth_users: 5,
            low_rate_users: 5,
            random_buyers: 5,
            lookahead_factor: 10.0,
            channel: ChannelConfig::default(),
            buffer: BufferConfig::default(),
            auction: AuctionConfig::default(),
            high_bandwidth: ClassProfile::high_bandwidth(),
            low_rate: ClassProfile::low_rate(),
        }
    }
}

impl SimConfig {
    pub fn from_json_str(json: &str) -> MarketResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| invalid(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn participant_count(&self) -> usize {
        (self.high_bandwidth_users + self.low_rate_users) as usize
    }

    pub fn loss_forecast(&self) -> LossForecast {
        self.mode.loss_forecast(self.lookahead_factor)
    }

    pub fn validate(&self) -> MarketResult<()> {
        if self.participant_count() == 0 {
            return Err(invalid("at least one participant is required"));
        }
        if self.random_buyers as usize > self.participant_count() {
            return Err(invalid(format!(
                "random_buyers ({}) exceeds participant count ({})",
                self.random_buyers,
                self.participant_count()
            )));
        }
        if (self.generations as u64) < self.slots {
            return Err(invalid(format!(
                "demand traces of {} slots cannot cover {} slots",
                self.generations, self.slots
            )));
        }
        if !(self.lookahead_factor >= 0.0 && self.lookahead_factor.is_finite()) {
            return Err(invalid(format!(
                "lookahead_factor must be non-negative, got {}",
                self.lookahead_factor
            )));
        }

        let b = &self.buffer;
        if !(b.capacity > 0.0 && b.capacity.is_finite()) {
            return Err(invalid(format!("buffer capacity must be positive, got {}", b.capacity)));
        }
        if !(b.initial_min >= 0.0 && b.initial_max >= b.initial_min && b.initial_max <= b.capacity)
        {
            return Err(invalid(format!(
                "initial buffer range [{}, {}] must lie inside [0, {}]",
                b.initial_min, b.initial_max, b.capacity
            )));
        }

        let c = &self.channel;
        if !(c.area_width > 0.0 && c.area_height > 0.0) {
            return Err(invalid("service area must have positive size"));
        }
        if !(c.noise > 0.0 && c.bandwidth > 0.0 && c.resource_blocks > 0.0 && c.carrier_frequency > 0.0)
        {
            return Err(invalid("channel noise, bandwidth, resource blocks and frequency must be positive"));
        }

        self.auction.validate()?;
        self.high_bandwidth.validate("high_bandwidth")?;
        self.low_rate.validate("low_rate")?;
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> MarketError {
    MarketError::InvalidConfig(message.into())
}
