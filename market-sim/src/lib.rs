use wasm_bindgen::prelude::*;

pub mod apportion;
pub mod auction;
pub mod channel;
pub mod config;
pub mod demand;
pub mod error;
pub mod market;
pub mod optimizer;
pub mod participant;
pub mod report;
pub mod roles;
pub mod types;
pub mod welfare;

pub use apportion::largest_remainder;
pub use auction::{AuctionEngine, Clearing, IterationRecord, MarketOutcome, SkipReason};
pub use channel::{ChannelConfig, Position};
pub use config::{AuctionConfig, BufferConfig, ClassProfile, SimConfig};
pub use demand::{ClippedPareto, DemandProfile, DemandTrace};
pub use error::{MarketError, MarketResult, SearchFailure};
pub use market::{Market, settle, spawn_participants};
pub use optimizer::{BidOptimizer, OptimalBid, SearchContext, SearchSettings};
pub use participant::{LossForecast, Participant, ParticipantParams};
pub use report::{ParticipantSummary, RunSummary, SlotReport};
pub use roles::{RoleAssigner, RunMode};
pub use types::*;
pub use welfare::{post_trade_welfare, pre_trade_welfare};

#[cfg(feature = "instrument")]
pub use instrument;

// ============================================================================
// WASM API - Simulation
// ============================================================================

fn js_error(e: impl std::fmt::Display) -> JsError {
    JsError::new(&e.to_string())
}

#[wasm_bindgen]
pub struct Simulation {
    market: Market,
}

#[wasm_bindgen]
impl Simulation {
    /// Build a market from a (possibly partial) config object; `undefined`
    /// runs the defaults.
    #[wasm_bindgen(constructor)]
    pub fn new(config: JsValue) -> Result<Simulation, JsError> {
        // Better panic messages in browser console
        console_error_panic_hook::set_once();

        let config: SimConfig = if config.is_undefined() || config.is_null() {
            SimConfig::default()
        } else {
            serde_wasm_bindgen::from_value(config).map_err(js_error)?
        };
        let market = Market::new(config).map_err(js_error)?;
        Ok(Self { market })
    }

    /// Run one slot and return its report
    #[wasm_bindgen]
    pub fn advance_slot(&mut self) -> Result<SlotReport, JsError> {
        self.market.step().cloned().map_err(js_error)
    }

    /// Run the remaining configured slots
    #[wasm_bindgen]
    pub fn run(&mut self) -> Result<RunSummary, JsError> {
        self.market.run().map_err(js_error)
    }

    #[wasm_bindgen]
    pub fn get_slot(&self, slot: u64) -> Option<SlotReport> {
        self.market.report(slot).cloned()
    }

    #[wasm_bindgen]
    pub fn get_current_slot(&self) -> u64 {
        self.market.current_slot()
    }

    #[wasm_bindgen]
    pub fn get_summary(&self) -> RunSummary {
        self.market.summary()
    }

    /// Every announced auction price so far, for plotting
    #[wasm_bindgen]
    pub fn price_trace(&self) -> js_sys::Float64Array {
        js_sys::Float64Array::from(self.market.price_trace().as_slice())
    }
}
