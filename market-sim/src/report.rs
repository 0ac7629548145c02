// ============================================================================
// Serializable run output for JS and JSON consumers
// ============================================================================

use serde::{Deserialize, Serialize};
use tsify_next::Tsify;

use crate::auction::{IterationRecord, SkipReason};
use crate::error::{MarketError, MarketResult};
use crate::participant::Participant;
use crate::roles::RunMode;
use crate::types::{Bits, Blocks, Price, UserClass};

/// Market snapshot of one completed slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi)]
pub struct SlotReport {
    pub slot: u64,
    /// Mean expected price used for role assignment
    pub mean_expected_price: Price,
    /// 0 when no auction ran
    pub start_price: Price,
    /// 0 when no auction ran
    pub clearing_price: Price,
    /// Σ sellers' assigned blocks committed to the auction
    pub total_supply: Blocks,
    pub buyers: u32,
    pub sellers: u32,
    pub skipped: Option<SkipReason>,
    pub trace: Vec<IterationRecord>,
    pub pre_trade_welfare: f64,
    /// Welfare at the settled integer positions
    pub welfare: f64,
    /// Whole blocks gained (+) or released (-), one per participant
    pub trades: Vec<i64>,
}

impl SlotReport {
    pub fn iterations(&self) -> u32 {
        self.trace.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi)]
pub struct ParticipantSummary {
    pub id: u32,
    pub class: UserClass,
    pub willingness_to_keep: f64,
    pub buffer_level: Bits,
    pub loss_slots: u32,
    pub loss_amount: Bits,
    pub waste_slots: u32,
    pub waste_amount: Bits,
    pub buyer_slots: u32,
    pub seller_slots: u32,
    /// Σ utility over every recorded bid
    pub utility_sum: f64,
}

impl ParticipantSummary {
    pub fn of(p: &Participant) -> Self {
        // First entry is the construction-time role
        let roles = p.history.roles.iter().skip(1);
        let buyer_slots = roles.clone().filter(|r| r.is_buyer()).count() as u32;
        let seller_slots = roles.filter(|r| r.is_seller()).count() as u32;
        Self {
            id: p.id.0,
            class: p.class,
            willingness_to_keep: p.willingness_to_keep,
            buffer_level: p.buffer_level,
            loss_slots: p.counters.loss_slots,
            loss_amount: p.counters.loss_amount,
            waste_slots: p.counters.waste_slots,
            waste_amount: p.counters.waste_amount,
            buyer_slots,
            seller_slots,
            utility_sum: p.history.utilities.iter().sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi)]
pub struct RunSummary {
    pub mode: RunMode,
    pub slots: u64,
    pub loss_slots: u32,
    pub loss_amount: Bits,
    pub waste_slots: u32,
    pub waste_amount: Bits,
    /// Σ per-slot welfare
    pub total_welfare: f64,
    /// 0 before the first slot
    pub min_welfare: f64,
    pub participants: Vec<ParticipantSummary>,
}

impl RunSummary {
    pub fn new(mode: RunMode, participants: &[Participant], reports: &[SlotReport]) -> Self {
        let participants: Vec<_> = participants.iter().map(ParticipantSummary::of).collect();
        let min_welfare = reports
            .iter()
            .map(|r| r.welfare)
            .min_by(f64::total_cmp)
            .unwrap_or(0.0);

        Self {
            mode,
            slots: reports.len() as u64,
            loss_slots: participants.iter().map(|p| p.loss_slots).sum(),
            loss_amount: participants.iter().map(|p| p.loss_amount).sum(),
            waste_slots: participants.iter().map(|p| p.waste_slots).sum(),
            waste_amount: participants.iter().map(|p| p.waste_amount).sum(),
            total_welfare: reports.iter().map(|r| r.welfare).sum(),
            min_welfare,
            participants,
        }
    }

    pub fn to_json(&self) -> MarketResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| MarketError::Serialization(e.to_string()))
    }
}
