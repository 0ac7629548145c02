// Core ID types, units and roles

use std::fmt;

use serde::{Deserialize, Serialize};
use tsify_next::Tsify;

// === TYPE ALIASES ===

/// Currency per resource block.
pub type Price = f64;
/// Resource blocks (RB), the atomic unit of tradable capacity.
pub type Blocks = f64;
/// Buffer, demand and loss volumes, in bits.
pub type Bits = f64;

// === NEWTYPE IDS ===

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ParticipantId(pub u32);

impl ParticipantId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// === CLASSES ===

/// The two traffic classes. High-bandwidth users hold a large baseline
/// allocation; low-rate users hold a tenth of it but value retained capacity more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub enum UserClass {
    HighBandwidth,
    LowRate,
}

impl UserClass {
    pub fn label(&self) -> &'static str {
        match self {
            UserClass::HighBandwidth => "HB",
            UserClass::LowRate => "LR",
        }
    }
}

// === ROLES ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub enum Role {
    Buyer,
    Seller,
}

impl Role {
    pub fn is_buyer(&self) -> bool {
        matches!(self, Role::Buyer)
    }

    pub fn is_seller(&self) -> bool {
        matches!(self, Role::Seller)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Buyer => f.write_str("buyer"),
            Role::Seller => f.write_str("seller"),
        }
    }
}
