//! Physical layer: user mobility and the channel rate factor.
//!
//! Users wander the service area with a fixed-length random walk. Each slot the
//! rate factor (bits one resource block carries per slot) is recomputed from the
//! free-space received power at the broker and the Shannon capacity of the link:
//!
//! - `P_r = P_t * (λ / 4πd)^2` with unit antenna gains, `λ = c / f`
//! - `rate = (bandwidth / resource_blocks) * log2(1 + P_r / noise)`

use std::f64::consts::{PI, TAU};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tsify_next::Tsify;

pub const SPEED_OF_LIGHT: f64 = 3e8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Physical-layer constants. Defaults describe a 100m x 100m cell with the
/// broker mounted 10m above its centre, 2.4 GHz carrier, 360 kHz split into
/// 2000 resource blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub area_width: f64,
    pub area_height: f64,
    pub broker_x: f64,
    pub broker_y: f64,
    pub broker_height: f64,
    /// Watts
    pub transmit_power: f64,
    /// Watts (-96 dBm)
    pub noise: f64,
    /// Hz
    pub bandwidth: f64,
    pub resource_blocks: f64,
    /// Hz
    pub carrier_frequency: f64,
    /// Metres moved per slot
    pub mobility_step: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            area_width: 100.0,
            area_height: 100.0,
            broker_x: 50.0,
            broker_y: 50.0,
            broker_height: 10.0,
            transmit_power: 0.1,
            noise: 2.51e-13,
            bandwidth: 360_000.0,
            resource_blocks: 2000.0,
            carrier_frequency: 2.4e9,
            mobility_step: 10.0,
        }
    }
}

impl ChannelConfig {
    /// Uniform initial placement inside the service area.
    pub fn random_position<R: Rng + ?Sized>(&self, rng: &mut R) -> Position {
        Position {
            x: rng.random_range(0.0..=self.area_width),
            y: rng.random_range(0.0..=self.area_height),
        }
    }

    /// One random-walk step of `mobility_step` metres in a uniform direction.
    /// Moves that leave the area stop at the boundary.
    pub fn next_position<R: Rng + ?Sized>(&self, rng: &mut R, current: Position) -> Position {
        let angle: f64 = rng.random_range(0.0..TAU);
        Position {
            x: (current.x + self.mobility_step * angle.cos()).clamp(0.0, self.area_width),
            y: (current.y + self.mobility_step * angle.sin()).clamp(0.0, self.area_height),
        }
    }

    /// Line-of-sight distance to the elevated broker antenna.
    pub fn distance_to_broker(&self, position: Position) -> f64 {
        let dx = self.broker_x - position.x;
        let dy = self.broker_y - position.y;
        (dx * dx + dy * dy + self.broker_height * self.broker_height).sqrt()
    }

    pub fn wavelength(&self) -> f64 {
        SPEED_OF_LIGHT / self.carrier_frequency
    }

    /// Friis free-space received power.
    pub fn received_power(&self, distance: f64) -> f64 {
        let ratio = self.wavelength() / (4.0 * PI * distance);
        self.transmit_power * ratio * ratio
    }

    pub fn snr(&self, position: Position) -> f64 {
        self.received_power(self.distance_to_broker(position)) / self.noise
    }

    /// Bits one resource block carries at this position.
    pub fn rate_factor(&self, position: Position) -> f64 {
        self.bandwidth / self.resource_blocks * (1.0 + self.snr(position)).log2()
    }
}
