//! Exogenous per-slot demand traces.
//!
//! Every participant receives one trace at construction, sampled once from
//! the shared seeded generator and consumed read-only afterwards.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{MarketError, MarketResult};
use crate::types::Bits;

const SHAPE_SEARCH_MIN: f64 = 1e-6;
const SHAPE_SEARCH_MAX: f64 = 1e6;
const SHAPE_BISECTION_STEPS: u32 = 200;

// === PROFILES ===

/// Distribution a class draws its per-slot demand from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DemandProfile {
    /// Pareto tail starting at `min`, clipped at `max`, shaped to average `mean`.
    Pareto { min: Bits, max: Bits, mean: Bits },
    Uniform { min: Bits, max: Bits },
}

impl DemandProfile {
    pub fn sample_trace<R: Rng + ?Sized>(&self, rng: &mut R, len: usize) -> MarketResult<DemandTrace> {
        let values = match *self {
            DemandProfile::Pareto { min, max, mean } => {
                let dist = ClippedPareto::new(min, max, mean)?;
                (0..len).map(|_| dist.sample(rng)).collect()
            }
            DemandProfile::Uniform { min, max } => {
                if !(min >= 0.0 && max >= min && max.is_finite()) {
                    return Err(MarketError::InvalidDistribution(format!(
                        "uniform bounds [{min}, {max}]"
                    )));
                }
                (0..len).map(|_| rng.random_range(min..=max)).collect()
            }
        };
        DemandTrace::new(values)
    }
}

// === CLIPPED PARETO ===

/// Pareto(min, alpha) samples with every draw above `max` replaced by `max`.
///
/// The shape is chosen so the mean of the clipped variable equals the target:
/// `E[min(X, max)] = min + min / (alpha - 1) * (1 - (min / max)^(alpha - 1))`,
/// which falls monotonically from `max` (alpha -> 0) to `min` (alpha -> inf).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedPareto {
    pub min: Bits,
    pub max: Bits,
    pub alpha: f64,
}

impl ClippedPareto {
    pub fn new(min: Bits, max: Bits, mean: Bits) -> MarketResult<Self> {
        if !(min > 0.0) || !min.is_finite() {
            return Err(MarketError::InvalidDistribution(format!(
                "min must be positive, got {min}"
            )));
        }
        if !(max >= min) || !max.is_finite() {
            return Err(MarketError::InvalidDistribution(format!(
                "max ({max}) must be at least min ({min})"
            )));
        }
        if !(mean >= min) {
            return Err(MarketError::InvalidDistribution(format!(
                "mean ({mean}) must be at least min ({min})"
            )));
        }
        if mean == min {
            return Ok(Self {
                min,
                max,
                alpha: f64::INFINITY,
            });
        }
        if mean >= max {
            return Err(MarketError::InvalidDistribution(format!(
                "mean ({mean}) must be below max ({max})"
            )));
        }

        // Bisection on ln(alpha); clipped_mean is decreasing in alpha.
        let mut lo = SHAPE_SEARCH_MIN.ln();
        let mut hi = SHAPE_SEARCH_MAX.ln();
        for _ in 0..SHAPE_BISECTION_STEPS {
            let mid = 0.5 * (lo + hi);
            if clipped_mean(min, max, mid.exp()) > mean {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        Ok(Self {
            min,
            max,
            alpha: (0.5 * (lo + hi)).exp(),
        })
    }

    pub fn mean(&self) -> Bits {
        if self.alpha.is_infinite() {
            self.min
        } else {
            clipped_mean(self.min, self.max, self.alpha)
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Bits {
        // u in (0, 1] keeps the inverse CDF finite
        let u: f64 = 1.0 - rng.random::<f64>();
        (self.min * u.powf(-1.0 / self.alpha)).min(self.max)
    }
}

fn clipped_mean(min: f64, max: f64, alpha: f64) -> f64 {
    let k = alpha - 1.0;
    if k.abs() < 1e-9 {
        min + min * (max / min).ln()
    } else {
        min + min / k * (1.0 - (min / max).powf(k))
    }
}

// === TRACE ===

/// Finite, non-negative per-slot demand sequence indexed by round.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DemandTrace {
    values: Vec<Bits>,
}

impl DemandTrace {
    pub fn new(values: Vec<Bits>) -> MarketResult<Self> {
        if let Some((round, value)) = values
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(MarketError::InvalidDistribution(format!(
                "demand at round {round} is {value}"
            )));
        }
        Ok(Self { values })
    }

    pub fn at(&self, round: usize) -> Option<Bits> {
        self.values.get(round).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Bits] {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn clipped_pareto_hits_target_mean() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(2025);
        for (min, max, mean) in [(1e8, 1.5e8, 1.08e8), (1e7, 1e8, 1.1e7)] {
            let dist = ClippedPareto::new(min, max, mean).unwrap();
            assert!((dist.mean() - mean).abs() / mean < 1e-9, "analytic mean {}", dist.mean());

            let n = 20_000;
            let samples: Vec<f64> = (0..n).map(|_| dist.sample(&mut rng)).collect();
            let empirical = samples.iter().sum::<f64>() / n as f64;
            assert!(
                (empirical - mean).abs() / mean < 0.02,
                "empirical mean {empirical} vs target {mean}"
            );
            assert!(samples.iter().all(|s| *s >= min && *s <= max));
        }
    }

    #[test]
    fn degenerate_mean_gives_constant_trace() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let profile = DemandProfile::Pareto {
            min: 5.0,
            max: 10.0,
            mean: 5.0,
        };
        let trace = profile.sample_trace(&mut rng, 16).unwrap();
        assert!(trace.values().iter().all(|v| *v == 5.0));
    }

    #[test]
    fn invalid_pareto_parameters_are_rejected() {
        assert!(ClippedPareto::new(0.0, 1.0, 0.5).is_err());
        assert!(ClippedPareto::new(2.0, 1.0, 1.5).is_err());
        assert!(ClippedPareto::new(1.0, 2.0, 0.5).is_err());
        assert!(ClippedPareto::new(1.0, 2.0, 2.0).is_err());
    }

    #[test]
    fn trace_rejects_negative_demand() {
        assert!(DemandTrace::new(vec![1.0, -0.5]).is_err());
        assert!(DemandTrace::new(vec![1.0, f64::NAN]).is_err());
        let trace = DemandTrace::new(vec![1.0, 2.0]).unwrap();
        assert_eq!(trace.at(1), Some(2.0));
        assert_eq!(trace.at(2), None);
    }

    #[test]
    fn uniform_trace_respects_bounds() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let profile = DemandProfile::Uniform { min: 100.0, max: 400.0 };
        let trace = profile.sample_trace(&mut rng, 500).unwrap();
        assert_eq!(trace.len(), 500);
        assert!(trace.values().iter().all(|v| (100.0..=400.0).contains(v)));
    }
}
