//! Per-participant bid optimization.
//!
//! A buyer bidding `bid` at `price` asks for `a = bid / price` blocks and
//! internalizes that its own demand moves the price in proportion to its share
//! of total supply `S`:
//!
//! `payoff = (1 - a/S) u(a) + (∫_0^a u) / S - bid`
//!
//! A seller bidding `bid` keeps `bid / price` of its allocation `A` and sells
//! `m = A - bid / price`; its own allocation is excluded from the impact base:
//!
//! `payoff = A price - bid + (1 + m/(S - A)) u(-m) + (∫_-m^0 u) / (S - A)`
//!
//! The best bid is found by bounded Brent minimization of `-payoff`.

use crate::error::{MarketError, MarketResult, SearchFailure};
use crate::participant::Participant;
use crate::types::{Blocks, Price, Role};

// === PAYOFFS ===

pub fn buyer_payoff(
    participant: &Participant,
    bid: Price,
    price: Price,
    total_supply: Blocks,
) -> MarketResult<f64> {
    let amount = bid / price;
    let share = amount / total_supply;
    Ok((1.0 - share) * participant.utility(amount)?
        + participant.utility_integral(amount)? / total_supply
        - bid)
}

pub fn seller_payoff(
    participant: &Participant,
    bid: Price,
    price: Price,
    total_supply: Blocks,
) -> MarketResult<f64> {
    let assigned = participant.assigned_blocks;
    let sold = assigned - bid / price;
    let others = total_supply - assigned;
    if !(others > 0.0) {
        return Err(MarketError::InvalidConfig(format!(
            "seller {} holds the entire supply ({total_supply} blocks)",
            participant.id
        )));
    }
    // ∫_{-sold}^0 u = -∫_0^{-sold} u
    Ok(assigned * price - bid
        + (1.0 + sold / others) * participant.utility(-sold)?
        - participant.utility_integral(-sold)? / others)
}

pub fn payoff(
    participant: &Participant,
    role: Role,
    bid: Price,
    price: Price,
    total_supply: Blocks,
) -> MarketResult<f64> {
    match role {
        Role::Buyer => buyer_payoff(participant, bid, price, total_supply),
        Role::Seller => seller_payoff(participant, bid, price, total_supply),
    }
}

// === BOUNDED SEARCH ===

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchSettings {
    /// Absolute tolerance on the minimizer
    pub tolerance: f64,
    pub max_evaluations: u32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-5,
            max_evaluations: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Minimum {
    pub x: f64,
    pub value: f64,
    pub evaluations: u32,
    /// Set when the search stopped without meeting its tolerance.
    pub failure: Option<SearchFailure>,
}

fn sign_or_one(v: f64) -> f64 {
    if v < 0.0 { -1.0 } else { 1.0 }
}

/// Brent's bounded scalar minimization: golden-section steps with parabolic
/// interpolation when the last fit is trustworthy. Endpoints are never
/// evaluated. Errors from the objective abort the search and are returned
/// as-is; search failures are reported in `Minimum::failure`.
pub fn minimize_bounded<E>(
    mut objective: impl FnMut(f64) -> Result<f64, E>,
    lower: f64,
    upper: f64,
    settings: &SearchSettings,
) -> Result<Minimum, E> {
    if !(lower.is_finite() && upper.is_finite()) || lower > upper {
        return Ok(Minimum {
            x: lower,
            value: f64::NAN,
            evaluations: 0,
            failure: Some(SearchFailure::InvalidBounds(lower, upper)),
        });
    }

    let sqrt_eps = f64::EPSILON.sqrt();
    let golden_mean = 0.5 * (3.0 - 5.0_f64.sqrt());
    let third_tol = settings.tolerance / 3.0;

    let (mut a, mut b) = (lower, upper);
    let mut fulc = a + golden_mean * (b - a);
    let mut nfc = fulc;
    let mut xf = fulc;
    let mut rat: f64 = 0.0;
    let mut e: f64 = 0.0;

    let mut fx = objective(xf)?;
    let mut evaluations = 1;
    let mut fu = f64::INFINITY;
    let mut ffulc = fx;
    let mut fnfc = fx;
    let mut xm = 0.5 * (a + b);
    let mut tol1 = sqrt_eps * xf.abs() + third_tol;
    let mut tol2 = 2.0 * tol1;
    let mut failure = None;

    while (xf - xm).abs() > tol2 - 0.5 * (b - a) {
        let mut golden = true;

        if e.abs() > tol1 {
            golden = false;
            let mut r = (xf - nfc) * (fx - ffulc);
            let mut q = (xf - fulc) * (fx - fnfc);
            let mut p = (xf - fulc) * q - (xf - nfc) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            r = e;
            e = rat;

            if p.abs() < (0.5 * q * r).abs() && p > q * (a - xf) && p < q * (b - xf) {
                rat = p / q;
                let x = xf + rat;
                if (x - a) < tol2 || (b - x) < tol2 {
                    rat = tol1 * sign_or_one(xm - xf);
                }
            } else {
                golden = true;
            }
        }

        if golden {
            e = if xf >= xm { a - xf } else { b - xf };
            rat = golden_mean * e;
        }

        let x = xf + sign_or_one(rat) * rat.abs().max(tol1);
        fu = objective(x)?;
        evaluations += 1;

        if fu <= fx {
            if x >= xf {
                a = xf;
            } else {
                b = xf;
            }
            fulc = nfc;
            ffulc = fnfc;
            nfc = xf;
            fnfc = fx;
            xf = x;
            fx = fu;
        } else {
            if x < xf {
                a = x;
            } else {
                b = x;
            }
            if fu <= fnfc || nfc == xf {
                fulc = nfc;
                ffulc = fnfc;
                nfc = x;
                fnfc = fu;
            } else if fu <= ffulc || fulc == xf || fulc == nfc {
                fulc = x;
                ffulc = fu;
            }
        }

        xm = 0.5 * (a + b);
        tol1 = sqrt_eps * xf.abs() + third_tol;
        tol2 = 2.0 * tol1;

        if evaluations >= settings.max_evaluations {
            failure = Some(SearchFailure::BudgetExhausted(settings.max_evaluations));
            break;
        }
    }

    if xf.is_nan() || fx.is_nan() || fu.is_nan() {
        failure = Some(SearchFailure::NotANumber);
    }

    Ok(Minimum {
        x: xf,
        value: fx,
        evaluations,
        failure,
    })
}

// === BID OPTIMIZER ===

/// Where in the run a bid search happens, for error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchContext {
    pub slot: u64,
    pub iteration: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimalBid {
    pub bid: Price,
    pub payoff: f64,
    /// Utility of the resulting net position (bought, or minus sold)
    pub utility: f64,
    /// Signed blocks: bought (+) for a buyer, sold (-) for a seller
    pub net_blocks: Blocks,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BidOptimizer {
    pub settings: SearchSettings,
}

impl BidOptimizer {
    pub fn new(settings: SearchSettings) -> Self {
        Self { settings }
    }

    /// Feasible bid interval. A buyer may bid for the whole supply; a seller
    /// may keep its whole allocation but never sell past the point where its
    /// utility argument turns negative.
    pub fn bid_bounds(
        &self,
        participant: &Participant,
        role: Role,
        price: Price,
        total_supply: Blocks,
    ) -> MarketResult<(Price, Price)> {
        // Fails when the forecast loss already exceeds capacity
        participant.utility(0.0)?;

        match role {
            Role::Buyer => Ok((0.0, total_supply * price)),
            Role::Seller => {
                let assigned = participant.assigned_blocks;
                let sellable = participant.max_releasable().min(assigned);
                Ok(((assigned - sellable) * price, assigned * price))
            }
        }
    }

    pub fn optimal_bid(
        &self,
        participant: &Participant,
        role: Role,
        price: Price,
        total_supply: Blocks,
        context: SearchContext,
    ) -> MarketResult<OptimalBid> {
        let (lower, upper) = self.bid_bounds(participant, role, price, total_supply)?;

        let minimum = minimize_bounded(
            |bid| payoff(participant, role, bid, price, total_supply).map(|v| -v),
            lower,
            upper,
            &self.settings,
        )?;

        if let Some(reason) = minimum.failure {
            return Err(MarketError::OptimizationFailed {
                participant: participant.id,
                role,
                slot: context.slot,
                iteration: context.iteration,
                reason,
            });
        }

        let bid = minimum.x;
        let net_blocks = match role {
            Role::Buyer => bid / price,
            Role::Seller => bid / price - participant.assigned_blocks,
        };

        Ok(OptimalBid {
            bid,
            payoff: -minimum.value,
            utility: participant.utility(net_blocks)?,
            net_blocks,
        })
    }
}
