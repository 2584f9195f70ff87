//! Outer state driver for non-(T,P) specifications.
//!
//! The Gibbs minimizer works at fixed temperature and pressure. To satisfy a
//! different pair of state variables, an outer Newton iteration adjusts T
//! and/or P, re-equilibrating at each trial state and differencing the inner
//! solutions for derivatives. Property targets are extensive SI quantities:
//! enthalpy [J], entropy [J/K], internal energy [J], volume [m^3].
//!
//! Temperature is bracketed in [200, 1e5] K and pressure in [1e-3, 1e10] Pa;
//! steps are damped to stay inside the brackets and to move at most a factor
//! of two per iteration. An inner non-convergence is retried once with a
//! doubled iteration budget before the failure surfaces.

use log::debug;
use nalgebra::{Matrix2, Vector2};

use crate::thermo::{mixture_properties, MixtureProperties, StandardStateProvider};
use crate::{equilibrate_tp, EquilError, EquilOptions, EquilResult, Iterations, MultiPhase};

/// Temperature bracket [K].
const T_MIN: f64 = 200.0;
const T_MAX: f64 = 1.0e5;
/// Pressure bracket [Pa].
const P_MIN: f64 = 1.0e-3;
const P_MAX: f64 = 1.0e10;

/// The pair of state variables held fixed during equilibration.
///
/// The two values passed to [`crate::equilibrate`] are interpreted in the
/// order the variant is named: `HP` takes (enthalpy, pressure), `SV` takes
/// (entropy, volume), and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyPair {
    /// Temperature [K] and pressure [Pa].
    TP,
    /// Enthalpy [J] and pressure [Pa].
    HP,
    /// Entropy [J/K] and pressure [Pa].
    SP,
    /// Entropy [J/K] and volume [m^3].
    SV,
    /// Temperature [K] and volume [m^3].
    TV,
    /// Internal energy [J] and volume [m^3].
    UV,
}

/// Which scalar property a 1-D outer iteration matches.
#[derive(Clone, Copy)]
enum Target {
    Enthalpy,
    Entropy,
    InternalEnergy,
    Volume,
}

fn extract(props: &MixtureProperties, target: Target) -> f64 {
    match target {
        Target::Enthalpy => props.enthalpy,
        Target::Entropy => props.entropy,
        Target::InternalEnergy => props.internal_energy,
        Target::Volume => props.volume,
    }
}

struct OuterState<'a> {
    provider: &'a dyn StandardStateProvider,
    opts: &'a EquilOptions,
    inner_total: u32,
    outer: u32,
    last: Iterations,
}

impl<'a> OuterState<'a> {
    /// Runs the inner equilibration, retrying once with a doubled budget on
    /// non-convergence.
    fn inner(&mut self, sys: &mut MultiPhase, t: f64, p: f64) -> EquilResult<()> {
        match equilibrate_tp(sys, self.provider, t, p, self.opts) {
            Ok(iters) => {
                self.inner_total += iters.inner;
                self.last = iters;
                Ok(())
            }
            Err(EquilError::NonConvergence { .. }) => {
                let retry = self
                    .opts
                    .clone()
                    .with_max_inner_iter(self.opts.max_inner_iter.saturating_mul(2));
                let iters = equilibrate_tp(sys, self.provider, t, p, &retry)?;
                self.inner_total += iters.inner;
                self.last = iters;
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    fn stats(&self) -> Iterations {
        Iterations {
            inner: self.inner_total,
            outer: self.outer,
            residual_g: self.last.residual_g,
            residual_elem: self.last.residual_elem,
            basis_rebuilds: self.last.basis_rebuilds,
        }
    }
}

/// Dispatches an `equilibrate` call for the given property pair.
pub(crate) fn equilibrate_pair(
    sys: &mut MultiPhase,
    provider: &dyn StandardStateProvider,
    pair: PropertyPair,
    v1: f64,
    v2: f64,
    opts: &EquilOptions,
) -> EquilResult<Iterations> {
    match pair {
        PropertyPair::TP => equilibrate_tp(sys, provider, v1, v2, opts),
        PropertyPair::HP => solve_scalar_t(sys, provider, Target::Enthalpy, v1, v2, opts),
        PropertyPair::SP => solve_scalar_t(sys, provider, Target::Entropy, v1, v2, opts),
        PropertyPair::TV => solve_scalar_p(sys, provider, v1, Target::Volume, v2, opts),
        PropertyPair::SV => solve_tp_pair(sys, provider, Target::Entropy, v1, v2, opts),
        PropertyPair::UV => solve_tp_pair(sys, provider, Target::InternalEnergy, v1, v2, opts),
    }
}

/// 1-D Newton on temperature at fixed pressure, matching one extensive
/// property (HP and SP specifications).
fn solve_scalar_t(
    sys: &mut MultiPhase,
    provider: &dyn StandardStateProvider,
    target: Target,
    value: f64,
    pressure: f64,
    opts: &EquilOptions,
) -> EquilResult<Iterations> {
    let mut state = OuterState { provider, opts, inner_total: 0, outer: 0, last: Iterations::default() };
    let mut t = sys.temperature().clamp(T_MIN, T_MAX);
    let tol = opts.rtol * (value.abs() + 1.0);

    for _ in 0..opts.max_outer_iter {
        state.outer += 1;
        state.inner(sys, t, pressure)?;
        let props = mixture_properties(sys, provider)?;
        let res = extract(&props, target) - value;
        if opts.log_level >= 2 {
            debug!("outer iter {}: T = {:.4} K, residual {:.4e}", state.outer, t, res);
        }
        if res.abs() <= tol {
            return Ok(state.stats());
        }

        // Finite-difference derivative of the property along T, using the
        // converged composition as the next starting point.
        let dt = (1.0e-4 * t).max(1.0e-3);
        state.inner(sys, t + dt, pressure)?;
        let props2 = mixture_properties(sys, provider)?;
        let deriv = (extract(&props2, target) - (res + value)) / dt;

        let mut t_new = if deriv.is_finite() && deriv != 0.0 {
            t - res / deriv
        } else if res > 0.0 {
            0.9 * t
        } else {
            1.1 * t
        };
        t_new = t_new.clamp(0.5 * t, 2.0 * t).clamp(T_MIN, T_MAX);
        t = t_new;
    }
    Err(EquilError::NonConvergence {
        iterations: state.outer,
        residual_g: state.last.residual_g,
        residual_elem: state.last.residual_elem,
    })
}

/// 1-D Newton on pressure at fixed temperature (TV specification). The
/// iteration works in ln P since volume spans decades across the bracket.
fn solve_scalar_p(
    sys: &mut MultiPhase,
    provider: &dyn StandardStateProvider,
    temperature: f64,
    target: Target,
    value: f64,
    opts: &EquilOptions,
) -> EquilResult<Iterations> {
    let mut state = OuterState { provider, opts, inner_total: 0, outer: 0, last: Iterations::default() };
    let mut lnp = sys.pressure().clamp(P_MIN, P_MAX).ln();
    let tol = opts.rtol * (value.abs() + 1.0);

    for _ in 0..opts.max_outer_iter {
        state.outer += 1;
        let p = lnp.exp();
        state.inner(sys, temperature, p)?;
        let props = mixture_properties(sys, provider)?;
        let res = extract(&props, target) - value;
        if opts.log_level >= 2 {
            debug!("outer iter {}: P = {:.4e} Pa, residual {:.4e}", state.outer, p, res);
        }
        if res.abs() <= tol {
            return Ok(state.stats());
        }

        let dlnp = 1.0e-4;
        state.inner(sys, temperature, (lnp + dlnp).exp())?;
        let props2 = mixture_properties(sys, provider)?;
        let deriv = (extract(&props2, target) - (res + value)) / dlnp;

        let mut lnp_new = if deriv.is_finite() && deriv != 0.0 {
            lnp - res / deriv
        } else if res > 0.0 {
            lnp + 0.5
        } else {
            lnp - 0.5
        };
        lnp_new = lnp_new.clamp(lnp - 2.0, lnp + 2.0).clamp(P_MIN.ln(), P_MAX.ln());
        lnp = lnp_new;
    }
    Err(EquilError::NonConvergence {
        iterations: state.outer,
        residual_g: state.last.residual_g,
        residual_elem: state.last.residual_elem,
    })
}

/// 2-D Newton on (T, ln P), matching one caloric property plus the volume
/// (SV and UV specifications).
fn solve_tp_pair(
    sys: &mut MultiPhase,
    provider: &dyn StandardStateProvider,
    target: Target,
    value: f64,
    volume: f64,
    opts: &EquilOptions,
) -> EquilResult<Iterations> {
    let mut state = OuterState { provider, opts, inner_total: 0, outer: 0, last: Iterations::default() };
    let mut t = sys.temperature().clamp(T_MIN, T_MAX);
    let mut lnp = sys.pressure().clamp(P_MIN, P_MAX).ln();
    let tol1 = opts.rtol * (value.abs() + 1.0);
    let tol2 = opts.rtol * (volume.abs() + 1.0);

    for _ in 0..opts.max_outer_iter {
        state.outer += 1;
        state.inner(sys, t, lnp.exp())?;
        let props = mixture_properties(sys, provider)?;
        let r1 = extract(&props, target) - value;
        let r2 = props.volume - volume;
        if opts.log_level >= 2 {
            debug!(
                "outer iter {}: T = {:.4} K, P = {:.4e} Pa, residuals ({:.3e}, {:.3e})",
                state.outer,
                t,
                lnp.exp(),
                r1,
                r2
            );
        }
        if r1.abs() <= tol1 && r2.abs() <= tol2 {
            return Ok(state.stats());
        }

        let dt = (1.0e-4 * t).max(1.0e-3);
        state.inner(sys, t + dt, lnp.exp())?;
        let pt = mixture_properties(sys, provider)?;
        let dlnp = 1.0e-4;
        state.inner(sys, t, (lnp + dlnp).exp())?;
        let pp = mixture_properties(sys, provider)?;

        let jac = Matrix2::new(
            (extract(&pt, target) - (r1 + value)) / dt,
            (extract(&pp, target) - (r1 + value)) / dlnp,
            (pt.volume - (r2 + volume)) / dt,
            (pp.volume - (r2 + volume)) / dlnp,
        );
        let rhs = Vector2::new(-r1, -r2);
        let step = match jac.lu().solve(&rhs) {
            Some(s) if s[0].is_finite() && s[1].is_finite() => s,
            _ => {
                return Err(EquilError::NonConvergence {
                    iterations: state.outer,
                    residual_g: state.last.residual_g,
                    residual_elem: state.last.residual_elem,
                })
            }
        };
        t = (t + step[0].clamp(-0.5 * t, 0.5 * t)).clamp(T_MIN, T_MAX);
        lnp = (lnp + step[1].clamp(-2.0, 2.0)).clamp(P_MIN.ln(), P_MAX.ln());
    }
    Err(EquilError::NonConvergence {
        iterations: state.outer,
        residual_g: state.last.residual_g,
        residual_elem: state.last.residual_elem,
    })
}
