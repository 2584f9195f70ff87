//! Single-phase element-potential equilibrium.
//!
//! For one ideal multispecies phase the equilibrium composition has the
//! closed form `x_i = exp(sum_j a_ij lambda_j - mu0_i/RT)` where the
//! `lambda_j` are element potentials. Solving the M element balances plus
//! the mole-fraction normalization for `lambda` and the total moles is a
//! small dense Newton iteration, much faster than the full multiphase
//! machinery. The automatic solver tries this first and escalates on
//! failure.

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::thermo::StandardStateProvider;
use crate::{
    ElementType, EquilError, EquilOptions, EquilResult, Iterations, MultiPhase, UnknownKind,
};

/// Exponent clamp keeping `exp` finite during early iterations.
const Y_CLAMP: f64 = 300.0;

/// Largest element-potential update accepted per Newton step.
const STEP_CLAMP: f64 = 5.0;

/// Whether the element-potential formulation applies to this system: a
/// single ideal multispecies phase of mole-number species, with every
/// abundant element actually represented.
pub fn applicable(sys: &MultiPhase) -> bool {
    if sys.n_phases() != 1 {
        return false;
    }
    let ph = &sys.phases()[0];
    if ph.single_species || !ph.ideal_solution {
        return false;
    }
    if sys.species().iter().any(|s| s.unknown != UnknownKind::MoleNumber) {
        return false;
    }
    // A zero-abundance element would push its potential to -infinity;
    // leave those systems to the multiphase solver.
    let derived = sys.element_abundances();
    for (j, c) in sys.elements().iter().enumerate() {
        let goal = c.goal.unwrap_or(derived[j]);
        if c.etype == ElementType::AbsPos
            && goal == 0.0
            && sys.species().iter().any(|s| s.elements[j] != 0.0)
        {
            return false;
        }
    }
    true
}

/// Solves the single-phase equilibrium by Newton iteration on the element
/// potentials and the total moles.
///
/// On success the composition and chemical potentials are written into
/// `sys`; on any failure `sys` is left untouched so the caller can fall
/// back to the multiphase solver from the original state.
pub fn solve(
    sys: &mut MultiPhase,
    provider: &dyn StandardStateProvider,
    opts: &EquilOptions,
) -> EquilResult<Iterations> {
    if !applicable(sys) {
        return Err(EquilError::InvalidInput(
            "element-potential solver requires a single ideal multispecies phase".to_string(),
        ));
    }
    let nsp = sys.n_species();
    let nel = sys.n_elements();
    let t = sys.temperature();
    let p = sys.pressure();
    let rt = opts.units.rt_multiplier(t);

    let mut mu0 = vec![0.0; nsp];
    let mut v0 = vec![0.0; nsp];
    provider
        .update_standard_states(t, p, &mut mu0, &mut v0)
        .map_err(|reason| EquilError::ProviderFailure { phase: 0, reason })?;
    if mu0.iter().any(|m| !m.is_finite()) {
        return Err(EquilError::ProviderFailure {
            phase: 0,
            reason: "non-finite standard-state potential".to_string(),
        });
    }

    let a = DMatrix::from_fn(nsp, nel, |i, j| sys.species()[i].elements[j]);
    let derived = sys.element_abundances();
    let mut b = DVector::zeros(nel);
    for (j, c) in sys.elements().iter().enumerate() {
        let goal = c.goal.unwrap_or(derived[j]);
        if !c.goal_feasible(goal) {
            return Err(EquilError::InfeasibleElements(format!(
                "constraint {} resolves to inadmissible goal {}",
                c.name, goal
            )));
        }
        b[j] = goal;
    }
    let bnorm = b.amax();
    let tol = opts.rtol * (bnorm + 1.0);

    // Initial potentials from a least-squares fit of mu0 over the element
    // rows, weighted by the entry composition.
    let total0 = sys.total_moles();
    if total0 <= 0.0 {
        return Err(EquilError::InvalidInput("system holds no moles".to_string()));
    }
    let mut w = DMatrix::<f64>::zeros(nel, nel);
    let mut rhs = DVector::<f64>::zeros(nel);
    for i in 0..nsp {
        let wi = sys.moles()[i] / total0 + 1.0e-6;
        for j in 0..nel {
            for m in 0..nel {
                w[(j, m)] += wi * a[(i, j)] * a[(i, m)];
            }
            rhs[j] += wi * a[(i, j)] * mu0[i];
        }
    }
    let mut lambda = match w.lu().solve(&rhs) {
        Some(l) => l,
        None => DVector::zeros(nel),
    };
    let mut ln_ntot = total0.ln();

    let mut x = vec![0.0; nsp];
    let max_iter = opts.max_inner_iter;
    for iter in 1..=max_iter {
        let ntot = ln_ntot.exp();
        for i in 0..nsp {
            let mut y = -mu0[i];
            for j in 0..nel {
                y += a[(i, j)] * lambda[j];
            }
            x[i] = y.clamp(-Y_CLAMP, Y_CLAMP).exp();
        }

        // Residuals: element balances plus mole-fraction normalization.
        let mut f = DVector::zeros(nel + 1);
        for j in 0..nel {
            let mut s = 0.0;
            for i in 0..nsp {
                s += a[(i, j)] * x[i];
            }
            f[j] = ntot * s - b[j];
        }
        let xsum: f64 = x.iter().sum();
        f[nel] = xsum - 1.0;

        let res = f.amax();
        if res <= tol {
            if opts.log_level >= 2 {
                debug!("element-potential solver converged in {} iterations", iter);
            }
            write_back(sys, &x, ntot, &mu0, rt, &b);
            return Ok(Iterations {
                inner: iter,
                outer: 0,
                residual_g: 0.0,
                residual_elem: res,
                basis_rebuilds: 0,
            });
        }

        // Analytic Jacobian over (lambda, ln ntot).
        let mut jac = DMatrix::zeros(nel + 1, nel + 1);
        for j in 0..nel {
            for m in 0..nel {
                let mut s = 0.0;
                for i in 0..nsp {
                    s += a[(i, j)] * a[(i, m)] * x[i];
                }
                jac[(j, m)] = ntot * s;
            }
            let mut s = 0.0;
            for i in 0..nsp {
                s += a[(i, j)] * x[i];
            }
            jac[(j, nel)] = ntot * s;
        }
        for m in 0..nel {
            let mut s = 0.0;
            for i in 0..nsp {
                s += a[(i, m)] * x[i];
            }
            jac[(nel, m)] = s;
        }

        let dx = match jac.lu().solve(&(-f)) {
            Some(d) => d,
            None => {
                return Err(EquilError::NonConvergence {
                    iterations: iter,
                    residual_g: 0.0,
                    residual_elem: res,
                })
            }
        };
        let mut scale = 1.0;
        let dmax = dx.amax();
        if dmax > STEP_CLAMP {
            scale = STEP_CLAMP / dmax;
        }
        for j in 0..nel {
            lambda[j] += scale * dx[j];
        }
        ln_ntot += scale * dx[nel];
    }

    Err(EquilError::NonConvergence {
        iterations: max_iter,
        residual_g: 0.0,
        residual_elem: f64::NAN,
    })
}

fn write_back(sys: &mut MultiPhase, x: &[f64], ntot: f64, mu0: &[f64], rt: f64, b: &DVector<f64>) {
    let nsp = sys.n_species();
    let mut moles = vec![0.0; nsp];
    let mut mu = vec![0.0; nsp];
    for i in 0..nsp {
        moles[i] = ntot * x[i];
        mu[i] = (mu0[i] + x[i].max(f64::MIN_POSITIVE).ln()) * rt;
    }
    let phi: Vec<f64> = sys.phases().iter().map(|p| p.electric_potential).collect();
    let goals: Vec<f64> = b.iter().copied().collect();
    sys.write_back(&moles, &mu, &phi, &goals);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thermo::{Pdss, PdssManager};
    use crate::{ElementConstraint, Phase, Species};
    use approx::assert_relative_eq;

    fn dissociation_system() -> (MultiPhase, PdssManager) {
        // A2 = 2 A with mu0(A) chosen for an appreciable split
        let mut sys = MultiPhase::new();
        sys.add_element(ElementConstraint::element("A"));
        let gas = sys.add_phase(Phase::gas("gas"));
        sys.add_species(Species::new("A2", gas, vec![2.0])).unwrap();
        sys.add_species(Species::new("A", gas, vec![1.0])).unwrap();
        sys.set_moles(0, 1.0);
        let provider = PdssManager::new(vec![
            Pdss::Constant { mu0_rt: 0.0, molar_volume: 1.0 },
            Pdss::Constant { mu0_rt: 0.5, molar_volume: 1.0 },
        ]);
        (sys, provider)
    }

    #[test]
    fn test_applicability() {
        let (sys, _) = dissociation_system();
        assert!(applicable(&sys));

        let mut two_phase = MultiPhase::new();
        two_phase.add_element(ElementConstraint::element("C"));
        let gas = two_phase.add_phase(Phase::gas("gas"));
        let solid = two_phase.add_phase(Phase::stoichiometric("C(gr)"));
        two_phase.add_species(Species::new("CO2", gas, vec![1.0])).unwrap();
        two_phase.add_species(Species::new("C(gr)", solid, vec![1.0])).unwrap();
        assert!(!applicable(&two_phase));
    }

    #[test]
    fn test_dissociation_equilibrium() {
        let (mut sys, provider) = dissociation_system();
        let opts = EquilOptions::default();
        let iters = solve(&mut sys, &provider, &opts).unwrap();
        assert!(iters.inner > 0);
        // Equilibrium condition: mu(A2) = 2 mu(A)
        let mu = sys.chemical_potentials();
        assert_relative_eq!(mu[0], 2.0 * mu[1], max_relative = 1e-6);
        // Element balance
        let b = sys.element_abundances();
        assert_relative_eq!(b[0], 2.0, max_relative = 1e-8);
    }

    #[test]
    fn test_matches_law_of_mass_action() {
        let (mut sys, provider) = dissociation_system();
        let opts = EquilOptions::default();
        solve(&mut sys, &provider, &opts).unwrap();
        // K_x = x_A^2 / x_A2 = exp(-(2 mu0_A - mu0_A2))
        let x_a2 = sys.mole_fraction(0);
        let x_a = sys.mole_fraction(1);
        let k = x_a * x_a / x_a2;
        assert_relative_eq!(k, (-1.0f64).exp(), max_relative = 1e-6);
    }

    #[test]
    fn test_failure_leaves_state_untouched() {
        let (mut sys, provider) = dissociation_system();
        let before = sys.moles().to_vec();
        // A one-iteration budget cannot converge
        let opts = EquilOptions::default().with_max_inner_iter(1);
        let err = solve(&mut sys, &provider, &opts).unwrap_err();
        assert!(matches!(err, EquilError::NonConvergence { .. }));
        assert_eq!(sys.moles(), before.as_slice());
    }
}
