//! Phase model and activity-coefficient variants.
//!
//! A phase is a region of uniform intensive state. Single-species phases
//! (stoichiometric solids) have unit activity; multispecies phases are
//! solutions whose nonideality is described by an [`ActivityModel`].
//!
//! Activity models expose a small capability set: `update_ln_gamma` is
//! mandatory, the mole-number Jacobian `update_d_ln_gamma_dn` is optional and
//! only consulted when the solver's Hessian correction is enabled. Both must
//! be pure functions of the phase-local mole numbers.

use nalgebra::DMatrix;

/// Activity-coefficient Jacobian callback support.
///
/// Implementors provide `ln gamma` for all species of one phase and may
/// optionally provide the phase-local Jacobian `d ln gamma_i / d n_j`.
pub trait ActivityCallback {
    /// Writes `ln gamma` for each phase-local species into `ln_g`.
    fn ln_gamma(&self, n_local: &[f64], ln_g: &mut [f64]);

    /// Writes the phase-local Jacobian into `jac` and returns `true`, or
    /// returns `false` if the model does not supply derivatives.
    fn d_ln_gamma_dn(&self, _n_local: &[f64], _jac: &mut DMatrix<f64>) -> bool {
        false
    }
}

/// Activity-coefficient model of a multispecies phase.
pub enum ActivityModel {
    /// Ideal solution, `gamma = 1` for every species.
    Ideal,
    /// Debye-Hueckel limiting law on a mole-fraction ionic strength,
    /// `ln gamma_i = -A z_i^2 sqrt(I)`.
    DebyeHuckel {
        /// Debye slope A for the solvent at the state of interest.
        a_debye: f64,
        /// Charges of the phase-local species, in phase order.
        charges: Vec<f64>,
    },
    /// Two-parameter Margules binary solution.
    Margules {
        /// Interaction parameter A12 (dimensionless, already over RT).
        a12: f64,
        /// Interaction parameter A21.
        a21: f64,
    },
    /// Caller-supplied model.
    UserCallback(Box<dyn ActivityCallback + Send>),
}

impl std::fmt::Debug for ActivityModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityModel::Ideal => write!(f, "Ideal"),
            ActivityModel::DebyeHuckel { a_debye, .. } => {
                write!(f, "DebyeHuckel {{ a_debye: {} }}", a_debye)
            }
            ActivityModel::Margules { a12, a21 } => {
                write!(f, "Margules {{ a12: {}, a21: {} }}", a12, a21)
            }
            ActivityModel::UserCallback(_) => write!(f, "UserCallback"),
        }
    }
}

impl ActivityModel {
    /// Whether the model is the ideal solution.
    pub fn is_ideal(&self) -> bool {
        matches!(self, ActivityModel::Ideal)
    }

    /// Evaluates `ln gamma` for the phase-local composition.
    pub fn update_ln_gamma(&self, n_local: &[f64], ln_g: &mut [f64]) {
        match self {
            ActivityModel::Ideal => ln_g.fill(0.0),
            ActivityModel::DebyeHuckel { a_debye, charges } => {
                let total: f64 = n_local.iter().sum();
                if total <= 0.0 {
                    ln_g.fill(0.0);
                    return;
                }
                let ionic: f64 = n_local
                    .iter()
                    .zip(charges)
                    .map(|(n, z)| 0.5 * n * z * z)
                    .sum::<f64>()
                    / total;
                let sqrt_i = ionic.max(0.0).sqrt();
                for (g, z) in ln_g.iter_mut().zip(charges) {
                    *g = -a_debye * z * z * sqrt_i;
                }
            }
            ActivityModel::Margules { a12, a21 } => {
                let total: f64 = n_local.iter().sum();
                if total <= 0.0 || n_local.len() != 2 {
                    ln_g.fill(0.0);
                    return;
                }
                let x1 = n_local[0] / total;
                let x2 = 1.0 - x1;
                ln_g[0] = x2 * x2 * (a12 + 2.0 * (a21 - a12) * x1);
                ln_g[1] = x1 * x1 * (a21 + 2.0 * (a12 - a21) * x2);
            }
            ActivityModel::UserCallback(cb) => cb.ln_gamma(n_local, ln_g),
        }
    }

    /// Evaluates the phase-local Jacobian `d ln gamma_i / d n_j`.
    ///
    /// Returns `false` when the model carries no derivative information; the
    /// solver then skips the Hessian correction for this phase.
    pub fn update_d_ln_gamma_dn(&self, n_local: &[f64], jac: &mut DMatrix<f64>) -> bool {
        match self {
            ActivityModel::Ideal => {
                jac.fill(0.0);
                true
            }
            ActivityModel::DebyeHuckel { a_debye, charges } => {
                let total: f64 = n_local.iter().sum();
                if total <= 0.0 {
                    jac.fill(0.0);
                    return true;
                }
                let ionic: f64 = n_local
                    .iter()
                    .zip(charges)
                    .map(|(n, z)| 0.5 * n * z * z)
                    .sum::<f64>()
                    / total;
                let sqrt_i = ionic.max(0.0).sqrt();
                if sqrt_i <= 0.0 {
                    jac.fill(0.0);
                    return true;
                }
                // d ln g_i / d n_j = -A z_i^2 / (2 sqrt(I)) * dI/dn_j
                for j in 0..n_local.len() {
                    let di_dn = (0.5 * charges[j] * charges[j] - ionic) / total;
                    for i in 0..n_local.len() {
                        jac[(i, j)] =
                            -a_debye * charges[i] * charges[i] / (2.0 * sqrt_i) * di_dn;
                    }
                }
                true
            }
            ActivityModel::Margules { a12, a21 } => {
                let total: f64 = n_local.iter().sum();
                if total <= 0.0 || n_local.len() != 2 {
                    jac.fill(0.0);
                    return true;
                }
                let x1 = n_local[0] / total;
                let x2 = 1.0 - x1;
                // d ln g / d x1, then chain through x1 = n1/(n1+n2)
                let dg1_dx1 = -2.0 * x2 * (a12 + 2.0 * (a21 - a12) * x1)
                    + x2 * x2 * 2.0 * (a21 - a12);
                let dg2_dx1 = 2.0 * x1 * (a21 + 2.0 * (a12 - a21) * x2)
                    - x1 * x1 * 2.0 * (a12 - a21);
                let dx1_dn1 = x2 / total;
                let dx1_dn2 = -x1 / total;
                jac[(0, 0)] = dg1_dx1 * dx1_dn1;
                jac[(0, 1)] = dg1_dx1 * dx1_dn2;
                jac[(1, 0)] = dg2_dx1 * dx1_dn1;
                jac[(1, 1)] = dg2_dx1 * dx1_dn2;
                true
            }
            ActivityModel::UserCallback(cb) => cb.d_ln_gamma_dn(n_local, jac),
        }
    }
}

/// One phase of the multiphase system.
#[derive(Debug)]
pub struct Phase {
    /// Display name.
    pub name: String,
    /// Indices (into the system species list) of the species in this phase,
    /// in insertion order. Filled by [`crate::MultiPhase::add_species`].
    pub species: Vec<usize>,
    /// Whether this is a stoichiometric single-species phase.
    pub single_species: bool,
    /// Whether the solution is ideal (activity coefficients all unity).
    pub ideal_solution: bool,
    /// Whether this is the gas phase.
    pub gas: bool,
    /// Moles of inert diluent that contribute to the phase total but carry
    /// no elements.
    pub inert_moles: f64,
    /// Electric potential of the phase.
    pub electric_potential: f64,
    /// Total moles, kept current by the solver at call boundaries.
    pub total_moles: f64,
    /// Activity-coefficient model (ignored for single-species phases).
    pub activity: ActivityModel,
}

impl Phase {
    /// An ideal-gas phase.
    pub fn gas(name: &str) -> Self {
        Phase {
            name: name.to_string(),
            species: Vec::new(),
            single_species: false,
            ideal_solution: true,
            gas: true,
            inert_moles: 0.0,
            electric_potential: 0.0,
            total_moles: 0.0,
            activity: ActivityModel::Ideal,
        }
    }

    /// A condensed multispecies solution phase with the given activity model.
    pub fn solution(name: &str, activity: ActivityModel) -> Self {
        let ideal = activity.is_ideal();
        Phase {
            name: name.to_string(),
            species: Vec::new(),
            single_species: false,
            ideal_solution: ideal,
            gas: false,
            inert_moles: 0.0,
            electric_potential: 0.0,
            total_moles: 0.0,
            activity,
        }
    }

    /// A stoichiometric single-species condensed phase.
    pub fn stoichiometric(name: &str) -> Self {
        Phase {
            name: name.to_string(),
            species: Vec::new(),
            single_species: true,
            ideal_solution: true,
            gas: false,
            inert_moles: 0.0,
            electric_potential: 0.0,
            total_moles: 0.0,
            activity: ActivityModel::Ideal,
        }
    }

    /// Sets the inert diluent moles.
    pub fn with_inert_moles(mut self, inert: f64) -> Self {
        self.inert_moles = inert;
        self
    }

    /// Sets the initial electric potential.
    pub fn with_electric_potential(mut self, phi: f64) -> Self {
        self.electric_potential = phi;
        self
    }
}
