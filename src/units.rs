//! Unit systems and problem scaling.
//!
//! The solver iterates on nondimensional quantities: chemical potentials are
//! divided by RT (expressed in the caller's unit system) and mole numbers are
//! divided by a problem-dependent mole scale so that the hardcoded thresholds
//! in the iteration behave identically for very large and very small systems.
//!
//! Interfacial-voltage unknowns are not mole numbers and are exempt from the
//! mole scale.

use crate::{EquilError, EquilResult};

/// Universal gas constant [J/(kmol*K)].
pub const GAS_CONSTANT: f64 = 8.314472e3;

/// Faraday constant [C/kmol].
pub const FARADAY: f64 = 1.602e-19 * 6.022136736e26;

/// Fallback temperature when the caller hands us a nonpositive one [K].
const T_FALLBACK: f64 = 293.15;

/// Unit system for chemical potentials handed to and returned from the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitSystem {
    /// J/kmol (SI as used in reacting-flow codes). Mole numbers in kmol.
    #[default]
    Mks,
    /// kJ/mol.
    KJMol,
    /// kcal/mol.
    KCalMol,
    /// Chemical potentials expressed as temperatures, mu/R in Kelvin.
    Kelvin,
    /// Already dimensionless (mu/RT).
    Dimensionless,
}

impl UnitSystem {
    /// The multiplier RT in this unit system, i.e. the divisor that takes a
    /// dimensional chemical potential to mu/RT.
    pub fn rt_multiplier(&self, t_kelvin: f64) -> f64 {
        let t = if t_kelvin <= 0.0 { T_FALLBACK } else { t_kelvin };
        match self {
            UnitSystem::Mks => t * GAS_CONSTANT,
            UnitSystem::KJMol => t * 8.314472e-3,
            UnitSystem::KCalMol => t * 8.314472e-3 / 4.184,
            UnitSystem::Kelvin => t,
            UnitSystem::Dimensionless => 1.0,
        }
    }

    /// The multiplier for electric-charge terms, F/RT in this unit system.
    ///
    /// Multiplying a species charge and a phase electric potential by this
    /// factor yields the dimensionless electrochemical contribution to mu/RT.
    pub fn faraday_multiplier(&self, t_kelvin: f64) -> f64 {
        let t = if t_kelvin <= 0.0 { T_FALLBACK } else { t_kelvin };
        match self {
            UnitSystem::Mks | UnitSystem::KJMol | UnitSystem::KCalMol => {
                FARADAY / (t * GAS_CONSTANT)
            }
            UnitSystem::Kelvin => FARADAY / t,
            UnitSystem::Dimensionless => FARADAY,
        }
    }
}

/// Mole-number scale for a problem with the given total moles.
///
/// The iteration thresholds (phase-death cutoffs, birth seeds, component
/// exhaustion) are tuned for totals near unity. Totals above 1e4 or below
/// 1e-4 are scaled back into that window; totals outside [1e-200, 1e200] are
/// rejected as invalid input.
pub fn mole_scale(total_moles: f64) -> EquilResult<f64> {
    if !total_moles.is_finite() || !(1.0e-200..=1.0e200).contains(&total_moles) {
        return Err(EquilError::InvalidInput(format!(
            "total moles {:e} outside the range handled by the solver",
            total_moles
        )));
    }
    if total_moles > 1.0e4 {
        Ok(total_moles / 1.0e4)
    } else if total_moles < 1.0e-4 {
        Ok(total_moles / 1.0e-4)
    } else {
        Ok(1.0)
    }
}
