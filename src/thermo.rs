//! Standard-state thermodynamics.
//!
//! The solver never evaluates thermochemistry itself; it consumes a
//! [`StandardStateProvider`] that writes dimensionless standard-state
//! chemical potentials `mu0/RT` and standard molar volumes for every species
//! at a given (T, P). This module defines that contract, a tagged set of
//! pressure-dependent standard-state models ([`Pdss`]) with a dispatching
//! manager, the NASA 7-coefficient polynomial form, and mixture property
//! evaluation used by the non-(T,P) state drivers.
//!
//! # Example
//!
//! ```
//! use gibbsmin::thermo::{data, Pdss, PdssManager, StandardStateProvider};
//!
//! let mgr = PdssManager::new(vec![
//!     Pdss::IdealGas(data::N2),
//!     Pdss::IdealGas(data::O2),
//! ]);
//! let mut mu0 = vec![0.0; 2];
//! let mut v0 = vec![0.0; 2];
//! mgr.update_standard_states(1500.0, 101325.0, &mut mu0, &mut v0).unwrap();
//! assert!(mu0.iter().all(|m| m.is_finite()));
//! ```

use crate::units::GAS_CONSTANT;
use crate::{EquilError, EquilResult, MultiPhase, UnknownKind};

/// Reference pressure for the polynomial standard states [Pa].
pub const P_REF: f64 = 101325.0;

/// Provider of standard-state properties, borrowed by the solver for the
/// duration of an `equilibrate` call.
///
/// Implementations must be pure functions of (T, P); they are invoked
/// synchronously from the solver thread once per (T, P) change.
pub trait StandardStateProvider {
    /// Writes `mu0/RT` (dimensionless) and the standard molar volume
    /// [m^3/kmol] for every species at the given temperature [K] and
    /// pressure [Pa].
    fn update_standard_states(
        &self,
        t: f64,
        p: f64,
        mu0_rt: &mut [f64],
        v0: &mut [f64],
    ) -> Result<(), String>;

    /// Writes the standard enthalpy `h0/RT` for every species. Backs the
    /// enthalpy/entropy residuals of the outer state drivers.
    fn enthalpy_rt(&self, t: f64, p: f64, h_rt: &mut [f64]) -> Result<(), String>;
}

/// NASA 7-coefficient polynomial over two temperature ranges.
///
/// `cp/R = a0 + a1 T + a2 T^2 + a3 T^3 + a4 T^4`, with `a5` the enthalpy and
/// `a6` the entropy constant of integration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nasa7 {
    /// Crossover temperature between the two ranges [K].
    pub t_mid: f64,
    /// Coefficients for the low-temperature range.
    pub low: [f64; 7],
    /// Coefficients for the high-temperature range.
    pub high: [f64; 7],
}

impl Nasa7 {
    fn coeffs(&self, t: f64) -> &[f64; 7] {
        if t < self.t_mid {
            &self.low
        } else {
            &self.high
        }
    }

    /// `cp/R` at temperature `t` [K].
    pub fn cp_r(&self, t: f64) -> f64 {
        let a = self.coeffs(t);
        a[0] + t * (a[1] + t * (a[2] + t * (a[3] + t * a[4])))
    }

    /// `h/RT` at temperature `t` [K].
    pub fn h_rt(&self, t: f64) -> f64 {
        let a = self.coeffs(t);
        a[0] + t * (a[1] / 2.0 + t * (a[2] / 3.0 + t * (a[3] / 4.0 + t * a[4] / 5.0)))
            + a[5] / t
    }

    /// `s/R` at temperature `t` [K].
    pub fn s_r(&self, t: f64) -> f64 {
        let a = self.coeffs(t);
        a[0] * t.ln() + t * (a[1] + t * (a[2] / 2.0 + t * (a[3] / 3.0 + t * a[4] / 4.0)))
            + a[6]
    }

    /// `g/RT = h/RT - s/R` at temperature `t` [K], at the reference pressure.
    pub fn g_rt(&self, t: f64) -> f64 {
        self.h_rt(t) - self.s_r(t)
    }
}

/// Pressure-dependent standard-state model of one species.
///
/// The tag replaces the class hierarchy a general-purpose thermochemistry
/// library would use here; the common interface is dispatched by
/// [`PdssManager`].
#[derive(Debug, Clone)]
pub enum Pdss {
    /// Ideal-gas standard state: `mu0/RT = g/RT(T) + ln(P/Pref)`,
    /// `v0 = RT/P`.
    IdealGas(Nasa7),
    /// Incompressible condensed standard state with a constant molar volume
    /// [m^3/kmol]: `mu0/RT = g/RT(T) + v0 (P - Pref)/(RT)`.
    ConstVol {
        /// Temperature polynomial at the reference pressure.
        poly: Nasa7,
        /// Molar volume [m^3/kmol].
        molar_volume: f64,
    },
    /// Fixed dimensionless potential, temperature- and pressure-independent.
    /// Useful for reduced test systems and voltage unknowns.
    Constant {
        /// `mu0/RT` value.
        mu0_rt: f64,
        /// Molar volume [m^3/kmol].
        molar_volume: f64,
    },
}

impl Pdss {
    /// `mu0/RT` at (T, P).
    pub fn mu0_rt(&self, t: f64, p: f64) -> f64 {
        match self {
            Pdss::IdealGas(poly) => poly.g_rt(t) + (p / P_REF).ln(),
            Pdss::ConstVol { poly, molar_volume } => {
                poly.g_rt(t) + molar_volume * (p - P_REF) / (GAS_CONSTANT * t)
            }
            Pdss::Constant { mu0_rt, .. } => *mu0_rt,
        }
    }

    /// Standard molar volume [m^3/kmol] at (T, P).
    pub fn molar_volume(&self, t: f64, p: f64) -> f64 {
        match self {
            Pdss::IdealGas(_) => GAS_CONSTANT * t / p,
            Pdss::ConstVol { molar_volume, .. } => *molar_volume,
            Pdss::Constant { molar_volume, .. } => *molar_volume,
        }
    }

    /// `h0/RT` at (T, P).
    pub fn h_rt(&self, t: f64, p: f64) -> f64 {
        match self {
            Pdss::IdealGas(poly) => poly.h_rt(t),
            Pdss::ConstVol { poly, molar_volume } => {
                poly.h_rt(t) + molar_volume * (p - P_REF) / (GAS_CONSTANT * t)
            }
            Pdss::Constant { mu0_rt, .. } => *mu0_rt,
        }
    }
}

/// Standard-state manager: one [`Pdss`] per species, dispatched by tag.
#[derive(Debug, Clone)]
pub struct PdssManager {
    models: Vec<Pdss>,
}

impl PdssManager {
    /// Creates a manager from one model per species, in species order.
    pub fn new(models: Vec<Pdss>) -> Self {
        PdssManager { models }
    }

    /// Number of species covered.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the manager covers no species.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl StandardStateProvider for PdssManager {
    fn update_standard_states(
        &self,
        t: f64,
        p: f64,
        mu0_rt: &mut [f64],
        v0: &mut [f64],
    ) -> Result<(), String> {
        if mu0_rt.len() != self.models.len() {
            return Err(format!(
                "standard-state buffer holds {} species, manager covers {}",
                mu0_rt.len(),
                self.models.len()
            ));
        }
        for (i, m) in self.models.iter().enumerate() {
            mu0_rt[i] = m.mu0_rt(t, p);
            v0[i] = m.molar_volume(t, p);
        }
        Ok(())
    }

    fn enthalpy_rt(&self, t: f64, p: f64, h_rt: &mut [f64]) -> Result<(), String> {
        for (i, m) in self.models.iter().enumerate() {
            h_rt[i] = m.h_rt(t, p);
        }
        Ok(())
    }
}

/// Extensive mixture properties at a fixed state, SI units.
#[derive(Debug, Clone, Copy)]
pub struct MixtureProperties {
    /// Total enthalpy [J].
    pub enthalpy: f64,
    /// Total entropy [J/K].
    pub entropy: f64,
    /// Total Gibbs free energy [J].
    pub gibbs: f64,
    /// Total internal energy [J].
    pub internal_energy: f64,
    /// Total volume [m^3].
    pub volume: f64,
}

/// Evaluates extensive mixture properties of the system at its current
/// composition and (T, P).
///
/// The enthalpy is assembled from standard-state enthalpies (ideal mixing),
/// the Gibbs energy from full chemical potentials including mixing and
/// activity terms, and the entropy from `S = (H - G)/T`, which folds the
/// mixing entropy in consistently.
pub fn mixture_properties(
    sys: &MultiPhase,
    provider: &dyn StandardStateProvider,
) -> EquilResult<MixtureProperties> {
    let n = sys.n_species();
    let t = sys.temperature();
    let p = sys.pressure();
    let rt = GAS_CONSTANT * t;

    let mut mu0 = vec![0.0; n];
    let mut v0 = vec![0.0; n];
    let mut h = vec![0.0; n];
    provider
        .update_standard_states(t, p, &mut mu0, &mut v0)
        .map_err(|reason| EquilError::ProviderFailure { phase: 0, reason })?;
    provider
        .enthalpy_rt(t, p, &mut h)
        .map_err(|reason| EquilError::ProviderFailure { phase: 0, reason })?;

    // Phase totals and activity coefficients at the current composition.
    let mut t_phase = vec![0.0; sys.n_phases()];
    for (k, sp) in sys.species().iter().enumerate() {
        if sp.unknown == UnknownKind::MoleNumber {
            t_phase[sp.phase] += sys.moles()[k];
        }
    }
    let mut ln_gamma = vec![0.0; n];
    for (j, ph) in sys.phases().iter().enumerate() {
        if ph.single_species || ph.ideal_solution {
            continue;
        }
        let n_local: Vec<f64> = ph.species.iter().map(|&k| sys.moles()[k]).collect();
        let mut g_local = vec![0.0; n_local.len()];
        ph.activity.update_ln_gamma(&n_local, &mut g_local);
        for (slot, &k) in ph.species.iter().enumerate() {
            if !g_local[slot].is_finite() {
                return Err(EquilError::ProviderFailure {
                    phase: j,
                    reason: format!("non-finite ln gamma for species {}", sys.species()[k].name),
                });
            }
            ln_gamma[k] = g_local[slot];
        }
    }

    let mut enthalpy = 0.0;
    let mut gibbs = 0.0;
    let mut volume = 0.0;
    for (k, sp) in sys.species().iter().enumerate() {
        if sp.unknown != UnknownKind::MoleNumber {
            continue;
        }
        let nk = sys.moles()[k];
        if nk <= 0.0 {
            continue;
        }
        let ph = &sys.phases()[sp.phase];
        let mu_rt = if ph.single_species {
            mu0[k]
        } else {
            let x = (nk / t_phase[sp.phase].max(f64::MIN_POSITIVE)).max(f64::MIN_POSITIVE);
            mu0[k] + x.ln() + ln_gamma[k]
        };
        enthalpy += nk * h[k] * rt;
        gibbs += nk * mu_rt * rt;
        volume += nk * v0[k];
    }
    let entropy = (enthalpy - gibbs) / t;
    Ok(MixtureProperties {
        enthalpy,
        entropy,
        gibbs,
        internal_energy: enthalpy - p * volume,
        volume,
    })
}

/// NASA-7 fits for the species exercised by the equilibrium test problems:
/// a GRI-Mech subset plus graphite.
pub mod data {
    use super::Nasa7;

    /// N2, 300-1000-5000 K.
    pub const N2: Nasa7 = Nasa7 {
        t_mid: 1000.0,
        low: [
            3.298677e+00, 1.4082404e-03, -3.963222e-06, 5.641515e-09, -2.444854e-12,
            -1.0208999e+03, 3.950372e+00,
        ],
        high: [
            2.92664e+00, 1.4879768e-03, -5.68476e-07, 1.0097038e-10, -6.753351e-15,
            -9.227977e+02, 5.980528e+00,
        ],
    };

    /// O2, 200-1000-3500 K.
    pub const O2: Nasa7 = Nasa7 {
        t_mid: 1000.0,
        low: [
            3.78245636e+00, -2.99673416e-03, 9.84730201e-06, -9.68129509e-09, 3.24372837e-12,
            -1.06394356e+03, 3.65767573e+00,
        ],
        high: [
            3.28253784e+00, 1.48308754e-03, -7.57966669e-07, 2.09470555e-10, -2.16717794e-14,
            -1.08845772e+03, 5.45323129e+00,
        ],
    };

    /// H2, 200-1000-3500 K.
    pub const H2: Nasa7 = Nasa7 {
        t_mid: 1000.0,
        low: [
            2.34433112e+00, 7.98052075e-03, -1.9478151e-05, 2.01572094e-08, -7.37611761e-12,
            -9.17935173e+02, 6.83010238e-01,
        ],
        high: [
            3.3372792e+00, -4.94024731e-05, 4.99456778e-07, -1.79566394e-10, 2.00255376e-14,
            -9.50158922e+02, -3.20502331e+00,
        ],
    };

    /// H2O, 200-1000-3500 K.
    pub const H2O: Nasa7 = Nasa7 {
        t_mid: 1000.0,
        low: [
            4.19864056e+00, -2.0364341e-03, 6.52040211e-06, -5.48797062e-09, 1.77197817e-12,
            -3.02937267e+04, -8.49032208e-01,
        ],
        high: [
            3.03399249e+00, 2.17691804e-03, -1.64072518e-07, -9.7041987e-11, 1.68200992e-14,
            -3.00042971e+04, 4.9667701e+00,
        ],
    };

    /// CO, 200-1000-3500 K.
    pub const CO: Nasa7 = Nasa7 {
        t_mid: 1000.0,
        low: [
            3.57953347e+00, -6.1035368e-04, 1.01681433e-06, 9.07005884e-10, -9.04424499e-13,
            -1.4344086e+04, 3.50840928e+00,
        ],
        high: [
            2.71518561e+00, 2.06252743e-03, -9.98825771e-07, 2.30053008e-10, -2.03647716e-14,
            -1.41518724e+04, 7.81868772e+00,
        ],
    };

    /// CO2, 200-1000-3500 K.
    pub const CO2: Nasa7 = Nasa7 {
        t_mid: 1000.0,
        low: [
            2.35677352e+00, 8.98459677e-03, -7.12356269e-06, 2.45919022e-09, -1.43699548e-13,
            -4.83719697e+04, 9.90105222e+00,
        ],
        high: [
            3.85746029e+00, 4.41437026e-03, -2.21481404e-06, 5.23490188e-10, -4.72084164e-14,
            -4.8759166e+04, 2.27163806e+00,
        ],
    };

    /// CH4, 200-1000-3500 K.
    pub const CH4: Nasa7 = Nasa7 {
        t_mid: 1000.0,
        low: [
            5.14987613e+00, -1.36709788e-02, 4.91800599e-05, -4.84743026e-08, 1.66693956e-11,
            -1.02466476e+04, -4.64130376e+00,
        ],
        high: [
            7.485149e-02, 1.33909467e-02, -5.73285809e-06, 1.22292535e-09, -1.0181523e-13,
            -9.46834459e+03, 1.8437318e+01,
        ],
    };

    /// OH, 200-1000-3500 K.
    pub const OH: Nasa7 = Nasa7 {
        t_mid: 1000.0,
        low: [
            3.99201543e+00, -2.40131752e-03, 4.61793841e-06, -3.88113333e-09, 1.3641147e-12,
            3.61508056e+03, -1.03925458e-01,
        ],
        high: [
            3.09288767e+00, 5.48429716e-04, 1.26505228e-07, -8.79461556e-11, 1.17412376e-14,
            3.858657e+03, 4.4766961e+00,
        ],
    };

    /// H atom, 200-1000-3500 K.
    pub const H: Nasa7 = Nasa7 {
        t_mid: 1000.0,
        low: [
            2.5e+00, 7.05332819e-13, -1.99591964e-15, 2.30081632e-18, -9.27732332e-22,
            2.54736599e+04, -4.46682853e-01,
        ],
        high: [
            2.50000001e+00, -2.30842973e-11, 1.61561948e-14, -4.73515235e-18, 4.98197357e-22,
            2.54736599e+04, -4.46682914e-01,
        ],
    };

    /// O atom, 200-1000-3500 K.
    pub const O: Nasa7 = Nasa7 {
        t_mid: 1000.0,
        low: [
            3.1682671e+00, -3.27931884e-03, 6.64306396e-06, -6.12806624e-09, 2.11265971e-12,
            2.91222592e+04, 2.05193346e+00,
        ],
        high: [
            2.56942078e+00, -8.59741137e-05, 4.19484589e-08, -1.00177799e-11, 1.22833691e-15,
            2.92175791e+04, 4.78433864e+00,
        ],
    };

    /// Graphite, 300-1000-5000 K.
    pub const C_GRAPHITE: Nasa7 = Nasa7 {
        t_mid: 1000.0,
        low: [
            -3.1087207e-01, 4.40353686e-03, -1.90394118e-06, -6.38546966e-10, 9.89980164e-13,
            -1.08650794e+02, 1.11382953e+00,
        ],
        high: [
            1.45571829e+00, 1.71702216e-03, -6.97562786e-07, 1.35277032e-10, -9.67590652e-15,
            -6.95138814e+02, -8.52583033e+00,
        ],
    };
}
