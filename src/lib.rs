//! Multiphase chemical equilibrium by nonideal Gibbs free-energy minimization.
//!
//! Given a closed system described by an element inventory, a set of species
//! distributed over one or more phases, and two fixed state variables, the
//! crate finds the composition minimizing total Gibbs free energy subject to
//! the linear element-abundance constraints. Phases may be stoichiometric
//! single-species solids or multispecies solutions with nonideal activity
//! coefficients, and may appear or disappear during the solve.
//!
//! The core algorithm is a stoichiometric VCS (Villars-Cruise-Smith)
//! iteration: M "component" species spanning the element space are selected
//! by weighted elimination, the remaining species become formation reactions
//! from the components, and Newton steps along those reactions are damped,
//! line-searched and applied until every reaction affinity vanishes.
//!
//! Thermochemistry is external: the solver consumes a
//! [`thermo::StandardStateProvider`] for standard-state chemical potentials
//! and per-phase [`ActivityModel`]s for nonideality.
//!
//! # Example
//!
//! ```
//! use gibbsmin::{
//!     equilibrate_tp, ElementConstraint, EquilOptions, MultiPhase, Phase, Species,
//! };
//! use gibbsmin::thermo::{data, Pdss, PdssManager};
//!
//! let mut sys = MultiPhase::new();
//! sys.add_element(ElementConstraint::element("H"));
//! sys.add_element(ElementConstraint::element("O"));
//! let gas = sys.add_phase(Phase::gas("gas"));
//! sys.add_species(Species::new("H2", gas, vec![2.0, 0.0])).unwrap();
//! sys.add_species(Species::new("O2", gas, vec![0.0, 2.0])).unwrap();
//! sys.add_species(Species::new("H2O", gas, vec![2.0, 1.0])).unwrap();
//! sys.set_moles(0, 2.0);
//! sys.set_moles(1, 1.0);
//!
//! let provider = PdssManager::new(vec![
//!     Pdss::IdealGas(data::H2),
//!     Pdss::IdealGas(data::O2),
//!     Pdss::IdealGas(data::H2O),
//! ]);
//! let opts = EquilOptions::default();
//! equilibrate_tp(&mut sys, &provider, 1500.0, 101325.0, &opts).unwrap();
//! // Nearly all hydrogen ends up as water at these conditions
//! assert!(sys.mole_fraction(2) > 0.9);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

mod basis;
pub mod chem_equil;
pub mod driver;
pub mod elements;
pub mod phase;
mod solver;
pub mod species;
pub mod thermo;
pub mod units;

pub use driver::PropertyPair;
pub use elements::{ElementConstraint, ElementType};
pub use phase::{ActivityCallback, ActivityModel, Phase};
pub use species::{Species, SpeciesStatus, UnknownKind};
pub use units::UnitSystem;

/// Result type for equilibrium operations.
pub type EquilResult<T> = Result<T, EquilError>;

/// Errors surfaced from an `equilibrate` call.
///
/// Internal adjustments (basis rebuilds, phase death, line-search damping)
/// are silent; only these conditions reach the caller.
#[derive(Debug, Error)]
pub enum EquilError {
    /// Bad units, nonpositive temperature, out-of-range totals, or negative
    /// input mole numbers.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The element matrix does not admit the required number of independent
    /// component species.
    #[error("rank-deficient element matrix: {0}")]
    RankDeficient(String),
    /// The goal abundances contradict nonnegativity.
    #[error("infeasible element goals: {0}")]
    InfeasibleElements(String),
    /// The solver exhausted its iteration budget. The best composition found
    /// so far is left readable in the phases.
    #[error(
        "no convergence after {iterations} iterations \
         (|dG/RT| = {residual_g:.3e}, element residual = {residual_elem:.3e})"
    )]
    NonConvergence {
        /// Iterations consumed.
        iterations: u32,
        /// Largest remaining reaction affinity, dimensionless.
        residual_g: f64,
        /// Largest remaining element-abundance residual.
        residual_elem: f64,
    },
    /// An external callback produced non-finite data.
    #[error("provider failure in phase {phase}: {reason}")]
    ProviderFailure {
        /// Index of the offending phase.
        phase: usize,
        /// Description of the failure.
        reason: String,
    },
    /// The caller's cancellation flag was raised. The composition at the
    /// last committed iteration is left in the phases.
    #[error("cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag, checked once per solver iteration.
///
/// Clone the token, hand one copy to [`EquilOptions::with_cancel`], and call
/// [`CancelToken::cancel`] from any thread to stop the solve at the next
/// iteration boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether the flag has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Which equilibrium algorithm to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverKind {
    /// Try the fast single-phase element-potential solver first and fall
    /// back to the multiphase VCS iteration on failure.
    #[default]
    Auto,
    /// Single-phase element-potential solver only.
    ChemEquil,
    /// Multiphase VCS iteration only.
    MultiPhaseVcs,
}

/// Options controlling an `equilibrate` call.
///
/// # Example
///
/// ```
/// use gibbsmin::{EquilOptions, SolverKind, UnitSystem};
///
/// let opts = EquilOptions::default()
///     .with_rtol(1.0e-10)
///     .with_solver(SolverKind::MultiPhaseVcs)
///     .with_log_level(2);
/// assert_eq!(opts.units, UnitSystem::Mks);
/// ```
#[derive(Debug, Clone)]
pub struct EquilOptions {
    /// Convergence tolerance on dimensionless reaction affinities.
    pub rtol: f64,
    /// Iteration budget for the inner Gibbs minimization.
    pub max_inner_iter: u32,
    /// Iteration budget for the outer state driver.
    pub max_outer_iter: u32,
    /// Solver selection.
    pub solver: SolverKind,
    /// Whether to fold activity-coefficient derivatives into the Hessian
    /// diagonal when the phase model supplies them.
    pub use_activity_jacobian: bool,
    /// Unit system for dimensional chemical potentials and charge terms.
    pub units: UnitSystem,
    /// Diagnostic verbosity, 0 (silent) to 5 (per-iteration matrix dumps).
    pub log_level: u8,
    /// Seed the iteration from a coarse ideal-gas estimate.
    pub estimate_equil: bool,
    /// Affinity threshold below which a dead multispecies phase is reborn.
    pub phase_birth_threshold: f64,
    /// Optional cooperative cancellation flag.
    pub cancel: Option<CancelToken>,
}

impl Default for EquilOptions {
    fn default() -> Self {
        EquilOptions {
            rtol: 1.0e-9,
            max_inner_iter: 5000,
            max_outer_iter: 100,
            solver: SolverKind::Auto,
            use_activity_jacobian: true,
            units: UnitSystem::Mks,
            log_level: 0,
            estimate_equil: false,
            phase_birth_threshold: 1.0e-4,
            cancel: None,
        }
    }
}

impl EquilOptions {
    /// Sets the convergence tolerance.
    pub fn with_rtol(mut self, rtol: f64) -> Self {
        self.rtol = rtol;
        self
    }

    /// Sets the inner iteration budget.
    pub fn with_max_inner_iter(mut self, n: u32) -> Self {
        self.max_inner_iter = n;
        self
    }

    /// Sets the outer iteration budget.
    pub fn with_max_outer_iter(mut self, n: u32) -> Self {
        self.max_outer_iter = n;
        self
    }

    /// Selects the solver.
    pub fn with_solver(mut self, solver: SolverKind) -> Self {
        self.solver = solver;
        self
    }

    /// Enables or disables the activity-coefficient Hessian correction.
    pub fn with_activity_jacobian(mut self, on: bool) -> Self {
        self.use_activity_jacobian = on;
        self
    }

    /// Sets the unit system.
    pub fn with_units(mut self, units: UnitSystem) -> Self {
        self.units = units;
        self
    }

    /// Sets the diagnostic verbosity (clamped to 0..=5).
    pub fn with_log_level(mut self, level: u8) -> Self {
        self.log_level = level.min(5);
        self
    }

    /// Enables the coarse ideal-gas initial estimate.
    pub fn with_estimate_equil(mut self, on: bool) -> Self {
        self.estimate_equil = on;
        self
    }

    /// Sets the phase-rebirth affinity threshold.
    pub fn with_phase_birth_threshold(mut self, threshold: f64) -> Self {
        self.phase_birth_threshold = threshold;
        self
    }

    /// Attaches a cancellation token.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn validate(&self) -> EquilResult<()> {
        if !(self.rtol > 0.0) || !self.rtol.is_finite() {
            return Err(EquilError::InvalidInput(format!(
                "rtol must be positive, got {}",
                self.rtol
            )));
        }
        if self.max_inner_iter == 0 {
            return Err(EquilError::InvalidInput("max_inner_iter must be nonzero".to_string()));
        }
        Ok(())
    }
}

/// Iteration statistics returned from a successful `equilibrate` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Iterations {
    /// Inner Gibbs-minimization iterations consumed.
    pub inner: u32,
    /// Outer state-driver iterations consumed (zero for a fixed-(T,P) call).
    pub outer: u32,
    /// Final largest reaction affinity, dimensionless.
    pub residual_g: f64,
    /// Final largest element-abundance residual.
    pub residual_elem: f64,
    /// Component-basis rebuilds performed.
    pub basis_rebuilds: u32,
}

/// A closed multiphase system: the frozen species/phase/element schema plus
/// the mutable composition the solver iterates on.
///
/// The schema (species rows, phase flags, constraint list) is read-only
/// during a call; the mole numbers, phase totals and chemical potentials are
/// updated in place by `equilibrate`.
#[derive(Debug)]
pub struct MultiPhase {
    species: Vec<Species>,
    phases: Vec<Phase>,
    elements: Vec<ElementConstraint>,
    moles: Vec<f64>,
    temperature: f64,
    pressure: f64,
    chem_potentials: Vec<f64>,
    resolved_goals: Vec<f64>,
}

impl MultiPhase {
    /// Creates an empty system at 298.15 K and 1 atm.
    pub fn new() -> Self {
        MultiPhase {
            species: Vec::new(),
            phases: Vec::new(),
            elements: Vec::new(),
            moles: Vec::new(),
            temperature: 298.15,
            pressure: 101325.0,
            chem_potentials: Vec::new(),
            resolved_goals: Vec::new(),
        }
    }

    /// Registers an element constraint and returns its row index.
    pub fn add_element(&mut self, constraint: ElementConstraint) -> usize {
        self.elements.push(constraint);
        self.elements.len() - 1
    }

    /// Registers a phase and returns its index.
    pub fn add_phase(&mut self, phase: Phase) -> usize {
        self.phases.push(phase);
        self.phases.len() - 1
    }

    /// Registers a species, wiring it into its phase's species list.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the phase index is out of range, the element row
    /// length disagrees with the constraint list, or a second mole-number
    /// species is added to a single-species phase.
    pub fn add_species(&mut self, species: Species) -> EquilResult<usize> {
        if species.phase >= self.phases.len() {
            return Err(EquilError::InvalidInput(format!(
                "species {} references phase {} of {}",
                species.name,
                species.phase,
                self.phases.len()
            )));
        }
        if species.elements.len() != self.elements.len() {
            return Err(EquilError::InvalidInput(format!(
                "species {} carries {} element entries, system has {} constraints",
                species.name,
                species.elements.len(),
                self.elements.len()
            )));
        }
        let occupied = self.phases[species.phase]
            .species
            .iter()
            .any(|&k| self.species[k].unknown == UnknownKind::MoleNumber);
        if self.phases[species.phase].single_species
            && species.unknown == UnknownKind::MoleNumber
            && occupied
        {
            return Err(EquilError::InvalidInput(format!(
                "phase {} is single-species but would hold a second species {}",
                self.phases[species.phase].name, species.name
            )));
        }
        let idx = self.species.len();
        self.phases[species.phase].species.push(idx);
        self.species.push(species);
        self.moles.push(0.0);
        self.chem_potentials.push(0.0);
        Ok(idx)
    }

    /// Sets the mole number of a species.
    pub fn set_moles(&mut self, species: usize, n: f64) {
        self.moles[species] = n;
    }

    /// Current mole numbers, in schema order.
    pub fn moles(&self) -> &[f64] {
        &self.moles
    }

    /// The species schema.
    pub fn species(&self) -> &[Species] {
        &self.species
    }

    /// The phase schema.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// The element-constraint schema.
    pub fn elements(&self) -> &[ElementConstraint] {
        &self.elements
    }

    /// Number of species.
    pub fn n_species(&self) -> usize {
        self.species.len()
    }

    /// Number of phases.
    pub fn n_phases(&self) -> usize {
        self.phases.len()
    }

    /// Number of element constraints.
    pub fn n_elements(&self) -> usize {
        self.elements.len()
    }

    /// Current temperature [K].
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Current pressure [Pa].
    pub fn pressure(&self) -> f64 {
        self.pressure
    }

    /// Sets the state to the given temperature and pressure.
    pub fn set_state_tp(&mut self, t: f64, p: f64) -> EquilResult<()> {
        if !(t > 0.0) || !t.is_finite() {
            return Err(EquilError::InvalidInput(format!("temperature {} K is not positive", t)));
        }
        if !(p > 0.0) || !p.is_finite() {
            return Err(EquilError::InvalidInput(format!("pressure {} Pa is not positive", p)));
        }
        self.temperature = t;
        self.pressure = p;
        Ok(())
    }

    /// Mole fraction of a species within its phase (zero for an empty phase
    /// and for voltage unknowns).
    pub fn mole_fraction(&self, k: usize) -> f64 {
        let sp = &self.species[k];
        if sp.unknown != UnknownKind::MoleNumber {
            return 0.0;
        }
        let total = self.phase_moles(sp.phase);
        if total > 0.0 {
            self.moles[k] / total
        } else {
            0.0
        }
    }

    /// Total mole-number content of a phase, including inerts.
    pub fn phase_moles(&self, j: usize) -> f64 {
        let ph = &self.phases[j];
        ph.inert_moles
            + ph.species
                .iter()
                .filter(|&&k| self.species[k].unknown == UnknownKind::MoleNumber)
                .map(|&k| self.moles[k])
                .sum::<f64>()
    }

    /// Total moles over all phases.
    pub fn total_moles(&self) -> f64 {
        (0..self.phases.len()).map(|j| self.phase_moles(j)).sum()
    }

    /// Dimensional chemical potentials in the unit system of the last
    /// `equilibrate` call, populated on exit.
    pub fn chemical_potentials(&self) -> &[f64] {
        &self.chem_potentials
    }

    /// Element goals resolved at the last `equilibrate` call (explicit goals
    /// merged with goals derived from the entry composition).
    pub fn element_goals(&self) -> &[f64] {
        &self.resolved_goals
    }

    /// Current element abundances, `sum_i a[i][j] n[i]` per constraint.
    pub fn element_abundances(&self) -> Vec<f64> {
        let mut b = vec![0.0; self.elements.len()];
        for (k, sp) in self.species.iter().enumerate() {
            if sp.unknown != UnknownKind::MoleNumber {
                continue;
            }
            for (j, a) in sp.elements.iter().enumerate() {
                b[j] += a * self.moles[k];
            }
        }
        b
    }

    /// Validates the schema and composition for an `equilibrate` call.
    pub(crate) fn validate(&self) -> EquilResult<()> {
        if self.species.is_empty() {
            return Err(EquilError::InvalidInput("system holds no species".to_string()));
        }
        if self.elements.is_empty() {
            return Err(EquilError::InvalidInput(
                "system holds no element constraints".to_string(),
            ));
        }
        // Auxiliary constraints may turn out to be dependent and drop out,
        // so the early check only counts ordinary element balances.
        let n_mole = self.species.iter().filter(|s| s.unknown == UnknownKind::MoleNumber).count();
        let n_abspos =
            self.elements.iter().filter(|c| c.etype == ElementType::AbsPos).count();
        if n_mole < n_abspos {
            return Err(EquilError::RankDeficient(format!(
                "{} mole-number species cannot span {} element constraints",
                n_mole, n_abspos
            )));
        }
        for (k, sp) in self.species.iter().enumerate() {
            if sp.unknown == UnknownKind::MoleNumber && !(self.moles[k] >= 0.0) {
                return Err(EquilError::InvalidInput(format!(
                    "species {} has negative mole number {}",
                    sp.name, self.moles[k]
                )));
            }
        }
        for c in &self.elements {
            if let Some(goal) = c.goal {
                if !c.goal_feasible(goal) {
                    return Err(EquilError::InfeasibleElements(format!(
                        "constraint {} has inadmissible goal {}",
                        c.name, goal
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn write_back(
        &mut self,
        moles: &[f64],
        chem_potentials: &[f64],
        phi: &[f64],
        goals: &[f64],
    ) {
        self.moles.copy_from_slice(moles);
        self.chem_potentials.copy_from_slice(chem_potentials);
        let totals: Vec<f64> = (0..self.phases.len()).map(|j| self.phase_moles(j)).collect();
        for (j, phase) in self.phases.iter_mut().enumerate() {
            phase.electric_potential = phi[j];
            phase.total_moles = totals[j];
        }
        self.resolved_goals = goals.to_vec();
    }
}

impl Default for MultiPhase {
    fn default() -> Self {
        Self::new()
    }
}

/// Equilibrates the system at fixed temperature and pressure.
///
/// On success the composition, phase totals and chemical potentials are left
/// in `sys`. On [`EquilError::NonConvergence`] the best composition found is
/// still written back so callers may inspect it.
///
/// # Arguments
///
/// * `sys` - The multiphase system; composition is updated in place.
/// * `provider` - Standard-state source, borrowed for the call.
/// * `t` - Temperature [K].
/// * `p` - Pressure [Pa].
/// * `opts` - Solver options.
pub fn equilibrate_tp(
    sys: &mut MultiPhase,
    provider: &dyn thermo::StandardStateProvider,
    t: f64,
    p: f64,
    opts: &EquilOptions,
) -> EquilResult<Iterations> {
    opts.validate()?;
    sys.validate()?;
    sys.set_state_tp(t, p)?;

    match opts.solver {
        SolverKind::ChemEquil => chem_equil::solve(sys, provider, opts),
        SolverKind::MultiPhaseVcs => solver::solve_tp(sys, provider, opts),
        SolverKind::Auto => {
            if chem_equil::applicable(sys) {
                match chem_equil::solve(sys, provider, opts) {
                    Ok(iters) => return Ok(iters),
                    Err(EquilError::NonConvergence { .. }) => {
                        if opts.log_level >= 1 {
                            log::debug!("element-potential solver failed, escalating to VCS");
                        }
                    }
                    Err(other) => return Err(other),
                }
            }
            solver::solve_tp(sys, provider, opts)
        }
    }
}

/// Equilibrates the system holding a pair of thermodynamic properties fixed.
///
/// For [`PropertyPair::TP`] this is [`equilibrate_tp`]; for the other pairs
/// an outer Newton iteration adjusts T and/or P until the corresponding
/// extensive properties match `v1` and `v2`. See [`driver`] for the meaning
/// of `v1`/`v2` per pair.
pub fn equilibrate(
    sys: &mut MultiPhase,
    provider: &dyn thermo::StandardStateProvider,
    pair: PropertyPair,
    v1: f64,
    v2: f64,
    opts: &EquilOptions,
) -> EquilResult<Iterations> {
    opts.validate()?;
    driver::equilibrate_pair(sys, provider, pair, v1, v2, opts)
}
