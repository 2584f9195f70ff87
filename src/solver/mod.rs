//! The multiphase VCS Gibbs-minimization iteration.
//!
//! The solver owns all mutable state for the duration of one call: scaled
//! mole numbers, phase totals, chemical potentials, the reaction basis and
//! the line-search scratch buffers. The [`crate::MultiPhase`] system is read
//! at entry and written back at exit, so concurrent calls on disjoint
//! systems share nothing.
//!
//! One outer iteration performs, in order: a cancellation check, a basis
//! rebuild if the previous iteration exhausted a component, activity and
//! chemical-potential updates, reaction affinities, a convergence test,
//! Newton step sizes with damping, a per-reaction line search, step
//! application, phase-death bookkeeping and status reclassification.
//!
//! # Submodules
//!
//! - [`steps`]: Newton step sizes along formation reactions, the Hessian
//!   diagonal with its activity-coefficient correction, and the discrete
//!   branch that deletes single-species phases.
//! - [`linesearch`]: 1-D reduction of a candidate step so the reaction
//!   affinity does not cross zero prematurely.

mod linesearch;
mod steps;

pub(crate) use steps::StepCode;

use log::{debug, trace};
use nalgebra::{DMatrix, DVector};

use crate::basis::{
    active_constraints, richness_weights, select_basis, BasisInputs, ReactionBasis,
};
use crate::species::classify_noncomponent;
use crate::thermo::StandardStateProvider;
use crate::units::mole_scale;
use crate::{
    ElementType, EquilError, EquilOptions, EquilResult, Iterations, MultiPhase, SpeciesStatus,
    UnknownKind,
};

/// A multispecies phase whose total drops below this fraction of the system
/// total is considered absent.
pub(crate) const DELETE_PHASE_CUTOFF: f64 = 1.0e-13;

/// Seed mole number, as a fraction of the system total, given to a species
/// reborn into a dead multispecies phase.
pub(crate) const BIRTH_SEED: f64 = 1.0e-10;

/// A component below this scaled mole number forces a basis reselection.
const COMPONENT_EXHAUSTION: f64 = 1.0e-13;

/// Floor on mole fractions inside logarithms.
const X_FLOOR: f64 = 1.0e-32;

/// Final state handed back from a consumed solver, written into the system
/// even when the iteration failed, so callers can inspect the best
/// composition found.
pub(crate) struct FinalState {
    moles: Vec<f64>,
    mu: Vec<f64>,
    phi: Vec<f64>,
    goals: Vec<f64>,
}

/// Equilibrates `sys` at its current (T, P) with the VCS iteration.
pub(crate) fn solve_tp(
    sys: &mut MultiPhase,
    provider: &dyn StandardStateProvider,
    opts: &EquilOptions,
) -> EquilResult<Iterations> {
    let (result, state) = {
        let solver = VcsSolver::new(&*sys, provider, opts)?;
        solver.run()
    };
    sys.write_back(&state.moles, &state.mu, &state.phi, &state.goals);
    result
}

pub(crate) struct VcsSolver<'a> {
    sys: &'a MultiPhase,
    provider: &'a dyn StandardStateProvider,
    opts: &'a EquilOptions,

    nsp: usize,
    nel: usize,
    nph: usize,

    // Static per-species data, flattened out of the schema.
    species_phase: Vec<usize>,
    mole_number: Vec<bool>,
    charge: Vec<f64>,
    ss_phase: Vec<bool>,
    elem: DMatrix<f64>,

    phase_single: Vec<bool>,
    inert: Vec<f64>,

    // Scaling and tolerances.
    rt: f64,
    faraday_dim: f64,
    mole_scale: f64,
    tol_major: f64,
    tol_major_sq: f64,
    tol_minor: f64,
    elem_tol: f64,

    // Iteration state. The `_new` buffers belong to the line search and
    // never hold committed state.
    moles: Vec<f64>,
    moles_new: Vec<f64>,
    t_phase: Vec<f64>,
    t_phase_new: Vec<f64>,
    phi: Vec<f64>,
    goals: Vec<f64>,
    goals_full: Vec<f64>,
    mu0: Vec<f64>,
    mu: Vec<f64>,
    ln_gamma: Vec<f64>,
    ln_gamma_new: Vec<f64>,
    act_jac: DMatrix<f64>,
    act_jac_ready: bool,
    status: Vec<SpeciesStatus>,
    delta_g: Vec<f64>,
    delta_moles: Vec<f64>,
    basis: ReactionBasis,
    rxn_of: Vec<Option<usize>>,
    basis_dirty: bool,
    total_moles: f64,

    iterations: u32,
    basis_rebuilds: u32,
}

impl<'a> VcsSolver<'a> {
    /// Builds the workspace: scales the problem, selects the initial
    /// component basis and projects the entry composition onto the element
    /// constraints. Fails without touching `sys`.
    pub(crate) fn new(
        sys: &'a MultiPhase,
        provider: &'a dyn StandardStateProvider,
        opts: &'a EquilOptions,
    ) -> EquilResult<Self> {
        let nsp = sys.n_species();
        let nel_full = sys.n_elements();
        let nph = sys.n_phases();
        let t = sys.temperature();

        let species_phase: Vec<usize> = sys.species().iter().map(|s| s.phase).collect();
        let mole_number: Vec<bool> = sys
            .species()
            .iter()
            .map(|s| s.unknown == UnknownKind::MoleNumber)
            .collect();
        let charge: Vec<f64> = sys.species().iter().map(|s| s.charge).collect();
        let phase_single: Vec<bool> = sys.phases().iter().map(|p| p.single_species).collect();
        let ss_phase: Vec<bool> = species_phase.iter().map(|&j| phase_single[j]).collect();
        let elem_full = DMatrix::from_fn(nsp, nel_full, |i, j| sys.species()[i].elements[j]);

        // Dimensional goals: explicit where given, otherwise derived from
        // the entry composition.
        let derived = sys.element_abundances();
        let mut goals_full = vec![0.0; nel_full];
        for (j, c) in sys.elements().iter().enumerate() {
            let g = c.goal.unwrap_or(derived[j]);
            if !g.is_finite() {
                return Err(EquilError::InvalidInput(format!(
                    "goal for constraint {} is not finite",
                    c.name
                )));
            }
            if !c.goal_feasible(g) {
                return Err(EquilError::InfeasibleElements(format!(
                    "constraint {} resolves to inadmissible goal {}",
                    c.name, g
                )));
            }
            goals_full[j] = g;
        }

        // Dependent auxiliary constraints (a charge balance implied by the
        // element balances, say) are deactivated for the solve.
        let is_abspos: Vec<bool> =
            sys.elements().iter().map(|c| c.etype == ElementType::AbsPos).collect();
        let bnorm_full = goals_full.iter().fold(0.0f64, |m, g| m.max(g.abs()));
        let active = active_constraints(
            &elem_full,
            &goals_full,
            &is_abspos,
            opts.rtol * (bnorm_full + 1.0),
        )?;
        let act_idx: Vec<usize> = (0..nel_full).filter(|&j| active[j]).collect();
        let nel = act_idx.len();
        if nel == 0 {
            return Err(EquilError::RankDeficient(
                "no active element constraints".to_string(),
            ));
        }
        let elem = DMatrix::from_fn(nsp, nel, |i, j| elem_full[(i, act_idx[j])]);

        // Mole scale from total moles plus the absolute-abundance goals.
        let mut ntot = sys.total_moles();
        for (j, c) in sys.elements().iter().enumerate() {
            if c.etype == ElementType::AbsPos {
                ntot += goals_full[j].abs();
            }
        }
        let mole_scale = mole_scale(ntot)?;

        let moles: Vec<f64> = sys
            .moles()
            .iter()
            .zip(&mole_number)
            .map(|(&n, &is_mole)| if is_mole { n / mole_scale } else { n })
            .collect();
        let goals: Vec<f64> = act_idx.iter().map(|&j| goals_full[j] / mole_scale).collect();
        let inert: Vec<f64> = sys.phases().iter().map(|p| p.inert_moles / mole_scale).collect();
        let phi: Vec<f64> = sys.phases().iter().map(|p| p.electric_potential).collect();

        let rt = opts.units.rt_multiplier(t);
        let faraday_dim = opts.units.faraday_multiplier(t);

        let tol_major = opts.rtol;
        let tol_minor = opts.rtol * 1.0e6;
        let bnorm = goals.iter().fold(0.0f64, |m, g| m.max(g.abs()));
        let elem_tol = opts.rtol * bnorm;

        let richness = richness_weights(&elem, &goals);
        let inputs = BasisInputs {
            elem_matrix: &elem,
            mole_number: &mole_number,
            species_phase: &species_phase,
            n_phases: nph,
            richness: &richness,
        };
        let basis = select_basis(&inputs, &moles)?;
        let mut rxn_of = vec![None; nsp];
        for (r, &k) in basis.noncomponents.iter().enumerate() {
            rxn_of[k] = Some(r);
        }

        let nrxn = basis.n_reactions();
        let mut solver = VcsSolver {
            sys,
            provider,
            opts,
            nsp,
            nel,
            nph,
            species_phase,
            mole_number,
            charge,
            ss_phase,
            elem,
            phase_single,
            inert,
            rt,
            faraday_dim,
            mole_scale,
            tol_major,
            tol_major_sq: tol_major * tol_major,
            tol_minor,
            elem_tol,
            moles,
            moles_new: vec![0.0; nsp],
            t_phase: vec![0.0; nph],
            t_phase_new: vec![0.0; nph],
            phi,
            goals,
            goals_full,
            mu0: vec![0.0; nsp],
            mu: vec![0.0; nsp],
            ln_gamma: vec![0.0; nsp],
            ln_gamma_new: vec![0.0; nsp],
            act_jac: DMatrix::zeros(nsp, nsp),
            act_jac_ready: false,
            status: vec![SpeciesStatus::Major; nsp],
            delta_g: vec![0.0; nrxn],
            delta_moles: vec![0.0; nsp],
            basis,
            rxn_of,
            basis_dirty: false,
            total_moles: 0.0,
            iterations: 0,
            basis_rebuilds: 0,
        };

        solver.update_standard_states()?;
        if opts.estimate_equil {
            // The Boltzmann seed can land outside the reach of the
            // component projection; the entry composition never does.
            let entry = solver.moles.clone();
            solver.estimate_composition();
            if solver.project_elements().is_err() {
                solver.moles = entry;
                solver.project_elements()?;
            }
        } else {
            solver.project_elements()?;
        }
        solver.refresh_phase_totals();
        solver.init_status();
        Ok(solver)
    }

    /// Runs the iteration to convergence or failure, consuming the solver.
    /// The final state is returned in both cases.
    pub(crate) fn run(mut self) -> (EquilResult<Iterations>, FinalState) {
        let max_iter = self.opts.max_inner_iter;
        loop {
            self.iterations += 1;
            if self
                .opts
                .cancel
                .as_ref()
                .map(|c| c.is_cancelled())
                .unwrap_or(false)
            {
                let state = self.finalize();
                return (Err(EquilError::Cancelled), state);
            }
            if self.iterations > max_iter {
                let (res_g, res_e) = (self.residual_g(), self.element_residual());
                let scale = self.mole_scale;
                let state = self.finalize();
                return (
                    Err(EquilError::NonConvergence {
                        iterations: max_iter,
                        residual_g: res_g,
                        residual_elem: res_e * scale,
                    }),
                    state,
                );
            }

            if self.basis_dirty {
                if let Err(e) = self.rebuild_basis() {
                    let state = self.finalize();
                    return (Err(e), state);
                }
            }

            if let Err(e) = self.update_activity_coefficients() {
                let state = self.finalize();
                return (Err(e), state);
            }
            self.update_chemical_potentials();
            self.compute_delta_g();

            let res_g = self.residual_g();
            let res_e = self.element_residual();
            if self.opts.log_level >= 2 {
                debug!(
                    "iter {}: |dG/RT|max {:.3e}, elem residual {:.3e}, basis rebuilds {}",
                    self.iterations, res_g, res_e, self.basis_rebuilds
                );
            }
            if self.opts.log_level >= 5 {
                trace!("reaction matrix:\n{}", self.basis.stoich);
            }
            if self.converged(res_g, res_e) {
                let iters = Iterations {
                    inner: self.iterations,
                    outer: 0,
                    residual_g: res_g,
                    residual_elem: res_e * self.mole_scale,
                    basis_rebuilds: self.basis_rebuilds,
                };
                let state = self.finalize();
                return (Ok(iters), state);
            }

            match self.reaction_step_sizes() {
                StepCode::ComponentZeroed => {
                    self.basis_dirty = true;
                    self.refresh_phase_totals();
                    self.reclassify();
                    continue;
                }
                StepCode::NoncomponentZeroed => {
                    self.refresh_phase_totals();
                    self.reclassify();
                    continue;
                }
                StepCode::Normal => {}
            }

            self.apply_steps();
            self.refresh_phase_totals();
            self.phase_death_sweep();
            self.reclassify();
            self.check_component_exhaustion();
        }
    }

    // ---- state updates -------------------------------------------------

    fn update_standard_states(&mut self) -> EquilResult<()> {
        // The standard volumes only matter to the outer state drivers; the
        // fixed-(T,P) iteration needs a scratch buffer for the contract.
        let mut v0 = vec![0.0; self.nsp];
        self.provider
            .update_standard_states(
                self.sys.temperature(),
                self.sys.pressure(),
                &mut self.mu0,
                &mut v0,
            )
            .map_err(|reason| EquilError::ProviderFailure { phase: 0, reason })?;
        for (i, m) in self.mu0.iter().enumerate() {
            if !m.is_finite() {
                return Err(EquilError::ProviderFailure {
                    phase: self.species_phase[i],
                    reason: format!(
                        "non-finite standard-state potential for species {}",
                        self.sys.species()[i].name
                    ),
                });
            }
        }
        Ok(())
    }

    /// Refreshes activity coefficients (and their Jacobian when enabled)
    /// from the committed composition.
    fn update_activity_coefficients(&mut self) -> EquilResult<()> {
        self.act_jac_ready = false;
        for (j, ph) in self.sys.phases().iter().enumerate() {
            if ph.single_species || ph.ideal_solution {
                continue;
            }
            let n_local: Vec<f64> = ph.species.iter().map(|&k| self.moles[k]).collect();
            let mut g_local = vec![0.0; n_local.len()];
            ph.activity.update_ln_gamma(&n_local, &mut g_local);
            for (slot, &k) in ph.species.iter().enumerate() {
                if !g_local[slot].is_finite() {
                    return Err(EquilError::ProviderFailure {
                        phase: j,
                        reason: format!(
                            "non-finite ln gamma for species {}",
                            self.sys.species()[k].name
                        ),
                    });
                }
                self.ln_gamma[k] = g_local[slot];
            }
        }
        if self.opts.use_activity_jacobian {
            self.update_activity_jacobian()?;
        }
        Ok(())
    }

    /// Scatters each nonideal phase's local Jacobian block into the
    /// species-indexed matrix. `act_jac_ready` stays false when no phase
    /// supplies derivatives.
    fn update_activity_jacobian(&mut self) -> EquilResult<()> {
        let mut any = false;
        self.act_jac.fill(0.0);
        for (j, ph) in self.sys.phases().iter().enumerate() {
            if ph.single_species || ph.ideal_solution {
                continue;
            }
            let n_local: Vec<f64> = ph.species.iter().map(|&k| self.moles[k]).collect();
            let mut block = DMatrix::zeros(n_local.len(), n_local.len());
            if !ph.activity.update_d_ln_gamma_dn(&n_local, &mut block) {
                continue;
            }
            for (a, &ka) in ph.species.iter().enumerate() {
                for (b, &kb) in ph.species.iter().enumerate() {
                    let v = block[(a, b)];
                    if !v.is_finite() {
                        return Err(EquilError::ProviderFailure {
                            phase: j,
                            reason: "non-finite activity-coefficient Jacobian".to_string(),
                        });
                    }
                    self.act_jac[(ka, kb)] = v;
                }
            }
            any = true;
        }
        self.act_jac_ready = any;
        Ok(())
    }

    /// Total dimensionless chemical potential of every mole-number species
    /// at the committed composition:
    /// `mu/RT = mu0/RT + ln(x gamma) + (F/RT) z phi`.
    ///
    /// Species in a dead multispecies phase are evaluated at the equimolar
    /// composition the phase would be born with, which gives the birth test
    /// a finite affinity to inspect.
    fn update_chemical_potentials(&mut self) {
        for i in 0..self.nsp {
            if !self.mole_number[i] {
                self.mu[i] = 0.0;
                continue;
            }
            let j = self.species_phase[i];
            let mut mu = self.mu0[i];
            if !self.ss_phase[i] {
                let tj = self.t_phase[j];
                let x = if tj > 0.0 {
                    (self.moles[i] / tj).max(X_FLOOR)
                } else {
                    1.0 / self.sys.phases()[j].species.len() as f64
                };
                mu += x.ln() + self.ln_gamma[i];
            }
            mu += self.faraday_dim * self.charge[i] * self.phi[j];
            self.mu[i] = mu;
        }
    }

    fn compute_delta_g(&mut self) {
        for r in 0..self.basis.n_reactions() {
            let k = self.basis.noncomponents[r];
            let mut dg = self.mu[k];
            for (j, &cj) in self.basis.components.iter().enumerate() {
                dg += self.basis.stoich[(r, j)] * self.mu[cj];
            }
            self.delta_g[r] = dg;
        }
    }

    fn refresh_phase_totals(&mut self) {
        self.t_phase.copy_from_slice(&self.inert);
        for i in 0..self.nsp {
            if self.mole_number[i] {
                self.t_phase[self.species_phase[i]] += self.moles[i];
            }
        }
        self.total_moles = self.t_phase.iter().sum();
    }

    // ---- convergence ---------------------------------------------------

    /// Largest reaction affinity over major species.
    fn residual_g(&self) -> f64 {
        let mut res = 0.0f64;
        for r in 0..self.basis.n_reactions() {
            let k = self.basis.noncomponents[r];
            if self.status[k] == SpeciesStatus::Major {
                res = res.max(self.delta_g[r].abs());
            }
        }
        res
    }

    /// Largest element-abundance residual, in scaled moles.
    fn element_residual(&self) -> f64 {
        let mut res = 0.0f64;
        for e in 0..self.nel {
            let mut b = 0.0;
            for i in 0..self.nsp {
                if self.mole_number[i] {
                    b += self.elem[(i, e)] * self.moles[i];
                }
            }
            res = res.max((b - self.goals[e]).abs());
        }
        res
    }

    fn converged(&self, res_g: f64, res_e: f64) -> bool {
        if res_g > self.tol_major || res_e > self.elem_tol {
            return false;
        }
        for r in 0..self.basis.n_reactions() {
            let k = self.basis.noncomponents[r];
            let dg = self.delta_g[r];
            match self.status[k] {
                SpeciesStatus::Minor => {
                    if self.moles[k] > 0.0 {
                        // One-sided: a supersaturated minor is never stepped
                        // uphill, so only a favorable affinity counts
                        // against convergence.
                        if dg < -self.tol_minor {
                            return false;
                        }
                    } else if dg < -self.opts.phase_birth_threshold {
                        // Absent from a live phase but with a strongly
                        // favorable formation reaction: still wants in.
                        return false;
                    }
                }
                SpeciesStatus::ZeroedSingleSpecies | SpeciesStatus::ZeroedPhase => {
                    // A dead phase with a strongly favorable formation
                    // reaction still wants to be born.
                    if dg < -self.opts.phase_birth_threshold {
                        return false;
                    }
                }
                _ => {}
            }
        }
        true
    }

    // ---- basis management ----------------------------------------------

    fn rebuild_basis(&mut self) -> EquilResult<()> {
        let richness = richness_weights(&self.elem, &self.goals);
        let inputs = BasisInputs {
            elem_matrix: &self.elem,
            mole_number: &self.mole_number,
            species_phase: &self.species_phase,
            n_phases: self.nph,
            richness: &richness,
        };
        self.basis = select_basis(&inputs, &self.moles)?;
        self.rxn_of.fill(None);
        for (r, &k) in self.basis.noncomponents.iter().enumerate() {
            self.rxn_of[k] = Some(r);
        }
        self.delta_g.resize(self.basis.n_reactions(), 0.0);
        self.basis_dirty = false;
        self.basis_rebuilds += 1;
        // Stoichiometric suppression does not survive a basis change.
        for s in self.status.iter_mut() {
            if *s == SpeciesStatus::ZeroedStoich {
                *s = SpeciesStatus::ZeroedPhase;
            }
        }
        self.init_status();
        if self.opts.log_level >= 3 {
            debug!(
                "basis rebuilt ({} total): components {:?}",
                self.basis_rebuilds, self.basis.components
            );
        }
        Ok(())
    }

    fn check_component_exhaustion(&mut self) {
        for &c in &self.basis.components {
            if self.moles[c] < COMPONENT_EXHAUSTION {
                self.basis_dirty = true;
                return;
            }
        }
    }

    // ---- status bookkeeping --------------------------------------------

    fn init_status(&mut self) {
        for &c in &self.basis.components {
            self.status[c] = SpeciesStatus::Component;
        }
        let noncomponents = self.basis.noncomponents.clone();
        for k in noncomponents {
            if self.status[k] == SpeciesStatus::Deleted
                || self.status[k] == SpeciesStatus::ZeroedStoich
            {
                continue;
            }
            let j = self.species_phase[k];
            if self.ss_phase[k] {
                self.status[k] = if self.moles[k] > 0.0 {
                    SpeciesStatus::Major
                } else {
                    SpeciesStatus::ZeroedSingleSpecies
                };
            } else if self.t_phase[j] <= DELETE_PHASE_CUTOFF * self.total_moles.max(X_FLOOR) {
                self.status[k] = SpeciesStatus::ZeroedPhase;
            } else {
                let frac = self.moles[k] / self.t_phase[j];
                self.status[k] = classify_noncomponent(frac, self.status[k]);
            }
        }
    }

    fn reclassify(&mut self) {
        for r in 0..self.basis.n_reactions() {
            let k = self.basis.noncomponents[r];
            match self.status[k] {
                SpeciesStatus::Deleted | SpeciesStatus::ZeroedStoich => continue,
                _ => {}
            }
            let j = self.species_phase[k];
            if self.ss_phase[k] {
                self.status[k] = if self.moles[k] > 0.0 {
                    SpeciesStatus::Major
                } else {
                    SpeciesStatus::ZeroedSingleSpecies
                };
                continue;
            }
            if self.t_phase[j] <= DELETE_PHASE_CUTOFF * self.total_moles.max(X_FLOOR) {
                self.status[k] = SpeciesStatus::ZeroedPhase;
                continue;
            }
            let frac = self.moles[k] / self.t_phase[j];
            let new = classify_noncomponent(frac, self.status[k]);
            if new != self.status[k] && self.opts.log_level >= 3 {
                debug!(
                    "species {} reclassified {:?} -> {:?}",
                    self.sys.species()[k].name,
                    self.status[k],
                    new
                );
            }
            self.status[k] = new;
        }
    }

    /// Deletes multispecies phases whose totals fell under the cutoff,
    /// returning member moles to the components so element totals are
    /// preserved exactly.
    fn phase_death_sweep(&mut self) {
        for j in 0..self.nph {
            if self.phase_single[j] || self.inert[j] > 0.0 {
                continue;
            }
            let tj = self.t_phase[j];
            if tj <= 0.0 || tj >= DELETE_PHASE_CUTOFF * self.total_moles.max(X_FLOOR) {
                continue;
            }
            // A component living in the dying phase blocks the deletion
            // until the basis moves off it.
            let has_component = self.basis.components.iter().any(|&c| self.species_phase[c] == j);
            if has_component {
                self.basis_dirty = true;
                continue;
            }
            if self.opts.log_level >= 3 {
                debug!("deleting phase {} (total {:.3e})", self.sys.phases()[j].name, tj);
            }
            let members: Vec<usize> = self.sys.phases()[j].species.clone();
            for &k in &members {
                if !self.mole_number[k] {
                    continue;
                }
                if let Some(r) = self.rxn_of[k] {
                    let delta = -self.moles[k];
                    if delta != 0.0 {
                        self.moles[k] = 0.0;
                        for (jj, &cj) in self.basis.components.iter().enumerate() {
                            self.moles[cj] += self.basis.stoich[(r, jj)] * delta;
                            if self.moles[cj] < 0.0 {
                                self.moles[cj] = 0.0;
                            }
                        }
                    }
                    // Members that still want to live are suppressed until
                    // the next basis rebuild, not merely zeroed, so the
                    // phase does not flap back on the next iteration.
                    self.status[k] = if self.delta_g[r] < -self.opts.phase_birth_threshold {
                        SpeciesStatus::ZeroedStoich
                    } else {
                        SpeciesStatus::ZeroedPhase
                    };
                }
            }
            self.refresh_phase_totals();
        }
    }

    // ---- steps ----------------------------------------------------------

    /// Applies the candidate steps one reaction at a time, each refined by
    /// the line search against the state committed so far.
    fn apply_steps(&mut self) {
        for r in 0..self.basis.n_reactions() {
            let k = self.basis.noncomponents[r];
            let dx0 = self.delta_moles[k];
            if dx0 == 0.0 {
                continue;
            }
            let dx = self.line_search(r, dx0);
            // Earlier reactions this sweep may have moved the components;
            // re-damp against the committed state before applying.
            let dx = self.damp_step(r, k, dx);
            if dx == 0.0 {
                continue;
            }
            self.moles[k] += dx;
            if self.moles[k] < 0.0 {
                self.moles[k] = 0.0;
            }
            for (j, &cj) in self.basis.components.iter().enumerate() {
                self.moles[cj] += self.basis.stoich[(r, j)] * dx;
                if self.moles[cj] < 0.0 {
                    self.moles[cj] = 0.0;
                }
            }
        }
    }

    // ---- entry conditioning ---------------------------------------------

    /// Projects the composition onto the element-constraint manifold by
    /// adjusting component mole numbers, clamping at zero. Run once on
    /// entry; every subsequent operation conserves elements by
    /// construction.
    fn project_elements(&mut self) -> EquilResult<()> {
        for _pass in 0..5 {
            let residual = DVector::from_fn(self.nel, |e, _| {
                let mut b = 0.0;
                for i in 0..self.nsp {
                    if self.mole_number[i] {
                        b += self.elem[(i, e)] * self.moles[i];
                    }
                }
                self.goals[e] - b
            });
            if residual.amax() <= self.elem_tol {
                return Ok(());
            }
            let delta = self.basis.solve_components(&residual).ok_or_else(|| {
                EquilError::RankDeficient("component element matrix is singular".to_string())
            })?;
            let mut clamped = false;
            for (j, &cj) in self.basis.components.iter().enumerate() {
                self.moles[cj] += delta[j];
                if self.moles[cj] < 0.0 {
                    self.moles[cj] = 0.0;
                    clamped = true;
                }
            }
            if !clamped {
                // One exact linear solve suffices when nothing clamps.
                return Ok(());
            }
        }
        let res = self.element_residual();
        if res > self.elem_tol {
            return Err(EquilError::InfeasibleElements(format!(
                "cannot reach the goal abundances from the given composition \
                 (residual {:.3e})",
                res * self.mole_scale
            )));
        }
        Ok(())
    }

    /// Coarse ideal-solution seed: least-squares element potentials from the
    /// standard-state potentials, then Boltzmann-weighted mole numbers,
    /// rescaled to the entry total. The element projection that follows
    /// restores exact abundances.
    fn estimate_composition(&mut self) {
        let mut targets = Vec::new();
        for i in 0..self.nsp {
            if self.mole_number[i] && !self.ss_phase[i] {
                targets.push(i);
            }
        }
        if targets.len() < self.nel {
            return;
        }
        let a = DMatrix::from_fn(targets.len(), self.nel, |r, e| self.elem[(targets[r], e)]);
        let mu0 = DVector::from_fn(targets.len(), |r, _| self.mu0[targets[r]]);
        let normal = a.transpose() * &a;
        let rhs = a.transpose() * mu0;
        let lambda = match normal.lu().solve(&rhs) {
            Some(l) => l,
            None => return,
        };
        let total: f64 = targets.iter().map(|&i| self.moles[i]).sum();
        if total <= 0.0 {
            return;
        }
        let mut exponents = vec![0.0; targets.len()];
        let mut emax = f64::NEG_INFINITY;
        for (r, &i) in targets.iter().enumerate() {
            let mut e = -self.mu0[i];
            for j in 0..self.nel {
                e += self.elem[(i, j)] * lambda[j];
            }
            exponents[r] = e;
            emax = emax.max(e);
        }
        let mut weights = vec![0.0; targets.len()];
        let mut wsum = 0.0;
        for r in 0..targets.len() {
            weights[r] = (exponents[r] - emax).exp();
            wsum += weights[r];
        }
        if wsum <= 0.0 {
            return;
        }
        for (r, &i) in targets.iter().enumerate() {
            self.moles[i] = total * weights[r] / wsum;
        }
    }

    // ---- exit ------------------------------------------------------------

    fn finalize(mut self) -> FinalState {
        self.refresh_phase_totals();
        self.update_chemical_potentials();
        let moles: Vec<f64> = self
            .moles
            .iter()
            .zip(&self.mole_number)
            .map(|(&n, &is_mole)| if is_mole { n * self.mole_scale } else { n })
            .collect();
        let mu: Vec<f64> = self.mu.iter().map(|m| m * self.rt).collect();
        FinalState { moles, mu, phi: self.phi, goals: self.goals_full }
    }
}
