//! Formation-reaction step sizes.
//!
//! Every noncomponent takes a Newton step computed from the reaction
//! affinity and the diagonal of the Gibbs Hessian, damped so that no
//! participating mole number crosses zero. Minor and zeroed species are
//! only stepped downhill; an unfavorable affinity leaves them untouched.
//! Reactions running entirely among single-species phases have a singular
//! diagonal; those take a discrete step that zeroes whichever participant
//! exhausts first and, when that participant is a component, force a basis
//! rebuild.

use log::debug;

use super::{VcsSolver, BIRTH_SEED, DELETE_PHASE_CUTOFF};
use crate::SpeciesStatus;

/// Outcome of one pass of step-size computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepCode {
    /// Steps computed; proceed to the line search.
    Normal,
    /// A noncomponent single-species phase was zeroed in place.
    NoncomponentZeroed,
    /// A component was zeroed; the basis must be rebuilt before continuing.
    ComponentZeroed,
}

impl VcsSolver<'_> {
    /// Computes `delta_moles` for every formation reaction.
    pub(crate) fn reaction_step_sizes(&mut self) -> StepCode {
        let mut code = StepCode::Normal;
        self.delta_moles.fill(0.0);

        for r in 0..self.basis.n_reactions() {
            let k = self.basis.noncomponents[r];
            if self.status[k] == SpeciesStatus::Deleted {
                continue;
            }
            let dg = self.delta_g[r];

            if self.moles[k] == 0.0 && !self.ss_phase[k] {
                // Multispecies phase member at zero: rebirth test. The seed
                // is deliberately tiny; the next iteration's Newton step
                // grows it if the affinity holds up.
                if dg < -self.opts.phase_birth_threshold {
                    if self.status[k] == SpeciesStatus::ZeroedStoich {
                        continue;
                    }
                    let iph = self.species_phase[k];
                    let rel = self.t_phase[iph] / self.total_moles.max(f64::MIN_POSITIVE);
                    self.delta_moles[k] = if rel > DELETE_PHASE_CUTOFF {
                        self.total_moles * BIRTH_SEED
                    } else {
                        let nsp_phase = self.sys.phases()[iph].species.len() as f64;
                        self.total_moles * 10.0 * DELETE_PHASE_CUTOFF / nsp_phase
                    };
                }
                continue;
            }

            // Superconverged in this mode: nothing to gain.
            if dg.abs() <= self.tol_major_sq {
                continue;
            }
            // Minor and zeroed species are only stepped downhill.
            if self.status[k] != SpeciesStatus::Major && dg >= 0.0 {
                continue;
            }

            let s = self.hessian_diag(r, k);
            if s != 0.0 {
                let s = if self.opts.use_activity_jacobian && self.act_jac_ready {
                    self.hessian_diag_adjust(r, s)
                } else {
                    s
                };
                let delta = -dg / s;
                self.delta_moles[k] = self.damp_step(r, k, delta);
            } else {
                // Reaction entirely among single-species phases.
                code = self.single_species_branch(r, k, dg);
                if code == StepCode::ComponentZeroed {
                    return code;
                }
            }
        }
        code
    }

    /// Damps a candidate step so that neither the species itself nor any
    /// component crosses zero along the reaction.
    pub(super) fn damp_step(&self, r: usize, k: usize, mut delta: f64) -> f64 {
        for (j, &cj) in self.basis.components.iter().enumerate() {
            let sc = self.basis.stoich[(r, j)];
            if sc != 0.0 {
                let neg_change = -sc * delta;
                if neg_change > self.moles[cj] {
                    delta = if self.moles[cj] > 0.0 { -self.moles[cj] / sc } else { 0.0 };
                }
            }
        }
        if -delta > self.moles[k] {
            delta = -self.moles[k];
        }
        delta
    }

    /// Ideal-solution diagonal of the Gibbs Hessian along reaction `r`.
    fn hessian_diag(&self, r: usize, k: usize) -> f64 {
        let mut s = if self.ss_phase[k] { 0.0 } else { 1.0 / self.moles[k] };
        for (j, &cj) in self.basis.components.iter().enumerate() {
            if !self.ss_phase[cj] && self.moles[cj] > 0.0 {
                let sc = self.basis.stoich[(r, j)];
                s += sc * sc / self.moles[cj];
            }
        }
        for ph in 0..self.nph {
            if !self.phase_single[ph] && self.t_phase[ph] > 0.0 {
                let dn = self.basis.phase_participation[(r, ph)];
                s -= dn * dn / self.t_phase[ph];
            }
        }
        s
    }

    /// Folds the activity-coefficient dependence on mole numbers into the
    /// Hessian diagonal. The diagonal may grow without bound but may shrink
    /// only to one third of its ideal value, keeping it positive.
    pub(super) fn hessian_diag_adjust(&self, r: usize, s_ideal: f64) -> f64 {
        if s_ideal <= 0.0 {
            return s_ideal;
        }
        let h = self.hessian_act_coeff_diag(r);
        if h >= 0.0 || h.abs() < 0.6666 * s_ideal {
            s_ideal + h
        } else {
            s_ideal - 0.6666 * s_ideal
        }
    }

    /// Activity-coefficient contribution to the Hessian diagonal of
    /// reaction `r`, assembled from the phase-local Jacobian blocks. Only
    /// component pairs sharing a phase contribute, so the sum stays cheap.
    fn hessian_act_coeff_diag(&self, r: usize) -> f64 {
        let k = self.basis.noncomponents[r];
        let kph = self.species_phase[k];
        let mut s = self.act_jac[(k, k)];
        for (l, &cl) in self.basis.components.iter().enumerate() {
            if self.ss_phase[cl] {
                continue;
            }
            for (m, &cm) in self.basis.components.iter().enumerate() {
                if self.species_phase[cm] == self.species_phase[cl] {
                    s += self.basis.stoich[(r, m)]
                        * self.basis.stoich[(r, l)]
                        * self.act_jac[(cm, cl)];
                }
            }
            if kph == self.species_phase[cl] {
                s += self.basis.stoich[(r, l)] * (self.act_jac[(k, cl)] + self.act_jac[(cl, k)]);
            }
        }
        s
    }

    /// Discrete step for a reaction with no solution-phase curvature: walk
    /// the reaction until the first participant hits zero, zero it and its
    /// phase, and report whether that participant was a component.
    fn single_species_branch(&mut self, r: usize, k: usize, dg: f64) -> StepCode {
        let mut kill = k;
        let mut dss;
        if dg > 0.0 {
            // The reaction runs backward: species k or a
            // positive-stoichiometry component is consumed.
            dss = self.moles[k];
            for (j, &cj) in self.basis.components.iter().enumerate() {
                let sc = self.basis.stoich[(r, j)];
                if sc > 0.0 {
                    let xx = self.moles[cj] / sc;
                    if xx < dss {
                        dss = xx;
                        kill = cj;
                    }
                }
            }
            dss = -dss;
        } else {
            // Forward: a negative-stoichiometry component is consumed.
            dss = f64::INFINITY;
            for (j, &cj) in self.basis.components.iter().enumerate() {
                let sc = self.basis.stoich[(r, j)];
                if sc < 0.0 {
                    let xx = -self.moles[cj] / sc;
                    if xx < dss {
                        dss = xx;
                        kill = cj;
                    }
                }
            }
            if !dss.is_finite() {
                return StepCode::Normal;
            }
        }
        if dss == 0.0 {
            return StepCode::Normal;
        }

        self.moles[k] += dss;
        self.t_phase[self.species_phase[k]] += dss;
        for (j, &cj) in self.basis.components.iter().enumerate() {
            let change = dss * self.basis.stoich[(r, j)];
            self.moles[cj] += change;
            self.t_phase[self.species_phase[cj]] += change;
            if self.moles[cj] < 0.0 {
                self.moles[cj] = 0.0;
            }
        }
        self.moles[kill] = 0.0;
        self.t_phase[self.species_phase[kill]] = 0.0;
        self.status[kill] = SpeciesStatus::ZeroedSingleSpecies;
        if self.opts.log_level >= 3 {
            debug!(
                "single-species branch zeroed {} along reaction {}",
                self.sys.species()[kill].name,
                r
            );
        }
        if kill == k {
            StepCode::NoncomponentZeroed
        } else {
            StepCode::ComponentZeroed
        }
    }
}
