//! Component selection and the formation-reaction basis.
//!
//! Given the element-abundance matrix and the current composition, this
//! module picks M linearly independent "component" species spanning the
//! element space, then expresses every remaining mole-number species as a
//! formation reaction from those components. Stepping reaction `r` by
//! `delta` changes the noncomponent by `delta` and component `j` by
//! `stoich[(r, j)] * delta`, so element totals are invariant along every
//! reaction.
//!
//! The basis is recomputed whenever a component is exhausted; with an
//! unchanged composition the selection is deterministic, so rebuilding twice
//! in a row yields the same component set.

use nalgebra::{DMatrix, DVector, Dyn};

use crate::{EquilError, EquilResult};

/// Relative pivot tolerance for the independence test.
const PIVOT_RTOL: f64 = 1.0e-10;

/// Tie-break weight on the major-element richness of a species. Small enough
/// that any genuine mole-number difference dominates the ordering.
const RICHNESS_WEIGHT: f64 = 1.0e-10;

/// A selected component basis and the induced formation reactions.
#[derive(Debug)]
pub(crate) struct ReactionBasis {
    /// Species indices of the M components.
    pub components: Vec<usize>,
    /// Species indices of the mole-number noncomponents; reaction `r` forms
    /// `noncomponents[r]`.
    pub noncomponents: Vec<usize>,
    /// Stoichiometric matrix, `nrxn x M`.
    pub stoich: DMatrix<f64>,
    /// Net phase-mole change per unit reaction step, `nrxn x n_phases`.
    pub phase_participation: DMatrix<f64>,
    /// LU factors of the transposed components-to-elements matrix, reused
    /// for element projection.
    ct_lu: nalgebra::linalg::LU<f64, Dyn, Dyn>,
}

impl ReactionBasis {
    /// Number of formation reactions.
    pub fn n_reactions(&self) -> usize {
        self.noncomponents.len()
    }

    /// Solves `C^T x = rhs` against the component element matrix. Used by
    /// the element-projection pre-step.
    pub fn solve_components(&self, rhs: &DVector<f64>) -> Option<DVector<f64>> {
        self.ct_lu.solve(rhs)
    }
}

/// Inputs to component selection that stay fixed over an `equilibrate` call.
pub(crate) struct BasisInputs<'a> {
    /// Element matrix, one row per species, `N x M`.
    pub elem_matrix: &'a DMatrix<f64>,
    /// Which species carry a mole-number unknown (voltage unknowns are
    /// excluded from the basis entirely).
    pub mole_number: &'a [bool],
    /// Owning phase per species.
    pub species_phase: &'a [usize],
    /// Number of phases.
    pub n_phases: usize,
    /// Per-species richness in elements with nonzero goals; breaks ties
    /// between species of equal mole number.
    pub richness: &'a [f64],
}

/// Determines which constraint columns take part in the solve.
///
/// A constraint whose column is a linear combination of the columns before
/// it adds no information: charge neutrality in an aqueous system, for
/// example, is implied by the hydrogen and oxygen balances. Such columns
/// are deactivated, provided their goal agrees with the implied value;
/// a disagreeing goal is unsatisfiable. A dependent column of an ordinary
/// element, by contrast, means the element matrix genuinely cannot tell two
/// constraints apart and the problem is rank deficient.
///
/// Ordinary (`AbsPos`) columns are considered first so that a dependent
/// auxiliary constraint never displaces an element balance.
pub(crate) fn active_constraints(
    elem_matrix: &DMatrix<f64>,
    goals: &[f64],
    is_abspos: &[bool],
    goal_tol: f64,
) -> EquilResult<Vec<bool>> {
    let (n_sp, m) = elem_matrix.shape();
    let mut order: Vec<usize> = (0..m).filter(|&j| is_abspos[j]).collect();
    order.extend((0..m).filter(|&j| !is_abspos[j]));

    let mut active = vec![false; m];
    let mut accepted: Vec<usize> = Vec::new();
    for &j in &order {
        let col = elem_matrix.column(j).clone_owned();
        let norm = col.amax();
        let dependency = if accepted.is_empty() {
            if norm > 0.0 {
                None
            } else {
                Some(Vec::new())
            }
        } else {
            let a = DMatrix::from_fn(n_sp, accepted.len(), |r, c| elem_matrix[(r, accepted[c])]);
            let ata = a.transpose() * &a;
            let atb = a.transpose() * &col;
            match ata.lu().solve(&atb) {
                Some(x) => {
                    let resid = &a * &x - &col;
                    if resid.amax() <= PIVOT_RTOL * norm.max(1.0) {
                        Some(x.iter().copied().collect::<Vec<f64>>())
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        match dependency {
            None => {
                active[j] = true;
                accepted.push(j);
            }
            Some(coeffs) => {
                if is_abspos[j] {
                    return Err(EquilError::RankDeficient(format!(
                        "element constraint {} is a linear combination of the others",
                        j
                    )));
                }
                let implied: f64 =
                    coeffs.iter().zip(&accepted).map(|(&x, &c)| x * goals[c]).sum();
                if (goals[j] - implied).abs() > goal_tol {
                    return Err(EquilError::InfeasibleElements(format!(
                        "constraint {} is implied by the element balances with value {:.6e}, \
                         but its goal is {:.6e}",
                        j, implied, goals[j]
                    )));
                }
            }
        }
    }
    Ok(active)
}

/// Computes the per-species richness weights from the goal vector.
pub(crate) fn richness_weights(elem_matrix: &DMatrix<f64>, goals: &[f64]) -> Vec<f64> {
    let (n, m) = elem_matrix.shape();
    let mut w = vec![0.0; n];
    for i in 0..n {
        for j in 0..m {
            if goals[j] != 0.0 {
                w[i] += elem_matrix[(i, j)].abs();
            }
        }
    }
    w
}

/// Selects M independent components by weighted greedy elimination and
/// builds the formation-reaction stoichiometry.
///
/// Candidates are ranked by current mole number with a small major-element
/// richness bonus; ties fall back to the original species index. A species
/// joins the basis only if its element row is linearly independent of the
/// rows already picked. Fewer than M independent rows is a
/// [`EquilError::RankDeficient`] error.
pub(crate) fn select_basis(inputs: &BasisInputs<'_>, moles: &[f64]) -> EquilResult<ReactionBasis> {
    let (n_sp, n_el) = inputs.elem_matrix.shape();
    debug_assert_eq!(moles.len(), n_sp);

    // Rank candidates: descending score, ascending index on ties.
    let mut order: Vec<usize> = (0..n_sp).filter(|&i| inputs.mole_number[i]).collect();
    let score = |i: usize| moles[i] + RICHNESS_WEIGHT * inputs.richness[i];
    order.sort_by(|&a, &b| {
        score(b).partial_cmp(&score(a)).unwrap_or(std::cmp::Ordering::Equal).then(a.cmp(&b))
    });

    // Greedy independence test via incremental elimination. Each accepted
    // row is stored normalized on its pivot column.
    let mut components: Vec<usize> = Vec::with_capacity(n_el);
    let mut reduced: Vec<(usize, DVector<f64>)> = Vec::with_capacity(n_el);
    for &cand in &order {
        if components.len() == n_el {
            break;
        }
        let mut row = DVector::from_fn(n_el, |j, _| inputs.elem_matrix[(cand, j)]);
        let orig_norm = row.amax().max(1.0);
        for (pivot, basis_row) in &reduced {
            let factor = row[*pivot];
            if factor != 0.0 {
                row.axpy(-factor, basis_row, 1.0);
            }
        }
        let pivot = row.iamax();
        if row[pivot].abs() > PIVOT_RTOL * orig_norm {
            let inv = 1.0 / row[pivot];
            row *= inv;
            reduced.push((pivot, row));
            components.push(cand);
        }
    }
    if components.len() < n_el {
        return Err(EquilError::RankDeficient(format!(
            "only {} independent species available for {} element constraints",
            components.len(),
            n_el
        )));
    }

    // Components-to-elements matrix C (rows = components) and its transpose
    // factorization: stoichiometry solves C^T nu_r = -E_k.
    let c = DMatrix::from_fn(n_el, n_el, |j, e| inputs.elem_matrix[(components[j], e)]);
    let ct_lu = c.transpose().lu();

    let noncomponents: Vec<usize> = (0..n_sp)
        .filter(|&i| inputs.mole_number[i] && !components.contains(&i))
        .collect();
    let nrxn = noncomponents.len();

    let mut stoich = DMatrix::zeros(nrxn, n_el);
    let mut phase_participation = DMatrix::zeros(nrxn, inputs.n_phases);
    for (r, &k) in noncomponents.iter().enumerate() {
        let rhs = DVector::from_fn(n_el, |e, _| -inputs.elem_matrix[(k, e)]);
        let nu = ct_lu.solve(&rhs).ok_or_else(|| {
            EquilError::RankDeficient("component element matrix is singular".to_string())
        })?;
        for j in 0..n_el {
            stoich[(r, j)] = nu[j];
            phase_participation[(r, inputs.species_phase[components[j]])] += nu[j];
        }
        phase_participation[(r, inputs.species_phase[k])] += 1.0;
    }

    Ok(ReactionBasis { components, noncomponents, stoich, phase_participation, ct_lu })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// H2/O2/H2O over elements (H, O).
    fn water_system() -> (DMatrix<f64>, Vec<bool>, Vec<usize>) {
        let elem = DMatrix::from_row_slice(3, 2, &[
            2.0, 0.0, // H2
            0.0, 2.0, // O2
            2.0, 1.0, // H2O
        ]);
        (elem, vec![true; 3], vec![0, 0, 0])
    }

    #[test]
    fn test_selects_most_abundant_components() {
        let (elem, mole_number, phases) = water_system();
        let richness = vec![0.0; 3];
        let inputs = BasisInputs {
            elem_matrix: &elem,
            mole_number: &mole_number,
            species_phase: &phases,
            n_phases: 1,
            richness: &richness,
        };
        let basis = select_basis(&inputs, &[0.1, 0.2, 5.0]).unwrap();
        // H2O is the most abundant, then O2
        assert_eq!(basis.components, vec![2, 1]);
        assert_eq!(basis.noncomponents, vec![0]);
    }

    #[test]
    fn test_formation_stoichiometry_conserves_elements() {
        let (elem, mole_number, phases) = water_system();
        let richness = vec![0.0; 3];
        let inputs = BasisInputs {
            elem_matrix: &elem,
            mole_number: &mole_number,
            species_phase: &phases,
            n_phases: 1,
            richness: &richness,
        };
        let basis = select_basis(&inputs, &[0.1, 0.2, 5.0]).unwrap();
        // Stepping the H2 formation reaction by delta changes element e by
        // E_k[e] + sum_j nu_j E_j[e]; that must vanish.
        let k = basis.noncomponents[0];
        for e in 0..2 {
            let mut net = elem[(k, e)];
            for (j, &cj) in basis.components.iter().enumerate() {
                net += basis.stoich[(0, j)] * elem[(cj, e)];
            }
            assert_relative_eq!(net, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_basis_idempotent() {
        let (elem, mole_number, phases) = water_system();
        let richness = vec![0.0; 3];
        let inputs = BasisInputs {
            elem_matrix: &elem,
            mole_number: &mole_number,
            species_phase: &phases,
            n_phases: 1,
            richness: &richness,
        };
        let moles = [0.3, 0.3, 0.4];
        let a = select_basis(&inputs, &moles).unwrap();
        let b = select_basis(&inputs, &moles).unwrap();
        assert_eq!(a.components, b.components);
        assert_eq!(a.noncomponents, b.noncomponents);
    }

    #[test]
    fn test_rank_deficient_duplicate_rows() {
        // Two species with identical element rows cannot span two elements
        let elem = DMatrix::from_row_slice(2, 2, &[
            1.0, 1.0,
            1.0, 1.0,
        ]);
        let inputs = BasisInputs {
            elem_matrix: &elem,
            mole_number: &[true, true],
            species_phase: &[0, 0],
            n_phases: 1,
            richness: &[0.0, 0.0],
        };
        let err = select_basis(&inputs, &[1.0, 1.0]).unwrap_err();
        assert!(matches!(err, EquilError::RankDeficient(_)));
    }

    #[test]
    fn test_richness_breaks_ties() {
        // Equal moles: the species carrying the goal element wins the slot.
        let elem = DMatrix::from_row_slice(3, 1, &[
            0.0, // inert to the goal element
            2.0,
            1.0,
        ]);
        let richness = richness_weights(&elem, &[1.0]);
        let inputs = BasisInputs {
            elem_matrix: &elem,
            mole_number: &[true, true, true],
            species_phase: &[0, 0, 0],
            n_phases: 1,
            richness: &richness,
        };
        let basis = select_basis(&inputs, &[0.5, 0.5, 0.5]).unwrap();
        assert_eq!(basis.components, vec![1]);
    }

    #[test]
    fn test_voltage_species_excluded() {
        let elem = DMatrix::from_row_slice(3, 2, &[
            2.0, 0.0,
            0.0, 2.0,
            0.0, 0.0, // voltage unknown carries no elements
        ]);
        let inputs = BasisInputs {
            elem_matrix: &elem,
            mole_number: &[true, true, false],
            species_phase: &[0, 0, 0],
            n_phases: 1,
            richness: &[0.0; 3],
        };
        let basis = select_basis(&inputs, &[1.0, 1.0, 0.0]).unwrap();
        assert!(!basis.components.contains(&2));
        assert!(!basis.noncomponents.contains(&2));
    }

    #[test]
    fn test_redundant_charge_constraint_dropped() {
        // H2O / H+ / OH- over (H, O, charge): the charge column equals
        // H - 2 O, so it must deactivate when its goal is consistent.
        let elem = DMatrix::from_row_slice(3, 3, &[
            2.0, 1.0, 0.0, // H2O
            1.0, 0.0, 1.0, // H+
            1.0, 1.0, -1.0, // OH-
        ]);
        let goals = [2.002, 1.001, 0.0];
        let active =
            active_constraints(&elem, &goals, &[true, true, false], 1.0e-9).unwrap();
        assert_eq!(active, vec![true, true, false]);
    }

    #[test]
    fn test_inconsistent_implied_goal_is_infeasible() {
        let elem = DMatrix::from_row_slice(3, 3, &[
            2.0, 1.0, 0.0,
            1.0, 0.0, 1.0,
            1.0, 1.0, -1.0,
        ]);
        // Charge goal 0 but the element balances imply H - 2 O = 0.001
        let goals = [2.003, 1.001, 0.0];
        let err =
            active_constraints(&elem, &goals, &[true, true, false], 1.0e-9).unwrap_err();
        assert!(matches!(err, EquilError::InfeasibleElements(_)));
    }

    #[test]
    fn test_dependent_element_columns_are_rank_deficient() {
        // Two elements always in 1:1 ratio cannot be told apart
        let elem = DMatrix::from_row_slice(2, 2, &[
            1.0, 1.0,
            1.0, 1.0,
        ]);
        let err = active_constraints(&elem, &[1.0, 1.0], &[true, true], 1.0e-9).unwrap_err();
        assert!(matches!(err, EquilError::RankDeficient(_)));
    }

    #[test]
    fn test_phase_participation() {
        // Gas H2/O2 components, condensed H2O noncomponent
        let elem = DMatrix::from_row_slice(3, 2, &[
            2.0, 0.0,
            0.0, 2.0,
            2.0, 1.0,
        ]);
        let inputs = BasisInputs {
            elem_matrix: &elem,
            mole_number: &[true, true, true],
            species_phase: &[0, 0, 1],
            n_phases: 2,
            richness: &[0.0; 3],
        };
        let basis = select_basis(&inputs, &[5.0, 4.0, 0.1]).unwrap();
        assert_eq!(basis.components, vec![0, 1]);
        let r = 0;
        // Forming one mole of H2O consumes 1 H2 and 0.5 O2 from the gas
        assert_relative_eq!(basis.phase_participation[(r, 0)], -1.5, epsilon = 1e-12);
        assert_relative_eq!(basis.phase_participation[(r, 1)], 1.0, epsilon = 1e-12);
    }
}
