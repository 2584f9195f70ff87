//! Species data and iteration status.
//!
//! A species is a chemical entity with a definite formula residing in exactly
//! one phase. During iteration each species carries a status that governs
//! which reaction steps are taken for it and how it participates in phase
//! birth and death.

/// Kind of unknown a species contributes to the solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownKind {
    /// Ordinary mole number, `n >= 0`, scaled by the problem mole scale.
    #[default]
    MoleNumber,
    /// The electric potential of the owning phase. Exempt from mole scaling
    /// and from the nonnegativity constraint.
    InterfacialVoltage,
}

/// Iteration status of a species.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeciesStatus {
    /// One of the M basis species spanning the element space.
    Component,
    /// Noncomponent with a significant mole fraction; the Newton step is
    /// always taken.
    Major,
    /// Noncomponent below the minor threshold; stepped only downhill.
    Minor,
    /// A single-species phase currently at zero moles.
    ZeroedSingleSpecies,
    /// Member of a multispecies phase that has been artificially zeroed.
    ZeroedPhase,
    /// Suppressed by stoichiometric or phase-pop logic despite favorable
    /// reaction affinity.
    ZeroedStoich,
    /// Excluded from the iteration; always zero.
    Deleted,
}

impl SpeciesStatus {
    /// Whether this status means the species currently holds zero moles.
    pub fn is_zeroed(&self) -> bool {
        matches!(
            self,
            SpeciesStatus::ZeroedSingleSpecies
                | SpeciesStatus::ZeroedPhase
                | SpeciesStatus::ZeroedStoich
                | SpeciesStatus::Deleted
        )
    }
}

/// Mole-fraction threshold below which a noncomponent is classified minor.
pub(crate) const MINOR_FRACTION: f64 = 1.0e-3;

/// Promotion threshold back to major. Kept a factor of two above
/// [`MINOR_FRACTION`] so species near the boundary do not flap between the
/// two classes on alternate iterations.
pub(crate) const MAJOR_FRACTION: f64 = 2.0e-3;

/// Major/minor reclassification with hysteresis.
///
/// `fraction` is the species mole fraction within its phase. Returns the new
/// status for a currently-live noncomponent.
pub(crate) fn classify_noncomponent(fraction: f64, current: SpeciesStatus) -> SpeciesStatus {
    match current {
        SpeciesStatus::Major => {
            if fraction < MINOR_FRACTION {
                SpeciesStatus::Minor
            } else {
                SpeciesStatus::Major
            }
        }
        SpeciesStatus::Minor => {
            if fraction > MAJOR_FRACTION {
                SpeciesStatus::Major
            } else {
                SpeciesStatus::Minor
            }
        }
        // A reborn or newly live species starts from the plain threshold.
        _ => {
            if fraction > MINOR_FRACTION {
                SpeciesStatus::Major
            } else {
                SpeciesStatus::Minor
            }
        }
    }
}

/// Immutable description of one species in the multiphase system.
#[derive(Debug, Clone)]
pub struct Species {
    /// Display name.
    pub name: String,
    /// Index of the owning phase.
    pub phase: usize,
    /// Element-abundance row: entry `j` is the amount of constraint `j`
    /// carried per mole of this species.
    pub elements: Vec<f64>,
    /// Molecular weight [kg/kmol].
    pub molecular_weight: f64,
    /// Electric charge per formula unit.
    pub charge: f64,
    /// Kind of unknown this species contributes.
    pub unknown: UnknownKind,
}

impl Species {
    /// Creates a mole-number species.
    pub fn new(name: &str, phase: usize, elements: Vec<f64>) -> Self {
        Species {
            name: name.to_string(),
            phase,
            elements,
            molecular_weight: 0.0,
            charge: 0.0,
            unknown: UnknownKind::MoleNumber,
        }
    }

    /// Creates the interfacial-voltage unknown of a charged phase.
    pub fn voltage(name: &str, phase: usize, n_elements: usize) -> Self {
        Species {
            name: name.to_string(),
            phase,
            elements: vec![0.0; n_elements],
            molecular_weight: 0.0,
            charge: 0.0,
            unknown: UnknownKind::InterfacialVoltage,
        }
    }

    /// Sets the molecular weight [kg/kmol].
    pub fn with_molecular_weight(mut self, mw: f64) -> Self {
        self.molecular_weight = mw;
        self
    }

    /// Sets the electric charge per formula unit.
    pub fn with_charge(mut self, charge: f64) -> Self {
        self.charge = charge;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_zeroed() {
        assert!(SpeciesStatus::ZeroedPhase.is_zeroed());
        assert!(SpeciesStatus::Deleted.is_zeroed());
        assert!(!SpeciesStatus::Major.is_zeroed());
        assert!(!SpeciesStatus::Component.is_zeroed());
    }

    #[test]
    fn test_classification_hysteresis() {
        // A major species just below the minor threshold demotes
        assert_eq!(
            classify_noncomponent(0.9e-3, SpeciesStatus::Major),
            SpeciesStatus::Minor
        );
        // ...but a minor species at the same fraction stays minor
        assert_eq!(
            classify_noncomponent(1.5e-3, SpeciesStatus::Minor),
            SpeciesStatus::Minor
        );
        // and only promotes above the major threshold
        assert_eq!(
            classify_noncomponent(2.5e-3, SpeciesStatus::Minor),
            SpeciesStatus::Major
        );
    }

    #[test]
    fn test_classification_no_flapping() {
        // A fraction in the hysteresis band preserves whichever class the
        // species already holds.
        let x = 1.5e-3;
        assert_eq!(classify_noncomponent(x, SpeciesStatus::Major), SpeciesStatus::Major);
        assert_eq!(classify_noncomponent(x, SpeciesStatus::Minor), SpeciesStatus::Minor);
    }

    #[test]
    fn test_species_builders() {
        let s = Species::new("H2O", 0, vec![2.0, 1.0])
            .with_molecular_weight(18.016)
            .with_charge(0.0);
        assert_eq!(s.phase, 0);
        assert_eq!(s.unknown, UnknownKind::MoleNumber);
        assert_eq!(s.elements, vec![2.0, 1.0]);

        let v = Species::voltage("phi_aq", 1, 2);
        assert_eq!(v.unknown, UnknownKind::InterfacialVoltage);
        assert_eq!(v.elements, vec![0.0, 0.0]);
    }
}
