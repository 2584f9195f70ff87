//! End-to-end equilibrium scenarios: methane combustion over a GRI-Mech
//! species subset at fixed and non-(T,P) specifications, aqueous charge
//! neutrality, solid/gas phase death, and rank-deficient input.

use approx::assert_relative_eq;
use gibbsmin::thermo::{data, mixture_properties, Nasa7, Pdss, PdssManager};
use gibbsmin::{
    equilibrate, equilibrate_tp, ActivityModel, ElementConstraint, EquilError, EquilOptions,
    MultiPhase, Phase, PropertyPair, SolverKind, Species,
};

const P_ATM: f64 = 101325.0;

/// Methane/air subset of GRI-Mech 3.0. Element order: C, H, O, N.
/// Initial composition `CH4:0.3, O2:0.3, N2:0.4` on a one-kmol basis.
fn gri_system() -> (MultiPhase, PdssManager) {
    let mut sys = MultiPhase::new();
    sys.add_element(ElementConstraint::element("C"));
    sys.add_element(ElementConstraint::element("H"));
    sys.add_element(ElementConstraint::element("O"));
    sys.add_element(ElementConstraint::element("N"));
    let gas = sys.add_phase(Phase::gas("gas"));

    let species: [(&str, [f64; 4], f64, Nasa7); 10] = [
        ("CH4", [1.0, 4.0, 0.0, 0.0], 16.043, data::CH4),
        ("O2", [0.0, 0.0, 2.0, 0.0], 31.999, data::O2),
        ("N2", [0.0, 0.0, 0.0, 2.0], 28.014, data::N2),
        ("H2O", [0.0, 2.0, 1.0, 0.0], 18.015, data::H2O),
        ("CO", [1.0, 0.0, 1.0, 0.0], 28.010, data::CO),
        ("CO2", [1.0, 0.0, 2.0, 0.0], 44.010, data::CO2),
        ("H2", [0.0, 2.0, 0.0, 0.0], 2.016, data::H2),
        ("H", [0.0, 1.0, 0.0, 0.0], 1.008, data::H),
        ("OH", [0.0, 1.0, 1.0, 0.0], 17.007, data::OH),
        ("O", [0.0, 0.0, 1.0, 0.0], 15.999, data::O),
    ];
    let mut models = Vec::new();
    for (name, row, mw, poly) in species {
        sys.add_species(Species::new(name, gas, row.to_vec()).with_molecular_weight(mw))
            .unwrap();
        models.push(Pdss::IdealGas(poly));
    }
    sys.set_moles(0, 0.3);
    sys.set_moles(1, 0.3);
    sys.set_moles(2, 0.4);
    (sys, PdssManager::new(models))
}

fn species_index(sys: &MultiPhase, name: &str) -> usize {
    sys.species().iter().position(|s| s.name == name).unwrap()
}

fn assert_gri_elements(sys: &MultiPhase) {
    let b = sys.element_abundances();
    assert_relative_eq!(b[0], 0.3, max_relative = 1e-6);
    assert_relative_eq!(b[1], 1.2, max_relative = 1e-6);
    assert_relative_eq!(b[2], 0.6, max_relative = 1e-6);
    assert_relative_eq!(b[3], 0.8, max_relative = 1e-6);
}

fn check_methane_equilibrium(sys: &MultiPhase, opts: &EquilOptions) {
    assert_eq!(sys.temperature(), 1500.0);
    assert_gri_elements(sys);
    assert!(sys.moles().iter().all(|&n| n >= 0.0));

    // Rich combustion at 1500 K: fuel and oxidizer are consumed, the C/H/O
    // pool ends up as syngas plus steam and a little CO2.
    assert!(sys.mole_fraction(species_index(sys, "CH4")) < 1.0e-4);
    assert!(sys.mole_fraction(species_index(sys, "O2")) < 1.0e-6);

    let x_n2 = sys.mole_fraction(species_index(sys, "N2"));
    assert!((0.29..0.33).contains(&x_n2), "x_N2 = {}", x_n2);

    let x_co = sys.mole_fraction(species_index(sys, "CO"));
    let x_h2o = sys.mole_fraction(species_index(sys, "H2O"));
    let x_h2 = sys.mole_fraction(species_index(sys, "H2"));
    let x_co2 = sys.mole_fraction(species_index(sys, "CO2"));
    // With CH4 gone, the element balances force n_CO = n_H2O up to the
    // trace radicals.
    assert!((x_co - x_h2o).abs() < 0.01, "x_CO {} vs x_H2O {}", x_co, x_h2o);
    assert!((0.15..0.22).contains(&x_co), "x_CO = {}", x_co);
    assert!((0.24..0.32).contains(&x_h2), "x_H2 = {}", x_h2);
    assert!((0.03..0.07).contains(&x_co2), "x_CO2 = {}", x_co2);

    // Water-gas shift must satisfy the law of mass action for the data set
    let t = sys.temperature();
    let dg_wgs = data::CO2.g_rt(t) + data::H2.g_rt(t) - data::CO.g_rt(t) - data::H2O.g_rt(t);
    let k_computed = (x_co2 * x_h2) / (x_co * x_h2o);
    assert_relative_eq!(k_computed, (-dg_wgs).exp(), max_relative = 1e-3);

    // First-order optimality in the dimensional potentials
    let mu = sys.chemical_potentials();
    let wgs_affinity = mu[species_index(sys, "CO2")] + mu[species_index(sys, "H2")]
        - mu[species_index(sys, "CO")]
        - mu[species_index(sys, "H2O")];
    let rt = 8.314472e3 * t;
    assert!(
        wgs_affinity.abs() <= 1.0e2 * opts.rtol * rt,
        "WGS affinity {} J/kmol",
        wgs_affinity
    );
}

// Scenario A: fixed (T,P) methane combustion.
#[test]
fn methane_combustion_tp() {
    let (mut sys, provider) = gri_system();
    let opts = EquilOptions::default();
    let iters = equilibrate_tp(&mut sys, &provider, 1500.0, 1.0e5, &opts).unwrap();
    assert!(iters.inner > 0);
    check_methane_equilibrium(&sys, &opts);
}

#[test]
fn methane_combustion_tp_forced_vcs() {
    let (mut sys, provider) = gri_system();
    let opts = EquilOptions::default().with_solver(SolverKind::MultiPhaseVcs);
    equilibrate_tp(&mut sys, &provider, 1500.0, 1.0e5, &opts).unwrap();
    check_methane_equilibrium(&sys, &opts);
}

#[test]
fn methane_combustion_with_estimate() {
    let (mut sys, provider) = gri_system();
    let opts = EquilOptions::default()
        .with_solver(SolverKind::MultiPhaseVcs)
        .with_estimate_equil(true);
    equilibrate_tp(&mut sys, &provider, 1500.0, 1.0e5, &opts).unwrap();
    check_methane_equilibrium(&sys, &opts);
}

// Scenario B: (H,P) solve from the scenario-A state with reduced enthalpy.
#[test]
fn enthalpy_pressure_solve() {
    let (mut sys, provider) = gri_system();
    let opts = EquilOptions::default();
    equilibrate_tp(&mut sys, &provider, 1500.0, 1.0e5, &opts).unwrap();

    let h0 = mixture_properties(&sys, &provider).unwrap().enthalpy;
    let h_target = h0 - 1.0e5;
    let iters =
        equilibrate(&mut sys, &provider, PropertyPair::HP, h_target, 1.0e5, &opts).unwrap();
    assert!(iters.outer > 0);

    // Removing heat at constant pressure lowers the temperature
    assert!(sys.temperature() < 1500.0, "T = {}", sys.temperature());
    assert!(sys.temperature() > 1400.0, "T = {}", sys.temperature());
    let h = mixture_properties(&sys, &provider).unwrap().enthalpy;
    assert!(
        (h - h_target).abs() <= opts.rtol * (h_target.abs() + 1.0),
        "enthalpy residual {}",
        h - h_target
    );
    assert_gri_elements(&sys);
}

// Scenario C: (S,V) solve continuing from the (H,P) state.
#[test]
fn entropy_volume_solve() {
    let (mut sys, provider) = gri_system();
    let opts = EquilOptions::default();
    equilibrate_tp(&mut sys, &provider, 1500.0, 1.0e5, &opts).unwrap();
    let h0 = mixture_properties(&sys, &provider).unwrap().enthalpy;
    equilibrate(&mut sys, &provider, PropertyPair::HP, h0 - 1.0e5, 1.0e5, &opts).unwrap();

    let props = mixture_properties(&sys, &provider).unwrap();
    // Mass of the closed system, for the per-mass entropy increment
    let mass: f64 = sys
        .species()
        .iter()
        .zip(sys.moles())
        .map(|(sp, n)| sp.molecular_weight * n)
        .sum();
    let s_target = props.entropy + 100.0 * mass;
    let v_target = props.volume / 0.9;

    equilibrate(&mut sys, &provider, PropertyPair::SV, s_target, v_target, &opts).unwrap();
    let after = mixture_properties(&sys, &provider).unwrap();
    assert!(
        (after.entropy - s_target).abs() <= opts.rtol * (s_target.abs() + 1.0),
        "entropy residual {}",
        after.entropy - s_target
    );
    assert!(
        (after.volume - v_target).abs() <= opts.rtol * (v_target.abs() + 1.0),
        "volume residual {}",
        after.volume - v_target
    );
    assert_gri_elements(&sys);
}

// Scenario D: aqueous autoionization with a charge-neutrality constraint.
// The standard-state potentials put the ion product at 1e-14 on a molarity
// basis (55.34 mol/L of water), so the answer is pH 7. Starts are ion-free
// or undersaturated; the ions are born (or grown) by downhill formation
// steps until their affinity is exhausted.
#[test]
fn aqueous_charge_neutrality_ph() {
    // ln x at c = 1e-7 mol/L in 55.34 mol/L water
    let mu_ion = -(1.0e-7f64 / 55.34).ln();
    for r in [0.0, 1.0e-10, 1.0e-9] {
        let mut sys = MultiPhase::new();
        sys.add_element(ElementConstraint::element("H"));
        sys.add_element(ElementConstraint::element("O"));
        sys.add_element(ElementConstraint::charge_neutrality("charge"));
        let aq = sys.add_phase(Phase::solution(
            "aqueous",
            ActivityModel::DebyeHuckel { a_debye: 1.17, charges: vec![0.0, 1.0, -1.0] },
        ));
        sys.add_species(Species::new("H2O", aq, vec![2.0, 1.0, 0.0])).unwrap();
        sys.add_species(
            Species::new("H+", aq, vec![1.0, 0.0, 1.0]).with_charge(1.0),
        )
        .unwrap();
        sys.add_species(
            Species::new("OH-", aq, vec![1.0, 1.0, -1.0]).with_charge(-1.0),
        )
        .unwrap();
        sys.set_moles(0, 1.0);
        sys.set_moles(1, r);
        sys.set_moles(2, r);
        let provider = PdssManager::new(vec![
            Pdss::Constant { mu0_rt: 0.0, molar_volume: 18.0e-3 },
            Pdss::Constant { mu0_rt: mu_ion, molar_volume: 1.0e-3 },
            Pdss::Constant { mu0_rt: mu_ion, molar_volume: 1.0e-3 },
        ]);

        let opts = EquilOptions::default();
        equilibrate_tp(&mut sys, &provider, 298.15, P_ATM, &opts).unwrap();

        let x_h = sys.mole_fraction(1);
        let x_oh = sys.mole_fraction(2);
        assert_relative_eq!(x_h, x_oh, max_relative = 1e-6);
        let ph = -(x_h * 55.34).log10();
        assert!((ph - 7.0).abs() < 0.01, "pH = {} from r = {}", ph, r);
        // Charge is conserved exactly by the reaction structure
        let b = sys.element_abundances();
        assert!(b[2].abs() < 1.0e-9, "net charge {}", b[2]);
    }
}

// Scenario E: carbon + CO2 = 2 CO at 1000 K, 1 atm.
fn boudouard_system(c0: f64) -> (MultiPhase, PdssManager) {
    let mut sys = MultiPhase::new();
    sys.add_element(ElementConstraint::element("C"));
    sys.add_element(ElementConstraint::element("O"));
    let gas = sys.add_phase(Phase::gas("gas"));
    let solid = sys.add_phase(Phase::stoichiometric("graphite"));
    sys.add_species(Species::new("CO", gas, vec![1.0, 1.0]).with_molecular_weight(28.010))
        .unwrap();
    sys.add_species(Species::new("CO2", gas, vec![1.0, 2.0]).with_molecular_weight(44.010))
        .unwrap();
    sys.add_species(Species::new("C(gr)", solid, vec![1.0, 0.0]).with_molecular_weight(12.011))
        .unwrap();
    sys.set_moles(1, 1.0);
    sys.set_moles(2, c0);
    let provider = PdssManager::new(vec![
        Pdss::IdealGas(data::CO),
        Pdss::IdealGas(data::CO2),
        Pdss::ConstVol { poly: data::C_GRAPHITE, molar_volume: 5.3e-3 },
    ]);
    (sys, provider)
}

#[test]
fn boudouard_zeroes_insufficient_carbon() {
    let (mut sys, provider) = boudouard_system(0.01);
    let opts = EquilOptions::default();
    equilibrate_tp(&mut sys, &provider, 1000.0, P_ATM, &opts).unwrap();

    // All carbon gasifies: the graphite phase must die
    assert_relative_eq!(sys.moles()[2], 0.0, epsilon = 1e-12);
    assert_eq!(sys.phases()[1].total_moles, 0.0);
    assert_relative_eq!(sys.moles()[0], 0.02, max_relative = 1e-6);
    assert_relative_eq!(sys.moles()[1], 0.99, max_relative = 1e-6);

    // The dead solid must be undersaturated: depositing carbon from the gas
    // (2 CO -> C(gr) + CO2) would raise the Gibbs energy.
    let mu = sys.chemical_potentials();
    let deposition = mu[2] + mu[1] - 2.0 * mu[0];
    assert!(deposition > 0.0, "carbon deposition affinity {} J/kmol", deposition);
}

#[test]
fn boudouard_preserves_excess_carbon() {
    let (mut sys, provider) = boudouard_system(1.0);
    let opts = EquilOptions::default();
    equilibrate_tp(&mut sys, &provider, 1000.0, P_ATM, &opts).unwrap();

    assert!(sys.moles()[2] > 0.1, "graphite remaining = {}", sys.moles()[2]);
    assert!(sys.phases()[1].total_moles > 0.0);

    // Gas satisfies the Boudouard mass-action relation for the data set
    let t = sys.temperature();
    let dg = 2.0 * data::CO.g_rt(t) - data::CO2.g_rt(t) - data::C_GRAPHITE.g_rt(t);
    let x_co = sys.mole_fraction(0);
    let x_co2 = sys.mole_fraction(1);
    assert_relative_eq!(x_co * x_co / x_co2, (-dg).exp(), max_relative = 1e-3);

    // Element conservation across both phases
    let b = sys.element_abundances();
    assert_relative_eq!(b[0], 1.0 + 1.0, max_relative = 1e-8);
    assert_relative_eq!(b[1], 2.0, max_relative = 1e-8);
}

// Scenario F: duplicate species rows leave the system rank deficient and
// must not disturb the input state.
#[test]
fn rank_deficient_input_is_rejected_unchanged() {
    let mut sys = MultiPhase::new();
    sys.add_element(ElementConstraint::element("C"));
    sys.add_element(ElementConstraint::element("O"));
    let gas = sys.add_phase(Phase::gas("gas"));
    sys.add_species(Species::new("CO", gas, vec![1.0, 1.0])).unwrap();
    sys.add_species(Species::new("CO*", gas, vec![1.0, 1.0])).unwrap();
    sys.set_moles(0, 0.5);
    sys.set_moles(1, 0.5);
    let provider = PdssManager::new(vec![
        Pdss::Constant { mu0_rt: 0.0, molar_volume: 1.0 },
        Pdss::Constant { mu0_rt: -1.0, molar_volume: 1.0 },
    ]);

    for solver in [SolverKind::MultiPhaseVcs, SolverKind::Auto] {
        let opts = EquilOptions::default().with_solver(solver);
        let err = equilibrate_tp(&mut sys, &provider, 1000.0, P_ATM, &opts).unwrap_err();
        assert!(matches!(err, EquilError::RankDeficient(_)), "got {:?}", err);
        assert_eq!(sys.moles(), &[0.5, 0.5]);
        assert_eq!(sys.phases()[0].total_moles, 0.0);
    }
}

// Universal invariant: a (T,V) solve holds temperature and volume while the
// composition re-equilibrates.
#[test]
fn temperature_volume_solve() {
    let (mut sys, provider) = gri_system();
    let opts = EquilOptions::default();
    equilibrate_tp(&mut sys, &provider, 1500.0, 1.0e5, &opts).unwrap();
    let v0 = mixture_properties(&sys, &provider).unwrap().volume;

    equilibrate(&mut sys, &provider, PropertyPair::TV, 1800.0, v0, &opts).unwrap();
    assert_eq!(sys.temperature(), 1800.0);
    let after = mixture_properties(&sys, &provider).unwrap();
    assert!(
        (after.volume - v0).abs() <= opts.rtol * (v0.abs() + 1.0),
        "volume residual {}",
        after.volume - v0
    );
    // Heating the same volume raises the pressure
    assert!(sys.pressure() > 1.0e5);
    assert_gri_elements(&sys);
}
