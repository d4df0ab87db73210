use approx::assert_relative_eq;
use kertraj::{
    bodies::kerbol::{DUNA, KERBIN},
    evolution,
    maneuver::ManeuverKind,
    porkchop::{PorkchopCalculator, PorkchopSettings},
    time::UT,
    transfer::{TransferCalculator, TransferSettings},
};

mod common;

fn kerbin_duna(n_times: usize) -> PorkchopSettings {
    PorkchopSettings {
        n_times,
        threads: Some(2),
        ..PorkchopSettings::new(UT::ZERO, UT::new_seconds(2e7), 5e6, 1e7)
    }
}

#[test]
fn porkchop_best_cell() {
    let system = common::stock();
    let start = common::circular(&system, KERBIN, 100_000.0);
    let end = common::circular(&system, DUNA, 100_000.0);
    let calc = PorkchopCalculator::new(system, start, end, kerbin_duna(5)).unwrap();
    let porkchop = calc.compute().unwrap();

    assert_eq!(porkchop.start_dates.len(), 5);
    assert_eq!(porkchop.flight_times.len(), 5);
    assert_eq!(porkchop.delta_v.len(), 5);
    assert!(porkchop.delta_v.iter().all(|row| row.len() == 5));

    let (i, j) = porkchop.best.unwrap();
    let best = porkchop.delta_v[i][j];
    assert!(best.is_finite() && best > 0.0);
    for dv in porkchop.delta_v.iter().flatten().filter(|dv| dv.is_finite()) {
        assert!(*dv >= best);
    }
    let (min, max) = porkchop.delta_v_range.unwrap();
    assert_eq!(min, best);
    assert!(max >= min);

    let transfer = porkchop.best_transfer.unwrap();
    assert_eq!(transfer.start_date, porkchop.start_dates[j]);
    assert_eq!(transfer.flight_time, porkchop.flight_times[i]);
    assert_relative_eq!(transfer.delta_v, best, max_relative = 1e-12);
}

#[test]
fn porkchop_rejects_bad_windows() {
    let system = common::stock();
    let start = common::circular(&system, KERBIN, 100_000.0);
    let end = common::circular(&system, DUNA, 100_000.0);
    let mut settings = kerbin_duna(5);
    settings.flight_time_min = -1.0;
    assert!(PorkchopCalculator::new(system.clone(), start, end, settings).is_err());
    let mut settings = kerbin_duna(5);
    settings.start_date_max = UT::new_seconds(-1.0);
    assert!(PorkchopCalculator::new(system, start, end, settings).is_err());
}

#[test]
fn kerbin_to_duna() {
    let system = common::stock();
    let start = common::circular(&system, KERBIN, 700_000.0);
    let end = common::circular(&system, DUNA, 100_000.0);
    let porkchop = PorkchopCalculator::new(system.clone(), start, end, kerbin_duna(9))
        .unwrap()
        .compute()
        .unwrap();
    let initial = porkchop.best_transfer.unwrap();
    assert!(initial.is_feasible());

    let calc = TransferCalculator::new(system.clone(), start, end, TransferSettings::default()).unwrap();
    assert_eq!(calc.delta_v(initial.start_date, initial.flight_time), initial.delta_v);

    // unpatched, the transfer arc starts and ends at the planet centers
    assert!(initial.patch_position_error > 1e7);
    let kinds = initial.maneuvers.iter().map(|m| m.kind).collect::<Vec<_>>();
    assert_eq!(kinds, vec![ManeuverKind::Ejection, ManeuverKind::Insertion]);
    assert_relative_eq!(
        initial.ejections[0].end_date().into_seconds(),
        initial.transfer.start_date().into_seconds(),
        max_relative = 1e-9
    );
    assert_relative_eq!(
        initial.insertions[0].start_date().into_seconds(),
        initial.transfer.end_date().into_seconds(),
        max_relative = 1e-9
    );

    // the ejection leaves Kerbin's SOI on the Lambert departure velocity
    let lambert = initial.transfer.start_state().unwrap();
    let kerbin = system.state_of(KERBIN, initial.start_date).unwrap();
    let exit = initial.ejections[0].end_state().unwrap();
    let v_inf = lambert.velocity - kerbin.velocity;
    assert_relative_eq!(exit.velocity, v_inf, max_relative = 1e-6, epsilon = 1e-6);
    assert_relative_eq!(
        exit.position.norm(),
        system.body(KERBIN).unwrap().soi_radius(),
        max_relative = 1e-6
    );
    let kerbin_mu = system.body(KERBIN).unwrap().mu;
    let parking_speed = (kerbin_mu / start.a).sqrt();
    let periapsis_speed = (v_inf.norm_squared() + 2.0 * kerbin_mu / start.a
        - 2.0 * kerbin_mu / system.body(KERBIN).unwrap().soi_radius())
    .sqrt();
    let ejection_dv = initial.maneuvers[0].deltav_mag;
    assert!(ejection_dv >= periapsis_speed - parking_speed - 1e-6);
    assert!(ejection_dv < 1.2 * (periapsis_speed - parking_speed) + 50.0);

    let refined = calc.optimize_soi_patches(&initial).unwrap();
    assert!(evolution::no_worse(refined.patch_cost(), initial.patch_cost()));
    assert!(refined.patch_position_error < initial.patch_position_error);
    assert_eq!(refined.soi_patches.ejection.len(), 1);
    assert_eq!(refined.soi_patches.insertion.len(), 1);
    assert_relative_eq!(refined.delta_v, initial.delta_v, max_relative = 0.05);
}

#[test]
fn no_insertion_burn() {
    let system = common::stock();
    let start = common::circular(&system, KERBIN, 100_000.0);
    let end = common::circular(&system, DUNA, 100_000.0);
    let porkchop = PorkchopCalculator::new(system.clone(), start, end, kerbin_duna(5))
        .unwrap()
        .compute()
        .unwrap();
    let with_burn = porkchop.best_transfer.unwrap();

    let settings = TransferSettings {
        no_insertion_burn: true,
        ..TransferSettings::default()
    };
    let calc = TransferCalculator::new(system, start, end, settings).unwrap();
    let without = calc
        .compute(with_burn.start_date, with_burn.flight_time, &with_burn.soi_patches)
        .unwrap();
    assert_eq!(without.maneuvers.len(), 1);
    assert_eq!(without.insertions.len(), 1);
    assert!(without.delta_v < with_burn.delta_v);
}
