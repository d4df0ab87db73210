//! Trajectories made of conic arcs, and their assembly from Lambert
//! legs and SOI patch chains.

use color_eyre::eyre;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::{
    bodies::{BodyId, SolarSystem},
    departarrive::{self, EjectionInsertionType},
    kepler::{
        lambert::{self, LambertOptions},
        orbits::{Orbit, OrbitalState},
    },
    maneuver::{Maneuver, ManeuverKind},
    math,
    time::UT,
};

/// Fixed point passes locating the periapsis date of a moon escape or
/// capture.
const MOON_PASSES: usize = 3;

/// Consecutive conic arcs. Arc `k` is flown on
/// `[intersect_times[k], intersect_times[k + 1])`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub orbits: Vec<Orbit>,
    pub intersect_times: Vec<UT>,
    pub maneuvers: Vec<Maneuver>,
}

impl Trajectory {
    pub fn new(orbits: Vec<Orbit>, intersect_times: Vec<UT>, maneuvers: Vec<Maneuver>) -> Self {
        debug_assert_eq!(intersect_times.len(), orbits.len() + 1);
        debug_assert!(maneuvers.len() <= orbits.len() + 1);
        Self {
            orbits,
            intersect_times,
            maneuvers,
        }
    }

    pub fn start_date(&self) -> UT {
        self.intersect_times.first().copied().unwrap_or_default()
    }

    pub fn end_date(&self) -> UT {
        self.intersect_times.last().copied().unwrap_or_default()
    }

    pub fn duration(&self) -> f64 {
        self.end_date() - self.start_date()
    }

    /// Index of the arc flown at `date`; the end date belongs to the
    /// last arc. `None` outside the trajectory, or when the arcs and
    /// their boundaries don't line up.
    pub fn arc_index(&self, date: UT) -> Option<usize> {
        if self.orbits.is_empty()
            || self.intersect_times.len() != self.orbits.len() + 1
            || date < self.start_date()
            || date > self.end_date()
        {
            return None;
        }
        let k = self.intersect_times.get(1..)?.partition_point(|&t| t <= date);
        Some(k.min(self.orbits.len() - 1))
    }

    pub fn state_at(&self, date: UT) -> Option<OrbitalState> {
        self.arc_index(date)
            .map(|k| self.orbits[k].state_at_date(date))
    }

    pub fn start_state(&self) -> Option<OrbitalState> {
        self.orbits
            .first()
            .map(|orbit| orbit.state_at_date(self.start_date()))
    }

    pub fn end_state(&self) -> Option<OrbitalState> {
        self.orbits
            .last()
            .map(|orbit| orbit.state_at_date(self.end_date()))
    }

    pub fn delta_v(&self) -> f64 {
        self.maneuvers.iter().map(|m| m.deltav_mag).sum()
    }

    /// The same trajectory flown `dt` seconds later.
    #[must_use]
    pub fn shifted(self, dt: f64) -> Self {
        Self {
            orbits: self.orbits.iter().map(|orbit| orbit.shifted(dt)).collect(),
            intersect_times: self.intersect_times.iter().map(|&t| t + dt).collect(),
            maneuvers: self.maneuvers.into_iter().map(|m| m.shifted(dt)).collect(),
        }
    }
}

/// Planned SOI crossing points, relative to the body whose SOI is
/// crossed, outermost level first. Missing entries are the body
/// center.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SoiPatches {
    pub ejection: Vec<Vector3<f64>>,
    pub insertion: Vec<Vector3<f64>>,
}

pub(crate) fn patch_at(offsets: &[Vector3<f64>], k: usize) -> Vector3<f64> {
    offsets.get(k).copied().unwrap_or_else(Vector3::zeros)
}

/// A Lambert arc between two points around one attractor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LambertLeg {
    pub trajectory: Trajectory,
    /// Velocity right after departure.
    pub departure_velocity: Vector3<f64>,
    /// Velocity right before arrival.
    pub arrival_velocity: Vector3<f64>,
}

fn single_arc(
    orbiting: BodyId,
    mu: f64,
    r1: &Vector3<f64>,
    r2: &Vector3<f64>,
    start: UT,
    tof: f64,
) -> Option<LambertLeg> {
    let (v1, v2) = lambert::solve(r1, r2, tof, mu, LambertOptions::default())?;
    let orbit = Orbit::from_state(
        &OrbitalState {
            orbiting,
            date: start,
            position: *r1,
            velocity: v1,
        },
        mu,
    );
    Some(LambertLeg {
        trajectory: Trajectory::new(vec![orbit], vec![start, start + tof], vec![]),
        departure_velocity: v1,
        arrival_velocity: v2,
    })
}

/// Lambert leg from `r1` at `start` to `r2` after `tof` seconds.
///
/// With `plane_change` (the departure body's orbit normal) the leg
/// first targets `r2` projected into that plane, and turns onto the
/// real target 90° of true anomaly before arrival. Legs shorter than
/// that fly a single arc.
pub fn lambert_leg(
    orbiting: BodyId,
    mu: f64,
    r1: &Vector3<f64>,
    r2: &Vector3<f64>,
    start: UT,
    tof: f64,
    plane_change: Option<&Vector3<f64>>,
) -> Option<LambertLeg> {
    let direct = || single_arc(orbiting, mu, r1, r2, start, tof);
    let Some(normal) = plane_change else {
        return direct();
    };

    let projected = math::reject(r2, normal);
    if projected.norm() < 1e-9 * r2.norm() {
        return direct();
    }
    let projected = projected.normalize() * r2.norm();
    let in_plane = single_arc(orbiting, mu, r1, &projected, start, tof)?;
    let first = in_plane.trajectory.orbits[0];

    let arrival_ta = first.true_anomaly_at_date(start + tof);
    let turn_ta = arrival_ta - std::f64::consts::FRAC_PI_2;
    let to_arrival = first.time_of_flight(turn_ta, arrival_ta);
    if !(to_arrival < tof) {
        return direct();
    }
    let turn_date = start + (tof - to_arrival);
    let pre = first.state_at_date(turn_date);
    let (v_turn, v2) = lambert::solve(&pre.position, r2, to_arrival, mu, LambertOptions::default())?;
    let turn = Maneuver::new(pre, v_turn, ManeuverKind::PlaneChange);
    let second = Orbit::from_state(&turn.post, mu);

    Some(LambertLeg {
        trajectory: Trajectory::new(
            vec![first, second],
            vec![start, turn_date, start + tof],
            vec![turn],
        ),
        departure_velocity: in_plane.departure_velocity,
        arrival_velocity: v2,
    })
}

/// How to leave or enter the innermost parking orbit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSettings {
    pub kind: EjectionInsertionType,
    /// Keep the parking orbit's phase instead of re-phasing it.
    pub match_mo: bool,
}

/// The SOI levels between a parking orbit and the transfer body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchChain {
    /// In flight order.
    pub trajectories: Vec<Trajectory>,
    /// SOI crossing points actually flown, relative to each level's
    /// body, outermost level first.
    pub crossings: Vec<Vector3<f64>>,
    /// Parking orbit as flown.
    pub parking: Orbit,
    /// Summed distance between planned and flown crossings (m).
    pub position_error: f64,
    /// Summed difference between planned and flown crossing dates (s).
    pub time_error: f64,
}

impl PatchChain {
    pub fn delta_v(&self) -> f64 {
        self.trajectories.iter().map(Trajectory::delta_v).sum()
    }

    pub fn maneuvers(&self) -> impl Iterator<Item = &Maneuver> {
        self.trajectories.iter().flat_map(|t| &t.maneuvers)
    }
}

fn label_maneuvers(trajectory: &mut Trajectory, body: &str) {
    for m in &mut trajectory.maneuvers {
        m.context = match m.kind {
            ManeuverKind::Ejection => format!("Ejection burn from {body} parking orbit"),
            ManeuverKind::Insertion => format!("Insertion burn into {body} orbit"),
            ManeuverKind::Oberth => format!("Oberth burn at {body} periapsis"),
            _ => continue,
        };
    }
}

/// Walk down from the SOI exit of the transfer body's child towards
/// `parking`.
///
/// `v_top` is the velocity relative to the outermost body when leaving
/// its SOI at `exit_date`. `None` if a level has no conic solution.
pub fn ejection_trajectories(
    system: &SolarSystem,
    parking: &Orbit,
    transfer_body: BodyId,
    v_top: &Vector3<f64>,
    exit_date: UT,
    offsets: &[Vector3<f64>],
    settings: PatchSettings,
) -> eyre::Result<Option<PatchChain>> {
    let mut chain = system.chain_below(parking.orbiting, transfer_body)?;
    chain.reverse();

    let mut v_soi = *v_top;
    let mut exit = exit_date;
    let mut trajectories = Vec::with_capacity(chain.len());
    let mut crossings = Vec::with_capacity(chain.len());
    let mut flown_parking = *parking;
    let mut position_error = 0.0;
    let mut time_error = 0.0;

    for (k, &id) in chain.iter().enumerate() {
        let body = system.body(id)?;
        let planned = patch_at(offsets, k);
        let planned_exit = exit;
        let mut trajectory = if let Some(&child) = chain.get(k + 1) {
            let child_patch = patch_at(offsets, k + 1);
            let mut periapsis_date = exit;
            let mut escape = None;
            for _ in 0..MOON_PASSES {
                let moon = system.state_of(child, periapsis_date)?;
                let Some(t) = departarrive::escape_from_point(
                    body,
                    &(moon.position + child_patch),
                    &v_soi,
                    exit,
                ) else {
                    return Ok(None);
                };
                periapsis_date = t.start_date();
                escape = Some(t);
            }
            let Some(escape) = escape else { return Ok(None) };
            let moon = system.state_of(child, periapsis_date)?;
            let Some(start) = escape.start_state() else { return Ok(None) };
            v_soi = start.velocity - moon.velocity;
            exit = periapsis_date;
            escape
        } else {
            let Some(leg) = departarrive::ejection(
                body,
                parking,
                &v_soi,
                exit,
                settings.kind,
                settings.match_mo,
            )?
            else {
                return Ok(None);
            };
            flown_parking = leg.parking;
            leg.trajectory
        };

        let Some(flown) = trajectory.end_state() else { return Ok(None) };
        position_error += (flown.position - planned).norm();
        time_error += (trajectory.end_date() - planned_exit).abs();
        crossings.push(flown.position);
        label_maneuvers(&mut trajectory, &body.name);
        trajectories.push(trajectory);
    }

    trajectories.reverse();
    Ok(Some(PatchChain {
        trajectories,
        crossings,
        parking: flown_parking,
        position_error,
        time_error,
    }))
}

/// Walk down from the SOI entry of the transfer body's child towards
/// `parking`.
///
/// `v_top` is the velocity relative to the outermost body when entering
/// its SOI at `entry_date`. With `no_burn` the innermost arc is kept
/// but its burns are dropped.
#[allow(clippy::too_many_arguments)]
pub fn insertion_trajectories(
    system: &SolarSystem,
    parking: &Orbit,
    transfer_body: BodyId,
    v_top: &Vector3<f64>,
    entry_date: UT,
    offsets: &[Vector3<f64>],
    settings: PatchSettings,
    no_burn: bool,
) -> eyre::Result<Option<PatchChain>> {
    let mut chain = system.chain_below(parking.orbiting, transfer_body)?;
    chain.reverse();

    let mut v_soi = *v_top;
    let mut entry = entry_date;
    let mut trajectories = Vec::with_capacity(chain.len());
    let mut crossings = Vec::with_capacity(chain.len());
    let mut flown_parking = *parking;
    let mut position_error = 0.0;
    let mut time_error = 0.0;

    for (k, &id) in chain.iter().enumerate() {
        let body = system.body(id)?;
        let planned = patch_at(offsets, k);
        let planned_entry = entry;
        let mut trajectory = if let Some(&child) = chain.get(k + 1) {
            let child_patch = patch_at(offsets, k + 1);
            let mut periapsis_date = entry;
            let mut capture = None;
            for _ in 0..MOON_PASSES {
                let moon = system.state_of(child, periapsis_date)?;
                let Some(t) = departarrive::capture_to_point(
                    body,
                    &(moon.position + child_patch),
                    &v_soi,
                    entry,
                ) else {
                    return Ok(None);
                };
                periapsis_date = t.end_date();
                capture = Some(t);
            }
            let Some(capture) = capture else { return Ok(None) };
            let moon = system.state_of(child, periapsis_date)?;
            let Some(end) = capture.end_state() else { return Ok(None) };
            v_soi = end.velocity - moon.velocity;
            entry = periapsis_date;
            capture
        } else {
            let Some(leg) = departarrive::insertion(
                body,
                parking,
                &v_soi,
                entry,
                settings.kind,
                settings.match_mo,
            )?
            else {
                return Ok(None);
            };
            flown_parking = leg.parking;
            let mut trajectory = leg.trajectory;
            if no_burn {
                trajectory.maneuvers.clear();
            }
            trajectory
        };

        let Some(flown) = trajectory.start_state() else { return Ok(None) };
        position_error += (flown.position - planned).norm();
        time_error += (trajectory.start_date() - planned_entry).abs();
        crossings.push(flown.position);
        label_maneuvers(&mut trajectory, &body.name);
        trajectories.push(trajectory);
    }

    Ok(Some(PatchChain {
        trajectories,
        crossings,
        parking: flown_parking,
        position_error,
        time_error,
    }))
}

/// State of the departure or arrival point of an orbit, relative to
/// the transfer body: the orbit itself when it is flown around the
/// transfer body, else the outermost body of its chain.
pub fn anchor_state(
    system: &SolarSystem,
    orbit: &Orbit,
    transfer_body: BodyId,
    date: UT,
) -> eyre::Result<OrbitalState> {
    if orbit.orbiting == transfer_body {
        return Ok(orbit.state_at_date(date));
    }
    let chain = system.chain_below(orbit.orbiting, transfer_body)?;
    let top = chain.last().copied().unwrap_or(orbit.orbiting);
    system.state_relative_to(top, transfer_body, date)
}

/// Leave `parking` at `date` with `velocity` relative to the transfer
/// body.
///
/// A parking orbit around the transfer body itself gets a single
/// departure burn; otherwise the SOI chain is walked.
#[allow(clippy::too_many_arguments)]
pub fn departure_chain(
    system: &SolarSystem,
    parking: &Orbit,
    transfer_body: BodyId,
    anchor: &OrbitalState,
    velocity: &Vector3<f64>,
    date: UT,
    offsets: &[Vector3<f64>],
    settings: PatchSettings,
) -> eyre::Result<Option<PatchChain>> {
    if parking.orbiting != transfer_body {
        return ejection_trajectories(
            system,
            parking,
            transfer_body,
            &(velocity - anchor.velocity),
            date,
            offsets,
            settings,
        );
    }
    let body = system.body(transfer_body)?;
    let burn = Maneuver::new(*anchor, *velocity, ManeuverKind::Departure)
        .with_context(format!("Departure burn from {} orbit", body.name));
    Ok(Some(PatchChain {
        trajectories: vec![Trajectory::new(vec![*parking], vec![date, date], vec![burn])],
        crossings: vec![],
        parking: *parking,
        position_error: 0.0,
        time_error: 0.0,
    }))
}

/// Arrive into `parking` at `date` with `velocity` relative to the
/// transfer body. Mirror of [`departure_chain`].
#[allow(clippy::too_many_arguments)]
pub fn arrival_chain(
    system: &SolarSystem,
    parking: &Orbit,
    transfer_body: BodyId,
    anchor: &OrbitalState,
    velocity: &Vector3<f64>,
    date: UT,
    offsets: &[Vector3<f64>],
    settings: PatchSettings,
    no_burn: bool,
) -> eyre::Result<Option<PatchChain>> {
    if parking.orbiting != transfer_body {
        return insertion_trajectories(
            system,
            parking,
            transfer_body,
            &(velocity - anchor.velocity),
            date,
            offsets,
            settings,
            no_burn,
        );
    }
    let body = system.body(transfer_body)?;
    let burns = if no_burn {
        vec![]
    } else {
        vec![Maneuver::new(anchor.with_velocity(*velocity), anchor.velocity, ManeuverKind::Arrival)
            .with_context(format!("Arrival burn into {} orbit", body.name))]
    };
    Ok(Some(PatchChain {
        trajectories: vec![Trajectory::new(vec![*parking], vec![date, date], burns)],
        crossings: vec![],
        parking: *parking,
        position_error: 0.0,
        time_error: 0.0,
    }))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::{
        bodies::kerbol::{self, DUNA, KERBIN, KERBOL, MUN},
        kepler::orbits::OrbitalElements,
    };

    #[test]
    fn arc_lookup() {
        let system = kerbol::stock_system().unwrap();
        let kerbin = *system.orbit_of(KERBIN).unwrap();
        let duna = *system.orbit_of(DUNA).unwrap();
        let t = Trajectory::new(
            vec![kerbin, duna],
            vec![UT::new_seconds(0.0), UT::new_seconds(10.0), UT::new_seconds(20.0)],
            vec![],
        );
        assert_eq!(t.arc_index(UT::new_seconds(-1.0)), None);
        assert_eq!(t.arc_index(UT::new_seconds(0.0)), Some(0));
        assert_eq!(t.arc_index(UT::new_seconds(9.9)), Some(0));
        assert_eq!(t.arc_index(UT::new_seconds(10.0)), Some(1));
        assert_eq!(t.arc_index(UT::new_seconds(20.0)), Some(1));
        assert_eq!(t.arc_index(UT::new_seconds(20.1)), None);
        assert_eq!(
            t.state_at(UT::new_seconds(15.0)).unwrap(),
            duna.state_at_date(UT::new_seconds(15.0))
        );
        let shifted = t.shifted(5.0);
        assert_eq!(shifted.arc_index(UT::new_seconds(14.0)), Some(0));
        assert_eq!(
            shifted.state_at(UT::new_seconds(20.0)).unwrap().position,
            duna.state_at_date(UT::new_seconds(15.0)).position
        );

        // boundaries that don't match the arcs, as a hand-edited file may have
        let broken = Trajectory {
            orbits: vec![kerbin, duna],
            intersect_times: vec![],
            maneuvers: vec![],
        };
        assert_eq!(broken.arc_index(UT::ZERO), None);
        assert_eq!(broken.state_at(UT::ZERO), None);
        let short = Trajectory {
            intersect_times: vec![UT::ZERO, UT::new_seconds(10.0)],
            ..broken
        };
        assert_eq!(short.arc_index(UT::new_seconds(5.0)), None);
    }

    #[test]
    fn plane_change_leg() {
        let system = kerbol::stock_system().unwrap();
        let mu = system.body(KERBOL).unwrap().mu;
        let kerbin = system.orbit_of(KERBIN).unwrap();
        let start = UT::new_seconds(1e6);
        let tof = 5.5e6;
        let r1 = kerbin.state_at_date(start).position;
        let r2 = math::rotate_about(&r1, &Vector3::z(), 150f64.to_radians()) * 1.5
            + Vector3::new(0.0, 0.0, 1.5e9);
        let leg = lambert_leg(KERBOL, mu, &r1, &r2, start, tof, Some(&kerbin.normal())).unwrap();
        assert_eq!(leg.trajectory.orbits.len(), 2);
        assert_eq!(leg.trajectory.maneuvers.len(), 1);
        // the first arc stays in Kerbin's plane
        assert!(leg.trajectory.orbits[0].i.abs() < 1e-6);
        let end = leg.trajectory.end_state().unwrap();
        assert_relative_eq!(end.position, r2, max_relative = 1e-6, epsilon = 1e-3);
        assert_relative_eq!(end.velocity, leg.arrival_velocity, max_relative = 1e-6, epsilon = 1e-6);
        let turn = &leg.trajectory.maneuvers[0];
        assert_eq!(turn.pre.date, leg.trajectory.intersect_times[1]);

        let direct = lambert_leg(KERBOL, mu, &r1, &r2, start, tof, None).unwrap();
        assert_eq!(direct.trajectory.orbits.len(), 1);
        assert!(direct.trajectory.maneuvers.is_empty());
    }

    #[test]
    fn moon_chain() {
        let system = kerbol::stock_system().unwrap();
        let mun = system.body(MUN).unwrap();
        let parking = Orbit::from_elements(OrbitalElements::circular(MUN, mun.radius + 30_000.0), mun.mu);
        let v_top = Vector3::new(0.0, 1000.0, 0.0);
        let exit = UT::new_seconds(3e6);
        let chain = ejection_trajectories(
            &system,
            &parking,
            KERBOL,
            &v_top,
            exit,
            &[],
            PatchSettings::default(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(chain.trajectories.len(), 2);
        assert_eq!(chain.crossings.len(), 2);
        // Mun ejection first, then the unpowered Kerbin escape
        assert_eq!(chain.trajectories[0].orbits[0].orbiting, MUN);
        assert!(chain.trajectories[1].maneuvers.is_empty());
        assert_relative_eq!(chain.trajectories[1].end_date().into_seconds(), 3e6, max_relative = 1e-9);
        assert_relative_eq!(
            chain.trajectories[0].end_date().into_seconds(),
            chain.trajectories[1].start_date().into_seconds(),
            max_relative = 1e-9
        );
        assert!(chain.maneuvers().all(|m| !m.context.is_empty()));
        // zero offsets: the crossings are a whole SOI radius away
        assert!(chain.position_error > 84e6);
    }
}
