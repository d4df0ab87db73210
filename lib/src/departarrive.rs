//! Ejection from and insertion into parking orbits at the edge of a
//! sphere of influence.
//!
//! Every function here works in the frame of the body owning the SOI.
//! A requested SOI crossing velocity that no conic can deliver
//! (an ellipse whose apoapsis stays inside the SOI) yields `None`.

use std::f64::consts;

use color_eyre::eyre;
use itertools::Itertools;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    bodies::{Body, BodyId},
    kepler::orbits::{self, Orbit, OrbitalState},
    maneuver::{Maneuver, ManeuverKind},
    math,
    time::UT,
    trajectory::Trajectory,
};

/// Samples of the scan bracketing the exact burn anomalies.
const SCAN_SAMPLES: usize = 360;
const BRENT_MAXITER: u64 = 200;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EjectionInsertionType {
    /// Burn where the escape periapsis meets the parking orbit, in the
    /// plane closest to the parking plane.
    #[default]
    FastDirect,
    /// Search the parking orbit for the cheapest direct burn.
    Direct,
    /// Drop to the lowest safe periapsis first, in the plane closest to
    /// the parking plane.
    FastOberth,
    /// Search the parking orbit for the cheapest Oberth burn pair.
    Oberth,
}

/// One SOI level of an ejection or insertion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchLeg {
    pub trajectory: Trajectory,
    /// The parking orbit as flown: the given orbit, or a copy phased to
    /// pass the burn point on time.
    pub parking: Orbit,
    /// How much later than requested everything happens because the
    /// parking orbit's phase was kept.
    pub date_shift: f64,
}

/// Conic reaching the SOI radius at a given speed from a given
/// periapsis radius.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SoiConic {
    pub a: f64,
    pub e: f64,
    pub rp: f64,
    /// True anomaly at the SOI radius.
    pub nu_soi: f64,
    /// Angle from the periapsis direction to the velocity at the SOI.
    pub exit_angle: f64,
    /// Time from periapsis to the SOI.
    pub tof_soi: f64,
    pub periapsis_speed: f64,
}

impl SoiConic {
    /// `None` when no conic with periapsis `rp` crosses the SOI at
    /// `speed`.
    pub fn new(mu: f64, soi: f64, speed: f64, rp: f64) -> Option<Self> {
        if !(speed > 0.0 && rp > 0.0 && rp < soi) {
            return None;
        }
        let a = 1.0 / (2.0 / soi - speed.powi(2) / mu);
        let e = 1.0 - rp / a;
        if !a.is_finite() || e < 0.0 || (e - 1.0).abs() < 1e-9 || (e < 1.0 && 2.0 * a - rp < soi) {
            return None;
        }
        let p = a * (1.0 - e.powi(2));
        let nu_soi = libm::acos(((p / soi - 1.0) / e).clamp(-1.0, 1.0));
        let (s, c) = libm::sincos(nu_soi);
        let fpa = libm::atan2(e * s, 1.0 + e * c);
        let n = libm::sqrt(mu / a.abs().powi(3));
        Some(Self {
            a,
            e,
            rp,
            nu_soi,
            exit_angle: nu_soi + consts::FRAC_PI_2 - fpa,
            tof_soi: orbits::ta_to_ma(nu_soi, e) / n,
            periapsis_speed: libm::sqrt(mu * (2.0 / rp - 1.0 / a)),
        })
    }

    /// Periapsis state of this conic when its periapsis points along the
    /// unit vector `pe_dir` and it turns counterclockwise around
    /// `normal`.
    ///
    /// With `pe_dir` rotated by `-exit_angle` about `normal` from the
    /// SOI velocity direction, the conic crosses the SOI with exactly
    /// that velocity.
    pub fn periapsis_state(
        &self,
        orbiting: BodyId,
        pe_dir: &Vector3<f64>,
        normal: &Vector3<f64>,
        date: UT,
    ) -> OrbitalState {
        OrbitalState {
            orbiting,
            date,
            position: self.rp * pe_dir,
            velocity: self.periapsis_speed * normal.cross(pe_dir),
        }
    }
}

/// True anomaly at which `orbit` leaves a SOI of radius `soi`.
pub fn ejection_true_anomaly(orbit: &Orbit, soi: f64) -> f64 {
    orbit.true_anomaly_at_radius(soi)
}

/// True anomaly at which `orbit` enters a SOI of radius `soi`.
pub fn insertion_true_anomaly(orbit: &Orbit, soi: f64) -> f64 {
    -orbit.true_anomaly_at_radius(soi)
}

/// Date at which `orbit` leaves the SOI after its periapsis.
pub fn ejection_date(orbit: &Orbit, soi: f64) -> UT {
    let periapsis = orbit.date_at_true_anomaly(0.0);
    periapsis + orbit.time_of_flight(0.0, ejection_true_anomaly(orbit, soi))
}

/// Date at which `orbit` enters the SOI before its periapsis.
pub fn insertion_date(orbit: &Orbit, soi: f64) -> UT {
    let periapsis = orbit.date_at_true_anomaly(0.0);
    periapsis - orbit.time_of_flight(insertion_true_anomaly(orbit, soi), 0.0)
}

pub fn soi_exit_state(orbit: &Orbit, soi: f64) -> OrbitalState {
    orbit.state_at_true_anomaly(ejection_true_anomaly(orbit, soi), ejection_date(orbit, soi))
}

pub fn soi_entry_state(orbit: &Orbit, soi: f64) -> OrbitalState {
    orbit.state_at_true_anomaly(insertion_true_anomaly(orbit, soi), insertion_date(orbit, soi))
}

/// Normal of the plane containing `dir` closest to the plane with
/// normal `normal`.
fn closest_plane(normal: &Vector3<f64>, dir: &Vector3<f64>) -> Vector3<f64> {
    let n = math::reject(normal, dir);
    if n.norm() < 1e-9 {
        math::any_perpendicular(dir)
    } else {
        n.normalize()
    }
}

/// Parking orbit true anomaly closest to the direction `dir`.
fn parking_anomaly(parking: &Orbit, dir: &Vector3<f64>) -> f64 {
    let normal = parking.normal();
    math::wrap_angle(math::signed_angle(
        &parking.periapsis_direction(),
        &math::reject(dir, &normal),
        &normal,
    ))
}

/// Cheapest parking anomaly at which the exit direction error `err`
/// vanishes.
///
/// Every sign change of `err` over the scan brackets one exact burn
/// point, refined with Brent's method on `cost`. `None` when the
/// direction can't be reached from the parking orbit.
fn optimal_anomaly(err: impl Fn(f64) -> f64, cost: impl Fn(f64) -> f64) -> Option<f64> {
    let step = consts::TAU / SCAN_SAMPLES as f64;
    (0..=SCAN_SAMPLES)
        .map(|k| {
            let theta = k as f64 * step;
            (theta, err(theta))
        })
        .tuple_windows()
        .filter(|&((_, ea), (_, eb))| ea * eb <= 0.0)
        .map(|((a, _), (b, _))| math::brent_minimize(&cost, a, b, 1e-10, BRENT_MAXITER))
        .filter(|(_, c)| c.is_finite())
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(theta, _)| math::wrap_angle(theta))
}

/// `deltaV * exp(min(100 * err, 10))`
fn penalized(deltav: f64, err: f64) -> f64 {
    deltav * libm::exp((100.0 * err).min(10.0))
}

/// Arcs and burns of an ejection computed at the ideal dates.
struct Burns {
    orbits: Vec<Orbit>,
    intersect_times: Vec<UT>,
    maneuvers: Vec<Maneuver>,
    /// Parking true anomaly of the first burn.
    burn_anomaly: f64,
}

impl Burns {
    fn delta_v(&self) -> f64 {
        self.maneuvers.iter().map(|m| m.deltav_mag).sum()
    }
}

fn cheapest(a: Option<Burns>, b: Option<Burns>) -> Option<Burns> {
    a.into_iter()
        .chain(b)
        .filter(|burns| burns.delta_v().is_finite())
        .min_by(|a, b| a.delta_v().total_cmp(&b.delta_v()))
}

/// One burn on the parking orbit at `theta` onto the escape conic with
/// periapsis along `pe_dir`.
///
/// The escape arc starts from the exact periapsis state, so it leaves
/// the SOI with the requested velocity even when `pe_dir` is off the
/// parking orbit.
fn direct_burn(
    body: &Body,
    parking: &Orbit,
    hyp: &SoiConic,
    theta: f64,
    pe_dir: &Vector3<f64>,
    normal: &Vector3<f64>,
    exit_date: UT,
) -> Burns {
    let periapsis = hyp.periapsis_state(body.id, pe_dir, normal, exit_date - hyp.tof_soi);
    let pre = parking.state_at_true_anomaly(theta, periapsis.date);
    let maneuver = Maneuver::new(pre, periapsis.velocity, ManeuverKind::Ejection);
    let escape = Orbit::from_state(&periapsis, body.mu);
    let exit = ejection_date(&escape, body.soi_radius());
    Burns {
        orbits: vec![escape],
        intersect_times: vec![periapsis.date, exit],
        maneuvers: vec![maneuver],
        burn_anomaly: theta,
    }
}

/// A drop from the parking orbit at `theta` to the low periapsis
/// half an ellipse later, then a kick onto the escape conic.
fn oberth_burns(
    body: &Body,
    parking: &Orbit,
    hyp: &SoiConic,
    theta: f64,
    pe_dir: &Vector3<f64>,
    normal: &Vector3<f64>,
    exit_date: UT,
) -> Burns {
    let r_b = parking.position_at(theta);
    let rhat = r_b.normalize();
    let a_t = 0.5 * (r_b.norm() + hyp.rp);
    let half_period = consts::PI * libm::sqrt(a_t.powi(3) / body.mu);
    let periapsis = hyp.periapsis_state(body.id, pe_dir, normal, exit_date - hyp.tof_soi);
    let burn_date = periapsis.date - half_period;

    let pre = parking.state_at_true_anomaly(theta, burn_date);
    let speed = libm::sqrt(body.mu * (2.0 / r_b.norm() - 1.0 / a_t));
    let drop_normal = closest_plane(normal, &rhat);
    let drop = Maneuver::new(pre, speed * drop_normal.cross(&rhat), ManeuverKind::Ejection);
    let transfer = Orbit::from_state(&drop.post, body.mu);

    let low = transfer.state_at_date(periapsis.date);
    let kick = Maneuver::new(low, periapsis.velocity, ManeuverKind::Oberth);
    let escape = Orbit::from_state(&periapsis, body.mu);
    let exit = ejection_date(&escape, body.soi_radius());
    Burns {
        orbits: vec![transfer, escape],
        intersect_times: vec![burn_date, periapsis.date, exit],
        maneuvers: vec![drop, kick],
        burn_anomaly: theta,
    }
}

fn fast_direct(
    body: &Body,
    parking: &Orbit,
    v_soi: &Vector3<f64>,
    exit_date: UT,
) -> eyre::Result<Option<Burns>> {
    let speed = v_soi.norm();
    let vhat = v_soi / speed;
    let soi = body.soi_radius();
    let normal = closest_plane(&parking.normal(), &vhat);
    let pe_dir_for = |hyp: &SoiConic| math::rotate_about(&vhat, &normal, -hyp.exit_angle);
    let anomaly_for = |rp: f64| {
        SoiConic::new(body.mu, soi, speed, rp).map(|hyp| parking_anomaly(parking, &pe_dir_for(&hyp)))
    };

    let (rpe, rap) = (parking.periapsis_radius(), parking.apoapsis_radius());
    let rp = if rap - rpe <= 1e-9 * rap {
        rpe
    } else {
        // periapsis radius whose burn anomaly sits at that radius on the
        // parking orbit
        let residual = |rp: f64| anomaly_for(rp).map_or(f64::NAN, |ta| parking.radius_at(ta) - rp);
        let (lo, hi) = (residual(rpe), residual(rap));
        if lo.is_nan() || hi.is_nan() {
            return Ok(None);
        }
        if lo <= 0.0 {
            rpe
        } else if hi >= 0.0 {
            rap
        } else {
            math::brent_root(residual, rpe, rap, 1e-6 * rpe, BRENT_MAXITER)?
        }
    };

    let Some(theta) = anomaly_for(rp) else {
        return Ok(None);
    };
    let rp = parking.radius_at(theta);
    let Some(hyp) = SoiConic::new(body.mu, soi, speed, rp) else {
        return Ok(None);
    };
    let pe_dir = pe_dir_for(&hyp);
    Ok(Some(direct_burn(body, parking, &hyp, theta, &pe_dir, &normal, exit_date)))
}

fn optimal_direct(
    body: &Body,
    parking: &Orbit,
    v_soi: &Vector3<f64>,
    exit_date: UT,
) -> eyre::Result<Option<Burns>> {
    let speed = v_soi.norm();
    let vhat = v_soi / speed;
    let soi = body.soi_radius();
    let geometry = |theta: f64| {
        let r_b = parking.position_at(theta);
        let rhat = r_b.normalize();
        let hyp = SoiConic::new(body.mu, soi, speed, r_b.norm())?;
        let normal = rhat.cross(&vhat);
        (normal.norm() > 1e-12).then(|| (hyp, normal.normalize(), rhat))
    };
    let err = |theta: f64| {
        geometry(theta).map_or(f64::NAN, |(hyp, _, rhat)| {
            math::angle_between(&rhat, &vhat) - hyp.exit_angle
        })
    };
    let cost = |theta: f64| {
        let Some((hyp, normal, rhat)) = geometry(theta) else {
            return f64::NAN;
        };
        let err = (math::angle_between(&rhat, &vhat) - hyp.exit_angle).abs();
        let burn = hyp.periapsis_speed * normal.cross(&rhat) - parking.velocity_at(theta);
        penalized(burn.norm(), err)
    };
    let exact = optimal_anomaly(err, cost).and_then(|theta| {
        let (hyp, normal, rhat) = geometry(theta)?;
        Some(direct_burn(body, parking, &hyp, theta, &rhat, &normal, exit_date))
    });
    Ok(cheapest(exact, fast_direct(body, parking, v_soi, exit_date)?))
}

fn fast_oberth(
    body: &Body,
    parking: &Orbit,
    hyp: &SoiConic,
    vhat: &Vector3<f64>,
    exit_date: UT,
) -> Burns {
    let normal = closest_plane(&parking.normal(), vhat);
    let pe_dir = math::rotate_about(vhat, &normal, -hyp.exit_angle);
    let theta = parking_anomaly(parking, &-pe_dir);
    oberth_burns(body, parking, hyp, theta, &pe_dir, &normal, exit_date)
}

fn oberth(
    body: &Body,
    parking: &Orbit,
    v_soi: &Vector3<f64>,
    exit_date: UT,
    fast: bool,
) -> Option<Burns> {
    let vhat = v_soi / v_soi.norm();
    let hyp = SoiConic::new(body.mu, body.soi_radius(), v_soi.norm(), body.min_flyby_radius())?;
    let approximate = fast_oberth(body, parking, &hyp, &vhat, exit_date);
    if fast {
        return Some(approximate);
    }

    let plane = |theta: f64| {
        let pe_dir = -parking.position_at(theta).normalize();
        let normal = pe_dir.cross(&vhat);
        (normal.norm() > 1e-12).then(|| (normal.normalize(), pe_dir))
    };
    let err = |theta: f64| {
        plane(theta).map_or(f64::NAN, |(_, pe_dir)| {
            math::angle_between(&pe_dir, &vhat) - hyp.exit_angle
        })
    };
    let cost = |theta: f64| {
        let Some((normal, pe_dir)) = plane(theta) else {
            return f64::NAN;
        };
        let r_b = parking.position_at(theta);
        let a_t = 0.5 * (r_b.norm() + hyp.rp);
        let v_drop = libm::sqrt(body.mu * (2.0 / r_b.norm() - 1.0 / a_t));
        let v_low = libm::sqrt(body.mu * (2.0 / hyp.rp - 1.0 / a_t));
        let drop = (v_drop * normal.cross(&-pe_dir) - parking.velocity_at(theta)).norm();
        let kick = (hyp.periapsis_speed - v_low).abs();
        let err = (math::angle_between(&pe_dir, &vhat) - hyp.exit_angle).abs();
        penalized(drop + kick, err)
    };
    let exact = optimal_anomaly(err, cost).and_then(|theta| {
        let (normal, pe_dir) = plane(theta)?;
        Some(oberth_burns(body, parking, &hyp, theta, &pe_dir, &normal, exit_date))
    });
    cheapest(exact, Some(approximate))
}

/// Keep the parking orbit's phase by moving the whole ejection to the
/// closest pass over the burn anomaly, or re-phase the parking orbit.
fn phase(parking: &Orbit, burns: Burns, match_mo: bool) -> PatchLeg {
    let Burns {
        orbits,
        intersect_times,
        maneuvers,
        burn_anomaly,
    } = burns;
    let ideal = intersect_times[0];
    let trajectory = Trajectory::new(orbits, intersect_times, maneuvers);
    if match_mo {
        let actual = parking.nearest_date_at_true_anomaly(burn_anomaly, ideal);
        let date_shift = actual - ideal;
        PatchLeg {
            trajectory: trajectory.shifted(date_shift),
            parking: *parking,
            date_shift,
        }
    } else {
        PatchLeg {
            trajectory,
            parking: parking.anchored_at(burn_anomaly, ideal),
            date_shift: 0.0,
        }
    }
}

/// Leave `parking` (around `body`) so as to cross the SOI at
/// `exit_date` with velocity `v_soi` relative to the body.
pub fn ejection(
    body: &Body,
    parking: &Orbit,
    v_soi: &Vector3<f64>,
    exit_date: UT,
    kind: EjectionInsertionType,
    match_mo: bool,
) -> eyre::Result<Option<PatchLeg>> {
    if parking.is_hyperbolic() {
        eyre::bail!("parking orbit around {} is not closed", body.name);
    }
    if !(v_soi.norm() > 0.0) {
        return Ok(None);
    }
    let burns = match kind {
        EjectionInsertionType::FastDirect => fast_direct(body, parking, v_soi, exit_date)?,
        EjectionInsertionType::Direct => optimal_direct(body, parking, v_soi, exit_date)?,
        EjectionInsertionType::FastOberth => oberth(body, parking, v_soi, exit_date, true),
        EjectionInsertionType::Oberth => oberth(body, parking, v_soi, exit_date, false),
    };
    let leg = burns.map(|burns| phase(parking, burns, match_mo));
    if let Some(leg) = &leg {
        trace!(
            "ejection from {} ({kind:?}): {:.1} m/s, shifted {:.1} s",
            body.name,
            leg.trajectory.delta_v(),
            leg.date_shift
        );
    }
    Ok(leg)
}

/// Arrive from a SOI crossing at `entry_date` with velocity `v_soi`
/// relative to the body into `parking`.
///
/// Solved as the ejection of the time-reversed problem.
pub fn insertion(
    body: &Body,
    parking: &Orbit,
    v_soi: &Vector3<f64>,
    entry_date: UT,
    kind: EjectionInsertionType,
    match_mo: bool,
) -> eyre::Result<Option<PatchLeg>> {
    let reversed = reverse_orbit(parking);
    let Some(leg) = ejection(body, &reversed, &-v_soi, reverse_date(entry_date), kind, match_mo)?
    else {
        return Ok(None);
    };
    Ok(Some(PatchLeg {
        trajectory: reverse_trajectory(&leg.trajectory),
        parking: if match_mo { *parking } else { reverse_orbit(&leg.parking) },
        date_shift: -leg.date_shift,
    }))
}

/// Unpowered escape whose periapsis is at `periapsis` (relative to the
/// body), crossing the SOI at `exit_date` with velocity `v_soi`.
pub fn escape_from_point(
    body: &Body,
    periapsis: &Vector3<f64>,
    v_soi: &Vector3<f64>,
    exit_date: UT,
) -> Option<Trajectory> {
    let rp = periapsis.norm();
    let hyp = SoiConic::new(body.mu, body.soi_radius(), v_soi.norm(), rp)?;
    let phat = periapsis / rp;
    let normal = closest_plane(&phat.cross(v_soi), &phat);
    let state = hyp.periapsis_state(body.id, &phat, &normal, exit_date - hyp.tof_soi);
    let escape = Orbit::from_state(&state, body.mu);
    let exit = ejection_date(&escape, body.soi_radius());
    Some(Trajectory::new(vec![escape], vec![state.date, exit], vec![]))
}

/// Unpowered capture entering the SOI at `entry_date` with velocity
/// `v_soi` and reaching its periapsis at `periapsis`.
pub fn capture_to_point(
    body: &Body,
    periapsis: &Vector3<f64>,
    v_soi: &Vector3<f64>,
    entry_date: UT,
) -> Option<Trajectory> {
    escape_from_point(body, periapsis, &-v_soi, reverse_date(entry_date))
        .map(|trajectory| reverse_trajectory(&trajectory))
}

fn reverse_date(date: UT) -> UT {
    UT::new_seconds(-date.into_seconds())
}

fn reverse_state(state: &OrbitalState) -> OrbitalState {
    OrbitalState {
        date: reverse_date(state.date),
        velocity: -state.velocity,
        ..*state
    }
}

/// The same orbit flown backwards in time.
pub fn reverse_orbit(orbit: &Orbit) -> Orbit {
    let state = orbit.state_at_true_anomaly(orbit.true_anomaly_at_date(orbit.epoch), orbit.epoch);
    Orbit::from_state(&reverse_state(&state), orbit.mu)
}

/// The same trajectory flown backwards in time.
pub fn reverse_trajectory(trajectory: &Trajectory) -> Trajectory {
    let orbits = trajectory.orbits.iter().rev().map(reverse_orbit).collect();
    let intersect_times = trajectory
        .intersect_times
        .iter()
        .rev()
        .map(|&date| reverse_date(date))
        .collect();
    let maneuvers = trajectory
        .maneuvers
        .iter()
        .rev()
        .map(|m| {
            let kind = match m.kind {
                ManeuverKind::Ejection => ManeuverKind::Insertion,
                ManeuverKind::Insertion => ManeuverKind::Ejection,
                kind => kind,
            };
            Maneuver::new(reverse_state(&m.post), -m.pre.velocity, kind)
        })
        .collect();
    Trajectory::new(orbits, intersect_times, maneuvers)
}
