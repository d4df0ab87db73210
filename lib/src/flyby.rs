//! Powered gravity assists.
//!
//! A flyby is two hyperbolas sharing a periapsis: the incoming arc
//! entering the SOI with `v_in` and the outgoing arc leaving it with
//! `v_out`, both relative to the flown-by body. Any speed difference is
//! made up by a burn at the periapsis.

use std::f64::consts;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    bodies::{Body, BodyId},
    departarrive::SoiConic,
    kepler::orbits::{Orbit, OrbitalState},
    maneuver::{Maneuver, ManeuverKind},
    math,
    time::UT,
    trajectory::Trajectory,
};

const BRENT_TOL: f64 = 1e-3;
const BRENT_MAXITER: u64 = 200;
/// Turn angles below this are flown straight through.
const ZERO_TURN: f64 = 1e-12;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlybyParams {
    pub body: BodyId,
    pub in_a: f64,
    pub in_e: f64,
    pub out_a: f64,
    pub out_e: f64,
    /// Unit vector from the body to the periapsis.
    pub direction: Vector3<f64>,
    /// Normal of the plane holding both arcs.
    pub normal: Vector3<f64>,
    pub rp: f64,
    pub in_periapsis_speed: f64,
    pub out_periapsis_speed: f64,
    pub delta_v: f64,
    /// Turn angle the two arcs fail to deliver (rad). `π` when a side
    /// cannot reach the SOI at all, in which case `delta_v` is NaN.
    pub error: f64,
    /// Periapsis date.
    pub epoch: UT,
    /// Time from SOI entry to periapsis.
    pub in_duration: f64,
    /// Time from periapsis to SOI exit.
    pub out_duration: f64,
}

/// Angle between the SOI crossing velocity and the periapsis velocity.
fn half_turn(mu: f64, soi: f64, speed: f64, rp: f64) -> Option<f64> {
    SoiConic::new(mu, soi, speed, rp).map(|c| c.exit_angle - consts::FRAC_PI_2)
}

fn conic_at_soi(mu: f64, soi: f64, speed: f64) -> (f64, f64) {
    let a = 1.0 / (2.0 / soi - speed.powi(2) / mu);
    (a, 1.0 - soi / a)
}

/// Find the periapsis radius turning `v_in` into the direction of
/// `v_out` around `body`, with the periapsis at `epoch`.
pub fn flyby(body: &Body, v_in: &Vector3<f64>, v_out: &Vector3<f64>, epoch: UT) -> FlybyParams {
    let mu = body.mu;
    let soi = body.soi_radius();
    let (s_in, s_out) = (v_in.norm(), v_out.norm());
    let delta = math::angle_between(v_in, v_out);

    let cross = v_in.cross(v_out);
    let normal = if cross.norm() > ZERO_TURN * s_in * s_out {
        cross.normalize()
    } else {
        math::any_perpendicular(v_in)
    };

    if delta < ZERO_TURN {
        let (in_a, in_e) = conic_at_soi(mu, soi, s_in);
        let (out_a, out_e) = conic_at_soi(mu, soi, s_out);
        let pv = v_in.normalize();
        return FlybyParams {
            body: body.id,
            in_a,
            in_e,
            out_a,
            out_e,
            direction: pv.cross(&normal),
            normal,
            rp: soi,
            in_periapsis_speed: s_in,
            out_periapsis_speed: s_out,
            delta_v: (s_out - s_in).abs(),
            error: 0.0,
            epoch,
            in_duration: 0.0,
            out_duration: 0.0,
        };
    }

    let residual = |rp: f64| match (half_turn(mu, soi, s_in, rp), half_turn(mu, soi, s_out, rp)) {
        (Some(psi_in), Some(psi_out)) => (psi_in + psi_out - delta).abs(),
        _ => consts::TAU,
    };
    let r_min = body.min_flyby_radius().min(soi);
    let (rp, _) = math::brent_minimize(residual, r_min, soi * (1.0 - 1e-9), BRENT_TOL, BRENT_MAXITER);

    let (Some(c_in), Some(c_out)) = (
        SoiConic::new(mu, soi, s_in, rp),
        SoiConic::new(mu, soi, s_out, rp),
    ) else {
        trace!("flyby of {}: no hyperbola reaches the SOI", body.name);
        return FlybyParams {
            body: body.id,
            in_a: f64::NAN,
            in_e: f64::NAN,
            out_a: f64::NAN,
            out_e: f64::NAN,
            direction: math::any_perpendicular(&normal),
            normal,
            rp,
            in_periapsis_speed: f64::NAN,
            out_periapsis_speed: f64::NAN,
            delta_v: f64::NAN,
            error: consts::PI,
            epoch,
            in_duration: 0.0,
            out_duration: 0.0,
        };
    };

    let psi_in = c_in.exit_angle - consts::FRAC_PI_2;
    let psi_out = c_out.exit_angle - consts::FRAC_PI_2;
    let periapsis_velocity = math::rotate_about(&v_in.normalize(), &normal, psi_in);
    let error = (psi_in + psi_out - delta).abs();
    trace!(
        "flyby of {}: rp = {:.0} m, error = {error:.3e} rad",
        body.name,
        rp
    );

    FlybyParams {
        body: body.id,
        in_a: c_in.a,
        in_e: c_in.e,
        out_a: c_out.a,
        out_e: c_out.e,
        direction: periapsis_velocity.cross(&normal),
        normal,
        rp,
        in_periapsis_speed: c_in.periapsis_speed,
        out_periapsis_speed: c_out.periapsis_speed,
        delta_v: (c_out.periapsis_speed - c_in.periapsis_speed).abs(),
        error,
        epoch,
        in_duration: c_in.tof_soi,
        out_duration: c_out.tof_soi,
    }
}

impl FlybyParams {
    pub fn soi_entry_date(&self) -> UT {
        self.epoch - self.in_duration
    }

    pub fn soi_exit_date(&self) -> UT {
        self.epoch + self.out_duration
    }

    /// The incoming and outgoing arcs, with the periapsis burn between
    /// them.
    pub fn trajectory(&self, body: &Body) -> Trajectory {
        let position = self.rp * self.direction;
        let tangent = self.normal.cross(&self.direction);
        let arrive = OrbitalState {
            orbiting: self.body,
            date: self.epoch,
            position,
            velocity: self.in_periapsis_speed * tangent,
        };
        let burn = Maneuver::new(arrive, self.out_periapsis_speed * tangent, ManeuverKind::Flyby)
            .with_context(format!("Flyby of {}", body.name));
        Trajectory::new(
            vec![
                Orbit::from_state(&burn.pre, body.mu),
                Orbit::from_state(&burn.post, body.mu),
            ],
            vec![self.soi_entry_date(), self.epoch, self.soi_exit_date()],
            vec![burn],
        )
    }
}

#[cfg(test)]
mod tests {
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    use super::*;
    use crate::bodies::kerbol::{self, EVE};

    #[test]
    fn zero_turn() {
        let system = kerbol::stock_system().unwrap();
        let eve = system.body(EVE).unwrap();
        let v = Vector3::new(1500.0, 800.0, -100.0);
        let params = flyby(eve, &v, &v, UT::new_seconds(1e6));
        assert_eq!(params.delta_v, 0.0);
        assert_eq!(params.error, 0.0);
        assert_eq!(params.rp, eve.soi_radius());
    }

    #[test]
    fn unpowered_turn() {
        let system = kerbol::stock_system().unwrap();
        let eve = system.body(EVE).unwrap();
        let soi = eve.soi_radius();
        let rp = 2_000_000.0;
        let speed = 3000.0;
        let conic = SoiConic::new(eve.mu, soi, speed, rp).unwrap();
        let turn = 2.0 * (conic.exit_angle - consts::FRAC_PI_2);
        let v_in = Vector3::new(speed, 0.0, 0.0);
        let v_out = math::rotate_about(&v_in, &Vector3::z(), turn);
        let epoch = UT::new_seconds(5e6);
        let params = flyby(eve, &v_in, &v_out, epoch);
        assert_relative_eq!(params.rp, rp, max_relative = 1e-4);
        assert_abs_diff_eq!(params.error, 0.0, epsilon = 1e-6);
        assert!(params.delta_v < 1e-3);

        let t = params.trajectory(eve);
        assert_eq!(t.maneuvers.len(), 1);
        let entry = t.start_state().unwrap();
        let exit = t.end_state().unwrap();
        assert_relative_eq!(entry.position.norm(), soi, max_relative = 1e-6);
        assert_relative_eq!(exit.position.norm(), soi, max_relative = 1e-6);
        assert_relative_eq!(entry.velocity, v_in, max_relative = 1e-4, epsilon = 1e-3);
        assert_relative_eq!(exit.velocity, v_out, max_relative = 1e-4, epsilon = 1e-3);
    }

    #[test]
    fn powered_turn() {
        let system = kerbol::stock_system().unwrap();
        let eve = system.body(EVE).unwrap();
        let v_in = Vector3::new(2500.0, 0.0, 0.0);
        let v_out = Vector3::new(0.0, 0.0, 3000.0);
        let params = flyby(eve, &v_in, &v_out, UT::new_seconds(0.0));
        assert!(params.rp >= eve.min_flyby_radius());
        assert!(params.delta_v > 0.0);
        assert_relative_eq!(params.normal, -Vector3::y(), epsilon = 1e-12);
        let t = params.trajectory(eve);
        assert_relative_eq!(t.end_state().unwrap().velocity.norm(), 3000.0, max_relative = 1e-6);
        assert_eq!(t.start_date(), params.soi_entry_date());
    }

    #[test]
    fn unreachable_soi() {
        let system = kerbol::stock_system().unwrap();
        let eve = system.body(EVE).unwrap();
        let params = flyby(
            eve,
            &Vector3::new(1.0, 0.0, 0.0),
            &Vector3::new(0.0, 1.0, 0.0),
            UT::new_seconds(0.0),
        );
        assert!(params.delta_v.is_nan());
        assert_eq!(params.error, consts::PI);
    }
}
