//! Keplerian orbits.
//!
//! Orbits are value types described by classical elements around a
//! single attractor. Semi-major axes are negative for hyperbolic
//! orbits; parabolic orbits (`e == 1`) are not supported.

use std::f64::consts;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::{bodies::BodyId, math, time::UT};

/// Tolerance of the Kepler equation solvers.
pub const KEPLER_TOL: f64 = 1e-12;
/// Iteration cap of the Kepler equation solvers.
pub const KEPLER_MAXITER: u64 = 1000;
/// Below this, eccentricity and node vectors are treated as zero.
const DEGENERATE_TOL: f64 = 1e-12;

/// Plain orbital elements, as found in body definitions and mission
/// files.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrbitalElements {
    pub orbiting: BodyId,
    /// Semi-major axis (m).
    pub a: f64,
    /// Eccentricity (dimensionless).
    pub e: f64,
    /// Inclination (radians).
    pub i: f64,
    /// Argument of periapsis (radians).
    pub argpe: f64,
    /// Longitude of ascending node (radians).
    pub lan: f64,
    /// Mean anomaly at epoch (radians).
    pub ma0: f64,
    pub epoch: UT,
}

impl OrbitalElements {
    /// A circular equatorial orbit at the given radius.
    pub fn circular(orbiting: BodyId, radius: f64) -> Self {
        Self {
            orbiting,
            a: radius,
            e: 0.0,
            i: 0.0,
            argpe: 0.0,
            lan: 0.0,
            ma0: 0.0,
            epoch: UT::ZERO,
        }
    }
}

/// Position and velocity relative to `orbiting` at `date`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrbitalState {
    pub orbiting: BodyId,
    pub date: UT,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
}

impl OrbitalState {
    #[must_use]
    pub fn with_velocity(self, velocity: Vector3<f64>) -> Self {
        Self { velocity, ..self }
    }
}

/// A Keplerian orbit.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Orbit {
    pub orbiting: BodyId,
    /// Standard gravitational parameter of the attractor (m^3/s^2).
    pub mu: f64,
    /// Semi-major axis (m), negative for hyperbolic orbits.
    pub a: f64,
    /// Eccentricity (dimensionless).
    pub e: f64,
    /// Inclination (radians).
    pub i: f64,
    /// Argument of periapsis (radians).
    pub argpe: f64,
    /// Longitude of ascending node (radians).
    pub lan: f64,
    /// Mean anomaly at epoch (radians).
    pub ma0: f64,
    pub epoch: UT,
    /// Semi-latus rectum (m).
    pub p: f64,
    /// Mean motion (rad/s).
    pub n: f64,
    /// Sidereal period (s), infinite for hyperbolic orbits.
    pub period: f64,
}

impl Orbit {
    pub fn from_elements(elements: OrbitalElements, mu: f64) -> Self {
        let OrbitalElements {
            orbiting,
            a,
            e,
            i,
            argpe,
            lan,
            ma0,
            epoch,
        } = elements;
        let n = libm::sqrt(mu / a.abs().powi(3));
        Self {
            orbiting,
            mu,
            a,
            e,
            i,
            argpe,
            lan,
            ma0,
            epoch,
            p: a * (1.0 - e.powi(2)),
            n,
            period: if e < 1.0 { consts::TAU / n } else { f64::INFINITY },
        }
    }

    pub fn elements(&self) -> OrbitalElements {
        OrbitalElements {
            orbiting: self.orbiting,
            a: self.a,
            e: self.e,
            i: self.i,
            argpe: self.argpe,
            lan: self.lan,
            ma0: self.ma0,
            epoch: self.epoch,
        }
    }

    /// Build the orbit passing through `state` around an attractor with
    /// gravitational parameter `mu`. The epoch is the state's date.
    pub fn from_state(state: &OrbitalState, mu: f64) -> Self {
        let rv = state.position;
        let vv = state.velocity;
        let r = rv.norm();
        let v2 = vv.norm_squared();

        let hv = rv.cross(&vv);
        let h = hv.norm();
        let hhat = hv / h;
        let a = 1.0 / (2.0 / r - v2 / mu);
        let ev = ((v2 - mu / r) * rv - rv.dot(&vv) * vv) / mu;
        let e = ev.norm();
        let i = libm::acos((hv.z / h).clamp(-1.0, 1.0));

        let nv = Vector3::z().cross(&hv);
        let (lan, node) = if nv.norm() <= DEGENERATE_TOL * h {
            // equatorial
            (0.0, Vector3::x())
        } else {
            (math::wrap_angle(libm::atan2(nv.y, nv.x)), nv.normalize())
        };
        let (argpe, pe_dir) = if e <= DEGENERATE_TOL {
            // circular
            (0.0, node)
        } else {
            (
                math::wrap_angle(math::signed_angle(&node, &ev, &hhat)),
                ev / e,
            )
        };
        let ta = math::signed_angle(&pe_dir, &rv, &hhat);

        Self::from_elements(
            OrbitalElements {
                orbiting: state.orbiting,
                a,
                e,
                i,
                argpe,
                lan,
                ma0: ta_to_ma(ta, e),
                epoch: state.date,
            },
            mu,
        )
    }

    pub fn is_hyperbolic(&self) -> bool {
        self.e >= 1.0
    }

    pub fn periapsis_radius(&self) -> f64 {
        self.p / (1.0 + self.e)
    }

    /// Apoapsis radius, infinite for hyperbolic orbits.
    pub fn apoapsis_radius(&self) -> f64 {
        if self.is_hyperbolic() {
            f64::INFINITY
        } else {
            self.p / (1.0 - self.e)
        }
    }

    /// Largest reachable true anomaly of a hyperbolic orbit, `π` for
    /// ellipses.
    pub fn max_true_anomaly(&self) -> f64 {
        if self.is_hyperbolic() {
            libm::acos(-1.0 / self.e)
        } else {
            consts::PI
        }
    }

    pub fn radius_at(&self, ta: f64) -> f64 {
        self.p / (1.0 + self.e * libm::cos(ta))
    }

    pub fn speed_at(&self, ta: f64) -> f64 {
        libm::sqrt(self.mu * (2.0 / self.radius_at(ta) - 1.0 / self.a))
    }

    /// The outbound (positive) true anomaly at which the orbit reaches
    /// radius `r`, NaN if it never does.
    pub fn true_anomaly_at_radius(&self, r: f64) -> f64 {
        if self.e <= DEGENERATE_TOL {
            return if (r - self.a).abs() <= 1e-9 * self.a { 0.0 } else { f64::NAN };
        }
        let cos_ta = (self.p / r - 1.0) / self.e;
        if cos_ta.abs() > 1.0 + 1e-12 {
            f64::NAN
        } else {
            libm::acos(cos_ta.clamp(-1.0, 1.0))
        }
    }

    fn sv_pqw(&self, ta: f64) -> (Vector3<f64>, Vector3<f64>) {
        let (s, c) = libm::sincos(ta);
        let r = self.radius_at(ta);
        let rv = r * Vector3::new(c, s, 0.0);
        let vv = libm::sqrt(self.mu / self.p) * Vector3::new(-s, self.e + c, 0.0);
        (rv, vv)
    }

    /// Perifocal to inertial rotation, Z-X-Z through (lan, i, argpe).
    pub fn pqw_ijk_matrix(&self) -> Matrix3<f64> {
        let (sl, cl) = libm::sincos(self.lan);
        let (sw, cw) = libm::sincos(self.argpe);
        let (si, ci) = libm::sincos(self.i);

        let m11 = cl * cw - sl * sw * ci;
        let m12 = -cl * sw - sl * cw * ci;
        let m13 = sl * si;
        let m21 = sl * cw + cl * sw * ci;
        let m22 = -sl * sw + cl * cw * ci;
        let m23 = -cl * si;
        let m31 = sw * si;
        let m32 = cw * si;
        let m33 = ci;

        Matrix3::new(m11, m12, m13, m21, m22, m23, m31, m32, m33)
    }

    /// Unit angular momentum vector.
    pub fn normal(&self) -> Vector3<f64> {
        self.pqw_ijk_matrix().column(2).into_owned()
    }

    /// Unit vector towards the periapsis.
    pub fn periapsis_direction(&self) -> Vector3<f64> {
        self.pqw_ijk_matrix().column(0).into_owned()
    }

    pub fn position_at(&self, ta: f64) -> Vector3<f64> {
        self.pqw_ijk_matrix() * self.sv_pqw(ta).0
    }

    pub fn velocity_at(&self, ta: f64) -> Vector3<f64> {
        self.pqw_ijk_matrix() * self.sv_pqw(ta).1
    }

    /// The state at true anomaly `ta`, labelled with `date`.
    pub fn state_at_true_anomaly(&self, ta: f64, date: UT) -> OrbitalState {
        let mat = self.pqw_ijk_matrix();
        let (rv, vv) = self.sv_pqw(ta);
        OrbitalState {
            orbiting: self.orbiting,
            date,
            position: mat * rv,
            velocity: mat * vv,
        }
    }

    pub fn mean_anomaly_at(&self, date: UT) -> f64 {
        self.ma0 + self.n * (date - self.epoch)
    }

    /// True anomaly at `date`, in `[0, 2π)` for ellipses.
    pub fn true_anomaly_at_date(&self, date: UT) -> f64 {
        let ta = ma_to_ta(self.mean_anomaly_at(date), self.e);
        if self.is_hyperbolic() {
            ta
        } else {
            math::wrap_angle(ta)
        }
    }

    pub fn state_at_date(&self, date: UT) -> OrbitalState {
        self.state_at_true_anomaly(self.true_anomaly_at_date(date), date)
    }

    /// Date at which the orbit passes true anomaly `ta`, within the
    /// revolution (periapsis to periapsis) containing the epoch.
    pub fn date_at_true_anomaly(&self, ta: f64) -> UT {
        let ma = ta_to_ma(ta, self.e);
        if self.is_hyperbolic() {
            self.epoch + (ma - self.ma0) / self.n
        } else {
            let revolution_start = self.epoch - math::wrap_angle(self.ma0) / self.n;
            revolution_start + math::wrap_angle(ma) / self.n
        }
    }

    /// First date not before `after` at which the orbit passes `ta`.
    pub fn next_date_at_true_anomaly(&self, ta: f64, after: UT) -> UT {
        let date = self.date_at_true_anomaly(ta);
        if self.is_hyperbolic() {
            return date;
        }
        let revs = ((after - date) / self.period).ceil();
        date + revs * self.period
    }

    /// Date closest to `near` at which the orbit passes `ta`.
    pub fn nearest_date_at_true_anomaly(&self, ta: f64, near: UT) -> UT {
        let date = self.date_at_true_anomaly(ta);
        if self.is_hyperbolic() {
            return date;
        }
        let revs = ((near - date) / self.period).round();
        date + revs * self.period
    }

    /// Time to go from `ta1` to `ta2` in the direction of motion.
    pub fn time_of_flight(&self, ta1: f64, ta2: f64) -> f64 {
        let dma = ta_to_ma(ta2, self.e) - ta_to_ma(ta1, self.e);
        if self.is_hyperbolic() {
            dma / self.n
        } else {
            math::wrap_angle(dma) / self.n
        }
    }

    /// A copy of this orbit phased so that it is at `ta` on `date`.
    #[must_use]
    pub fn anchored_at(&self, ta: f64, date: UT) -> Self {
        Self {
            ma0: ta_to_ma(ta, self.e),
            epoch: date,
            ..*self
        }
    }

    /// A copy of this orbit with its epoch moved by `dt` seconds; the
    /// same motion happens `dt` seconds later.
    #[must_use]
    pub fn shifted(&self, dt: f64) -> Self {
        Self {
            epoch: self.epoch + dt,
            ..*self
        }
    }
}

/// True anomaly from eccentric anomaly.
pub fn ea_to_ta(ea: f64, e: f64) -> f64 {
    let beta = e / (1.0 + libm::sqrt(1.0 - e.powi(2)));
    ea + 2.0 * libm::atan2(beta * libm::sin(ea), 1.0 - beta * libm::cos(ea))
}

/// Eccentric anomaly from true anomaly, in `(-π, π]`.
pub fn ta_to_ea(ta: f64, e: f64) -> f64 {
    let (s, c) = libm::sincos(ta / 2.0);
    2.0 * libm::atan2(libm::sqrt(1.0 - e) * s, libm::sqrt(1.0 + e) * c)
}

/// True anomaly from hyperbolic anomaly.
pub fn ha_to_ta(ha: f64, e: f64) -> f64 {
    2.0 * libm::atan(libm::sqrt((e + 1.0) / (e - 1.0)) * libm::tanh(ha / 2.0))
}

/// Hyperbolic anomaly from true anomaly.
pub fn ta_to_ha(ta: f64, e: f64) -> f64 {
    2.0 * libm::atanh(libm::sqrt((e - 1.0) / (e + 1.0)) * libm::tan(ta / 2.0))
}

/// Solve Kepler's equation `M = E - e sin E`.
pub fn ma_to_ea(ma: f64, e: f64) -> f64 {
    let ma = math::wrap_pi(ma);
    let ea0 = if ma < 0.0 { ma - e } else { ma + e };
    math::newton(
        |ea| ea - e * libm::sin(ea) - ma,
        |ea| 1.0 - e * libm::cos(ea),
        ea0,
        KEPLER_TOL,
        KEPLER_MAXITER,
    )
}

/// Solve the hyperbolic Kepler equation `M = e sinh H - H`.
pub fn ma_to_ha(ma: f64, e: f64) -> f64 {
    let ha0 = ma.signum() * libm::log(2.0 * ma.abs() / e + 1.8);
    math::newton(
        |ha| e * libm::sinh(ha) - ha - ma,
        |ha| e * libm::cosh(ha) - 1.0,
        ha0,
        KEPLER_TOL,
        KEPLER_MAXITER,
    )
}

pub fn ma_to_ta(ma: f64, e: f64) -> f64 {
    if e < 1.0 {
        ea_to_ta(ma_to_ea(ma, e), e)
    } else {
        ha_to_ta(ma_to_ha(ma, e), e)
    }
}

/// Mean anomaly from true anomaly, in `(-π, π]` for ellipses.
pub fn ta_to_ma(ta: f64, e: f64) -> f64 {
    if e < 1.0 {
        let ea = ta_to_ea(ta, e);
        ea - e * libm::sin(ea)
    } else {
        let ha = ta_to_ha(ta, e);
        e * libm::sinh(ha) - ha
    }
}

#[cfg(test)]
mod tests {
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    use super::*;

    const MU: f64 = 3.5316e12;

    fn sample_orbit() -> Orbit {
        Orbit::from_elements(
            OrbitalElements {
                orbiting: BodyId(1),
                a: 2_000_000.0,
                e: 0.3,
                i: 0.4,
                argpe: 1.1,
                lan: 2.3,
                ma0: 0.5,
                epoch: UT::new_seconds(1000.0),
            },
            MU,
        )
    }

    #[test]
    fn anomalies() {
        for &e in &[0.0, 0.1, 0.7, 0.99] {
            for k in -10..10 {
                let ma = k as f64 * 0.3;
                let ta = ma_to_ta(ma, e);
                assert_abs_diff_eq!(ta_to_ma(ta, e), math::wrap_pi(ma), epsilon = 1e-10);
            }
        }
        for &e in &[1.1, 2.0, 5.0] {
            for k in -10..10 {
                let ma = k as f64 * 1.7;
                let ta = ma_to_ta(ma, e);
                assert_relative_eq!(ta_to_ma(ta, e), ma, epsilon = 1e-9, max_relative = 1e-10);
            }
        }
    }

    #[test]
    fn state_round_trip() {
        let orbit = sample_orbit();
        for k in -8..8 {
            let date = UT::new_seconds(k as f64 * 0.37 * orbit.period);
            let state = orbit.state_at_date(date);
            let back = Orbit::from_state(&state, MU);
            assert_relative_eq!(back.a, orbit.a, max_relative = 1e-6);
            assert_relative_eq!(back.e, orbit.e, max_relative = 1e-6);
            assert_relative_eq!(back.i, orbit.i, max_relative = 1e-6);
            assert_relative_eq!(back.lan, orbit.lan, max_relative = 1e-6);
            assert_relative_eq!(back.argpe, orbit.argpe, max_relative = 1e-6);
            assert_eq!(back.epoch, date);
            let dma = math::wrap_pi(back.ma0 - orbit.mean_anomaly_at(date));
            assert_abs_diff_eq!(dma, 0.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn hyperbolic_round_trip() {
        let orbit = Orbit::from_elements(
            OrbitalElements {
                orbiting: BodyId(1),
                a: -5_000_000.0,
                e: 1.4,
                i: 2.9,
                argpe: 4.0,
                lan: 0.2,
                ma0: -1.0,
                epoch: UT::ZERO,
            },
            MU,
        );
        let state = orbit.state_at_date(UT::new_seconds(3600.0));
        let back = Orbit::from_state(&state, MU);
        assert_relative_eq!(back.a, orbit.a, max_relative = 1e-8);
        assert_relative_eq!(back.e, orbit.e, max_relative = 1e-8);
        assert_relative_eq!(back.argpe, orbit.argpe, max_relative = 1e-8);
        assert_relative_eq!(
            back.mean_anomaly_at(UT::ZERO),
            orbit.ma0,
            epsilon = 1e-8,
            max_relative = 1e-8
        );
    }

    #[test]
    fn dates_and_anomalies() {
        let orbit = sample_orbit();
        for k in 0..16 {
            let ta = k as f64 * 0.45 - 1.0;
            let date = orbit.date_at_true_anomaly(ta);
            assert_abs_diff_eq!(
                orbit.true_anomaly_at_date(date),
                math::wrap_angle(ta),
                epsilon = 1e-9
            );
            assert!((date - orbit.epoch).abs() < orbit.period);

            let after = UT::new_seconds(5.5 * orbit.period);
            let next = orbit.next_date_at_true_anomaly(ta, after);
            assert!(next >= after && next - after < orbit.period);
        }
        let tof = orbit.time_of_flight(3.0, 1.0);
        assert!(tof > 0.5 * orbit.period);
    }

    #[test]
    fn anchoring() {
        let orbit = sample_orbit();
        let date = UT::new_seconds(123_456.0);
        let anchored = orbit.anchored_at(2.0, date);
        assert_abs_diff_eq!(anchored.true_anomaly_at_date(date), 2.0, epsilon = 1e-10);
        assert_eq!(anchored.normal(), orbit.normal());
    }
}
