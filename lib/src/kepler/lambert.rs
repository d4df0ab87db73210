//! A relatively quick and robust Lambert's problem solver.
//!
//! The main solver is based on ["Revisiting Lambert's Problem" (Izzo
//! 2014)][1] and [poliastro's `poliastro.iod.izzo`][2] (the latter of
//! which is licensed under MIT). When Izzo's method cannot produce a
//! zero-revolution answer, a Gauss p-iteration with bisection is used
//! instead.
//!
//! [1]: https://arxiv.org/abs/1403.2705
//! [2]: https://github.com/poliastro/poliastro/blob/c7d12e9b715d3fd60f2be233af707d5b97617d39/src/poliastro/iod/izzo.py

use std::f64::consts;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::math::{self, hyp2f1};

/// Householder/Halley tolerance on `x`.
const TOL: f64 = 1e-13;
const MAXITER: u64 = 50;
/// Relative time-of-flight error above which the p-iteration warns.
const P_ITERATION_WARN: f64 = 1e-9;

/// Which of the two multi-revolution solutions to pick.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LambertBranch {
    #[default]
    Left,
    Right,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LambertOptions {
    /// Number of complete revolutions before arrival.
    pub revolutions: u32,
    /// Go clockwise around +Z instead of counterclockwise.
    pub retrograde: bool,
    pub branch: LambertBranch,
}

fn calc_y(x: f64, lambda: f64) -> f64 {
    (1.0 - lambda.powi(2) * (1.0 - x.powi(2))).sqrt()
}

fn calc_psi(x: f64, y: f64, lambda: f64) -> f64 {
    if (-1.0..1.0).contains(&x) {
        // elliptic orbits
        (x * y + lambda * (1.0 - x.powi(2))).clamp(-1.0, 1.0).acos()
    } else if x > 1.0 {
        // hyperbolic orbits
        ((y - x * lambda) * (x.powi(2) - 1.0).sqrt()).asinh()
    } else {
        // parabolic orbits
        0.0
    }
}

fn tof(x: f64, y: f64, t0: f64, lambda: f64, m: u32) -> f64 {
    let t = if m == 0 && (0.6f64.sqrt()..1.4f64.sqrt()).contains(&x) {
        // Battin's series near the parabola
        let eta = y - lambda * x;
        let s1 = 1.0 / 2.0 * (1.0 - lambda - x * eta);
        let q = 4.0 / 3.0 * hyp2f1(s1);
        1.0 / 2.0 * (eta.powi(3) * q + 4.0 * lambda * eta)
    } else {
        1.0 / (1.0 - x.powi(2))
            * ((calc_psi(x, y, lambda) + m as f64 * consts::PI)
                / ((1.0 - x.powi(2)).abs()).sqrt()
                - x
                + lambda * y)
    };

    t - t0
}

fn dtof(x: f64, y: f64, t: f64, lambda: f64) -> f64 {
    (3.0 * t * x - 2.0 + 2.0 * lambda.powi(3) * x / y) / (1.0 - x.powi(2))
}

fn d2tof(x: f64, y: f64, t: f64, dt: f64, lambda: f64) -> f64 {
    (3.0 * t + 5.0 * x * dt + 2.0 * (1.0 - lambda.powi(2)) * lambda.powi(3) / y.powi(3))
        / (1.0 - x.powi(2))
}

fn d3tof(x: f64, y: f64, dt: f64, ddt: f64, lambda: f64) -> f64 {
    (7.0 * x * ddt + 8.0 * dt - 6.0 * (1.0 - lambda.powi(2)) * lambda.powi(5) * x / y.powi(5))
        / (1.0 - x.powi(2))
}

fn calc_tmin(lambda: f64, m: u32) -> Option<f64> {
    if lambda == 1.0 {
        Some(tof(0.0, calc_y(0.0, lambda), 0.0, lambda, m))
    } else if m == 0 {
        Some(0.0)
    } else {
        // set x_i > 0 to avoid FP issues at λ = -1
        let x_i = 0.1;
        let t_i = tof(x_i, calc_y(x_i, lambda), 0.0, lambda, m);
        let x_tmin = halley(x_i, t_i, lambda, m)?;
        Some(tof(x_tmin, calc_y(x_tmin, lambda), 0.0, lambda, m))
    }
}

/// Halley iterations on `dT/dx = 0`, locating the minimum-time
/// solution for `m` revolutions.
fn halley(mut x0: f64, t0: f64, lambda: f64, m: u32) -> Option<f64> {
    for _ in 0..MAXITER {
        let y = calc_y(x0, lambda);
        let f = tof(x0, y, t0, lambda, m);
        let t = f + t0;
        let df = dtof(x0, y, t, lambda);
        let d2f = d2tof(x0, y, t, df, lambda);
        if d2f == 0.0 {
            return None;
        }
        let d3f = d3tof(x0, y, df, d2f, lambda);

        let x = x0 - 2.0 * df * d2f / (2.0 * d2f.powi(2) - df * d3f);

        if (x - x0).abs() < TOL {
            return Some(x);
        }

        x0 = x;
    }

    None
}

fn householder(mut x0: f64, t0: f64, lambda: f64, m: u32) -> Option<f64> {
    for _ in 0..MAXITER {
        let y = calc_y(x0, lambda);
        let f = tof(x0, y, t0, lambda, m);
        let t = f + t0;
        let df = dtof(x0, y, t, lambda);
        let d2f = d2tof(x0, y, t, df, lambda);
        let d3f = d3tof(x0, y, df, d2f, lambda);

        let x = x0
            - f * ((df.powi(2) - f * d2f / 2.0)
                / (df * (df.powi(2) - f * d2f) + d3f * f.powi(2) / 6.0));

        if !x.is_finite() {
            return None;
        }
        if (x - x0).abs() < TOL * x.abs().max(1.0) {
            return Some(x);
        }

        x0 = x;
    }

    None
}

/// Solve for the `(x, y)` pair of the requested revolution count, or
/// `None` if it does not exist.
fn findxy(lambda: f64, t: f64, m: u32, branch: LambertBranch) -> Option<(f64, f64)> {
    if lambda.abs() >= 1.0 || t <= 0.0 {
        return None;
    }
    let pi = consts::PI;
    let mut mmax = (t / pi).floor() as u32;
    let t00 = lambda.acos() + lambda * (1.0 - lambda.powi(2)).sqrt();
    if t < t00 + mmax as f64 * pi && mmax > 0 {
        let tmin = calc_tmin(lambda, mmax)?;
        if t < tmin {
            mmax -= 1;
        }
    }
    if m > mmax {
        trace!("findxy({lambda}, {t}): {m} revolutions exceed the maximum of {mmax}");
        return None;
    }

    let x0 = if m == 0 {
        let t1 = 2.0 / 3.0 * (1.0 - lambda.powi(3));
        if t >= t00 {
            (t00 / t).powf(2.0 / 3.0) - 1.0
        } else if t < t1 {
            5.0 / 2.0 * t1 / t * (t1 - t) / (1.0 - lambda.powi(5)) + 1.0
        } else {
            (2.0f64.ln() * (t / t00).ln() / (t1 / t00).ln()).exp() - 1.0
        }
    } else {
        let mpi = m as f64 * pi;
        let kl = ((mpi + pi) / (8.0 * t)).powf(2.0 / 3.0);
        let x0l = (kl - 1.0) / (kl + 1.0);
        let kr = (8.0 * t / mpi).powf(2.0 / 3.0);
        let x0r = (kr - 1.0) / (kr + 1.0);
        match branch {
            LambertBranch::Left => x0l.max(x0r),
            LambertBranch::Right => x0l.min(x0r),
        }
    };

    let x = householder(x0, t, lambda, m)?;
    Some((x, calc_y(x, lambda)))
}

/// Unit normal of the transfer plane, oriented so that the transfer
/// is counterclockwise around it. `None` for a 0° transfer angle.
fn transfer_normal(ir1: &Vector3<f64>, ir2: &Vector3<f64>, retrograde: bool) -> Option<Vector3<f64>> {
    let h = ir1.cross(ir2);
    let sense = if retrograde { -1.0 } else { 1.0 };
    if h.norm() > 1e-12 {
        let h = h.normalize();
        // prograde transfers go counterclockwise around +Z
        Some(if h.z * sense < 0.0 { -h } else { h })
    } else if ir1.dot(ir2) > 0.0 {
        None
    } else {
        // collinear and opposite: any plane containing r1 works,
        // prefer the one closest to the XY plane
        let z = math::reject(&Vector3::z(), ir1);
        let h = if z.norm() > 1e-9 {
            z.normalize()
        } else {
            math::any_perpendicular(ir1)
        };
        Some(sense * h)
    }
}

fn izzo(
    r1v: &Vector3<f64>,
    r2v: &Vector3<f64>,
    tof: f64,
    mu: f64,
    options: LambertOptions,
) -> Option<(Vector3<f64>, Vector3<f64>)> {
    let r1 = r1v.norm();
    let r2 = r2v.norm();
    let c = (r2v - r1v).norm();
    if c <= 1e-12 * r1.max(r2) || tof <= 0.0 {
        return None;
    }

    let s = 1.0 / 2.0 * (r1 + r2 + c);
    let ir1 = r1v / r1;
    let ir2 = r2v / r2;
    let ih = transfer_normal(&ir1, &ir2, options.retrograde)?;

    let mut lambda = (1.0 - (c / s).min(1.0)).sqrt();
    // transfers longer than half a revolution have λ < 0
    if ir1.cross(&ir2).dot(&ih) < 0.0 {
        lambda = -lambda;
    }
    let it1 = ih.cross(&ir1);
    let it2 = ih.cross(&ir2);

    let t = tof * ((2.0 * mu) / (s.powi(3))).sqrt();
    let (x, y) = findxy(lambda, t, options.revolutions, options.branch)?;

    let gamma = (mu * s / 2.0).sqrt();
    let rho = (r1 - r2) / c;
    let sigma = (1.0 - rho.powi(2)).max(0.0).sqrt();
    let vr1 = gamma * ((lambda * y - x) - rho * (lambda * y + x)) / r1;
    let vr2 = -gamma * ((lambda * y - x) + rho * (lambda * y + x)) / r2;
    let vt1 = gamma * sigma * (y + lambda * x) / r1;
    let vt2 = gamma * sigma * (y + lambda * x) / r2;
    let v1 = vr1 * ir1 + vt1 * it1;
    let v2 = vr2 * ir2 + vt2 * it2;
    (v1.iter().chain(v2.iter()).all(|v| v.is_finite())).then_some((v1, v2))
}

/// Lambert's problem.
///
/// Given position vectors `r1v` and `r2v`, time-of-flight `tof`, and
/// gravitational parameter `mu`, calculate the velocity vectors `v1`
/// and `v2` of the conic joining them.
///
/// Note that this function is unit-agnostic, however the distance
/// units of the position vectors `r1`, `r2` and the time unit of the
/// time-of-flight `tof` must match with the respective distance and
/// time units of the gravitational parameter `mu`.
///
/// Returns `None` when no such conic exists (or could not be found),
/// e.g. more revolutions than fit in `tof`, a zero chord or a
/// non-positive time of flight.
pub fn solve(
    r1v: &Vector3<f64>,
    r2v: &Vector3<f64>,
    tof: f64,
    mu: f64,
    options: LambertOptions,
) -> Option<(Vector3<f64>, Vector3<f64>)> {
    if let Some(solution) = izzo(r1v, r2v, tof, mu, options) {
        return Some(solution);
    }
    if options.revolutions > 0 {
        return None;
    }
    trace!("lambert::solve: falling back to p-iteration");
    solve_p_iteration(r1v, r2v, tof, mu, options.retrograde)
}

/// Gauss-style p-iteration for zero-revolution transfers, bisecting the
/// semi-latus rectum between the parabolic bounds.
pub fn solve_p_iteration(
    r1v: &Vector3<f64>,
    r2v: &Vector3<f64>,
    tof: f64,
    mu: f64,
    retrograde: bool,
) -> Option<(Vector3<f64>, Vector3<f64>)> {
    if tof <= 0.0 {
        return None;
    }
    let r1 = r1v.norm();
    let r2 = r2v.norm();
    let ih = transfer_normal(&(r1v / r1), &(r2v / r2), retrograde)?;

    let cos_dnu = (r1v.dot(r2v) / (r1 * r2)).clamp(-1.0, 1.0);
    let dnu = math::wrap_angle(math::signed_angle(r1v, r2v, &ih));
    let sin_dnu = libm::sin(dnu);
    if sin_dnu.abs() < 1e-12 {
        return None;
    }

    let k = r1 * r2 * (1.0 - cos_dnu);
    let l = r1 + r2;
    let m = r1 * r2 * (1.0 + cos_dnu);
    let p_i = k / (l + (2.0 * m).sqrt());
    let p_ii = k / (l - (2.0 * m).sqrt());

    let time_of_flight = |p: f64| -> f64 {
        let a = m * k * p / ((2.0 * m - l.powi(2)) * p.powi(2) + 2.0 * k * l * p - k.powi(2));
        let f = 1.0 - r2 / p * (1.0 - cos_dnu);
        let g = r1 * r2 * sin_dnu / (mu * p).sqrt();
        if a > 0.0 {
            let fdot = (mu / p).sqrt()
                * libm::tan(dnu / 2.0)
                * ((1.0 - cos_dnu) / p - 1.0 / r1 - 1.0 / r2);
            let cos_de = 1.0 - r1 / a * (1.0 - f);
            let sin_de = -r1 * r2 * fdot / (mu * a).sqrt();
            let de = math::wrap_angle(libm::atan2(sin_de, cos_de));
            g + (a.powi(3) / mu).sqrt() * (de - libm::sin(de))
        } else {
            let df = libm::acosh((1.0 + (f - 1.0) * r1 / a).max(1.0));
            g + ((-a).powi(3) / mu).sqrt() * (libm::sinh(df) - df)
        }
    };

    // valid semi-latus recta: (p_i, ∞) below half a revolution, (0, p_ii)
    // above; the time of flight is monotonic on either
    let (mut lo, mut hi) = if dnu < consts::PI {
        (p_i * (1.0 + 1e-9), 2.0 * p_ii)
    } else {
        (0.5 * p_i, p_ii * (1.0 - 1e-9))
    };
    for _ in 0..200 {
        let outside = if dnu < consts::PI {
            time_of_flight(hi) > tof
        } else {
            time_of_flight(lo) > tof
        };
        if !outside {
            break;
        }
        if dnu < consts::PI {
            hi *= 2.0;
        } else {
            lo *= 0.5;
        }
    }

    let g_lo = time_of_flight(lo) - tof;
    let g_hi = time_of_flight(hi) - tof;
    if !(g_lo * g_hi <= 0.0) {
        return None;
    }
    for _ in 0..200 {
        let mid = (lo * hi).sqrt();
        let g_mid = time_of_flight(mid) - tof;
        if g_mid == 0.0 {
            lo = mid;
            hi = mid;
            break;
        }
        if (g_mid > 0.0) == (g_lo > 0.0) {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi / lo - 1.0 < 1e-15 {
            break;
        }
    }
    let p = (lo * hi).sqrt();
    let rel_err = ((time_of_flight(p) - tof) / tof).abs();
    if rel_err > P_ITERATION_WARN {
        warn!("lambert::solve_p_iteration: poor convergence, relative time error {rel_err:e}");
    }

    let f = 1.0 - r2 / p * (1.0 - cos_dnu);
    let g = r1 * r2 * sin_dnu / (mu * p).sqrt();
    let gdot = 1.0 - r1 / p * (1.0 - cos_dnu);
    let v1 = (r2v - f * r1v) / g;
    let v2 = (gdot * r2v - r1v) / g;
    (v1.iter().chain(v2.iter()).all(|v| v.is_finite())).then_some((v1, v2))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::{
        bodies::BodyId,
        kepler::orbits::{Orbit, OrbitalState},
        time::UT,
    };

    fn propagate(r: Vector3<f64>, v: Vector3<f64>, dt: f64, mu: f64) -> Vector3<f64> {
        let orbit = Orbit::from_state(
            &OrbitalState {
                orbiting: BodyId(0),
                date: UT::ZERO,
                position: r,
                velocity: v,
            },
            mu,
        );
        orbit.state_at_date(UT::new_seconds(dt)).position
    }

    #[test]
    fn it_works() {
        let r0 = Vector3::new(15945.34, 0.0, 0.0);
        let r = Vector3::new(12214.83399, 10249.46731, 0.0);
        let tof = 76.0 * 60.0 /* min */;
        let mu = 3.986004418e5;

        let expected_v1 = Vector3::new(2.058912566174178, 2.9159645911539527, 0.0);
        let expected_v2 = Vector3::new(-3.4515665032801133, 0.9103135416619974, 0.0);

        let (v1, v2) = solve(&r0, &r, tof, mu, LambertOptions::default()).unwrap();

        assert_relative_eq!(v1, expected_v1, max_relative = 1e-9, epsilon = 1e-12);
        assert_relative_eq!(v2, expected_v2, max_relative = 1e-9, epsilon = 1e-12);

        let (pv1, pv2) = solve_p_iteration(&r0, &r, tof, mu, false).unwrap();
        assert_relative_eq!(pv1, expected_v1, max_relative = 1e-7, epsilon = 1e-10);
        assert_relative_eq!(pv2, expected_v2, max_relative = 1e-7, epsilon = 1e-10);
    }

    #[test]
    fn round_trips() {
        let mu = 1.1723328e18;
        let r1 = Vector3::new(1.36e10, 0.0, 0.0);
        let r2 = Vector3::new(-1.5e10, 1.2e10, 4e8);
        // elliptic, hyperbolic, slow elliptic
        for tof in [2.0e7, 1.5e6, 4.0e7] {
            let (v1, _) = solve(&r1, &r2, tof, mu, LambertOptions::default()).unwrap();
            let reached = propagate(r1, v1, tof, mu);
            assert_relative_eq!(reached, r2, max_relative = 1e-6);
        }

        let retro = LambertOptions {
            retrograde: true,
            ..Default::default()
        };
        let (v1, _) = solve(&r1, &r2, 2.0e7, mu, retro).unwrap();
        assert!(r1.cross(&v1).z < 0.0);
        assert_relative_eq!(propagate(r1, v1, 2.0e7, mu), r2, max_relative = 1e-6);
    }

    #[test]
    fn multi_revolution() {
        let mu = 3.5316e12;
        let r1 = Vector3::new(700_000.0, 0.0, 0.0);
        let r2 = Vector3::new(0.0, 900_000.0, 0.0);
        let tof = 20_000.0;
        for branch in [LambertBranch::Left, LambertBranch::Right] {
            let options = LambertOptions {
                revolutions: 1,
                retrograde: false,
                branch,
            };
            let (v1, _) = solve(&r1, &r2, tof, mu, options).unwrap();
            assert_relative_eq!(propagate(r1, v1, tof, mu), r2, max_relative = 1e-6, epsilon = 1e-3);
        }
        let left = solve(&r1, &r2, tof, mu, LambertOptions { revolutions: 1, ..Default::default() });
        let right = solve(
            &r1,
            &r2,
            tof,
            mu,
            LambertOptions {
                revolutions: 1,
                branch: LambertBranch::Right,
                ..Default::default()
            },
        );
        assert_ne!(left, right);

        // not enough time for twenty revolutions
        let options = LambertOptions {
            revolutions: 20,
            ..Default::default()
        };
        assert!(solve(&r1, &r2, tof, mu, options).is_none());
    }

    #[test]
    fn degenerate() {
        let mu = 3.5316e12;
        let r1 = Vector3::new(700_000.0, 0.0, 0.0);
        assert!(solve(&r1, &r1, 1000.0, mu, LambertOptions::default()).is_none());
        assert!(solve(&r1, &(2.0 * r1), -5.0, mu, LambertOptions::default()).is_none());

        // opposite positions transfer in the XY plane
        let r2 = Vector3::new(-800_000.0, 0.0, 0.0);
        let (v1, _) = solve(&r1, &r2, 3000.0, mu, LambertOptions::default()).unwrap();
        assert!(r1.cross(&v1).z > 0.0);
        assert_relative_eq!(propagate(r1, v1, 3000.0, mu), r2, max_relative = 1e-6, epsilon = 1.0);
    }
}
