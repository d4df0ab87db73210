//! Math utilities.
//!
//! Angle helpers, vector rotations and the scalar/simplex solvers shared
//! by the orbit model and the optimizers. Brent's method and Nelder-Mead
//! run on [`argmin`]; the solvers never fail on non-convergence, they log
//! and hand back their best estimate.
use std::f64::consts;

use argmin::{
    core::{CostFunction, Executor},
    solver::{
        brent::{BrentOpt, BrentRoot},
        neldermead::NelderMead,
    },
};
use color_eyre::eyre::{self, bail};
use nalgebra::{Rotation3, Unit, Vector3};
use tracing::{trace, warn};

/// Cost substituted for non-finite objective values so that the
/// comparison-based solvers keep a total order.
pub const NON_FINITE_COST: f64 = 1e30;

/// Residual above which a Brent root is reported as suspicious.
pub const BRENT_ROOT_WARN: f64 = 1.0;

/// The hypergeometric function `₂F₁(3, 1, 5/2, x)`.
pub fn hyp2f1(x: f64) -> f64 {
    if x >= 1.0 {
        f64::INFINITY
    } else {
        let mut res = 1.0;
        let mut term = 1.0;
        let mut i = 0;
        loop {
            let ii = i as f64;
            term = term * (3.0 + ii) * (1.0 + ii) / (5.0 / 2.0 + ii) * x / (ii + 1.0);
            let res_old = res;
            res += term;
            if res_old == res || i > 10_000 {
                return res;
            }
            i += 1;
        }
    }
}

/// Wrap an angle into `[0, 2π)`.
pub fn wrap_angle(x: f64) -> f64 {
    let w = x.rem_euclid(consts::TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs
    if w >= consts::TAU {
        0.0
    } else {
        w
    }
}

/// Wrap an angle into `(-π, π]`.
pub fn wrap_pi(x: f64) -> f64 {
    let w = wrap_angle(x);
    if w > consts::PI {
        w - consts::TAU
    } else {
        w
    }
}

/// Angle from `a` to `b`, positive counterclockwise around `normal`.
pub fn signed_angle(a: &Vector3<f64>, b: &Vector3<f64>, normal: &Vector3<f64>) -> f64 {
    let n = normal.normalize();
    libm::atan2(n.dot(&a.cross(b)), a.dot(b))
}

/// Unsigned angle between two vectors, in `[0, π]`.
pub fn angle_between(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    libm::atan2(a.cross(b).norm(), a.dot(b))
}

/// Rodrigues rotation of `v` by `angle` around `axis`.
pub fn rotate_about(v: &Vector3<f64>, axis: &Vector3<f64>, angle: f64) -> Vector3<f64> {
    Rotation3::from_axis_angle(&Unit::new_normalize(*axis), angle) * v
}

/// Some unit vector perpendicular to `v`.
pub fn any_perpendicular(v: &Vector3<f64>) -> Vector3<f64> {
    let helper = if v.x.abs() < 0.9 * v.norm() {
        Vector3::x()
    } else {
        Vector3::y()
    };
    v.cross(&helper).normalize()
}

/// Component of `v` perpendicular to the unit vector `n`.
pub fn reject(v: &Vector3<f64>, n: &Vector3<f64>) -> Vector3<f64> {
    v - v.dot(n) * n
}

/// Point on a sphere of radius `r` from a polar angle (from +Z) and an
/// azimuth (from +X towards +Y).
pub fn spherical_to_cartesian(r: f64, polar: f64, azimuth: f64) -> Vector3<f64> {
    let (sp, cp) = libm::sincos(polar);
    let (sa, ca) = libm::sincos(azimuth);
    r * Vector3::new(sp * ca, sp * sa, cp)
}

/// Inverse of [`spherical_to_cartesian`], returning `(r, polar, azimuth)`
/// with the azimuth in `[0, 2π)`.
pub fn cartesian_to_spherical(v: &Vector3<f64>) -> (f64, f64, f64) {
    let r = v.norm();
    if r == 0.0 {
        return (0.0, 0.0, 0.0);
    }
    let polar = libm::acos((v.z / r).clamp(-1.0, 1.0));
    let azimuth = wrap_angle(libm::atan2(v.y, v.x));
    (r, polar, azimuth)
}

/// Newton's method on `f` starting at `x0`.
///
/// Returns the last iterate if `maxiter` is reached, after logging a
/// warning. Callers must tolerate slightly-off results.
pub fn newton(
    f: impl Fn(f64) -> f64,
    df: impl Fn(f64) -> f64,
    x0: f64,
    tol: f64,
    maxiter: u64,
) -> f64 {
    let mut x = x0;
    for _ in 0..maxiter {
        let step = f(x) / df(x);
        if !step.is_finite() {
            warn!("newton({x0}): non-finite step at x = {x}");
            return x;
        }
        x -= step;
        if step.abs() < tol * x.abs().max(1.0) {
            return x;
        }
    }
    warn!(
        "newton({x0}, {tol}, {maxiter}): failed to converge, residual {}",
        f(x)
    );
    x
}

struct ScalarCost<F>(F);

impl<F: Fn(f64) -> f64> CostFunction for ScalarCost<F> {
    type Param = f64;

    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let c = (self.0)(*param);
        Ok(if c.is_finite() { c } else { NON_FINITE_COST })
    }
}

struct SimplexCost<F>(F);

impl<F: Fn(&[f64]) -> f64> CostFunction for SimplexCost<F> {
    type Param = Vec<f64>;

    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let c = (self.0)(param);
        Ok(if c.is_finite() { c } else { NON_FINITE_COST })
    }
}

/// Brent's method minimization of `f` on `[a, b]`.
///
/// Returns `(x, f(x))`.
pub fn brent_minimize(f: impl Fn(f64) -> f64, a: f64, b: f64, tol: f64, maxiter: u64) -> (f64, f64) {
    let (lo, hi) = (a.min(b), a.max(b));
    if hi - lo <= tol {
        let x = 0.5 * (lo + hi);
        return (x, f(x));
    }
    let solver = BrentOpt::new(lo, hi).set_tolerance(1e-10, tol);
    let x = match Executor::new(ScalarCost(&f), solver)
        .configure(|state| state.max_iters(maxiter))
        .run()
    {
        Ok(res) => res.state.best_param.unwrap_or(0.5 * (lo + hi)),
        Err(err) => {
            warn!("brent_minimize([{lo}, {hi}]): {err}");
            0.5 * (lo + hi)
        }
    };
    let fx = f(x);
    // Brent never evaluates the bounds themselves
    let (flo, fhi) = (f(lo), f(hi));
    if flo < fx && flo <= fhi {
        (lo, flo)
    } else if fhi < fx {
        (hi, fhi)
    } else {
        (x, fx)
    }
}

/// Brent's method root of `f` on `[a, b]`.
///
/// `f(a)` and `f(b)` must bracket a root; an unbracketed interval is a
/// caller error. A converged root whose residual still exceeds
/// [`BRENT_ROOT_WARN`] is only logged.
pub fn brent_root(
    f: impl Fn(f64) -> f64,
    a: f64,
    b: f64,
    tol: f64,
    maxiter: u64,
) -> eyre::Result<f64> {
    let (fa, fb) = (f(a), f(b));
    if fa == 0.0 {
        return Ok(a);
    }
    if fb == 0.0 {
        return Ok(b);
    }
    if !(fa * fb < 0.0) {
        bail!("brent_root([{a}, {b}]): root is not bracketed (f(a) = {fa}, f(b) = {fb})");
    }
    let solver = BrentRoot::new(a.min(b), a.max(b), tol);
    let res = Executor::new(ScalarCost(&f), solver)
        .configure(|state| state.max_iters(maxiter))
        .run()
        .map_err(|err| eyre::eyre!("brent_root([{a}, {b}]): {err}"))?;
    let x = res
        .state
        .best_param
        .ok_or_else(|| eyre::eyre!("brent_root([{a}, {b}]): no iterate"))?;
    let residual = f(x);
    if residual.abs() > BRENT_ROOT_WARN {
        warn!("brent_root([{a}, {b}]): poor convergence, f({x}) = {residual}");
    }
    Ok(x)
}

/// Nelder-Mead settings.
#[derive(Copy, Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NelderMeadSettings {
    /// Standard deviation of the simplex costs below which the search
    /// stops.
    pub sd_tolerance: f64,
    pub max_iters: u64,
}

impl Default for NelderMeadSettings {
    fn default() -> Self {
        Self {
            sd_tolerance: 1e-9,
            max_iters: 1000,
        }
    }
}

/// Nelder-Mead minimization of `f` from the given initial simplex
/// (`dim + 1` vertices).
///
/// Returns the best vertex found and its cost. The cost of the initial
/// best vertex is never beaten by the return value.
pub fn nelder_mead(
    f: impl Fn(&[f64]) -> f64,
    simplex: Vec<Vec<f64>>,
    settings: NelderMeadSettings,
) -> (Vec<f64>, f64) {
    let (start, start_cost) = simplex
        .iter()
        .map(|v| (v.clone(), f(v)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or_default();

    let solver = match NelderMead::new(simplex).with_sd_tolerance(settings.sd_tolerance) {
        Ok(solver) => solver,
        Err(err) => {
            warn!("nelder_mead: {err}");
            return (start, start_cost);
        }
    };

    let res = Executor::new(SimplexCost(&f), solver)
        .configure(|state| state.max_iters(settings.max_iters))
        .run();
    match res {
        Ok(res) => {
            trace!("{res}");
            let best_cost = res.state.best_cost;
            match res.state.best_param {
                Some(best) if best_cost < start_cost || !start_cost.is_finite() => {
                    let cost = f(&best);
                    (best, cost)
                }
                _ => (start, start_cost),
            }
        }
        Err(err) => {
            warn!("nelder_mead: {err}");
            (start, start_cost)
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn angle_wrapping() {
        assert_abs_diff_eq!(wrap_angle(-consts::FRAC_PI_2), 1.5 * consts::PI, epsilon = 1e-15);
        assert_abs_diff_eq!(wrap_angle(5.0 * consts::PI), consts::PI, epsilon = 1e-12);
        assert_abs_diff_eq!(wrap_pi(1.5 * consts::PI), -consts::FRAC_PI_2, epsilon = 1e-15);
        assert!(wrap_angle(-1e-18) < consts::TAU);
    }

    #[test]
    fn rodrigues() {
        let v = rotate_about(&Vector3::x(), &Vector3::z(), consts::FRAC_PI_2);
        assert_abs_diff_eq!(v, Vector3::y(), epsilon = 1e-15);
        let a = signed_angle(&Vector3::x(), &Vector3::new(0.0, -1.0, 0.0), &Vector3::z());
        assert_abs_diff_eq!(a, -consts::FRAC_PI_2, epsilon = 1e-15);
    }

    #[test]
    fn spherical_round_trip() {
        let v = Vector3::new(3.0, -4.0, 12.0);
        let (r, polar, azimuth) = cartesian_to_spherical(&v);
        assert_abs_diff_eq!(r, 13.0, epsilon = 1e-12);
        assert_abs_diff_eq!(spherical_to_cartesian(r, polar, azimuth), v, epsilon = 1e-12);
    }

    #[test]
    fn scalar_solvers() {
        let x = newton(|x| x * x - 2.0, |x| 2.0 * x, 1.0, 1e-14, 50);
        assert_abs_diff_eq!(x, consts::SQRT_2, epsilon = 1e-12);

        let (xmin, fmin) = brent_minimize(|x| (x - 1.3).powi(2) + 0.5, -4.0, 4.0, 1e-10, 200);
        assert_abs_diff_eq!(xmin, 1.3, epsilon = 1e-6);
        assert_abs_diff_eq!(fmin, 0.5, epsilon = 1e-10);

        let root = brent_root(|x| x.cos() - x, 0.0, 1.0, 1e-12, 200).unwrap();
        assert_abs_diff_eq!(root, 0.739_085_133_215_160_6, epsilon = 1e-9);

        assert!(brent_root(|x| x * x + 1.0, -1.0, 1.0, 1e-12, 200).is_err());
    }

    #[test]
    fn brent_picks_boundary_minimum() {
        let (x, _) = brent_minimize(|x| x, 2.0, 5.0, 1e-9, 100);
        assert_abs_diff_eq!(x, 2.0, epsilon = 1e-6);
    }

    #[test]
    fn simplex() {
        let rosenbrock = |p: &[f64]| (1.0 - p[0]).powi(2) + 100.0 * (p[1] - p[0].powi(2)).powi(2);
        let simplex = vec![vec![-1.0, 1.0], vec![-0.5, 1.0], vec![-1.0, 1.5]];
        let (best, cost) = nelder_mead(
            rosenbrock,
            simplex,
            NelderMeadSettings {
                sd_tolerance: 1e-14,
                max_iters: 5000,
            },
        );
        assert!(cost < 1e-6, "cost = {cost}");
        assert_abs_diff_eq!(best[0], 1.0, epsilon = 1e-2);
        assert_abs_diff_eq!(best[1], 1.0, epsilon = 1e-2);
    }
}
