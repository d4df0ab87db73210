use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::kepler::orbits::OrbitalState;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManeuverKind {
    /// Burn from a parking orbit onto an escape trajectory.
    Ejection,
    /// Burn at the low periapsis of an Oberth ejection or insertion.
    Oberth,
    /// Burn from an arrival trajectory into the target orbit.
    Insertion,
    /// Periapsis burn of a powered gravity assist.
    Flyby,
    /// Mid-course plane change.
    PlaneChange,
    /// Departure burn when no SOI change is involved.
    Departure,
    /// Arrival burn when no SOI change is involved.
    Arrival,
}

/// An impulsive velocity change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Maneuver {
    pub pre: OrbitalState,
    pub post: OrbitalState,
    pub deltav: Vector3<f64>,
    pub deltav_mag: f64,
    pub kind: ManeuverKind,
    /// Human readable description, filled in by the mission
    /// calculators.
    pub context: String,
}

impl Maneuver {
    /// A maneuver changing the velocity of `pre` to `post_velocity`.
    pub fn new(pre: OrbitalState, post_velocity: Vector3<f64>, kind: ManeuverKind) -> Self {
        let deltav = post_velocity - pre.velocity;
        Self {
            pre,
            post: pre.with_velocity(post_velocity),
            deltav,
            deltav_mag: deltav.norm(),
            kind,
            context: String::new(),
        }
    }

    #[must_use]
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            ..self
        }
    }

    /// The same maneuver `dt` seconds later.
    #[must_use]
    pub fn shifted(mut self, dt: f64) -> Self {
        self.pre.date += dt;
        self.post.date += dt;
        self
    }

    /// Delta-V split into prograde, normal and radial-out components.
    pub fn deltav_frenet(&self) -> Vector3<f64> {
        frenet(&self.pre).transpose() * self.deltav
    }
}

/// Returns the Frenet frame to IJK conversion matrix for the given
/// state vector.
pub fn frenet(sv: &OrbitalState) -> Matrix3<f64> {
    let t = sv.velocity.normalize();
    let n = sv.position.cross(&sv.velocity).normalize();
    let b = t.cross(&n);
    Matrix3::from_columns(&[t, n, b])
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::{bodies::BodyId, time::UT};

    #[test]
    fn prograde_burn() {
        let pre = OrbitalState {
            orbiting: BodyId(1),
            date: UT::new_seconds(10.0),
            position: Vector3::new(700_000.0, 0.0, 0.0),
            velocity: Vector3::new(0.0, 2000.0, 0.0),
        };
        let m = Maneuver::new(pre, Vector3::new(0.0, 2500.0, 10.0), ManeuverKind::Ejection);
        assert_eq!(m.post.velocity - m.pre.velocity, m.deltav);
        assert_eq!(m.post.position, m.pre.position);
        assert_abs_diff_eq!(m.deltav_frenet(), Vector3::new(500.0, 10.0, 0.0), epsilon = 1e-9);
        assert_eq!(m.shifted(5.0).post.date, UT::new_seconds(15.0));
    }
}
