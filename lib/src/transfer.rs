//! Single transfers between two orbits, with SOI patch refinement.

use std::sync::Arc;

use color_eyre::eyre::{self, bail};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    bodies::{BodyId, SolarSystem},
    departarrive::EjectionInsertionType,
    kepler::orbits::Orbit,
    maneuver::{Maneuver, ManeuverKind},
    math::{self, NelderMeadSettings},
    time::UT,
    trajectory::{self, PatchChain, PatchSettings, SoiPatches, Trajectory},
};

/// Weight of the patch time error (per second) against the position
/// error (per meter).
pub const TIME_ERROR_WEIGHT: f64 = 10.0;
/// Weight of delta-v (per m/s) against the position error (per meter).
pub const DELTA_V_WEIGHT: f64 = 5000.0;

/// Simplex step of the patch angles (rad).
const ANGLE_STEP: f64 = 0.05;
/// Unit of the start date and flight time during patch refinement (s).
const TIME_UNIT: f64 = 3600.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub ejection_insertion_type: EjectionInsertionType,
    /// Fly the transfer in the departure body's orbital plane and fix
    /// the inclination with a mid-course burn.
    pub plane_change: bool,
    /// Keep the start orbit's phase.
    pub match_start_mo: bool,
    /// Keep the end orbit's phase.
    pub match_end_mo: bool,
    /// Leave out the final insertion burn (aerocapture, flyby).
    pub no_insertion_burn: bool,
    /// Fixed-point passes seeding the SOI patches.
    pub naive_iterations: usize,
    pub nelder_mead: NelderMeadSettings,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            ejection_insertion_type: EjectionInsertionType::default(),
            plane_change: false,
            match_start_mo: false,
            match_end_mo: false,
            no_insertion_burn: false,
            naive_iterations: 10,
            nelder_mead: NelderMeadSettings::default(),
        }
    }
}

impl TransferSettings {
    pub(crate) fn ejection(&self) -> PatchSettings {
        PatchSettings {
            kind: self.ejection_insertion_type,
            match_mo: self.match_start_mo,
        }
    }

    pub(crate) fn insertion(&self) -> PatchSettings {
        PatchSettings {
            kind: self.ejection_insertion_type,
            match_mo: self.match_end_mo,
        }
    }
}

/// `position + 10 time + 5000 cost`, the figure patch refinement
/// minimizes.
pub fn patch_cost(position_error: f64, time_error: f64, cost: f64) -> f64 {
    position_error + TIME_ERROR_WEIGHT * time_error + DELTA_V_WEIGHT * cost
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub system: Arc<SolarSystem>,
    pub start_orbit: Orbit,
    pub end_orbit: Orbit,
    pub transfer_body: BodyId,
    /// Date the transfer arc begins.
    pub start_date: UT,
    pub flight_time: f64,
    pub soi_patches: SoiPatches,
    /// In flight order, empty when infeasible.
    pub ejections: Vec<Trajectory>,
    pub transfer: Trajectory,
    pub insertions: Vec<Trajectory>,
    pub maneuvers: Vec<Maneuver>,
    /// NaN when no trajectory exists for these dates.
    pub delta_v: f64,
    pub patch_position_error: f64,
    pub patch_time_error: f64,
    /// SOI crossings actually flown, relative to each level's body.
    pub ejection_crossings: Vec<Vector3<f64>>,
    pub insertion_crossings: Vec<Vector3<f64>>,
    /// Parking orbits as flown.
    pub start_parking: Orbit,
    pub end_parking: Orbit,
}

impl Transfer {
    pub fn is_feasible(&self) -> bool {
        self.delta_v.is_finite()
    }

    pub fn arrival_date(&self) -> UT {
        self.start_date + self.flight_time
    }

    pub fn patch_cost(&self) -> f64 {
        patch_cost(self.patch_position_error, self.patch_time_error, self.delta_v)
    }

    /// Every arc in flight order.
    pub fn trajectories(&self) -> impl Iterator<Item = &Trajectory> {
        self.ejections
            .iter()
            .chain(std::iter::once(&self.transfer))
            .chain(&self.insertions)
    }
}

/// Computes transfers between two fixed orbits.
#[derive(Clone, Debug)]
pub struct TransferCalculator {
    system: Arc<SolarSystem>,
    start: Orbit,
    end: Orbit,
    transfer_body: BodyId,
    start_chain: Vec<BodyId>,
    end_chain: Vec<BodyId>,
    settings: TransferSettings,
}

impl TransferCalculator {
    pub fn new(
        system: Arc<SolarSystem>,
        start: Orbit,
        end: Orbit,
        settings: TransferSettings,
    ) -> eyre::Result<Self> {
        for orbit in [&start, &end] {
            let body = system.body(orbit.orbiting)?;
            if orbit.is_hyperbolic() {
                bail!("orbit around {} is not closed", body.name);
            }
        }
        let transfer_body = system.common_ancestor(start.orbiting, end.orbiting)?;
        let start_chain = system.chain_below(start.orbiting, transfer_body)?;
        let end_chain = system.chain_below(end.orbiting, transfer_body)?;
        debug!(
            "transfer around {}: {} ejection level(s), {} insertion level(s)",
            system.body(transfer_body)?.name,
            start_chain.len(),
            end_chain.len()
        );
        Ok(Self {
            system,
            start,
            end,
            transfer_body,
            start_chain,
            end_chain,
            settings,
        })
    }

    pub fn system(&self) -> &Arc<SolarSystem> {
        &self.system
    }

    pub fn transfer_body(&self) -> BodyId {
        self.transfer_body
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    fn infeasible(&self, start_date: UT, flight_time: f64, patches: &SoiPatches) -> Transfer {
        Transfer {
            system: self.system.clone(),
            start_orbit: self.start,
            end_orbit: self.end,
            transfer_body: self.transfer_body,
            start_date,
            flight_time,
            soi_patches: patches.clone(),
            ejections: vec![],
            transfer: Trajectory::default(),
            insertions: vec![],
            maneuvers: vec![],
            delta_v: f64::NAN,
            patch_position_error: f64::NAN,
            patch_time_error: f64::NAN,
            ejection_crossings: vec![],
            insertion_crossings: vec![],
            start_parking: self.start,
            end_parking: self.end,
        }
    }

    /// The transfer leaving at `start_date` (the outermost SOI exit) and
    /// arriving `flight_time` seconds later, aiming at the given patch
    /// points.
    pub fn compute(
        &self,
        start_date: UT,
        flight_time: f64,
        patches: &SoiPatches,
    ) -> eyre::Result<Transfer> {
        if !(flight_time > 0.0) || !start_date.is_finite() {
            return Ok(self.infeasible(start_date, flight_time, patches));
        }
        let system = &*self.system;
        let t_body = system.body(self.transfer_body)?;
        let arrival_date = start_date + flight_time;

        let departure = trajectory::anchor_state(system, &self.start, self.transfer_body, start_date)?;
        let arrival = trajectory::anchor_state(system, &self.end, self.transfer_body, arrival_date)?;
        let r1 = departure.position + trajectory::patch_at(&patches.ejection, 0);
        let r2 = arrival.position + trajectory::patch_at(&patches.insertion, 0);

        let plane = if self.settings.plane_change {
            let orbit = match self.start_chain.last() {
                Some(&top) => *system.orbit_of(top)?,
                None => self.start,
            };
            Some(orbit.normal())
        } else {
            None
        };
        let Some(leg) = trajectory::lambert_leg(
            self.transfer_body,
            t_body.mu,
            &r1,
            &r2,
            start_date,
            flight_time,
            plane.as_ref(),
        ) else {
            trace!("no Lambert solution at {start_date:?} + {flight_time:.0} s");
            return Ok(self.infeasible(start_date, flight_time, patches));
        };

        let Some(ejection) = trajectory::departure_chain(
            system,
            &self.start,
            self.transfer_body,
            &departure,
            &leg.departure_velocity,
            start_date,
            &patches.ejection,
            self.settings.ejection(),
        )?
        else {
            return Ok(self.infeasible(start_date, flight_time, patches));
        };
        let Some(insertion) = trajectory::arrival_chain(
            system,
            &self.end,
            self.transfer_body,
            &arrival,
            &leg.arrival_velocity,
            arrival_date,
            &patches.insertion,
            self.settings.insertion(),
            self.settings.no_insertion_burn,
        )?
        else {
            return Ok(self.infeasible(start_date, flight_time, patches));
        };

        let mut transfer = leg.trajectory;
        for m in &mut transfer.maneuvers {
            if m.kind == ManeuverKind::PlaneChange {
                m.context = format!("Plane change around {}", t_body.name);
            }
        }
        Ok(self.assemble(start_date, flight_time, patches, ejection, transfer, insertion))
    }

    fn assemble(
        &self,
        start_date: UT,
        flight_time: f64,
        patches: &SoiPatches,
        ejection: PatchChain,
        transfer: Trajectory,
        insertion: PatchChain,
    ) -> Transfer {
        let maneuvers = ejection
            .maneuvers()
            .chain(&transfer.maneuvers)
            .chain(insertion.maneuvers())
            .cloned()
            .collect::<Vec<_>>();
        let delta_v = maneuvers.iter().map(|m| m.deltav_mag).sum();
        Transfer {
            system: self.system.clone(),
            start_orbit: self.start,
            end_orbit: self.end,
            transfer_body: self.transfer_body,
            start_date,
            flight_time,
            soi_patches: patches.clone(),
            ejections: ejection.trajectories,
            transfer,
            insertions: insertion.trajectories,
            maneuvers,
            delta_v,
            patch_position_error: ejection.position_error + insertion.position_error,
            patch_time_error: ejection.time_error + insertion.time_error,
            ejection_crossings: ejection.crossings,
            insertion_crossings: insertion.crossings,
            start_parking: ejection.parking,
            end_parking: insertion.parking,
        }
    }

    /// Delta-v of the unpatched transfer, NaN if there is none.
    pub fn delta_v(&self, start_date: UT, flight_time: f64) -> f64 {
        match self.compute(start_date, flight_time, &SoiPatches::default()) {
            Ok(transfer) => transfer.delta_v,
            Err(err) => {
                debug!("transfer at {start_date:?} + {flight_time:.0} s failed: {err}");
                f64::NAN
            }
        }
    }

    fn soi_radii(&self, chain: &[BodyId]) -> eyre::Result<Vec<f64>> {
        chain
            .iter()
            .rev()
            .map(|&id| Ok(self.system.body(id)?.soi_radius()))
            .collect()
    }

    /// Move the SOI patch points onto the crossings actually flown.
    ///
    /// Keeps the best of `naive_iterations` fixed-point passes.
    pub fn naive_soi_patches(&self, transfer: &Transfer) -> eyre::Result<Transfer> {
        let mut best = transfer.clone();
        let mut current = transfer.clone();
        for i in 0..self.settings.naive_iterations {
            if !current.is_feasible() {
                break;
            }
            let patches = SoiPatches {
                ejection: current.ejection_crossings.clone(),
                insertion: current.insertion_crossings.clone(),
            };
            current = self.compute(current.start_date, current.flight_time, &patches)?;
            trace!("naive patch pass {i}: cost {:.3e}", current.patch_cost());
            if better(current.patch_cost(), best.patch_cost()) {
                best = current.clone();
            }
        }
        Ok(best)
    }

    /// Refine the SOI patch points of `transfer`, first by fixed-point
    /// passes and then with Nelder-Mead over the patch directions (and
    /// the dates, when a chain crosses more than one SOI).
    ///
    /// Never returns a transfer with a higher patch cost than `transfer`.
    pub fn optimize_soi_patches(&self, transfer: &Transfer) -> eyre::Result<Transfer> {
        let seeded = self.naive_soi_patches(transfer)?;
        if !seeded.is_feasible() || (self.start_chain.is_empty() && self.end_chain.is_empty()) {
            return Ok(seeded);
        }

        let eject_radii = self.soi_radii(&self.start_chain)?;
        let insert_radii = self.soi_radii(&self.end_chain)?;
        let with_dates = self.start_chain.len() > 1 || self.end_chain.len() > 1;

        let mut x0 = Vec::new();
        let mut steps = Vec::new();
        if with_dates {
            x0.extend([0.0, 0.0]);
            steps.extend([1.0, 1.0]);
        }
        for (k, _) in eject_radii.iter().enumerate() {
            let (_, polar, azimuth) =
                math::cartesian_to_spherical(&trajectory::patch_at(&seeded.soi_patches.ejection, k));
            x0.extend([polar, azimuth]);
            steps.extend([ANGLE_STEP, ANGLE_STEP]);
        }
        for (k, _) in insert_radii.iter().enumerate() {
            let (_, polar, azimuth) =
                math::cartesian_to_spherical(&trajectory::patch_at(&seeded.soi_patches.insertion, k));
            x0.extend([polar, azimuth]);
            steps.extend([ANGLE_STEP, ANGLE_STEP]);
        }

        let decode = |x: &[f64]| {
            let (start_date, flight_time, angles) = if with_dates {
                (
                    seeded.start_date + x[0] * TIME_UNIT,
                    seeded.flight_time + x[1] * TIME_UNIT,
                    &x[2..],
                )
            } else {
                (seeded.start_date, seeded.flight_time, x)
            };
            let mut pairs = angles.chunks_exact(2);
            let mut sphere = |radius: f64| {
                pairs
                    .next()
                    .map_or_else(Vector3::zeros, |p| math::spherical_to_cartesian(radius, p[0], p[1]))
            };
            let ejection = eject_radii.iter().map(|&r| sphere(r)).collect();
            let insertion = insert_radii.iter().map(|&r| sphere(r)).collect();
            (start_date, flight_time, SoiPatches { ejection, insertion })
        };
        let cost = |x: &[f64]| {
            let (start_date, flight_time, patches) = decode(x);
            self.compute(start_date, flight_time, &patches)
                .map_or(f64::NAN, |t| t.patch_cost())
        };

        let mut simplex = vec![x0.clone()];
        for (i, step) in steps.iter().enumerate() {
            let mut vertex = x0.clone();
            vertex[i] += step;
            simplex.push(vertex);
        }
        let (x, polished) = math::nelder_mead(cost, simplex, self.settings.nelder_mead);
        debug!(
            "patch refinement: {:.3e} -> {:.3e} -> {polished:.3e}",
            transfer.patch_cost(),
            seeded.patch_cost()
        );

        let (start_date, flight_time, patches) = decode(&x);
        let refined = self.compute(start_date, flight_time, &patches)?;
        Ok(if better(refined.patch_cost(), seeded.patch_cost()) {
            refined
        } else {
            seeded
        })
    }
}

/// `a < b`, where anything beats a non-finite `b`.
fn better(a: f64, b: f64) -> bool {
    a < b || (a.is_finite() && !b.is_finite())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::{
        bodies::kerbol::{self, DUNA, KERBIN, KERBOL, MINMUS, MUN},
        kepler::orbits::OrbitalElements,
    };

    fn circular(system: &SolarSystem, body: BodyId, altitude: f64) -> Orbit {
        let b = system.body(body).unwrap();
        Orbit::from_elements(OrbitalElements::circular(body, b.radius + altitude), b.mu)
    }

    #[test]
    fn same_body_transfer() {
        let system = Arc::new(kerbol::stock_system().unwrap());
        let start = circular(&system, KERBIN, 100_000.0);
        let end = circular(&system, KERBIN, 500_000.0);
        let calc = TransferCalculator::new(system, start, end, TransferSettings::default()).unwrap();
        assert_eq!(calc.transfer_body(), KERBIN);

        // Hohmann transfer, arriving on the far side half an orbit later
        let (r1, r2) = (start.a, end.a);
        let tof = std::f64::consts::PI * ((r1 + r2).powi(3) / (8.0 * start.mu)).sqrt();
        let date = UT::new_seconds(0.0);
        let phase = start.true_anomaly_at_date(date) + std::f64::consts::PI;
        let end = end.anchored_at(phase, date + tof);
        let calc = TransferCalculator::new(calc.system.clone(), start, end, TransferSettings::default())
            .unwrap();
        let t = calc.compute(date, tof * 0.999, &SoiPatches::default()).unwrap();
        assert!(t.is_feasible());
        assert_eq!(t.maneuvers.len(), 2);
        assert_eq!(t.maneuvers[0].kind, ManeuverKind::Departure);
        assert_eq!(t.maneuvers[1].kind, ManeuverKind::Arrival);
        let hohmann = {
            let mu = start.mu;
            let at = (r1 + r2) / 2.0;
            let v1 = (mu * (2.0 / r1 - 1.0 / at)).sqrt() - (mu / r1).sqrt();
            let v2 = (mu / r2).sqrt() - (mu * (2.0 / r2 - 1.0 / at)).sqrt();
            v1 + v2
        };
        assert_relative_eq!(t.delta_v, hohmann, max_relative = 0.05);
        assert_eq!(t.patch_position_error, 0.0);
    }

    #[test]
    fn transfer_bodies() {
        let system = Arc::new(kerbol::stock_system().unwrap());
        let start = circular(&system, MUN, 30_000.0);
        let end = circular(&system, DUNA, 100_000.0);
        let calc = TransferCalculator::new(system.clone(), start, end, TransferSettings::default()).unwrap();
        assert_eq!(calc.transfer_body(), KERBOL);
        assert_eq!(calc.start_chain, vec![MUN, KERBIN]);
        let end = circular(&system, MINMUS, 30_000.0);
        let calc = TransferCalculator::new(system.clone(), start, end, TransferSettings::default()).unwrap();
        assert_eq!(calc.transfer_body(), KERBIN);

        let escape = Orbit::from_elements(
            OrbitalElements {
                e: 1.5,
                a: -1e6,
                ..OrbitalElements::circular(KERBIN, 1e6)
            },
            start.mu,
        );
        assert!(TransferCalculator::new(system, escape, end, TransferSettings::default()).is_err());
    }

    #[test]
    fn infeasible_dates() {
        let system = Arc::new(kerbol::stock_system().unwrap());
        let start = circular(&system, KERBIN, 100_000.0);
        let end = circular(&system, DUNA, 100_000.0);
        let calc = TransferCalculator::new(system, start, end, TransferSettings::default()).unwrap();
        let t = calc.compute(UT::new_seconds(0.0), -5.0, &SoiPatches::default()).unwrap();
        assert!(!t.is_feasible());
        assert!(calc.delta_v(UT::new_seconds(0.0), f64::NAN).is_nan());
    }

    #[test]
    fn better_ranks_nan_last() {
        assert!(better(1.0, 2.0));
        assert!(better(1.0, f64::NAN));
        assert!(!better(f64::NAN, 1.0));
        assert!(!better(2.0, 2.0));
    }
}
