//! Missions with gravity assists at a sequence of bodies.
//!
//! All flyby bodies orbit the transfer body directly. A candidate is
//! described by a [`MultiFlybyState`]; the calculator evaluates it into
//! a [`MultiFlyby`] and refines it in stages, each stage keeping its
//! input when it cannot improve on it.

use std::sync::Arc;

use color_eyre::eyre::{self, bail, OptionExt};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    bodies::{BodyId, SolarSystem},
    departarrive::EjectionInsertionType,
    evolution::{self, Bounds, DeSettings, Population, WorkerPool},
    flyby::{self, FlybyParams},
    kepler::orbits::Orbit,
    maneuver::Maneuver,
    math::{self, NelderMeadSettings},
    time::UT,
    trajectory::{self, PatchSettings, SoiPatches, Trajectory},
    transfer,
};

/// Weight of the flyby turn angle error (per radian) against delta-v.
pub const FLYBY_ERROR_WEIGHT: f64 = 1e6;

/// Half a transfer orbit between circular orbits of radii `r1` and
/// `r2`.
pub fn hohmann_flight_time(mu: f64, r1: f64, r2: f64) -> f64 {
    std::f64::consts::PI * libm::sqrt((r1 + r2).powi(3) / (8.0 * mu))
}

fn default_naive_iterations() -> usize {
    100
}

fn default_naive_tolerance() -> f64 {
    1e-6
}

fn default_nelder_mead_steps() -> Vec<f64> {
    vec![1.0, 0.1, 0.01, 0.001]
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiFlybySettings {
    pub start_date_min: UT,
    pub start_date_max: UT,
    /// `(min, max)` flight time of every leg, one more than there are
    /// flybys.
    pub flight_time_bounds: Vec<(f64, f64)>,
    #[serde(default)]
    pub ejection_insertion_type: EjectionInsertionType,
    #[serde(default)]
    pub match_start_mo: bool,
    #[serde(default)]
    pub match_end_mo: bool,
    #[serde(default)]
    pub no_insertion_burn: bool,
    #[serde(default)]
    pub de: DeSettings,
    #[serde(default)]
    pub nelder_mead: NelderMeadSettings,
    #[serde(default = "default_naive_iterations")]
    pub naive_iterations: usize,
    /// Relative change of the patch fitness ending the naive passes.
    #[serde(default = "default_naive_tolerance")]
    pub naive_tolerance: f64,
    /// Initial simplex sizes of the successive Nelder-Mead polishes, in
    /// normalized agent units.
    #[serde(default = "default_nelder_mead_steps")]
    pub nelder_mead_steps: Vec<f64>,
}

impl MultiFlybySettings {
    pub fn new(start_date_min: UT, start_date_max: UT, flight_time_bounds: Vec<(f64, f64)>) -> Self {
        Self {
            start_date_min,
            start_date_max,
            flight_time_bounds,
            ejection_insertion_type: EjectionInsertionType::default(),
            match_start_mo: false,
            match_end_mo: false,
            no_insertion_burn: false,
            de: DeSettings::default(),
            nelder_mead: NelderMeadSettings::default(),
            naive_iterations: default_naive_iterations(),
            naive_tolerance: default_naive_tolerance(),
            nelder_mead_steps: default_nelder_mead_steps(),
        }
    }

    /// Settings whose leg flight times range from half to twice the
    /// Hohmann time between consecutive bodies.
    pub fn with_hohmann_bounds(
        system: &SolarSystem,
        start: &Orbit,
        end: &Orbit,
        flybys: &[BodyId],
        start_date_min: UT,
        start_date_max: UT,
    ) -> eyre::Result<Self> {
        let transfer_body = transfer_body(system, start, end, flybys)?;
        let mu = system.body(transfer_body)?.mu;
        let radius = |orbit: &Orbit| -> eyre::Result<f64> {
            if orbit.orbiting == transfer_body {
                return Ok(orbit.a);
            }
            let top = system
                .chain_below(orbit.orbiting, transfer_body)?
                .last()
                .copied()
                .ok_or_eyre("empty body chain")?;
            Ok(system.orbit_of(top)?.a)
        };
        let mut radii = vec![radius(start)?];
        for &id in flybys {
            radii.push(system.orbit_of(id)?.a);
        }
        radii.push(radius(end)?);
        let flight_time_bounds = radii
            .windows(2)
            .map(|w| {
                let h = hohmann_flight_time(mu, w[0], w[1]);
                (0.5 * h, 2.0 * h)
            })
            .collect();
        Ok(Self::new(start_date_min, start_date_max, flight_time_bounds))
    }

    fn ejection(&self) -> PatchSettings {
        PatchSettings {
            kind: self.ejection_insertion_type,
            match_mo: self.match_start_mo,
        }
    }

    fn insertion(&self) -> PatchSettings {
        PatchSettings {
            kind: self.ejection_insertion_type,
            match_mo: self.match_end_mo,
        }
    }
}

fn transfer_body(
    system: &SolarSystem,
    start: &Orbit,
    end: &Orbit,
    flybys: &[BodyId],
) -> eyre::Result<BodyId> {
    let mut transfer_body = system.common_ancestor(start.orbiting, end.orbiting)?;
    for &id in flybys {
        transfer_body = system.common_ancestor(transfer_body, id)?;
    }
    for &id in flybys {
        let body = system.body(id)?;
        if body.parent != Some(transfer_body) {
            bail!(
                "flyby body {} does not orbit the transfer body {}",
                body.name,
                system.body(transfer_body)?.name
            );
        }
    }
    Ok(transfer_body)
}

/// A candidate mission.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiFlybyState {
    /// Date the first interplanetary leg begins.
    pub start_date: UT,
    /// Duration of every leg, from SOI exit to the next SOI entry.
    pub flight_times: Vec<f64>,
    pub soi_patches: SoiPatches,
    /// Planned SOI entry and exit points of every flyby, relative to
    /// the flown-by body.
    pub flyby_patches: Vec<(Vector3<f64>, Vector3<f64>)>,
    /// Time from SOI entry to periapsis, and from periapsis to SOI exit,
    /// of every flyby.
    pub flyby_durations: Vec<(f64, f64)>,
}

impl MultiFlybyState {
    /// Start and end dates of every leg.
    pub fn leg_dates(&self) -> Vec<(UT, UT)> {
        let mut start = self.start_date;
        self.flight_times
            .iter()
            .enumerate()
            .map(|(k, &tof)| {
                let leg = (start, start + tof);
                let (in_dur, out_dur) = self.duration(k);
                start = leg.1 + in_dur + out_dur;
                leg
            })
            .collect()
    }

    /// Periapsis dates of the flybys.
    pub fn flyby_dates(&self) -> Vec<UT> {
        let legs = self.leg_dates();
        legs.iter()
            .take(legs.len().saturating_sub(1))
            .enumerate()
            .map(|(k, &(_, end))| end + self.duration(k).0)
            .collect()
    }

    pub fn arrival_date(&self) -> UT {
        self.leg_dates()
            .last()
            .map_or(self.start_date, |&(_, end)| end)
    }

    fn duration(&self, k: usize) -> (f64, f64) {
        self.flyby_durations.get(k).copied().unwrap_or_default()
    }

    fn flyby_patch(&self, k: usize) -> (Vector3<f64>, Vector3<f64>) {
        self.flyby_patches
            .get(k)
            .copied()
            .unwrap_or_else(|| (Vector3::zeros(), Vector3::zeros()))
    }
}

/// An evaluated mission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiFlyby {
    pub system: Arc<SolarSystem>,
    pub start_orbit: Orbit,
    pub end_orbit: Orbit,
    pub flyby_bodies: Vec<BodyId>,
    pub state: MultiFlybyState,
    /// In flight order; empty when infeasible.
    pub ejections: Vec<Trajectory>,
    pub legs: Vec<Trajectory>,
    pub flybys: Vec<FlybyParams>,
    pub flyby_trajectories: Vec<Trajectory>,
    pub insertions: Vec<Trajectory>,
    pub maneuvers: Vec<Maneuver>,
    /// NaN when no trajectory exists for this state.
    pub delta_v: f64,
    /// Summed turn angle error of the flybys (rad).
    pub flyby_error: f64,
    pub patch_position_error: f64,
    pub patch_time_error: f64,
    pub ejection_crossings: Vec<Vector3<f64>>,
    pub insertion_crossings: Vec<Vector3<f64>>,
    pub flyby_crossings: Vec<(Vector3<f64>, Vector3<f64>)>,
}

impl MultiFlyby {
    pub fn fitness(&self) -> f64 {
        self.delta_v + FLYBY_ERROR_WEIGHT * self.flyby_error
    }

    pub fn soi_patch_fitness(&self) -> f64 {
        transfer::patch_cost(
            self.patch_position_error,
            self.patch_time_error,
            self.fitness(),
        )
    }

    pub fn is_feasible(&self) -> bool {
        self.fitness().is_finite()
    }
}

pub struct MultiFlybyCalculator {
    system: Arc<SolarSystem>,
    start: Orbit,
    end: Orbit,
    flybys: Vec<BodyId>,
    transfer_body: BodyId,
    /// SOI radius of every patch, in agent order: ejection levels,
    /// insertion levels, then flyby entry and exit.
    patch_radii: Vec<f64>,
    ejection_levels: usize,
    insertion_levels: usize,
    settings: MultiFlybySettings,
    pool: WorkerPool,
}

impl MultiFlybyCalculator {
    pub fn new(
        system: Arc<SolarSystem>,
        start: Orbit,
        end: Orbit,
        flybys: Vec<BodyId>,
        settings: MultiFlybySettings,
    ) -> eyre::Result<Self> {
        if settings.flight_time_bounds.len() != flybys.len() + 1 {
            bail!(
                "{} flybys need {} flight time bounds, got {}",
                flybys.len(),
                flybys.len() + 1,
                settings.flight_time_bounds.len()
            );
        }
        if !(settings.start_date_min <= settings.start_date_max) {
            bail!(
                "empty departure window {:?} to {:?}",
                settings.start_date_min,
                settings.start_date_max
            );
        }
        if let Some(&(lo, hi)) = settings
            .flight_time_bounds
            .iter()
            .find(|&&(lo, hi)| !(lo > 0.0 && lo <= hi))
        {
            bail!("invalid flight time bounds [{lo}, {hi}]");
        }
        for orbit in [&start, &end] {
            if orbit.is_hyperbolic() {
                bail!("orbit around {} is not closed", system.body(orbit.orbiting)?.name);
            }
        }

        let transfer_body = transfer_body(&system, &start, &end, &flybys)?;
        let soi_radii = |orbit: &Orbit| -> eyre::Result<Vec<f64>> {
            if orbit.orbiting == transfer_body {
                return Ok(vec![]);
            }
            system
                .chain_below(orbit.orbiting, transfer_body)?
                .iter()
                .rev()
                .map(|&id| Ok(system.body(id)?.soi_radius()))
                .collect()
        };
        let ejection = soi_radii(&start)?;
        let insertion = soi_radii(&end)?;
        let mut patch_radii = ejection.clone();
        patch_radii.extend(&insertion);
        for &id in &flybys {
            let soi = system.body(id)?.soi_radius();
            patch_radii.extend([soi, soi]);
        }

        let pool = WorkerPool::new(settings.de.threads);
        debug!(
            "multi-flyby around {} with {} flybys, {} patches, {} worker threads",
            system.body(transfer_body)?.name,
            flybys.len(),
            patch_radii.len(),
            pool.threads()
        );
        Ok(Self {
            system,
            start,
            end,
            flybys,
            transfer_body,
            patch_radii,
            ejection_levels: ejection.len(),
            insertion_levels: insertion.len(),
            settings,
            pool,
        })
    }

    pub fn settings(&self) -> &MultiFlybySettings {
        &self.settings
    }

    pub fn patch_count(&self) -> usize {
        self.patch_radii.len()
    }

    fn date_bounds(&self) -> Bounds {
        let mut bounds = Bounds::default();
        bounds.push(
            self.settings.start_date_min.into_seconds(),
            self.settings.start_date_max.into_seconds(),
        );
        for &(lo, hi) in &self.settings.flight_time_bounds {
            bounds.push(lo, hi);
        }
        bounds
    }

    /// Bounds of the full agent: dates, then a polar angle and an
    /// azimuth per patch.
    fn bounds(&self) -> Bounds {
        let mut bounds = self.date_bounds();
        for _ in &self.patch_radii {
            bounds.push(0.0, std::f64::consts::PI);
            bounds.push(0.0, std::f64::consts::TAU);
        }
        bounds
    }

    /// Decode a date-only or full agent; patches missing from the agent
    /// and the flyby durations come from `template`.
    pub fn decode(&self, agent: &[f64], template: &MultiFlybyState) -> MultiFlybyState {
        let bounds = if agent.len() > self.date_bounds().dim() {
            self.bounds()
        } else {
            self.date_bounds()
        };
        let values = bounds.decode(agent);
        let legs = self.flybys.len() + 1;
        let mut state = template.clone();
        state.start_date = UT::new_seconds(values[0]);
        state.flight_times = values[1..=legs].to_vec();

        let angles = &values[legs + 1..];
        if angles.is_empty() {
            return state;
        }
        let points = angles
            .chunks_exact(2)
            .zip(&self.patch_radii)
            .map(|(p, &r)| math::spherical_to_cartesian(r, p[0], p[1]))
            .collect::<Vec<_>>();
        let (ejection, rest) = points.split_at(self.ejection_levels);
        let (insertion, flybys) = rest.split_at(self.insertion_levels);
        state.soi_patches = SoiPatches {
            ejection: ejection.to_vec(),
            insertion: insertion.to_vec(),
        };
        state.flyby_patches = flybys.chunks_exact(2).map(|p| (p[0], p[1])).collect();
        state
    }

    pub fn encode(&self, state: &MultiFlybyState) -> Vec<f64> {
        let mut values = vec![state.start_date.into_seconds()];
        values.extend(&state.flight_times);
        let points = (0..self.ejection_levels)
            .map(|k| trajectory::patch_at(&state.soi_patches.ejection, k))
            .chain((0..self.insertion_levels).map(|k| trajectory::patch_at(&state.soi_patches.insertion, k)))
            .chain((0..self.flybys.len()).flat_map(|k| {
                let (entry, exit) = state.flyby_patch(k);
                [entry, exit]
            }));
        for point in points {
            let (_, polar, azimuth) = math::cartesian_to_spherical(&point);
            values.extend([polar, azimuth]);
        }
        self.bounds().encode(&values)
    }

    fn infeasible(&self, state: &MultiFlybyState) -> MultiFlyby {
        MultiFlyby {
            system: self.system.clone(),
            start_orbit: self.start,
            end_orbit: self.end,
            flyby_bodies: self.flybys.clone(),
            state: state.clone(),
            ejections: vec![],
            legs: vec![],
            flybys: vec![],
            flyby_trajectories: vec![],
            insertions: vec![],
            maneuvers: vec![],
            delta_v: f64::NAN,
            flyby_error: f64::NAN,
            patch_position_error: f64::NAN,
            patch_time_error: f64::NAN,
            ejection_crossings: vec![],
            insertion_crossings: vec![],
            flyby_crossings: vec![],
        }
    }

    /// Fly the mission described by `state`.
    pub fn evaluate(&self, state: &MultiFlybyState) -> eyre::Result<MultiFlyby> {
        let leg_dates = state.leg_dates();
        if leg_dates.len() != self.flybys.len() + 1
            || leg_dates
                .iter()
                .any(|&(s, e)| !(e - s > 0.0) || !s.is_finite())
        {
            return Ok(self.infeasible(state));
        }
        let system = &*self.system;
        let t_body = system.body(self.transfer_body)?;
        let n = self.flybys.len();

        let departure = trajectory::anchor_state(system, &self.start, self.transfer_body, leg_dates[0].0)?;
        let arrival = trajectory::anchor_state(system, &self.end, self.transfer_body, leg_dates[n].1)?;

        let mut legs = Vec::with_capacity(n + 1);
        for (k, &(s, e)) in leg_dates.iter().enumerate() {
            let from = if k == 0 {
                departure.position + trajectory::patch_at(&state.soi_patches.ejection, 0)
            } else {
                system.state_of(self.flybys[k - 1], s)?.position + state.flyby_patch(k - 1).1
            };
            let to = if k == n {
                arrival.position + trajectory::patch_at(&state.soi_patches.insertion, 0)
            } else {
                system.state_of(self.flybys[k], e)?.position + state.flyby_patch(k).0
            };
            let Some(leg) = trajectory::lambert_leg(self.transfer_body, t_body.mu, &from, &to, s, e - s, None)
            else {
                return Ok(self.infeasible(state));
            };
            legs.push(leg);
        }

        let mut position_error = 0.0;
        let mut time_error = 0.0;
        let mut flybys = Vec::with_capacity(n);
        let mut flyby_trajectories = Vec::with_capacity(n);
        let mut flyby_crossings = Vec::with_capacity(n);
        for (k, &id) in self.flybys.iter().enumerate() {
            let body = system.body(id)?;
            let (entry_date, exit_date) = (leg_dates[k].1, leg_dates[k + 1].0);
            let v_in = legs[k].arrival_velocity - system.state_of(id, entry_date)?.velocity;
            let v_out = legs[k + 1].departure_velocity - system.state_of(id, exit_date)?.velocity;
            let epoch = entry_date + state.duration(k).0;
            let params = flyby::flyby(body, &v_in, &v_out, epoch);
            let flown = params.trajectory(body);
            let (Some(entry), Some(exit)) = (flown.start_state(), flown.end_state()) else {
                return Ok(self.infeasible(state));
            };
            let (planned_in, planned_out) = state.flyby_patch(k);
            let (in_dur, out_dur) = state.duration(k);
            position_error += (entry.position - planned_in).norm() + (exit.position - planned_out).norm();
            time_error += (params.in_duration - in_dur).abs() + (params.out_duration - out_dur).abs();
            flyby_crossings.push((entry.position, exit.position));
            flybys.push(params);
            flyby_trajectories.push(flown);
        }

        let Some(ejection) = trajectory::departure_chain(
            system,
            &self.start,
            self.transfer_body,
            &departure,
            &legs[0].departure_velocity,
            leg_dates[0].0,
            &state.soi_patches.ejection,
            self.settings.ejection(),
        )?
        else {
            return Ok(self.infeasible(state));
        };
        let Some(insertion) = trajectory::arrival_chain(
            system,
            &self.end,
            self.transfer_body,
            &arrival,
            &legs[n].arrival_velocity,
            leg_dates[n].1,
            &state.soi_patches.insertion,
            self.settings.insertion(),
            self.settings.no_insertion_burn,
        )?
        else {
            return Ok(self.infeasible(state));
        };

        let maneuvers = ejection
            .maneuvers()
            .chain(flyby_trajectories.iter().flat_map(|t| &t.maneuvers))
            .chain(insertion.maneuvers())
            .cloned()
            .collect::<Vec<_>>();
        let delta_v = ejection.delta_v() + flybys.iter().map(|f| f.delta_v).sum::<f64>() + insertion.delta_v();
        Ok(MultiFlyby {
            system: self.system.clone(),
            start_orbit: self.start,
            end_orbit: self.end,
            flyby_bodies: self.flybys.clone(),
            state: state.clone(),
            ejections: ejection.trajectories,
            legs: legs.into_iter().map(|leg| leg.trajectory).collect(),
            flyby_error: flybys.iter().map(|f| f.error).sum(),
            flybys,
            flyby_trajectories,
            insertions: insertion.trajectories,
            maneuvers,
            delta_v,
            patch_position_error: position_error + ejection.position_error + insertion.position_error,
            patch_time_error: time_error + ejection.time_error + insertion.time_error,
            ejection_crossings: ejection.crossings,
            insertion_crossings: insertion.crossings,
            flyby_crossings,
        })
    }

    fn score(&self, state: &MultiFlybyState, patched: bool) -> f64 {
        match self.evaluate(state) {
            Ok(mission) if patched => mission.soi_patch_fitness(),
            Ok(mission) => mission.fitness(),
            Err(err) => {
                debug!("multi-flyby evaluation failed: {err}");
                f64::NAN
            }
        }
    }

    /// Differential Evolution over the dates alone, with unpatched
    /// SOIs and instantaneous flybys.
    pub fn search_dates(&self, rng: &mut StdRng) -> eyre::Result<MultiFlyby> {
        let template = MultiFlybyState::default();
        let dim = self.date_bounds().dim();
        let agents = (0..self.settings.de.population_size(0))
            .map(|_| evolution::random_agent(dim, rng))
            .collect();
        let fitness = |agent: &[f64]| self.score(&self.decode(agent, &template), false);
        let population = Population::evaluate(agents, &fitness, &self.pool, rng);
        let population = evolution::evolve(population, &fitness, &self.settings.de, &self.pool, rng);
        let (best, fit) = population.best().ok_or_eyre("no feasible departure dates found")?;
        debug!("date search: fitness {fit:.1} after {} generations", population.generation);
        self.evaluate(&self.decode(best, &template))
    }

    fn keep_better(&self, stage: &str, baseline: &MultiFlyby, candidate: MultiFlyby) -> MultiFlyby {
        let (before, after) = (baseline.soi_patch_fitness(), candidate.soi_patch_fitness());
        if evolution::no_worse(after, before) {
            debug!("{stage}: {before:.6e} -> {after:.6e}");
            candidate
        } else {
            debug!("{stage}: {after:.6e} is worse than {before:.6e}, keeping the baseline");
            baseline.clone()
        }
    }

    /// Move every patch onto the crossing actually flown and adopt the
    /// flown flyby durations, keeping the departure, periapsis and
    /// arrival dates.
    pub fn refine_naive(&self, mission: &MultiFlyby) -> eyre::Result<MultiFlyby> {
        let mut best = mission.clone();
        let mut current = mission.clone();
        for i in 0..self.settings.naive_iterations {
            if !current.is_feasible() {
                break;
            }
            let state = &current.state;
            let periapses = state.flyby_dates();
            let arrival = state.arrival_date();
            let durations = current
                .flybys
                .iter()
                .map(|f| (f.in_duration, f.out_duration))
                .collect::<Vec<_>>();

            let mut flight_times = Vec::with_capacity(durations.len() + 1);
            let mut start = state.start_date;
            for (&periapsis, &(in_dur, out_dur)) in periapses.iter().zip(&durations) {
                flight_times.push(periapsis - in_dur - start);
                start = periapsis + out_dur;
            }
            flight_times.push(arrival - start);

            let next = MultiFlybyState {
                start_date: state.start_date,
                flight_times,
                soi_patches: SoiPatches {
                    ejection: current.ejection_crossings.clone(),
                    insertion: current.insertion_crossings.clone(),
                },
                flyby_patches: current.flyby_crossings.clone(),
                flyby_durations: durations,
            };
            let previous = current.soi_patch_fitness();
            current = self.evaluate(&next)?;
            let fit = current.soi_patch_fitness();
            if evolution::no_worse(fit, best.soi_patch_fitness()) {
                best = current.clone();
            }
            if ((fit - previous) / previous).abs() < self.settings.naive_tolerance {
                debug!("naive patches converged after {} passes", i + 1);
                break;
            }
        }
        Ok(self.keep_better("naive patches", mission, best))
    }

    /// Differential Evolution over dates and patch directions, seeded
    /// with `mission`.
    pub fn refine_de(&self, mission: &MultiFlyby, rng: &mut StdRng) -> eyre::Result<MultiFlyby> {
        let template = &mission.state;
        let dim = self.bounds().dim();
        let mut agents = vec![self.encode(template)];
        agents.extend(
            (1..self.settings.de.population_size(self.patch_count()))
                .map(|_| evolution::random_agent(dim, rng)),
        );
        let fitness = |agent: &[f64]| self.score(&self.decode(agent, template), true);
        let population = Population::evaluate(agents, &fitness, &self.pool, rng);
        let population = evolution::evolve(population, &fitness, &self.settings.de, &self.pool, rng);
        let Some((best, _)) = population.best() else {
            return Ok(mission.clone());
        };
        let candidate = self.evaluate(&self.decode(best, template))?;
        Ok(self.keep_better("patch evolution", mission, candidate))
    }

    /// Nelder-Mead polishes of decreasing simplex size over the
    /// normalized agent.
    pub fn refine_nelder_mead(&self, mission: &MultiFlyby) -> eyre::Result<MultiFlyby> {
        let mut best = mission.clone();
        for &step in &self.settings.nelder_mead_steps {
            let template = best.state.clone();
            let x0 = self.encode(&template);
            let mut simplex = vec![x0.clone()];
            for i in 0..x0.len() {
                let mut vertex = x0.clone();
                vertex[i] = if vertex[i] + step <= 1.0 {
                    vertex[i] + step
                } else {
                    vertex[i] - step
                };
                simplex.push(vertex);
            }
            let cost = |x: &[f64]| {
                let mut agent = x.to_vec();
                evolution::clamp_agent(&mut agent);
                self.score(&self.decode(&agent, &template), true)
            };
            let (mut x, _) = math::nelder_mead(cost, simplex, self.settings.nelder_mead);
            evolution::clamp_agent(&mut x);
            let candidate = self.evaluate(&self.decode(&x, &template))?;
            best = self.keep_better(&format!("Nelder-Mead step {step}"), &best, candidate);
        }
        Ok(best)
    }

    /// Search the departure window, then refine the SOI patches.
    pub fn optimize(&self) -> eyre::Result<MultiFlyby> {
        let mut rng = self.settings.de.rng();
        let mission = self.search_dates(&mut rng)?;
        let mission = self.refine_naive(&mission)?;
        let mission = self.refine_de(&mission, &mut rng)?;
        let mission = self.refine_nelder_mead(&mission)?;
        info!(
            "multi-flyby: {:.1} m/s, flyby error {:.2e} rad, patch error {:.0} m / {:.1} s",
            mission.delta_v,
            mission.flyby_error,
            mission.patch_position_error,
            mission.patch_time_error
        );
        Ok(mission)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::{
        bodies::kerbol::{self, DUNA, EVE, KERBIN, KERBOL, MUN},
        kepler::orbits::OrbitalElements,
    };

    fn circular(system: &SolarSystem, body: BodyId, altitude: f64) -> Orbit {
        let b = system.body(body).unwrap();
        Orbit::from_elements(OrbitalElements::circular(body, b.radius + altitude), b.mu)
    }

    #[test]
    fn hohmann() {
        let system = kerbol::stock_system().unwrap();
        let mu = system.body(KERBOL).unwrap().mu;
        let r = system.orbit_of(KERBIN).unwrap().a;
        let period = system.orbit_of(KERBIN).unwrap().period;
        assert_relative_eq!(hohmann_flight_time(mu, r, r), period / 2.0, max_relative = 1e-9);

        let start = circular(&system, KERBIN, 100_000.0);
        let end = circular(&system, DUNA, 100_000.0);
        let settings = MultiFlybySettings::with_hohmann_bounds(
            &system,
            &start,
            &end,
            &[EVE],
            UT::ZERO,
            UT::new_seconds(1e7),
        )
        .unwrap();
        assert_eq!(settings.flight_time_bounds.len(), 2);
        let (lo, hi) = settings.flight_time_bounds[0];
        assert_relative_eq!(hi, 4.0 * lo);
        assert!(MultiFlybySettings::with_hohmann_bounds(
            &system,
            &start,
            &end,
            &[MUN],
            UT::ZERO,
            UT::new_seconds(1e7),
        )
        .is_err());
    }

    #[test]
    fn state_dates() {
        let state = MultiFlybyState {
            start_date: UT::new_seconds(100.0),
            flight_times: vec![1000.0, 2000.0, 3000.0],
            flyby_durations: vec![(10.0, 20.0), (30.0, 40.0)],
            ..Default::default()
        };
        let legs = state.leg_dates();
        assert_eq!(legs[0], (UT::new_seconds(100.0), UT::new_seconds(1100.0)));
        assert_eq!(legs[1], (UT::new_seconds(1130.0), UT::new_seconds(3130.0)));
        assert_eq!(legs[2], (UT::new_seconds(3200.0), UT::new_seconds(6200.0)));
        assert_eq!(
            state.flyby_dates(),
            vec![UT::new_seconds(1110.0), UT::new_seconds(3160.0)]
        );
        assert_eq!(state.arrival_date(), UT::new_seconds(6200.0));
    }

    #[test]
    fn agent_layout() {
        let system = Arc::new(kerbol::stock_system().unwrap());
        let start = circular(&system, MUN, 30_000.0);
        let end = circular(&system, DUNA, 100_000.0);
        let settings = MultiFlybySettings::with_hohmann_bounds(
            &system,
            &start,
            &end,
            &[EVE],
            UT::ZERO,
            UT::new_seconds(1e7),
        )
        .unwrap();
        let calc = MultiFlybyCalculator::new(system, start, end, vec![EVE], settings).unwrap();
        // Kerbin and Mun, Duna, Eve entry and exit
        assert_eq!(calc.patch_count(), 5);
        let agent = vec![0.25; 3 + 2 * 5];
        let state = calc.decode(&agent, &MultiFlybyState::default());
        assert_eq!(state.soi_patches.ejection.len(), 2);
        assert_eq!(state.soi_patches.insertion.len(), 1);
        assert_eq!(state.flyby_patches.len(), 1);
        assert_relative_eq!(state.start_date.into_seconds(), 2.5e6);
        let back = calc.encode(&state);
        for (a, b) in agent.iter().zip(&back) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn invalid_settings() {
        let system = Arc::new(kerbol::stock_system().unwrap());
        let start = circular(&system, KERBIN, 100_000.0);
        let end = circular(&system, DUNA, 100_000.0);
        let settings = MultiFlybySettings::new(UT::ZERO, UT::new_seconds(1e6), vec![(1e6, 2e6)]);
        assert!(MultiFlybyCalculator::new(system.clone(), start, end, vec![EVE], settings.clone()).is_err());
        assert!(MultiFlybyCalculator::new(system.clone(), start, end, vec![], settings).is_ok());
        let settings = MultiFlybySettings::new(UT::new_seconds(1e6), UT::ZERO, vec![(1e6, 2e6)]);
        assert!(MultiFlybyCalculator::new(system, start, end, vec![], settings).is_err());
    }
}
