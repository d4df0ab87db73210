//! Delta-v over a grid of departure dates and flight times.

use std::sync::Arc;

use color_eyre::eyre::{self, bail};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    bodies::SolarSystem,
    evolution::{self, WorkerPool},
    kepler::orbits::Orbit,
    time::UT,
    trajectory::SoiPatches,
    transfer::{Transfer, TransferCalculator, TransferSettings},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PorkchopSettings {
    pub start_date_min: UT,
    pub start_date_max: UT,
    pub flight_time_min: f64,
    pub flight_time_max: f64,
    /// Samples along each axis.
    pub n_times: usize,
    #[serde(default)]
    pub transfer: TransferSettings,
    /// Worker threads, `None` for `min(cores - 1, 4)`.
    #[serde(default)]
    pub threads: Option<usize>,
}

impl PorkchopSettings {
    pub fn new(start_date_min: UT, start_date_max: UT, flight_time_min: f64, flight_time_max: f64) -> Self {
        Self {
            start_date_min,
            start_date_max,
            flight_time_min,
            flight_time_max,
            n_times: 101,
            transfer: TransferSettings::default(),
            threads: None,
        }
    }
}

fn linspace(min: f64, max: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![min],
        _ => (0..n)
            .map(|i| min + (max - min) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Porkchop {
    pub start_dates: Vec<UT>,
    pub flight_times: Vec<f64>,
    /// `delta_v[i][j]` departs at `start_dates[j]` and flies for
    /// `flight_times[i]`; NaN where no transfer exists.
    pub delta_v: Vec<Vec<f64>>,
    /// Smallest and largest finite delta-v of the grid.
    pub delta_v_range: Option<(f64, f64)>,
    /// `(i, j)` of the cheapest cell.
    pub best: Option<(usize, usize)>,
    /// The cheapest transfer, recomputed.
    pub best_transfer: Option<Transfer>,
}

pub struct PorkchopCalculator {
    calculator: TransferCalculator,
    settings: PorkchopSettings,
    pool: WorkerPool,
}

impl PorkchopCalculator {
    pub fn new(
        system: Arc<SolarSystem>,
        start: Orbit,
        end: Orbit,
        settings: PorkchopSettings,
    ) -> eyre::Result<Self> {
        if !(settings.start_date_min <= settings.start_date_max) {
            bail!(
                "empty departure window {:?} to {:?}",
                settings.start_date_min,
                settings.start_date_max
            );
        }
        if !(settings.flight_time_min > 0.0 && settings.flight_time_min <= settings.flight_time_max) {
            bail!(
                "invalid flight times [{}, {}]",
                settings.flight_time_min,
                settings.flight_time_max
            );
        }
        if settings.n_times == 0 {
            bail!("a porkchop needs at least one sample per axis");
        }
        let calculator = TransferCalculator::new(system, start, end, settings.transfer.clone())?;
        let pool = WorkerPool::new(settings.threads);
        Ok(Self {
            calculator,
            settings,
            pool,
        })
    }

    pub fn calculator(&self) -> &TransferCalculator {
        &self.calculator
    }

    pub fn compute(&self) -> eyre::Result<Porkchop> {
        let s = &self.settings;
        let start_dates = linspace(
            s.start_date_min.into_seconds(),
            s.start_date_max.into_seconds(),
            s.n_times,
        )
        .into_iter()
        .map(UT::new_seconds)
        .collect::<Vec<_>>();
        let flight_times = linspace(s.flight_time_min, s.flight_time_max, s.n_times);

        // rows need no randomness; the rng only feeds the pool's seeding
        let mut rng = StdRng::seed_from_u64(0);
        let delta_v = self.pool.map(&flight_times, &mut rng, |_, &tof, _| {
            start_dates
                .iter()
                .map(|&date| self.calculator.delta_v(date, tof))
                .collect::<Vec<_>>()
        });

        let flat = delta_v.iter().flatten().copied().collect::<Vec<_>>();
        let delta_v_range = flat
            .iter()
            .copied()
            .filter(|dv| dv.is_finite())
            .minmax_by_key(|&dv| OrderedFloat(dv))
            .into_option();
        let best = evolution::finite_min(&flat).map(|(k, _)| (k / s.n_times, k % s.n_times));
        let best_transfer = match best {
            Some((i, j)) => Some(self.calculator.compute(
                start_dates[j],
                flight_times[i],
                &SoiPatches::default(),
            )?),
            None => None,
        };
        debug!(
            "porkchop {0}x{0}: best {best:?}, range {delta_v_range:?}",
            s.n_times
        );

        Ok(Porkchop {
            start_dates,
            flight_times,
            delta_v,
            delta_v_range,
            best,
            best_transfer,
        })
    }
}
