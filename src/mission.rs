use std::sync::Arc;

use color_eyre::eyre;
use kertraj::{
    bodies::{kerbol, BodyId, SolarSystem},
    evolution::DeSettings,
    kepler::orbits::{Orbit, OrbitalElements},
    multiflyby::{MultiFlyby, MultiFlybySettings},
    porkchop::{Porkchop, PorkchopSettings},
    time::UT,
    transfer::{Transfer, TransferSettings},
};
use serde::{Deserialize, Serialize};

/// A mission file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mission {
    /// Custom bodies; the stock Kerbol system when absent.
    #[serde(default)]
    pub system: Option<SolarSystem>,
    pub start: OrbitalElements,
    pub end: OrbitalElements,
    pub plan: Plan,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Plan {
    /// One transfer at fixed dates, with refined SOI patches.
    Transfer {
        start_date: UT,
        flight_time: f64,
        #[serde(default)]
        settings: TransferSettings,
    },
    /// A porkchop plot, then the patch refinement of its best cell.
    Porkchop(PorkchopSettings),
    MultiFlyby {
        /// Names of the flown-by bodies, in order.
        flybys: Vec<String>,
        start_date_min: UT,
        start_date_max: UT,
        /// Per-leg flight time bounds; Hohmann based when absent.
        #[serde(default)]
        flight_time_bounds: Option<Vec<(f64, f64)>>,
        #[serde(default)]
        de: DeSettings,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Outcome {
    Transfer(Box<Transfer>),
    Porkchop(Box<Porkchop>, Option<Box<Transfer>>),
    MultiFlyby(Box<MultiFlyby>),
}

impl Mission {
    /// Kerbin to Duna over the first two years.
    pub fn demo() -> Self {
        Self {
            system: None,
            start: OrbitalElements::circular(kerbol::KERBIN, 700_000.0),
            end: OrbitalElements::circular(kerbol::DUNA, 420_000.0),
            plan: Plan::Porkchop(PorkchopSettings {
                n_times: 41,
                ..PorkchopSettings::new(
                    UT::new_ydhms(1, 1, 0, 0, 0.0),
                    UT::new_ydhms(3, 1, 0, 0, 0.0),
                    UT::new_ydhms(1, 50, 0, 0, 0.0).into_seconds(),
                    UT::new_ydhms(1, 400, 0, 0, 0.0).into_seconds(),
                )
            }),
        }
    }

    pub fn system(&self) -> eyre::Result<Arc<SolarSystem>> {
        Ok(Arc::new(match &self.system {
            Some(system) => system.clone(),
            None => kerbol::stock_system()?,
        }))
    }

    pub fn orbits(&self, system: &SolarSystem) -> eyre::Result<(Orbit, Orbit)> {
        let orbit = |elements: OrbitalElements| -> eyre::Result<Orbit> {
            Ok(Orbit::from_elements(elements, system.body(elements.orbiting)?.mu))
        };
        Ok((orbit(self.start)?, orbit(self.end)?))
    }

    pub fn flyby_ids(system: &SolarSystem, names: &[String]) -> eyre::Result<Vec<BodyId>> {
        names
            .iter()
            .map(|name| Ok(system.body_by_name(name)?.id))
            .collect()
    }

    pub fn multi_flyby_settings(
        system: &SolarSystem,
        start: &Orbit,
        end: &Orbit,
        flybys: &[BodyId],
        window: (UT, UT),
        flight_time_bounds: Option<Vec<(f64, f64)>>,
        de: DeSettings,
    ) -> eyre::Result<MultiFlybySettings> {
        let mut settings = match flight_time_bounds {
            Some(bounds) => MultiFlybySettings::new(window.0, window.1, bounds),
            None => MultiFlybySettings::with_hohmann_bounds(system, start, end, flybys, window.0, window.1)?,
        };
        settings.de = de;
        Ok(settings)
    }
}
