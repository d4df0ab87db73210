use std::sync::mpsc::{Receiver, Sender};

use color_eyre::eyre;
use kertraj::{
    multiflyby::MultiFlybyCalculator,
    porkchop::PorkchopCalculator,
    trajectory::SoiPatches,
    transfer::TransferCalculator,
};
use tracing::info;

use crate::mission::{Mission, Outcome, Plan};

pub enum HReq {
    Plan(Box<Mission>),
}

pub enum HRes {
    Planned(Outcome),
}

#[allow(clippy::needless_pass_by_value)]
pub fn handler_thread(rx: Receiver<(usize, HReq)>, tx: Sender<(usize, eyre::Result<HRes>)>) {
    while let Ok((txi, req)) = rx.recv() {
        let res = (|| match req {
            HReq::Plan(mission) => {
                let system = mission.system()?;
                let (start, end) = mission.orbits(&system)?;
                let outcome = match mission.plan {
                    Plan::Transfer {
                        start_date,
                        flight_time,
                        settings,
                    } => {
                        let calc = TransferCalculator::new(system, start, end, settings)?;
                        let transfer = calc.compute(start_date, flight_time, &SoiPatches::default())?;
                        info!("unpatched transfer: {:.1} m/s", transfer.delta_v);
                        Outcome::Transfer(Box::new(calc.optimize_soi_patches(&transfer)?))
                    }
                    Plan::Porkchop(settings) => {
                        let calc = PorkchopCalculator::new(system, start, end, settings)?;
                        let porkchop = calc.compute()?;
                        let refined = match &porkchop.best_transfer {
                            Some(best) => Some(Box::new(calc.calculator().optimize_soi_patches(best)?)),
                            None => None,
                        };
                        Outcome::Porkchop(Box::new(porkchop), refined)
                    }
                    Plan::MultiFlyby {
                        flybys,
                        start_date_min,
                        start_date_max,
                        flight_time_bounds,
                        de,
                    } => {
                        let flybys = Mission::flyby_ids(&system, &flybys)?;
                        let settings = Mission::multi_flyby_settings(
                            &system,
                            &start,
                            &end,
                            &flybys,
                            (start_date_min, start_date_max),
                            flight_time_bounds,
                            de,
                        )?;
                        let calc = MultiFlybyCalculator::new(system, start, end, flybys, settings)?;
                        Outcome::MultiFlyby(Box::new(calc.optimize()?))
                    }
                };
                Ok(HRes::Planned(outcome))
            }
        })();
        let _ = tx.send((txi, res));
    }
}
