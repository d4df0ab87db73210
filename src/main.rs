#![warn(clippy::unwrap_used, clippy::pedantic)]
#![allow(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::similar_names,
    clippy::doc_markdown
)]
use std::{sync::mpsc, thread, time::Instant};

use backend::{handler_thread, HReq, HRes};
use color_eyre::eyre::{self, bail};
use itertools::Itertools;
use kertraj::{maneuver::Maneuver, transfer::Transfer};
use mission::{Mission, Outcome};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod backend;
mod mission;

fn log_maneuvers(maneuvers: &[Maneuver]) {
    for m in maneuvers {
        let dv = m.deltav_frenet();
        info!(
            "{}: {} ({:.1} m/s; prograde {:.1}, normal {:.1}, radial {:.1})",
            m.pre.date, m.context, m.deltav_mag, dv.x, dv.y, dv.z
        );
    }
}

fn log_transfer(transfer: &Transfer) {
    if !transfer.is_feasible() {
        warn!("no transfer leaving at {}", transfer.start_date);
        return;
    }
    log_maneuvers(&transfer.maneuvers);
    info!(
        "departure {}, arrival {}: {:.1} m/s, patch error {:.0} m / {:.1} s",
        transfer.start_date,
        transfer.arrival_date(),
        transfer.delta_v,
        transfer.patch_position_error,
        transfer.patch_time_error
    );
}

fn log_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Transfer(transfer) => log_transfer(transfer),
        Outcome::Porkchop(porkchop, refined) => {
            if let Some((min, max)) = porkchop.delta_v_range {
                info!(
                    "porkchop {}x{}: {min:.1} to {max:.1} m/s",
                    porkchop.start_dates.len(),
                    porkchop.flight_times.len()
                );
            }
            match refined {
                Some(transfer) => log_transfer(transfer),
                None => warn!("no feasible cell in the porkchop"),
            }
        }
        Outcome::MultiFlyby(mission) => {
            let names = mission
                .flyby_bodies
                .iter()
                .filter_map(|&id| mission.system.body(id).ok())
                .map(|body| &*body.name)
                .join(" -> ");
            info!("flyby sequence: {names}");
            log_maneuvers(&mission.maneuvers);
            info!(
                "{:.1} m/s, flyby error {:.2e} rad, patch error {:.0} m / {:.1} s",
                mission.delta_v,
                mission.flyby_error,
                mission.patch_position_error,
                mission.patch_time_error
            );
        }
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let mission = match args.next() {
        Some(path) => ron::from_str(&std::fs::read_to_string(path)?)?,
        None => {
            info!("no mission file given, planning the Kerbin to Duna demo");
            Mission::demo()
        }
    };
    let output = args.next();

    let (main_tx, handler_rx) = mpsc::channel();
    let (handler_tx, main_rx) = mpsc::channel();
    let handler = thread::spawn(|| handler_thread(handler_rx, handler_tx));

    let start = Instant::now();
    main_tx.send((0, HReq::Plan(Box::new(mission))))?;
    let (_, res) = main_rx.recv()?;
    drop(main_tx);
    let _ = handler.join();

    let HRes::Planned(outcome) = res?;
    info!("planned in {:.1?}", start.elapsed());
    log_outcome(&outcome);

    if let Some(path) = output {
        if path.is_empty() {
            bail!("empty output path");
        }
        std::fs::write(
            path,
            ron::ser::to_string_pretty(&outcome, ron::ser::PrettyConfig::default())?,
        )?;
    }
    Ok(())
}
