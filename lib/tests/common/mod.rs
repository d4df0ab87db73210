use std::sync::Arc;

use kertraj::{
    bodies::{kerbol, BodyId, SolarSystem},
    kepler::orbits::{Orbit, OrbitalElements},
};

pub fn stock() -> Arc<SolarSystem> {
    Arc::new(kerbol::stock_system().expect("stock system is valid"))
}

/// Circular equatorial orbit `altitude` meters above `body`.
pub fn circular(system: &SolarSystem, body: BodyId, altitude: f64) -> Orbit {
    let b = system.body(body).expect("body exists");
    Orbit::from_elements(OrbitalElements::circular(body, b.radius + altitude), b.mu)
}
