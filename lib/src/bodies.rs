//! Definitions of celestial bodies.

use std::{collections::HashMap, fmt, sync::Arc};

use color_eyre::eyre::{self, bail, OptionExt};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::{
    kepler::orbits::{Orbit, OrbitalElements, OrbitalState},
    time::UT,
};

/// Extra clearance kept above the atmosphere or the highest terrain
/// when flying by a body (`m`).
pub const FLYBY_MARGIN: f64 = 1000.0;

/// Identifier of a body inside a [`SolarSystem`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BodyId(pub u32);

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A celestial body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub id: BodyId,
    /// Name of this body as displayed in KSP
    pub name: Arc<str>,
    /// Mean radius of the body's sphere (`m`)
    pub radius: f64,
    /// Standard gravitational parameter (`m^3/s^2`)
    pub mu: f64,
    /// Radius of this body's sphere of influence (`m`), absent for the
    /// root star.
    pub soi: Option<f64>,
    /// Orbit around the parent body, absent for the root star.
    pub orbit: Option<OrbitalElements>,
    /// The parent body of this body, if any.
    pub parent: Option<BodyId>,
    /// Bodies orbiting this body. Filled in by [`SolarSystem::new`].
    #[serde(default)]
    pub satellites: Arc<[BodyId]>,
    /// Height of the atmosphere above `radius` (`m`)
    #[serde(default)]
    pub atmosphere_height: f64,
    /// Height of the highest terrain above `radius` (`m`)
    #[serde(default)]
    pub terrain_height: f64,
}

impl Body {
    /// The lowest periapsis radius considered safe for a flyby or an
    /// Oberth burn.
    pub fn min_flyby_radius(&self) -> f64 {
        self.radius + self.atmosphere_height.max(self.terrain_height) + FLYBY_MARGIN
    }

    /// Radius of the sphere of influence, infinite for the root star.
    pub fn soi_radius(&self) -> f64 {
        self.soi.unwrap_or(f64::INFINITY)
    }
}

/// A tree of bodies rooted at a single star.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Body>", into = "Vec<Body>")]
pub struct SolarSystem {
    bodies: HashMap<BodyId, Arc<Body>>,
    /// Parent orbits resolved with the parent's `mu`.
    orbits: HashMap<BodyId, Orbit>,
    root: BodyId,
}

impl SolarSystem {
    /// Validate and build a solar system.
    ///
    /// There must be exactly one root body (no parent and no orbit),
    /// every other body's parent must resolve, and following parents
    /// must always end at the root.
    pub fn new(bodies: Vec<Body>) -> eyre::Result<Self> {
        let mut map = HashMap::with_capacity(bodies.len());
        for body in bodies {
            let id = body.id;
            if map.insert(id, body).is_some() {
                bail!("SolarSystem::new: duplicate body id {id}");
            }
        }

        let roots = map
            .values()
            .filter(|body| body.parent.is_none())
            .map(|body| body.id)
            .collect::<Vec<_>>();
        let root = match roots.as_slice() {
            [root] => *root,
            [] => bail!("SolarSystem::new: no root body"),
            _ => bail!("SolarSystem::new: multiple root bodies: {roots:?}"),
        };
        if map[&root].orbit.is_some() {
            bail!("SolarSystem::new: root body {} has an orbit", map[&root].name);
        }

        let mut orbits = HashMap::with_capacity(map.len());
        let mut satellites: HashMap<BodyId, Vec<BodyId>> = HashMap::new();
        for body in map.values() {
            let Some(parent) = body.parent else { continue };
            let parent_body = map.get(&parent).ok_or_else(|| {
                eyre::eyre!(
                    "SolarSystem::new: parent {parent} of {} does not exist",
                    body.name
                )
            })?;
            let elements = body
                .orbit
                .ok_or_else(|| eyre::eyre!("SolarSystem::new: {} has no orbit", body.name))?;
            if elements.orbiting != parent {
                bail!(
                    "SolarSystem::new: orbit of {} is around {} but its parent is {parent}",
                    body.name,
                    elements.orbiting
                );
            }
            orbits.insert(body.id, Orbit::from_elements(elements, parent_body.mu));
            satellites.entry(parent).or_default().push(body.id);
        }

        // every chain of parents has to reach the root within `len` steps
        for body in map.values() {
            let mut id = body.id;
            let mut steps = 0;
            while let Some(parent) = map[&id].parent {
                id = parent;
                steps += 1;
                if steps > map.len() {
                    bail!("SolarSystem::new: cycle through {}", body.name);
                }
            }
        }

        let bodies = map
            .into_iter()
            .map(|(id, mut body)| {
                let mut sats = satellites.remove(&id).unwrap_or_default();
                sats.sort_unstable();
                body.satellites = sats.into();
                (id, Arc::new(body))
            })
            .collect();

        Ok(Self {
            bodies,
            orbits,
            root,
        })
    }

    pub fn root(&self) -> BodyId {
        self.root
    }

    pub fn body(&self, id: BodyId) -> eyre::Result<&Arc<Body>> {
        self.bodies
            .get(&id)
            .ok_or_else(|| eyre::eyre!("no body with id {id}"))
    }

    pub fn body_by_name(&self, name: &str) -> eyre::Result<&Arc<Body>> {
        self.bodies
            .values()
            .find(|body| &*body.name == name)
            .ok_or_else(|| eyre::eyre!("no body named {name:?}"))
    }

    /// All bodies, sorted by id.
    pub fn bodies(&self) -> impl Iterator<Item = &Arc<Body>> {
        let mut bodies = self.bodies.values().collect::<Vec<_>>();
        bodies.sort_unstable_by_key(|body| body.id);
        bodies.into_iter()
    }

    /// The orbit of `id` around its parent.
    pub fn orbit_of(&self, id: BodyId) -> eyre::Result<&Orbit> {
        let name = &self.body(id)?.name;
        self.orbits
            .get(&id)
            .ok_or_else(|| eyre::eyre!("body {name} has no orbit"))
    }

    /// The chain of bodies from `id` (inclusive) up to the root
    /// (inclusive).
    pub fn ancestry(&self, id: BodyId) -> eyre::Result<Vec<BodyId>> {
        let mut chain = vec![id];
        let mut body = self.body(id)?;
        while let Some(parent) = body.parent {
            chain.push(parent);
            body = self.body(parent)?;
        }
        Ok(chain)
    }

    /// The deepest body that has both `a` and `b` in its ancestry.
    pub fn common_ancestor(&self, a: BodyId, b: BodyId) -> eyre::Result<BodyId> {
        let chain_a = self.ancestry(a)?;
        let chain_b = self.ancestry(b)?;
        chain_a
            .into_iter()
            .find(|id| chain_b.contains(id))
            .ok_or_eyre("bodies do not share a common attractor")
    }

    /// The chain of bodies from `id` (inclusive) up to `ancestor`
    /// (exclusive).
    pub fn chain_below(&self, id: BodyId, ancestor: BodyId) -> eyre::Result<Vec<BodyId>> {
        let chain = self.ancestry(id)?;
        let Some(end) = chain.iter().position(|&b| b == ancestor) else {
            bail!(
                "{} does not orbit {}",
                self.body(id)?.name,
                self.body(ancestor)?.name
            );
        };
        Ok(chain[..end].to_vec())
    }

    /// State of a body relative to its parent at `date`. The root is at
    /// rest at the origin.
    pub fn state_of(&self, id: BodyId, date: UT) -> eyre::Result<OrbitalState> {
        if id == self.root {
            return Ok(OrbitalState {
                orbiting: id,
                date,
                position: Vector3::zeros(),
                velocity: Vector3::zeros(),
            });
        }
        Ok(self.orbit_of(id)?.state_at_date(date))
    }

    /// State of a body relative to one of its ancestors at `date`.
    pub fn state_relative_to(
        &self,
        id: BodyId,
        ancestor: BodyId,
        date: UT,
    ) -> eyre::Result<OrbitalState> {
        let mut position = Vector3::zeros();
        let mut velocity = Vector3::zeros();
        for body in self.chain_below(id, ancestor)? {
            let state = self.state_of(body, date)?;
            position += state.position;
            velocity += state.velocity;
        }
        Ok(OrbitalState {
            orbiting: ancestor,
            date,
            position,
            velocity,
        })
    }
}

impl TryFrom<Vec<Body>> for SolarSystem {
    type Error = eyre::Report;

    fn try_from(bodies: Vec<Body>) -> Result<Self, Self::Error> {
        Self::new(bodies)
    }
}

impl From<SolarSystem> for Vec<Body> {
    fn from(system: SolarSystem) -> Self {
        system
            .bodies()
            .map(|body| Body::clone(body))
            .collect()
    }
}

/// The stock KSP system.
pub mod kerbol {
    use std::sync::Arc;

    use color_eyre::eyre;

    use super::{Body, BodyId, SolarSystem};
    use crate::{kepler::orbits::OrbitalElements, time::UT};

    pub const KERBOL: BodyId = BodyId(0);
    pub const KERBIN: BodyId = BodyId(1);
    pub const MUN: BodyId = BodyId(2);
    pub const MINMUS: BodyId = BodyId(3);
    pub const MOHO: BodyId = BodyId(4);
    pub const EVE: BodyId = BodyId(5);
    pub const DUNA: BodyId = BodyId(6);
    pub const IKE: BodyId = BodyId(7);
    pub const JOOL: BodyId = BodyId(8);

    struct Def {
        id: BodyId,
        name: &'static str,
        radius: f64,
        mu: f64,
        soi: f64,
        parent: BodyId,
        /// a, e, i (deg), argpe (deg), lan (deg), ma0
        elements: [f64; 6],
        atmosphere: f64,
        terrain: f64,
    }

    const DEFS: [Def; 8] = [
        Def {
            id: KERBIN,
            name: "Kerbin",
            radius: 600_000.0,
            mu: 3.531_6e12,
            soi: 84_159_286.0,
            parent: KERBOL,
            elements: [13_599_840_256.0, 0.0, 0.0, 0.0, 0.0, 3.14],
            atmosphere: 70_000.0,
            terrain: 6_764.1,
        },
        Def {
            id: MUN,
            name: "Mun",
            radius: 200_000.0,
            mu: 6.513_839_8e10,
            soi: 2_429_559.1,
            parent: KERBIN,
            elements: [12_000_000.0, 0.0, 0.0, 0.0, 0.0, 1.7],
            atmosphere: 0.0,
            terrain: 7_061.0,
        },
        Def {
            id: MINMUS,
            name: "Minmus",
            radius: 60_000.0,
            mu: 1.765_8e9,
            soi: 2_247_428.4,
            parent: KERBIN,
            elements: [47_000_000.0, 0.0, 6.0, 38.0, 78.0, 0.9],
            atmosphere: 0.0,
            terrain: 5_724.6,
        },
        Def {
            id: MOHO,
            name: "Moho",
            radius: 250_000.0,
            mu: 1.686_093_8e11,
            soi: 9_646_663.0,
            parent: KERBOL,
            elements: [5_263_138_304.0, 0.2, 7.0, 15.0, 70.0, 3.14],
            atmosphere: 0.0,
            terrain: 6_817.0,
        },
        Def {
            id: EVE,
            name: "Eve",
            radius: 700_000.0,
            mu: 8.171_730_2e12,
            soi: 85_109_365.0,
            parent: KERBOL,
            elements: [9_832_684_544.0, 0.01, 2.1, 0.0, 15.0, 3.14],
            atmosphere: 90_000.0,
            terrain: 7_526.2,
        },
        Def {
            id: DUNA,
            name: "Duna",
            radius: 320_000.0,
            mu: 3.013_632_1e11,
            soi: 47_921_949.0,
            parent: KERBOL,
            elements: [20_726_155_264.0, 0.051, 0.06, 0.0, 135.5, 3.14],
            atmosphere: 50_000.0,
            terrain: 8_264.0,
        },
        Def {
            id: IKE,
            name: "Ike",
            radius: 130_000.0,
            mu: 1.856_836_9e10,
            soi: 1_049_598.9,
            parent: DUNA,
            elements: [3_200_000.0, 0.03, 0.2, 0.0, 0.0, 1.7],
            atmosphere: 0.0,
            terrain: 12_738.0,
        },
        Def {
            id: JOOL,
            name: "Jool",
            radius: 6_000_000.0,
            mu: 2.825_28e14,
            soi: 2_455_985_200.0,
            parent: KERBOL,
            elements: [68_773_560_320.0, 0.05, 1.304, 0.0, 52.0, 0.1],
            atmosphere: 200_000.0,
            terrain: 0.0,
        },
    ];

    /// Kerbol and the planets and moons out to Jool, as of KSP 1.12.
    pub fn stock_system() -> eyre::Result<SolarSystem> {
        let mut bodies = vec![Body {
            id: KERBOL,
            name: Arc::from("Kerbol"),
            radius: 261_600_000.0,
            mu: 1.172_332_8e18,
            soi: None,
            orbit: None,
            parent: None,
            satellites: Arc::new([]),
            atmosphere_height: 600_000.0,
            terrain_height: 0.0,
        }];
        bodies.extend(DEFS.iter().map(|def| {
            let [a, e, i, argpe, lan, ma0] = def.elements;
            Body {
                id: def.id,
                name: Arc::from(def.name),
                radius: def.radius,
                mu: def.mu,
                soi: Some(def.soi),
                orbit: Some(OrbitalElements {
                    orbiting: def.parent,
                    a,
                    e,
                    i: i.to_radians(),
                    argpe: argpe.to_radians(),
                    lan: lan.to_radians(),
                    ma0,
                    epoch: UT::ZERO,
                }),
                parent: Some(def.parent),
                satellites: Arc::new([]),
                atmosphere_height: def.atmosphere,
                terrain_height: def.terrain,
            }
        }));
        SolarSystem::new(bodies)
    }
}

#[cfg(test)]
mod tests {
    use super::{kerbol::*, *};

    #[test]
    fn stock_tree() {
        let system = stock_system().unwrap();
        assert_eq!(system.root(), KERBOL);
        assert_eq!(system.ancestry(MUN).unwrap(), vec![MUN, KERBIN, KERBOL]);
        assert_eq!(system.common_ancestor(MUN, IKE).unwrap(), KERBOL);
        assert_eq!(system.common_ancestor(MUN, MINMUS).unwrap(), KERBIN);
        assert_eq!(system.common_ancestor(MUN, KERBIN).unwrap(), KERBIN);
        assert_eq!(&*system.body(KERBIN).unwrap().satellites, &[MUN, MINMUS]);
        assert_eq!(system.chain_below(MUN, KERBOL).unwrap(), vec![MUN, KERBIN]);
        assert!(system.chain_below(DUNA, KERBIN).is_err());
        assert!(system.body(BodyId(99)).is_err());
        assert_eq!(system.orbit_of(MUN).unwrap().orbiting, KERBIN);
        assert!(system.orbit_of(KERBOL).is_err());
        assert!(system.orbit_of(BodyId(99)).is_err());

        let kerbin = system.body(KERBIN).unwrap();
        assert_eq!(kerbin.min_flyby_radius(), 600_000.0 + 70_000.0 + 1000.0);
    }

    #[test]
    fn invalid_trees() {
        let system = stock_system().unwrap();
        let mut bodies: Vec<Body> = system.into();

        let mut orphan = bodies.clone();
        orphan[1].parent = Some(BodyId(42));
        assert!(SolarSystem::new(orphan).is_err());

        let mut two_roots = bodies.clone();
        two_roots[1].parent = None;
        two_roots[1].orbit = None;
        assert!(SolarSystem::new(two_roots).is_err());

        // Kerbin <-> Mun
        bodies[1].parent = Some(MUN);
        if let Some(orbit) = &mut bodies[1].orbit {
            orbit.orbiting = MUN;
        }
        assert!(SolarSystem::new(bodies).is_err());
    }

    #[test]
    fn nested_states() {
        let system = stock_system().unwrap();
        let date = UT::new_seconds(1e6);
        let mun = system.state_relative_to(MUN, KERBOL, date).unwrap();
        let kerbin = system.state_of(KERBIN, date).unwrap();
        let mun_local = system.state_of(MUN, date).unwrap();
        assert_eq!(mun.position, kerbin.position + mun_local.position);
        assert_eq!(mun.velocity, kerbin.velocity + mun_local.velocity);
        assert!((mun_local.position.norm() - 12e6).abs() < 1e-3);
    }
}
