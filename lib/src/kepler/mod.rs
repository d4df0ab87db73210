//! Two-body mechanics: conic orbits and Lambert's problem.

pub mod lambert;
pub mod orbits;
