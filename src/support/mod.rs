//! Shared numeric primitives used by the catalog reader, the TNX model and
//! the associator: spherical geometry, time/aberration conversion and the
//! single least-squares solver.

pub mod linalg;
pub mod sphere;
pub mod time;
