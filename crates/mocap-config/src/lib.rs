//! Runtime configuration shared across the mocap-vae workspace.

pub mod determinism;
pub mod tracing;

pub use determinism::{rng_from_label, rng_from_optional, DeterminismConfig};
pub use tracing::{init_tracing, InitError};
