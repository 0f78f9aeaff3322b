//! Synthetic workloads for osemu.
//!
//! - [`generator`]: seeded, reproducible program synthesis
//! - [`arrivals`]: background thread that submits generated programs
//!   to a running machine at a fixed cadence

pub mod arrivals;
pub mod generator;

pub use arrivals::{ArrivalSource, NameCounter, TickArrivals};
pub use generator::{GeneratedProgram, GeneratorConfig, ProgramGenerator, ProgramKind};
