//! Headless, single-threaded runs.
//!
//! No runtime thread and no wall clock: the machine is ticked in a plain
//! loop and generated arrivals are keyed on the simulated clock, so a
//! given configuration always produces the same final state.

use log::info;
use osemu_core::{Machine, MemoryError};
use osemu_workload::{NameCounter, ProgramGenerator, TickArrivals};

use crate::config::SystemConfig;

/// Run `ticks` ticks with one generated arrival every
/// `batch-process-freq` ticks.
pub fn simulate(config: &SystemConfig, ticks: u64) -> Result<Machine, MemoryError> {
    let mut machine = Machine::new(config.machine_config())?;
    let mut arrivals = TickArrivals::new(
        ProgramGenerator::new(config.generator_config()),
        NameCounter::new(),
        config.batch_process_freq,
    );

    for _ in 0..ticks {
        if let Some((name, program)) = arrivals.poll(machine.clock()) {
            // Rejections are logged by the machine.
            let _ = machine.submit(name, program.instructions, program.memory_bytes);
        }
        machine.tick();
    }

    let usage = machine.core_usage();
    info!(
        "simulated {} ticks: {} processes, {}/{} cores busy",
        machine.clock(),
        machine.processes().count(),
        usage.used,
        usage.total
    );
    Ok(machine)
}
