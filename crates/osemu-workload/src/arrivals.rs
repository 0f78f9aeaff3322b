//! Periodic process arrivals.
//!
//! An [`ArrivalSource`] is a thread that wakes once per period, draws a
//! program from its [`ProgramGenerator`] and sends it to the runtime as a
//! detached submission named `p<N>`.  It never touches the machine
//! directly.
//!
//! [`TickArrivals`] is the single-threaded counterpart keyed on the
//! simulated clock, for headless and manually stepped runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Sender};
use log::{debug, info};
use osemu_core::{RuntimeError, RuntimeHandle};

use crate::generator::{GeneratedProgram, ProgramGenerator};

/// Names arrivals `p1`, `p2`, ... across restarts of the source.
#[derive(Debug, Clone, Default)]
pub struct NameCounter(Arc<AtomicU64>);

impl NameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unused `p<N>` name.
    pub fn next_name(&self) -> String {
        format!("p{}", self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// One arrival every `every` ticks of the simulated clock.
#[derive(Debug, Clone)]
pub struct TickArrivals {
    generator: ProgramGenerator,
    names: NameCounter,
    every: u64,
}

impl TickArrivals {
    pub fn new(generator: ProgramGenerator, names: NameCounter, every: u64) -> Self {
        Self {
            generator,
            names,
            every: every.max(1),
        }
    }

    /// The arrival due before the tick that starts at `clock`, if any.
    pub fn poll(&mut self, clock: u64) -> Option<(String, GeneratedProgram)> {
        if clock % self.every != 0 {
            return None;
        }
        Some((self.names.next_name(), self.generator.next_program()))
    }

    pub fn into_generator(self) -> ProgramGenerator {
        self.generator
    }
}

/// Background generator of submissions.
pub struct ArrivalSource {
    stop: Option<Sender<()>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<ProgramGenerator>>,
}

impl ArrivalSource {
    /// Start sending one generated process per `period`.  The generator is
    /// handed back by [`stop`](Self::stop) so a later restart continues the
    /// same stream.
    pub fn start(
        handle: RuntimeHandle,
        mut generator: ProgramGenerator,
        names: NameCounter,
        period: Duration,
    ) -> Result<Self, RuntimeError> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let ticks = crossbeam_channel::tick(period);

        let thread = thread::Builder::new()
            .name("osemu-arrivals".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticks) -> _ => {
                            let program = generator.next_program();
                            let name = names.next_name();
                            debug!(
                                "arrival {} ({} instructions, {} bytes)",
                                name,
                                program.instructions.len(),
                                program.memory_bytes
                            );
                            if handle
                                .submit_detached(name, program.instructions, program.memory_bytes)
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
                flag.store(false, Ordering::Relaxed);
                generator
            })
            .map_err(RuntimeError::Spawn)?;

        info!("arrivals started ({:?} apart)", period);
        Ok(Self {
            stop: Some(stop_tx),
            running,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop generating and join the thread.  Processes already submitted
    /// keep running.
    pub fn stop(mut self) -> Option<ProgramGenerator> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<ProgramGenerator> {
        self.stop.take();
        let generator = self.thread.take()?.join().ok();
        info!("arrivals stopped");
        generator
    }
}

impl Drop for ArrivalSource {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}
