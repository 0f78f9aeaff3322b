//! The authoritative machine loop and its command channel.
//!
//! Exactly one thread owns the [`Machine`].  Everything else (the console,
//! the [`Ticker`], arrival sources) holds a cloneable [`RuntimeHandle`] and
//! only ever sends [`Command`]s:
//!
//! ```text
//!  console ─┐
//!  ticker  ─┼──► crossbeam channel ──► osemu-runtime thread ──► Machine
//!  arrivals ┘                            (submit / tick / query)
//! ```
//!
//! Commands are applied strictly in arrival order, so a submission is
//! enqueued exactly once and a query never observes a half-finished tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use log::{debug, info};
use thiserror::Error;

use crate::instruction::Instruction;
use crate::machine::{Machine, SubmitError};
use crate::process::Pid;
use crate::scheduler::TickReport;

/// Errors talking to the runtime thread.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime loop is not running")]
    Disconnected,

    #[error("runtime thread panicked")]
    Panicked,

    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// A read-only closure run inside the loop.
pub type Query = Box<dyn FnOnce(&Machine) + Send>;

/// A request to the runtime loop.
pub enum Command {
    Submit {
        name: String,
        program: Vec<Instruction>,
        memory_bytes: usize,
        reply: Option<Sender<Result<Pid, SubmitError>>>,
    },
    Tick {
        reply: Sender<TickReport>,
    },
    Query(Query),
    Shutdown,
}

// ═══════════════════════════════════════════════════════════════════════
//  Runtime
// ═══════════════════════════════════════════════════════════════════════

/// Owner of the runtime thread.
pub struct Runtime {
    tx: Sender<Command>,
    thread: Option<JoinHandle<Machine>>,
}

impl Runtime {
    /// Move `machine` onto a fresh loop thread.
    pub fn spawn(machine: Machine) -> Result<Self, RuntimeError> {
        let (tx, rx) = unbounded();
        let thread = thread::Builder::new()
            .name("osemu-runtime".into())
            .spawn(move || run_loop(machine, rx))
            .map_err(RuntimeError::Spawn)?;
        info!("runtime started");
        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            tx: self.tx.clone(),
        }
    }

    /// Stop the loop after the commands already queued and hand the
    /// machine back.
    pub fn shutdown(mut self) -> Result<Machine, RuntimeError> {
        let _ = self.tx.send(Command::Shutdown);
        let thread = self.thread.take().ok_or(RuntimeError::Disconnected)?;
        let machine = thread.join().map_err(|_| RuntimeError::Panicked)?;
        info!("runtime stopped at tick {}", machine.clock());
        Ok(machine)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.tx.send(Command::Shutdown);
            let _ = thread.join();
        }
    }
}

fn run_loop(mut machine: Machine, rx: Receiver<Command>) -> Machine {
    for command in rx.iter() {
        match command {
            Command::Submit {
                name,
                program,
                memory_bytes,
                reply,
            } => {
                let result = machine.submit(name, program, memory_bytes);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::Tick { reply } => {
                let _ = reply.send(machine.tick());
            }
            Command::Query(query) => query(&machine),
            Command::Shutdown => break,
        }
    }
    machine
}

// ═══════════════════════════════════════════════════════════════════════
//  Handle
// ═══════════════════════════════════════════════════════════════════════

/// Cloneable sender side of the runtime.
#[derive(Clone)]
pub struct RuntimeHandle {
    tx: Sender<Command>,
}

impl RuntimeHandle {
    fn send(&self, command: Command) -> Result<(), RuntimeError> {
        self.tx.send(command).map_err(|_| RuntimeError::Disconnected)
    }

    /// Submit and wait for the admission result.
    pub fn submit(
        &self,
        name: impl Into<String>,
        program: Vec<Instruction>,
        memory_bytes: usize,
    ) -> Result<Pid, RuntimeError> {
        let (reply, rx) = bounded(1);
        self.send(Command::Submit {
            name: name.into(),
            program,
            memory_bytes,
            reply: Some(reply),
        })?;
        Ok(rx.recv().map_err(|_| RuntimeError::Disconnected)??)
    }

    /// Submit without waiting; rejections are only logged.
    pub fn submit_detached(
        &self,
        name: impl Into<String>,
        program: Vec<Instruction>,
        memory_bytes: usize,
    ) -> Result<(), RuntimeError> {
        self.send(Command::Submit {
            name: name.into(),
            program,
            memory_bytes,
            reply: None,
        })
    }

    /// Run one tick and wait for its report.
    pub fn tick(&self) -> Result<TickReport, RuntimeError> {
        let (reply, rx) = bounded(1);
        self.send(Command::Tick { reply })?;
        rx.recv().map_err(|_| RuntimeError::Disconnected)
    }

    /// Run `n` ticks back to back.
    pub fn step(&self, n: u64) -> Result<(), RuntimeError> {
        for _ in 0..n {
            self.tick()?;
        }
        Ok(())
    }

    /// Evaluate `f` against the machine between ticks.
    pub fn query<R, F>(&self, f: F) -> Result<R, RuntimeError>
    where
        R: Send + 'static,
        F: FnOnce(&Machine) -> R + Send + 'static,
    {
        let (reply, rx) = bounded(1);
        self.send(Command::Query(Box::new(move |machine: &Machine| {
            let _ = reply.send(f(machine));
        })))?;
        rx.recv().map_err(|_| RuntimeError::Disconnected)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Ticker
// ═══════════════════════════════════════════════════════════════════════

/// Runs one tick per period until stopped.
///
/// Each tick waits for the loop's reply before the next period is
/// considered, so at most one tick is ever queued behind other commands.
/// Periods that elapse while a tick is in flight are dropped, not banked.
pub struct Ticker {
    stop: Option<Sender<()>>,
    stopping: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn start(handle: RuntimeHandle, period: Duration) -> Result<Self, RuntimeError> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let stopping = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));
        let (halt, flag) = (Arc::clone(&stopping), Arc::clone(&paused));
        let ticks = crossbeam_channel::tick(period);

        let thread = thread::Builder::new()
            .name("osemu-ticker".into())
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticks) -> _ => {
                        // `select!` may pick a ready tick over a closed stop
                        // channel; the flag settles it.
                        if halt.load(Ordering::Acquire) {
                            break;
                        }
                        if flag.load(Ordering::Relaxed) {
                            continue;
                        }
                        if handle.tick().is_err() {
                            debug!("ticker: runtime gone");
                            break;
                        }
                    }
                }
            })
            .map_err(RuntimeError::Spawn)?;

        info!("ticker started ({:?} per tick)", period);
        Ok(Self {
            stop: Some(stop_tx),
            stopping,
            paused,
            thread: Some(thread),
        })
    }

    /// Hold ticks without stopping the thread.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Stop ticking and join the thread.  A tick already in flight is
    /// applied before this returns; none is applied after.
    pub fn stop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        // Dropping the sender disconnects the stop channel.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("ticker stopped");
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineConfig;
    use crate::memory::MemoryConfig;
    use crate::scheduler::{SchedulerConfig, SchedulingPolicy};

    fn runtime() -> Runtime {
        let machine = Machine::new(MachineConfig {
            memory: MemoryConfig {
                total_memory: 1024,
                frame_size: 64,
                max_memory_per_process: 256,
                instruction_size: 4,
            },
            scheduler: SchedulerConfig {
                num_cores: 2,
                policy: SchedulingPolicy::Fcfs,
                delay_per_exec: 0,
            },
        })
        .unwrap();
        Runtime::spawn(machine).unwrap()
    }

    #[test]
    fn submit_tick_and_query_are_serialized() {
        let rt = runtime();
        let h = rt.handle();
        let pid = h.submit("a", vec![Instruction::print("hi")], 64).unwrap();
        let report = h.tick().unwrap();
        assert_eq!(report.finished, vec![pid]);

        let log = h
            .query(move |m| m.process(pid).map(|p| p.log().to_vec()))
            .unwrap()
            .unwrap();
        assert_eq!(log, vec!["Core 0 | a: hi [tick 1]".to_string()]);

        let machine = rt.shutdown().unwrap();
        assert_eq!(machine.clock(), 1);
    }

    #[test]
    fn rejected_submission_reaches_the_caller() {
        let rt = runtime();
        let h = rt.handle();
        h.submit("a", vec![Instruction::print("x")], 64).unwrap();
        let err = h.submit("a", vec![Instruction::print("x")], 64).unwrap_err();
        assert!(matches!(err, RuntimeError::Submit(SubmitError::DuplicateName(_))));
    }

    #[test]
    fn handle_reports_disconnect_after_shutdown() {
        let rt = runtime();
        let h = rt.handle();
        rt.shutdown().unwrap();
        assert!(matches!(h.tick(), Err(RuntimeError::Disconnected)));
    }

    #[test]
    fn ticker_drives_the_clock_and_stops() {
        let rt = runtime();
        let h = rt.handle();
        let mut ticker = Ticker::start(h.clone(), Duration::from_millis(1)).unwrap();
        while h.query(|m| m.clock()).unwrap() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        ticker.stop();
        let stopped_at = h.query(|m| m.clock()).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(h.query(|m| m.clock()).unwrap(), stopped_at);
    }

    #[test]
    fn stopping_behind_a_busy_loop_applies_at_most_one_more_tick() {
        let rt = runtime();
        let h = rt.handle();
        let mut ticker = Ticker::start(h.clone(), Duration::from_millis(1)).unwrap();

        // Hold the loop inside a query while the ticker keeps firing.
        let (release_tx, release_rx) = bounded::<()>(0);
        let (seen_tx, seen_rx) = bounded(1);
        let blocker = {
            let h = h.clone();
            thread::spawn(move || {
                h.query(move |m| {
                    let _ = seen_tx.send(m.clock());
                    let _ = release_rx.recv();
                })
            })
        };
        let blocked_at = seen_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));

        // `stop` joins the ticker, which may be waiting on its tick, so it
        // has to run off this thread until the loop is released.
        let stopper = thread::spawn(move || ticker.stop());
        thread::sleep(Duration::from_millis(10));
        release_tx.send(()).unwrap();
        stopper.join().unwrap();
        blocker.join().unwrap().unwrap();

        let after = h.query(|m| m.clock()).unwrap();
        assert!(
            after <= blocked_at + 1,
            "clock {} ran past {} + 1 after stop",
            after,
            blocked_at
        );
        thread::sleep(Duration::from_millis(20));
        assert_eq!(h.query(|m| m.clock()).unwrap(), after);
    }

    #[test]
    fn paused_ticker_holds_the_clock() {
        let rt = runtime();
        let h = rt.handle();
        let ticker = Ticker::start(h.clone(), Duration::from_millis(1)).unwrap();
        ticker.pause();
        assert!(ticker.is_paused());
        // Let any tick sent before the pause land.
        thread::sleep(Duration::from_millis(10));
        let held = h.query(|m| m.clock()).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(h.query(|m| m.clock()).unwrap(), held);
    }
}
