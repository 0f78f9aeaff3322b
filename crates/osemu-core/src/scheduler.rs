//! Discrete-time multi-core scheduler.
//!
//! The [`Scheduler`] owns the cores and the ready queue.  It never owns
//! process memory: every call that touches pages borrows the
//! [`MemoryManager`] from the caller.
//!
//! # Tick order
//!
//! ```text
//! 1. reclaim   cores holding a FINISHED process: free memory, clear core
//! 2. assign    empty cores take the ready-queue head (READY -> RUNNING)
//! 3. execute   each RUNNING core: stall? skip.  bad address? violation.
//!              page 0 + instruction page resident? run one instruction.
//! 4. preempt   round robin only: quantum spent -> READY, back of the queue
//! ```
//!
//! A process that completes in step 3 keeps its core until step 1 of the
//! next tick, so `available_cores` counts such cores as free.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::instruction::{ExecError, SYMBOL_TABLE_BASE};
use crate::memory::{MemoryError, MemoryManager};
use crate::process::{Pid, Process, ProcessState, StepOutcome};

/// Every process known to a machine, keyed by pid.
pub type ProcessTable = BTreeMap<Pid, Process>;

/// Core assignment policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    /// First come, first served.  Never preempts.
    Fcfs,
    /// Preempt after `quantum` executed instructions.
    RoundRobin { quantum: u32 },
}

impl std::fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingPolicy::Fcfs => f.write_str("fcfs"),
            SchedulingPolicy::RoundRobin { quantum } => write!(f, "rr (quantum {})", quantum),
        }
    }
}

/// Configuration for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of emulated cores.
    pub num_cores: usize,
    pub policy: SchedulingPolicy,
    /// Ticks a core stalls after each executed instruction.
    pub delay_per_exec: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_cores: 4,
            policy: SchedulingPolicy::RoundRobin { quantum: 5 },
            delay_per_exec: 0,
        }
    }
}

/// One emulated core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Core {
    occupant: Option<Pid>,
    /// Instructions left in the current round-robin turn.
    remaining_quantum: u32,
    /// Delay ticks left before the next instruction.
    stall: u32,
}

impl Core {
    pub fn occupant(&self) -> Option<Pid> {
        self.occupant
    }

    pub fn remaining_quantum(&self) -> u32 {
        self.remaining_quantum
    }

    pub fn stall(&self) -> u32 {
        self.stall
    }

    fn clear(&mut self) {
        *self = Core::default();
    }
}

/// What happened during one [`Scheduler::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Instructions executed across all cores.
    pub executed: usize,
    /// Cores skipped because a page could not be made resident.
    pub page_faults: usize,
    /// Cores skipped for execution delay.
    pub stalled: usize,
    pub assigned: Vec<Pid>,
    pub preempted: Vec<Pid>,
    /// Processes that ran their last instruction this tick.
    pub finished: Vec<Pid>,
    pub violations: Vec<Pid>,
    /// Processes stopped by a non-address fatal error.
    pub faulted: Vec<Pid>,
}

/// Cumulative core utilisation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuStats {
    pub ticks: u64,
    /// Sum over ticks of cores holding a RUNNING process.
    pub busy_core_ticks: u64,
    pub idle_core_ticks: u64,
}

impl CpuStats {
    /// Fraction of core-ticks spent busy, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        let total = self.busy_core_ticks + self.idle_core_ticks;
        if total == 0 {
            0.0
        } else {
            self.busy_core_ticks as f64 / total as f64
        }
    }
}

/// Multi-core scheduler with a FIFO ready queue.
#[derive(Debug, Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    cores: Vec<Core>,
    ready: VecDeque<Pid>,
    stats: CpuStats,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let num_cores = config.num_cores.max(1);
        Self {
            cores: vec![Core::default(); num_cores],
            ready: VecDeque::new(),
            stats: CpuStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[inline]
    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    /// Snapshot of the ready queue, head first.
    pub fn ready_queue(&self) -> Vec<Pid> {
        self.ready.iter().copied().collect()
    }

    pub fn stats(&self) -> CpuStats {
        self.stats
    }

    /// Admit a process: register its footprint and queue it.
    ///
    /// On failure nothing is queued and the memory error is returned.
    pub fn add_process(
        &mut self,
        process: &mut Process,
        memory: &mut MemoryManager,
    ) -> Result<(), MemoryError> {
        let pages = memory.pages_for_bytes(process.memory_bytes());
        memory.register_process(process.pid(), pages)?;
        process.state = ProcessState::Ready;
        self.ready.push_back(process.pid());
        debug!("queued pid {} ({} pages)", process.pid(), pages);
        Ok(())
    }

    /// Cores that are empty or hold a FINISHED process.
    pub fn available_cores(&self, processes: &ProcessTable) -> usize {
        self.cores
            .iter()
            .filter(|core| match core.occupant {
                None => true,
                Some(pid) => processes.get(&pid).map_or(true, Process::is_finished),
            })
            .count()
    }

    /// No queued work and no core running anything.
    pub fn is_idle(&self, processes: &ProcessTable) -> bool {
        self.ready.is_empty() && self.available_cores(processes) == self.cores.len()
    }

    /// Advance every core by one tick.
    pub fn tick(
        &mut self,
        processes: &mut ProcessTable,
        memory: &mut MemoryManager,
        now: u64,
    ) -> TickReport {
        let Scheduler {
            config,
            cores,
            ready,
            stats,
        } = self;
        let mut report = TickReport::default();

        // 1. Reclaim cores whose process finished last tick.
        for core in cores.iter_mut() {
            if let Some(pid) = core.occupant {
                if processes.get(&pid).map_or(true, Process::is_finished) {
                    memory.deallocate_process(pid);
                    core.clear();
                }
            }
        }

        // 2. Fill empty cores from the head of the ready queue.
        for (id, core) in cores.iter_mut().enumerate() {
            if core.occupant.is_some() {
                continue;
            }
            while let Some(pid) = ready.pop_front() {
                let Some(process) = processes.get_mut(&pid) else {
                    continue;
                };
                if process.is_finished() {
                    continue;
                }
                process.state = ProcessState::Running;
                process.core = Some(id);
                core.occupant = Some(pid);
                core.stall = 0;
                core.remaining_quantum = match config.policy {
                    SchedulingPolicy::RoundRobin { quantum } => quantum.max(1),
                    SchedulingPolicy::Fcfs => 0,
                };
                report.assigned.push(pid);
                debug!("core {} <- pid {}", id, pid);
                break;
            }
        }

        // 3 + 4. Execute one instruction per running core, then preempt.
        let mut busy = 0u64;
        for (id, core) in cores.iter_mut().enumerate() {
            let Some(pid) = core.occupant else { continue };
            let Some(process) = processes.get_mut(&pid) else {
                core.clear();
                continue;
            };
            if process.state != ProcessState::Running {
                continue;
            }
            busy += 1;

            if core.stall > 0 {
                core.stall -= 1;
                report.stalled += 1;
                continue;
            }

            let address = process.current_instruction().and_then(|i| i.virtual_address());
            if let Some(address) = address {
                if !memory.is_address_valid(pid, address) {
                    violate(process, core, memory, address, now);
                    report.violations.push(pid);
                    continue;
                }
            }

            if let Err(e) = load_pages(memory, pid, address) {
                debug!("core {} pid {}: page fault ({})", id, pid, e);
                report.page_faults += 1;
                continue;
            }

            match process.execute_next_instruction(id, memory, now) {
                Ok(StepOutcome::Completed) => {
                    report.executed += 1;
                    report.finished.push(pid);
                    info!("pid {} ({}) finished at tick {}", pid, process.name(), now);
                    continue;
                }
                Ok(StepOutcome::Executed) => report.executed += 1,
                Ok(StepOutcome::AlreadyFinished) => continue,
                Err(e) if e.is_retryable() => {
                    debug!("core {} pid {}: retry ({})", id, pid, e);
                    report.page_faults += 1;
                    continue;
                }
                Err(ExecError::Memory(MemoryError::AddressOutOfRange { address, .. })) => {
                    violate(process, core, memory, address, now);
                    report.violations.push(pid);
                    continue;
                }
                Err(e) => {
                    warn!("pid {} ({}) stopped: {}", pid, process.name(), e);
                    process.terminate_with_fault(e.to_string(), now);
                    memory.deallocate_process(pid);
                    core.clear();
                    report.faulted.push(pid);
                    continue;
                }
            }

            core.stall = config.delay_per_exec;

            if let SchedulingPolicy::RoundRobin { .. } = config.policy {
                core.remaining_quantum = core.remaining_quantum.saturating_sub(1);
                if core.remaining_quantum == 0 {
                    process.state = ProcessState::Ready;
                    ready.push_back(pid);
                    core.clear();
                    report.preempted.push(pid);
                    debug!("core {} preempted pid {}", id, pid);
                }
            }
        }

        stats.ticks += 1;
        stats.busy_core_ticks += busy;
        stats.idle_core_ticks += cores.len() as u64 - busy;
        report
    }

    /// Cross-check cores, ready queue and process states.
    pub fn check_invariants(&self, processes: &ProcessTable) -> Result<(), String> {
        let mut seen = BTreeSet::new();
        for (id, core) in self.cores.iter().enumerate() {
            let Some(pid) = core.occupant else { continue };
            if !seen.insert(pid) {
                return Err(format!("pid {} occupies more than one core", pid));
            }
            match processes.get(&pid).map(Process::state) {
                Some(ProcessState::Running) | Some(ProcessState::Finished) => {}
                Some(state) => {
                    return Err(format!("core {} holds pid {} in state {}", id, pid, state))
                }
                None => return Err(format!("core {} holds unknown pid {}", id, pid)),
            }
        }
        for &pid in &self.ready {
            if seen.contains(&pid) {
                return Err(format!("pid {} is both queued and on a core", pid));
            }
            if processes.get(&pid).map(Process::state) != Some(ProcessState::Ready) {
                return Err(format!("queued pid {} is not READY", pid));
            }
        }
        Ok(())
    }
}

fn violate(process: &mut Process, core: &mut Core, memory: &mut MemoryManager, address: u32, now: u64) {
    info!(
        "pid {} ({}) violation at {:#x}, tick {}",
        process.pid(),
        process.name(),
        address,
        now
    );
    process.terminate_by_violation(address, now);
    memory.deallocate_process(process.pid());
    core.clear();
}

/// Make the symbol-table page and the instruction's page resident.
fn load_pages(memory: &mut MemoryManager, pid: Pid, address: Option<u32>) -> Result<(), MemoryError> {
    memory.ensure_page_loaded(pid, SYMBOL_TABLE_BASE)?;
    if let Some(address) = address {
        memory.ensure_page_loaded(pid, address)?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
