//! The emulated machine: one owner for memory, scheduler and processes.
//!
//! [`Machine`] is the only holder of the [`MemoryManager`]; it lends
//! `&mut` borrows to the [`Scheduler`] and, through it, to process
//! execution.  The simulated clock lives here too and is the timestamp of
//! every log line and lifecycle record.

use std::collections::BTreeMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instruction::Instruction;
use crate::memory::{MemoryConfig, MemoryError, MemoryManager, MemorySnapshot, PageMapping};
use crate::process::{Pid, Process, ProcessInfo};
use crate::scheduler::{CpuStats, ProcessTable, Scheduler, SchedulerConfig, TickReport};

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

/// Everything needed to build a [`Machine`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub memory: MemoryConfig,
    pub scheduler: SchedulerConfig,
}

/// Why a submission was not admitted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("a process named `{0}` already exists")]
    DuplicateName(String),

    #[error("process `{0}` has an empty program")]
    EmptyProgram(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Core occupancy counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoreUsage {
    pub total: usize,
    pub used: usize,
    pub available: usize,
}

impl CoreUsage {
    /// Percentage of cores in use, 0..=100.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 * 100.0 / self.total as f64
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Machine
// ═══════════════════════════════════════════════════════════════════════

/// Memory manager, scheduler, process table and clock.
#[derive(Debug)]
pub struct Machine {
    memory: MemoryManager,
    scheduler: Scheduler,
    processes: ProcessTable,
    names: BTreeMap<String, Pid>,
    next_pid: u32,
    clock: u64,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, MemoryError> {
        let memory = MemoryManager::new(config.memory)?;
        info!(
            "machine: {} cores, {} frames of {} bytes, {}",
            config.scheduler.num_cores.max(1),
            memory.total_frames(),
            memory.frame_size(),
            config.scheduler.policy
        );
        Ok(Self {
            memory,
            scheduler: Scheduler::new(config.scheduler),
            processes: ProcessTable::new(),
            names: BTreeMap::new(),
            next_pid: 1,
            clock: 0,
        })
    }

    /// Admit a new process.  A pid is consumed only on success.
    pub fn submit(
        &mut self,
        name: impl Into<String>,
        program: Vec<Instruction>,
        memory_bytes: usize,
    ) -> Result<Pid, SubmitError> {
        let name = name.into();
        if self.names.contains_key(&name) {
            warn!("rejected `{}`: duplicate name", name);
            return Err(SubmitError::DuplicateName(name));
        }
        if program.is_empty() {
            warn!("rejected `{}`: empty program", name);
            return Err(SubmitError::EmptyProgram(name));
        }

        let pid = Pid(self.next_pid);
        let mut process = Process::new(pid, name.clone(), program, memory_bytes, self.clock);
        if let Err(e) = self.scheduler.add_process(&mut process, &mut self.memory) {
            warn!("rejected `{}`: {}", name, e);
            return Err(e.into());
        }

        self.next_pid += 1;
        info!(
            "admitted pid {} `{}` ({} instructions, {} bytes)",
            pid,
            name,
            process.instruction_count(),
            memory_bytes
        );
        self.names.insert(name, pid);
        self.processes.insert(pid, process);
        Ok(pid)
    }

    /// Advance the clock and run one scheduler tick.
    pub fn tick(&mut self) -> TickReport {
        self.clock += 1;
        let report = self
            .scheduler
            .tick(&mut self.processes, &mut self.memory, self.clock);

        if cfg!(debug_assertions) {
            if let Err(e) = self.check_invariants() {
                warn!("invariant violated after tick {}: {}", self.clock, e);
            }
        }
        report
    }

    /// Tick until nothing is queued or running, at most `max_ticks` times.
    /// Returns the number of ticks run.
    pub fn run_until_idle(&mut self, max_ticks: u64) -> u64 {
        let mut ran = 0;
        while ran < max_ticks && !self.is_idle() {
            self.tick();
            ran += 1;
        }
        ran
    }

    #[inline]
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn process_by_name(&self, name: &str) -> Option<&Process> {
        self.names.get(name).and_then(|pid| self.processes.get(pid))
    }

    /// Every process, in pid order.
    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    pub fn process_infos(&self) -> Vec<ProcessInfo> {
        self.processes.values().map(Process::info).collect()
    }

    pub fn core_usage(&self) -> CoreUsage {
        let total = self.scheduler.num_cores();
        let available = self.scheduler.available_cores(&self.processes);
        CoreUsage {
            total,
            used: total - available,
            available,
        }
    }

    pub fn cpu_stats(&self) -> CpuStats {
        self.scheduler.stats()
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn memory_snapshot(&self) -> MemorySnapshot {
        self.memory.snapshot()
    }

    pub fn page_table(&self, pid: Pid) -> Option<Vec<PageMapping>> {
        self.memory.page_table(pid)
    }

    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle(&self.processes)
    }

    /// Memory and scheduler self-checks combined.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.memory.check_invariants()?;
        self.scheduler.check_invariants(&self.processes)?;
        for process in self.processes.values() {
            let Some(pages) = self.memory.registered_pages(process.pid()) else {
                continue;
            };
            if pages > self.memory.pages_for_bytes(process.memory_bytes()) {
                return Err(format!(
                    "pid {} registered {} pages for {} bytes",
                    process.pid(),
                    pages,
                    process.memory_bytes()
                ));
            }
            if process.terminated_due_to_violation() && !process.is_finished() {
                return Err(format!("pid {} has a violation but is not FINISHED", process.pid()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;
    use crate::scheduler::SchedulingPolicy;

    fn machine(cores: usize, policy: SchedulingPolicy) -> Machine {
        Machine::new(MachineConfig {
            memory: MemoryConfig {
                total_memory: 512,
                frame_size: 64,
                max_memory_per_process: 256,
                instruction_size: 4,
            },
            scheduler: SchedulerConfig {
                num_cores: cores,
                policy,
                delay_per_exec: 0,
            },
        })
        .unwrap()
    }

    #[test]
    fn pids_are_allocated_only_on_success() {
        let mut m = machine(1, SchedulingPolicy::Fcfs);
        let a = m.submit("a", vec![Instruction::print("x")], 64).unwrap();
        assert_eq!(a, Pid(1));

        assert_eq!(
            m.submit("a", vec![Instruction::print("x")], 64),
            Err(SubmitError::DuplicateName("a".into()))
        );
        assert_eq!(
            m.submit("b", vec![], 64),
            Err(SubmitError::EmptyProgram("b".into()))
        );
        assert!(matches!(
            m.submit("c", vec![Instruction::print("x")], 4096),
            Err(SubmitError::Memory(MemoryError::MemoryCapExceeded { .. }))
        ));

        let d = m.submit("d", vec![Instruction::print("x")], 64).unwrap();
        assert_eq!(d, Pid(2));
        assert!(m.process_by_name("c").is_none());
    }

    #[test]
    fn zero_frame_machine_stalls_without_finishing() {
        let mut m = Machine::new(MachineConfig {
            memory: MemoryConfig {
                total_memory: 0,
                frame_size: 64,
                max_memory_per_process: 256,
                instruction_size: 4,
            },
            scheduler: SchedulerConfig::default(),
        })
        .unwrap();
        let pid = m.submit("stuck", vec![Instruction::print("x")], 64).unwrap();
        for _ in 0..5 {
            let report = m.tick();
            assert_eq!(report.page_faults, 1);
            let p = m.process(pid).unwrap();
            assert_eq!(p.state(), ProcessState::Running);
            assert_eq!(p.pc(), 0);
        }
        assert_eq!(m.clock(), 5);
    }

    #[test]
    fn clock_stamps_logs_and_lifecycle() {
        let mut m = machine(1, SchedulingPolicy::Fcfs);
        m.tick();
        let pid = m
            .submit("late", vec![Instruction::print("hi"), Instruction::print("bye")], 64)
            .unwrap();
        assert_eq!(m.process(pid).unwrap().arrived_at(), 1);

        assert_eq!(m.run_until_idle(10), 2);
        let p = m.process(pid).unwrap();
        assert_eq!(p.log(), ["Core 0 | late: hi [tick 2]", "Core 0 | late: bye [tick 3]"]);
        assert_eq!(p.finished_at(), Some(3));
        assert_eq!(m.clock(), 3);

        // The finished process is reclaimed at the start of the next tick.
        assert_eq!(m.memory().used_frames(), 1);
        m.tick();
        assert_eq!(m.memory().used_frames(), 0);
    }

    #[test]
    fn core_usage_tracks_running_processes() {
        let mut m = machine(2, SchedulingPolicy::RoundRobin { quantum: 2 });
        m.submit("a", vec![Instruction::print("x"); 4], 64).unwrap();
        assert_eq!(m.core_usage().used, 0);
        m.tick();
        let usage = m.core_usage();
        assert_eq!((usage.total, usage.used, usage.available), (2, 1, 1));
        assert!((usage.percent() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn violation_is_visible_through_inspection() {
        let mut m = machine(1, SchedulingPolicy::Fcfs);
        let pid = m
            .submit("bad", vec![Instruction::write(0x500, "1")], 128)
            .unwrap();
        m.tick();
        let info = m.process_infos().into_iter().find(|i| i.pid == pid).unwrap();
        assert_eq!(info.state, ProcessState::Finished);
        assert_eq!(info.violation.map(|v| (v.tick, v.address)), Some((1, 0x500)));
        assert!(m.page_table(pid).is_none());
        m.check_invariants().unwrap();
    }

    #[test]
    fn memory_pressure_evicts_across_processes() {
        let mut m = machine(2, SchedulingPolicy::RoundRobin { quantum: 1 });
        // 8 frames; each process touches page 0 plus three data pages.
        for name in ["a", "b", "c"] {
            let program = vec![
                Instruction::write(64, "1"),
                Instruction::write(128, "2"),
                Instruction::write(192, "3"),
                Instruction::read("x", 64),
            ];
            m.submit(name, program, 256).unwrap();
        }
        m.run_until_idle(100);
        assert!(m.is_idle());
        assert!(m.memory().stats().pages_out > 0);
        for p in m.processes() {
            assert_eq!(p.registers()["x"], 1, "{}", p.name());
        }
        m.check_invariants().unwrap();
    }
}
