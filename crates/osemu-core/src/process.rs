//! Emulated processes and their lifecycle.
//!
//! ```text
//!          assign                 pc == len
//! READY ───────────► RUNNING ─────────────────► FINISHED
//!   ▲                   │  │                        ▲
//!   └── quantum spent ──┘  └── violation / fault ───┘
//! ```
//!
//! `WAITING` exists for completeness but is never entered: a page fault
//! simply skips the process for one tick.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::instruction::{ExecContext, ExecError, Instruction, Registers};
use crate::memory::MemoryManager;

/// Process identifier, unique and monotonic within one machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Ready,
    Running,
    /// Reserved; page faults are modelled as skipped ticks.
    Waiting,
    Finished,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Ready => "READY",
            ProcessState::Running => "RUNNING",
            ProcessState::Waiting => "WAITING",
            ProcessState::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// Record of a fatal out-of-range access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub tick: u64,
    pub address: u32,
}

/// Result of one [`Process::execute_next_instruction`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One instruction ran and more remain.
    Executed,
    /// The last instruction ran; the process is now FINISHED.
    Completed,
    /// Nothing ran because the process was already FINISHED.
    AlreadyFinished,
}

/// A process control block.
#[derive(Debug, Clone)]
pub struct Process {
    pid: Pid,
    name: String,
    pub(crate) state: ProcessState,
    pc: usize,
    instructions: Vec<Instruction>,
    registers: Registers,
    log: Vec<String>,
    memory_bytes: usize,
    pub(crate) core: Option<usize>,
    arrived_at: u64,
    finished_at: Option<u64>,
    violation: Option<Violation>,
    fault: Option<String>,
}

impl Process {
    pub fn new(
        pid: Pid,
        name: impl Into<String>,
        instructions: Vec<Instruction>,
        memory_bytes: usize,
        arrived_at: u64,
    ) -> Self {
        Self {
            pid,
            name: name.into(),
            state: ProcessState::Ready,
            pc: 0,
            instructions,
            registers: Registers::new(),
            log: Vec::new(),
            memory_bytes,
            core: None,
            arrived_at,
            finished_at: None,
            violation: None,
            fault: None,
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state == ProcessState::Finished
    }

    /// Index of the next instruction; equals the instruction count once
    /// the program has run to completion.
    #[inline]
    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// The instruction at `pc`, if any remain.
    pub fn current_instruction(&self) -> Option<&Instruction> {
        self.instructions.get(self.pc)
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    /// Last core this process ran on.
    pub fn core(&self) -> Option<usize> {
        self.core
    }

    pub fn arrived_at(&self) -> u64 {
        self.arrived_at
    }

    pub fn finished_at(&self) -> Option<u64> {
        self.finished_at
    }

    pub fn violation(&self) -> Option<Violation> {
        self.violation
    }

    pub fn terminated_due_to_violation(&self) -> bool {
        self.violation.is_some()
    }

    /// Message of a non-address fatal error, if one stopped the process.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// Run the instruction at `pc` on `core`.
    ///
    /// On success the pc advances; reaching the end finishes the process.
    /// Errors leave the pc where it was, so retryable ones can simply be
    /// attempted again on a later tick.
    pub fn execute_next_instruction(
        &mut self,
        core: usize,
        memory: &mut MemoryManager,
        now: u64,
    ) -> Result<StepOutcome, ExecError> {
        if self.is_finished() {
            return Ok(StepOutcome::AlreadyFinished);
        }
        self.core = Some(core);

        if let Some(instruction) = self.instructions.get(self.pc) {
            let mut ctx = ExecContext {
                pid: self.pid,
                core,
                name: &self.name,
                now,
                registers: &mut self.registers,
                log: &mut self.log,
                memory,
            };
            instruction.execute(&mut ctx)?;
            self.pc += 1;
        }

        if self.pc >= self.instructions.len() {
            self.finish(now);
            Ok(StepOutcome::Completed)
        } else {
            Ok(StepOutcome::Executed)
        }
    }

    /// Stop the process for an out-of-range access at `address`.
    ///
    /// Only the first violation is recorded.
    pub fn terminate_by_violation(&mut self, address: u32, now: u64) {
        if self.violation.is_none() {
            self.violation = Some(Violation { tick: now, address });
        }
        self.finish(now);
    }

    /// Stop the process for a fatal, non-address error.
    pub fn terminate_with_fault(&mut self, message: impl Into<String>, now: u64) {
        if self.fault.is_none() && self.violation.is_none() {
            self.fault = Some(message.into());
        }
        self.finish(now);
    }

    fn finish(&mut self, now: u64) {
        self.state = ProcessState::Finished;
        if self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }

    /// Serialisable summary for reports.
    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            name: self.name.clone(),
            state: self.state,
            pc: self.pc,
            instruction_count: self.instructions.len(),
            core: self.core,
            memory_bytes: self.memory_bytes,
            arrived_at: self.arrived_at,
            finished_at: self.finished_at,
            violation: self.violation,
            fault: self.fault.clone(),
        }
    }
}

/// Read-only summary of a [`Process`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: String,
    pub state: ProcessState,
    pub pc: usize,
    pub instruction_count: usize,
    pub core: Option<usize>,
    pub memory_bytes: usize,
    pub arrived_at: u64,
    pub finished_at: Option<u64>,
    pub violation: Option<Violation>,
    pub fault: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConfig;

    fn memory() -> MemoryManager {
        MemoryManager::new(MemoryConfig {
            total_memory: 256,
            frame_size: 64,
            max_memory_per_process: 256,
            instruction_size: 4,
        })
        .unwrap()
    }

    #[test]
    fn runs_to_completion_and_records_finish_once() {
        let mut mem = memory();
        let mut p = Process::new(
            Pid(1),
            "p1",
            vec![Instruction::add("x", "x", "1"), Instruction::print("done")],
            64,
            0,
        );
        assert_eq!(p.execute_next_instruction(0, &mut mem, 1).unwrap(), StepOutcome::Executed);
        assert_eq!(p.execute_next_instruction(0, &mut mem, 2).unwrap(), StepOutcome::Completed);
        assert_eq!(p.state(), ProcessState::Finished);
        assert_eq!(p.finished_at(), Some(2));
        assert_eq!(p.pc(), 2);
        assert_eq!(p.core(), Some(0));

        assert_eq!(
            p.execute_next_instruction(1, &mut mem, 3).unwrap(),
            StepOutcome::AlreadyFinished
        );
        assert_eq!(p.finished_at(), Some(2));
        assert_eq!(p.core(), Some(0));
        assert_eq!(p.log(), ["Core 0 | p1: done [tick 2]"]);
    }

    #[test]
    fn retryable_error_keeps_pc() {
        let mut mem = memory();
        mem.register_process(Pid(1), 1).unwrap();
        let mut p = Process::new(Pid(1), "p1", vec![Instruction::declare("x", 4)], 64, 0);

        let err = p.execute_next_instruction(0, &mut mem, 1).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(p.pc(), 0);
        assert_eq!(p.state(), ProcessState::Ready);

        mem.ensure_page_loaded(Pid(1), 0).unwrap();
        assert_eq!(p.execute_next_instruction(0, &mut mem, 2).unwrap(), StepOutcome::Completed);
        assert_eq!(p.registers()["x"], 4);
    }

    #[test]
    fn violation_is_recorded_once_and_terminal() {
        let mut p = Process::new(Pid(3), "v", vec![Instruction::read("x", 9000)], 64, 0);
        p.terminate_by_violation(9000, 5);
        p.terminate_by_violation(1, 8);
        p.terminate_with_fault("late", 9);

        assert!(p.terminated_due_to_violation());
        assert_eq!(p.violation(), Some(Violation { tick: 5, address: 9000 }));
        assert_eq!(p.finished_at(), Some(5));
        assert_eq!(p.fault(), None);
        assert_eq!(p.state(), ProcessState::Finished);
    }

    #[test]
    fn info_mirrors_process() {
        let p = Process::new(Pid(4), "info", vec![Instruction::print("a")], 128, 3);
        let info = p.info();
        assert_eq!(info.pid, Pid(4));
        assert_eq!(info.name, "info");
        assert_eq!(info.state, ProcessState::Ready);
        assert_eq!(info.instruction_count, 1);
        assert_eq!(info.arrived_at, 3);
        assert_eq!(info.core, None);
    }
}
