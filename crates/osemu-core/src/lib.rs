//! osemu core: a discrete-time multi-core scheduler over demand-paged memory.
//!
//! A [`Machine`] owns one [`MemoryManager`], one [`Scheduler`] and the
//! process table.  Each tick reclaims finished cores, assigns ready
//! processes and runs exactly one instruction per running core, gated by
//! page validity and residency.  Everything is deterministic for a given
//! sequence of submissions and ticks.
//!
//! # Architecture
//!
//! - [`instruction`]: the six-variant instruction set and its text form
//! - [`process`]: process control blocks and lifecycle
//! - [`memory`]: frame pool, page tables, global LRU eviction
//! - [`scheduler`]: cores, ready queue, FCFS / round robin
//! - [`machine`]: single owner of all of the above plus the clock
//! - [`runtime`]: loop thread, command channel and ticker

pub mod instruction;
pub mod machine;
pub mod memory;
pub mod process;
pub mod runtime;
pub mod scheduler;

pub use instruction::{parse_program, Instruction, Opcode, Operand};
pub use machine::{CoreUsage, Machine, MachineConfig, SubmitError};
pub use memory::{MemoryConfig, MemoryError, MemoryManager, MemorySnapshot};
pub use process::{Pid, Process, ProcessInfo, ProcessState};
pub use runtime::{Runtime, RuntimeError, RuntimeHandle, Ticker};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulingPolicy, TickReport};
