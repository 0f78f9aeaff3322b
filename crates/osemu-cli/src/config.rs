//! System configuration.
//!
//! Two on-disk formats are accepted:
//!
//! ```text
//! # config.txt: whitespace separated, one key per line, values may be quoted
//! num-cpu 4
//! scheduler "rr"
//! quantum-cycles 5
//! mem-per-proc 4096          # sets both min and max
//! ```
//!
//! and JSON (`*.json`) with the same kebab-case keys.  Every value is
//! validated before it reaches the machine.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use osemu_core::{MachineConfig, MemoryConfig, SchedulerConfig, SchedulingPolicy};
use osemu_workload::{GeneratorConfig, ProgramKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest per-process footprint.
pub const MIN_PROCESS_MEMORY: usize = 1 << 6;
/// Largest per-process footprint.
pub const MAX_PROCESS_MEMORY: usize = 1 << 16;

/// Errors loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown config key `{0}`")]
    UnknownKey(String),

    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Scheduling algorithm as written in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Fcfs,
    Rr,
}

impl FromStr for SchedulerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fcfs" => Ok(SchedulerKind::Fcfs),
            "rr" | "round-robin" => Ok(SchedulerKind::Rr),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Fcfs => f.write_str("fcfs"),
            SchedulerKind::Rr => f.write_str("rr"),
        }
    }
}

/// Every tunable of the emulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct SystemConfig {
    pub num_cpu: usize,
    pub scheduler: SchedulerKind,
    pub quantum_cycles: u32,
    /// Ticks between generated arrivals.
    pub batch_process_freq: u64,
    pub min_ins: usize,
    pub max_ins: usize,
    /// Delay ticks after each executed instruction.
    pub delay_per_exec: u32,
    pub max_overall_mem: usize,
    pub mem_per_frame: usize,
    pub min_mem_per_proc: usize,
    pub max_mem_per_proc: usize,
    pub instruction_size: usize,
    /// `random` programs or the fixed `cyclic` pattern.
    pub program_kind: ProgramKind,
    /// Wall-clock ticker period.
    pub tick_ms: u64,
    pub seed: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            num_cpu: 4,
            scheduler: SchedulerKind::Rr,
            quantum_cycles: 5,
            batch_process_freq: 1,
            min_ins: 1000,
            max_ins: 2000,
            delay_per_exec: 0,
            max_overall_mem: 16384,
            mem_per_frame: 16,
            min_mem_per_proc: 4096,
            max_mem_per_proc: 4096,
            instruction_size: 4,
            program_kind: ProgramKind::Random,
            tick_ms: 100,
            seed: 42,
        }
    }
}

impl SystemConfig {
    /// Load from `path`, choosing the format by extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.extension().is_some_and(|ext| ext == "json") {
            let file = fs::File::open(path)?;
            serde_json::from_reader(file)?
        } else {
            Self::parse_text(&fs::read_to_string(path)?)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse the `key value` text format.  Keys not mentioned keep their
    /// defaults; the result is not yet validated.
    pub fn parse_text(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(key) = parts.next() else { continue };
            let value = parts.collect::<Vec<_>>().join(" ");
            config.set(key, value.trim_matches('"'))?;
        }
        Ok(config)
    }

    /// Assign one key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        fn num<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            })
        }

        match key {
            "num-cpu" => self.num_cpu = num(key, value)?,
            "scheduler" => {
                self.scheduler = value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })?
            }
            "quantum-cycles" => self.quantum_cycles = num(key, value)?,
            "batch-process-freq" => self.batch_process_freq = num(key, value)?,
            "min-ins" => self.min_ins = num(key, value)?,
            "max-ins" => self.max_ins = num(key, value)?,
            "delay-per-exec" => self.delay_per_exec = num(key, value)?,
            "max-overall-mem" => self.max_overall_mem = num(key, value)?,
            "mem-per-frame" => self.mem_per_frame = num(key, value)?,
            "mem-per-proc" => {
                let bytes = num(key, value)?;
                self.min_mem_per_proc = bytes;
                self.max_mem_per_proc = bytes;
            }
            "min-mem-per-proc" => self.min_mem_per_proc = num(key, value)?,
            "max-mem-per-proc" => self.max_mem_per_proc = num(key, value)?,
            "instruction-size" => self.instruction_size = num(key, value)?,
            "program-kind" => {
                self.program_kind = match value.to_ascii_lowercase().as_str() {
                    "random" => ProgramKind::Random,
                    "cyclic" => ProgramKind::Cyclic,
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                        })
                    }
                }
            }
            "tick-ms" => self.tick_ms = num(key, value)?,
            "seed" => self.seed = num(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(1..=128).contains(&self.num_cpu) {
            return invalid(format!("num-cpu {} not in 1..=128", self.num_cpu));
        }
        if self.quantum_cycles == 0 {
            return invalid("quantum-cycles must be at least 1".into());
        }
        if self.batch_process_freq == 0 {
            return invalid("batch-process-freq must be at least 1".into());
        }
        if self.min_ins == 0 || self.min_ins > self.max_ins {
            return invalid(format!(
                "instruction range {}..={} is empty",
                self.min_ins, self.max_ins
            ));
        }
        if !is_power_of_two_in(self.mem_per_frame, 1 << 4, 1 << 16) {
            return invalid(format!(
                "mem-per-frame {} is not a power of two in 16..=65536",
                self.mem_per_frame
            ));
        }
        if self.max_overall_mem == 0 || self.max_overall_mem % self.mem_per_frame != 0 {
            return invalid(format!(
                "max-overall-mem {} is not a positive multiple of mem-per-frame {}",
                self.max_overall_mem, self.mem_per_frame
            ));
        }
        for (key, bytes) in [
            ("min-mem-per-proc", self.min_mem_per_proc),
            ("max-mem-per-proc", self.max_mem_per_proc),
        ] {
            if !is_valid_process_memory(bytes) {
                return invalid(format!(
                    "{} {} is not a power of two in {}..={}",
                    key, bytes, MIN_PROCESS_MEMORY, MAX_PROCESS_MEMORY
                ));
            }
        }
        if self.min_mem_per_proc > self.max_mem_per_proc {
            return invalid("min-mem-per-proc exceeds max-mem-per-proc".into());
        }
        if self.mem_per_frame > self.max_mem_per_proc {
            return invalid(format!(
                "mem-per-frame {} exceeds max-mem-per-proc {}",
                self.mem_per_frame, self.max_mem_per_proc
            ));
        }
        if self.instruction_size == 0 {
            return invalid("instruction-size must be at least 1".into());
        }
        if self.tick_ms == 0 {
            return invalid("tick-ms must be at least 1".into());
        }
        Ok(())
    }

    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            total_memory: self.max_overall_mem,
            frame_size: self.mem_per_frame,
            max_memory_per_process: self.max_mem_per_proc,
            instruction_size: self.instruction_size,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            num_cores: self.num_cpu,
            policy: match self.scheduler {
                SchedulerKind::Fcfs => SchedulingPolicy::Fcfs,
                SchedulerKind::Rr => SchedulingPolicy::RoundRobin {
                    quantum: self.quantum_cycles,
                },
            },
            delay_per_exec: self.delay_per_exec,
        }
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            memory: self.memory_config(),
            scheduler: self.scheduler_config(),
        }
    }

    /// Generator for background arrivals.
    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            kind: self.program_kind,
            min_instructions: self.min_ins,
            max_instructions: self.max_ins,
            min_memory: self.min_mem_per_proc,
            max_memory: self.max_mem_per_proc,
            frame_size: self.mem_per_frame,
            instruction_size: self.instruction_size,
            seed: self.seed,
        }
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Wall-clock gap between background arrivals.
    pub fn arrival_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms.saturating_mul(self.batch_process_freq))
    }

    /// One-paragraph summary printed by `initialize`.
    pub fn summary(&self) -> String {
        format!(
            "Config loaded: {} CPUs, scheduler = {}, quantum = {}, instructions {}..={}, delay = {}\n\
             Max overall memory: {} bytes, frame: {} bytes, per process: {}..={} bytes",
            self.num_cpu,
            self.scheduler,
            self.quantum_cycles,
            self.min_ins,
            self.max_ins,
            self.delay_per_exec,
            self.max_overall_mem,
            self.mem_per_frame,
            self.min_mem_per_proc,
            self.max_mem_per_proc
        )
    }
}

/// Whether `bytes` is an acceptable per-process footprint.
pub fn is_valid_process_memory(bytes: usize) -> bool {
    is_power_of_two_in(bytes, MIN_PROCESS_MEMORY, MAX_PROCESS_MEMORY)
}

fn is_power_of_two_in(n: usize, lo: usize, hi: usize) -> bool {
    n.is_power_of_two() && (lo..=hi).contains(&n)
}
