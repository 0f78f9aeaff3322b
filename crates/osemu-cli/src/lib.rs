//! Front end for the osemu emulator.
//!
//! - [`config`]: `config.txt` / JSON loading and validation
//! - [`shell`]: the interactive console session
//! - [`report`]: `screen -ls`, `process-smi`, `vmstat` and JSON output
//! - [`simulate`]: deterministic headless runs

pub mod config;
pub mod report;
pub mod shell;
pub mod simulate;

pub use config::{ConfigError, SchedulerKind, SystemConfig};
pub use shell::{Console, ConsoleOptions, Reply, ShellError};
