//! The interactive console.
//!
//! A [`Console`] is an explicit session object: it owns the runtime, the
//! ticker and the arrival source once `initialize` has run, and remembers
//! which process screen (if any) is attached.  [`Console::execute`] maps
//! one input line to one [`Reply`], so the binary only does I/O.
//!
//! ```text
//! main menu                         attached screen
//! ─────────                         ───────────────
//! initialize                        process-smi
//! scheduler-start / scheduler-stop  page-table
//! screen -s <name> <mem>     ──►    exit  (back to main menu)
//! screen -c <name> <mem> "<prog>"
//! screen -r <name> / screen -ls
//! process-smi / vmstat / page-table <name>
//! report-util / step [n] / exit
//! ```

use std::path::{Path, PathBuf};

use log::info;
use osemu_core::instruction::ParseInstructionError;
use osemu_core::{
    parse_program, Machine, MemoryError, ProcessInfo, Runtime, RuntimeError, RuntimeHandle, Ticker,
};
use osemu_workload::{ArrivalSource, GeneratorConfig, NameCounter, ProgramGenerator, TickArrivals};
use thiserror::Error;

use crate::config::{is_valid_process_memory, ConfigError, SystemConfig};
use crate::report;

/// Most instructions a `screen -c` program may hold.
pub const MAX_CUSTOM_INSTRUCTIONS: usize = 50;

const HELP: &str = "\
Commands:
  initialize                       load config and start the machine
  scheduler-start / scheduler-stop start or stop generated arrivals
  screen -s <name> <mem>           create a generated process and attach
  screen -c <name> <mem> \"<prog>\"  create a process from `;`-separated instructions
  screen -r <name>                 reattach to a process
  screen -ls                       CPU utilisation and process list
  process-smi | vmstat             memory and paging statistics
  page-table <name>                page residency of one process
  report-util                      write the screen -ls report to a file
  step [n]                         advance n ticks
  exit                             leave a screen, or quit";

/// Errors surfaced to the console user.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("run `initialize` first")]
    NotInitialized,

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Parse(#[from] ParseInstructionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Output(String),
    Exit,
}

impl Reply {
    fn text(s: impl Into<String>) -> Self {
        Reply::Output(s.into())
    }
}

/// How the console is set up.
#[derive(Debug, Clone)]
pub struct ConsoleOptions {
    /// Config file; `config.txt` in the working directory when absent.
    pub config_path: Option<PathBuf>,
    /// No ticker thread; time only moves on `step`.
    pub manual: bool,
    /// Destination of `report-util`.
    pub report_path: PathBuf,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            manual: false,
            report_path: PathBuf::from("osemu-log.txt"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Session
// ═══════════════════════════════════════════════════════════════════════

enum Arrivals {
    Off(ProgramGenerator),
    Background(ArrivalSource),
    Stepped(TickArrivals),
}

/// Everything that exists after `initialize`.
struct Session {
    config: SystemConfig,
    // Field order is drop order: the threads go before the loop they feed.
    ticker: Option<Ticker>,
    arrivals: Arrivals,
    runtime: Runtime,
    handle: RuntimeHandle,
    names: NameCounter,
    /// Programs for `screen -s`, separate from the arrival stream.
    screen_generator: ProgramGenerator,
}

impl Session {
    fn start(config: SystemConfig, manual: bool) -> Result<Self, ShellError> {
        let machine = Machine::new(config.machine_config())?;
        let runtime = Runtime::spawn(machine)?;
        let handle = runtime.handle();
        let ticker = if manual {
            None
        } else {
            Some(Ticker::start(handle.clone(), config.tick_period())?)
        };
        let screen_generator = ProgramGenerator::new(GeneratorConfig {
            seed: config.seed.wrapping_add(1),
            ..config.generator_config()
        });
        Ok(Self {
            arrivals: Arrivals::Off(ProgramGenerator::new(config.generator_config())),
            names: NameCounter::new(),
            config,
            runtime,
            handle,
            ticker,
            screen_generator,
        })
    }

    fn start_arrivals(&mut self) -> Result<&'static str, ShellError> {
        let placeholder = Arrivals::Off(ProgramGenerator::new(self.config.generator_config()));
        let generator = match std::mem::replace(&mut self.arrivals, placeholder) {
            Arrivals::Off(generator) => generator,
            running => {
                self.arrivals = running;
                return Ok("Process generation is already running.");
            }
        };
        self.arrivals = if self.ticker.is_some() {
            Arrivals::Background(ArrivalSource::start(
                self.handle.clone(),
                generator,
                self.names.clone(),
                self.config.arrival_period(),
            )?)
        } else {
            Arrivals::Stepped(TickArrivals::new(
                generator,
                self.names.clone(),
                self.config.batch_process_freq,
            ))
        };
        Ok("Process generation started.")
    }

    fn stop_arrivals(&mut self) -> &'static str {
        let placeholder = Arrivals::Off(ProgramGenerator::new(self.config.generator_config()));
        match std::mem::replace(&mut self.arrivals, placeholder) {
            Arrivals::Off(generator) => {
                self.arrivals = Arrivals::Off(generator);
                "Process generation is already stopped."
            }
            Arrivals::Background(source) => {
                if let Some(generator) = source.stop() {
                    self.arrivals = Arrivals::Off(generator);
                }
                "Process generation stopped. Queued processes keep running."
            }
            Arrivals::Stepped(arrivals) => {
                self.arrivals = Arrivals::Off(arrivals.into_generator());
                "Process generation stopped. Queued processes keep running."
            }
        }
    }

    /// Advance `n` ticks, feeding stepped arrivals.  Returns the clock.
    fn step(&mut self, n: u64) -> Result<u64, ShellError> {
        match &mut self.arrivals {
            Arrivals::Stepped(arrivals) => {
                for _ in 0..n {
                    let clock = self.handle.query(|m| m.clock())?;
                    if let Some((name, program)) = arrivals.poll(clock) {
                        self.handle
                            .submit_detached(name, program.instructions, program.memory_bytes)?;
                    }
                    self.handle.tick()?;
                }
            }
            _ => self.handle.step(n)?,
        }
        Ok(self.handle.query(|m| m.clock())?)
    }

    fn lookup(&self, name: &str) -> Result<Option<(ProcessInfo, Vec<String>)>, ShellError> {
        let name = name.to_string();
        Ok(self.handle.query(move |m| {
            m.process_by_name(&name).map(|p| (p.info(), p.log().to_vec()))
        })?)
    }

    fn utilization_report(&self) -> Result<String, ShellError> {
        let (usage, infos) = self
            .handle
            .query(|m| (m.core_usage(), m.process_infos()))?;
        Ok(report::format_utilization(&usage, &infos))
    }

    fn page_table(&self, name: &str) -> Result<String, ShellError> {
        let owned = name.to_string();
        let rows = self.handle.query(move |m| {
            m.process_by_name(&owned)
                .and_then(|p| m.page_table(p.pid()))
        })?;
        Ok(match rows {
            Some(rows) => report::format_page_table(&rows),
            None => format!("Process {} has no registered memory.", name),
        })
    }

    fn shutdown(mut self) -> Result<Machine, ShellError> {
        if let Some(mut ticker) = self.ticker.take() {
            ticker.stop();
        }
        self.stop_arrivals();
        Ok(self.runtime.shutdown()?)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Console
// ═══════════════════════════════════════════════════════════════════════

/// Interactive session state.
pub struct Console {
    options: ConsoleOptions,
    session: Option<Session>,
    /// Name of the attached process screen.
    screen: Option<String>,
}

impl Console {
    pub fn new(options: ConsoleOptions) -> Self {
        Self {
            options,
            session: None,
            screen: None,
        }
    }

    pub fn prompt(&self) -> String {
        match &self.screen {
            Some(name) => format!("[screen:{}] > ", name),
            None => "osemu> ".to_string(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    /// Run one input line.
    pub fn execute(&mut self, line: &str) -> Result<Reply, ShellError> {
        let line = line.trim();
        if let Some(name) = self.screen.clone() {
            return self.screen_command(&name, line);
        }

        let (command, rest) = split_word(line);
        match command {
            "" => Ok(Reply::text("")),
            "help" => Ok(Reply::text(HELP)),
            "initialize" => self.initialize(),
            "exit" => {
                if let Some(session) = self.session.take() {
                    let machine = session.shutdown()?;
                    info!("console closed at tick {}", machine.clock());
                }
                Ok(Reply::Exit)
            }
            _ => {
                let session = self.session.as_mut().ok_or(ShellError::NotInitialized)?;
                let (reply, attach) = dispatch(session, &self.options.report_path, command, rest)?;
                if attach.is_some() {
                    self.screen = attach;
                }
                Ok(reply)
            }
        }
    }

    fn initialize(&mut self) -> Result<Reply, ShellError> {
        if self.session.is_some() {
            return Ok(Reply::text("Already initialized."));
        }
        let (config, note) = match &self.options.config_path {
            Some(path) => (SystemConfig::load(path)?, None),
            None if Path::new("config.txt").exists() => {
                (SystemConfig::load(Path::new("config.txt"))?, None)
            }
            None => (
                SystemConfig::default(),
                Some("config.txt not found, using defaults."),
            ),
        };
        let summary = config.summary();
        self.session = Some(Session::start(config, self.options.manual)?);

        let mut output = String::new();
        if let Some(note) = note {
            output.push_str(note);
            output.push('\n');
        }
        output.push_str(&summary);
        output.push_str("\nSystem initialized.");
        Ok(Reply::Output(output))
    }

    fn screen_command(&mut self, name: &str, line: &str) -> Result<Reply, ShellError> {
        let session = self.session.as_mut().ok_or(ShellError::NotInitialized)?;
        match line {
            "exit" => {
                self.screen = None;
                Ok(Reply::text(""))
            }
            "process-smi" => Ok(Reply::Output(match session.lookup(name)? {
                Some((info, log)) => report::format_process_smi(&info, &log),
                None => format!("Process {} not found.", name),
            })),
            "page-table" => Ok(Reply::Output(session.page_table(name)?)),
            "step" => Ok(Reply::Output(format!("Now at tick {}.", session.step(1)?))),
            "" => Ok(Reply::text("")),
            _ => Ok(Reply::text("Unknown screen command.")),
        }
    }
}

/// Main-menu commands that need a session.  Returns the reply and the
/// screen to attach to, if any.
fn dispatch(
    session: &mut Session,
    report_path: &Path,
    command: &str,
    rest: &str,
) -> Result<(Reply, Option<String>), ShellError> {
    let reply = match command {
        "scheduler-start" => Reply::text(session.start_arrivals()?),
        "scheduler-stop" => Reply::text(session.stop_arrivals()),
        "screen" => return screen(session, rest),
        "process-smi" | "vmstat" => {
            let (memory, cpu, infos) = session
                .handle
                .query(|m| (m.memory_snapshot(), m.cpu_stats(), m.process_infos()))?;
            Reply::Output(report::format_vmstat(&memory, &cpu, &infos))
        }
        "page-table" => {
            if rest.is_empty() {
                return Err(ShellError::Usage("page-table <name>"));
            }
            Reply::Output(session.page_table(rest)?)
        }
        "report-util" => {
            let text = session.utilization_report()?;
            report::save_report(&text, report_path)?;
            Reply::Output(format!("Report generated at {}", report_path.display()))
        }
        "step" => {
            let n = if rest.is_empty() {
                1
            } else {
                rest.parse().map_err(|_| ShellError::Usage("step [n]"))?
            };
            Reply::Output(format!("Now at tick {}.", session.step(n)?))
        }
        other => return Err(ShellError::UnknownCommand(other.to_string())),
    };
    Ok((reply, None))
}

fn screen(session: &mut Session, rest: &str) -> Result<(Reply, Option<String>), ShellError> {
    let (flag, args) = split_word(rest);
    match flag {
        "-ls" => Ok((Reply::Output(session.utilization_report()?), None)),
        "-r" => {
            let name = args;
            if name.is_empty() {
                return Err(ShellError::Usage("screen -r <name>"));
            }
            match session.lookup(name)? {
                None => Ok((Reply::Output(format!("Process {} not found.", name)), None)),
                Some((
                    ProcessInfo {
                        violation: Some(v), ..
                    },
                    _,
                )) => Ok((
                    Reply::Output(format!(
                        "Process {} shut down due to memory access violation error that \
                         occurred at tick {}. {:#x} invalid.",
                        name, v.tick, v.address
                    )),
                    None,
                )),
                Some((info, log)) => Ok((
                    Reply::Output(report::format_process_smi(&info, &log)),
                    Some(name.to_string()),
                )),
            }
        }
        "-s" => {
            let (name, mem) = split_word(args);
            if name.is_empty() || mem.is_empty() {
                return Err(ShellError::Usage("screen -s <name> <mem>"));
            }
            let Some(bytes) = parse_memory(mem) else {
                return Ok((Reply::text("invalid memory allocation"), None));
            };
            let program = session.screen_generator.program_for(bytes);
            let pid = session.handle.submit(name, program, bytes)?;
            Ok((
                Reply::Output(format!("Process {} created (pid {}).", name, pid)),
                Some(name.to_string()),
            ))
        }
        "-c" => {
            const USAGE: &str = "screen -c <name> <mem> \"<instr; instr; ...>\"";
            let (name, args) = split_word(args);
            let (mem, source) = split_word(args);
            if name.is_empty() || mem.is_empty() || source.is_empty() {
                return Err(ShellError::Usage(USAGE));
            }
            let Some(bytes) = parse_memory(mem) else {
                return Ok((Reply::text("invalid memory allocation"), None));
            };
            let program = parse_program(&unquote(source))?;
            if !(1..=MAX_CUSTOM_INSTRUCTIONS).contains(&program.len()) {
                return Err(ShellError::Usage("custom programs hold 1 to 50 instructions"));
            }
            let pid = session.handle.submit(name, program, bytes)?;
            Ok((
                Reply::Output(format!("Process {} created (pid {}).", name, pid)),
                Some(name.to_string()),
            ))
        }
        _ => Err(ShellError::Usage("screen -s | -c | -r | -ls")),
    }
}

fn parse_memory(token: &str) -> Option<usize> {
    token.parse().ok().filter(|&bytes| is_valid_process_memory(bytes))
}

/// Strip one pair of surrounding quotes and unescape `\"`.
fn unquote(source: &str) -> String {
    let inner = source
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(source);
    inner.replace("\\\"", "\"")
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}
