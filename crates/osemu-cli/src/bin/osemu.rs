//! `osemu`: multi-core process scheduler and paging emulator.
//!
//! # Usage
//!
//! ```bash
//! # Interactive console (reads ./config.txt on `initialize`)
//! osemu
//! osemu shell --config my-config.txt
//!
//! # Console without the wall-clock ticker; advance time with `step`
//! osemu shell --manual
//!
//! # Headless, deterministic run
//! osemu simulate --config config.txt --ticks 500
//! osemu simulate --ticks 500 --json > state.json
//! ```

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use osemu_cli::config::SystemConfig;
use osemu_cli::report::{self, MachineSummary};
use osemu_cli::shell::{Console, ConsoleOptions, Reply};
use osemu_cli::simulate::simulate;

#[derive(Parser)]
#[command(name = "osemu")]
#[command(about = "Multi-core process scheduler and demand-paging emulator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive console (the default).
    Shell {
        /// Config file read by `initialize` (default: ./config.txt).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Do not start the ticker; time advances only with `step`.
        #[arg(long)]
        manual: bool,

        /// Where `report-util` writes.
        #[arg(long, default_value = "osemu-log.txt")]
        report: PathBuf,
    },

    /// Run the machine headless and print the final state.
    Simulate {
        /// Config file (defaults when omitted).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Ticks to run.
        #[arg(short, long, default_value = "1000")]
        ticks: u64,

        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Shell {
        config: None,
        manual: false,
        report: PathBuf::from("osemu-log.txt"),
    }) {
        Commands::Shell {
            config,
            manual,
            report,
        } => cmd_shell(ConsoleOptions {
            config_path: config,
            manual,
            report_path: report,
        }),
        Commands::Simulate {
            config,
            ticks,
            json,
        } => cmd_simulate(config.as_deref(), ticks, json),
    }
}

fn cmd_shell(options: ConsoleOptions) {
    let mut console = Console::new(options);
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    println!("osemu console. Type `initialize` to start, `help` for commands.");
    loop {
        print!("{}", console.prompt());
        let _ = io::stdout().flush();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
            None => "exit".to_string(),
        };

        match console.execute(&line) {
            Ok(Reply::Output(text)) => {
                if !text.is_empty() {
                    println!("{}", text.trim_end());
                }
            }
            Ok(Reply::Exit) => break,
            Err(e) => eprintln!("Error: {}", e),
        }
    }
}

fn cmd_simulate(config_path: Option<&Path>, ticks: u64, json: bool) {
    let config = match config_path {
        Some(path) => match SystemConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        None => SystemConfig::default(),
    };

    let machine = match simulate(&config, ticks) {
        Ok(machine) => machine,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if json {
        let summary = MachineSummary::capture(&machine);
        let stdout = io::stdout();
        if let Err(e) = serde_json::to_writer_pretty(stdout.lock(), &summary) {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
        println!();
        return;
    }

    println!("{}", config.summary());
    println!();
    print!(
        "{}",
        report::format_utilization(&machine.core_usage(), &machine.process_infos())
    );
    println!();
    print!(
        "{}",
        report::format_vmstat(
            &machine.memory_snapshot(),
            &machine.cpu_stats(),
            &machine.process_infos()
        )
    );
}
