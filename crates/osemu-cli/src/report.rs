//! Human-readable and JSON reports.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use osemu_core::machine::CoreUsage;
use osemu_core::memory::{MemorySnapshot, PageLocation, PageMapping};
use osemu_core::scheduler::CpuStats;
use osemu_core::{Machine, ProcessInfo, ProcessState};
use serde::Serialize;

/// Everything `simulate --json` emits.
#[derive(Debug, Clone, Serialize)]
pub struct MachineSummary {
    pub tick: u64,
    pub cores: CoreUsage,
    pub cpu: CpuStats,
    pub memory: MemorySnapshot,
    pub processes: Vec<ProcessInfo>,
}

impl MachineSummary {
    pub fn capture(machine: &Machine) -> Self {
        Self {
            tick: machine.clock(),
            cores: machine.core_usage(),
            cpu: machine.cpu_stats(),
            memory: machine.memory_snapshot(),
            processes: machine.process_infos(),
        }
    }
}

/// The `screen -ls` / `report-util` report.
pub fn format_utilization(usage: &CoreUsage, processes: &[ProcessInfo]) -> String {
    let mut output = String::new();

    output.push_str(&format!("CPU utilization: {:.2}%\n", usage.percent()));
    output.push_str(&format!("Cores used:      {}\n", usage.used));
    output.push_str(&format!("Cores available: {}\n", usage.available));
    output.push('\n');

    output.push_str("─── Running processes ─────────────────────────────────────────────────\n");
    let mut any = false;
    for p in processes.iter().filter(|p| p.state != ProcessState::Finished) {
        any = true;
        let core = match (p.state, p.core) {
            (ProcessState::Running, Some(core)) => format!("Core: {}", core),
            _ => p.state.to_string(),
        };
        output.push_str(&format!(
            "{:<12} (arrived tick {:<6}) {:<10} {} / {}\n",
            p.name, p.arrived_at, core, p.pc, p.instruction_count
        ));
    }
    if !any {
        output.push_str("  No running processes.\n");
    }
    output.push('\n');

    output.push_str("─── Finished processes ────────────────────────────────────────────────\n");
    let mut any = false;
    for p in processes.iter().filter(|p| p.state == ProcessState::Finished) {
        any = true;
        let finished = p.finished_at.map_or_else(|| "-".to_string(), |t| t.to_string());
        let note = if let Some(v) = p.violation {
            format!("  violation at {:#x}", v.address)
        } else if let Some(fault) = &p.fault {
            format!("  {}", fault)
        } else {
            String::new()
        };
        output.push_str(&format!(
            "{:<12} (finished tick {:<5}) {} / {}{}\n",
            p.name, finished, p.pc, p.instruction_count, note
        ));
    }
    if !any {
        output.push_str("  No finished processes yet.\n");
    }

    output
}

/// The attached-screen `process-smi` view.
pub fn format_process_smi(info: &ProcessInfo, log: &[String]) -> String {
    let mut output = String::new();
    output.push_str(&format!("Name: {}\n", info.name));
    output.push_str(&format!("PID: {}\n", info.pid));
    output.push_str(&format!("Progress: {} / {}\n", info.pc, info.instruction_count));
    match info.core {
        Some(core) => output.push_str(&format!("Core ID: {}\n", core)),
        None => output.push_str("Core ID: -\n"),
    }
    output.push_str(&format!("State: {}\n", info.state));
    output.push_str("Logs:\n");
    for line in log {
        output.push_str(&format!("  {}\n", line));
    }
    if let Some(tick) = info.finished_at {
        output.push_str(&format!("Finished at: tick {}\n", tick));
    }
    output
}

/// Main-menu `process-smi` / `vmstat` view.
pub fn format_vmstat(memory: &MemorySnapshot, cpu: &CpuStats, processes: &[ProcessInfo]) -> String {
    let mut output = String::new();

    output.push_str("─── Memory ────────────────────────────────────────────────────────────\n");
    output.push_str(&format!("Total memory:  {} bytes\n", memory.total_memory));
    output.push_str(&format!("Used memory:   {} bytes\n", memory.used_memory()));
    output.push_str(&format!("Free memory:   {} bytes\n", memory.free_memory()));
    output.push_str(&format!(
        "Frames:        {} / {} used ({} bytes each)\n",
        memory.used_frames, memory.total_frames, memory.frame_size
    ));
    output.push_str(&format!("Pages in:      {}\n", memory.stats.pages_in));
    output.push_str(&format!("Pages out:     {}\n", memory.stats.pages_out));
    output.push('\n');

    output.push_str("─── CPU ───────────────────────────────────────────────────────────────\n");
    output.push_str(&format!("Ticks:         {}\n", cpu.ticks));
    output.push_str(&format!("Active ticks:  {}\n", cpu.busy_core_ticks));
    output.push_str(&format!("Idle ticks:    {}\n", cpu.idle_core_ticks));
    output.push_str(&format!("Utilization:   {:.2}%\n", cpu.utilization() * 100.0));

    if !memory.processes.is_empty() {
        output.push('\n');
        output.push_str("─── Resident pages ────────────────────────────────────────────────────\n");
        for usage in &memory.processes {
            let name = processes
                .iter()
                .find(|p| p.pid == usage.pid)
                .map_or("?", |p| p.name.as_str());
            output.push_str(&format!(
                "{:<12} pid {:<5} {} / {} pages resident\n",
                name, usage.pid.0, usage.resident_pages, usage.registered_pages
            ));
        }
    }
    output
}

/// One line per registered page.
pub fn format_page_table(rows: &[PageMapping]) -> String {
    let mut output = String::new();
    for row in rows {
        let location = match row.location {
            PageLocation::Resident { frame } => format!("frame {}", frame),
            PageLocation::BackingStore => "backing store".to_string(),
            PageLocation::NotLoaded => "not loaded".to_string(),
        };
        output.push_str(&format!("page {:<4} {}\n", row.page, location));
    }
    output
}

/// Write a text report to `path`.
pub fn save_report(text: &str, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use osemu_core::process::Violation;
    use osemu_core::Pid;

    fn info(name: &str, state: ProcessState) -> ProcessInfo {
        ProcessInfo {
            pid: Pid(1),
            name: name.to_string(),
            state,
            pc: 2,
            instruction_count: 5,
            core: Some(1),
            memory_bytes: 64,
            arrived_at: 0,
            finished_at: None,
            violation: None,
            fault: None,
        }
    }

    #[test]
    fn utilization_lists_running_and_finished() {
        let usage = CoreUsage {
            total: 4,
            used: 1,
            available: 3,
        };
        let mut done = info("done", ProcessState::Finished);
        done.finished_at = Some(9);
        done.violation = Some(Violation { tick: 9, address: 0x500 });
        let text = format_utilization(&usage, &[info("busy", ProcessState::Running), done]);

        assert!(text.contains("CPU utilization: 25.00%"));
        assert!(text.contains("Core: 1"));
        assert!(text.contains("violation at 0x500"));
        assert!(!text.contains("No finished processes"));
    }

    #[test]
    fn empty_machine_report() {
        let usage = CoreUsage {
            total: 2,
            used: 0,
            available: 2,
        };
        let text = format_utilization(&usage, &[]);
        assert!(text.contains("No running processes."));
        assert!(text.contains("No finished processes yet."));
    }

    #[test]
    fn process_smi_shows_progress_and_logs() {
        let mut p = info("p1", ProcessState::Finished);
        p.finished_at = Some(4);
        let text = format_process_smi(&p, &["Core 1 | p1: hi [tick 3]".to_string()]);
        assert!(text.contains("Progress: 2 / 5"));
        assert!(text.contains("  Core 1 | p1: hi [tick 3]"));
        assert!(text.contains("Finished at: tick 4"));
    }

    #[test]
    fn page_table_rows() {
        let rows = [
            PageMapping { page: 0, location: PageLocation::Resident { frame: 3 } },
            PageMapping { page: 1, location: PageLocation::BackingStore },
        ];
        assert_eq!(format_page_table(&rows), "page 0    frame 3\npage 1    backing store\n");
    }
}
