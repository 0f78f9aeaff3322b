//! Submissions racing a live ticker are each admitted exactly once.

use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

use osemu_core::{
    Instruction, Machine, MachineConfig, MemoryConfig, Runtime, SchedulerConfig,
    SchedulingPolicy, Ticker,
};

const SUBMITTERS: usize = 4;
const PER_SUBMITTER: usize = 25;

#[test]
fn interleaved_submissions_are_enqueued_exactly_once() {
    let machine = Machine::new(MachineConfig {
        memory: MemoryConfig {
            total_memory: 1024,
            frame_size: 64,
            max_memory_per_process: 256,
            instruction_size: 4,
        },
        scheduler: SchedulerConfig {
            num_cores: 3,
            policy: SchedulingPolicy::RoundRobin { quantum: 2 },
            delay_per_exec: 0,
        },
    })
    .unwrap();
    let runtime = Runtime::spawn(machine).unwrap();
    let mut ticker = Ticker::start(runtime.handle(), Duration::from_millis(1)).unwrap();

    let workers: Vec<_> = (0..SUBMITTERS)
        .map(|t| {
            let handle = runtime.handle();
            thread::spawn(move || {
                (0..PER_SUBMITTER)
                    .map(|i| {
                        let program = vec![
                            Instruction::declare("x", i as u16),
                            Instruction::write(64, "x"),
                            Instruction::read("y", 64),
                        ];
                        handle.submit(format!("t{}-{}", t, i), program, 128).unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut pids = BTreeSet::new();
    for worker in workers {
        for pid in worker.join().unwrap() {
            assert!(pids.insert(pid), "pid {} handed out twice", pid);
        }
    }
    assert_eq!(pids.len(), SUBMITTERS * PER_SUBMITTER);

    ticker.stop();
    let mut machine = runtime.shutdown().unwrap();
    machine.run_until_idle(10_000);

    assert_eq!(machine.processes().count(), SUBMITTERS * PER_SUBMITTER);
    for process in machine.processes() {
        assert!(process.is_finished(), "{} not finished", process.name());
        assert_eq!(process.pc(), 3);
        assert_eq!(process.registers()["y"], process.registers()["x"]);
    }
    machine.check_invariants().unwrap();
}
