//! End-to-end tests of the benchmark against the simulated hardware.

use std::time::Duration;
use swapbench::accel::{
    self, Accelerator, AcceleratorConfig, Completion, DoneCondition, InterruptHandler, Protocol,
};
use swapbench::bench::{self, Benchmark, SampleSizeSet, SweepConfig, BOUNDARY_WORDS, CSV_HEADER};
use swapbench::perf::{PerfCounter, Section, TimingHarness};
use swapbench::permute;
use swapbench::sim::{SimAccelerator, SimConfig, SimCounter, SimCpu};

const CLOCK_HZ: u32 = 50_000_000;

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

fn polling_accelerator(
    sim: &'static SimAccelerator,
    timeout_polls: u32,
) -> Accelerator<SimAccelerator> {
    Accelerator::new(AcceleratorConfig {
        registers: sim,
        completion: Completion::Polling(DoneCondition::BusyCleared),
        protocol: Protocol::default(),
        timeout_polls,
    })
    .unwrap()
}

fn sweep_config(sizes: &[u16]) -> SweepConfig {
    SweepConfig {
        sizes: SampleSizeSet::new(sizes).unwrap(),
        verify: true,
    }
}

/// Checks the header and returns the rows' fields.
fn parse_csv(out: &str) -> Vec<[u64; 4]> {
    let mut lines = out.lines();
    assert_eq!(lines.next(), Some(CSV_HEADER));
    assert_eq!(CSV_HEADER, "BatchSize,Custom,CFunction,Accelerator");
    lines
        .map(|line| {
            let fields: Vec<u64> = line
                .split(',')
                .map(|field| {
                    field
                        .parse()
                        .unwrap_or_else(|_| panic!("non-integer field {field:?} in {line:?}"))
                })
                .collect();
            fields
                .try_into()
                .unwrap_or_else(|_| panic!("expected 4 fields in {line:?}"))
        })
        .collect()
}

#[test]
fn two_sizes_produce_two_rows_in_order() {
    let sim = leak(SimAccelerator::new(SimConfig::default()));
    let counter = SimCounter::new(CLOCK_HZ);
    let cpu = SimCpu::new();
    let mut benchmark = Benchmark::new(
        TimingHarness::new(&counter, CLOCK_HZ),
        &cpu,
        polling_accelerator(sim, u32::MAX),
    );
    let mut out = String::new();
    let report = benchmark
        .run_sweep(&sweep_config(&[5, 1]), &mut [0; 5], &mut out)
        .unwrap();

    let rows = parse_csv(&out);
    assert_eq!(rows.len(), 2, "{out}");
    assert_eq!(rows[0][0], 5);
    assert_eq!(rows[1][0], 1);
    assert!(out.ends_with('\n'));
    for (row, parsed) in report.rows().iter().zip(&rows) {
        assert_eq!(
            [row.batch_size as u64, row.custom, row.software, row.accelerator],
            *parsed
        );
    }
    assert_eq!(sim.jobs_started(), 2);
    assert_eq!(cpu.flushes(), 2);
}

#[test]
fn repeated_sweeps_have_identical_batch_size_columns() {
    let sim = leak(SimAccelerator::new(SimConfig::default()));
    let counter = SimCounter::new(CLOCK_HZ);
    let cpu = SimCpu::new();
    let mut benchmark = Benchmark::new(
        TimingHarness::new(&counter, CLOCK_HZ),
        &cpu,
        polling_accelerator(sim, u32::MAX),
    );
    let config = sweep_config(&[100, 10, 1, 50]);
    let mut scratch = vec![0; 100];

    let mut first = String::new();
    benchmark.run_sweep(&config, &mut scratch, &mut first).unwrap();
    let mut second = String::new();
    benchmark.run_sweep(&config, &mut scratch, &mut second).unwrap();

    let sizes = |out: &str| parse_csv(out).iter().map(|row| row[0]).collect::<Vec<_>>();
    assert_eq!(sizes(&first), [100, 10, 1, 50]);
    assert_eq!(sizes(&first), sizes(&second));
}

static IRQ_HANDLER: InterruptHandler<SimAccelerator> = InterruptHandler::new();

#[test]
fn interrupt_completion_sweep() {
    let sim = leak(SimAccelerator::new(SimConfig::default()));
    let counter = leak(SimCounter::new(CLOCK_HZ));
    let cpu = SimCpu::new();
    sim.connect_irq(leak(|| IRQ_HANDLER.on_interrupt()));
    let hook: &'static (dyn Fn() + Sync) = leak(move || counter.finish(Section::FIRST));
    let accelerator = Accelerator::new(AcceleratorConfig {
        registers: sim,
        completion: Completion::Interrupt {
            handler: &IRQ_HANDLER,
            hook: Some(hook),
        },
        protocol: Protocol::default(),
        timeout_polls: u32::MAX,
    })
    .unwrap();
    let mut benchmark = Benchmark::new(TimingHarness::new(counter, CLOCK_HZ), &cpu, accelerator);
    let mut scratch = vec![0; 1000];

    benchmark
        .check_equivalence(&BOUNDARY_WORDS, &mut scratch)
        .unwrap();
    let mut out = String::new();
    benchmark
        .run_sweep(&sweep_config(&[1000, 5, 0, 1]), &mut scratch, &mut out)
        .unwrap();

    let rows = parse_csv(&out);
    assert_eq!(
        rows.iter().map(|row| row[0]).collect::<Vec<_>>(),
        [1000, 5, 0, 1]
    );
    // One interrupt for the equivalence check and one per non-empty batch.
    assert_eq!(IRQ_HANDLER.interrupts_handled(), 4);
    assert_eq!(sim.jobs_started(), 4);
    assert!(sim.irq_enabled());
}

#[test]
fn hung_accelerator_aborts_with_timeout() {
    let sim = leak(SimAccelerator::new(SimConfig {
        latency: Duration::ZERO,
        hang: true,
        ..SimConfig::default()
    }));
    let counter = SimCounter::new(CLOCK_HZ);
    let cpu = SimCpu::new();
    let mut benchmark = Benchmark::new(
        TimingHarness::new(&counter, CLOCK_HZ),
        &cpu,
        polling_accelerator(sim, 1000),
    );
    let mut out = String::new();
    let err = benchmark
        .run_sweep(&sweep_config(&[0, 5, 1]), &mut [0; 5], &mut out)
        .unwrap_err();
    assert_eq!(
        err,
        bench::Error::Accelerator(accel::Error::Timeout {
            stage: accel::Stage::Completion,
            polls: 1000,
        })
    );
    // The empty batch completed before the accelerator was needed.
    let rows = parse_csv(&out);
    assert_eq!(rows.len(), 1, "{out}");
    assert_eq!(rows[0][0], 0);
    assert_eq!(
        benchmark.accelerator().state(),
        accel::AcceleratorState::ErrorCleared
    );
}

#[test]
fn batches_of_boundary_lengths() {
    let sim = leak(SimAccelerator::new(SimConfig::default()));
    let mut accelerator = polling_accelerator(sim, u32::MAX);
    for len in [0, 1, 5, accel::MAX_BATCH_LEN] {
        let mut buffer = vec![0x11F0_A0FF; len];
        accelerator.run_batch(&mut buffer).unwrap();
        assert!(
            buffer.iter().all(|word| *word == permute(0x11F0_A0FF)),
            "wrong output for batch of {len} words"
        );
    }
    // The empty batch never reached the peripheral.
    assert_eq!(sim.jobs_started(), 3);
    assert_eq!(
        accelerator.run_batch(&mut vec![0; accel::MAX_BATCH_LEN + 1]),
        Err(accel::Error::BatchTooLong(accel::MAX_BATCH_LEN + 1))
    );
}
