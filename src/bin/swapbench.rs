//! Runs the swap benchmark once against the simulated hardware: first checks that all three
//! implementations agree on a handful of boundary inputs, then sweeps the default batch sizes and
//! prints the results to stdout as CSV. Logs go to stderr, and are configured through `RUST_LOG`.
//!
//! The accelerator's completion is detected through its interrupt when the `irq-completion`
//! feature is enabled, and by polling its status register otherwise.

use log::{error, info};
use std::process::ExitCode;
use swapbench::accel::{
    self, Accelerator, AcceleratorConfig, Completion, DoneCondition, InterruptHandler, Protocol,
};
use swapbench::bench::{self, Benchmark, SweepConfig, BOUNDARY_WORDS};
use swapbench::perf::{PerfCounter, Section, TimingHarness};
use swapbench::sim::{SimAccelerator, SimConfig, SimCounter, SimCpu};

/// The clock frequency of the CPU the cycle counts are reported for.
const CPU_CLOCK_HZ: u32 = 50_000_000;

static ACCEL_INTERRUPT_HANDLER: InterruptHandler<SimAccelerator> = InterruptHandler::new();

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Benchmark failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> bench::Result<()> {
    let sim: &'static SimAccelerator =
        Box::leak(Box::new(SimAccelerator::new(SimConfig::default())));
    let counter: &'static SimCounter = Box::leak(Box::new(SimCounter::new(CPU_CLOCK_HZ)));
    let cpu = SimCpu::new();

    let completion = if cfg!(feature = "irq-completion") {
        let irq: &'static (dyn Fn() + Sync) =
            Box::leak(Box::new(|| ACCEL_INTERRUPT_HANDLER.on_interrupt()));
        sim.connect_irq(irq);
        // Stop the accelerator measurement as soon as the interrupt fires, rather than once the
        // main thread gets around to noticing.
        let hook: &'static (dyn Fn() + Sync) =
            Box::leak(Box::new(move || counter.finish(Section::FIRST)));
        Completion::Interrupt {
            handler: &ACCEL_INTERRUPT_HANDLER,
            hook: Some(hook),
        }
    } else {
        Completion::Polling(DoneCondition::BusyCleared)
    };
    let accelerator = Accelerator::new(AcceleratorConfig {
        registers: sim,
        completion,
        protocol: Protocol::default(),
        timeout_polls: accel::DEFAULT_TIMEOUT_POLLS,
    })?;
    info!(
        "Accelerator completion: {}",
        if accelerator.is_interrupt_driven() {
            "interrupt"
        } else {
            "polling"
        }
    );

    let harness = TimingHarness::new(counter, CPU_CLOCK_HZ);
    let mut benchmark = Benchmark::new(harness, &cpu, accelerator);
    let config = SweepConfig::default();
    let mut scratch = vec![0u32; config.sizes.max().max(BOUNDARY_WORDS.len())];

    benchmark.check_equivalence(&BOUNDARY_WORDS, &mut scratch)?;
    info!("All implementations agree on the boundary inputs");

    let mut out = CsvSink::new(std::io::stdout().lock());
    benchmark.run_sweep(&config, &mut scratch, &mut out)?;
    Ok(())
}

/// Lets the sweep write its CSV to an [std::io::Write] sink. Since [core::fmt::Error] carries no
/// information, the underlying I/O error is logged and kept.
struct CsvSink<W> {
    inner: W,
    io_error: Option<std::io::Error>,
}

impl<W> CsvSink<W> {
    fn new(inner: W) -> CsvSink<W> {
        CsvSink {
            inner,
            io_error: None,
        }
    }
}

impl<W: std::io::Write> core::fmt::Write for CsvSink<W> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.inner.write_all(s.as_bytes()).map_err(|err| {
            error!("Failed to write CSV output: {err}");
            self.io_error = Some(err);
            core::fmt::Error
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write as _;

    struct BrokenPipe;

    impl std::io::Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn csv_sink_keeps_the_io_error() {
        let mut sink = CsvSink::new(BrokenPipe);
        assert_eq!(sink.write_str("1,2,3,4\n"), Err(core::fmt::Error));
        assert_eq!(
            sink.io_error.map(|err| err.kind()),
            Some(std::io::ErrorKind::BrokenPipe)
        );
    }

    #[test]
    fn csv_sink_passes_output_through() {
        let mut sink = CsvSink::new(Vec::new());
        writeln!(sink, "{}", bench::CSV_HEADER).unwrap();
        assert!(sink.io_error.is_none());
        assert_eq!(sink.inner, b"BatchSize,Custom,CFunction,Accelerator\n");
    }
}
