//! Runs the benchmark sweep: for each configured batch size, times the custom instruction, the
//! software routine, and the accelerator over that many words, and writes one CSV row per size.

use crate::accel::{self, Accelerator};
use crate::debug_util;
use crate::mmio::Registers;
use crate::perf::{PerfCounter, TimingHarness};
use crate::permute::permute;
use core::hint::black_box;
use log::{debug, error, info, log_enabled, warn};

/// The header line of the CSV output. The column order matches [SweepRow]'s fields.
pub const CSV_HEADER: &str = "BatchSize,Custom,CFunction,Accelerator";

/// The inputs the equivalence check is run on before a sweep.
pub const BOUNDARY_WORDS: [u32; 4] = [0x0000_0000, 0xFFFF_FFFF, 0x11F0_A0FF, 0x8000_0001];

/// The maximum number of batch sizes in a [SampleSizeSet].
pub const MAX_SIZES: usize = 16;

/// The batch sizes swept by default, largest first.
pub const DEFAULT_SIZES: [u16; 10] = [50000, 10000, 5000, 1000, 500, 100, 50, 10, 5, 1];

/// The processor the benchmark runs on.
pub trait Cpu {
    /// Applies the swap to `word` using the processor's custom instruction.
    fn custom_swap(&self, word: u32) -> u32;

    /// Makes sure data written to memory by a bus master other than the CPU is visible to the CPU.
    fn flush_data_cache(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// More than [MAX_SIZES] batch sizes were configured.
    TooManySizes(usize),
    /// The scratch buffer can't hold the largest configured batch.
    BufferTooSmall { needed: usize, available: usize },
    /// The accelerator failed to process a batch.
    Accelerator(accel::Error),
    /// The accelerator produced the wrong output for a word of a sweep batch.
    Mismatch {
        index: usize,
        input: u32,
        expected: u32,
        actual: u32,
    },
    /// The three implementations disagreed on the result for the given input.
    NotEquivalent {
        input: u32,
        software: u32,
        custom: u32,
        accelerator: u32,
    },
    /// The CSV output couldn't be written.
    Output(core::fmt::Error),
}
pub type Result<T> = core::result::Result<T, Error>;

impl From<accel::Error> for Error {
    fn from(err: accel::Error) -> Self {
        Error::Accelerator(err)
    }
}

impl From<core::fmt::Error> for Error {
    fn from(err: core::fmt::Error) -> Self {
        Error::Output(err)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::TooManySizes(count) => {
                write!(f, "{count} batch sizes configured, at most {MAX_SIZES} supported")
            }
            Error::BufferTooSmall { needed, available } => write!(
                f,
                "scratch buffer holds {available} words but the sweep needs {needed}"
            ),
            Error::Accelerator(err) => write!(f, "accelerator failure: {err}"),
            Error::Mismatch {
                index,
                input,
                expected,
                actual,
            } => write!(
                f,
                "accelerator output mismatch at index {index}: input 0x{input:08X}, \
                 expected 0x{expected:08X}, got 0x{actual:08X}"
            ),
            Error::NotEquivalent {
                input,
                software,
                custom,
                accelerator,
            } => write!(
                f,
                "implementations disagree for input 0x{input:08X}: software 0x{software:08X}, \
                 custom 0x{custom:08X}, accelerator 0x{accelerator:08X}"
            ),
            Error::Output(_) => write!(f, "failed to write output"),
        }
    }
}

/// The ordered batch sizes a sweep iterates over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSizeSet {
    sizes: heapless::Vec<u16, MAX_SIZES>,
}

impl SampleSizeSet {
    /// Creates a set with the given sizes, in the given order.
    pub fn new(sizes: &[u16]) -> Result<SampleSizeSet> {
        let sizes =
            heapless::Vec::from_slice(sizes).map_err(|_| Error::TooManySizes(sizes.len()))?;
        Ok(SampleSizeSet { sizes })
    }

    pub fn sizes(&self) -> &[u16] {
        &self.sizes
    }

    /// The largest size in the set, or 0 if the set is empty.
    pub fn max(&self) -> usize {
        self.sizes.iter().copied().max().unwrap_or(0) as usize
    }
}

impl Default for SampleSizeSet {
    fn default() -> Self {
        SampleSizeSet {
            sizes: DEFAULT_SIZES.iter().copied().collect(),
        }
    }
}

/// A configuration struct for use with [Benchmark::run_sweep].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    /// The batch sizes to measure, in order.
    pub sizes: SampleSizeSet,
    /// Whether to check every accelerator output word against the software routine.
    pub verify: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        SweepConfig {
            sizes: SampleSizeSet::default(),
            verify: true,
        }
    }
}

/// The three implementations being compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Implementation {
    Custom,
    Software,
    Accelerator,
}

impl Implementation {
    /// The implementation's column name in the CSV output.
    pub fn csv_column(self) -> &'static str {
        match self {
            Implementation::Custom => "Custom",
            Implementation::Software => "CFunction",
            Implementation::Accelerator => "Accelerator",
        }
    }
}

/// The cycles a single implementation took for a single batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSample {
    pub implementation: Implementation,
    pub batch_size: u16,
    pub cycles: u64,
}

/// The measurements for one batch size, i.e. one row of the CSV output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepRow {
    pub batch_size: u16,
    pub custom: u64,
    pub software: u64,
    pub accelerator: u64,
}

impl SweepRow {
    /// Returns the row's measurements, in column order.
    pub fn samples(&self) -> [TimingSample; 3] {
        let sample = |implementation, cycles| TimingSample {
            implementation,
            batch_size: self.batch_size,
            cycles,
        };
        [
            sample(Implementation::Custom, self.custom),
            sample(Implementation::Software, self.software),
            sample(Implementation::Accelerator, self.accelerator),
        ]
    }
}

impl core::fmt::Display for SweepRow {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.batch_size, self.custom, self.software, self.accelerator
        )
    }
}

/// The rows of a completed sweep, in the order they were measured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    rows: heapless::Vec<SweepRow, MAX_SIZES>,
}

impl SweepReport {
    pub fn rows(&self) -> &[SweepRow] {
        &self.rows
    }

    pub fn samples(&self) -> impl Iterator<Item = TimingSample> + '_ {
        self.rows.iter().flat_map(|row| row.samples())
    }

    pub fn batch_sizes(&self) -> impl Iterator<Item = u16> + '_ {
        self.rows.iter().map(|row| row.batch_size)
    }
}

/// Ties together the timing harness, the CPU, and the accelerator driver.
pub struct Benchmark<'a, C, P, R: 'static> {
    harness: TimingHarness<'a, C>,
    cpu: &'a P,
    accelerator: Accelerator<R>,
}

impl<'a, C: PerfCounter, P: Cpu, R: Registers> Benchmark<'a, C, P, R> {
    pub fn new(
        harness: TimingHarness<'a, C>,
        cpu: &'a P,
        accelerator: Accelerator<R>,
    ) -> Benchmark<'a, C, P, R> {
        Benchmark {
            harness,
            cpu,
            accelerator,
        }
    }

    pub fn accelerator(&self) -> &Accelerator<R> {
        &self.accelerator
    }

    /// Computes each of `words` with all three implementations, failing with
    /// [Error::NotEquivalent] on the first input they disagree on. The accelerator processes all
    /// of `words` as a single batch, using `scratch` as its buffer.
    pub fn check_equivalence(&mut self, words: &[u32], scratch: &mut [u32]) -> Result<()> {
        let available = scratch.len();
        let buffer = scratch
            .get_mut(..words.len())
            .ok_or(Error::BufferTooSmall {
                needed: words.len(),
                available,
            })?;
        buffer.copy_from_slice(words);
        self.accelerator.run_batch(buffer)?;
        self.cpu.flush_data_cache();

        for (input, accelerator) in words.iter().copied().zip(buffer.iter().copied()) {
            let software = permute(input);
            let custom = self.cpu.custom_swap(input);
            info!(
                "0x{input:08X} -> software 0x{software:08X}, custom 0x{custom:08X}, \
                 accelerator 0x{accelerator:08X}"
            );
            if software != custom || software != accelerator {
                error!("Implementations disagree for input 0x{input:08X}");
                return Err(Error::NotEquivalent {
                    input,
                    software,
                    custom,
                    accelerator,
                });
            }
        }
        Ok(())
    }

    /// Measures all three implementations for every size in `config.sizes`, in order, writing the
    /// CSV header and then one row per size to `out`.
    ///
    /// Each row is written as soon as all three measurements for its size are done. On failure the
    /// sweep stops, so `out` holds exactly the rows of the sizes that completed.
    ///
    /// `scratch` is used as the accelerator's buffer and must hold at least as many words as the
    /// largest configured size.
    pub fn run_sweep<W: core::fmt::Write>(
        &mut self,
        config: &SweepConfig,
        scratch: &mut [u32],
        out: &mut W,
    ) -> Result<SweepReport> {
        let needed = config.sizes.max();
        if scratch.len() < needed {
            return Err(Error::BufferTooSmall {
                needed,
                available: scratch.len(),
            });
        }

        writeln!(out, "{CSV_HEADER}")?;
        let mut report = SweepReport::default();
        for &batch_size in config.sizes.sizes() {
            info!("Measuring batch size {batch_size}");
            let row = self.measure_size(batch_size, &mut scratch[..batch_size as usize], config)?;
            writeln!(out, "{row}")?;
            report
                .rows
                .push(row)
                .map_err(|_| Error::TooManySizes(report.rows.len() + 1))?;
        }
        info!("Sweep over {} batch sizes complete", report.rows.len());
        Ok(report)
    }

    fn measure_size(
        &mut self,
        batch_size: u16,
        buffer: &mut [u32],
        config: &SweepConfig,
    ) -> Result<SweepRow> {
        let count = batch_size as u32;
        let cpu = self.cpu;

        let custom = self
            .harness
            .measure("Custom", || {
                for i in 0..count {
                    black_box(cpu.custom_swap(black_box(i)));
                }
            })
            .cycles;

        let software = self
            .harness
            .measure("CFunction", || {
                for i in 0..count {
                    black_box(permute(black_box(i)));
                }
            })
            .cycles;

        for (i, word) in buffer.iter_mut().enumerate() {
            *word = i as u32;
        }
        // Only starting the batch and waiting for its completion are timed. Acknowledging it (and
        // the driver's logging) happens after the measurement has ended, as does the flush.
        let accelerator = &mut self.accelerator;
        let measurement = self.harness.measure_until("Accelerator", |stop| {
            accelerator.run_batch_with(buffer, stop)
        });
        measurement.value?;
        cpu.flush_data_cache();
        if config.verify {
            verify(buffer)?;
        }

        let row = SweepRow {
            batch_size,
            custom,
            software,
            accelerator: measurement.cycles,
        };
        debug!("Measured {row:?}");
        Ok(row)
    }
}

/// Checks that `buffer[i] == permute(i)` for every element.
fn verify(buffer: &[u32]) -> Result<()> {
    for (index, actual) in buffer.iter().copied().enumerate() {
        let input = index as u32;
        let expected = permute(input);
        if actual != expected {
            warn!(
                "Accelerator output mismatch at index {index}: expected {}, got {}",
                debug_util::FormatWordBits(expected),
                debug_util::FormatWordBits(actual)
            );
            if log_enabled!(log::Level::Trace) {
                debug_util::log_words_hex(log::Level::Trace, buffer);
            }
            return Err(Error::Mismatch {
                index,
                input,
                expected,
                actual,
            });
        }
    }
    Ok(())
}
