//! Measures elapsed CPU cycles with a free-running performance counter.
//!
//! The counter has a global section (which counts while measuring is started) and a number of
//! named sub-sections, each of which accumulates cycles between a begin and end marker while the
//! counter is running. [TimingHarness] brackets an operation with the right sequence of counter
//! operations and reads back the elapsed cycles.

use crate::mmio::Registers;
use log::debug;

/// A numbered sub-section of the performance counter. Section 0 is the global section and can't
/// be used directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Section(u8);

impl Section {
    /// The highest section index supported.
    pub const MAX_INDEX: u8 = 7;
    /// The section used for single measurements.
    pub const FIRST: Section = Section(1);
    /// The section used for the second operation of a paired measurement.
    pub const SECOND: Section = Section(2);

    /// Returns the section with the given index, if it is in the range `1..=MAX_INDEX`.
    pub const fn new(index: u8) -> Option<Section> {
        if index >= 1 && index <= Section::MAX_INDEX {
            Some(Section(index))
        } else {
            None
        }
    }

    pub fn index(self) -> u8 {
        self.0
    }
}

/// A free-running cycle counter with reset, start/stop, and per-section begin/end operations.
///
/// Implementations must ignore [PerfCounter::end] for a section that isn't currently active, and
/// [PerfCounter::stop_measuring] while the counter isn't running, since a measurement may be
/// finished early from an interrupt routine and then again by the code that started it.
pub trait PerfCounter {
    /// Stops the counter and clears the global and all section counts.
    fn reset(&self);
    /// Starts the global count. Sections only count while the counter is running.
    fn start_measuring(&self);
    /// Stops the global count.
    fn stop_measuring(&self);
    /// Marks the beginning of an interval in the given section.
    fn begin(&self, section: Section);
    /// Marks the end of an interval in the given section, adding it to the section's count.
    fn end(&self, section: Section);
    /// Returns the cycles accumulated in the given section since the last reset.
    fn section_cycles(&self, section: Section) -> u64;
    /// Returns how many intervals the given section accumulated since the last reset.
    fn section_occurrences(&self, section: Section) -> u32;
    /// Returns the cycles accumulated by the global section since the last reset.
    fn total_cycles(&self) -> u64;

    /// Ends the given section and stops the counter.
    fn finish(&self, section: Section) {
        self.end(section);
        self.stop_measuring();
    }
}

/// The result of a measured operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement<T> {
    /// Whatever the operation returned.
    pub value: T,
    /// The cycles that elapsed while the operation ran.
    pub cycles: u64,
}

/// Brackets operations with performance counter measurements.
pub struct TimingHarness<'a, C> {
    counter: &'a C,
    clock_hz: u32,
}

impl<'a, C: PerfCounter> TimingHarness<'a, C> {
    /// Creates a harness around the given counter. `clock_hz` is only used to convert cycles to
    /// seconds in the logged reports.
    pub fn new(counter: &'a C, clock_hz: u32) -> TimingHarness<'a, C> {
        TimingHarness { counter, clock_hz }
    }

    pub fn counter(&self) -> &'a C {
        self.counter
    }

    /// Resets the counter, runs `op` in [Section::FIRST], and returns its result along with the
    /// cycles it took. Only the operation itself is inside the section, so anything the caller does
    /// before or after doesn't affect the count.
    pub fn measure<T, F>(&self, label: &str, op: F) -> Measurement<T>
    where
        F: FnOnce() -> T,
    {
        self.counter.reset();
        self.counter.start_measuring();
        self.counter.begin(Section::FIRST);
        let value = op();
        self.counter.finish(Section::FIRST);

        let cycles = self.counter.section_cycles(Section::FIRST);
        self.log_report(&[(label, Section::FIRST)]);
        Measurement { value, cycles }
    }

    /// Like [TimingHarness::measure], but hands `op` a callback that ends the measurement early,
    /// so that any work `op` does after calling it isn't counted. The measurement ends when `op`
    /// returns if the callback wasn't called.
    pub fn measure_until<T, F>(&self, label: &str, op: F) -> Measurement<T>
    where
        F: FnOnce(&dyn Fn()) -> T,
    {
        let counter = self.counter;
        self.measure(label, || op(&|| counter.finish(Section::FIRST)))
    }

    /// Like [TimingHarness::measure], but runs two operations back to back under a single counter
    /// reset, in [Section::FIRST] and [Section::SECOND] respectively.
    pub fn measure_pair<A, B, FA, FB>(
        &self,
        (first_label, first_op): (&str, FA),
        (second_label, second_op): (&str, FB),
    ) -> (Measurement<A>, Measurement<B>)
    where
        FA: FnOnce() -> A,
        FB: FnOnce() -> B,
    {
        self.counter.reset();
        self.counter.start_measuring();
        self.counter.begin(Section::FIRST);
        let first = first_op();
        self.counter.end(Section::FIRST);
        self.counter.begin(Section::SECOND);
        let second = second_op();
        self.counter.finish(Section::SECOND);

        let first = Measurement {
            value: first,
            cycles: self.counter.section_cycles(Section::FIRST),
        };
        let second = Measurement {
            value: second,
            cycles: self.counter.section_cycles(Section::SECOND),
        };
        self.log_report(&[
            (first_label, Section::FIRST),
            (second_label, Section::SECOND),
        ]);
        (first, second)
    }

    fn log_report(&self, sections: &[(&str, Section)]) {
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "{}",
                FormatReport {
                    counter: self.counter,
                    clock_hz: self.clock_hz,
                    sections,
                }
            );
        }
    }
}

/// Prints a table of the given counter sections, with their share of the total, their duration in
/// seconds and in cycles, and their number of occurrences.
pub struct FormatReport<'a, C> {
    pub counter: &'a C,
    pub clock_hz: u32,
    pub sections: &'a [(&'a str, Section)],
}

impl<'a, C: PerfCounter> core::fmt::Display for FormatReport<'a, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let seconds = |cycles: u64| {
            if self.clock_hz == 0 {
                0.0
            } else {
                cycles as f64 / self.clock_hz as f64
            }
        };
        let total = self.counter.total_cycles();
        writeln!(f, "--Performance Counter Report--")?;
        writeln!(
            f,
            "Total Time: {:.6} seconds ({total} clock-cycles)",
            seconds(total)
        )?;
        writeln!(f, "+-----------------+--------+-------------+-------------+-------------+")?;
        writeln!(f, "| Section         |      % |  Time (sec) |    Time (cc)| Occurrences |")?;
        write!(f, "+-----------------+--------+-------------+-------------+-------------+")?;
        for (name, section) in self.sections {
            let cycles = self.counter.section_cycles(*section);
            let percent = if total == 0 {
                0.0
            } else {
                cycles as f64 * 100.0 / total as f64
            };
            write!(
                f,
                "\n| {name:<15} | {percent:>6.1} | {:>11.6} | {cycles:>11} | {:>11} |",
                seconds(cycles),
                self.counter.section_occurrences(*section)
            )?;
        }
        Ok(())
    }
}

/// Drives an Avalon-style performance counter peripheral through its registers.
///
/// Each section `n` (with section 0 being the global section) occupies four words starting at byte
/// offset `16 * n`: the low and high halves of its cycle count, followed by its occurrence count.
/// Writes to the low-half register end the section (or, for section 0, stop the counter, or reset
/// everything when the written value is 1), and writes to the high-half register begin the section
/// (or, for section 0, start the counter).
pub struct AvalonPerfCounter<'a, R> {
    regs: &'a R,
}

impl<'a, R: Registers> AvalonPerfCounter<'a, R> {
    pub fn new(regs: &'a R) -> AvalonPerfCounter<'a, R> {
        AvalonPerfCounter { regs }
    }

    fn time_lo(index: u8) -> usize {
        16 * index as usize
    }

    fn time_hi(index: u8) -> usize {
        16 * index as usize + 4
    }

    fn events(index: u8) -> usize {
        16 * index as usize + 8
    }

    fn cycles(&self, index: u8) -> u64 {
        let lo = self.regs.read(Self::time_lo(index));
        let hi = self.regs.read(Self::time_hi(index));
        (hi as u64) << 32 | lo as u64
    }
}

impl<'a, R: Registers> PerfCounter for AvalonPerfCounter<'a, R> {
    fn reset(&self) {
        self.regs.write(Self::time_lo(0), 1);
    }

    fn start_measuring(&self) {
        self.regs.write(Self::time_hi(0), 0);
    }

    fn stop_measuring(&self) {
        self.regs.write(Self::time_lo(0), 0);
    }

    fn begin(&self, section: Section) {
        self.regs.write(Self::time_hi(section.index()), 0);
    }

    fn end(&self, section: Section) {
        self.regs.write(Self::time_lo(section.index()), 0);
    }

    fn section_cycles(&self, section: Section) -> u64 {
        self.cycles(section.index())
    }

    fn section_occurrences(&self, section: Section) -> u32 {
        self.regs.read(Self::events(section.index()))
    }

    fn total_cycles(&self) -> u64 {
        self.cycles(0)
    }
}
