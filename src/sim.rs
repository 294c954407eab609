//! Host-side models of the hardware the benchmark normally runs on, so that the whole benchmark
//! (including the interrupt-driven completion path) can be run and tested on a development machine.
//!
//! * [SimAccelerator] models the accelerator peripheral at the register level. Batches are
//!   processed by a worker thread, which writes the results directly into the caller's buffer
//!   (just like the real peripheral does over the bus) and then raises the completion "interrupt"
//!   by invoking a callback on the worker thread.
//! * [SimCounter] is a performance counter backed by the host's monotonic clock.
//! * [SimCpu] stands in for the custom instruction.

use crate::accel::reg;
use crate::bench::Cpu;
use crate::mmio::Registers;
use crate::perf::{PerfCounter, Section};
use bitvec::prelude::*;
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// The bus address at which [SimAccelerator] exposes the most recently translated buffer.
pub const SIM_BUS_WINDOW: u32 = 0x0800_0000;

/// A configuration struct for use with [SimAccelerator::new].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// How long the worker takes to process a batch, regardless of its size.
    pub latency: Duration,
    /// How long the worker takes per word, on top of [SimConfig::latency].
    pub per_word: Duration,
    /// If set, the peripheral never finishes a batch (and never touches its buffer), staying busy
    /// forever.
    pub hang: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            latency: Duration::from_micros(10),
            per_word: Duration::ZERO,
            hang: false,
        }
    }
}

/// A buffer handed to the worker thread.
struct Job {
    buffer: *mut u32,
    len: usize,
}

// SAFETY: the driver guarantees the buffer stays valid, and isn't accessed by anything else, until
// the batch completes. The worker is the only one touching it in the meantime.
unsafe impl Send for Job {}

/// The register state, shared between the register interface and the worker thread.
struct Shared {
    config: SimConfig,
    address: AtomicU32,
    length: AtomicU32,
    status: AtomicU32,
    irq_enabled: AtomicBool,
    irq: OnceLock<&'static (dyn Fn() + Sync)>,
    jobs_started: AtomicU32,
}

/// A software model of the accelerator peripheral, implementing its register contract.
///
/// Reads of either the command or the control/status register return the status bits. Starting a
/// batch sets the busy bit and clears the finished bit synchronously, so a poll right after the
/// start command never sees a stale completion. The finished bit can be cleared through either
/// register. The completion interrupt is edge-triggered: it's raised once per completed batch if
/// interrupt delivery is enabled at that moment.
pub struct SimAccelerator {
    shared: Arc<Shared>,
    window: AtomicPtr<u32>,
    jobs: Mutex<mpsc::Sender<Job>>,
}

impl SimAccelerator {
    /// Creates a new instance and spawns its worker thread. The worker exits when the instance is
    /// dropped.
    pub fn new(config: SimConfig) -> SimAccelerator {
        let shared = Arc::new(Shared {
            config,
            address: AtomicU32::new(0),
            length: AtomicU32::new(0),
            status: AtomicU32::new(0),
            irq_enabled: AtomicBool::new(false),
            irq: OnceLock::new(),
            jobs_started: AtomicU32::new(0),
        });
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker_shared = shared.clone();
        thread::spawn(move || {
            for job in receiver {
                worker_shared.process(job);
            }
            trace!("Simulated accelerator worker exiting");
        });
        SimAccelerator {
            shared,
            window: AtomicPtr::new(core::ptr::null_mut()),
            jobs: Mutex::new(sender),
        }
    }

    /// Connects the peripheral's interrupt line to the given routine, which will then be called
    /// (from the worker thread) whenever a batch completes while interrupt delivery is enabled.
    ///
    /// Returns false if an interrupt routine was already connected.
    pub fn connect_irq(&self, routine: &'static (dyn Fn() + Sync)) -> bool {
        self.shared.irq.set(routine).is_ok()
    }

    /// Returns the number of batches started so far.
    pub fn jobs_started(&self) -> u32 {
        self.shared.jobs_started.load(Ordering::SeqCst)
    }

    /// Whether interrupt delivery is currently enabled.
    pub fn irq_enabled(&self) -> bool {
        self.shared.irq_enabled.load(Ordering::SeqCst)
    }

    fn start(&self) {
        let address = self.shared.address.load(Ordering::SeqCst);
        let len = (self.shared.length.load(Ordering::SeqCst) & 0xFFFF) as usize;
        if address != SIM_BUS_WINDOW {
            warn!("Batch started at unmapped bus address 0x{address:08X}, ignoring its contents");
        }
        let buffer = if address == SIM_BUS_WINDOW {
            self.window.load(Ordering::SeqCst)
        } else {
            core::ptr::null_mut()
        };
        self.shared.status.store(reg::STATUS_BUSY, Ordering::SeqCst);
        self.shared.jobs_started.fetch_add(1, Ordering::SeqCst);
        let sent = match self.jobs.lock() {
            Ok(jobs) => jobs.send(Job { buffer, len }).is_ok(),
            Err(_) => false,
        };
        if !sent {
            warn!("Simulated accelerator worker is gone, batch will never finish");
        }
    }
}

impl Shared {
    fn process(&self, job: Job) {
        debug!("Simulated accelerator processing {} words", job.len);
        thread::sleep(self.config.latency + self.config.per_word * job.len as u32);
        if self.config.hang {
            debug!("Simulated accelerator hanging");
            return;
        }
        if !job.buffer.is_null() {
            // SAFETY: see `Job`.
            let words = unsafe { core::slice::from_raw_parts_mut(job.buffer, job.len) };
            for word in words {
                *word = swap_word(*word);
            }
        }
        // Clearing busy and setting finished in one store publishes the buffer writes above.
        self.status.store(reg::STATUS_FINISHED, Ordering::SeqCst);
        if self.irq_enabled.load(Ordering::SeqCst) {
            match self.irq.get() {
                Some(irq) => irq(),
                None => warn!("Completion interrupt raised with no routine connected"),
            }
        }
    }
}

impl Registers for SimAccelerator {
    fn read(&self, offset: usize) -> u32 {
        match offset {
            reg::COMMAND | reg::CONTROL_STATUS => self.shared.status.load(Ordering::SeqCst),
            _ => 0,
        }
    }

    fn write(&self, offset: usize, value: u32) {
        trace!("Simulated accelerator register write: offset {offset} <- 0x{value:08X}");
        let shared = &self.shared;
        match (offset, value) {
            (reg::ADDRESS, _) => shared.address.store(value, Ordering::SeqCst),
            (reg::LENGTH, _) => shared.length.store(value, Ordering::SeqCst),
            (reg::COMMAND, reg::COMMAND_START) => self.start(),
            (reg::COMMAND, reg::COMMAND_CLEAR_FINISHED)
            | (reg::CONTROL_STATUS, reg::CONTROL_CLEAR_FINISHED) => {
                shared
                    .status
                    .fetch_and(!reg::STATUS_FINISHED, Ordering::SeqCst);
            }
            (reg::CONTROL_STATUS, reg::CONTROL_IRQ_ENABLE) => {
                shared.irq_enabled.store(true, Ordering::SeqCst)
            }
            (reg::CONTROL_STATUS, reg::CONTROL_IRQ_DISABLE) => {
                shared.irq_enabled.store(false, Ordering::SeqCst)
            }
            _ => warn!("Ignoring write of 0x{value:08X} to offset {offset}"),
        }
    }

    fn bus_address(&self, buffer: *mut u32) -> u32 {
        self.window.store(buffer, Ordering::SeqCst);
        SIM_BUS_WINDOW
    }

    fn relax(&self) {
        thread::yield_now();
    }
}

/// The swap as the peripheral's datapath computes it: reverse bits 8 through 23, then exchange the
/// outer bytes.
fn swap_word(word: u32) -> u32 {
    let mut reversed = word;
    reversed.view_bits_mut::<Lsb0>()[8..24].reverse();
    (reversed & 0x00FF_FF00) | (word << 24) | (word >> 24)
}

/// Marks a section that isn't currently between a begin and an end.
const INACTIVE: u64 = u64::MAX;

struct SimSection {
    start: AtomicU64,
    elapsed: AtomicU64,
    occurrences: AtomicU32,
}

impl SimSection {
    fn new() -> SimSection {
        SimSection {
            start: AtomicU64::new(INACTIVE),
            elapsed: AtomicU64::new(0),
            occurrences: AtomicU32::new(0),
        }
    }

    fn reset(&self) {
        self.start.store(INACTIVE, Ordering::SeqCst);
        self.elapsed.store(0, Ordering::SeqCst);
        self.occurrences.store(0, Ordering::SeqCst);
    }

    fn begin(&self, now: u64) {
        self.start.store(now, Ordering::SeqCst);
    }

    /// Returns false if the section wasn't active.
    fn end(&self, now: u64) -> bool {
        let start = self.start.swap(INACTIVE, Ordering::SeqCst);
        if start == INACTIVE {
            return false;
        }
        self.elapsed
            .fetch_add(now.saturating_sub(start), Ordering::SeqCst);
        self.occurrences.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// A performance counter backed by the host's monotonic clock, reporting elapsed time as cycles of
/// a CPU running at the configured clock frequency.
///
/// All operations are atomic, so the counter can be finished from the simulated interrupt routine
/// while the main thread is waiting.
pub struct SimCounter {
    epoch: Instant,
    clock_hz: u32,
    global: SimSection,
    sections: [SimSection; Section::MAX_INDEX as usize + 1],
}

impl SimCounter {
    pub fn new(clock_hz: u32) -> SimCounter {
        SimCounter {
            epoch: Instant::now(),
            clock_hz,
            global: SimSection::new(),
            sections: core::array::from_fn(|_| SimSection::new()),
        }
    }

    pub fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn is_running(&self) -> bool {
        self.global.start.load(Ordering::SeqCst) != INACTIVE
    }

    fn cycles(&self, nanos: u64) -> u64 {
        (nanos as u128 * self.clock_hz as u128 / 1_000_000_000) as u64
    }
}

impl PerfCounter for SimCounter {
    fn reset(&self) {
        self.global.reset();
        for section in &self.sections {
            section.reset();
        }
    }

    fn start_measuring(&self) {
        if !self.is_running() {
            self.global.begin(self.now());
        }
    }

    fn stop_measuring(&self) {
        self.global.end(self.now());
    }

    fn begin(&self, section: Section) {
        if self.is_running() {
            self.sections[section.index() as usize].begin(self.now());
        }
    }

    fn end(&self, section: Section) {
        self.sections[section.index() as usize].end(self.now());
    }

    fn section_cycles(&self, section: Section) -> u64 {
        self.cycles(
            self.sections[section.index() as usize]
                .elapsed
                .load(Ordering::SeqCst),
        )
    }

    fn section_occurrences(&self, section: Section) -> u32 {
        self.sections[section.index() as usize]
            .occurrences
            .load(Ordering::SeqCst)
    }

    fn total_cycles(&self) -> u64 {
        self.cycles(self.global.elapsed.load(Ordering::SeqCst))
    }
}

/// A host CPU without the custom instruction, which computes the swap in software instead, the
/// same way the instruction's datapath does.
#[derive(Debug, Default)]
pub struct SimCpu {
    flushes: AtomicU32,
}

impl SimCpu {
    pub fn new() -> SimCpu {
        SimCpu::default()
    }

    /// Returns how often the data cache was flushed.
    pub fn flushes(&self) -> u32 {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl Cpu for SimCpu {
    fn custom_swap(&self, word: u32) -> u32 {
        let middle = ((word >> 8) as u16).reverse_bits() as u32;
        (word.swap_bytes() & 0xFF00_00FF) | middle << 8
    }

    fn flush_data_cache(&self) {
        // Host caches are coherent, all that's left to do is order the accesses.
        std::sync::atomic::fence(Ordering::SeqCst);
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{
        Accelerator, AcceleratorConfig, Completion, DoneCondition, InterruptHandler, Protocol,
    };
    use crate::permute::permute;

    const WORDS: [u32; 6] = [0, 0xFFFF_FFFF, 0x11F0_A0FF, 0x8000_0001, 0x0000_FF00, 0x1234_5678];

    fn leak(config: SimConfig) -> &'static SimAccelerator {
        Box::leak(Box::new(SimAccelerator::new(config)))
    }

    #[test]
    fn datapath_models_match_permute() {
        let cpu = SimCpu::new();
        for word in WORDS {
            assert_eq!(swap_word(word), permute(word), "0x{word:08X}");
            assert_eq!(cpu.custom_swap(word), permute(word), "0x{word:08X}");
        }
    }

    #[test]
    fn register_level_batch() {
        let sim = leak(SimConfig {
            latency: Duration::from_millis(50),
            ..SimConfig::default()
        });
        let mut buffer = WORDS;
        let address = sim.bus_address(buffer.as_mut_ptr());
        assert_eq!(address, SIM_BUS_WINDOW);
        sim.write(reg::ADDRESS, address);
        sim.write(reg::LENGTH, buffer.len() as u32);
        sim.write(reg::COMMAND, reg::COMMAND_START);
        assert_ne!(sim.read(reg::CONTROL_STATUS) & reg::STATUS_BUSY, 0);
        while sim.read(reg::CONTROL_STATUS) & reg::STATUS_FINISHED == 0 {
            sim.relax();
        }
        assert_eq!(sim.read(reg::COMMAND), reg::STATUS_FINISHED);
        assert_eq!(buffer, WORDS.map(permute));

        sim.write(reg::COMMAND, reg::COMMAND_CLEAR_FINISHED);
        assert_eq!(sim.read(reg::CONTROL_STATUS), 0);
        assert_eq!(sim.jobs_started(), 1);
    }

    #[test]
    fn polling_driver_against_sim() {
        let sim = leak(SimConfig {
            per_word: Duration::from_nanos(10),
            ..SimConfig::default()
        });
        let mut accel = Accelerator::new(AcceleratorConfig {
            registers: sim,
            completion: Completion::Polling(DoneCondition::BusyCleared),
            protocol: Protocol::default(),
            timeout_polls: u32::MAX,
        })
        .unwrap();
        let mut buffer: Vec<u32> = (0..1000).collect();
        accel.run_batch(&mut buffer).unwrap();
        assert!(buffer.iter().enumerate().all(|(i, w)| *w == permute(i as u32)));
        assert_eq!(sim.read(reg::CONTROL_STATUS), 0);
    }

    static IRQ_HANDLER: InterruptHandler<SimAccelerator> = InterruptHandler::new();

    #[test]
    fn interrupt_driver_against_sim() {
        let sim = leak(SimConfig::default());
        assert!(sim.connect_irq(Box::leak(Box::new(|| IRQ_HANDLER.on_interrupt()))));
        assert!(!sim.connect_irq(Box::leak(Box::new(|| ()))));
        let mut accel = Accelerator::new(AcceleratorConfig {
            registers: sim,
            completion: Completion::Interrupt {
                handler: &IRQ_HANDLER,
                hook: None,
            },
            protocol: Protocol::default(),
            timeout_polls: u32::MAX,
        })
        .unwrap();
        for round in 1..=3 {
            let mut buffer = WORDS;
            accel.run_batch(&mut buffer).unwrap();
            assert_eq!(buffer, WORDS.map(permute));
            assert_eq!(IRQ_HANDLER.interrupts_handled(), round);
        }
        // Re-armed for the next batch.
        assert!(sim.irq_enabled());
    }

    #[test]
    fn hanging_sim_stays_busy_and_leaves_buffer_alone() {
        let sim = leak(SimConfig {
            latency: Duration::ZERO,
            hang: true,
            ..SimConfig::default()
        });
        let mut buffer = WORDS;
        sim.write(reg::ADDRESS, sim.bus_address(buffer.as_mut_ptr()));
        sim.write(reg::LENGTH, buffer.len() as u32);
        sim.write(reg::COMMAND, reg::COMMAND_START);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sim.read(reg::CONTROL_STATUS), reg::STATUS_BUSY);
        assert_eq!(buffer, WORDS);
    }

    #[test]
    fn counter_measures_elapsed_time() {
        let counter = SimCounter::new(1_000_000_000);
        counter.reset();
        counter.start_measuring();
        counter.begin(Section::FIRST);
        thread::sleep(Duration::from_millis(2));
        counter.end(Section::FIRST);
        counter.stop_measuring();
        assert!(counter.section_cycles(Section::FIRST) >= 2_000_000);
        assert!(counter.total_cycles() >= counter.section_cycles(Section::FIRST));
        assert_eq!(counter.section_occurrences(Section::FIRST), 1);
    }

    #[test]
    fn counter_ignores_inactive_sections() {
        let counter = SimCounter::new(50_000_000);
        counter.reset();
        // Not running, so the begin is ignored.
        counter.begin(Section::FIRST);
        counter.end(Section::FIRST);
        assert_eq!(counter.section_occurrences(Section::FIRST), 0);

        counter.start_measuring();
        counter.begin(Section::SECOND);
        counter.finish(Section::SECOND);
        // Finishing again is a no-op.
        counter.finish(Section::SECOND);
        assert_eq!(counter.section_occurrences(Section::SECOND), 1);

        counter.reset();
        assert_eq!(counter.section_occurrences(Section::SECOND), 0);
        assert_eq!(counter.section_cycles(Section::SECOND), 0);
        assert_eq!(counter.total_cycles(), 0);
    }

    #[test]
    fn cpu_counts_flushes() {
        let cpu = SimCpu::new();
        cpu.flush_data_cache();
        cpu.flush_data_cache();
        assert_eq!(cpu.flushes(), 2);
    }
}
