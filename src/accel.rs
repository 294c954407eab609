//! Drives the external swap accelerator peripheral through its memory-mapped register interface:
//! handing it a batch of words to process in place, waiting for it to finish (either by polling its
//! status register or by waiting for its completion interrupt), and acknowledging completion.
//!
//! The register layout is fixed by the peripheral's design, but different generations of the
//! peripheral report completion and expect it to be acknowledged in different ways. Those
//! differences are captured by [Completion] and [Protocol], so that a single [Accelerator::run_batch]
//! entry point works for all of them.

use crate::debug_util;
use crate::mmio::Registers;
use core::cell::RefCell;
use core::sync::atomic::{fence, AtomicBool, Ordering};
use critical_section::Mutex;
use log::{debug, trace, warn};

/// The byte offsets and values of the peripheral's registers.
pub mod reg {
    /// The bus address of the buffer to process (write-only).
    pub const ADDRESS: usize = 0;
    /// The number of words in the buffer to process (write-only). Only the low 16 bits are used.
    pub const LENGTH: usize = 4;
    /// The command register. Some generations also mirror the status bits here when read.
    pub const COMMAND: usize = 8;
    /// The control/status register. Writes control interrupt delivery, reads return status bits.
    pub const CONTROL_STATUS: usize = 12;

    /// Written to [COMMAND] to start processing the configured batch.
    pub const COMMAND_START: u32 = 1;
    /// Written to [COMMAND] to clear the "finished" flag, on generations that support it.
    pub const COMMAND_CLEAR_FINISHED: u32 = 2;

    /// Written to [CONTROL_STATUS] to disable completion interrupt delivery.
    pub const CONTROL_IRQ_DISABLE: u32 = 0;
    /// Written to [CONTROL_STATUS] to enable completion interrupt delivery.
    pub const CONTROL_IRQ_ENABLE: u32 = 1;
    /// Written to [CONTROL_STATUS] to clear a pending "finished" condition.
    pub const CONTROL_CLEAR_FINISHED: u32 = 2;

    /// Status bit set while the peripheral is processing a batch.
    pub const STATUS_BUSY: u32 = 1 << 0;
    /// Status bit set once the peripheral has finished a batch, until it is cleared.
    pub const STATUS_FINISHED: u32 = 1 << 1;
}

/// The maximum number of words in a single batch, as limited by the 16-bit length field.
pub const MAX_BATCH_LEN: usize = u16::MAX as usize;

/// The default number of polls to wait for completion (or for the acknowledgement to take
/// effect) before giving up on the peripheral.
pub const DEFAULT_TIMEOUT_POLLS: u32 = 50_000_000;

/// The step of a batch during which the peripheral stopped responding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for the peripheral to report that it finished processing the batch.
    Completion,
    /// Waiting for the peripheral's "finished" flag to clear after acknowledging completion.
    Acknowledge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The batch has more words than the 16-bit length register can represent.
    BatchTooLong(usize),
    /// A batch was started while a previous one was still running or not yet acknowledged.
    BatchInFlight,
    /// A batch was started while the completion flag of an earlier batch was still set.
    CompletionPending,
    /// An attempt to use an [InterruptHandler] with more than one [Accelerator] was detected.
    InterruptHandlerAlreadyAttached,
    /// The peripheral did not respond within the configured number of polls.
    Timeout { stage: Stage, polls: u32 },
}
pub type Result<T> = core::result::Result<T, Error>;

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::BatchTooLong(len) => write!(
                f,
                "batch of {len} words exceeds the maximum of {MAX_BATCH_LEN} words"
            ),
            Error::BatchInFlight => write!(f, "a batch is already in flight"),
            Error::CompletionPending => {
                write!(f, "the completion flag of an earlier batch is still set")
            }
            Error::InterruptHandlerAlreadyAttached => {
                write!(f, "the interrupt handler is already attached to an accelerator")
            }
            Error::Timeout { stage, polls } => write!(
                f,
                "accelerator unresponsive: no {} after {polls} polls",
                match stage {
                    Stage::Completion => "completion",
                    Stage::Acknowledge => "acknowledgement",
                }
            ),
        }
    }
}

/// The state of the peripheral, as last observed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceleratorState {
    /// No batch is in flight. A new batch may be started.
    Idle,
    /// A batch was started and has not been observed to complete yet.
    Running,
    /// A batch completed but has not been acknowledged yet.
    Done,
    /// The peripheral stopped responding and the driver gave up on the batch, disabling interrupt
    /// delivery and clearing the finished flag as best it could. A new batch may be started, but
    /// given the peripheral just hung that's unlikely to end well.
    ErrorCleared,
}

/// How a polled peripheral reports completion in its status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneCondition {
    /// The batch is complete once [reg::STATUS_BUSY] reads as zero.
    BusyCleared,
    /// The batch is complete once [reg::STATUS_FINISHED] reads as one.
    FinishedSet,
}

impl DoneCondition {
    fn is_met(self, status: u32) -> bool {
        match self {
            DoneCondition::BusyCleared => status & reg::STATUS_BUSY == 0,
            DoneCondition::FinishedSet => status & reg::STATUS_FINISHED != 0,
        }
    }
}

/// How completion of a batch must be acknowledged before the next batch can be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledge {
    /// Write [reg::CONTROL_CLEAR_FINISHED] to the control register, wait for the finished flag to
    /// clear, then (in interrupt mode) re-enable interrupt delivery.
    ClearThenRearm,
    /// Write [reg::COMMAND_CLEAR_FINISHED] to the command register and wait for the finished flag
    /// to clear.
    ClearViaCommand,
    /// The peripheral needs no acknowledgement. Its finished flag is cleared when the next batch
    /// starts.
    None,
}

/// The generation-specific details of the register protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    /// The offset of the register holding the status bits. Either [reg::CONTROL_STATUS] or, on
    /// generations that mirror the status bits there, [reg::COMMAND].
    pub status_register: usize,
    /// How completion must be acknowledged.
    pub acknowledge: Acknowledge,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol {
            status_register: reg::CONTROL_STATUS,
            acknowledge: Acknowledge::ClearThenRearm,
        }
    }
}

/// How the driver learns that the peripheral has finished a batch.
pub enum Completion<R: 'static> {
    /// Spin-read the status register until the given condition holds.
    Polling(DoneCondition),
    /// Wait for the completion interrupt, delivered to the given handler. The optional `hook` is
    /// invoked from within the interrupt routine, before anything else, e.g. to stop a running
    /// cycle measurement as early as possible.
    Interrupt {
        handler: &'static InterruptHandler<R>,
        hook: Option<&'static (dyn Fn() + Sync)>,
    },
}

/// A configuration struct for use with the [Accelerator] constructor.
pub struct AcceleratorConfig<R: 'static> {
    /// The peripheral's register block.
    pub registers: &'static R,
    /// How completion is detected.
    pub completion: Completion<R>,
    /// The generation-specific protocol details.
    pub protocol: Protocol,
    /// How many polls to wait for the peripheral before reporting a [Error::Timeout].
    pub timeout_polls: u32,
}

/// The internal form of [Completion], once the interrupt handler (if any) has been attached.
enum Waiter<R: 'static> {
    Polling(DoneCondition),
    Interrupt(&'static InterruptHandler<R>),
}

/// The main entry point to this module. Owns no state beyond the last observed
/// [AcceleratorState], the peripheral itself holds everything else.
pub struct Accelerator<R: 'static> {
    regs: &'static R,
    waiter: Waiter<R>,
    protocol: Protocol,
    timeout_polls: u32,
    state: AcceleratorState,
}

impl<R: Registers> Accelerator<R> {
    /// Creates a new instance, attaching it to the interrupt handler in the interrupt variant.
    ///
    /// A single [InterruptHandler] can only be used with one [Accelerator], and an
    /// [Error::InterruptHandlerAlreadyAttached] will be returned if this constraint is violated.
    /// The platform's interrupt controller must be set up elsewhere to call
    /// [InterruptHandler::on_interrupt] when the peripheral's interrupt line fires.
    pub fn new(config: AcceleratorConfig<R>) -> Result<Accelerator<R>> {
        let waiter = match config.completion {
            Completion::Polling(condition) => Waiter::Polling(condition),
            Completion::Interrupt { handler, hook } => {
                handler.attach(InterruptSharedResources {
                    regs: config.registers,
                    hook,
                    interrupts_handled: 0,
                })?;
                Waiter::Interrupt(handler)
            }
        };
        // Interrupt delivery is only enabled right before a batch is started.
        config
            .registers
            .write(reg::CONTROL_STATUS, reg::CONTROL_IRQ_DISABLE);
        Ok(Accelerator {
            regs: config.registers,
            waiter,
            protocol: config.protocol,
            timeout_polls: config.timeout_polls,
            state: AcceleratorState::Idle,
        })
    }

    /// Returns the state of the peripheral as last observed by the driver.
    pub fn state(&self) -> AcceleratorState {
        self.state
    }

    /// Whether this instance waits for the completion interrupt, rather than polling.
    pub fn is_interrupt_driven(&self) -> bool {
        matches!(self.waiter, Waiter::Interrupt(_))
    }

    /// Has the peripheral apply the swap to every word in `buffer`, in place, and blocks until it
    /// has finished and the completion has been acknowledged. Returns the number of polls spent
    /// waiting for completion.
    ///
    /// An empty batch returns immediately without touching the peripheral. A batch longer than
    /// [MAX_BATCH_LEN] is rejected with [Error::BatchTooLong].
    ///
    /// The caller is responsible for any cache maintenance needed before reading the results.
    ///
    /// If the peripheral doesn't respond in time an [Error::Timeout] is returned. The peripheral
    /// is then in an unknown state and may still write to `buffer` at some later point, so the
    /// caller should treat the error as fatal.
    pub fn run_batch(&mut self, buffer: &mut [u32]) -> Result<u32> {
        self.run_batch_with(buffer, || ())
    }

    /// Like [Accelerator::run_batch], but calls `on_complete` as soon as completion has been
    /// observed, before the completion is acknowledged and anything is logged. It isn't called for
    /// an empty batch, or if the peripheral times out.
    pub fn run_batch_with<F>(&mut self, buffer: &mut [u32], on_complete: F) -> Result<u32>
    where
        F: FnOnce(),
    {
        if buffer.len() > MAX_BATCH_LEN {
            return Err(Error::BatchTooLong(buffer.len()));
        }
        if buffer.is_empty() {
            debug!("Skipping empty batch");
            return Ok(0);
        }
        // SAFETY: `buffer` stays borrowed until this method returns, and we only return once the
        // peripheral has finished with it (or has stopped responding, see above).
        unsafe { self.start(buffer.as_mut_ptr(), buffer.len() as u16)? };
        let polls = self.wait_for_completion()?;
        on_complete();
        self.acknowledge()?;
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "Accelerator finished {} after {polls} polls",
                debug_util::FormatBatch(buffer)
            );
        }
        Ok(polls)
    }

    /// Programs the peripheral with the given buffer and starts processing it, without waiting for
    /// it to finish. Most callers should use [Accelerator::run_batch] instead.
    ///
    /// Fails with [Error::BatchInFlight] if an earlier batch has not been waited for and
    /// acknowledged yet, and with [Error::CompletionPending] if the completion flag is set even
    /// though no batch is in flight (e.g. after a spurious interrupt).
    ///
    /// # Safety
    ///
    /// `buffer` must point to `len` words that remain valid, and are not accessed by anything
    /// else, until [Accelerator::wait_for_completion] has returned.
    pub unsafe fn start(&mut self, buffer: *mut u32, len: u16) -> Result<()> {
        match self.state {
            AcceleratorState::Running | AcceleratorState::Done => {
                return Err(Error::BatchInFlight)
            }
            AcceleratorState::Idle | AcceleratorState::ErrorCleared => {}
        }
        if let Waiter::Interrupt(handler) = self.waiter {
            if handler.is_done() {
                return Err(Error::CompletionPending);
            }
        }

        let address = self.regs.bus_address(buffer);
        trace!("Starting batch of {len} words at bus address 0x{address:08X}");
        // Make sure the buffer contents are written out before the peripheral can start reading.
        fence(Ordering::Release);
        self.regs.write(reg::ADDRESS, address);
        self.regs.write(reg::LENGTH, len as u32);
        if let Waiter::Interrupt(_) = self.waiter {
            self.regs
                .write(reg::CONTROL_STATUS, reg::CONTROL_IRQ_ENABLE);
        }
        self.state = AcceleratorState::Running;
        self.regs.write(reg::COMMAND, reg::COMMAND_START);
        Ok(())
    }

    /// Blocks until the batch started by [Accelerator::start] has finished, or until the
    /// configured number of polls has passed. Returns the number of polls spent waiting.
    ///
    /// Returns immediately if no batch is running.
    pub fn wait_for_completion(&mut self) -> Result<u32> {
        if self.state != AcceleratorState::Running {
            return Ok(0);
        }
        for polls in 0..self.timeout_polls {
            let done = match self.waiter {
                Waiter::Polling(condition) => {
                    condition.is_met(self.regs.read(self.protocol.status_register))
                }
                Waiter::Interrupt(handler) => handler.is_done(),
            };
            if done {
                // Pairs with the peripheral's (or the interrupt routine's) release of the results.
                fence(Ordering::Acquire);
                self.state = AcceleratorState::Done;
                return Ok(polls);
            }
            self.regs.relax();
        }
        Err(self.give_up(Stage::Completion))
    }

    /// Acknowledges the completion of the batch, as required by the configured [Acknowledge]
    /// protocol, making the peripheral ready for the next batch.
    ///
    /// Fails with [Error::BatchInFlight] if the batch has not been observed to complete yet.
    pub fn acknowledge(&mut self) -> Result<()> {
        match self.state {
            AcceleratorState::Running => return Err(Error::BatchInFlight),
            AcceleratorState::Idle | AcceleratorState::ErrorCleared => return Ok(()),
            AcceleratorState::Done => {}
        }
        match self.protocol.acknowledge {
            Acknowledge::ClearThenRearm => {
                self.regs
                    .write(reg::CONTROL_STATUS, reg::CONTROL_CLEAR_FINISHED);
                self.wait_for_finished_cleared()?;
                if let Waiter::Interrupt(_) = self.waiter {
                    self.regs
                        .write(reg::CONTROL_STATUS, reg::CONTROL_IRQ_ENABLE);
                }
            }
            Acknowledge::ClearViaCommand => {
                self.regs
                    .write(reg::COMMAND, reg::COMMAND_CLEAR_FINISHED);
                self.wait_for_finished_cleared()?;
            }
            Acknowledge::None => {}
        }
        if let Waiter::Interrupt(handler) = self.waiter {
            handler.clear_done();
        }
        self.state = AcceleratorState::Idle;
        Ok(())
    }

    fn wait_for_finished_cleared(&mut self) -> Result<()> {
        for _ in 0..self.timeout_polls {
            if self.regs.read(self.protocol.status_register) & reg::STATUS_FINISHED == 0 {
                return Ok(());
            }
            self.regs.relax();
        }
        Err(self.give_up(Stage::Acknowledge))
    }

    /// Leaves the peripheral in as quiet a state as we can manage after it stopped responding, and
    /// returns the corresponding error.
    fn give_up(&mut self, stage: Stage) -> Error {
        warn!(
            "Accelerator unresponsive during {stage:?} after {} polls (status 0x{:08X})",
            self.timeout_polls,
            self.regs.read(self.protocol.status_register)
        );
        self.regs
            .write(reg::CONTROL_STATUS, reg::CONTROL_IRQ_DISABLE);
        match self.protocol.acknowledge {
            Acknowledge::ClearThenRearm => self
                .regs
                .write(reg::CONTROL_STATUS, reg::CONTROL_CLEAR_FINISHED),
            Acknowledge::ClearViaCommand => {
                self.regs.write(reg::COMMAND, reg::COMMAND_CLEAR_FINISHED)
            }
            Acknowledge::None => {}
        }
        if let Waiter::Interrupt(handler) = self.waiter {
            handler.clear_done();
        }
        self.state = AcceleratorState::ErrorCleared;
        Error::Timeout {
            stage,
            polls: self.timeout_polls,
        }
    }
}

/// Handles the accelerator's completion interrupt, and manages sharing of resources used by code
/// running in the interrupt routine and code running in the main thread of execution.
///
/// To use this you generally will define a static singleton of this type, which can then be safely
/// used from both the interrupt routine and the main thread of execution, since this type is
/// [Sync].
pub struct InterruptHandler<R: 'static> {
    state: Mutex<RefCell<InterruptHandlerState<R>>>,
    /// Set by the interrupt routine, and cleared by the main thread once it has acknowledged the
    /// completion. This is the only piece of data the main thread waits on.
    done: AtomicBool,
}

impl<R: Registers> InterruptHandler<R> {
    /// Creates a new instance.
    pub const fn new() -> InterruptHandler<R> {
        InterruptHandler {
            state: Mutex::new(RefCell::new(InterruptHandlerState::Detached)),
            done: AtomicBool::new(false),
        }
    }

    /// Transitions this instance to an attached state where it shares the register block with an
    /// [Accelerator].
    fn attach(&'static self, shared_resources: InterruptSharedResources<R>) -> Result<()> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            match &*state {
                InterruptHandlerState::Attached(_) => Err(Error::InterruptHandlerAlreadyAttached),
                InterruptHandlerState::Detached => {
                    *state = InterruptHandlerState::Attached(shared_resources);
                    Ok(())
                }
            }
        })
    }

    /// Callback to be invoked from the interrupt routine when the accelerator's completion
    /// interrupt fires.
    ///
    /// Runs the completion hook, disables further interrupt delivery (the main thread re-enables
    /// it when acknowledging), and then sets the completion flag.
    ///
    /// Panics if this instance isn't attached to an [Accelerator].
    pub fn on_interrupt(&'static self) {
        critical_section::with(|cs| match &mut *self.state.borrow_ref_mut(cs) {
            InterruptHandlerState::Attached(resources) => {
                if let Some(hook) = resources.hook {
                    hook();
                }
                resources
                    .regs
                    .write(reg::CONTROL_STATUS, reg::CONTROL_IRQ_DISABLE);
                resources.interrupts_handled += 1;
            }
            InterruptHandlerState::Detached => {
                panic!("Accelerator interrupt fired but no accelerator is attached!")
            }
        });
        // The flag is set last, so that the main thread can't re-enable interrupt delivery before
        // we've disabled it above.
        self.done.store(true, Ordering::Release);
    }

    /// Returns the number of completion interrupts handled so far.
    pub fn interrupts_handled(&'static self) -> u32 {
        critical_section::with(|cs| match &*self.state.borrow_ref(cs) {
            InterruptHandlerState::Attached(resources) => resources.interrupts_handled,
            InterruptHandlerState::Detached => 0,
        })
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn clear_done(&self) {
        self.done.store(false, Ordering::Release);
    }
}

/// Resources that are shared between the main thread of execution and the interrupt routine.
struct InterruptSharedResources<R: 'static> {
    /// Used by the interrupt routine to disable further interrupt delivery, and by the main thread
    /// to drive the peripheral.
    regs: &'static R,
    /// Invoked first thing in the interrupt routine.
    hook: Option<&'static (dyn Fn() + Sync)>,
    /// The number of completion interrupts handled.
    interrupts_handled: u32,
}

/// Reflects the initialization state of the [InterruptHandler].
enum InterruptHandlerState<R: 'static> {
    /// Initial state, where it is not attached to any accelerator yet.
    Detached,
    /// Attached state, where the completion interrupt may fire at any moment.
    Attached(InterruptSharedResources<R>),
}
