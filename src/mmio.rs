//! Word-sized register access to memory-mapped peripherals.

/// A block of 32-bit registers belonging to a single peripheral, addressed by byte offset from the
/// peripheral's base address.
///
/// Register accesses take `&self`, since the registers are shared with the hardware (and, for the
/// accelerator, with the completion interrupt routine) anyway. Implementations must therefore be
/// [Sync].
pub trait Registers: Sync {
    /// Reads the register at the given byte offset.
    fn read(&self, offset: usize) -> u32;

    /// Writes the register at the given byte offset.
    fn write(&self, offset: usize, value: u32);

    /// Translates a CPU-side buffer pointer into the address the peripheral must use to access the
    /// same buffer over the bus. On a flat 32-bit address space this is just the pointer value.
    fn bus_address(&self, buffer: *mut u32) -> u32 {
        buffer as usize as u32
    }

    /// Called once per iteration of every loop that waits for the peripheral.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// Accesses a peripheral's registers through volatile loads and stores at `base + offset`.
#[derive(Debug)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Creates a register block for the peripheral mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the (uncached) address of a peripheral whose registers are 4-byte aligned,
    /// and no other code may access the peripheral in a way that conflicts with the driver using
    /// this block.
    pub const unsafe fn new(base: usize) -> Mmio {
        Mmio { base }
    }

    /// Returns the base address this block was created with.
    pub fn base(&self) -> usize {
        self.base
    }
}

impl Registers for Mmio {
    fn read(&self, offset: usize) -> u32 {
        // SAFETY: `Mmio::new`'s contract guarantees the address is a valid, aligned register.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: usize, value: u32) {
        // SAFETY: see `read`.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}
