//! Benchmarks three implementations of a fixed 32-bit byte/bit swap on a small embedded processor:
//! a custom processor instruction, a plain software routine, and an external memory-mapped
//! accelerator peripheral that processes whole batches of words, either polled or interrupt
//! driven.
//!
//! The crate is `no_std` unless the `std` feature is enabled. The `std` feature adds the [sim]
//! module, a host-side software model of the hardware that the `swapbench` binary runs against.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod accel;
pub mod bench;
pub mod debug_util;
pub mod mmio;
pub mod perf;
pub mod permute;
#[cfg(target_arch = "riscv32")]
pub mod riscv;
#[cfg(feature = "std")]
pub mod sim;

pub use permute::{permute, PermutationWord};
