//! VMM core: the vendor hypervisor API on top of KVM
//!
//! This module contains the translation layer:
//! - VM session creation and teardown
//! - Guest memory registration
//! - vCPU creation, register access and execution
//! - Exit decoding, interrupt injection and run cancellation

pub mod cancel;
pub mod config;
pub mod cpu;
pub mod exit;
pub mod irq;
pub mod kvm;
pub mod memory;
pub mod regs;

pub use self::cancel::VcpuCanceller;
pub use self::config::{VcpuConfig, VmConfig};
pub use self::cpu::Vcpu;
pub use self::exit::{ExitException, ExitInfo, ExitReason, SystemEvent};
pub use self::irq::InterruptType;
pub use self::kvm::Vm;
pub use self::memory::{MemoryFlags, MemoryRegion};
pub use self::regs::Reg;
