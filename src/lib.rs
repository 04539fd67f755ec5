//! hvf-kvm: the vendor hypervisor API on top of Linux KVM
//!
//! Programs written against the vendor's `hv_*` C API for arm64 run
//! unmodified on a Linux/arm64 host by linking against this crate. The same
//! functionality is available to Rust callers through [`vmm`], which also
//! lifts the one-VM-per-process restriction.
//!
//! # Key Features
//!
//! - **Vendor ABI**: `hv_vm_*` / `hv_vcpu_*` symbols with vendor types and values
//! - **KVM exits translated**: PSCI power events, MMIO and debug exits become
//!   vendor exception records with synthesized syndromes
//! - **Cancellation**: force a running vCPU out from any thread
//!
//! # Example: Rust API
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hvf_kvm::vmm::memory::{read_u64_from_guest, write_to_guest};
//! use hvf_kvm::{MemoryFlags, Reg, VcpuConfig, Vm, VmConfig};
//! use vm_memory::{GuestAddress, GuestMemoryMmap};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let base = GuestAddress(hvf_kvm::sample::MEM_BASE);
//!     let memory = Arc::new(GuestMemoryMmap::from_ranges(&[(base, 0x10_0000)])?);
//!     write_to_guest(&memory, base, &hvf_kvm::sample::ARITH_GUEST)?;
//!
//!     let mut vm = Vm::create(&VmConfig::default())?;
//!     vm.map_guest_memory(Arc::clone(&memory), MemoryFlags::all())?;
//!
//!     let mut vcpu = vm.create_vcpu(&VcpuConfig::default())?;
//!     vcpu.set_reg(Reg::Pc, base.0)?;
//!     vcpu.set_reg(Reg::X1, hvf_kvm::sample::result_addr())?;
//!
//!     let exit = vcpu.run()?;
//!     println!("exit: {:?}", exit.reason);
//!     let result_addr = GuestAddress(hvf_kvm::sample::result_addr());
//!     println!("result: {}", read_u64_from_guest(&memory, result_addr)?);
//!
//!     vcpu.destroy()?;
//!     vm.destroy()?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod ffi;
pub mod sample;
pub mod vmm;

// Re-exports for convenience
pub use error::{Error, Result};
pub use vmm::{
    ExitException, ExitInfo, ExitReason, InterruptType, MemoryFlags, MemoryRegion, Reg,
    SystemEvent, Vcpu, VcpuCanceller, VcpuConfig, Vm, VmConfig,
};
