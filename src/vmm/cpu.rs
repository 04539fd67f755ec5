//! vCPU creation, register access and execution

use std::sync::Arc;

use kvm_bindings::kvm_run;
use kvm_ioctls::{VcpuFd, VmFd};
use tracing::{debug, error, trace};

use crate::vmm::cancel::{install_kick_handler, CancelState, VcpuCanceller};
use crate::vmm::config::VcpuConfig;
use crate::vmm::exit::{self, ExitInfo, RunOutcome};
use crate::vmm::irq::{self, InterruptType};
use crate::vmm::kvm::{Vm, VmState};
use crate::vmm::regs::Reg;
use crate::{Error, Result};

/// A virtual CPU of a [`Vm`]
///
/// Owns the KVM vCPU descriptor and its `kvm_run` mapping; both are released
/// when the vCPU is dropped or [`destroy`](Vcpu::destroy)ed. Holds a
/// reference to the VM descriptor, so the VM cannot be destroyed first.
pub struct Vcpu {
    id: u64,
    /// Dropped before `vm`: the mapping is released while the VM is alive
    fd: VcpuFd,
    vm: Arc<VmState>,
    /// Boxed so the address handed out by `exit_info` never moves
    exit: Box<ExitInfo>,
    cancel: Arc<CancelState>,
    /// Last virtual timer level KVM reported
    vtimer_high: bool,
}

impl Vm {
    /// Create and initialize the next vCPU of this VM
    ///
    /// On failure every resource acquired so far is released.
    pub fn create_vcpu(&mut self, _config: &VcpuConfig) -> Result<Vcpu> {
        let vm = Arc::clone(self.state()?);
        let id = self.next_vcpu_id;

        let fd = vm.fd().create_vcpu(id)?;
        // KVM keeps the vCPU id in use even if initialization fails below
        self.next_vcpu_id += 1;
        debug!("Created vCPU {} (run structure {:#x} bytes)", id, self.run_size());

        init_vcpu(vm.fd(), &fd)?;

        Ok(Vcpu {
            id,
            fd,
            vm,
            exit: Box::default(),
            cancel: Arc::new(CancelState::default()),
            vtimer_high: false,
        })
    }
}

/// Apply the host's preferred target with PSCI 0.2 enabled
#[cfg(target_arch = "aarch64")]
fn init_vcpu(vm_fd: &VmFd, vcpu_fd: &VcpuFd) -> Result<()> {
    use kvm_bindings::{kvm_vcpu_init, KVM_ARM_VCPU_PSCI_0_2};

    let mut kvi = kvm_vcpu_init::default();
    vm_fd.get_preferred_target(&mut kvi)?;
    kvi.features[0] |= 1 << KVM_ARM_VCPU_PSCI_0_2;
    vcpu_fd.vcpu_init(&kvi)?;
    debug!("Initialized vCPU: target={}, features={:#x}", kvi.target, kvi.features[0]);

    Ok(())
}

#[cfg(not(target_arch = "aarch64"))]
fn init_vcpu(_vm_fd: &VmFd, _vcpu_fd: &VcpuFd) -> Result<()> {
    Err(Error::Unsupported("vCPU initialization needs an arm64 host"))
}

impl Vcpu {
    /// Index of this vCPU within its VM
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Exit record of the last run
    ///
    /// The reference points at the same address for the vCPU's whole life.
    pub fn exit_info(&self) -> &ExitInfo {
        &self.exit
    }

    /// Handle for canceling `run` from another thread
    pub fn canceller(&self) -> VcpuCanceller {
        VcpuCanceller::new(Arc::clone(&self.cancel), self.id)
    }

    /// Run the guest until KVM returns control, then decode the exit
    ///
    /// Performs exactly one `KVM_RUN`. Every stop condition is reported
    /// through the returned exit record; only a failing ioctl is an error.
    ///
    /// A falling virtual timer line also makes KVM return early; that stop is
    /// reported as [`ExitReason::Canceled`](crate::vmm::exit::ExitReason)
    /// with no cancellation requested, and the caller should simply run again.
    pub fn run(&mut self) -> Result<&ExitInfo> {
        install_kick_handler()?;

        if self.cancel.take_request() {
            trace!("vCPU {} canceled before entry", self.id);
            *self.exit = ExitInfo::canceled();
            return Ok(&*self.exit);
        }

        let run_ptr: *mut kvm_run = self.fd.get_kvm_run();
        let guard = self.cancel.enter(run_ptr);
        if guard.requested() {
            self.fd.set_kvm_immediate_exit(1);
        }

        let outcome = match self.fd.run() {
            Ok(kvm_exit) => {
                trace!("vCPU {} exit: {:?}", self.id, kvm_exit);
                Ok(exit::decode(kvm_exit))
            }
            Err(e) if e.errno() == libc::EINTR => Ok(RunOutcome::Interrupted),
            Err(e) => Err(e),
        };

        drop(guard);
        self.fd.set_kvm_immediate_exit(0);

        let info = match outcome {
            Ok(RunOutcome::Exit(info)) => info,
            Ok(RunOutcome::Interrupted) => {
                let vtimer_now = self.vtimer_level();
                let info =
                    ExitInfo::interrupted(self.cancel.take_request(), self.vtimer_high, vtimer_now);
                self.vtimer_high = vtimer_now;
                info
            }
            Err(e) => {
                error!("vCPU {} run error: {}", self.id, e);
                return Err(Error::Kvm(e));
            }
        };

        trace!("vCPU {} stopped: {:?}", self.id, info.reason);
        *self.exit = info;
        Ok(&*self.exit)
    }

    /// Level of the EL1 virtual timer line as KVM last synced it
    #[cfg(target_arch = "aarch64")]
    fn vtimer_level(&mut self) -> bool {
        use kvm_bindings::KVM_ARM_DEV_EL1_VTIMER;

        // SAFETY: without an in-kernel irqchip the sync-regs union holds
        // `kvm_sync_regs`, which KVM updates on every exit
        let level = unsafe { self.fd.get_kvm_run().s.regs.device_irq_level };
        level & u64::from(KVM_ARM_DEV_EL1_VTIMER) != 0
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn vtimer_level(&mut self) -> bool {
        false
    }

    /// Read an 8-byte register
    pub fn get_reg(&self, reg: Reg) -> Result<u64> {
        let value = get_one_reg(&self.fd, reg.kvm_id()?)?;
        trace!("vCPU {} get {:?} = {:#x}", self.id, reg, value);
        Ok(value)
    }

    /// Write an 8-byte register
    pub fn set_reg(&mut self, reg: Reg, value: u64) -> Result<()> {
        set_one_reg(&self.fd, reg.kvm_id()?, value)?;
        trace!("vCPU {} set {:?} = {:#x}", self.id, reg, value);
        Ok(())
    }

    /// Raise or lower one of this vCPU's interrupt lines
    pub fn set_pending_interrupt(&self, kind: InterruptType, pending: bool) -> Result<()> {
        let line = irq::line_id(self.id, kind)?;
        self.vm.fd().set_irq_line(line, pending)?;
        trace!("vCPU {} {:?} line {}", self.id, kind, if pending { "raised" } else { "lowered" });
        Ok(())
    }

    /// Unmap the run structure and close the vCPU descriptor
    pub fn destroy(self) -> Result<()> {
        let Vcpu { id, fd, .. } = self;
        drop(fd);
        debug!("Destroyed vCPU {}", id);
        Ok(())
    }
}

#[cfg(target_arch = "aarch64")]
fn get_one_reg(fd: &VcpuFd, id: u64) -> Result<u64> {
    let mut bytes = [0u8; 8];
    fd.get_one_reg(id, &mut bytes)?;
    Ok(u64::from_ne_bytes(bytes))
}

#[cfg(target_arch = "aarch64")]
fn set_one_reg(fd: &VcpuFd, id: u64, value: u64) -> Result<()> {
    fd.set_one_reg(id, &value.to_ne_bytes())?;
    Ok(())
}

#[cfg(not(target_arch = "aarch64"))]
fn get_one_reg(_fd: &VcpuFd, _id: u64) -> Result<u64> {
    Err(Error::Unsupported("arm64 one-reg access"))
}

#[cfg(not(target_arch = "aarch64"))]
fn set_one_reg(_fd: &VcpuFd, _id: u64, _value: u64) -> Result<()> {
    Err(Error::Unsupported("arm64 one-reg access"))
}
