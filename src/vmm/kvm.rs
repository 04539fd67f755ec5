//! KVM setup and VM management

use std::sync::{Arc, Mutex};

use kvm_ioctls::{Cap, Kvm, VmFd};
use tracing::debug;
use vm_memory::GuestMemoryMmap;

use crate::vmm::config::VmConfig;
use crate::vmm::memory::{MemoryRegion, SlotAllocator};
use crate::{Error, Result};

/// VM descriptor plus the guest memory it must not outlive
///
/// Shared between a [`Vm`] and its vCPUs. Fields drop in order, so the
/// descriptor is closed before any retained guest memory is unmapped.
pub(crate) struct VmState {
    fd: VmFd,
    memory: Mutex<Vec<Arc<GuestMemoryMmap>>>,
}

impl VmState {
    pub(crate) fn fd(&self) -> &VmFd {
        &self.fd
    }
}

/// Represents a KVM virtual machine
///
/// The session object of the vendor API: every memory and vCPU operation
/// goes through it, and it must outlive all of its vCPUs.
pub struct Vm {
    /// `None` once destroyed
    state: Option<Arc<VmState>>,
    /// Size of the per-vCPU `kvm_run` mapping, queried once
    run_size: usize,
    /// IPA size requested at creation, if any
    ipa_size: Option<u32>,
    pub(super) slots: SlotAllocator,
    pub(super) regions: Vec<MemoryRegion>,
    pub(super) next_vcpu_id: u64,
}

impl Vm {
    /// Create a new KVM VM
    ///
    /// `/dev/kvm` is only held for the duration of this call.
    pub fn create(config: &VmConfig) -> Result<Self> {
        config.validate()?;

        // Open /dev/kvm
        let kvm = Kvm::new()?;
        debug!("KVM API version: {}", kvm.get_api_version());

        Self::check_extensions(&kvm)?;
        Self::check_ipa_size(&kvm, config)?;

        let run_size = kvm.get_vcpu_mmap_size()?;
        debug!("vCPU run structure size: {:#x}", run_size);

        let fd = kvm.create_vm_with_type(config.vm_type())?;
        drop(kvm);
        debug!("Created KVM VM (type {:#x})", config.vm_type());

        Ok(Self {
            state: Some(Arc::new(VmState {
                fd,
                memory: Mutex::new(Vec::new()),
            })),
            run_size,
            ipa_size: config.ipa_size,
            slots: SlotAllocator::default(),
            regions: Vec::new(),
            next_vcpu_id: 0,
        })
    }

    /// Check that required KVM extensions are available
    fn check_extensions(kvm: &Kvm) -> Result<()> {
        #[allow(unused_mut)]
        let mut required_caps = vec![(Cap::UserMemory, "USER_MEMORY")];
        #[cfg(target_arch = "aarch64")]
        required_caps.push((Cap::ArmPsci02, "ARM_PSCI_0_2"));

        for (cap, name) in required_caps {
            if !kvm.check_extension(cap) {
                debug!("KVM capability {} missing", name);
                return Err(Error::Unsupported(name));
            }
            debug!("KVM capability {} available", name);
        }

        Ok(())
    }

    #[cfg(target_arch = "aarch64")]
    fn check_ipa_size(kvm: &Kvm, config: &VmConfig) -> Result<()> {
        let Some(bits) = config.ipa_size else {
            return Ok(());
        };
        let limit = kvm.get_host_ipa_limit();
        if limit <= 0 || i64::from(bits) > i64::from(limit) {
            return Err(Error::Config(format!(
                "IPA size {} exceeds host limit {}",
                bits, limit
            )));
        }
        Ok(())
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn check_ipa_size(_kvm: &Kvm, config: &VmConfig) -> Result<()> {
        match config.ipa_size {
            Some(_) => Err(Error::Unsupported("IPA size selection")),
            None => Ok(()),
        }
    }

    /// Close the VM descriptor
    ///
    /// Fails if the VM was already destroyed or still has live vCPUs.
    pub fn destroy(&mut self) -> Result<()> {
        let vcpus = self.live_vcpus();
        if vcpus > 0 {
            return Err(Error::VcpusAlive(vcpus));
        }
        self.state.take().ok_or(Error::VmDestroyed)?;
        self.regions.clear();
        debug!("Destroyed KVM VM");
        Ok(())
    }

    pub(crate) fn state(&self) -> Result<&Arc<VmState>> {
        self.state.as_ref().ok_or(Error::VmDestroyed)
    }

    /// Get reference to the VM file descriptor
    pub fn vm_fd(&self) -> Result<&VmFd> {
        self.state().map(|state| state.fd())
    }

    /// Keep guest memory mapped for as long as the VM descriptor lives
    pub(super) fn retain_memory(&self, memory: Arc<GuestMemoryMmap>) -> Result<()> {
        self.state()?
            .memory
            .lock()
            .map_err(|_| Error::Memory("Guest memory list lock poisoned".into()))?
            .push(memory);
        Ok(())
    }

    /// Number of vCPUs of this VM that have not been dropped
    pub fn live_vcpus(&self) -> usize {
        self.state
            .as_ref()
            .map_or(0, |state| Arc::strong_count(state) - 1)
    }

    /// Whether [`destroy`](Self::destroy) has run
    pub fn is_destroyed(&self) -> bool {
        self.state.is_none()
    }

    /// Size in bytes of each vCPU's shared run structure
    pub fn run_size(&self) -> usize {
        self.run_size
    }

    /// IPA size requested at creation; `None` means the kernel default
    pub fn ipa_size(&self) -> Option<u32> {
        self.ipa_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_rejected() {
        // Fails validation before /dev/kvm is touched
        let err = Vm::create(&VmConfig::new().ipa_size(8)).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    #[ignore] // Requires KVM
    fn test_create_destroy_vm() {
        let mut vm = Vm::create(&VmConfig::default()).expect("Failed to create VM");
        assert!(vm.run_size() > 0);
        assert_eq!(vm.live_vcpus(), 0);

        vm.destroy().unwrap();
        assert!(vm.is_destroyed());
        assert!(matches!(vm.destroy(), Err(Error::VmDestroyed)));
        assert!(vm.vm_fd().is_err());
    }
}
