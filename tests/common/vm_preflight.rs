use std::path::Path;

use kvm_ioctls::{Cap, Kvm};

/// Check that this host can run arm64 guests through KVM
pub fn require_kvm_usable() -> Result<(), String> {
    if !Path::new("/dev/kvm").exists() {
        return Err("/dev/kvm not available".to_string());
    }

    let kvm = Kvm::new().map_err(|e| format!("failed to open /dev/kvm: {e}"))?;
    let api = kvm.get_api_version();
    if api < 12 {
        return Err(format!("unexpected KVM API version {api}"));
    }
    if !kvm.check_extension(Cap::UserMemory) {
        return Err("missing KVM capability: USER_MEMORY".to_string());
    }
    if !kvm.check_extension(Cap::ArmPsci02) {
        return Err("missing KVM capability: ARM_PSCI_0_2".to_string());
    }
    kvm.create_vm()
        .map_err(|e| format!("failed to create KVM VM: {e}"))?;
    Ok(())
}

/// Number of descriptors this process has open
pub fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|dir| dir.count())
        .unwrap_or(0)
}
