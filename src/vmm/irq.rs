//! Interrupt line injection
//!
//! Without an in-kernel interrupt controller, arm64 KVM exposes each vCPU's
//! IRQ and FIQ inputs directly through `KVM_IRQ_LINE`.

use crate::{Error, Result};

const KVM_ARM_IRQ_TYPE_SHIFT: u32 = 24;
const KVM_ARM_IRQ_VCPU_SHIFT: u32 = 16;
const KVM_ARM_IRQ_TYPE_CPU: u32 = 0;
const KVM_ARM_IRQ_CPU_IRQ: u32 = 0;
const KVM_ARM_IRQ_CPU_FIQ: u32 = 1;

/// Largest vCPU index the line encoding can address
const MAX_VCPU_INDEX: u64 = 0xff;

/// Interrupt line of a vCPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InterruptType {
    Irq = 0,
    Fiq = 1,
}

impl InterruptType {
    fn cpu_line(self) -> u32 {
        match self {
            InterruptType::Irq => KVM_ARM_IRQ_CPU_IRQ,
            InterruptType::Fiq => KVM_ARM_IRQ_CPU_FIQ,
        }
    }
}

/// `kvm_irq_level.irq` for a CPU line of vCPU `vcpu_index`
pub(crate) fn line_id(vcpu_index: u64, kind: InterruptType) -> Result<u32> {
    if vcpu_index > MAX_VCPU_INDEX {
        return Err(Error::Vcpu(format!(
            "vCPU index {} cannot be addressed by KVM_IRQ_LINE",
            vcpu_index
        )));
    }
    Ok((KVM_ARM_IRQ_TYPE_CPU << KVM_ARM_IRQ_TYPE_SHIFT)
        | ((vcpu_index as u32) << KVM_ARM_IRQ_VCPU_SHIFT)
        | kind.cpu_line())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_encoding() {
        assert_eq!(line_id(0, InterruptType::Irq).unwrap(), 0);
        assert_eq!(line_id(0, InterruptType::Fiq).unwrap(), 1);
        assert_eq!(line_id(3, InterruptType::Fiq).unwrap(), 0x0003_0001);
    }

    #[test]
    fn test_line_vcpu_out_of_range() {
        assert!(line_id(256, InterruptType::Irq).is_err());
    }
}
