//! Register identifiers and their KVM one-reg encoding
//!
//! Callers name registers symbolically with [`Reg`]. The arm64 bit-packed id
//! that `KVM_GET_ONE_REG` / `KVM_SET_ONE_REG` expect is resolved at the
//! boundary through [`CORE_REGS`], so adding a register is one table entry.

use crate::{Error, Result};

/// arm64 one-reg encoding constants (`arch/arm64/include/uapi/asm/kvm.h`)
mod encoding {
    pub const KVM_REG_ARM64: u64 = 0x6000_0000_0000_0000;
    pub const KVM_REG_SIZE_U64: u64 = 0x0030_0000_0000_0000;
    pub const KVM_REG_ARM_CORE: u64 = 0x0010 << 16;

    /// Id of a 64-bit core register at `offset` bytes into `struct kvm_regs`
    pub const fn core_reg(offset: u64) -> u64 {
        KVM_REG_ARM64 | KVM_REG_SIZE_U64 | KVM_REG_ARM_CORE | (offset / 4)
    }

    /// `regs.regs[n]`
    pub const fn gpr(n: u64) -> u64 {
        core_reg(n * 8)
    }

    /// `regs.pc`, after 31 GPRs and `sp`
    pub const PC: u64 = core_reg(32 * 8);

    /// `regs.pstate`
    pub const PSTATE: u64 = core_reg(33 * 8);
}

/// Symbolic register identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Reg {
    X0,
    X1,
    X2,
    X3,
    X4,
    X5,
    X6,
    X7,
    X8,
    X9,
    X10,
    X11,
    X12,
    X13,
    X14,
    X15,
    X16,
    X17,
    X18,
    X19,
    X20,
    X21,
    X22,
    X23,
    X24,
    X25,
    X26,
    X27,
    X28,
    X29,
    X30,
    /// Program counter
    Pc,
    /// Saved program status (PSTATE)
    Cpsr,
}

impl Reg {
    /// Frame pointer
    pub const FP: Reg = Reg::X29;
    /// Link register
    pub const LR: Reg = Reg::X30;

    const GPRS: [Reg; 31] = [
        Reg::X0,
        Reg::X1,
        Reg::X2,
        Reg::X3,
        Reg::X4,
        Reg::X5,
        Reg::X6,
        Reg::X7,
        Reg::X8,
        Reg::X9,
        Reg::X10,
        Reg::X11,
        Reg::X12,
        Reg::X13,
        Reg::X14,
        Reg::X15,
        Reg::X16,
        Reg::X17,
        Reg::X18,
        Reg::X19,
        Reg::X20,
        Reg::X21,
        Reg::X22,
        Reg::X23,
        Reg::X24,
        Reg::X25,
        Reg::X26,
        Reg::X27,
        Reg::X28,
        Reg::X29,
        Reg::X30,
    ];

    /// General purpose register `Xn`, for `n` in `0..=30`
    pub fn gpr(n: usize) -> Option<Reg> {
        Self::GPRS.get(n).copied()
    }

    /// Every register with an entry in the encoding table
    pub fn defined() -> impl Iterator<Item = Reg> {
        CORE_REGS.iter().map(|&(reg, _)| reg)
    }

    /// KVM one-reg id for this register
    pub fn kvm_id(self) -> Result<u64> {
        CORE_REGS
            .iter()
            .find(|&&(reg, _)| reg == self)
            .map(|&(_, id)| id)
            .ok_or(Error::UnknownRegister(self))
    }
}

/// Symbolic register → KVM one-reg id
pub static CORE_REGS: &[(Reg, u64)] = &[
    (Reg::X0, encoding::gpr(0)),
    (Reg::X1, encoding::gpr(1)),
    (Reg::X2, encoding::gpr(2)),
    (Reg::X3, encoding::gpr(3)),
    (Reg::X4, encoding::gpr(4)),
    (Reg::X5, encoding::gpr(5)),
    (Reg::X6, encoding::gpr(6)),
    (Reg::X7, encoding::gpr(7)),
    (Reg::X8, encoding::gpr(8)),
    (Reg::X9, encoding::gpr(9)),
    (Reg::X10, encoding::gpr(10)),
    (Reg::X11, encoding::gpr(11)),
    (Reg::X12, encoding::gpr(12)),
    (Reg::X13, encoding::gpr(13)),
    (Reg::X14, encoding::gpr(14)),
    (Reg::X15, encoding::gpr(15)),
    (Reg::X16, encoding::gpr(16)),
    (Reg::X17, encoding::gpr(17)),
    (Reg::X18, encoding::gpr(18)),
    (Reg::X19, encoding::gpr(19)),
    (Reg::X20, encoding::gpr(20)),
    (Reg::X21, encoding::gpr(21)),
    (Reg::X22, encoding::gpr(22)),
    (Reg::X23, encoding::gpr(23)),
    (Reg::X24, encoding::gpr(24)),
    (Reg::X25, encoding::gpr(25)),
    (Reg::X26, encoding::gpr(26)),
    (Reg::X27, encoding::gpr(27)),
    (Reg::X28, encoding::gpr(28)),
    (Reg::X29, encoding::gpr(29)),
    (Reg::X30, encoding::gpr(30)),
    (Reg::Pc, encoding::PC),
    (Reg::Cpsr, encoding::PSTATE),
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_known_encodings() {
        // Values from the KVM API documentation for arm64 core registers
        assert_eq!(Reg::X0.kvm_id().unwrap(), 0x6030_0000_0010_0000);
        assert_eq!(Reg::X1.kvm_id().unwrap(), 0x6030_0000_0010_0002);
        assert_eq!(Reg::Pc.kvm_id().unwrap(), 0x6030_0000_0010_0040);
        assert_eq!(Reg::Cpsr.kvm_id().unwrap(), 0x6030_0000_0010_0042);
        assert_eq!(Reg::LR.kvm_id().unwrap(), 0x6030_0000_0010_003c);
    }

    #[test]
    fn test_table_ids_unique() {
        let ids: HashSet<u64> = CORE_REGS.iter().map(|&(_, id)| id).collect();
        assert_eq!(ids.len(), CORE_REGS.len());

        let regs: HashSet<Reg> = Reg::defined().collect();
        assert_eq!(regs.len(), CORE_REGS.len());
    }

    #[test]
    fn test_gpr_lookup() {
        assert_eq!(Reg::gpr(0), Some(Reg::X0));
        assert_eq!(Reg::gpr(29), Some(Reg::FP));
        assert_eq!(Reg::gpr(30), Some(Reg::X30));
        assert_eq!(Reg::gpr(31), None);

        for n in 0..31 {
            let id = Reg::gpr(n).unwrap().kvm_id().unwrap();
            assert_eq!(id & 0xffff, (n as u64) * 2);
        }
    }
}
