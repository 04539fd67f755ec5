//! vCPU exit information
//!
//! KVM reports why `KVM_RUN` returned through the `kvm_run` structure. The
//! vendor API instead reports one of four reasons plus an ESR-style
//! exception record. This module performs that translation.

use kvm_ioctls::VcpuExit;
use tracing::{trace, warn};

/// Why a run step stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ExitReason {
    /// The run was interrupted, usually by a cancellation request
    ///
    /// Without an in-kernel irqchip KVM also returns to userspace when the
    /// virtual timer line falls; that spurious stop is reported here too.
    Canceled = 0,
    /// The guest trapped; see [`ExitInfo::exception`]
    Exception = 1,
    /// The guest's virtual timer line went high
    VtimerActivated = 2,
    /// KVM reported an exit with no vendor equivalent
    #[default]
    Unknown = 3,
}

/// Exception detail for [`ExitReason::Exception`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitException {
    /// Exception syndrome (ESR_EL2 layout)
    pub syndrome: u64,
    /// Faulting virtual address, when known
    pub virtual_address: u64,
    /// Faulting guest physical address, when known
    pub physical_address: u64,
}

impl ExitException {
    /// Exception class, ESR bits [31:26]
    pub fn exception_class(&self) -> u8 {
        ((self.syndrome >> syndrome::EC_SHIFT) & 0x3f) as u8
    }
}

/// PSCI system event reported by KVM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    /// SYSTEM_OFF
    Shutdown,
    /// SYSTEM_RESET
    Reset,
    /// The guest reported a crash
    Crash,
    /// Any other `KVM_SYSTEM_EVENT_*` type
    Other(u32),
}

impl SystemEvent {
    fn from_kvm(kind: u32) -> Self {
        match kind {
            kvm_bindings::KVM_SYSTEM_EVENT_SHUTDOWN => SystemEvent::Shutdown,
            kvm_bindings::KVM_SYSTEM_EVENT_RESET => SystemEvent::Reset,
            kvm_bindings::KVM_SYSTEM_EVENT_CRASH => SystemEvent::Crash,
            other => SystemEvent::Other(other),
        }
    }
}

/// Exit record, repopulated after every run
///
/// MMIO data aborts are completed by KVM on the next run: a load receives
/// zero in its destination register and PC moves past the access. Callers
/// must not emulate the access or advance PC themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    /// Why the run stopped
    pub reason: ExitReason,
    /// Valid when `reason` is [`ExitReason::Exception`]
    pub exception: ExitException,
    /// Set when the guest's power-state call ended the run
    pub system_event: Option<SystemEvent>,
}

impl ExitInfo {
    pub fn canceled() -> Self {
        Self {
            reason: ExitReason::Canceled,
            ..Default::default()
        }
    }

    pub fn vtimer_activated() -> Self {
        Self {
            reason: ExitReason::VtimerActivated,
            ..Default::default()
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn exception(exception: ExitException) -> Self {
        Self {
            reason: ExitReason::Exception,
            exception,
            system_event: None,
        }
    }

    /// Exit for a PSCI call KVM turned into a system event
    pub fn system_event(event: SystemEvent) -> Self {
        Self {
            reason: ExitReason::Exception,
            exception: ExitException {
                syndrome: syndrome::hvc64(),
                ..Default::default()
            },
            system_event: Some(event),
        }
    }

    /// Exit for a `KVM_RUN` that returned `EINTR`
    ///
    /// A pending cancellation wins over a timer edge; an interruption with
    /// neither is still reported as canceled.
    pub(crate) fn interrupted(cancel_requested: bool, vtimer_was: bool, vtimer_now: bool) -> Self {
        if !cancel_requested && vtimer_now && !vtimer_was {
            Self::vtimer_activated()
        } else {
            Self::canceled()
        }
    }

    /// Whether the guest asked to power off, reset or reported a crash
    pub fn is_power_event(&self) -> bool {
        self.system_event.is_some()
    }
}

/// ESR_EL2 helpers for synthesizing syndromes KVM does not hand out
pub mod syndrome {
    pub const EC_SHIFT: u64 = 26;
    /// Instruction length: 32-bit instruction
    pub const IL: u64 = 1 << 25;
    /// HVC executed in AArch64 state
    pub const EC_HVC64: u64 = 0x16;
    /// Data abort from a lower exception level
    pub const EC_DABT_LOW: u64 = 0x24;
    /// Instruction syndrome valid; never set, the faulting instruction is
    /// not decoded
    pub const ISV: u64 = 1 << 24;
    /// Write not read
    pub const WNR: u64 = 1 << 6;

    pub fn hvc64() -> u64 {
        (EC_HVC64 << EC_SHIFT) | IL
    }

    /// Data abort syndrome for an MMIO access
    ///
    /// KVM does not report the transfer register, so ISV stays clear and
    /// only the direction is given.
    pub fn data_abort(is_write: bool) -> u64 {
        let mut esr = (EC_DABT_LOW << EC_SHIFT) | IL;
        if is_write {
            esr |= WNR;
        }
        esr
    }
}

/// Result of decoding one `KVM_RUN`
pub(crate) enum RunOutcome {
    Exit(ExitInfo),
    /// `KVM_EXIT_INTR`; classified by the caller, which knows the
    /// cancellation and timer state
    Interrupted,
}

/// Translate a KVM exit into the vendor's exit record
pub(crate) fn decode(exit: VcpuExit<'_>) -> RunOutcome {
    let info = match exit {
        VcpuExit::SystemEvent(kind, _) => ExitInfo::system_event(SystemEvent::from_kvm(kind)),
        VcpuExit::MmioRead(addr, data) => {
            // No device models: unbacked loads read as zero
            data.iter_mut().for_each(|b| *b = 0);
            ExitInfo::exception(ExitException {
                syndrome: syndrome::data_abort(false),
                virtual_address: 0,
                physical_address: addr,
            })
        }
        VcpuExit::MmioWrite(addr, data) => ExitInfo::exception(ExitException {
            syndrome: syndrome::data_abort(true),
            virtual_address: 0,
            physical_address: addr,
        }),
        #[cfg(target_arch = "aarch64")]
        VcpuExit::Debug(debug) => ExitInfo::exception(ExitException {
            syndrome: u64::from(debug.hsr),
            virtual_address: debug.far,
            physical_address: 0,
        }),
        VcpuExit::Intr => return RunOutcome::Interrupted,
        VcpuExit::FailEntry(reason, cpu) => {
            warn!("vCPU entry failed on host cpu {}: {:#x}", cpu, reason);
            ExitInfo::unknown()
        }
        VcpuExit::InternalError => {
            warn!("KVM internal error");
            ExitInfo::unknown()
        }
        other => {
            trace!("no vendor equivalent for exit {:?}", other);
            ExitInfo::unknown()
        }
    };
    RunOutcome::Exit(info)
}
