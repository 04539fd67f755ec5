//! C ABI with the vendor's `hv_*` entry points
//!
//! Callers written against the vendor hypervisor API link against these
//! symbols unchanged. Following the vendor API, one VM exists per process:
//! it lives in a global session created by [`hv_vm_create`]. vCPUs are named
//! by integer handles, so a destroyed handle is detected instead of
//! dereferenced.
//!
//! Every function returns [`HV_SUCCESS`] or [`HV_ERROR`]; the underlying
//! cause is logged through `tracing`.

#![allow(non_camel_case_types)]

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use vm_memory::GuestAddress;

use crate::vmm::{
    ExitInfo, InterruptType, MemoryFlags, Reg, Vcpu, VcpuCanceller, VcpuConfig, Vm, VmConfig,
};
use crate::{Error, Result};

pub type hv_return_t = i32;
pub type hv_vm_config_t = *mut c_void;
pub type hv_vcpu_t = u64;
pub type hv_ipa_t = u64;
pub type hv_memory_flags_t = u64;
pub type hv_reg_t = u32;
pub type hv_interrupt_type_t = u32;
pub type hv_exit_reason_t = u32;

pub const HV_SUCCESS: hv_return_t = 0;
pub const HV_ERROR: hv_return_t = -1;

pub const HV_MEMORY_READ: hv_memory_flags_t = 1 << 0;
pub const HV_MEMORY_WRITE: hv_memory_flags_t = 1 << 1;
pub const HV_MEMORY_EXEC: hv_memory_flags_t = 1 << 2;

pub const HV_INTERRUPT_TYPE_IRQ: hv_interrupt_type_t = 0;
pub const HV_INTERRUPT_TYPE_FIQ: hv_interrupt_type_t = 1;

pub const HV_EXIT_REASON_CANCELED: hv_exit_reason_t = 0;
pub const HV_EXIT_REASON_EXCEPTION: hv_exit_reason_t = 1;
pub const HV_EXIT_REASON_VTIMER_ACTIVATED: hv_exit_reason_t = 2;
pub const HV_EXIT_REASON_UNKNOWN: hv_exit_reason_t = 3;

/// `HV_REG_X0` through `HV_REG_X30` are 0 through 30
pub const HV_REG_X0: hv_reg_t = 0;
pub const HV_REG_X1: hv_reg_t = 1;
pub const HV_REG_FP: hv_reg_t = 29;
pub const HV_REG_LR: hv_reg_t = 30;
pub const HV_REG_PC: hv_reg_t = 31;
pub const HV_REG_FPCR: hv_reg_t = 32;
pub const HV_REG_FPSR: hv_reg_t = 33;
pub const HV_REG_CPSR: hv_reg_t = 34;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct hv_vcpu_exit_exception_t {
    pub syndrome: u64,
    pub virtual_address: u64,
    pub physical_address: u64,
}

/// Exit record filled by [`hv_vcpu_run`]
///
/// For a data abort the access is completed by KVM on the next run; the
/// caller must not advance PC.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct hv_vcpu_exit_t {
    pub reason: hv_exit_reason_t,
    pub exception: hv_vcpu_exit_exception_t,
}

impl From<&ExitInfo> for hv_vcpu_exit_t {
    fn from(info: &ExitInfo) -> Self {
        Self {
            reason: info.reason as hv_exit_reason_t,
            exception: hv_vcpu_exit_exception_t {
                syndrome: info.exception.syndrome,
                virtual_address: info.exception.virtual_address,
                physical_address: info.exception.physical_address,
            },
        }
    }
}

/// Opaque vCPU configuration object
pub struct hv_vcpu_config {
    config: VcpuConfig,
}

pub type hv_vcpu_config_t = *mut hv_vcpu_config;

/// The only configuration there is; handed out instead of allocating
static DEFAULT_VCPU_CONFIG: hv_vcpu_config = hv_vcpu_config {
    config: VcpuConfig {},
};

struct VcpuEntry {
    vcpu: Vcpu,
    /// Read by the C caller through the pointer returned at creation
    exit: Box<UnsafeCell<hv_vcpu_exit_t>>,
}

struct VcpuHandle {
    /// `None` once destroyed
    entry: Mutex<Option<VcpuEntry>>,
    /// Outside `entry` so a running vCPU can be canceled
    canceller: VcpuCanceller,
}

struct Session {
    vm: Vm,
    vcpus: HashMap<hv_vcpu_t, Arc<VcpuHandle>>,
    next_handle: hv_vcpu_t,
}

static SESSION: Mutex<Option<Session>> = Mutex::new(None);

// Every session mutation completes or returns an error before the lock is
// released, so a poisoned lock still guards consistent state
fn session() -> MutexGuard<'static, Option<Session>> {
    SESSION.lock().unwrap_or_else(PoisonError::into_inner)
}

fn status(op: &str, result: Result<()>) -> hv_return_t {
    match result {
        Ok(()) => HV_SUCCESS,
        Err(e) => {
            warn!("{} failed: {}", op, e);
            HV_ERROR
        }
    }
}

fn lookup(handle: hv_vcpu_t) -> Result<Arc<VcpuHandle>> {
    session()
        .as_ref()
        .ok_or(Error::NoSession)?
        .vcpus
        .get(&handle)
        .cloned()
        .ok_or(Error::InvalidHandle(handle))
}

fn with_vcpu<T>(handle: hv_vcpu_t, f: impl FnOnce(&mut VcpuEntry) -> Result<T>) -> Result<T> {
    let vcpu = lookup(handle)?;
    let mut entry = vcpu.entry.lock().unwrap_or_else(PoisonError::into_inner);
    let entry = entry.as_mut().ok_or(Error::InvalidHandle(handle))?;
    f(entry)
}

fn reg_from_hv(reg: hv_reg_t) -> Result<Reg> {
    match reg {
        HV_REG_PC => Ok(Reg::Pc),
        HV_REG_CPSR => Ok(Reg::Cpsr),
        n => Reg::gpr(n as usize)
            .ok_or_else(|| Error::Vcpu(format!("register id {} is not supported", n))),
    }
}

fn interrupt_from_hv(kind: hv_interrupt_type_t) -> Result<InterruptType> {
    match kind {
        HV_INTERRUPT_TYPE_IRQ => Ok(InterruptType::Irq),
        HV_INTERRUPT_TYPE_FIQ => Ok(InterruptType::Fiq),
        other => Err(Error::Vcpu(format!("unknown interrupt type {}", other))),
    }
}

fn vm_create(config: hv_vm_config_t) -> Result<()> {
    if !config.is_null() {
        return Err(Error::Config("VM configuration objects are not supported".into()));
    }

    let mut session = session();
    if session.is_some() {
        return Err(Error::SessionExists);
    }
    *session = Some(Session {
        vm: Vm::create(&VmConfig::default())?,
        vcpus: HashMap::new(),
        next_handle: 0,
    });
    Ok(())
}

fn vm_destroy() -> Result<()> {
    let mut session = session();
    let current = session.as_mut().ok_or(Error::NoSession)?;
    if !current.vcpus.is_empty() {
        return Err(Error::VcpusAlive(current.vcpus.len()));
    }
    current.vm.destroy()?;
    *session = None;
    Ok(())
}

/// # Safety
///
/// See [`hv_vm_map`].
unsafe fn vm_map(
    addr: *mut c_void,
    ipa: hv_ipa_t,
    size: usize,
    flags: hv_memory_flags_t,
) -> Result<()> {
    if addr.is_null() {
        return Err(Error::Memory("NULL host address".into()));
    }
    let flags = MemoryFlags::from_bits(flags)
        .ok_or_else(|| Error::Memory(format!("unknown memory flags {:#x}", flags)))?;

    let mut session = session();
    let current = session.as_mut().ok_or(Error::NoSession)?;
    // SAFETY: the caller keeps the host range mapped for the VM's lifetime
    unsafe { current.vm.map(addr.cast(), GuestAddress(ipa), size, flags)? };
    Ok(())
}

/// # Safety
///
/// See [`hv_vcpu_create`].
unsafe fn vcpu_create(
    vcpu_out: *mut hv_vcpu_t,
    exit_out: *mut *mut hv_vcpu_exit_t,
    config: hv_vcpu_config_t,
) -> Result<()> {
    if vcpu_out.is_null() || exit_out.is_null() {
        return Err(Error::Vcpu("NULL output pointer".into()));
    }
    let config = if config.is_null() {
        VcpuConfig::default()
    } else {
        // SAFETY: non-NULL configs come from hv_vcpu_config_create
        unsafe { (*config).config.clone() }
    };

    let mut session = session();
    let current = session.as_mut().ok_or(Error::NoSession)?;

    let vcpu = current.vm.create_vcpu(&config)?;
    let exit = Box::new(UnsafeCell::new(hv_vcpu_exit_t::from(vcpu.exit_info())));
    let exit_ptr = exit.get();
    let handle = current.next_handle;
    current.next_handle += 1;

    let canceller = vcpu.canceller();
    current.vcpus.insert(
        handle,
        Arc::new(VcpuHandle {
            entry: Mutex::new(Some(VcpuEntry { vcpu, exit })),
            canceller,
        }),
    );
    debug!("vCPU handle {} created", handle);

    // SAFETY: both pointers were checked for NULL; the caller provides
    // writable storage for them
    unsafe {
        vcpu_out.write(handle);
        exit_out.write(exit_ptr);
    }
    Ok(())
}

fn vcpu_destroy(handle: hv_vcpu_t) -> Result<()> {
    let vcpu = session()
        .as_mut()
        .ok_or(Error::NoSession)?
        .vcpus
        .remove(&handle)
        .ok_or(Error::InvalidHandle(handle))?;

    let entry = vcpu
        .entry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .ok_or(Error::InvalidHandle(handle))?;
    entry.vcpu.destroy()
}

fn vcpu_run(handle: hv_vcpu_t) -> Result<()> {
    with_vcpu(handle, |entry| {
        let info = *entry.vcpu.run()?;
        // SAFETY: the C side reads the record only between calls on the
        // thread driving this vCPU, and we hold the vCPU lock
        unsafe { *entry.exit.get() = hv_vcpu_exit_t::from(&info) };
        Ok(())
    })
}

fn vcpus_exit(handles: &[hv_vcpu_t]) -> Result<()> {
    let mut result = Ok(());
    for &handle in handles {
        if let Err(e) = lookup(handle).and_then(|vcpu| vcpu.canceller.cancel()) {
            warn!("Failed to cancel vCPU handle {}: {}", handle, e);
            result = Err(e);
        }
    }
    result
}

fn vcpu_get_reg(handle: hv_vcpu_t, reg: hv_reg_t, value: *mut u64) -> Result<()> {
    if value.is_null() {
        return Err(Error::Vcpu("NULL value pointer".into()));
    }
    let reg = reg_from_hv(reg)?;
    let read = with_vcpu(handle, |entry| entry.vcpu.get_reg(reg))?;
    // SAFETY: checked for NULL above; the caller passes writable storage
    unsafe { value.write(read) };
    Ok(())
}

/// Create the process's VM. `config` must be NULL.
#[no_mangle]
pub extern "C" fn hv_vm_create(config: hv_vm_config_t) -> hv_return_t {
    status("hv_vm_create", vm_create(config))
}

/// Destroy the process's VM. Every vCPU must be destroyed first.
#[no_mangle]
pub extern "C" fn hv_vm_destroy() -> hv_return_t {
    status("hv_vm_destroy", vm_destroy())
}

/// Map host memory into the guest physical address space.
///
/// # Safety
///
/// `addr..addr + size` must be a valid, page-aligned host mapping that stays
/// alive until the VM is destroyed.
#[no_mangle]
pub unsafe extern "C" fn hv_vm_map(
    addr: *mut c_void,
    ipa: hv_ipa_t,
    size: usize,
    flags: hv_memory_flags_t,
) -> hv_return_t {
    status("hv_vm_map", unsafe { vm_map(addr, ipa, size, flags) })
}

/// Return an opaque vCPU configuration. It carries no options and needs no
/// release.
#[no_mangle]
pub extern "C" fn hv_vcpu_config_create() -> hv_vcpu_config_t {
    std::ptr::addr_of!(DEFAULT_VCPU_CONFIG).cast_mut()
}

/// Create a vCPU. `config` may be NULL.
///
/// # Safety
///
/// `vcpu` and `exit` must be NULL or valid for writes. `config` must be NULL
/// or a value returned by [`hv_vcpu_config_create`]. The exit record stays
/// valid until the vCPU is destroyed.
#[no_mangle]
pub unsafe extern "C" fn hv_vcpu_create(
    vcpu: *mut hv_vcpu_t,
    exit: *mut *mut hv_vcpu_exit_t,
    config: hv_vcpu_config_t,
) -> hv_return_t {
    status("hv_vcpu_create", unsafe { vcpu_create(vcpu, exit, config) })
}

/// Destroy a vCPU. Its handle and exit record become invalid.
#[no_mangle]
pub extern "C" fn hv_vcpu_destroy(vcpu: hv_vcpu_t) -> hv_return_t {
    status("hv_vcpu_destroy", vcpu_destroy(vcpu))
}

/// Run a vCPU until it exits, then update its exit record.
#[no_mangle]
pub extern "C" fn hv_vcpu_run(vcpu: hv_vcpu_t) -> hv_return_t {
    status("hv_vcpu_run", vcpu_run(vcpu))
}

/// Force the given vCPUs out of `hv_vcpu_run`, from any thread.
///
/// # Safety
///
/// `vcpus` must point to `vcpu_count` handles, or be NULL when the count is 0.
#[no_mangle]
pub unsafe extern "C" fn hv_vcpus_exit(vcpus: *const hv_vcpu_t, vcpu_count: u32) -> hv_return_t {
    if vcpu_count == 0 {
        return HV_SUCCESS;
    }
    if vcpus.is_null() {
        return status("hv_vcpus_exit", Err(Error::Vcpu("NULL vCPU list".into())));
    }
    // SAFETY: the caller passes `vcpu_count` readable handles
    let handles = unsafe { std::slice::from_raw_parts(vcpus, vcpu_count as usize) };
    status("hv_vcpus_exit", vcpus_exit(handles))
}

/// Raise or lower a vCPU's IRQ or FIQ line.
#[no_mangle]
pub extern "C" fn hv_vcpu_set_pending_interrupt(
    vcpu: hv_vcpu_t,
    kind: hv_interrupt_type_t,
    pending: bool,
) -> hv_return_t {
    let result = interrupt_from_hv(kind)
        .and_then(|kind| with_vcpu(vcpu, |entry| entry.vcpu.set_pending_interrupt(kind, pending)));
    status("hv_vcpu_set_pending_interrupt", result)
}

/// Read a vCPU register.
///
/// # Safety
///
/// `value` must be NULL or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn hv_vcpu_get_reg(
    vcpu: hv_vcpu_t,
    reg: hv_reg_t,
    value: *mut u64,
) -> hv_return_t {
    status("hv_vcpu_get_reg", vcpu_get_reg(vcpu, reg, value))
}

/// Write a vCPU register.
#[no_mangle]
pub extern "C" fn hv_vcpu_set_reg(vcpu: hv_vcpu_t, reg: hv_reg_t, value: u64) -> hv_return_t {
    let result =
        reg_from_hv(reg).and_then(|reg| with_vcpu(vcpu, |entry| entry.vcpu.set_reg(reg, value)));
    status("hv_vcpu_set_reg", result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::{ExitException, SystemEvent};

    #[test]
    fn test_vm_create_rejects_config() {
        let mut dummy = 0u8;
        let config = std::ptr::addr_of_mut!(dummy).cast::<c_void>();
        assert_eq!(hv_vm_create(config), HV_ERROR);
    }

    #[test]
    fn test_calls_without_vm_fail() {
        assert_eq!(hv_vm_destroy(), HV_ERROR);
        assert_eq!(hv_vcpu_run(0), HV_ERROR);
        assert_eq!(hv_vcpu_destroy(0), HV_ERROR);
        assert_eq!(hv_vcpu_set_reg(0, HV_REG_PC, 0x1000), HV_ERROR);
        assert_eq!(
            hv_vcpu_set_pending_interrupt(0, HV_INTERRUPT_TYPE_IRQ, true),
            HV_ERROR
        );

        let mut buf = [0u8; 4096];
        let rc = unsafe { hv_vm_map(buf.as_mut_ptr().cast(), 0x1000, buf.len(), HV_MEMORY_READ) };
        assert_eq!(rc, HV_ERROR);
    }

    #[test]
    fn test_null_out_pointers_rejected() {
        let mut exit: *mut hv_vcpu_exit_t = std::ptr::null_mut();
        let rc = unsafe { hv_vcpu_create(std::ptr::null_mut(), &mut exit, std::ptr::null_mut()) };
        assert_eq!(rc, HV_ERROR);

        let mut handle = 0;
        let rc = unsafe { hv_vcpu_create(&mut handle, std::ptr::null_mut(), std::ptr::null_mut()) };
        assert_eq!(rc, HV_ERROR);

        let rc = unsafe { hv_vcpu_get_reg(0, HV_REG_X0, std::ptr::null_mut()) };
        assert_eq!(rc, HV_ERROR);
    }

    #[test]
    fn test_vcpus_exit_arguments() {
        assert_eq!(unsafe { hv_vcpus_exit(std::ptr::null(), 0) }, HV_SUCCESS);
        assert_eq!(unsafe { hv_vcpus_exit(std::ptr::null(), 1) }, HV_ERROR);

        let handles = [42];
        assert_eq!(unsafe { hv_vcpus_exit(handles.as_ptr(), 1) }, HV_ERROR);
    }

    #[test]
    fn test_config_create_non_null() {
        let config = hv_vcpu_config_create();
        assert!(!config.is_null());
        assert_eq!(config, hv_vcpu_config_create());
    }

    #[test]
    fn test_vendor_register_ids() {
        assert_eq!(reg_from_hv(HV_REG_X0).unwrap(), Reg::X0);
        assert_eq!(reg_from_hv(HV_REG_X1).unwrap(), Reg::X1);
        assert_eq!(reg_from_hv(HV_REG_FP).unwrap(), Reg::FP);
        assert_eq!(reg_from_hv(HV_REG_LR).unwrap(), Reg::LR);
        assert_eq!(reg_from_hv(HV_REG_PC).unwrap(), Reg::Pc);
        assert_eq!(reg_from_hv(HV_REG_CPSR).unwrap(), Reg::Cpsr);
        assert!(reg_from_hv(HV_REG_FPCR).is_err());
        assert!(reg_from_hv(HV_REG_FPSR).is_err());
        assert!(reg_from_hv(35).is_err());
    }

    #[test]
    fn test_vendor_interrupt_types() {
        assert_eq!(interrupt_from_hv(HV_INTERRUPT_TYPE_IRQ).unwrap(), InterruptType::Irq);
        assert_eq!(interrupt_from_hv(HV_INTERRUPT_TYPE_FIQ).unwrap(), InterruptType::Fiq);
        assert!(interrupt_from_hv(2).is_err());
    }

    #[test]
    fn test_exit_record_conversion() {
        let exit = hv_vcpu_exit_t::from(&ExitInfo::system_event(SystemEvent::Shutdown));
        assert_eq!(exit.reason, HV_EXIT_REASON_EXCEPTION);
        assert_eq!(exit.exception.syndrome >> 26, 0x16);

        let exit = hv_vcpu_exit_t::from(&ExitInfo::exception(ExitException {
            syndrome: 0x9200_0046,
            virtual_address: 0,
            physical_address: 0x0900_0000,
        }));
        assert_eq!(exit.exception.physical_address, 0x0900_0000);

        assert_eq!(
            hv_vcpu_exit_t::from(&ExitInfo::canceled()).reason,
            HV_EXIT_REASON_CANCELED
        );
        assert_eq!(
            hv_vcpu_exit_t::from(&ExitInfo::vtimer_activated()).reason,
            HV_EXIT_REASON_VTIMER_ACTIVATED
        );
        assert_eq!(
            hv_vcpu_exit_t::from(&ExitInfo::unknown()).reason,
            HV_EXIT_REASON_UNKNOWN
        );
    }

    #[test]
    fn test_exit_record_layout() {
        assert_eq!(std::mem::size_of::<hv_vcpu_exit_t>(), 32);
        assert_eq!(std::mem::offset_of!(hv_vcpu_exit_t, exception), 8);
    }
}
