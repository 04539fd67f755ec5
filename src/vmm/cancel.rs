//! Cross-thread cancellation of a running vCPU
//!
//! A [`VcpuCanceller`] marks the vCPU as canceled and, when the vCPU is inside
//! `KVM_RUN`, kicks its thread with a real-time signal. The signal handler
//! sets `immediate_exit` in the thread's run structure, so a kick that lands
//! just before the ioctl is entered still makes it return `EINTR`.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use kvm_bindings::kvm_run;
use tracing::trace;
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};

use crate::{Error, Result};

thread_local! {
    /// Run structure of the vCPU this thread is currently running, if any
    static RUNNING_KVM_RUN: Cell<*mut kvm_run> = const { Cell::new(ptr::null_mut()) };
}

static KICK_HANDLER: OnceLock<std::result::Result<(), i32>> = OnceLock::new();

fn kick_signal() -> libc::c_int {
    SIGRTMIN()
}

extern "C" fn handle_kick(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    let run = RUNNING_KVM_RUN
        .try_with(Cell::get)
        .unwrap_or(ptr::null_mut());
    if !run.is_null() {
        // SAFETY: the pointer is published only while the owning vCPU is
        // inside `run` on this thread, so the mapping is alive
        unsafe { ptr::addr_of_mut!((*run).immediate_exit).write_volatile(1) };
    }
}

/// Install the kick handler once per process
pub(crate) fn install_kick_handler() -> Result<()> {
    (*KICK_HANDLER.get_or_init(|| {
        register_signal_handler(kick_signal(), handle_kick).map_err(|e| e.errno())
    }))
    .map_err(|errno| Error::Vcpu(format!("Failed to install vCPU kick handler: errno {}", errno)))
}

/// Cancellation state shared between a vCPU and its cancellers
#[derive(Debug, Default)]
pub(crate) struct CancelState {
    requested: AtomicBool,
    running_thread: Mutex<Option<libc::pthread_t>>,
}

impl CancelState {
    fn thread(&self) -> MutexGuard<'_, Option<libc::pthread_t>> {
        // The guarded value is a plain thread id; a poisoned lock holds no
        // broken invariant
        self.running_thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Consume a pending cancellation request
    pub(crate) fn take_request(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    /// Publish the calling thread as running the vCPU whose run structure
    /// is `run`, until the returned guard is dropped
    pub(crate) fn enter(&self, run: *mut kvm_run) -> RunGuard<'_> {
        RUNNING_KVM_RUN.with(|cell| cell.set(run));
        // SAFETY: pthread_self has no preconditions
        *self.thread() = Some(unsafe { libc::pthread_self() });
        RunGuard { state: self }
    }
}

/// Marks the span during which a vCPU thread may be kicked
pub(crate) struct RunGuard<'a> {
    state: &'a CancelState,
}

impl RunGuard<'_> {
    /// Whether a cancellation was requested before the thread was published
    pub(crate) fn requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.state.thread() = None;
        RUNNING_KVM_RUN.with(|cell| cell.set(ptr::null_mut()));
    }
}

/// Handle that can force a vCPU out of `run` from another thread
///
/// Canceling a vCPU that is not running makes its next `run` return
/// immediately with [`ExitReason::Canceled`](crate::vmm::exit::ExitReason).
#[derive(Debug, Clone)]
pub struct VcpuCanceller {
    state: Arc<CancelState>,
    vcpu_id: u64,
}

impl VcpuCanceller {
    pub(crate) fn new(state: Arc<CancelState>, vcpu_id: u64) -> Self {
        Self { state, vcpu_id }
    }

    /// Request that the vCPU stop
    pub fn cancel(&self) -> Result<()> {
        self.state.requested.store(true, Ordering::SeqCst);

        // Hold the lock across the kick so the thread cannot leave `run`
        // and exit in between
        let thread = self.state.thread();
        if let Some(tid) = *thread {
            // SAFETY: `tid` is a live thread: it clears itself under this lock
            // before leaving `run`
            let ret = unsafe { libc::pthread_kill(tid, kick_signal()) };
            if ret != 0 {
                return Err(Error::Vcpu(format!(
                    "Failed to kick vCPU {}: errno {}",
                    self.vcpu_id, ret
                )));
            }
            trace!("Kicked vCPU {}", self.vcpu_id);
        }
        Ok(())
    }

    /// Id of the vCPU this handle cancels
    pub fn vcpu_id(&self) -> u64 {
        self.vcpu_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_run() -> kvm_run {
        // SAFETY: kvm_run is plain data; all-zero is its state after mmap
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn test_cancel_idle_vcpu_is_pending() {
        let state = Arc::new(CancelState::default());
        let canceller = VcpuCanceller::new(Arc::clone(&state), 0);

        canceller.cancel().unwrap();
        assert!(state.take_request());
        assert!(!state.take_request());
    }

    #[test]
    fn test_guard_publishes_thread() {
        let state = CancelState::default();
        let mut run = zeroed_run();
        {
            let guard = state.enter(&mut run);
            assert!(state.thread().is_some());
            assert!(!guard.requested());
        }
        assert!(state.thread().is_none());
        RUNNING_KVM_RUN.with(|cell| assert!(cell.get().is_null()));
    }

    #[test]
    fn test_kick_sets_immediate_exit() {
        install_kick_handler().unwrap();

        let state = Arc::new(CancelState::default());
        let canceller = VcpuCanceller::new(Arc::clone(&state), 7);
        let mut run = zeroed_run();
        {
            let guard = state.enter(&mut run);
            // Signal delivered to this thread before pthread_kill returns
            canceller.cancel().unwrap();
            assert!(guard.requested());
        }
        assert_eq!(run.immediate_exit, 1);
        assert!(state.take_request());
    }
}
