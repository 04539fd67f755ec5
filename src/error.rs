//! Error types for hvf-kvm

use thiserror::Error;

use crate::vmm::regs::Reg;

/// Result type alias using hvf-kvm Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in hvf-kvm operations
#[derive(Error, Debug)]
pub enum Error {
    /// KVM-related errors
    #[error("KVM error: {0}")]
    Kvm(#[from] kvm_ioctls::Error),

    /// Memory-related errors
    #[error("Memory error: {0}")]
    Memory(String),

    /// vCPU error
    #[error("vCPU error: {0}")]
    Vcpu(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Register id with no entry in the encoding table
    #[error("register {0:?} has no KVM encoding")]
    UnknownRegister(Reg),

    /// The VM has already been destroyed
    #[error("VM has been destroyed")]
    VmDestroyed,

    /// The VM still has live vCPUs
    #[error("VM still has {0} live vCPU(s)")]
    VcpusAlive(usize),

    /// A process-wide session already exists
    #[error("a VM already exists in this process")]
    SessionExists,

    /// No process-wide session exists
    #[error("no VM exists in this process")]
    NoSession,

    /// Unknown or destroyed vCPU handle
    #[error("invalid vCPU handle {0}")]
    InvalidHandle(u64),

    /// Operation not available on this host architecture
    #[error("unsupported on this host: {0}")]
    Unsupported(&'static str),
}
