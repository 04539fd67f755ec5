//! Configuration for VMs and vCPUs

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Smallest IPA size KVM accepts for an explicit VM type
pub const MIN_IPA_SIZE: u32 = 32;

/// Largest IPA size the arm64 stage-2 tables can describe
pub const MAX_IPA_SIZE: u32 = 52;

/// Configuration for creating a new VM
///
/// `VmConfig::default()` is the equivalent of passing no configuration to the
/// vendor API: the VM gets the kernel's default physical address space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    /// Guest physical address size in bits (default: kernel default, 40 bits)
    pub ipa_size: Option<u32>,
}

impl VmConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the guest physical address size in bits
    pub fn ipa_size(mut self, bits: u32) -> Self {
        self.ipa_size = Some(bits);
        self
    }

    /// Load a configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))
    }

    /// Whether this is the empty configuration
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(bits) = self.ipa_size {
            if !(MIN_IPA_SIZE..=MAX_IPA_SIZE).contains(&bits) {
                return Err(Error::Config(format!(
                    "IPA size must be between {} and {} bits, got {}",
                    MIN_IPA_SIZE, MAX_IPA_SIZE, bits
                )));
            }
        }
        Ok(())
    }

    /// KVM machine type for `KVM_CREATE_VM`
    ///
    /// The arm64 machine type carries the IPA size in its low byte; zero
    /// selects the legacy 40-bit space.
    pub(crate) fn vm_type(&self) -> u64 {
        self.ipa_size.map_or(0, |bits| u64::from(bits) & 0xff)
    }
}

/// Per-vCPU configuration
///
/// No options exist yet; the type is kept so callers can hold and pass a
/// configuration the same way they do with the vendor API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VcpuConfig {}

impl VcpuConfig {
    /// Create an empty vCPU configuration
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VmConfig::default();
        assert!(config.is_default());
        assert_eq!(config.vm_type(), 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ipa_size_vm_type() {
        let config = VmConfig::new().ipa_size(44);
        assert!(!config.is_default());
        assert_eq!(config.vm_type(), 44);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_ipa_size() {
        assert!(VmConfig::new().ipa_size(31).validate().is_err());
        assert!(VmConfig::new().ipa_size(53).validate().is_err());
        assert!(VmConfig::new().ipa_size(MIN_IPA_SIZE).validate().is_ok());
        assert!(VmConfig::new().ipa_size(MAX_IPA_SIZE).validate().is_ok());
    }

    #[test]
    fn test_json_config() {
        let config: VmConfig = serde_json::from_str(r#"{"ipa_size": 36}"#).unwrap();
        assert_eq!(config.ipa_size, Some(36));

        let empty: VmConfig = serde_json::from_str("{}").unwrap();
        assert!(empty.is_default());

        assert!(serde_json::from_str::<VmConfig>(r#"{"memory_mb": 1}"#).is_err());
    }

    #[test]
    fn test_from_missing_file() {
        let err = VmConfig::from_file("/nonexistent/hvf-kvm.json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
