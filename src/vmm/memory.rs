//! Guest memory registration and access utilities

use std::sync::Arc;

use bitflags::bitflags;
use kvm_bindings::{kvm_userspace_memory_region, KVM_MEM_READONLY};
use tracing::debug;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion};

use crate::vmm::kvm::Vm;
use crate::{Error, Result};

bitflags! {
    /// Guest access permissions for a mapped region
    ///
    /// Values match the vendor API's `HV_MEMORY_*` constants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// Largest slot id; KVM keeps the address space id in the upper half
const MAX_SLOT: u32 = u16::MAX as u32;

/// A guest physical region registered with KVM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// KVM memory slot
    pub slot: u32,
    /// Guest physical base address
    pub guest_addr: GuestAddress,
    /// Length in bytes
    pub size: u64,
    /// Host virtual address backing the region
    pub host_addr: u64,
    /// Requested permissions
    pub flags: MemoryFlags,
}

impl MemoryRegion {
    /// Read permission is implicit; only a missing WRITE changes what KVM sees
    pub fn is_read_only(&self) -> bool {
        !self.flags.contains(MemoryFlags::WRITE)
    }

    pub(crate) fn as_kvm_region(&self) -> kvm_userspace_memory_region {
        kvm_userspace_memory_region {
            slot: self.slot,
            flags: if self.is_read_only() { KVM_MEM_READONLY } else { 0 },
            guest_phys_addr: self.guest_addr.raw_value(),
            memory_size: self.size,
            userspace_addr: self.host_addr,
        }
    }
}

/// Hands out slot ids in increasing order, never reusing one
#[derive(Debug, Default)]
pub(crate) struct SlotAllocator {
    next: u32,
}

impl SlotAllocator {
    /// The slot the next successful registration will use
    pub(crate) fn peek(&self) -> Result<u32> {
        if self.next > MAX_SLOT {
            return Err(Error::Memory("Out of KVM memory slots".into()));
        }
        Ok(self.next)
    }

    /// Mark the peeked slot as used
    pub(crate) fn commit(&mut self) {
        self.next += 1;
    }
}

impl Vm {
    /// Register `size` bytes of host memory at `host_addr` as guest physical
    /// memory starting at `guest_addr`.
    ///
    /// Regions are never unmapped individually; they are released together
    /// with the VM. Overlapping regions are not detected here.
    ///
    /// # Safety
    ///
    /// `host_addr..host_addr + size` must be a valid, page-aligned mapping
    /// that stays alive until this VM and every vCPU created from it have
    /// been dropped. The guest can write to it at any time while a vCPU runs.
    pub unsafe fn map(
        &mut self,
        host_addr: *mut u8,
        guest_addr: GuestAddress,
        size: usize,
        flags: MemoryFlags,
    ) -> Result<MemoryRegion> {
        if size == 0 {
            return Err(Error::Memory("Cannot map an empty region".into()));
        }

        let region = MemoryRegion {
            slot: self.slots.peek()?,
            guest_addr,
            size: size as u64,
            host_addr: host_addr as u64,
            flags,
        };

        // SAFETY: the caller guarantees the host range outlives the VM
        unsafe {
            self.vm_fd()?.set_user_memory_region(region.as_kvm_region())?;
        }
        self.slots.commit();

        debug!(
            "Registered memory region {}: addr={:#x}, size={:#x}, read_only={}",
            region.slot,
            guest_addr.raw_value(),
            size,
            region.is_read_only()
        );

        self.regions.push(region);
        Ok(region)
    }

    /// Register every region of `memory` and keep it alive with the VM
    pub fn map_guest_memory(
        &mut self,
        memory: Arc<GuestMemoryMmap>,
        flags: MemoryFlags,
    ) -> Result<Vec<MemoryRegion>> {
        let mut mapped = Vec::new();

        for region in memory.iter() {
            let host_addr = memory.get_host_address(region.start_addr()).map_err(|e| {
                Error::Memory(format!(
                    "No host mapping for {:#x}: {}",
                    region.start_addr().raw_value(),
                    e
                ))
            })?;

            // SAFETY: `memory` is retained below for as long as the VM descriptor
            // lives, which covers every vCPU of this VM
            let mapped_region =
                unsafe { self.map(host_addr, region.start_addr(), region.len() as usize, flags)? };
            mapped.push(mapped_region);
        }

        self.retain_memory(memory)?;
        Ok(mapped)
    }

    /// Regions registered so far, in slot order
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }
}

/// Write data to guest memory at the specified address
pub fn write_to_guest(memory: &GuestMemoryMmap, addr: GuestAddress, data: &[u8]) -> Result<()> {
    memory.write_slice(data, addr).map_err(|e| {
        Error::Memory(format!(
            "Failed to write to guest memory at {:#x}: {}",
            addr.raw_value(),
            e
        ))
    })
}

/// Read data from guest memory at the specified address
pub fn read_from_guest(
    memory: &GuestMemoryMmap,
    addr: GuestAddress,
    size: usize,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    memory.read_slice(&mut buf, addr).map_err(|e| {
        Error::Memory(format!(
            "Failed to read from guest memory at {:#x}: {}",
            addr.raw_value(),
            e
        ))
    })?;
    Ok(buf)
}

/// Read a little-endian 8-byte value from guest memory
pub fn read_u64_from_guest(memory: &GuestMemoryMmap, addr: GuestAddress) -> Result<u64> {
    let bytes = read_from_guest(memory, addr, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_memory() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0x6942_0000), 1024 * 1024)]).unwrap()
    }

    fn region(flags: MemoryFlags) -> MemoryRegion {
        MemoryRegion {
            slot: 3,
            guest_addr: GuestAddress(0x6942_0000),
            size: 0x10_0000,
            host_addr: 0x7f00_0000_0000,
            flags,
        }
    }

    #[test]
    fn test_read_only_without_write() {
        for flags in [
            MemoryFlags::empty(),
            MemoryFlags::READ,
            MemoryFlags::EXEC,
            MemoryFlags::READ | MemoryFlags::EXEC,
        ] {
            let kvm_region = region(flags).as_kvm_region();
            assert_eq!(kvm_region.flags, KVM_MEM_READONLY, "flags {:?}", flags);
        }
    }

    #[test]
    fn test_writable_with_write() {
        for flags in [
            MemoryFlags::WRITE,
            MemoryFlags::READ | MemoryFlags::WRITE,
            MemoryFlags::all(),
        ] {
            let kvm_region = region(flags).as_kvm_region();
            assert_eq!(kvm_region.flags, 0, "flags {:?}", flags);
        }
    }

    #[test]
    fn test_kvm_region_fields() {
        let kvm_region = region(MemoryFlags::all()).as_kvm_region();
        assert_eq!(kvm_region.slot, 3);
        assert_eq!(kvm_region.guest_phys_addr, 0x6942_0000);
        assert_eq!(kvm_region.memory_size, 0x10_0000);
        assert_eq!(kvm_region.userspace_addr, 0x7f00_0000_0000);
    }

    #[test]
    fn test_vendor_flag_values() {
        assert_eq!(MemoryFlags::READ.bits(), 1);
        assert_eq!(MemoryFlags::WRITE.bits(), 2);
        assert_eq!(MemoryFlags::EXEC.bits(), 4);
        assert!(MemoryFlags::from_bits(8).is_none());
    }

    #[test]
    fn test_slots_increase_from_zero() {
        let mut slots = SlotAllocator::default();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(slots.peek().unwrap());
            slots.commit();
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_slot_not_consumed_without_commit() {
        let slots = SlotAllocator::default();
        assert_eq!(slots.peek().unwrap(), 0);
        assert_eq!(slots.peek().unwrap(), 0);
    }

    #[test]
    fn test_slots_exhausted() {
        let slots = SlotAllocator { next: MAX_SLOT + 1 };
        assert!(slots.peek().is_err());
    }

    #[test]
    fn test_write_read_guest() {
        let memory = create_test_memory();
        let data = b"hello world";
        let addr = GuestAddress(0x6942_1000);

        write_to_guest(&memory, addr, data).unwrap();
        let read_back = read_from_guest(&memory, addr, data.len()).unwrap();

        assert_eq!(&read_back, data);
    }

    #[test]
    fn test_read_u64() {
        let memory = create_test_memory();
        let addr = GuestAddress(0x6942_0100);

        write_to_guest(&memory, addr, &3u64.to_le_bytes()).unwrap();
        assert_eq!(read_u64_from_guest(&memory, addr).unwrap(), 3);
    }

    #[test]
    fn test_access_outside_memory() {
        let memory = create_test_memory();
        assert!(read_from_guest(&memory, GuestAddress(0x1000), 8).is_err());
        assert!(write_to_guest(&memory, GuestAddress(0x6952_0000), &[1]).is_err());
    }
}
