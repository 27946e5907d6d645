//! Uncached (DMA-capable) buffer allocator.
//!
//! Regions are whole-page anonymous mappings, mirroring how the device
//! hands out cache-bypassing memory; the "physical" address is a stable
//! bus cookie assigned at allocation. Release demands the exact
//! (pointer, size, bus address) triple from the matching allocate, zeroes
//! the region before unmapping, and treats anything else as
//! `InvalidRelease`: a leaked or doubly-freed DMA mapping is a
//! correctness and security hazard, so it is reported loudly instead of
//! being ignored.

use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Mutex;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use tracing::error;

use crate::error::{Error, Result};
use crate::fabric::lock;

/// An allocated uncached region. The triple is what release expects back.
#[derive(Debug, Clone, Copy)]
pub struct UncachedBuf {
    pub ptr: *mut u8,
    pub paddr: u64,
    pub size: usize,
}

struct LiveRegion {
    base: NonNull<std::ffi::c_void>,
    map_len: usize,
    size: usize,
}

struct AllocState {
    live: HashMap<u64, LiveRegion>,
    next_bus: u64,
}

pub struct UncachedAllocator {
    state: Mutex<AllocState>,
    page: usize,
}

// Regions are exclusively owned by the allocator until released; the map
// itself is guarded by the mutex.
unsafe impl Send for UncachedAllocator {}
unsafe impl Sync for UncachedAllocator {}

impl UncachedAllocator {
    pub(crate) fn new() -> Self {
        let page = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|v| v as usize)
            .unwrap_or(4096);
        UncachedAllocator {
            state: Mutex::new(AllocState {
                live: HashMap::new(),
                next_bus: 0x8000_0000,
            }),
            page,
        }
    }

    /// Map a fresh region of at least `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<UncachedBuf> {
        if size == 0 {
            return Err(Error::OutOfMemory);
        }
        let map_len = size.div_ceil(self.page) * self.page;
        let length = NonZeroUsize::new(map_len).ok_or(Error::OutOfMemory)?;
        let base = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|errno| Error::from(io::Error::from(errno)))?;

        let mut st = lock(&self.state);
        let paddr = st.next_bus;
        st.next_bus += map_len as u64;
        st.live.insert(
            paddr,
            LiveRegion {
                base,
                map_len,
                size,
            },
        );
        Ok(UncachedBuf {
            ptr: base.as_ptr().cast(),
            paddr,
            size,
        })
    }

    /// Unmap a region. The triple must match the allocate exactly; the
    /// region is zeroed before unmapping so stale DMA contents never
    /// leak through a reused mapping.
    pub fn release(&self, ptr: *mut u8, size: usize, paddr: u64) -> Result<()> {
        let mut st = lock(&self.state);
        let matches = st
            .live
            .get(&paddr)
            .is_some_and(|r| r.base.as_ptr().cast::<u8>() == ptr && r.size == size);
        if !matches {
            drop(st);
            error!(?ptr, size, paddr, "invalid uncached buffer release");
            return Err(Error::InvalidRelease);
        }
        let region = match st.live.remove(&paddr) {
            Some(r) => r,
            None => return Err(Error::InvalidRelease),
        };
        drop(st);
        unsafe {
            std::ptr::write_bytes(region.base.as_ptr().cast::<u8>(), 0, region.map_len);
            let _ = munmap(region.base, region.map_len);
        }
        Ok(())
    }
}

impl Drop for UncachedAllocator {
    fn drop(&mut self) {
        let mut st = lock(&self.state);
        for (_, region) in st.live.drain() {
            unsafe {
                let _ = munmap(region.base, region.map_len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_release_exact_triple() {
        let alloc = UncachedAllocator::new();
        let buf = alloc.allocate(4096).unwrap();
        assert!(!buf.ptr.is_null());
        assert_eq!(buf.size, 4096);

        // The region is usable memory.
        unsafe {
            std::ptr::write_volatile(buf.ptr, 0xa5);
            assert_eq!(std::ptr::read_volatile(buf.ptr), 0xa5);
        }

        alloc.release(buf.ptr, buf.size, buf.paddr).unwrap();
        // Second release of the same triple is rejected.
        assert_eq!(
            alloc.release(buf.ptr, buf.size, buf.paddr),
            Err(Error::InvalidRelease)
        );
    }

    #[test]
    fn test_release_wrong_triple_rejected() {
        let alloc = UncachedAllocator::new();
        let buf = alloc.allocate(100).unwrap();
        assert_eq!(
            alloc.release(buf.ptr, buf.size + 1, buf.paddr),
            Err(Error::InvalidRelease)
        );
        assert_eq!(
            alloc.release(buf.ptr, buf.size, buf.paddr + 1),
            Err(Error::InvalidRelease)
        );
        // The original triple still releases cleanly afterwards.
        alloc.release(buf.ptr, buf.size, buf.paddr).unwrap();
    }

    #[test]
    fn test_distinct_bus_addresses() {
        let alloc = UncachedAllocator::new();
        let a = alloc.allocate(64).unwrap();
        let b = alloc.allocate(64).unwrap();
        assert_ne!(a.paddr, b.paddr);
        alloc.release(a.ptr, a.size, a.paddr).unwrap();
        alloc.release(b.ptr, b.size, b.paddr).unwrap();
    }

    #[test]
    fn test_zero_size_rejected() {
        let alloc = UncachedAllocator::new();
        assert_eq!(alloc.allocate(0).err(), Some(Error::OutOfMemory));
    }
}
