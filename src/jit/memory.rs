//! Executable memory management using mmap.
//!
//! Pages are mapped read-write only long enough to copy the code in, then
//! flipped to read-execute for the rest of their life.

use std::ptr::NonNull;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid memory size")]
    InvalidSize,
}

/// A block of read-execute memory allocated via mmap.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
}

impl ExecutableMemory {
    /// Map pages covering `code`, copy it in and make them executable.
    pub fn from_code(code: &[u8]) -> Result<Self, MemoryError> {
        if code.is_empty() {
            return Err(MemoryError::InvalidSize);
        }
        let page_size = page_size();
        let size = code
            .len()
            .checked_add(page_size - 1)
            .ok_or(MemoryError::InvalidSize)?
            & !(page_size - 1);

        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)?;
        // Owns the mapping from here so failures below unmap it.
        let mem = Self { ptr, size };

        // SAFETY: the mapping is writable and at least `code.len()` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), mem.ptr.as_ptr(), code.len());
        }
        // SAFETY: the range is exactly the mapping created above.
        let result = unsafe {
            libc::mprotect(
                mem.ptr.as_ptr() as *mut libc::c_void,
                mem.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        Ok(mem)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mapped size, a whole number of pages.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Function pointer to the code at `offset`.
    ///
    /// # Safety
    /// The memory must hold valid code at `offset` whose ABI matches `F`.
    pub unsafe fn entry<F: Copy>(&self, offset: usize) -> Option<F> {
        if offset >= self.size || std::mem::size_of::<F>() != std::mem::size_of::<fn()>() {
            return None;
        }
        // SAFETY: the caller guarantees the signature.
        Some(unsafe {
            let ptr = self.ptr.as_ptr().add(offset);
            std::mem::transmute_copy(&ptr)
        })
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        // SAFETY: unmapping the mapping we own.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The mapping is owned and immutable once executable.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

/// Host page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_is_page_rounded() {
        let mem = ExecutableMemory::from_code(&[0xC3]).unwrap();
        assert_eq!(mem.size(), page_size());
        let mem = ExecutableMemory::from_code(&vec![0x90; page_size() + 1]).unwrap();
        assert_eq!(mem.size(), 2 * page_size());
    }

    #[test]
    fn test_empty_code_is_rejected() {
        assert_eq!(ExecutableMemory::from_code(&[]).err(), Some(MemoryError::InvalidSize));
    }

    #[test]
    fn test_entry_outside_mapping() {
        let mem = ExecutableMemory::from_code(&[0xC3]).unwrap();
        let f: Option<extern "C" fn()> = unsafe { mem.entry(mem.size()) };
        assert!(f.is_none());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_execute_return_constant() {
        // mov eax, 42; ret
        let mem = ExecutableMemory::from_code(&[0xB8, 42, 0, 0, 0, 0xC3]).unwrap();
        let f: extern "C" fn() -> u32 = unsafe { mem.entry(0) }.unwrap();
        assert_eq!(f(), 42);
    }
}
