//! Executable code memory.
//!
//! The emitted bytes are copied into a fresh anonymous mapping which is then
//! sealed read+execute. The writable-to-executable transition happens exactly
//! once, before the buffer is ever exposed; afterwards the mapping is
//! immutable until dropped.

use core::ptr::NonNull;

use crate::error::CompileError;

/// An owned, sealed read+execute memory mapping.
#[derive(Debug)]
pub(crate) struct ExecMemory {
    ptr: NonNull<u8>,
    map_len: usize,
    code_len: usize,
}

// The mapping is immutable after sealing and owned uniquely by this value.
unsafe impl Send for ExecMemory {}
unsafe impl Sync for ExecMemory {}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl ExecMemory {
    /// Map `code` into fresh executable memory.
    pub(crate) fn map(code: &[u8]) -> Result<Self, CompileError> {
        let map_len = code.len().max(1);
        unsafe {
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(CompileError::ExecMap { errno: last_errno() });
            }
            core::ptr::copy_nonoverlapping(code.as_ptr(), ptr.cast::<u8>(), code.len());
            if libc::mprotect(ptr, map_len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                let errno = last_errno();
                libc::munmap(ptr, map_len);
                return Err(CompileError::ExecMap { errno });
            }
            Ok(Self {
                ptr: NonNull::new_unchecked(ptr.cast::<u8>()),
                map_len,
                code_len: code.len(),
            })
        }
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// The emitted code bytes (readable: the mapping is read+execute).
    pub(crate) fn code(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.code_len) }
    }
}

impl Drop for ExecMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.map_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_code_reads_back() {
        let bytes = [0xC3u8, 0x90, 0xCC];
        let memory = ExecMemory::map(&bytes).unwrap();
        assert_eq!(memory.code(), &bytes);
    }

    #[test]
    fn empty_code_still_maps() {
        let memory = ExecMemory::map(&[]).unwrap();
        assert!(memory.code().is_empty());
    }
}
