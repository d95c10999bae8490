//! Host backing store for guest RAM.
//!
//! A single contiguous mapping backs all guest memory: bytes `0..pages*4096`
//! are the low RAM and, when RAM above 4 GiB is configured, bytes from the
//! 4 GiB mark back the high region. The gap in between is a sparse hole in
//! the memory file, so it costs no disk space.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::{MemoryError, Result};

/// Contiguous host mapping for guest physical memory.
///
/// Owns the allocation; guests and device handlers only ever see slices of
/// it. The mapping is page-aligned by construction.
pub struct HostBacking {
    ptr: *mut u8,
    size: usize,
    file: Option<std::fs::File>,
    already_zero: bool,
}

// HostBacking owns its mapping exclusively; the raw pointer never escapes
// except as borrowed slices.
unsafe impl Send for HostBacking {}
unsafe impl Sync for HostBacking {}

impl HostBacking {
    /// Maps `size` bytes of anonymous private memory.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::BackingAllocation`] when the host refuses the
    /// mapping.
    pub fn anonymous(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(MemoryError::BackingAllocation {
                size,
                reason: "size must be greater than 0".to_string(),
            });
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::BackingAllocation {
                size,
                reason: format!("mmap failed: {}", std::io::Error::last_os_error()),
            });
        }

        Ok(Self {
            ptr: ptr.cast::<u8>(),
            size,
            file: None,
            already_zero: true,
        })
    }

    /// Creates (or reuses) a regular file at `path`, truncates it to `size`
    /// bytes, and maps it shared read/write.
    ///
    /// The truncate-to-zero-then-grow sequence guarantees every page reads
    /// back as zero, so callers may skip the explicit clear.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::MemoryFileNotRegular`] when the path names
    /// something other than a regular file, [`MemoryError::MemoryFileIo`] on
    /// filesystem failures, and [`MemoryError::BackingAllocation`] when the
    /// mapping itself fails.
    pub fn file_backed(path: &Path, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(MemoryError::BackingAllocation {
                size,
                reason: "size must be greater than 0".to_string(),
            });
        }

        match std::fs::symlink_metadata(path) {
            Ok(meta) if !meta.is_file() => {
                return Err(MemoryError::MemoryFileNotRegular(path.to_path_buf()));
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(MemoryError::MemoryFileIo(err)),
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if !file.metadata()?.is_file() {
            return Err(MemoryError::MemoryFileNotRegular(path.to_path_buf()));
        }
        file.set_len(0)?;
        file.set_len(size as u64)?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::BackingAllocation {
                size,
                reason: format!("mmap of memory file failed: {}", std::io::Error::last_os_error()),
            });
        }

        Ok(Self {
            ptr: ptr.cast::<u8>(),
            size,
            file: Some(file),
            already_zero: true,
        })
    }

    /// Size of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    /// True when the mapping has zero length (never, post-construction).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// True when the mapping is backed by a file.
    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        self.file.is_some()
    }

    /// True when the host guarantees the fresh mapping reads as zero.
    #[must_use]
    pub fn starts_zeroed(&self) -> bool {
        self.already_zero
    }

    /// Whole mapping as a byte slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    /// Whole mapping as a mutable byte slice.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
}

impl Drop for HostBacking {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
            }
        }
    }
}

impl std::fmt::Debug for HostBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBacking")
            .field("size", &self.size)
            .field("file_backed", &self.is_file_backed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::HostBacking;

    #[test]
    fn anonymous_mapping_is_zeroed_and_writable() {
        let mut backing = HostBacking::anonymous(0x20000).expect("anonymous mapping");
        assert_eq!(backing.len(), 0x20000);
        assert!(backing.starts_zeroed());
        assert!(backing.as_slice().iter().all(|b| *b == 0));

        backing.as_mut_slice()[0x1234] = 0xA5;
        assert_eq!(backing.as_slice()[0x1234], 0xA5);
    }

    #[test]
    fn zero_sized_mapping_is_rejected() {
        assert!(HostBacking::anonymous(0).is_err());
    }

    #[test]
    fn file_backed_mapping_is_zeroed_even_when_the_file_had_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("guest-ram.img");
        std::fs::write(&path, b"stale bytes from a previous run").expect("seed file");

        let mut backing = HostBacking::file_backed(&path, 0x10000).expect("file mapping");
        assert!(backing.is_file_backed());
        assert!(backing.as_slice().iter().all(|b| *b == 0));

        backing.as_mut_slice()[0] = 0x55;
        assert_eq!(backing.as_slice()[0], 0x55);
        assert_eq!(
            std::fs::metadata(&path).expect("metadata").len(),
            0x10000
        );
    }

    #[test]
    fn file_backed_mapping_refuses_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(HostBacking::file_backed(dir.path(), 0x1000).is_err());
    }
}
