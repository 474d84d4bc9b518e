/// Page-aligned memory region for generated code
///
/// The region starts out readable and writable; once the code is complete,
/// [`Mmap::make_executable`] flips it to read + execute, after which it may
/// no longer be written.
pub struct Mmap {
    ptr: *mut std::ffi::c_void,
    /// Mapped length, a whole number of pages
    len: usize,
    /// Length of the initialized prefix (code is written front to back)
    written: usize,

    executable: bool,
}

impl Mmap {
    pub const PAGE_SIZE: usize = 4096;

    /// Maps at least `len` bytes (and at least one page) of writable memory
    pub fn new(len: usize) -> Result<Self, std::io::Error> {
        let len = len.max(1).next_multiple_of(Self::PAGE_SIZE);

        // SAFETY: anonymous private mapping with no address hint
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(Self {
                ptr,
                len,
                written: 0,
                executable: false,
            })
        }
    }

    /// Returns the size of the allocation
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the number of bytes written
    #[inline(always)]
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Writes to the given offset in the memory map
    ///
    /// # Panics
    /// If `index >= self.len`, or if the map has been made executable
    #[inline(always)]
    pub fn write(&mut self, index: usize, byte: u8) {
        assert!(index < self.len);
        assert!(!self.executable, "cannot write to executable memory");
        // SAFETY: bounds-checked above; the region is mapped writable
        unsafe {
            *(self.ptr as *mut u8).add(index) = byte;
        }
        if index == self.written {
            self.written += 1;
        }
    }

    /// Treats the memory-mapped data as a slice
    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        if self.written == 0 {
            return &[];
        }
        // SAFETY: bytes `0..written` have been initialized
        unsafe {
            std::slice::from_raw_parts(self.ptr as *const u8, self.written)
        }
    }

    /// Returns the inner pointer
    pub fn as_ptr(&self) -> *const std::ffi::c_void {
        self.ptr
    }

    /// Changes the protection of the whole region to read + execute
    pub fn make_executable(&mut self) -> Result<(), std::io::Error> {
        if self.executable {
            return Ok(());
        }
        // SAFETY: `ptr..ptr + len` is exactly the region we mapped
        let r = unsafe {
            libc::mprotect(self.ptr, self.len, libc::PROT_READ | libc::PROT_EXEC)
        };
        if r != 0 {
            Err(std::io::Error::last_os_error())
        } else {
            self.executable = true;
            Ok(())
        }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // SAFETY: the region was mapped by `Mmap::new` and is unmapped once
        unsafe {
            libc::munmap(self.ptr, self.len as libc::size_t);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_and_protect() {
        let mut m = Mmap::new(10).unwrap();
        assert_eq!(m.len(), Mmap::PAGE_SIZE);
        for (i, b) in [0xc3u8, 0x90, 0x90].iter().enumerate() {
            m.write(i, *b);
        }
        assert_eq!(m.written(), 3);
        assert_eq!(m.as_slice(), &[0xc3, 0x90, 0x90]);
        m.make_executable().unwrap();
        assert!(m.is_executable());
        // Reading is still allowed
        assert_eq!(m.as_slice()[0], 0xc3);
    }

    #[test]
    #[should_panic]
    fn no_writes_after_protect() {
        let mut m = Mmap::new(1).unwrap();
        m.make_executable().unwrap();
        m.write(0, 0xc3);
    }
}
