//! Compilation down to native machine code
//!
//! The emitter walks one function's slice of the instruction log and encodes
//! it with [`dynasm!`](dynasmrt::dynasm) into a [`CodeBuffer`], which writes
//! straight into an [`Mmap`].  Forward branches are recorded as fixups and
//! patched once every instruction's offset is known; the buffer is then made
//! executable and handed to the runtime.
use crate::Error;
use dynasmrt::{AssemblyOffset, DynasmApi};

mod mmap;
mod x86_64;

pub use mmap::Mmap;
pub(crate) use x86_64::{Chunk, FunctionAssembler, REGISTER_COUNT};

#[cfg(not(all(
    target_arch = "x86_64",
    any(target_os = "linux", target_os = "macos")
)))]
compile_error!(
    "The `jit` module only builds for x86_64 on Linux and macOS; \
    please disable the `jit` feature"
);

/// Initial size of a code buffer, before any doubling
const INITIAL_CAPACITY: usize = Mmap::PAGE_SIZE;

/// A growable, writable code buffer backed by an [`Mmap`]
///
/// If the map can't be grown, the failure is remembered and further bytes
/// are counted but discarded; [`CodeBuffer::finalize`] then reports it.
pub(crate) struct CodeBuffer {
    mmap: Mmap,
    len: usize,
    error: Option<std::io::Error>,
}

impl Extend<u8> for CodeBuffer {
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = u8>,
    {
        for c in iter.into_iter() {
            self.push(c);
        }
    }
}

impl<'a> Extend<&'a u8> for CodeBuffer {
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = &'a u8>,
    {
        for c in iter.into_iter() {
            self.push(*c);
        }
    }
}

impl DynasmApi for CodeBuffer {
    #[inline(always)]
    fn offset(&self) -> AssemblyOffset {
        AssemblyOffset(self.len)
    }

    #[inline(always)]
    fn push(&mut self, byte: u8) {
        // Resize to fit the next byte, if needed
        if self.len >= self.mmap.len() {
            self.expand_mmap();
        }
        if self.error.is_none() {
            self.mmap.write(self.len, byte);
        }
        self.len += 1;
    }

    #[inline(always)]
    fn align(&mut self, alignment: usize, with: u8) {
        let offset = self.offset().0 % alignment;
        if offset != 0 {
            for _ in offset..alignment {
                self.push(with);
            }
        }
    }
}

impl CodeBuffer {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            mmap: Mmap::new(INITIAL_CAPACITY)?,
            len: 0,
            error: None,
        })
    }

    /// Overwrites a little-endian `i32` previously written at `at`
    ///
    /// # Panics
    /// If `at + 4` is past the end of the written code
    pub fn patch_i32(&mut self, at: usize, value: i32) {
        assert!(at + 4 <= self.len);
        if self.error.is_some() {
            return;
        }
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.mmap.write(at + i, b);
        }
    }

    /// Returns the code written so far
    #[cfg(test)]
    pub fn code(&self) -> &[u8] {
        self.mmap.as_slice()
    }

    /// Makes the code executable, returning its memory
    pub fn finalize(mut self) -> Result<Mmap, Error> {
        if let Some(e) = self.error.take() {
            return Err(e.into());
        }
        self.mmap.make_executable()?;
        Ok(self.mmap)
    }

    /// Doubles the size of the internal `Mmap` and copies over data
    fn expand_mmap(&mut self) {
        if self.error.is_some() {
            return;
        }
        match Mmap::new(self.mmap.len() * 2) {
            Ok(mut next) => {
                for (i, b) in self.mmap.as_slice().iter().enumerate() {
                    next.write(i, *b);
                }
                std::mem::swap(&mut self.mmap, &mut next);
            }
            Err(e) => {
                log::warn!("could not grow code buffer: {e}");
                self.error = Some(e);
            }
        }
    }
}

/// A branch whose destination wasn't known when it was encoded
#[derive(Copy, Clone, Debug)]
pub(crate) struct Fixup {
    /// Offset of the `rel32` field
    pub at: usize,
    /// Log index of the destination instruction
    pub target: usize,
}

/// Computes the `rel32` displacement for a field at `at` pointing to `dest`
pub(crate) fn rel32(at: usize, dest: usize) -> i32 {
    (dest as i64 - (at as i64 + 4)) as i32
}
