//! POSIX shared memory segments holding cached payloads

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use std::ffi::c_void;
use std::fs::File;
use std::io::Write;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{CacheError, CacheResult};

fn segment_name() -> String {
    format!("/piper_{}", Uuid::new_v4().simple())
}

/// Create a new segment holding `payload` and return its name
///
/// The caller owns the segment until the manager accepts it.
pub fn create_segment(payload: &[u8]) -> CacheResult<String> {
    let name = segment_name();
    let fd = shm_open(
        name.as_str(),
        OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )?;
    let mut file = File::from(fd);
    let written = file
        .set_len(payload.len() as u64)
        .and_then(|_| file.write_all(payload));
    if let Err(e) = written {
        unlink_segment(&name);
        return Err(CacheError::SharedMemory(format!("writing {}: {}", name, e)));
    }
    debug!("Created shared segment {} ({} bytes)", name, payload.len());
    Ok(name)
}

/// Remove a segment name; live mappings stay valid until unmapped
pub fn unlink_segment(name: &str) {
    match shm_unlink(name) {
        Ok(()) | Err(Errno::ENOENT) => {}
        Err(errno) => warn!("Could not unlink shared segment {}: {}", name, errno),
    }
}

/// Read-only mapping of a whole segment
#[derive(Debug)]
pub struct Mapping {
    ptr: Option<NonNull<c_void>>,
    len: usize,
}

// SAFETY: the mapping is private to this value, read-only and never aliased
// mutably, so moving it across threads is sound.
unsafe impl Send for Mapping {}

impl Mapping {
    /// Map `len` bytes of the named segment
    pub fn open(name: &str, len: usize) -> CacheResult<Self> {
        let fd = shm_open(name, OFlag::O_RDONLY, Mode::empty())?;
        let Some(length) = NonZeroUsize::new(len) else {
            return Ok(Self { ptr: None, len: 0 });
        };

        let file = File::from(fd);
        let actual = file.metadata()?.len();
        if actual < len as u64 {
            return Err(CacheError::SharedMemory(format!(
                "segment {} holds {} bytes, expected {}",
                name, actual, len
            )));
        }

        // SAFETY: fresh read-only shared mapping of a descriptor we own; the
        // size check above keeps every byte of the slice inside the object.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )?
        };
        Ok(Self {
            ptr: Some(ptr),
            len,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: `ptr` maps `len` readable bytes for the life of `self`
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr().cast::<u8>(), self.len) },
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: `ptr` and `len` come from the successful mmap in `open`
            if let Err(errno) = unsafe { munmap(ptr, self.len) } {
                warn!("munmap failed: {}", errno);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_round_trip() {
        let name = create_segment(b"hello shared world").unwrap();
        let mapping = Mapping::open(&name, 18).unwrap();
        assert_eq!(mapping.as_slice(), b"hello shared world");

        unlink_segment(&name);
        // Still readable after unlink
        assert_eq!(&mapping.as_slice()[..5], b"hello");
        assert!(Mapping::open(&name, 18).is_err());
        // Unlinking twice is harmless
        unlink_segment(&name);
    }

    #[test]
    fn test_empty_segment() {
        let name = create_segment(&[]).unwrap();
        let mapping = Mapping::open(&name, 0).unwrap();
        assert!(mapping.is_empty());
        assert_eq!(mapping.as_slice(), &[] as &[u8]);
        unlink_segment(&name);
    }

    #[test]
    fn test_short_segment_is_rejected() {
        let name = create_segment(b"abc").unwrap();
        assert!(matches!(
            Mapping::open(&name, 10),
            Err(CacheError::SharedMemory(_))
        ));
        unlink_segment(&name);
    }
}
