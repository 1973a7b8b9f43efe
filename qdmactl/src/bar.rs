//! Direct BAR access through sysfs
//!
//! Register commands bypass the driver: the BAR's `resource<N>` file is
//! mapped shared and accessed as little-endian 32-bit words.

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use log::trace;
use qdma_core::regs::RegisterSpace;

pub const SYSFS_ROOT_DEFAULT: &str = "/sys";

/// PCI function address, `0000:BB:DD.F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddr {
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
}

impl PciAddr {
    /// `<sysfs>/bus/pci/devices/0000:BB:DD.F/resource<bar>`
    pub fn resource_path(&self, sysfs_root: &Path, bar: u8) -> PathBuf {
        sysfs_root.join(format!(
            "bus/pci/devices/0000:{:02x}:{:02x}.{:x}/resource{}",
            self.bus, self.dev, self.func, bar
        ))
    }
}

/// `QDMA_SYSFS_ROOT` if set.
pub fn sysfs_root() -> PathBuf {
    env::var_os("QDMA_SYSFS_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SYSFS_ROOT_DEFAULT))
}

/// Shared mapping of the first `len` bytes of a BAR.
pub struct BarMap {
    ptr: *mut u8,
    len: usize,
}

impl BarMap {
    pub fn open(path: &Path, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty mapping"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", path.display(), e)))?;

        // SAFETY: fresh mapping of an open file; the fd may close afterwards.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        trace!("mapped {} bytes of {}", len, path.display());
        Ok(BarMap {
            ptr: ptr as *mut u8,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn word(&self, addr: u32) -> io::Result<*mut u32> {
        let off = addr as usize;
        if off % 4 != 0 || off + 4 > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("register {:#x} outside the {:#x} byte mapping", addr, self.len),
            ));
        }
        // SAFETY: bounds and alignment checked above.
        Ok(unsafe { self.ptr.add(off) } as *mut u32)
    }

    pub fn read(&self, addr: u32) -> io::Result<u32> {
        let p = self.word(addr)?;
        // SAFETY: `p` is an aligned word inside the live mapping.
        Ok(u32::from_le(unsafe { ptr::read_volatile(p) }))
    }

    pub fn write(&self, addr: u32, val: u32) -> io::Result<()> {
        let p = self.word(addr)?;
        // SAFETY: as in `read`; the mapping is writable.
        unsafe { ptr::write_volatile(p, val.to_le()) };
        Ok(())
    }
}

impl RegisterSpace for BarMap {
    fn read32(&self, addr: u32) -> qdma_core::Result<u32> {
        self.read(addr)
            .map_err(|e| qdma_core::Error::InvalidArgument(e.to_string()))
    }
}

impl Drop for BarMap {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from a successful mmap.
        unsafe {
            libc::munmap(self.ptr as *mut _, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_resource(len: u64) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let addr = PciAddr {
            bus: 0x3b,
            dev: 0,
            func: 1,
        };
        let path = addr.resource_path(dir.path(), 2);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = fs::File::create(&path).unwrap();
        file.set_len(len).unwrap();
        (dir, path)
    }

    #[test]
    fn test_resource_path() {
        let addr = PciAddr {
            bus: 0x81,
            dev: 0x1f,
            func: 7,
        };
        assert_eq!(
            addr.resource_path(Path::new("/sys"), 0),
            PathBuf::from("/sys/bus/pci/devices/0000:81:1f.7/resource0")
        );
    }

    #[test]
    fn test_write_lands_in_file() {
        let (_dir, path) = fake_resource(0x100);
        let bar = BarMap::open(&path, 0x100).unwrap();
        bar.write(0x60, 0x1234_5678).unwrap();
        assert_eq!(bar.read(0x60).unwrap(), 0x1234_5678);
        assert_eq!(bar.read32(0x64).unwrap(), 0);
        drop(bar);

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[0x60..0x64], &0x1234_5678u32.to_le_bytes());
    }

    #[test]
    fn test_out_of_bounds_and_unaligned() {
        let (_dir, path) = fake_resource(0x100);
        let bar = BarMap::open(&path, 0x10).unwrap();
        assert!(bar.read(0x10).is_err());
        assert!(bar.read(0x2).is_err());
        assert!(bar.write(0xc, 1).is_ok());
    }

    #[test]
    fn test_missing_resource() {
        let dir = tempfile::tempdir().unwrap();
        let err = BarMap::open(&dir.path().join("resource9"), 4).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
