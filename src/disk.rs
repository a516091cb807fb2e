use core::ops::Deref;
use std::{
    io::{self, ErrorKind},
    sync::Arc,
};

/// Byte source backing a volume image.
///
/// The engine issues positional reads only; it never seeks and never writes.
/// Implementations must tolerate concurrent `read_at` calls from multiple
/// threads.
pub trait SectorSource: Send + Sync {
    /// Reads into `buf` starting at the absolute byte `offset`. Returns the
    /// number of bytes read, which is less than `buf.len()` only at the end
    /// of the image.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Total length of the image in bytes.
    fn size_bytes(&self) -> u64;

    /// Sector size of the underlying medium. Used only before the boot
    /// sector has been parsed (e.g. to locate the backup boot sector).
    fn sector_size_bytes(&self) -> u32 {
        512
    }

    /// Fills `buf` completely or fails with [`ErrorKind::UnexpectedEof`].
    fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(offset, buf) {
                Ok(0) => {
                    return Err(io::Error::from(ErrorKind::UnexpectedEof));
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset = offset
                        .checked_add(n as u64)
                        .ok_or_else(|| io::Error::from(ErrorKind::UnexpectedEof))?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<T: SectorSource + ?Sized> SectorSource for &T {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (*self).read_at(offset, buf)
    }

    fn size_bytes(&self) -> u64 {
        (*self).size_bytes()
    }

    fn sector_size_bytes(&self) -> u32 {
        (*self).sector_size_bytes()
    }
}

impl<T: SectorSource + ?Sized> SectorSource for Arc<T> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.deref().read_at(offset, buf)
    }

    fn size_bytes(&self) -> u64 {
        self.deref().size_bytes()
    }

    fn sector_size_bytes(&self) -> u32 {
        self.deref().sector_size_bytes()
    }
}

impl SectorSource for std::fs::File {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }

    fn size_bytes(&self) -> u64 {
        self.metadata().map_or(0, |m| m.len())
    }
}

/// Whole image held in memory. Mainly useful for small captures and tests.
impl SectorSource for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.as_slice().read_at(offset, buf)
    }

    fn size_bytes(&self) -> u64 {
        self.len() as u64
    }
}

impl SectorSource for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }

    fn size_bytes(&self) -> u64 {
        self.len() as u64
    }
}

#[test]
fn test_slice_source_short_read() {
    let data = vec![7u8; 100];
    let mut buf = [0u8; 64];
    assert_eq!(data.read_at(90, &mut buf).unwrap(), 10);
    assert_eq!(data.read_at(100, &mut buf).unwrap(), 0);
    assert!(data.read_exact_at(90, &mut buf).is_err());
}
