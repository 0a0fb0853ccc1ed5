use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Fixed sector size this crate operates in. The on-device metadata layout
/// is defined in terms of 512-byte units regardless of the real device's
/// physical block size.
pub const SECTOR_SIZE: u64 = 512;

/// The single capability set the dispatcher needs from an underlying device:
/// sector-addressed read/write plus a durability barrier. Both the primary
/// and the spare are held behind this trait so tests can substitute
/// `MemBlockDevice` for a real block device or image file.
pub trait BlockDevice: Send + Sync {
    /// Read `count` consecutive 512-byte sectors starting at `start_sector`.
    fn read_sectors(&self, start_sector: u64, count: u32) -> Result<Vec<u8>>;

    /// Write `data` (a whole number of sectors) starting at `start_sector`.
    fn write_sectors(&self, start_sector: u64, data: &[u8]) -> Result<()>;

    /// Flush/sync all prior writes to durable storage.
    fn flush(&self) -> Result<()>;

    /// Total number of 512-byte sectors on the device.
    fn total_sectors(&self) -> u64;

    fn read_sector(&self, sector: u64) -> Result<Vec<u8>> {
        self.read_sectors(sector, 1)
    }

    fn write_sector(&self, sector: u64, data: &[u8]) -> Result<()> {
        if data.len() as u64 != SECTOR_SIZE {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "data size {} does not match sector size {}",
                    data.len(),
                    SECTOR_SIZE
                ),
            )));
        }
        self.write_sectors(sector, data)
    }
}

/// Wrapper around a real block device or image file for sector-based I/O.
pub struct FileBlockDevice {
    file: File,
    path: PathBuf,
    total_sectors: u64,
}

impl std::fmt::Debug for FileBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBlockDevice")
            .field("path", &self.path)
            .field("total_sectors", &self.total_sectors)
            .finish_non_exhaustive()
    }
}

impl FileBlockDevice {
    fn open_impl<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let path_display = path_buf.display().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path_buf)
            .map_err(|_| Error::DeviceNotFound(path_display))?;

        let metadata = file.metadata()?;
        let size = if metadata.is_file() {
            metadata.len()
        } else {
            let mut f = file.try_clone()?;
            f.seek(SeekFrom::End(0))?
        };

        Ok(Self {
            file,
            path: path_buf,
            total_sectors: size / SECTOR_SIZE,
        })
    }

    /// Open a device or image file for read/write access.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_impl(path, true)
    }

    /// Open a device in read-only mode.
    pub fn open_readonly<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_impl(path, false)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_sectors(&self, start_sector: u64, count: u32) -> Result<Vec<u8>> {
        let offset = start_sector * SECTOR_SIZE;
        let size = count as usize * SECTOR_SIZE as usize;
        let mut buffer = vec![0u8; size];
        self.file.read_exact_at(&mut buffer, offset)?;
        Ok(buffer)
    }

    fn write_sectors(&self, start_sector: u64, data: &[u8]) -> Result<()> {
        let offset = start_sector * SECTOR_SIZE;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }
}

/// In-memory device backing store, used by tests and the demo binary so the
/// whole stack runs without root or a real block device.
#[derive(Debug)]
pub struct MemBlockDevice {
    data: parking_lot::Mutex<Vec<u8>>,
    total_sectors: u64,
}

impl MemBlockDevice {
    pub fn new(total_sectors: u64) -> Self {
        Self {
            data: parking_lot::Mutex::new(vec![0u8; (total_sectors * SECTOR_SIZE) as usize]),
            total_sectors,
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_sectors(&self, start_sector: u64, count: u32) -> Result<Vec<u8>> {
        let offset = (start_sector * SECTOR_SIZE) as usize;
        let len = count as usize * SECTOR_SIZE as usize;
        let guard = self.data.lock();
        if offset + len > guard.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of device",
            )));
        }
        Ok(guard[offset..offset + len].to_vec())
    }

    fn write_sectors(&self, start_sector: u64, data: &[u8]) -> Result<()> {
        let offset = (start_sector * SECTOR_SIZE) as usize;
        let mut guard = self.data.lock();
        if offset + data.len() > guard.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "write past end of device",
            )));
        }
        guard[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_device_open() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 1024 * 1024]).unwrap();

        let device = FileBlockDevice::open(file.path()).unwrap();
        assert_eq!(device.total_sectors(), 2048);
    }

    #[test]
    fn test_file_device_read_write() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 1024 * 1024]).unwrap();
        let device = FileBlockDevice::open(file.path()).unwrap();

        let pattern = vec![0xABu8; 512];
        device.write_sector(10, &pattern).unwrap();
        assert_eq!(device.read_sector(10).unwrap(), pattern);
        assert_eq!(device.read_sector(0).unwrap(), vec![0u8; 512]);
    }

    #[test]
    fn test_mem_device_read_write() {
        let device = MemBlockDevice::new(1024);
        let pattern = vec![0xCDu8; 512];
        device.write_sector(5, &pattern).unwrap();
        assert_eq!(device.read_sector(5).unwrap(), pattern);
        assert_eq!(device.total_sectors(), 1024);
    }

    #[test]
    fn test_mem_device_bounds() {
        let device = MemBlockDevice::new(4);
        assert!(device.read_sectors(3, 5).is_err());
    }
}
