//! Block device I/O for LayerFS

mod blockdev_trait;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

// Re-export the block device trait and related types
pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};
use self::blockdev_trait::check_request;

/// A block device that is backed by a file on the host filesystem
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<File>,
    path: PathBuf,
    size: u64,
    block_count: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create (or truncate) an image file of the given size
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;

        Ok(Self {
            file: Mutex::new(file),
            path,
            size,
            block_count: size / BLOCK_SIZE as u64,
            read_only: false,
        })
    }

    /// Open an existing image file
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            file: Mutex::new(file),
            path,
            size,
            block_count: size / BLOCK_SIZE as u64,
            read_only,
        })
    }

    /// Get the total size of the device in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the backing image
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileBackedBlockDevice {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        check_request(block_num, self.block_count, buf.len())?;
        let offset = block_num * BLOCK_SIZE as u64;
        self.file.lock().read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_request(block_num, self.block_count, data.len())?;
        let offset = block_num * BLOCK_SIZE as u64;
        self.file.lock().write_all_at(data, offset)?;
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        if !self.read_only {
            self.file.lock().sync_all()?;
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Volatile device used when no image is given, and by tests
#[derive(Debug)]
pub struct MemoryBlockDevice {
    blocks: RwLock<HashMap<u64, Box<[u8; BLOCK_SIZE]>>>,
    block_count: u64,
}

impl MemoryBlockDevice {
    /// Create a device with `block_count` zeroed blocks
    pub fn new(block_count: u64) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            block_count,
        }
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        check_request(block_num, self.block_count, buf.len())?;
        match self.blocks.read().get(&block_num) {
            Some(block) => buf.copy_from_slice(&block[..]),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        check_request(block_num, self.block_count, data.len())?;
        let mut block = Box::new([0u8; BLOCK_SIZE]);
        block.copy_from_slice(data);
        self.blocks.write().insert(block_num, block);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_block_device_operations() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_device.bin");

        let device = FileBackedBlockDevice::create(&file_path, 4096 * 8).unwrap();
        assert_eq!(device.block_count(), 8);

        let test_data = [0xAAu8; 4096];
        device.write_block(0, &test_data).unwrap();

        let mut read_buf = [0u8; 4096];
        device.read_block(0, &mut read_buf).unwrap();
        assert_eq!(test_data, read_buf);

        for i in 1..8 {
            let data = [i as u8; 4096];
            device.write_block(i, &data).unwrap();

            let mut read_data = [0u8; 4096];
            device.read_block(i, &mut read_data).unwrap();
            assert_eq!(data, read_data);
        }
        device.sync().unwrap();
    }

    #[test]
    fn test_read_only() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_read_only.bin");

        let device = FileBackedBlockDevice::create(&file_path, 4096).unwrap();
        device.write_block(0, &[0x55u8; 4096]).unwrap();
        device.sync().unwrap();

        let read_only_device = FileBackedBlockDevice::open(&file_path, true).unwrap();
        let mut read_buf = [0u8; 4096];
        read_only_device.read_block(0, &mut read_buf).unwrap();
        assert_eq!([0x55u8; 4096], read_buf);

        let write_result = read_only_device.write_block(0, &[0u8; 4096]);
        assert!(matches!(write_result, Err(BlockDeviceError::ReadOnly)));
    }

    #[test]
    fn test_bounds_checks() {
        let device = MemoryBlockDevice::new(2);
        let mut buf = [0u8; 4096];
        assert!(matches!(
            device.read_block(2, &mut buf),
            Err(BlockDeviceError::InvalidBlockNumber(2))
        ));
        assert!(matches!(
            device.write_block(0, &[0u8; 10]),
            Err(BlockDeviceError::InvalidBlockSize(10))
        ));

        // unwritten blocks read back as zeros
        buf.fill(0xFF);
        device.read_block(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
