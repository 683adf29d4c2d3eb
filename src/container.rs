//! # 容器 I/O 层
//!
//! 对宿主文件的定位读写。容器总长恒为 `(1+totalBlocks)*blockSize`,
//! 创建时一次性撑到位,之后块编号在 `[0, totalBlocks)` 内的读写
//! 不会再改变宿主文件的长度。

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{FsError, Result};
use crate::extent::Extent;
use crate::layout::super_block::{Superblock, HEADER_LEN};

#[derive(Debug)]
pub struct ContainerIO {
    file: Mutex<File>,
    block_size: u32,
    total_blocks: u64,
    closed: bool,
}

impl ContainerIO {
    /// 创建容器文件:写入超级块并预分配全部空间。
    /// 宿主路径已存在时失败。
    pub fn create(path: &Path, superblock: &Superblock) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    FsError::AlreadyExists(path.display().to_string())
                } else {
                    FsError::Io(e)
                }
            })?;

        let io = Self {
            file: Mutex::new(file),
            block_size: superblock.block_size(),
            total_blocks: superblock.total_blocks(),
            closed: false,
        };

        io.write_superblock(superblock)?;
        io.file
            .lock()
            .set_len(io.block_size as u64 * (1 + io.total_blocks))?;

        Ok(io)
    }

    /// 打开已有容器:读取并校验超级块头部,再取回完整的元数据区段表
    pub fn open(path: &Path, read_only: bool) -> Result<(Self, Superblock)> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    FsError::NotFound(path.display().to_string())
                } else {
                    FsError::Io(e)
                }
            })?;

        let mut header = [0u8; HEADER_LEN];
        {
            let mut f = &file;
            f.seek(SeekFrom::Start(0))?;
            f.read_exact(&mut header)
                .map_err(|_| FsError::InvalidFormat("container too short for superblock".into()))?;
        }

        // 头部只为取得块大小,完整校验交给整块反序列化
        let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
        if magic != crate::MAGIC {
            return Err(FsError::InvalidFormat(format!(
                "invalid magic number: {magic:#x}"
            )));
        }
        let block_size = u32::from_be_bytes(header[8..12].try_into().unwrap());
        if block_size < crate::MIN_BLOCK_SIZE || !block_size.is_power_of_two() {
            return Err(FsError::InvalidFormat(format!(
                "invalid block size: {block_size}"
            )));
        }

        let mut block = vec![0u8; block_size as usize];
        {
            let mut f = &file;
            f.seek(SeekFrom::Start(0))?;
            f.read_exact(&mut block)
                .map_err(|_| FsError::InvalidFormat("container shorter than one block".into()))?;
        }
        let superblock = Superblock::deserialize(&block)?;

        let io = Self {
            file: Mutex::new(file),
            block_size: superblock.block_size(),
            total_blocks: superblock.total_blocks(),
            closed: false,
        };

        Ok((io, superblock))
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// 读取一段连续块,返回 `count * blockSize` 字节
    pub fn read_blocks(&self, start_block: u64, count: u32) -> Result<Vec<u8>> {
        self.check_open()?;
        self.validate_block(start_block)?;
        self.validate_block(start_block + count as u64 - 1)?;

        let mut data = vec![0u8; count as usize * self.block_size as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.block_offset(start_block)))?;
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// 写一段连续块,不足整块的尾部补零
    pub fn write_blocks(&self, start_block: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.validate_block(start_block)?;

        let block_size = self.block_size as usize;
        let block_count = data.len().div_ceil(block_size).max(1);
        self.validate_block(start_block + block_count as u64 - 1)?;

        let padded_len = block_count * block_size;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.block_offset(start_block)))?;
        file.write_all(data)?;
        if data.len() < padded_len {
            file.write_all(&vec![0u8; padded_len - data.len()])?;
        }
        Ok(())
    }

    /// 在区段内指定偏移处读取,读取量被区段边界截断;
    /// 偏移已越过区段末尾时返回 0
    pub fn read_from_extent(&self, extent: Extent, offset: u64, dest: &mut [u8]) -> Result<usize> {
        self.check_open()?;

        let extent_bytes = extent.size_in_bytes(self.block_size);
        if offset >= extent_bytes {
            return Ok(0);
        }

        let n = dest.len().min((extent_bytes - offset) as usize);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(
            self.block_offset(extent.start_block()) + offset,
        ))?;
        file.read_exact(&mut dest[..n])?;
        Ok(n)
    }

    /// 在区段内指定偏移处写入,写入量被区段边界截断
    pub fn write_to_extent(&self, extent: Extent, offset: u64, src: &[u8]) -> Result<usize> {
        self.check_open()?;

        let extent_bytes = extent.size_in_bytes(self.block_size);
        if offset >= extent_bytes {
            return Ok(0);
        }

        let n = src.len().min((extent_bytes - offset) as usize);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(
            self.block_offset(extent.start_block()) + offset,
        ))?;
        file.write_all(&src[..n])?;
        Ok(n)
    }

    /// 把超级块写回偏移 0
    pub fn write_superblock(&self, superblock: &Superblock) -> Result<()> {
        self.check_open()?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&superblock.serialize())?;
        Ok(())
    }

    /// 把宿主文件缓冲强制刷到稳定存储
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        self.file.lock().sync_all()?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        !self.closed
    }

    #[inline]
    fn block_offset(&self, block: u64) -> u64 {
        self.block_size as u64 * (1 + block)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(FsError::Closed);
        }
        Ok(())
    }

    fn validate_block(&self, block: u64) -> Result<()> {
        if block >= self.total_blocks {
            return Err(FsError::Invalid(format!("block number out of range: {block}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_container(dir: &TempDir, name: &str) -> (ContainerIO, Superblock) {
        let sb = Superblock::new(512, 16).unwrap();
        let io = ContainerIO::create(&dir.path().join(name), &sb).unwrap();
        (io, sb)
    }

    #[test]
    fn create_preallocates_and_rejects_existing() {
        let dir = TempDir::new().unwrap();
        let (_io, _sb) = new_container(&dir, "c.box");

        let meta = std::fs::metadata(dir.path().join("c.box")).unwrap();
        assert_eq!(meta.len(), 512 * 17);

        let sb = Superblock::new(512, 16).unwrap();
        let err = ContainerIO::create(&dir.path().join("c.box"), &sb).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn open_round_trips_superblock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.box");
        {
            let mut sb = Superblock::new(512, 16).unwrap();
            let io = ContainerIO::create(&path, &sb).unwrap();
            sb.set_metadata_extents(vec![Extent::new(3, 2)]).unwrap();
            io.write_superblock(&sb).unwrap();
        }

        let (io, sb) = ContainerIO::open(&path, false).unwrap();
        assert_eq!(io.block_size(), 512);
        assert_eq!(io.total_blocks(), 16);
        assert_eq!(sb.metadata_extents(), &[Extent::new(3, 2)]);
    }

    #[test]
    fn open_missing_fails_not_found() {
        let dir = TempDir::new().unwrap();
        let err = ContainerIO::open(&dir.path().join("nope.box"), false).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn block_round_trip_with_padding() {
        let dir = TempDir::new().unwrap();
        let (io, _) = new_container(&dir, "c.box");

        io.write_blocks(2, &[0xAB; 700]).unwrap();
        let back = io.read_blocks(2, 2).unwrap();
        assert_eq!(&back[..700], &[0xAB; 700][..]);
        // 不足整块的部分补零
        assert!(back[700..].iter().all(|&b| b == 0));
    }

    #[test]
    fn block_range_is_validated() {
        let dir = TempDir::new().unwrap();
        let (io, _) = new_container(&dir, "c.box");

        assert!(io.read_blocks(16, 1).is_err());
        assert!(io.write_blocks(15, &[0u8; 1024]).is_err());
        assert!(io.read_blocks(15, 1).is_ok());
    }

    #[test]
    fn extent_io_is_clamped() {
        let dir = TempDir::new().unwrap();
        let (io, _) = new_container(&dir, "c.box");
        let extent = Extent::new(4, 2);

        // 跨过区段末尾的写入被截断
        let n = io.write_to_extent(extent, 1000, &[0x5A; 100]).unwrap();
        assert_eq!(n, 24);

        let mut buf = [0u8; 100];
        let n = io.read_from_extent(extent, 1000, &mut buf).unwrap();
        assert_eq!(n, 24);
        assert_eq!(&buf[..24], &[0x5A; 24][..]);

        // 区段之外读不到任何字节
        assert_eq!(io.read_from_extent(extent, 1024, &mut buf).unwrap(), 0);
    }

    #[test]
    fn closed_container_rejects_io() {
        let dir = TempDir::new().unwrap();
        let (mut io, _) = new_container(&dir, "c.box");
        io.close();

        assert!(matches!(io.read_blocks(0, 1), Err(FsError::Closed)));
        assert!(matches!(io.sync(), Err(FsError::Closed)));
    }
}
