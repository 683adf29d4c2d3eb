//! # 超级块
//!
//! 固定位于容器偏移 0 处、恰好占一个块:
//! 校验文件系统合法性,并定位元数据区段。
//! 所有数据块位于 `[blockSize, (1+totalBlocks)*blockSize)`,
//! 以零起始的块编号寻址。

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{FsError, Result};
use crate::extent::Extent;
use crate::{MAGIC, MIN_BLOCK_SIZE, VERSION};

/// 固定头部:magic(4) + version(4) + blockSize(4) + totalBlocks(8) + extentCount(4)
pub const HEADER_LEN: usize = 24;
/// 每条元数据区段:startBlock(8) + blockCount(4)
const EXTENT_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct Superblock {
    block_size: u32,
    total_blocks: u64,
    metadata_extents: Vec<Extent>,
}

impl Superblock {
    pub fn new(block_size: u32, total_blocks: u64) -> Result<Self> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(FsError::Invalid(format!(
                "block size must be at least {MIN_BLOCK_SIZE}, got {block_size}"
            )));
        }
        if !block_size.is_power_of_two() {
            return Err(FsError::Invalid(format!(
                "block size must be a power of 2, got {block_size}"
            )));
        }
        if total_blocks == 0 {
            return Err(FsError::Invalid("total blocks must be positive".into()));
        }

        Ok(Self {
            block_size,
            total_blocks,
            metadata_extents: Vec::new(),
        })
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    #[inline]
    pub fn metadata_extents(&self) -> &[Extent] {
        &self.metadata_extents
    }

    /// 一个块所能容纳的元数据区段条数上限
    #[inline]
    pub fn max_metadata_extents(&self) -> usize {
        (self.block_size as usize - HEADER_LEN) / EXTENT_LEN
    }

    pub fn set_metadata_extents(&mut self, extents: Vec<Extent>) -> Result<()> {
        let max = self.max_metadata_extents();
        if extents.len() > max {
            return Err(FsError::Invalid(format!(
                "too many metadata extents: {} (max {max})",
                extents.len()
            )));
        }
        self.metadata_extents = extents;
        Ok(())
    }

    /// 块编号对应的容器内字节偏移;块 0 紧跟在超级块之后
    #[inline]
    pub fn block_offset(&self, block: u64) -> u64 {
        self.block_size as u64 * (1 + block)
    }

    /// 序列化为一个完整的块,尾部补零,大端序
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.block_size as usize);

        buf.write_u32::<BigEndian>(MAGIC).unwrap();
        buf.write_u32::<BigEndian>(VERSION).unwrap();
        buf.write_u32::<BigEndian>(self.block_size).unwrap();
        buf.write_u64::<BigEndian>(self.total_blocks).unwrap();
        buf.write_u32::<BigEndian>(self.metadata_extents.len() as u32)
            .unwrap();

        for extent in &self.metadata_extents {
            buf.write_u64::<BigEndian>(extent.start_block()).unwrap();
            buf.write_u32::<BigEndian>(extent.block_count()).unwrap();
        }

        buf.resize(self.block_size as usize, 0);
        buf
    }

    /// 从一个完整块反序列化
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(FsError::InvalidFormat("superblock data too short".into()));
        }

        let mut cursor = Cursor::new(data);
        let short = |_| FsError::InvalidFormat("superblock data too short".into());

        let magic = cursor.read_u32::<BigEndian>().map_err(short)?;
        if magic != MAGIC {
            return Err(FsError::InvalidFormat(format!(
                "invalid magic number: {magic:#x}"
            )));
        }

        let version = cursor.read_u32::<BigEndian>().map_err(short)?;
        if version != VERSION {
            return Err(FsError::InvalidFormat(format!(
                "unsupported version: {version}"
            )));
        }

        let block_size = cursor.read_u32::<BigEndian>().map_err(short)?;
        let total_blocks = cursor.read_u64::<BigEndian>().map_err(short)?;
        let extent_count = cursor.read_u32::<BigEndian>().map_err(short)? as usize;

        let mut superblock = Self::new(block_size, total_blocks)
            .map_err(|e| FsError::InvalidFormat(e.to_string()))?;

        if extent_count > superblock.max_metadata_extents() {
            return Err(FsError::InvalidFormat(format!(
                "invalid metadata extent count: {extent_count} (max {})",
                superblock.max_metadata_extents()
            )));
        }

        let mut extents = Vec::with_capacity(extent_count);
        for _ in 0..extent_count {
            let start_block = cursor.read_u64::<BigEndian>().map_err(short)?;
            let block_count = cursor.read_u32::<BigEndian>().map_err(short)?;
            if block_count == 0 || start_block + block_count as u64 > total_blocks {
                return Err(FsError::InvalidFormat(format!(
                    "metadata extent out of range: ({start_block}, {block_count})"
                )));
            }
            extents.push(Extent::new(start_block, block_count));
        }
        superblock.metadata_extents = extents;

        Ok(superblock)
    }
}
