//! # 字节通道
//!
//! 对单个文件的可定位随机读写。通道只记住 inode 编号与私有游标,
//! 每次调用都回到文件系统核心、在锁内重新查表,
//! 不持有任何跨越临界区的 inode 引用。
//!
//! 关闭通道是幂等的,且不触发落盘;文件系统关闭后,
//! 尚存的通道上的一切操作都以关闭错误告终。

use std::sync::{Arc, Weak};

use enumflags2::{bitflags, BitFlags};

use crate::error::{FsError, Result};
use crate::fs::BoxFileSystem;
use crate::layout::inode::InodeId;

/// 打开通道的标志。
/// 不带任何标志等价于只读打开。
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlag {
    /// 可读
    Read = 0b00_0001,
    /// 可写
    Write = 0b00_0010,
    /// 文件缺失时创建
    Create = 0b00_0100,
    /// 必须创建全新文件,已存在则失败
    CreateNew = 0b00_1000,
    /// 打开时把已有内容截断到零
    TruncateExisting = 0b01_0000,
    /// 每次写入都从当前文件末尾开始
    Append = 0b10_0000,
}

impl OpenFlag {
    /// 只读打开
    pub fn read_only() -> BitFlags<OpenFlag> {
        BitFlags::empty()
    }

    /// 读写兼备
    pub fn read_write() -> BitFlags<OpenFlag> {
        OpenFlag::Read | OpenFlag::Write
    }
}

#[derive(Debug)]
pub struct FileChannel {
    fs: Weak<BoxFileSystem>,
    inode_id: InodeId,
    readable: bool,
    writable: bool,
    append: bool,
    position: u64,
    open: bool,
}

impl FileChannel {
    pub(crate) fn new(
        fs: Weak<BoxFileSystem>,
        inode_id: InodeId,
        readable: bool,
        writable: bool,
        append: bool,
        position: u64,
    ) -> Self {
        Self {
            fs,
            inode_id,
            readable,
            writable,
            append,
            position,
            open: true,
        }
    }

    /// 从游标处读;文件末尾返回 0
    pub fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        let fs = self.fs()?;
        if !self.readable {
            return Err(FsError::Invalid("channel is not open for reading".into()));
        }

        let n = fs.channel_read(self.inode_id, self.position, dest)?;
        self.position += n as u64;
        Ok(n)
    }

    /// 向游标处写;追加模式下写入起点始终是当前文件末尾
    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        let fs = self.fs()?;
        if !self.writable {
            return Err(FsError::Invalid("channel is not open for writing".into()));
        }

        let (start, written) = fs.channel_write(self.inode_id, self.position, self.append, src)?;
        self.position = start + written as u64;
        Ok(written)
    }

    pub fn position(&self) -> Result<u64> {
        self.fs()?;
        Ok(self.position)
    }

    pub fn set_position(&mut self, position: u64) -> Result<()> {
        self.fs()?;
        self.position = position;
        Ok(())
    }

    /// 当前文件大小
    pub fn size(&self) -> Result<u64> {
        let fs = self.fs()?;
        fs.channel_size(self.inode_id)
    }

    /// 截断到指定大小;游标越界时拉回到新末尾
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        let fs = self.fs()?;
        if !self.writable {
            return Err(FsError::Invalid("channel is not open for writing".into()));
        }

        fs.channel_truncate(self.inode_id, size)?;
        if self.position > size {
            self.position = size;
        }
        Ok(())
    }

    /// 幂等关闭;持久性只由文件系统的 `sync`/`close` 保证
    pub fn close(&mut self) {
        self.open = false;
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// 通道与文件系统都必须仍处于打开状态
    fn fs(&self) -> Result<Arc<BoxFileSystem>> {
        if !self.open {
            return Err(FsError::Closed);
        }
        let fs = self.fs.upgrade().ok_or(FsError::Closed)?;
        if !fs.is_open() {
            return Err(FsError::Closed);
        }
        Ok(fs)
    }
}
