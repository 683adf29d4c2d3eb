//! # 文件系统核心层
//!
//! 组合目录表、inode 表、空间管理器与容器 I/O,
//! 对外提供基于路径的操作与区段级读写。
//!
//! 全部内存状态由一把读写锁保护:纯查询走共享锁,
//! 任何改动表、空闲链或容器内容的操作走排他锁。
//! 变更先累积在内存里,只有 `sync` 或 `close` 才写回宿主文件。
//!
//! 进程内还维护一张已打开容器的注册表,同一容器文件同时只允许打开一次。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use enumflags2::{bitflags, BitFlags};
use lazy_static::lazy_static;
use log::{debug, info};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::channel::{FileChannel, OpenFlag};
use crate::container::ContainerIO;
use crate::error::{FsError, Result};
use crate::extent::Extent;
use crate::layout::dir_entry::{DirEntry, DirectoryTable};
use crate::layout::inode::{Inode, InodeId, InodeKind, InodeTable, ROOT_INODE_ID};
use crate::layout::meta;
use crate::layout::super_block::Superblock;
use crate::path;
use crate::space::SpaceManager;
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_TOTAL_BLOCKS};

lazy_static! {
    /// 进程级注册表:宿主路径 -> 已打开的文件系统
    static ref OPEN_CONTAINERS: Mutex<HashMap<PathBuf, Arc<BoxFileSystem>>> =
        Mutex::new(HashMap::new());
}

/// 打开或创建容器时的选项
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// 容器文件缺失时是否创建
    pub create: bool,
    /// 只读打开:宿主文件以只读方式打开,一切变更操作失败
    pub read_only: bool,
    /// 新建容器的块大小,必须是 2 的幂且不小于 512;打开已有容器时忽略
    pub block_size: u32,
    /// 新建容器的块数;打开已有容器时忽略
    pub total_blocks: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            create: false,
            read_only: false,
            block_size: DEFAULT_BLOCK_SIZE,
            total_blocks: DEFAULT_TOTAL_BLOCKS,
        }
    }
}

/// 移动与复制的选项
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFlag {
    /// 目标已存在时先删除再落位;
    /// 按 POSIX 语义,文件与目录之间不可互相顶替
    ReplaceExisting = 1,
}

/// 一次属性读取的快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub inode: InodeId,
    pub kind: InodeKind,
    pub size: u64,
    pub created_ms: i64,
    pub modified_ms: i64,
    pub accessed_ms: i64,
}

impl From<&Inode> for Stat {
    fn from(inode: &Inode) -> Self {
        Self {
            inode: inode.id(),
            kind: inode.kind(),
            size: inode.size(),
            created_ms: inode.created_ms(),
            modified_ms: inode.modified_ms(),
            accessed_ms: inode.accessed_ms(),
        }
    }
}

#[derive(Debug)]
pub struct BoxFileSystem {
    host_path: PathBuf,
    read_only: bool,
    block_size: u32,
    total_blocks: u64,
    inner: RwLock<FsInner>,
}

#[derive(Debug)]
struct FsInner {
    container: ContainerIO,
    superblock: Superblock,
    inodes: InodeTable,
    directory: DirectoryTable,
    space: SpaceManager,
    open: bool,
}

impl BoxFileSystem {
    /// 打开或创建一个容器。
    /// 同一宿主文件在进程内只允许打开一次,重复打开失败。
    pub fn mount(host_path: impl AsRef<Path>, options: MountOptions) -> Result<Arc<Self>> {
        let host_path = std::path::absolute(host_path.as_ref())?;
        let mut registry = OPEN_CONTAINERS.lock();
        if registry.contains_key(&host_path) {
            return Err(FsError::AlreadyExists(host_path.display().to_string()));
        }

        let fs = if host_path.exists() {
            let (container, superblock) = ContainerIO::open(&host_path, options.read_only)?;
            let mut inner = FsInner {
                space: SpaceManager::new(superblock.total_blocks()),
                inodes: InodeTable::new(),
                directory: DirectoryTable::new(),
                container,
                superblock,
                open: true,
            };
            inner.load_metadata()?;

            info!(
                "mounted container {} ({} blocks of {} bytes, {} free)",
                host_path.display(),
                inner.superblock.total_blocks(),
                inner.superblock.block_size(),
                inner.space.total_free_blocks(),
            );
            Self::finish(host_path.clone(), options.read_only, inner)
        } else {
            if !options.create {
                return Err(FsError::NotFound(host_path.display().to_string()));
            }
            if options.read_only {
                return Err(FsError::Invalid(
                    "cannot create a container in read-only mode".into(),
                ));
            }

            let superblock = Superblock::new(options.block_size, options.total_blocks)?;
            let container = ContainerIO::create(&host_path, &superblock)?;
            let mut inner = FsInner {
                space: SpaceManager::new(superblock.total_blocks()),
                inodes: InodeTable::new(),
                directory: DirectoryTable::new(),
                container,
                superblock,
                open: true,
            };
            inner.space.initialize_new(0);
            inner.inodes.create_root_inode()?;
            inner.persist_metadata()?;

            info!(
                "formatted container {} ({} blocks of {} bytes)",
                host_path.display(),
                options.total_blocks,
                options.block_size,
            );
            Self::finish(host_path.clone(), false, inner)
        };

        registry.insert(host_path, fs.clone());
        Ok(fs)
    }

    fn finish(host_path: PathBuf, read_only: bool, inner: FsInner) -> Arc<Self> {
        Arc::new(Self {
            host_path,
            read_only,
            block_size: inner.superblock.block_size(),
            total_blocks: inner.superblock.total_blocks(),
            inner: RwLock::new(inner),
        })
    }

    /// 持久化元数据并把宿主文件刷到稳定存储
    pub fn sync(&self) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.write_inner()?;
        inner.persist_metadata()?;
        inner.container.sync()
    }

    /// 优雅关闭:持久化、刷盘、释放宿主文件并从注册表摘除。
    /// 重复关闭是无害的空操作。
    pub fn close(&self) -> Result<()> {
        {
            let mut inner = self.inner.write();
            if !inner.open {
                return Ok(());
            }
            if !self.read_only {
                inner.persist_metadata()?;
                inner.container.sync()?;
            }
            inner.open = false;
            inner.container.close();
        }
        OPEN_CONTAINERS.lock().remove(&self.host_path);
        info!("closed container {}", self.host_path.display());
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().open
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[inline]
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn free_blocks(&self) -> Result<u64> {
        Ok(self.read_inner()?.space.total_free_blocks())
    }

    pub fn create_file(&self, path: &str) -> Result<()> {
        self.check_writable()?;
        let abs = path::absolute(path);
        self.write_inner()?
            .create_entry(&abs, InodeKind::File)
            .map(|_| ())
    }

    pub fn create_directory(&self, path: &str) -> Result<()> {
        self.check_writable()?;
        let abs = path::absolute(path);
        self.write_inner()?
            .create_entry(&abs, InodeKind::Directory)
            .map(|_| ())
    }

    /// 删除文件或空目录,归还其全部数据区段
    pub fn delete(&self, path: &str) -> Result<()> {
        self.check_writable()?;
        let abs = path::absolute(path);
        self.write_inner()?.delete(&abs)
    }

    /// 容器内移动或改名,纯元数据交换,不搬运数据
    pub fn rename(
        &self,
        source: &str,
        target: &str,
        flags: impl Into<BitFlags<CopyFlag>>,
    ) -> Result<()> {
        self.check_writable()?;
        let src = path::absolute(source);
        let dst = path::absolute(target);
        self.write_inner()?
            .rename(&src, &dst, flags.into().contains(CopyFlag::ReplaceExisting))
    }

    /// 容器内复制一个文件;目录不可复制
    pub fn copy(
        &self,
        source: &str,
        target: &str,
        flags: impl Into<BitFlags<CopyFlag>>,
    ) -> Result<()> {
        self.check_writable()?;
        let src = path::absolute(source);
        let dst = path::absolute(target);
        self.write_inner()?
            .copy(&src, &dst, flags.into().contains(CopyFlag::ReplaceExisting))
    }

    pub fn exists(&self, path: &str) -> bool {
        let abs = path::absolute(path);
        self.read_inner()
            .map(|inner| inner.resolve(&abs).is_some())
            .unwrap_or(false)
    }

    pub fn read_attributes(&self, path: &str) -> Result<Stat> {
        let abs = path::absolute(path);
        let inner = self.read_inner()?;
        let id = inner
            .resolve(&abs)
            .ok_or_else(|| FsError::NotFound(abs.clone()))?;
        Ok(Stat::from(inner.inode(id)?))
    }

    /// 列出目录内容的快照,名字升序
    pub fn list_directory(&self, path: &str) -> Result<Vec<String>> {
        let abs = path::absolute(path);
        let inner = self.read_inner()?;
        let id = inner
            .resolve(&abs)
            .ok_or_else(|| FsError::NotFound(abs.clone()))?;
        if !inner.inode(id)?.is_directory() {
            return Err(FsError::NotDirectory(abs));
        }

        let mut names: Vec<String> = inner
            .directory
            .list_children(id)
            .into_iter()
            .map(|entry| entry.name().to_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    /// 打开一个字节通道。
    /// 不带任何标志等价于只读;写、追加或截断标志都隐含可写。
    pub fn open_channel(
        self: &Arc<Self>,
        path: &str,
        flags: impl Into<BitFlags<OpenFlag>>,
    ) -> Result<FileChannel> {
        let flags = flags.into();
        let abs = path::absolute(path);

        let readable = flags.is_empty() || flags.contains(OpenFlag::Read);
        let writable = flags.contains(OpenFlag::Write)
            || flags.contains(OpenFlag::Append)
            || flags.contains(OpenFlag::TruncateExisting);
        let create = flags.contains(OpenFlag::Create);
        let create_new = flags.contains(OpenFlag::CreateNew);
        let append = flags.contains(OpenFlag::Append);

        if writable {
            self.check_writable()?;
        }

        let (inode_id, position) = if writable {
            let mut inner = self.write_inner()?;
            match inner.resolve(&abs) {
                Some(id) => {
                    if create_new {
                        return Err(FsError::AlreadyExists(abs));
                    }
                    if !inner.inode(id)?.is_file() {
                        return Err(FsError::Invalid(format!("not a regular file: {abs}")));
                    }
                    if flags.contains(OpenFlag::TruncateExisting) {
                        inner.truncate_file(id, 0)?;
                    }
                    let position = if append { inner.inode(id)?.size() } else { 0 };
                    (id, position)
                }
                None => {
                    if !create && !create_new {
                        return Err(FsError::NotFound(abs));
                    }
                    (inner.create_entry(&abs, InodeKind::File)?, 0)
                }
            }
        } else {
            let inner = self.read_inner()?;
            match inner.resolve(&abs) {
                Some(id) => {
                    if create_new {
                        return Err(FsError::AlreadyExists(abs));
                    }
                    if !inner.inode(id)?.is_file() {
                        return Err(FsError::Invalid(format!("not a regular file: {abs}")));
                    }
                    (id, 0)
                }
                None => return Err(FsError::NotFound(abs)),
            }
        };

        Ok(FileChannel::new(
            Arc::downgrade(self),
            inode_id,
            readable,
            writable,
            append,
            position,
        ))
    }

    pub(crate) fn channel_read(
        &self,
        inode_id: InodeId,
        position: u64,
        dest: &mut [u8],
    ) -> Result<usize> {
        self.read_inner()?.read_file_data(inode_id, position, dest)
    }

    /// 返回 `(写入起点, 写入字节数)`;追加模式在锁内取当前大小作为起点
    pub(crate) fn channel_write(
        &self,
        inode_id: InodeId,
        position: u64,
        append: bool,
        src: &[u8],
    ) -> Result<(u64, usize)> {
        self.check_writable()?;
        let mut inner = self.write_inner()?;
        let start = if append {
            inner.inode(inode_id)?.size()
        } else {
            position
        };
        let written = inner.write_file_data(inode_id, start, src)?;
        Ok((start, written))
    }

    pub(crate) fn channel_truncate(&self, inode_id: InodeId, size: u64) -> Result<()> {
        self.check_writable()?;
        self.write_inner()?.truncate_file(inode_id, size)
    }

    pub(crate) fn channel_size(&self, inode_id: InodeId) -> Result<u64> {
        Ok(self.read_inner()?.inode(inode_id)?.size())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    fn read_inner(&self) -> Result<RwLockReadGuard<'_, FsInner>> {
        let inner = self.inner.read();
        if !inner.open {
            return Err(FsError::Closed);
        }
        Ok(inner)
    }

    fn write_inner(&self) -> Result<RwLockWriteGuard<'_, FsInner>> {
        let inner = self.inner.write();
        if !inner.open {
            return Err(FsError::Closed);
        }
        Ok(inner)
    }
}

/// 区段在文件内的逻辑字节范围
struct ExtentRange {
    extent: Extent,
    start_byte: u64,
    end_byte: u64,
}

fn extent_ranges(extents: &[Extent], block_size: u32) -> Vec<ExtentRange> {
    let mut ranges = Vec::with_capacity(extents.len());
    let mut cumulative = 0u64;
    for &extent in extents {
        let end_byte = cumulative + extent.size_in_bytes(block_size);
        ranges.push(ExtentRange {
            extent,
            start_byte: cumulative,
            end_byte,
        });
        cumulative = end_byte;
    }
    ranges
}

impl FsInner {
    fn inode(&self, id: InodeId) -> Result<&Inode> {
        self.inodes
            .get(id)
            .ok_or_else(|| FsError::NotFound(format!("inode {id}")))
    }

    fn inode_mut(&mut self, id: InodeId) -> Result<&mut Inode> {
        self.inodes
            .get_mut(id)
            .ok_or_else(|| FsError::NotFound(format!("inode {id}")))
    }

    /// 从根出发逐组件查表;第一个缺失组件即告失败。
    /// 空路径与 `/` 都解析到根。
    fn resolve(&self, abs: &str) -> Option<InodeId> {
        let mut current = ROOT_INODE_ID;
        for component in path::components(abs) {
            current = self.directory.lookup(current, component)?;
        }
        Some(current)
    }

    fn create_entry(&mut self, abs: &str, kind: InodeKind) -> Result<InodeId> {
        if path::is_root(abs) {
            return Err(FsError::AlreadyExists("/".into()));
        }
        let (parent_path, name) = path::split_parent(abs)
            .ok_or_else(|| FsError::AlreadyExists("/".into()))?;

        let parent_id = self
            .resolve(&parent_path)
            .ok_or(FsError::NotFound(parent_path.clone()))?;
        if !self.inode(parent_id)?.is_directory() {
            return Err(FsError::NotDirectory(parent_path));
        }
        if self.directory.lookup(parent_id, &name).is_some() {
            return Err(FsError::AlreadyExists(abs.into()));
        }

        let id = self.inodes.create_inode(kind);
        match DirEntry::new(parent_id, name, id) {
            Ok(entry) => {
                self.directory.add_entry(entry);
                Ok(id)
            }
            Err(e) => {
                // 名字非法,收回刚分配的 inode
                let _ = self.inodes.remove(id);
                Err(e)
            }
        }
    }

    fn delete(&mut self, abs: &str) -> Result<()> {
        if path::is_root(abs) {
            return Err(FsError::Invalid("cannot delete root directory".into()));
        }

        let id = self
            .resolve(abs)
            .ok_or_else(|| FsError::NotFound(abs.into()))?;
        let inode = self.inode(id)?;

        if inode.is_directory() && self.directory.has_children(id) {
            return Err(FsError::DirectoryNotEmpty(abs.into()));
        }

        let extents = inode.extents().to_vec();
        let (parent_path, name) = path::split_parent(abs)
            .ok_or_else(|| FsError::Invalid("cannot delete root directory".into()))?;
        let parent_id = self
            .resolve(&parent_path)
            .ok_or(FsError::NotFound(parent_path))?;

        if !extents.is_empty() {
            self.space.free_all(&extents);
        }
        self.directory.remove_entry(parent_id, &name);
        self.inodes.remove(id)
    }

    fn rename(&mut self, src: &str, dst: &str, replace: bool) -> Result<()> {
        if path::is_root(src) {
            return Err(FsError::Invalid("cannot move root directory".into()));
        }
        if src == dst {
            return Ok(());
        }

        let source_id = self
            .resolve(src)
            .ok_or_else(|| FsError::NotFound(src.into()))?;
        let source_kind = self.inode(source_id)?.kind();

        // 目录不许搬进自己的子树,否则目录图会脱离根
        if source_kind == InodeKind::Directory {
            if let Some((dst_parent, _)) = path::split_parent(dst) {
                if let Some(mut current) = self.resolve(&dst_parent) {
                    loop {
                        if current == source_id {
                            return Err(FsError::Invalid(
                                "cannot move a directory into its own subtree".into(),
                            ));
                        }
                        match self.directory.entry_for_child(current) {
                            Some(entry) => current = entry.parent_id(),
                            None => break,
                        }
                    }
                }
            }
        }

        let (target_parent_id, target_name) = self.prepare_target(source_kind, dst, replace)?;

        let (src_parent_path, src_name) = path::split_parent(src)
            .ok_or_else(|| FsError::Invalid("cannot move root directory".into()))?;
        let src_parent_id = self
            .resolve(&src_parent_path)
            .ok_or(FsError::NotFound(src_parent_path))?;

        self.directory
            .relocate(src_parent_id, &src_name, target_parent_id, &target_name)
    }

    fn copy(&mut self, src: &str, dst: &str, replace: bool) -> Result<()> {
        let source_id = self
            .resolve(src)
            .ok_or_else(|| FsError::NotFound(src.into()))?;
        let source = self.inode(source_id)?;
        if source.is_directory() {
            return Err(FsError::Invalid("Cannot copy directories".into()));
        }
        let source_size = source.size();

        let (target_parent_id, target_name) =
            self.prepare_target(InodeKind::File, dst, replace)?;

        let new_id = self.inodes.create_inode(InodeKind::File);
        match DirEntry::new(target_parent_id, target_name, new_id) {
            Ok(entry) => self.directory.add_entry(entry),
            Err(e) => {
                let _ = self.inodes.remove(new_id);
                return Err(e);
            }
        }

        if source_size > 0 {
            let block_size = self.superblock.block_size();
            let blocks_needed = source_size.div_ceil(block_size as u64);

            let extents = self.space.allocate_multiple(blocks_needed);
            if extents.is_empty() {
                // 回滚空目标,容器里不留空壳
                self.delete(dst)?;
                return Err(FsError::NoSpace);
            }

            let mut buf = vec![0u8; source_size as usize];
            let n = self.read_file_data(source_id, 0, &mut buf)?;
            buf.truncate(n);

            self.inode_mut(new_id)?.set_extents(extents);
            self.write_file_data(new_id, 0, &buf)?;
        }

        Ok(())
    }

    /// 校验移动/复制的目标:父目录存在且是目录;
    /// 目标已存在时按 `replace` 与类型兼容性决定删除或报错。
    /// 返回目标父目录与末项名。
    fn prepare_target(
        &mut self,
        source_kind: InodeKind,
        dst: &str,
        replace: bool,
    ) -> Result<(InodeId, String)> {
        let (parent_path, name) = path::split_parent(dst)
            .ok_or_else(|| FsError::Invalid("invalid target path".into()))?;

        let parent_id = self
            .resolve(&parent_path)
            .ok_or(FsError::NotFound(parent_path.clone()))?;
        if !self.inode(parent_id)?.is_directory() {
            return Err(FsError::NotDirectory(parent_path));
        }

        if let Some(existing) = self.directory.lookup(parent_id, &name) {
            if !replace {
                return Err(FsError::AlreadyExists(dst.into()));
            }
            let existing_kind = self.inode(existing)?.kind();
            if source_kind == InodeKind::File && existing_kind == InodeKind::Directory {
                return Err(FsError::Invalid("Cannot replace directory with file".into()));
            }
            if source_kind == InodeKind::Directory && existing_kind == InodeKind::File {
                return Err(FsError::Invalid("Cannot replace file with directory".into()));
            }
            self.delete(dst)?;
        }

        Ok((parent_id, name))
    }

    /// 区段感知读:沿逻辑字节范围找到落点,逐区段读到缓冲填满或文件结束。
    /// 起点在文件末尾及之后时读到 0 字节。
    fn read_file_data(&self, inode_id: InodeId, position: u64, dest: &mut [u8]) -> Result<usize> {
        let inode = self.inode(inode_id)?;
        let size = inode.size();
        if position >= size {
            return Ok(0);
        }

        let block_size = self.superblock.block_size();
        let ranges = extent_ranges(inode.extents(), block_size);

        let mut total = 0usize;
        let mut pos = position;

        for range in &ranges {
            if pos < range.start_byte || pos >= range.end_byte {
                continue;
            }

            let offset_in_extent = pos - range.start_byte;
            let n = (range.end_byte - pos)
                .min(size - pos)
                .min((dest.len() - total) as u64) as usize;
            if n == 0 {
                break;
            }

            let read = self.container.read_from_extent(
                range.extent,
                offset_in_extent,
                &mut dest[total..total + n],
            )?;
            total += read;
            pos += read as u64;

            if total == dest.len() || pos >= size {
                break;
            }
        }

        Ok(total)
    }

    /// 区段感知写:容量不足时先向空间管理器批量追加区段,
    /// 再沿逻辑范围逐区段写入;越过旧末尾时更新大小。
    fn write_file_data(&mut self, inode_id: InodeId, position: u64, src: &[u8]) -> Result<usize> {
        let block_size = self.superblock.block_size();
        let end = position + src.len() as u64;

        let allocated = self.inode(inode_id)?.allocated_bytes(block_size);
        if end > allocated {
            let blocks_needed = (end - allocated).div_ceil(block_size as u64);
            let new_extents = self.space.allocate_multiple(blocks_needed);
            if new_extents.is_empty() {
                return Err(FsError::NoSpace);
            }
            let inode = self.inode_mut(inode_id)?;
            for extent in new_extents {
                inode.add_extent(extent);
            }
        }

        let ranges = extent_ranges(self.inode(inode_id)?.extents(), block_size);
        let mut total = 0usize;
        let mut pos = position;

        for range in &ranges {
            if pos < range.start_byte || pos >= range.end_byte {
                continue;
            }

            let offset_in_extent = pos - range.start_byte;
            let n = ((range.end_byte - pos) as usize).min(src.len() - total);
            if n == 0 {
                break;
            }

            let written = self.container.write_to_extent(
                range.extent,
                offset_in_extent,
                &src[total..total + n],
            )?;
            total += written;
            pos += written as u64;

            if total == src.len() {
                break;
            }
        }

        let inode = self.inode_mut(inode_id)?;
        if end > inode.size() {
            inode.set_size(end);
        }
        inode.touch();

        Ok(total)
    }

    /// 收缩截断:整段保留的区段原样保留,跨界区段一分为二,
    /// 其余整段连同跨界的尾巴归还给空间管理器。放大方向是空操作。
    fn truncate_file(&mut self, inode_id: InodeId, new_size: u64) -> Result<()> {
        let inode = self.inode(inode_id)?;
        if new_size >= inode.size() {
            return Ok(());
        }

        let block_size = self.superblock.block_size();
        let blocks_needed = new_size.div_ceil(block_size as u64);

        let mut keep: Vec<Extent> = Vec::new();
        let mut freed: Vec<Extent> = Vec::new();
        let mut accumulated = 0u64;

        for &extent in inode.extents() {
            if accumulated >= blocks_needed {
                freed.push(extent);
            } else if accumulated + extent.block_count() as u64 <= blocks_needed {
                keep.push(extent);
                accumulated += extent.block_count() as u64;
            } else {
                let keep_blocks = (blocks_needed - accumulated) as u32;
                keep.push(Extent::new(extent.start_block(), keep_blocks));
                freed.push(Extent::new(
                    extent.start_block() + keep_blocks as u64,
                    extent.block_count() - keep_blocks,
                ));
                accumulated += keep_blocks as u64;
            }
        }

        let inode = self.inode_mut(inode_id)?;
        inode.set_extents(keep);
        inode.set_size(new_size);
        inode.touch();

        if !freed.is_empty() {
            self.space.free_all(&freed);
        }
        Ok(())
    }

    /// 持久化全部元数据。
    /// 元数据里含有空闲链自身:给元数据换地方会改变空闲链,
    /// 进而改变序列化后的大小,因此循环到序列化结果装得下所持区段为止。
    /// 释放并重分配只会减少碎片,循环实际一两轮便收敛。
    fn persist_metadata(&mut self) -> Result<()> {
        let block_size = self.superblock.block_size() as u64;
        let mut current: Vec<Extent> = self.superblock.metadata_extents().to_vec();

        loop {
            let bytes = meta::serialize(&self.inodes, &self.directory, &self.space);
            let blocks_needed = (bytes.len() as u64).div_ceil(block_size);
            let held: u64 = current.iter().map(|e| e.block_count() as u64).sum();

            if blocks_needed <= held {
                self.write_metadata(&bytes, &current)?;
                debug!(
                    "persisted metadata: {} bytes into {} extents",
                    bytes.len(),
                    current.len(),
                );
                break;
            }

            // 归还旧区段与重新分配先在副本上演算:
            // 碎片严重时新区段数会超出超级块的记载上限,
            // 那种失败不得触碰真实的空闲链与超级块。
            // 归还先于分配,新请求才有机会原地复用旧区段。
            let mut trial = self.space.clone();
            trial.free_all(&current);
            let fresh = trial.allocate_multiple(blocks_needed);
            if fresh.is_empty() {
                return Err(FsError::NoSpace);
            }
            self.superblock.set_metadata_extents(fresh.clone())?;
            self.space = trial;
            current = fresh;
        }

        self.container.write_superblock(&self.superblock)
    }

    /// 把元数据字节依次写满各区段,最后一块的空余补零
    fn write_metadata(&self, bytes: &[u8], extents: &[Extent]) -> Result<()> {
        let block_size = self.superblock.block_size() as usize;
        let mut offset = 0usize;

        for extent in extents {
            if offset >= bytes.len() {
                break;
            }
            let extent_len = extent.block_count() as usize * block_size;
            let n = extent_len.min(bytes.len() - offset);

            let mut chunk = vec![0u8; extent_len];
            chunk[..n].copy_from_slice(&bytes[offset..offset + n]);
            self.container.write_blocks(extent.start_block(), &chunk)?;
            offset += n;
        }
        Ok(())
    }

    /// 打开已有容器时,从超级块指向的区段读出并重建全部表
    fn load_metadata(&mut self) -> Result<()> {
        let extents = self.superblock.metadata_extents().to_vec();
        if extents.is_empty() {
            return Err(FsError::InvalidFormat(
                "no metadata extents in container".into(),
            ));
        }

        let mut bytes = Vec::new();
        for extent in &extents {
            bytes.extend_from_slice(
                &self
                    .container
                    .read_blocks(extent.start_block(), extent.block_count())?,
            );
        }

        meta::deserialize(&bytes, &mut self.inodes, &mut self.directory, &mut self.space)?;

        if !self.inodes.contains(ROOT_INODE_ID) {
            return Err(FsError::InvalidFormat("missing root inode".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::channel::OpenFlag;

    fn mount_new(dir: &TempDir, name: &str, total_blocks: u64) -> Arc<BoxFileSystem> {
        BoxFileSystem::mount(
            dir.path().join(name),
            MountOptions {
                create: true,
                total_blocks,
                block_size: 512,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn write_file(fs: &Arc<BoxFileSystem>, path: &str, data: &[u8]) {
        let mut channel = fs
            .open_channel(path, OpenFlag::Write | OpenFlag::Create)
            .unwrap();
        assert_eq!(channel.write(data).unwrap(), data.len());
        channel.close();
    }

    /// 空闲链、文件数据区段与元数据区段必须恰好铺满 `[0, totalBlocks)`,
    /// 互相之间没有任何重叠
    fn assert_partition(fs: &BoxFileSystem) {
        let inner = fs.inner.read();
        let total = inner.superblock.total_blocks() as usize;
        let mut owners = vec![0u32; total];

        let mut mark = |extent: &Extent| {
            for b in extent.start_block()..extent.end_block() {
                owners[b as usize] += 1;
            }
        };

        for extent in inner.space.free_extents() {
            mark(extent);
        }
        for inode in inner.inodes.all() {
            for extent in inode.extents() {
                mark(extent);
            }
        }
        for extent in inner.superblock.metadata_extents() {
            mark(extent);
        }

        for (block, &count) in owners.iter().enumerate() {
            assert_eq!(count, 1, "block {block} owned {count} times");
        }
    }

    #[test]
    fn block_space_stays_partitioned() {
        let dir = TempDir::new().unwrap();
        let fs = mount_new(&dir, "part.box", 64);
        assert_partition(&fs);

        write_file(&fs, "/a.bin", &[1u8; 2000]);
        write_file(&fs, "/b.bin", &[2u8; 600]);
        assert_partition(&fs);

        fs.delete("/a.bin").unwrap();
        write_file(&fs, "/c.bin", &[3u8; 5000]);
        assert_partition(&fs);

        let mut channel = fs.open_channel("/c.bin", OpenFlag::Write).unwrap();
        channel.truncate(700).unwrap();
        channel.close();
        assert_partition(&fs);

        fs.sync().unwrap();
        assert_partition(&fs);

        fs.close().unwrap();
    }

    #[test]
    fn persist_reuses_extents_while_metadata_fits() {
        let dir = TempDir::new().unwrap();
        let fs = mount_new(&dir, "reuse.box", 64);

        write_file(&fs, "/one.bin", &[9u8; 100]);
        fs.sync().unwrap();
        let before = fs.inner.read().superblock.metadata_extents().to_vec();

        // 元数据没有明显增长,第二次持久化应当原地复用同一批区段
        fs.sync().unwrap();
        let after = fs.inner.read().superblock.metadata_extents().to_vec();
        assert_eq!(before, after);

        fs.close().unwrap();
    }

    #[test]
    fn growing_metadata_relocates_extents() {
        let dir = TempDir::new().unwrap();
        let fs = mount_new(&dir, "grow.box", 64);
        fs.sync().unwrap();

        let before: u64 = fs
            .inner
            .read()
            .superblock
            .metadata_extents()
            .iter()
            .map(|e| e.block_count() as u64)
            .sum();

        for i in 0..40 {
            fs.create_file(&format!("/spread-the-table-file-{i:02}")).unwrap();
        }
        fs.sync().unwrap();

        let inner = fs.inner.read();
        let after: u64 = inner
            .superblock
            .metadata_extents()
            .iter()
            .map(|e| e.block_count() as u64)
            .sum();
        assert!(after > before, "metadata must outgrow its first block");
        drop(inner);
        assert_partition(&fs);

        fs.close().unwrap();
    }

    /// 碎片多到新元数据区段数超出超级块上限时,
    /// 持久化必须失败而不动摇内存里的空闲链与超级块
    #[test]
    fn failed_persist_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let fs = mount_new(&dir, "frag.box", 256);

        // 撑大元数据:80 个长名字条目,序列化后远超 40 块
        for i in 0..80 {
            fs.create_file(&format!("/{i:0>250}")).unwrap();
        }

        // 人为把空闲链拆成互不相邻的单块碎片
        let fragments: Vec<Extent> = (0..128).map(|i| Extent::new(2 * i + 1, 1)).collect();
        fs.inner.write().space.set_free_extents(fragments);

        let (free_before, meta_before) = {
            let inner = fs.inner.read();
            (
                inner.space.free_extents().to_vec(),
                inner.superblock.metadata_extents().to_vec(),
            )
        };

        let err = fs.sync().unwrap_err();
        assert!(matches!(err, FsError::Invalid(_)));

        let inner = fs.inner.read();
        assert_eq!(inner.space.free_extents(), &free_before[..]);
        assert_eq!(inner.superblock.metadata_extents(), &meta_before[..]);
        drop(inner);

        // 碎片消除后,同一份元数据就能正常落盘
        fs.inner.write().space.set_free_extents(vec![Extent::new(128, 128)]);
        fs.sync().unwrap();
        fs.close().unwrap();
    }

    #[test]
    fn registry_rejects_double_mount() {
        let dir = TempDir::new().unwrap();
        let fs = mount_new(&dir, "twice.box", 64);

        let err =
            BoxFileSystem::mount(dir.path().join("twice.box"), MountOptions::default())
                .unwrap_err();
        assert!(err.is_already_exists());

        fs.close().unwrap();

        // 关闭之后允许再次打开
        let fs = BoxFileSystem::mount(dir.path().join("twice.box"), MountOptions::default())
            .unwrap();
        fs.close().unwrap();
    }
}
