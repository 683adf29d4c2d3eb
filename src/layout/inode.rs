//! # inode 表
//!
//! 全部 inode 常驻内存,`id -> Inode` 的 O(1) 查找;
//! id 单调分配,根目录恒为 0 号且不可删除。

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{FsError, Result};
use crate::extent::Extent;

pub type InodeId = u64;

/// 根目录的 inode 编号
pub const ROOT_INODE_ID: InodeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
}

impl InodeKind {
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            InodeKind::File => 0,
            InodeKind::Directory => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(InodeKind::File),
            1 => Ok(InodeKind::Directory),
            _ => Err(FsError::InvalidFormat(format!(
                "unknown inode type code: {code}"
            ))),
        }
    }
}

/// 文件或目录的描述符:类型、大小、数据区段与时间戳。
/// 目录的大小恒为 0 且没有数据区段。
#[derive(Debug, Clone)]
pub struct Inode {
    id: InodeId,
    kind: InodeKind,
    size: u64,
    extents: Vec<Extent>,
    created_ms: i64,
    modified_ms: i64,
    accessed_ms: i64,
}

/// 当前时间的 epoch 毫秒
fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Inode {
    pub fn new(id: InodeId, kind: InodeKind) -> Self {
        let now = now_millis();
        Self {
            id,
            kind,
            size: 0,
            extents: Vec::new(),
            created_ms: now,
            modified_ms: now,
            accessed_ms: now,
        }
    }

    /// 反序列化时使用,全部字段取磁盘上的值
    pub fn from_parts(
        id: InodeId,
        kind: InodeKind,
        size: u64,
        extents: Vec<Extent>,
        created_ms: i64,
        modified_ms: i64,
        accessed_ms: i64,
    ) -> Self {
        Self {
            id,
            kind,
            size,
            extents,
            created_ms,
            modified_ms,
            accessed_ms,
        }
    }

    #[inline]
    pub fn id(&self) -> InodeId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    #[inline]
    pub fn is_file(&self) -> bool {
        self.kind == InodeKind::File
    }

    #[inline]
    pub fn is_directory(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    #[inline]
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn add_extent(&mut self, extent: Extent) {
        self.extents.push(extent);
    }

    pub fn set_extents(&mut self, extents: Vec<Extent>) {
        self.extents = extents;
    }

    pub fn clear_extents(&mut self) {
        self.extents.clear();
    }

    /// 已分配的块数
    pub fn allocated_blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.block_count() as u64).sum()
    }

    /// 已分配的字节容量,可能大于 `size`
    pub fn allocated_bytes(&self, block_size: u32) -> u64 {
        self.allocated_blocks() * block_size as u64
    }

    #[inline]
    pub fn created_ms(&self) -> i64 {
        self.created_ms
    }

    #[inline]
    pub fn modified_ms(&self) -> i64 {
        self.modified_ms
    }

    #[inline]
    pub fn accessed_ms(&self) -> i64 {
        self.accessed_ms
    }

    /// 内容发生变化时刷新修改与访问时间
    pub fn touch(&mut self) {
        let now = now_millis();
        self.modified_ms = now;
        self.accessed_ms = now;
    }
}

#[derive(Debug, Default)]
pub struct InodeTable {
    inodes: HashMap<InodeId, Inode>,
    next_id: InodeId,
}

impl InodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建根目录 inode,已存在则失败
    pub fn create_root_inode(&mut self) -> Result<()> {
        if self.inodes.contains_key(&ROOT_INODE_ID) {
            return Err(FsError::Invalid("root inode already exists".into()));
        }
        self.inodes
            .insert(ROOT_INODE_ID, Inode::new(ROOT_INODE_ID, InodeKind::Directory));
        self.next_id = ROOT_INODE_ID + 1;
        Ok(())
    }

    /// 分配新编号并创建 inode
    pub fn create_inode(&mut self, kind: InodeKind) -> InodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.inodes.insert(id, Inode::new(id, kind));
        id
    }

    /// 反序列化时登记 inode,把编号分配器推到已见过的最大编号之后
    pub fn register(&mut self, inode: Inode) {
        if inode.id() >= self.next_id {
            self.next_id = inode.id() + 1;
        }
        self.inodes.insert(inode.id(), inode);
    }

    #[inline]
    pub fn get(&self, id: InodeId) -> Option<&Inode> {
        self.inodes.get(&id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: InodeId) -> Option<&mut Inode> {
        self.inodes.get_mut(&id)
    }

    /// 根 inode 不可删除
    pub fn remove(&mut self, id: InodeId) -> Result<()> {
        if id == ROOT_INODE_ID {
            return Err(FsError::Invalid("cannot remove root inode".into()));
        }
        self.inodes.remove(&id);
        Ok(())
    }

    #[inline]
    pub fn contains(&self, id: InodeId) -> bool {
        self.inodes.contains_key(&id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Inode> {
        self.inodes.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.inodes.clear();
        self.next_id = ROOT_INODE_ID;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_directory_and_unique() {
        let mut table = InodeTable::new();
        table.create_root_inode().unwrap();

        assert!(table.get(ROOT_INODE_ID).unwrap().is_directory());
        assert!(table.create_root_inode().is_err());
    }

    #[test]
    fn ids_are_monotonic() {
        let mut table = InodeTable::new();
        table.create_root_inode().unwrap();

        let a = table.create_inode(InodeKind::File);
        let b = table.create_inode(InodeKind::Directory);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn register_bumps_next_id() {
        let mut table = InodeTable::new();
        table.create_root_inode().unwrap();
        table.register(Inode::new(7, InodeKind::File));

        assert_eq!(table.create_inode(InodeKind::File), 8);
    }

    #[test]
    fn root_cannot_be_removed() {
        let mut table = InodeTable::new();
        table.create_root_inode().unwrap();

        assert!(table.remove(ROOT_INODE_ID).is_err());

        let id = table.create_inode(InodeKind::File);
        table.remove(id).unwrap();
        assert!(!table.contains(id));
    }

    #[test]
    fn allocated_bytes_sums_extents() {
        let mut inode = Inode::new(1, InodeKind::File);
        inode.add_extent(Extent::new(0, 2));
        inode.add_extent(Extent::new(5, 3));

        assert_eq!(inode.allocated_blocks(), 5);
        assert_eq!(inode.allocated_bytes(512), 2560);
    }
}
