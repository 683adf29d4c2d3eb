//! # 目录表
//!
//! 双向索引:正向 `父目录 -> (名字 -> 目录项)` 支持查找与列举,
//! 反向 `子 inode -> 目录项` 支持由子项定位父目录。
//! 两个索引始终同步变更;目录项本身只是普通记录,两个方向都不持有对方。

use std::collections::HashMap;

use crate::error::{FsError, Result};
use crate::layout::inode::InodeId;

/// 条目名的 UTF-8 字节数上限
pub const NAME_MAX_BYTES: usize = 255;

/// 目录项:`(父目录, 名字) -> 子 inode` 的绑定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    parent_id: InodeId,
    name: String,
    child_id: InodeId,
}

impl DirEntry {
    pub fn new(parent_id: InodeId, name: impl Into<String>, child_id: InodeId) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(FsError::Invalid("entry name must not be empty".into()));
        }
        if name.contains('/') {
            return Err(FsError::Invalid(format!(
                "entry name must not contain '/': {name}"
            )));
        }
        if name.len() > NAME_MAX_BYTES {
            return Err(FsError::Invalid(format!(
                "entry name longer than {NAME_MAX_BYTES} bytes: {name}"
            )));
        }

        Ok(Self {
            parent_id,
            name,
            child_id,
        })
    }

    #[inline]
    pub fn parent_id(&self) -> InodeId {
        self.parent_id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn child_id(&self) -> InodeId {
        self.child_id
    }
}

#[derive(Debug, Default)]
pub struct DirectoryTable {
    parent_index: HashMap<InodeId, HashMap<String, DirEntry>>,
    child_index: HashMap<InodeId, DirEntry>,
}

impl DirectoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 调用者需已确认 `(父目录, 名字)` 未被占用
    pub fn add_entry(&mut self, entry: DirEntry) {
        self.child_index.insert(entry.child_id(), entry.clone());
        self.parent_index
            .entry(entry.parent_id())
            .or_default()
            .insert(entry.name().to_owned(), entry);
    }

    pub fn remove_entry(&mut self, parent_id: InodeId, name: &str) -> Option<DirEntry> {
        let children = self.parent_index.get_mut(&parent_id)?;
        let entry = children.remove(name)?;
        if children.is_empty() {
            self.parent_index.remove(&parent_id);
        }
        self.child_index.remove(&entry.child_id());
        Some(entry)
    }

    pub fn lookup(&self, parent_id: InodeId, name: &str) -> Option<InodeId> {
        self.parent_index
            .get(&parent_id)?
            .get(name)
            .map(DirEntry::child_id)
    }

    /// 反向查找:由子 inode 取得它在父目录里的目录项
    pub fn entry_for_child(&self, child_id: InodeId) -> Option<&DirEntry> {
        self.child_index.get(&child_id)
    }

    /// 返回子项快照,与后续变更无关
    pub fn list_children(&self, parent_id: InodeId) -> Vec<DirEntry> {
        self.parent_index
            .get(&parent_id)
            .map(|children| children.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_children(&self, parent_id: InodeId) -> bool {
        self.parent_index
            .get(&parent_id)
            .is_some_and(|children| !children.is_empty())
    }

    pub fn all_entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.child_index.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.child_index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.child_index.is_empty()
    }

    pub fn clear(&mut self) {
        self.parent_index.clear();
        self.child_index.clear();
    }

    /// 同一目录内改名,纯元数据操作
    pub fn rename(&mut self, parent_id: InodeId, old_name: &str, new_name: &str) -> Result<()> {
        if let Some(old) = self.remove_entry(parent_id, old_name) {
            self.add_entry(DirEntry::new(parent_id, new_name, old.child_id())?);
        }
        Ok(())
    }

    /// 迁移到新的 `(父目录, 名字)`,子 inode 不变,不触碰数据
    pub fn relocate(
        &mut self,
        old_parent: InodeId,
        old_name: &str,
        new_parent: InodeId,
        new_name: &str,
    ) -> Result<()> {
        if let Some(old) = self.remove_entry(old_parent, old_name) {
            self.add_entry(DirEntry::new(new_parent, new_name, old.child_id())?);
        }
        Ok(())
    }
}
