//! # 磁盘数据结构层
//!
//! 容器内文件系统的数据结构:超级块、inode 表、目录表,
//! 以及把三者写进元数据区的二进制编码。

pub mod dir_entry;
pub mod inode;
pub mod meta;
pub mod super_block;

pub use self::dir_entry::{DirEntry, DirectoryTable};
pub use self::inode::{Inode, InodeKind, InodeTable};
pub use self::super_block::Superblock;
