//! # box-fs
//!
//! 单容器文件系统:超级块、元数据索引与文件数据全部存放在宿主机的
//! 一个普通文件里,自上而下分为:
//!
//! - 文件系统核心层:路径解析、目录操作、区段级读写与元数据持久化
//! - 空间管理层:统一管理用户数据与元数据自身占用的空闲块
//! - 磁盘数据结构层:超级块、inode 表、目录表及其二进制编码
//! - 容器 I/O 层:对宿主文件的定位读写
//!
//! 所有内存状态由文件系统核心持有的一把读写锁保护;
//! 落盘只在 `sync` 或 `close` 时发生。

mod channel;
mod container;
mod error;
mod extent;
mod fs;
mod layout;
mod matcher;
mod path;
mod space;

pub use enumflags2::BitFlags;

pub use self::channel::{FileChannel, OpenFlag};
pub use self::error::{FsError, Result};
pub use self::extent::Extent;
pub use self::fs::{BoxFileSystem, CopyFlag, MountOptions, Stat};
pub use self::layout::inode::{InodeId, InodeKind, ROOT_INODE_ID};
pub use self::matcher::PathMatcher;

/// 魔数,即 ASCII 的 "BOXF"
pub const MAGIC: u32 = 0x424F_5846;
/// 容器格式版本
pub const VERSION: u32 = 1;
/// 块大小下限
pub const MIN_BLOCK_SIZE: u32 = 512;
/// 新建容器的默认块大小
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
/// 新建容器的默认块数
pub const DEFAULT_TOTAL_BLOCKS: u64 = 256;
