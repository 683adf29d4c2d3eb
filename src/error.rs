use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

/// 文件系统操作的全部失败种类,携带出错的路径或描述
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FsError {
    #[error("no such path: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotDirectory(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("{0}")]
    Invalid(String),
    #[error("no space left in container")]
    NoSpace,
    #[error("read-only file system")]
    ReadOnly,
    #[error("file system is closed")]
    Closed,
    #[error("invalid container format: {0}")]
    InvalidFormat(String),
    #[error("host i/o error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// 主要供测试断言错误种类
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, FsError::AlreadyExists(_))
    }

    pub fn is_no_space(&self) -> bool {
        matches!(self, FsError::NoSpace)
    }
}
