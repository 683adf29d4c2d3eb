//! # 元数据区编码
//!
//! 把 inode 表、目录表与空闲区段链顺序写成一段自描述的字节流,
//! 大端序,布局逐字节固定:
//!
//! ```text
//! [u32 inodeCount]
//!   每个 inode: [u64 id][u8 type][u64 size][i64 created][i64 modified][i64 accessed]
//!               [u32 extentCount] 后接 extentCount 个 [u64 start][u32 count]
//! [u32 dirEntryCount]
//!   每条目录项: [u64 parentId][u64 childId][u16 nameLen][nameLen 字节 UTF-8]
//! [u32 freeExtentCount]
//!   每个区段:   [u64 start][u32 count]
//! ```
//!
//! 反序列化先清空目标表,再按 inode、目录项、空闲区段的次序填入;
//! 时间戳全零的旧容器同样可读。

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{FsError, Result};
use crate::extent::Extent;
use crate::layout::dir_entry::{DirEntry, DirectoryTable};
use crate::layout::inode::{Inode, InodeKind, InodeTable};
use crate::space::SpaceManager;

pub fn serialize(
    inodes: &InodeTable,
    directory: &DirectoryTable,
    space: &SpaceManager,
) -> Vec<u8> {
    let mut buf = Vec::new();

    buf.write_u32::<BigEndian>(inodes.len() as u32).unwrap();
    for inode in inodes.all() {
        write_inode(&mut buf, inode);
    }

    buf.write_u32::<BigEndian>(directory.len() as u32).unwrap();
    for entry in directory.all_entries() {
        write_dir_entry(&mut buf, entry);
    }

    let free = space.free_extents();
    buf.write_u32::<BigEndian>(free.len() as u32).unwrap();
    for extent in free {
        write_extent(&mut buf, extent);
    }

    buf
}

pub fn deserialize(
    data: &[u8],
    inodes: &mut InodeTable,
    directory: &mut DirectoryTable,
    space: &mut SpaceManager,
) -> Result<()> {
    let mut cursor = Cursor::new(data);

    inodes.clear();
    directory.clear();

    let inode_count = read_u32(&mut cursor)?;
    for _ in 0..inode_count {
        inodes.register(read_inode(&mut cursor)?);
    }

    let entry_count = read_u32(&mut cursor)?;
    for _ in 0..entry_count {
        directory.add_entry(read_dir_entry(&mut cursor)?);
    }

    let free_count = read_u32(&mut cursor)?;
    let mut free = Vec::with_capacity(free_count as usize);
    for _ in 0..free_count {
        free.push(read_extent(&mut cursor)?);
    }
    space.set_free_extents(free);

    Ok(())
}

fn write_inode(buf: &mut Vec<u8>, inode: &Inode) {
    buf.write_u64::<BigEndian>(inode.id()).unwrap();
    buf.write_u8(inode.kind().code()).unwrap();
    buf.write_u64::<BigEndian>(inode.size()).unwrap();
    buf.write_i64::<BigEndian>(inode.created_ms()).unwrap();
    buf.write_i64::<BigEndian>(inode.modified_ms()).unwrap();
    buf.write_i64::<BigEndian>(inode.accessed_ms()).unwrap();

    buf.write_u32::<BigEndian>(inode.extents().len() as u32)
        .unwrap();
    for extent in inode.extents() {
        write_extent(buf, extent);
    }
}

fn read_inode(cursor: &mut Cursor<&[u8]>) -> Result<Inode> {
    let id = read_u64(cursor)?;
    let kind = InodeKind::from_code(read_u8(cursor)?)?;
    let size = read_u64(cursor)?;
    let created_ms = read_i64(cursor)?;
    let modified_ms = read_i64(cursor)?;
    let accessed_ms = read_i64(cursor)?;

    let extent_count = read_u32(cursor)?;
    let mut extents = Vec::with_capacity(extent_count as usize);
    for _ in 0..extent_count {
        extents.push(read_extent(cursor)?);
    }

    Ok(Inode::from_parts(
        id,
        kind,
        size,
        extents,
        created_ms,
        modified_ms,
        accessed_ms,
    ))
}

fn write_dir_entry(buf: &mut Vec<u8>, entry: &DirEntry) {
    buf.write_u64::<BigEndian>(entry.parent_id()).unwrap();
    buf.write_u64::<BigEndian>(entry.child_id()).unwrap();

    let name = entry.name().as_bytes();
    buf.write_u16::<BigEndian>(name.len() as u16).unwrap();
    buf.extend_from_slice(name);
}

fn read_dir_entry(cursor: &mut Cursor<&[u8]>) -> Result<DirEntry> {
    let parent_id = read_u64(cursor)?;
    let child_id = read_u64(cursor)?;

    let name_len = read_u16(cursor)? as usize;
    let mut name = vec![0u8; name_len];
    cursor
        .read_exact(&mut name)
        .map_err(|_| truncated("entry name"))?;
    let name =
        String::from_utf8(name).map_err(|_| FsError::InvalidFormat("entry name is not UTF-8".into()))?;

    DirEntry::new(parent_id, name, child_id).map_err(|e| FsError::InvalidFormat(e.to_string()))
}

fn write_extent(buf: &mut Vec<u8>, extent: &Extent) {
    buf.write_u64::<BigEndian>(extent.start_block()).unwrap();
    buf.write_u32::<BigEndian>(extent.block_count()).unwrap();
}

fn read_extent(cursor: &mut Cursor<&[u8]>) -> Result<Extent> {
    let start_block = read_u64(cursor)?;
    let block_count = read_u32(cursor)?;
    if block_count == 0 {
        return Err(FsError::InvalidFormat("extent with zero blocks".into()));
    }
    Ok(Extent::new(start_block, block_count))
}

fn truncated(what: &str) -> FsError {
    FsError::InvalidFormat(format!("metadata region truncated at {what}"))
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    cursor.read_u8().map_err(|_| truncated("u8"))
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    cursor.read_u16::<BigEndian>().map_err(|_| truncated("u16"))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    cursor.read_u32::<BigEndian>().map_err(|_| truncated("u32"))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    cursor.read_u64::<BigEndian>().map_err(|_| truncated("u64"))
}

fn read_i64(cursor: &mut Cursor<&[u8]>) -> Result<i64> {
    cursor.read_i64::<BigEndian>().map_err(|_| truncated("i64"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::inode::ROOT_INODE_ID;

    fn sample_tables() -> (InodeTable, DirectoryTable, SpaceManager) {
        let mut inodes = InodeTable::new();
        inodes.create_root_inode().unwrap();
        let file = inodes.create_inode(InodeKind::File);
        let dir = inodes.create_inode(InodeKind::Directory);
        {
            let inode = inodes.get_mut(file).unwrap();
            inode.set_size(1234);
            inode.set_extents(vec![Extent::new(2, 1), Extent::new(7, 3)]);
        }

        let mut directory = DirectoryTable::new();
        directory.add_entry(DirEntry::new(ROOT_INODE_ID, "file.bin", file).unwrap());
        directory.add_entry(DirEntry::new(ROOT_INODE_ID, "目录", dir).unwrap());

        let mut space = SpaceManager::new(32);
        space.set_free_extents(vec![Extent::new(10, 6), Extent::new(20, 12)]);

        (inodes, directory, space)
    }

    #[test]
    fn round_trip_preserves_tables() {
        let (inodes, directory, space) = sample_tables();
        let bytes = serialize(&inodes, &directory, &space);

        let mut inodes2 = InodeTable::new();
        let mut directory2 = DirectoryTable::new();
        let mut space2 = SpaceManager::new(32);
        deserialize(&bytes, &mut inodes2, &mut directory2, &mut space2).unwrap();

        assert_eq!(inodes2.len(), inodes.len());
        let file = directory2.lookup(ROOT_INODE_ID, "file.bin").unwrap();
        let inode = inodes2.get(file).unwrap();
        assert_eq!(inode.size(), 1234);
        assert_eq!(inode.extents(), &[Extent::new(2, 1), Extent::new(7, 3)]);

        let dir = directory2.lookup(ROOT_INODE_ID, "目录").unwrap();
        assert!(inodes2.get(dir).unwrap().is_directory());

        assert_eq!(space2.free_extents(), space.free_extents());
    }

    #[test]
    fn deserialize_clears_previous_state() {
        let (inodes, directory, space) = sample_tables();
        let bytes = serialize(&inodes, &directory, &space);

        let mut inodes2 = InodeTable::new();
        inodes2.create_root_inode().unwrap();
        inodes2.create_inode(InodeKind::File);
        let mut directory2 = DirectoryTable::new();
        directory2.add_entry(DirEntry::new(ROOT_INODE_ID, "stale", 1).unwrap());
        let mut space2 = SpaceManager::new(32);

        deserialize(&bytes, &mut inodes2, &mut directory2, &mut space2).unwrap();

        assert_eq!(inodes2.len(), 3);
        assert_eq!(directory2.lookup(ROOT_INODE_ID, "stale"), None);
    }

    #[test]
    fn id_generator_survives_round_trip() {
        let (inodes, directory, space) = sample_tables();
        let bytes = serialize(&inodes, &directory, &space);

        let mut inodes2 = InodeTable::new();
        let mut directory2 = DirectoryTable::new();
        let mut space2 = SpaceManager::new(32);
        deserialize(&bytes, &mut inodes2, &mut directory2, &mut space2).unwrap();

        // 新编号必须越过磁盘上已有的最大编号
        assert_eq!(inodes2.create_inode(InodeKind::File), 3);
    }

    #[test]
    fn short_input_fails() {
        let (inodes, directory, space) = sample_tables();
        let bytes = serialize(&inodes, &directory, &space);

        let mut inodes2 = InodeTable::new();
        let mut directory2 = DirectoryTable::new();
        let mut space2 = SpaceManager::new(32);
        let err = deserialize(
            &bytes[..bytes.len() - 3],
            &mut inodes2,
            &mut directory2,
            &mut space2,
        )
        .unwrap_err();
        assert!(matches!(err, FsError::InvalidFormat(_)));
    }

    #[test]
    fn unknown_type_code_fails() {
        let (inodes, directory, space) = sample_tables();
        let mut bytes = serialize(&inodes, &directory, &space);
        // 第一个 inode 的类型码位于 count(4) + id(8) 之后
        bytes[12] = 9;

        let mut inodes2 = InodeTable::new();
        let mut directory2 = DirectoryTable::new();
        let mut space2 = SpaceManager::new(32);
        let err = deserialize(&bytes, &mut inodes2, &mut directory2, &mut space2).unwrap_err();
        assert!(matches!(err, FsError::InvalidFormat(_)));
    }

    #[test]
    fn zero_timestamps_are_accepted() {
        let mut inodes = InodeTable::new();
        inodes.register(Inode::from_parts(
            ROOT_INODE_ID,
            InodeKind::Directory,
            0,
            Vec::new(),
            0,
            0,
            0,
        ));
        let directory = DirectoryTable::new();
        let mut space = SpaceManager::new(8);
        space.initialize_new(0);

        let bytes = serialize(&inodes, &directory, &space);

        let mut inodes2 = InodeTable::new();
        let mut directory2 = DirectoryTable::new();
        let mut space2 = SpaceManager::new(8);
        deserialize(&bytes, &mut inodes2, &mut directory2, &mut space2).unwrap();

        let root = inodes2.get(ROOT_INODE_ID).unwrap();
        assert_eq!(root.created_ms(), 0);
        assert_eq!(root.modified_ms(), 0);
    }
}
