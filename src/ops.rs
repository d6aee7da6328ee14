//! Path-based filesystem operation handlers.
//!
//! Every handler here is pure with respect to the FUSE layer: it takes a
//! path, not an inode number, and returns `FsResult<_>`. The bridge in
//! `fuse_adapter.rs` is the only place inode numbers get involved.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::alloc::{self, Bitmaps};
use crate::device::Device;
use crate::disk_format::{DentryRecord, FileTypeRecord};
use crate::error::{FsError, FsResult};
use crate::layout::{Geometry, DATA_PER_FILE, DEFAULT_PERM};
use crate::resolver::{self, Resolved};
use crate::tree::{Inode, Tree};

/// The attributes a `stat` call reports back.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub is_dir: bool,
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub blksize: u32,
    /// Only populated for the root: total data blocks on the device.
    pub st_blocks: Option<u64>,
}

/// Aggregate inode/data block usage, for the FUSE bridge's `statfs`.
#[derive(Debug, Clone, Copy)]
pub struct FsUsage {
    pub total_inodes: u32,
    pub free_inodes: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
}

/// A single directory entry as returned by `readdir`.
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Returns attributes for the entry at `path`, or `NOT_FOUND` on a miss.
pub fn stat(
    tree: &mut Tree,
    device: &mut Device,
    geometry: &Geometry,
    path: &str,
) -> FsResult<Attr> {
    let resolved = resolver::resolve(tree, device, geometry, path)?;
    if !resolved.found {
        return Err(FsError::NotFound);
    }
    attr_for(tree, device, geometry, &resolved)
}

fn attr_for(
    tree: &mut Tree,
    device: &mut Device,
    geometry: &Geometry,
    resolved: &Resolved,
) -> FsResult<Attr> {
    let inode_idx = tree.resolve_inode(resolved.dentry, device, geometry)?;
    let attr = match &tree.inodes[inode_idx] {
        Inode::Directory { dir_cnt, .. } => Attr {
            is_dir: true,
            mode: DEFAULT_PERM,
            size: (*dir_cnt as u64) * std::mem::size_of::<DentryRecord>() as u64,
            nlink: if resolved.is_root { 2 } else { 1 },
            blksize: geometry.blk_sz,
            st_blocks: if resolved.is_root {
                Some(device.size / geometry.blk_sz as u64)
            } else {
                None
            },
        },
        Inode::Regular { size, .. } => Attr {
            is_dir: false,
            mode: DEFAULT_PERM,
            size: *size as u64,
            nlink: 1,
            blksize: geometry.blk_sz,
            st_blocks: None,
        },
    };
    Ok(attr)
}

/// Splits `resolved` (a non-`found` parent-directory result) into the parent
/// dentry index and the leaf name, checked for existing-parent-is-not-a-dir.
fn require_creatable_parent(
    tree: &Tree,
    resolved: &Resolved,
    path: &str,
) -> FsResult<(usize, String)> {
    if resolved.found {
        return Err(FsError::Exists);
    }
    if tree.dentries[resolved.dentry].file_type != FileTypeRecord::Directory {
        return Err(FsError::Unsupported);
    }
    let (_, name) = resolver::split_parent(path);
    Ok((resolved.dentry, name))
}

/// Creates a directory at `path`.
pub fn mkdir(
    tree: &mut Tree,
    bitmaps: &mut Bitmaps,
    device: &mut Device,
    geometry: &Geometry,
    path: &str,
) -> FsResult<()> {
    let resolved = resolver::resolve(tree, device, geometry, path)?;
    let (parent_idx, name) = require_creatable_parent(tree, &resolved, path)?;

    let dentry_idx = alloc::alloc_dentry(tree, parent_idx, &name, FileTypeRecord::Directory, 0);
    alloc::alloc_inode(tree, bitmaps, dentry_idx, FileTypeRecord::Directory, geometry.blk_sz)?;
    Ok(())
}

/// Creates a node (regular file or directory, per `is_dir`) at `path`.
pub fn mknod(
    tree: &mut Tree,
    bitmaps: &mut Bitmaps,
    device: &mut Device,
    geometry: &Geometry,
    path: &str,
    is_dir: bool,
) -> FsResult<()> {
    let resolved = resolver::resolve(tree, device, geometry, path)?;
    let (parent_idx, name) = require_creatable_parent(tree, &resolved, path)?;

    let file_type = if is_dir {
        FileTypeRecord::Directory
    } else {
        FileTypeRecord::Regular
    };
    let dentry_idx = alloc::alloc_dentry(tree, parent_idx, &name, file_type, 0);
    alloc::alloc_inode(tree, bitmaps, dentry_idx, file_type, geometry.blk_sz)?;
    Ok(())
}

/// Returns the `index`-th child of the directory at `path`, if any.
pub fn readdir(
    tree: &mut Tree,
    device: &mut Device,
    geometry: &Geometry,
    path: &str,
    index: usize,
) -> FsResult<Option<DirEntry>> {
    let resolved = resolver::resolve(tree, device, geometry, path)?;
    if !resolved.found {
        return Err(FsError::NotFound);
    }
    tree.resolve_inode(resolved.dentry, device, geometry)?;
    if tree.dentries[resolved.dentry].file_type != FileTypeRecord::Directory {
        return Err(FsError::Unsupported);
    }
    let children = &tree.dentries[resolved.dentry].children;
    match children.get(index) {
        Some(&child_idx) => {
            let d = &tree.dentries[child_idx];
            Ok(Some(DirEntry {
                name: d.name.clone(),
                is_dir: d.file_type == FileTypeRecord::Directory,
            }))
        }
        None => Ok(None),
    }
}

/// Maps an absolute byte range within a file's `DATA_PER_FILE` owned blocks
/// to `(block_index, offset_in_block, len_in_block)` triples.
fn block_ranges(offset: u64, len: u64, blk_sz: u64) -> FsResult<Vec<(usize, usize, usize)>> {
    let mut out = Vec::new();
    let mut remaining = len;
    let mut pos = offset;
    while remaining > 0 {
        let block_index = (pos / blk_sz) as usize;
        if block_index >= DATA_PER_FILE {
            return Err(FsError::NoSpace);
        }
        let offset_in_block = (pos % blk_sz) as usize;
        let chunk = (blk_sz - offset_in_block as u64).min(remaining) as usize;
        out.push((block_index, offset_in_block, chunk));
        pos += chunk as u64;
        remaining -= chunk as u64;
    }
    Ok(out)
}

/// Reads `size` bytes from `path` starting at `offset`.
pub fn read(
    tree: &mut Tree,
    device: &mut Device,
    geometry: &Geometry,
    path: &str,
    offset: u64,
    size: u64,
) -> FsResult<Vec<u8>> {
    let resolved = resolver::resolve(tree, device, geometry, path)?;
    if !resolved.found {
        return Err(FsError::NotFound);
    }
    let inode_idx = tree.resolve_inode(resolved.dentry, device, geometry)?;
    let (file_size, blocks) = match &tree.inodes[inode_idx] {
        Inode::Directory { .. } => return Err(FsError::IsDir),
        Inode::Regular { size, blocks, .. } => (*size as u64, blocks),
    };
    if offset > file_size {
        return Err(FsError::Seek);
    }
    let readable = size.min(file_size.saturating_sub(offset));
    let mut out = Vec::with_capacity(readable as usize);
    for (block_index, offset_in_block, chunk) in
        block_ranges(offset, readable, geometry.blk_sz as u64)?
    {
        out.extend_from_slice(&blocks[block_index][offset_in_block..offset_in_block + chunk]);
    }
    Ok(out)
}

/// Writes `buf` into `path` starting at `offset`, growing the inode's
/// recorded size as needed and capping the write at the file's fixed
/// block budget.
pub fn write(
    tree: &mut Tree,
    device: &mut Device,
    geometry: &Geometry,
    path: &str,
    offset: u64,
    buf: &[u8],
) -> FsResult<u64> {
    let resolved = resolver::resolve(tree, device, geometry, path)?;
    if !resolved.found {
        return Err(FsError::NotFound);
    }
    let inode_idx = tree.resolve_inode(resolved.dentry, device, geometry)?;
    if matches!(tree.inodes[inode_idx], Inode::Directory { .. }) {
        return Err(FsError::IsDir);
    }

    let budget = DATA_PER_FILE as u64 * geometry.blk_sz as u64;
    if offset >= budget {
        return Err(FsError::NoSpace);
    }
    let writable_len = buf.len().min((budget - offset) as usize) as u64;
    let ranges = block_ranges(offset, writable_len, geometry.blk_sz as u64)?;

    let Inode::Regular { size, blocks, .. } = &mut tree.inodes[inode_idx] else {
        unreachable!("directory case returned above");
    };
    let mut written = 0usize;
    for (block_index, offset_in_block, chunk) in ranges {
        blocks[block_index][offset_in_block..offset_in_block + chunk]
            .copy_from_slice(&buf[written..written + chunk]);
        written += chunk;
    }
    *size = (*size).max((offset + written as u64) as u32);
    Ok(written as u64)
}

/// Sets `path`'s recorded size to `new_size`. Grown bytes read as zero
/// (buffers are always zero-initialized and never sparse); shrunk bytes
/// beyond the new size are zeroed in their last retained block.
pub fn truncate(
    tree: &mut Tree,
    device: &mut Device,
    geometry: &Geometry,
    path: &str,
    new_size: u64,
) -> FsResult<()> {
    let resolved = resolver::resolve(tree, device, geometry, path)?;
    if !resolved.found {
        return Err(FsError::NotFound);
    }
    let inode_idx = tree.resolve_inode(resolved.dentry, device, geometry)?;
    let Inode::Regular { size, blocks, .. } = &mut tree.inodes[inode_idx] else {
        return Err(FsError::IsDir);
    };
    let blk_sz = geometry.blk_sz as u64;
    if new_size < *size as u64 {
        for (block_index, offset_in_block, chunk) in
            block_ranges(new_size, (*size as u64) - new_size, blk_sz)?
        {
            blocks[block_index][offset_in_block..offset_in_block + chunk].fill(0);
        }
    }
    *size = new_size as u32;
    Ok(())
}

/// `utimens`: a no-op, since attribute times are always derived from the
/// wall clock at `stat` time rather than persisted.
pub fn utimens(
    tree: &mut Tree,
    device: &mut Device,
    geometry: &Geometry,
    path: &str,
) -> FsResult<()> {
    let resolved = resolver::resolve(tree, device, geometry, path)?;
    if !resolved.found {
        return Err(FsError::NotFound);
    }
    Ok(())
}

/// `access`: R/W/X are always permitted once resolved; `F_OK` alone checks
/// resolution.
///
/// `mask` is a `libc::F_OK`/`R_OK`/`W_OK`/`X_OK` value (or bitwise-or of the
/// latter three). `F_OK` alone checks only that `path` resolves; this
/// filesystem grants every resolved path read, write and execute access, so
/// the other bits never add a further check.
pub fn access(
    tree: &mut Tree,
    device: &mut Device,
    geometry: &Geometry,
    path: &str,
    mask: i32,
) -> FsResult<()> {
    let resolved = resolver::resolve(tree, device, geometry, path)?;
    if mask == libc::F_OK {
        return if resolved.found {
            Ok(())
        } else {
            Err(FsError::NotFound)
        };
    }

    if !resolved.found {
        return Err(FsError::NotFound);
    }
    Ok(())
}

/// Returns the current timestamp, used by `stat`'s a/m-time fields (not
/// persisted, per `utimens`'s no-op).
pub fn current_time() -> u64 {
    now_secs()
}

/// Aggregate bitmap usage for `statfs`.
pub fn usage(bitmaps: &Bitmaps, geometry: &Geometry) -> FsUsage {
    let total_inodes = crate::layout::MAX_INODES;
    let total_blocks = crate::layout::MAX_DATA_BLOCKS;
    let free_inodes = total_inodes - (0..total_inodes).filter(|&k| bitmaps.inode.test(k)).count() as u32;
    let free_blocks = total_blocks - (0..total_blocks).filter(|&k| bitmaps.data.test(k)).count() as u32;
    let _ = geometry;
    FsUsage {
        total_inodes,
        free_inodes,
        total_blocks,
        free_blocks,
    }
}

/// Inert stub: this filesystem never removes entries.
pub fn unlink() -> FsResult<()> {
    Err(FsError::Unsupported)
}

/// Inert stub: this filesystem never removes entries.
pub fn rmdir() -> FsResult<()> {
    Err(FsError::Unsupported)
}

/// Inert stub: renaming is not implemented.
pub fn rename() -> FsResult<()> {
    Err(FsError::Unsupported)
}

/// Inert stub: `open`/`opendir` always succeed, since there is no
/// per-handle state beyond the resolved path itself.
pub fn open() -> FsResult<()> {
    Ok(())
}

/// Inert stub, see [`open`].
pub fn opendir() -> FsResult<()> {
    Ok(())
}

/// Inert stub: symlinks are not part of this filesystem.
pub fn readlink() -> FsResult<()> {
    Err(FsError::Unsupported)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::Geometry;
    use crate::tree::Tree;

    fn make_device(size: u64) -> (tempfile::NamedTempFile, Device) {
        let f = tempfile::NamedTempFile::new().unwrap();
        f.as_file().set_len(size).unwrap();
        let dev = Device::open(f.path()).unwrap();
        (f, dev)
    }

    fn fresh() -> (tempfile::NamedTempFile, Device, Geometry, Tree, Bitmaps) {
        let (tmp, mut device) = make_device(4 * 1024 * 1024);
        let geometry = Geometry::default_for(device.io_sz);
        let mut tree = Tree::new_with_root();
        let mut bitmaps = Bitmaps::new(geometry.blk_sz);
        let root = tree.root;
        alloc::alloc_inode(
            &mut tree,
            &mut bitmaps,
            root,
            FileTypeRecord::Directory,
            geometry.blk_sz,
        )
        .unwrap();
        let _ = &mut device;
        (tmp, device, geometry, tree, bitmaps)
    }

    #[test]
    fn stat_root_reports_directory() {
        let (_tmp, mut device, geometry, mut tree, _bitmaps) = fresh();
        let attr = stat(&mut tree, &mut device, &geometry, "/").unwrap();
        assert!(attr.is_dir);
        assert_eq!(attr.nlink, 2);
        // fresh() backs the device with a 4 MiB file; st_blocks must reflect
        // that real size, not the fixed MAX_DATA_BLOCKS capacity.
        assert_eq!(attr.st_blocks, Some(device.size / geometry.blk_sz as u64));
        assert_eq!(attr.st_blocks, Some(4096));
    }

    #[test]
    fn stat_root_st_blocks_tracks_backing_file_size_not_capacity() {
        let (_tmp, mut device, geometry, mut tree, _bitmaps) = {
            let (tmp, mut device) = make_device(8 * 1024 * 1024);
            let geometry = Geometry::default_for(device.io_sz);
            let mut tree = Tree::new_with_root();
            let mut bitmaps = Bitmaps::new(geometry.blk_sz);
            let root = tree.root;
            alloc::alloc_inode(
                &mut tree,
                &mut bitmaps,
                root,
                FileTypeRecord::Directory,
                geometry.blk_sz,
            )
            .unwrap();
            let _ = &mut device;
            (tmp, device, geometry, tree, bitmaps)
        };
        let attr = stat(&mut tree, &mut device, &geometry, "/").unwrap();
        let expected = device.size / geometry.blk_sz as u64;
        assert_eq!(attr.st_blocks, Some(expected));
        assert_ne!(
            attr.st_blocks,
            Some(crate::layout::MAX_DATA_BLOCKS as u64),
            "st_blocks must not equal the theoretical max capacity"
        );
    }

    #[test]
    fn mkdir_then_stat_then_duplicate_fails() {
        let (_tmp, mut device, geometry, mut tree, mut bitmaps) = fresh();
        mkdir(&mut tree, &mut bitmaps, &mut device, &geometry, "/a").unwrap();
        let attr = stat(&mut tree, &mut device, &geometry, "/a").unwrap();
        assert!(attr.is_dir);
        assert_eq!(attr.size, 0);

        let err = mkdir(&mut tree, &mut bitmaps, &mut device, &geometry, "/a").unwrap_err();
        assert!(matches!(err, FsError::Exists));
    }

    #[test]
    fn mknod_write_read_roundtrip() {
        let (_tmp, mut device, geometry, mut tree, mut bitmaps) = fresh();
        mkdir(&mut tree, &mut bitmaps, &mut device, &geometry, "/a").unwrap();
        mknod(
            &mut tree,
            &mut bitmaps,
            &mut device,
            &geometry,
            "/a/f",
            false,
        )
        .unwrap();
        write(&mut tree, &mut device, &geometry, "/a/f", 0, b"hello").unwrap();
        let data = read(&mut tree, &mut device, &geometry, "/a/f", 0, 5).unwrap();
        assert_eq!(&data, b"hello");
        let attr = stat(&mut tree, &mut device, &geometry, "/a/f").unwrap();
        assert_eq!(attr.size, 5);
    }

    #[test]
    fn write_across_block_boundary() {
        let (_tmp, mut device, geometry, mut tree, mut bitmaps) = fresh();
        mknod(&mut tree, &mut bitmaps, &mut device, &geometry, "/f", false).unwrap();
        let blk_sz = geometry.blk_sz as u64;
        write(&mut tree, &mut device, &geometry, "/f", 0, b"hello").unwrap();
        write(&mut tree, &mut device, &geometry, "/f", blk_sz, b"X").unwrap();
        let attr = stat(&mut tree, &mut device, &geometry, "/f").unwrap();
        assert_eq!(attr.size, blk_sz + 1);
        let data = read(&mut tree, &mut device, &geometry, "/f", blk_sz, 1).unwrap();
        assert_eq!(&data, b"X");
    }

    #[test]
    fn read_on_directory_is_isdir() {
        let (_tmp, mut device, geometry, mut tree, mut bitmaps) = fresh();
        mkdir(&mut tree, &mut bitmaps, &mut device, &geometry, "/a").unwrap();
        let err = read(&mut tree, &mut device, &geometry, "/a", 0, 1).unwrap_err();
        assert!(matches!(err, FsError::IsDir));
    }

    #[test]
    fn write_beyond_budget_is_refused() {
        let (_tmp, mut device, geometry, mut tree, mut bitmaps) = fresh();
        mknod(&mut tree, &mut bitmaps, &mut device, &geometry, "/f", false).unwrap();
        let budget = DATA_PER_FILE as u64 * geometry.blk_sz as u64;
        let err = write(&mut tree, &mut device, &geometry, "/f", budget, b"x").unwrap_err();
        assert!(matches!(err, FsError::NoSpace));
    }

    #[test]
    fn access_f_ok_requires_existence() {
        let (_tmp, mut device, geometry, mut tree, mut bitmaps) = fresh();
        mknod(&mut tree, &mut bitmaps, &mut device, &geometry, "/f", false).unwrap();
        access(&mut tree, &mut device, &geometry, "/f", libc::F_OK).unwrap();
        let err = access(&mut tree, &mut device, &geometry, "/missing", libc::F_OK).unwrap_err();
        assert!(matches!(err, FsError::NotFound));
    }

    #[test]
    fn access_rwx_always_granted_once_resolved() {
        let (_tmp, mut device, geometry, mut tree, mut bitmaps) = fresh();
        mknod(&mut tree, &mut bitmaps, &mut device, &geometry, "/f", false).unwrap();
        access(&mut tree, &mut device, &geometry, "/f", libc::R_OK).unwrap();
        access(&mut tree, &mut device, &geometry, "/f", libc::W_OK).unwrap();
        access(&mut tree, &mut device, &geometry, "/f", libc::X_OK).unwrap();
        access(
            &mut tree,
            &mut device,
            &geometry,
            "/f",
            libc::R_OK | libc::W_OK,
        )
        .unwrap();
        let err =
            access(&mut tree, &mut device, &geometry, "/missing", libc::R_OK).unwrap_err();
        assert!(matches!(err, FsError::NotFound));
    }
}
