//! Inode and data block allocation.

use crate::disk_format::FileTypeRecord;
use crate::error::{FsError, FsResult};
use crate::layout::{Bitmap, DATA_PER_FILE, MAX_DATA_BLOCKS, MAX_INODES};
use crate::tree::{Inode, Tree};

/// The two live allocation bitmaps, held above the codec layer.
pub struct Bitmaps {
    pub inode: Bitmap,
    pub data: Bitmap,
}

impl Bitmaps {
    pub fn new(blk_sz: u32) -> Self {
        Self {
            inode: Bitmap::new(MAX_INODES, blk_sz),
            data: Bitmap::new(MAX_DATA_BLOCKS, blk_sz),
        }
    }
}

/// Allocates a fresh inode of `file_type`, binds it to `dentry_idx`, and
/// gives it `DATA_PER_FILE` freshly allocated data blocks.
///
/// On failure to find enough data blocks, the inode bit claimed in step 1
/// is rolled back too, so no partial allocation survives a `NO_SPACE`
/// error (resolving the reference implementation's rollback open
/// question in favor of always leaving the bitmaps consistent).
pub fn alloc_inode(
    tree: &mut Tree,
    bitmaps: &mut Bitmaps,
    dentry_idx: usize,
    file_type: FileTypeRecord,
    blk_sz: u32,
) -> FsResult<usize> {
    let ino = bitmaps.inode.find_first_zero().ok_or(FsError::NoSpace)?;
    bitmaps.inode.set(ino);

    let blocks_result = (|| -> FsResult<[u32; DATA_PER_FILE]> {
        let mut claimed = Vec::with_capacity(DATA_PER_FILE);
        for _ in 0..DATA_PER_FILE {
            match bitmaps.data.find_first_zero() {
                Some(bit) => {
                    bitmaps.data.set(bit);
                    claimed.push(bit);
                }
                None => {
                    for &bit in &claimed {
                        bitmaps.data.clear(bit);
                    }
                    return Err(FsError::NoSpace);
                }
            }
        }
        let mut out = [0u32; DATA_PER_FILE];
        out.copy_from_slice(&claimed);
        Ok(out)
    })();

    let blocknum = match blocks_result {
        Ok(b) => b,
        Err(e) => {
            bitmaps.inode.clear(ino);
            return Err(e);
        }
    };

    let inode = match file_type {
        FileTypeRecord::Directory => Inode::Directory {
            ino,
            dir_cnt: 0,
            blocknum,
        },
        FileTypeRecord::Regular => Inode::Regular {
            ino,
            size: 0,
            blocknum,
            blocks: vec![vec![0u8; blk_sz as usize]; DATA_PER_FILE],
        },
    };
    let inode_idx = tree.bind_inode(inode);
    tree.dentries[dentry_idx].inode = Some(inode_idx);
    tree.dentries[dentry_idx].ino = ino;
    Ok(inode_idx)
}

/// Splices a new dentry under `parent_idx` and increments the parent
/// directory's `dir_cnt`.
pub fn alloc_dentry(
    tree: &mut Tree,
    parent_idx: usize,
    name: &str,
    file_type: FileTypeRecord,
    ino: u32,
) -> usize {
    let dentry_idx = tree.alloc_dentry(parent_idx, name, file_type, ino);
    if let Some(parent_inode_idx) = tree.dentries[parent_idx].inode {
        tree.increment_dir_cnt(parent_inode_idx);
    }
    dentry_idx
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::Tree;

    #[test]
    fn alloc_inode_claims_bits() {
        let mut tree = Tree::new_with_root();
        let mut bitmaps = Bitmaps::new(1024);
        let root = tree.root;
        let idx = alloc_inode(&mut tree, &mut bitmaps, root, FileTypeRecord::Directory, 1024)
            .unwrap();
        assert!(bitmaps.inode.test(tree.inodes[idx].ino()));
        if let Inode::Directory { blocknum, .. } = &tree.inodes[idx] {
            for &b in blocknum {
                assert!(bitmaps.data.test(b));
            }
        } else {
            panic!("expected directory");
        }
    }

    #[test]
    fn alloc_dentry_bumps_dir_cnt() {
        let mut tree = Tree::new_with_root();
        let mut bitmaps = Bitmaps::new(1024);
        let root = tree.root;
        alloc_inode(&mut tree, &mut bitmaps, root, FileTypeRecord::Directory, 1024).unwrap();
        let child_ino = {
            let idx =
                alloc_inode(&mut tree, &mut bitmaps, root, FileTypeRecord::Regular, 1024)
                    .unwrap();
            tree.inodes[idx].ino()
        };
        let root_inode_idx = tree.dentries[root].inode.unwrap();
        let before = match &tree.inodes[root_inode_idx] {
            Inode::Directory { dir_cnt, .. } => *dir_cnt,
            _ => unreachable!(),
        };
        alloc_dentry(&mut tree, root, "f", FileTypeRecord::Regular, child_ino);
        let after = match &tree.inodes[root_inode_idx] {
            Inode::Directory { dir_cnt, .. } => *dir_cnt,
            _ => unreachable!(),
        };
        assert_eq!(after, before + 1);
    }
}
