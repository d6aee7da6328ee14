//! Mount and unmount: opening the backing device, formatting it on first
//! use, and flushing the in-memory tree back to disk on unmount.

use std::path::Path;

use log::{debug, info};

use crate::alloc::Bitmaps;
use crate::device::Device;
use crate::disk_format::{FileTypeRecord, SuperblockRecord};
use crate::error::FsResult;
use crate::layout::{Geometry, MAGIC};
use crate::tree::{Inode, Tree};

/// A mounted filesystem: the open device, its geometry, the live bitmaps
/// and the in-memory inode/dentry tree.
pub struct Fs {
    pub device: Device,
    pub geometry: Geometry,
    pub bitmaps: Bitmaps,
    pub tree: Tree,
}

impl Fs {
    /// Opens the device at `path`, formatting it if its superblock's magic
    /// does not match, or loading the existing layout and lazily resolving
    /// the root otherwise.
    pub fn mount(path: &Path) -> FsResult<Self> {
        let mut device = Device::open(path)?;
        let geometry = Geometry::default_for(device.io_sz);

        let mut sb_buf = vec![0u8; std::mem::size_of::<SuperblockRecord>()];
        device.read(0, &mut sb_buf)?;
        let sb = SuperblockRecord::from_disk(&sb_buf);

        if { sb.magic } == MAGIC {
            info!("mounting existing filesystem at {}", path.display());
            Self::mount_existing(device, geometry, &sb)
        } else {
            info!("formatting new filesystem at {}", path.display());
            Self::format(device, geometry)
        }
    }

    fn mount_existing(
        mut device: Device,
        geometry: Geometry,
        sb: &SuperblockRecord,
    ) -> FsResult<Self> {
        let geometry = sb.geometry(geometry.io_sz);
        let mut inode_buf = vec![0u8; geometry.blk_sz as usize];
        device.read(geometry.map_inode_offset, &mut inode_buf)?;
        let inode_bitmap = crate::layout::Bitmap::from_bytes(inode_buf, crate::layout::MAX_INODES);

        let mut data_buf = vec![0u8; geometry.blk_sz as usize];
        device.read(geometry.map_data_offset, &mut data_buf)?;
        let data_bitmap =
            crate::layout::Bitmap::from_bytes(data_buf, crate::layout::MAX_DATA_BLOCKS);

        let bitmaps = Bitmaps {
            inode: inode_bitmap,
            data: data_bitmap,
        };
        let mut tree = Tree::new_with_root();
        tree.dentries[tree.root].ino = crate::layout::ROOT_INO;

        Ok(Self {
            device,
            geometry,
            bitmaps,
            tree,
        })
    }

    fn format(mut device: Device, geometry: Geometry) -> FsResult<Self> {
        let mut bitmaps = Bitmaps::new(geometry.blk_sz);
        let mut tree = Tree::new_with_root();
        let root = tree.root;

        let inode_idx = crate::alloc::alloc_inode(
            &mut tree,
            &mut bitmaps,
            root,
            FileTypeRecord::Directory,
            geometry.blk_sz,
        )?;
        debug!("formatted root inode at index {inode_idx}");

        let mut fs = Self {
            device,
            geometry,
            bitmaps,
            tree,
        };
        fs.flush_metadata()?;
        let root = fs.tree.root;
        fs.tree.write_back(root, &mut fs.device, &fs.geometry)?;
        Ok(fs)
    }

    /// Writes the superblock and both bitmaps back to their dedicated
    /// blocks.
    fn flush_metadata(&mut self) -> FsResult<()> {
        let usage = self.bitmaps_usage_bytes();
        let sb = SuperblockRecord::to_disk(&self.geometry, usage);
        self.device.write(0, sb.as_bytes())?;
        self.device
            .write(self.geometry.map_inode_offset, self.bitmaps.inode.as_bytes())?;
        self.device
            .write(self.geometry.map_data_offset, self.bitmaps.data.as_bytes())?;
        Ok(())
    }

    fn bitmaps_usage_bytes(&self) -> u64 {
        self.tree
            .inodes
            .iter()
            .map(|inode| match inode {
                Inode::Directory { .. } => self.geometry.blk_sz as u64,
                Inode::Regular { size, .. } => *size as u64,
            })
            .sum()
    }

    /// Recursively writes every resolved inode and dentry back to disk,
    /// then flushes the superblock and bitmaps.
    pub fn unmount(mut self) -> FsResult<()> {
        let root = self.tree.root;
        self.tree.write_back(root, &mut self.device, &self.geometry)?;
        self.flush_metadata()?;
        info!("unmounted filesystem");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_backing_file(size: u64) -> tempfile::NamedTempFile {
        let f = tempfile::NamedTempFile::new().unwrap();
        f.as_file().set_len(size).unwrap();
        f
    }

    #[test]
    fn fresh_mount_formats_and_reports_root() {
        let tmp = make_backing_file(4 * 1024 * 1024);
        let mut fs = Fs::mount(tmp.path()).unwrap();
        let attr = crate::ops::stat(&mut fs.tree, &mut fs.device, &fs.geometry, "/").unwrap();
        assert!(attr.is_dir);
        assert_eq!(attr.nlink, 2);
    }

    #[test]
    fn unmount_then_remount_persists_tree() {
        let tmp = make_backing_file(4 * 1024 * 1024);
        let mut fs = Fs::mount(tmp.path()).unwrap();
        crate::ops::mkdir(
            &mut fs.tree,
            &mut fs.bitmaps,
            &mut fs.device,
            &fs.geometry,
            "/a",
        )
        .unwrap();
        crate::ops::mknod(
            &mut fs.tree,
            &mut fs.bitmaps,
            &mut fs.device,
            &fs.geometry,
            "/a/f",
            false,
        )
        .unwrap();
        crate::ops::write(&mut fs.tree, &mut fs.device, &fs.geometry, "/a/f", 0, b"hello").unwrap();
        fs.unmount().unwrap();

        let mut fs2 = Fs::mount(tmp.path()).unwrap();
        let data =
            crate::ops::read(&mut fs2.tree, &mut fs2.device, &fs2.geometry, "/a/f", 0, 5).unwrap();
        assert_eq!(&data, b"hello");
    }
}
