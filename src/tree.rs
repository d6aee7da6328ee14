//! In-memory inode/dentry tree: lazy load and recursive write-back.
//!
//! Dentries and inodes live in two parallel arenas addressed by `usize`
//! indices rather than owned pointers, per the design notes: this avoids
//! cyclic ownership (a dentry's parent is just an index) and keeps "not yet
//! loaded" a distinct state (`None`) from "absent".

use crate::device::Device;
use crate::disk_format::{DentryRecord, FileTypeRecord, InodeRecord};
use crate::error::{FsError, FsResult};
use crate::layout::{Geometry, DATA_PER_FILE, MAX_FNAME};

/// A directory entry: name, type, and a lazily-resolved inode handle.
pub struct Dentry {
    pub name: String,
    pub file_type: FileTypeRecord,
    /// Inode number this dentry names, once known. `None` only for the
    /// never-allocated case, which cannot occur once a dentry carries a
    /// valid `ino` — kept as a field alongside `inode` to mirror the
    /// on-disk record, which always has an `ino`.
    pub ino: u32,
    /// Index into the inode arena, once loaded; `None` means "not yet
    /// loaded", distinct from "has no inode".
    pub inode: Option<usize>,
    /// Index of the parent dentry; `None` for the root.
    pub parent: Option<usize>,
    /// Indices of child dentries, in head-insertion order (most recently
    /// created first, which is the reverse of on-disk record order after a
    /// write-back/reload cycle).
    pub children: Vec<usize>,
}

/// An inode, modeled as a tagged variant over file type rather than a
/// record with conditional fields.
pub enum Inode {
    Directory {
        ino: u32,
        dir_cnt: u32,
        /// The four owned data block indices, holding the packed dentry
        /// records of this directory's children.
        blocknum: [u32; DATA_PER_FILE],
    },
    Regular {
        ino: u32,
        size: u32,
        /// The four owned data block indices.
        blocknum: [u32; DATA_PER_FILE],
        /// Cached content of each owned block, filled on lazy load.
        blocks: Vec<Vec<u8>>,
    },
}

impl Inode {
    pub fn ino(&self) -> u32 {
        match self {
            Self::Directory { ino, .. } => *ino,
            Self::Regular { ino, .. } => *ino,
        }
    }
}

/// The in-memory dentry/inode tree, addressed by arena index.
pub struct Tree {
    pub dentries: Vec<Dentry>,
    pub inodes: Vec<Inode>,
    /// Maps inode number (bitmap index) to its arena index in `inodes`,
    /// once that inode has been loaded or created.
    pub inode_by_number: Vec<Option<usize>>,
    /// Arena index of the root dentry.
    pub root: usize,
}

impl Tree {
    /// Creates an empty tree with a fresh root dentry (not yet linked to an
    /// inode — the allocator binds one during mount formatting).
    pub fn new_with_root() -> Self {
        let root = Dentry {
            name: "/".to_string(),
            file_type: FileTypeRecord::Directory,
            ino: 0,
            inode: None,
            parent: None,
            children: Vec::new(),
        };
        Self {
            dentries: vec![root],
            inodes: Vec::new(),
            inode_by_number: Vec::new(),
            root: 0,
        }
    }

    /// Allocates a slot in `inode_by_number` up to and including `ino`.
    fn ensure_inode_slot(&mut self, ino: u32) {
        if self.inode_by_number.len() <= ino as usize {
            self.inode_by_number.resize(ino as usize + 1, None);
        }
    }

    /// Registers a freshly created in-memory inode under its number.
    pub fn bind_inode(&mut self, inode: Inode) -> usize {
        let ino = inode.ino();
        let idx = self.inodes.len();
        self.inodes.push(inode);
        self.ensure_inode_slot(ino);
        self.inode_by_number[ino as usize] = Some(idx);
        idx
    }

    /// Creates a new child dentry under `parent_idx`, head-inserting it
    /// into the parent's child list so the most recently created child
    /// appears first.
    pub fn alloc_dentry(
        &mut self,
        parent_idx: usize,
        name: &str,
        file_type: FileTypeRecord,
        ino: u32,
    ) -> usize {
        let dentry = Dentry {
            name: name.to_string(),
            file_type,
            ino,
            inode: None,
            parent: Some(parent_idx),
            children: Vec::new(),
        };
        let idx = self.dentries.len();
        self.dentries.push(dentry);
        self.dentries[parent_idx].children.insert(0, idx);
        idx
    }

    /// Ensures `dentry_idx`'s inode is resolved, lazily loading it from
    /// disk if needed.
    pub fn resolve_inode(
        &mut self,
        dentry_idx: usize,
        device: &mut Device,
        geometry: &Geometry,
    ) -> FsResult<usize> {
        if let Some(idx) = self.dentries[dentry_idx].inode {
            return Ok(idx);
        }
        let ino = self.dentries[dentry_idx].ino;
        if let Some(Some(idx)) = self.inode_by_number.get(ino as usize).copied() {
            self.dentries[dentry_idx].inode = Some(idx);
            return Ok(idx);
        }
        let idx = self.load_inode(dentry_idx, ino, device, geometry)?;
        self.dentries[dentry_idx].inode = Some(idx);
        Ok(idx)
    }

    /// Reads the inode record for `ino`, and for directories also reads its
    /// `dir_cnt` dentry records, allocating an in-memory child dentry for
    /// each (head-insertion order, so child order is the reverse of
    /// on-disk order — acceptable per the design).
    fn load_inode(
        &mut self,
        dentry_idx: usize,
        ino: u32,
        device: &mut Device,
        geometry: &Geometry,
    ) -> FsResult<usize> {
        let mut buf = vec![0u8; std::mem::size_of::<InodeRecord>()];
        device.read(geometry.inode_record_offset(ino), &mut buf)?;
        let rec = InodeRecord::from_disk(&buf);

        let inode = match rec.file_type() {
            FileTypeRecord::Directory => {
                let dir_cnt = { rec.dir_cnt };
                let blocknum = { rec.blocknum };
                let idx = self.bind_inode(Inode::Directory {
                    ino,
                    dir_cnt,
                    blocknum,
                });
                self.load_dentries(dentry_idx, dir_cnt, &blocknum, device, geometry)?;
                idx
            }
            FileTypeRecord::Regular => {
                let blocknum = { rec.blocknum };
                let mut blocks = Vec::with_capacity(DATA_PER_FILE);
                for &blk in &blocknum {
                    let mut data = vec![0u8; geometry.blk_sz as usize];
                    device.read(geometry.data_block_offset(blk), &mut data)?;
                    blocks.push(data);
                }
                self.bind_inode(Inode::Regular {
                    ino,
                    size: { rec.size },
                    blocknum,
                    blocks,
                })
            }
        };
        Ok(idx)
    }

    /// Reads `dir_cnt` dentry records starting at the directory's first
    /// owned data block, spanning subsequent owned blocks as needed, and
    /// allocates an in-memory child dentry for each.
    fn load_dentries(
        &mut self,
        parent_idx: usize,
        dir_cnt: u32,
        blocknum: &[u32; DATA_PER_FILE],
        device: &mut Device,
        geometry: &Geometry,
    ) -> FsResult<()> {
        let rec_sz = std::mem::size_of::<DentryRecord>();
        let per_block = (geometry.blk_sz as usize) / rec_sz;
        for i in 0..dir_cnt as usize {
            let block_in_dir = i / per_block;
            let offset_in_block = (i % per_block) * rec_sz;
            if block_in_dir >= DATA_PER_FILE {
                break;
            }
            let blk = blocknum[block_in_dir];
            let mut buf = vec![0u8; rec_sz];
            device.read(
                geometry.data_block_offset(blk) + offset_in_block as u64,
                &mut buf,
            )?;
            let rec = DentryRecord::from_disk(&buf);
            self.alloc_dentry(parent_idx, &rec.name(), rec.file_type(), { rec.ino });
        }
        Ok(())
    }

    /// Recursively writes an inode's record (and, for directories, its
    /// children's dentry records and their own subtrees) back to disk.
    ///
    /// Write-back order mirrors the in-memory traversal order so that, on
    /// remount, `dir_cnt` and the sequence of on-disk records match the
    /// in-memory child list.
    pub fn write_back(
        &mut self,
        dentry_idx: usize,
        device: &mut Device,
        geometry: &Geometry,
    ) -> FsResult<()> {
        let Some(inode_idx) = self.dentries[dentry_idx].inode else {
            return Ok(());
        };
        match &self.inodes[inode_idx] {
            Inode::Directory {
                ino,
                dir_cnt,
                blocknum,
            } => {
                let ino = *ino;
                let dir_cnt = *dir_cnt;
                let blocknum = *blocknum;
                let children = self.dentries[dentry_idx].children.clone();
                let rec = InodeRecord::to_disk(
                    ino,
                    0,
                    dir_cnt,
                    FileTypeRecord::Directory,
                    blocknum,
                );
                device.write(geometry.inode_record_offset(ino), rec.as_bytes())?;
                self.write_dentries(&children, &blocknum, device, geometry)?;
                for &child in &children {
                    self.write_back(child, device, geometry)?;
                }
            }
            Inode::Regular {
                ino,
                size,
                blocknum,
                blocks,
            } => {
                let ino = *ino;
                let size = *size;
                let blocknum = *blocknum;
                let rec =
                    InodeRecord::to_disk(ino, size, 0, FileTypeRecord::Regular, blocknum);
                device.write(geometry.inode_record_offset(ino), rec.as_bytes())?;
                for (i, &blk) in blocknum.iter().enumerate() {
                    device.write(geometry.data_block_offset(blk), &blocks[i])?;
                }
            }
        }
        Ok(())
    }

    /// Writes each child's dentry record into the parent directory's data
    /// blocks, at the next sequential slot.
    fn write_dentries(
        &self,
        children: &[usize],
        blocknum: &[u32; DATA_PER_FILE],
        device: &mut Device,
        geometry: &Geometry,
    ) -> FsResult<()> {
        let rec_sz = std::mem::size_of::<DentryRecord>();
        let per_block = (geometry.blk_sz as usize) / rec_sz;
        for (i, &child_idx) in children.iter().enumerate() {
            let block_in_dir = i / per_block;
            let offset_in_block = (i % per_block) * rec_sz;
            if block_in_dir >= DATA_PER_FILE {
                return Err(FsError::NoSpace);
            }
            let blk = blocknum[block_in_dir];
            let child = &self.dentries[child_idx];
            let rec = DentryRecord::to_disk(&child.name, child.file_type, child.ino);
            device.write(
                geometry.data_block_offset(blk) + offset_in_block as u64,
                rec.as_bytes(),
            )?;
        }
        Ok(())
    }

    /// Bumps a directory inode's `dir_cnt` by one, after a new child has
    /// been spliced into its dentry list.
    pub fn increment_dir_cnt(&mut self, inode_idx: usize) {
        if let Inode::Directory { dir_cnt, .. } = &mut self.inodes[inode_idx] {
            *dir_cnt += 1;
        }
    }

    /// Name length check used by the resolver: stored and queried names
    /// must match exactly (not merely share a prefix, which was a latent
    /// bug in the reference implementation this design fixes).
    pub fn names_match(stored: &str, query: &str) -> bool {
        stored.len() <= MAX_FNAME && stored == query
    }
}
