//! Bridges `fuser`'s inode-number-based `Filesystem` trait to the
//! path-based operation handlers in `ops.rs`.
//!
//! `fuser` addresses everything by a 64-bit inode number; this filesystem's
//! core addresses everything by path. The bridge keeps the obvious mapping
//! `fuse_ino = dentry_arena_index + 1` (FUSE reserves `1` for the root) and
//! reconstructs a path by walking a dentry's parent chain back to the root.

use std::ffi::OsStr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};
use log::warn;

use crate::mount::Fs;
use crate::ops::{self, Attr};

const TTL: Duration = Duration::from_secs(1);
const FUSE_ROOT_INO: u64 = 1;

/// Wraps a mounted [`Fs`] behind a mutex so the `&self`-taking
/// `fuser::Filesystem` methods can still mutate it. `fuser` serializes
/// callback dispatch within one session, so the lock is never contended.
///
/// Held as `Option` so `destroy()` can take the filesystem out and flush it
/// through `Fs::unmount`, which consumes `Fs` by value.
pub struct FuseAdapter {
    fs: Mutex<Option<Fs>>,
}

impl FuseAdapter {
    pub fn new(fs: Fs) -> Self {
        Self {
            fs: Mutex::new(Some(fs)),
        }
    }

    fn path_for(fs: &Fs, dentry_idx: usize) -> String {
        let mut components = Vec::new();
        let mut current = Some(dentry_idx);
        while let Some(idx) = current {
            if idx == fs.tree.root {
                break;
            }
            components.push(fs.tree.dentries[idx].name.clone());
            current = fs.tree.dentries[idx].parent;
        }
        if components.is_empty() {
            return "/".to_string();
        }
        components.reverse();
        format!("/{}", components.join("/"))
    }

    fn child_path(parent_path: &str, name: &OsStr) -> String {
        let name = name.to_string_lossy();
        if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        }
    }

    fn ino_to_dentry(ino: u64) -> usize {
        if ino == FUSE_ROOT_INO {
            0
        } else {
            (ino - 1) as usize
        }
    }

    fn dentry_to_ino(dentry_idx: usize) -> u64 {
        dentry_idx as u64 + 1
    }

    fn attr_to_file_attr(ino: u64, attr: &Attr) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.st_blocks.unwrap_or(0),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: if attr.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: attr.mode as u16,
            nlink: attr.nlink,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: attr.blksize,
            flags: 0,
        }
    }
}

impl Filesystem for FuseAdapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let mut guard = self.fs.lock().unwrap();
        let fs = guard.as_mut().expect("filesystem not mounted");
        let parent_idx = Self::ino_to_dentry(parent);
        let parent_path = Self::path_for(fs, parent_idx);
        let path = Self::child_path(&parent_path, name);

        match ops::stat(&mut fs.tree, &mut fs.device, &fs.geometry, &path) {
            Ok(attr) => match crate::resolver::resolve(&mut fs.tree, &mut fs.device, &fs.geometry, &path)
            {
                Ok(resolved) => {
                    let ino = Self::dentry_to_ino(resolved.dentry);
                    reply.entry(&TTL, &Self::attr_to_file_attr(ino, &attr), 0);
                }
                Err(_) => reply.error(libc::ENOENT),
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let mut guard = self.fs.lock().unwrap();
        let fs = guard.as_mut().expect("filesystem not mounted");
        let dentry_idx = Self::ino_to_dentry(ino);
        let path = Self::path_for(fs, dentry_idx);
        match ops::stat(&mut fs.tree, &mut fs.device, &fs.geometry, &path) {
            Ok(attr) => reply.attr(&TTL, &Self::attr_to_file_attr(ino, &attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let mut guard = self.fs.lock().unwrap();
        let fs = guard.as_mut().expect("filesystem not mounted");
        let dentry_idx = Self::ino_to_dentry(ino);
        let path = Self::path_for(fs, dentry_idx);

        let result = if let Some(new_size) = size {
            ops::truncate(&mut fs.tree, &mut fs.device, &fs.geometry, &path, new_size)
        } else {
            ops::utimens(&mut fs.tree, &mut fs.device, &fs.geometry, &path)
        };
        if let Err(e) = result {
            reply.error(e.errno());
            return;
        }

        match ops::stat(&mut fs.tree, &mut fs.device, &fs.geometry, &path) {
            Ok(attr) => reply.attr(&TTL, &Self::attr_to_file_attr(ino, &attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let mut guard = self.fs.lock().unwrap();
        let fs = guard.as_mut().expect("filesystem not mounted");
        let dentry_idx = Self::ino_to_dentry(ino);
        let path = Self::path_for(fs, dentry_idx);

        if offset == 0 {
            if reply.add(ino, 1, FileType::Directory, ".") || reply.add(ino, 2, FileType::Directory, "..")
            {
                reply.ok();
                return;
            }
        }

        let mut index = if offset < 2 { 0 } else { (offset - 2) as usize };
        loop {
            match ops::readdir(&mut fs.tree, &mut fs.device, &fs.geometry, &path, index) {
                Ok(Some(entry)) => {
                    let kind = if entry.is_dir {
                        FileType::Directory
                    } else {
                        FileType::RegularFile
                    };
                    let child_ino = Self::dentry_to_ino(fs.tree.dentries[dentry_idx].children[index]);
                    let full = reply.add(child_ino, (index + 3) as i64, kind, &entry.name);
                    index += 1;
                    if full {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let mut guard = self.fs.lock().unwrap();
        let fs = guard.as_mut().expect("filesystem not mounted");
        let parent_idx = Self::ino_to_dentry(parent);
        let parent_path = Self::path_for(fs, parent_idx);
        let path = Self::child_path(&parent_path, name);

        if let Err(e) = ops::mkdir(&mut fs.tree, &mut fs.bitmaps, &mut fs.device, &fs.geometry, &path) {
            reply.error(e.errno());
            return;
        }
        match crate::resolver::resolve(&mut fs.tree, &mut fs.device, &fs.geometry, &path) {
            Ok(resolved) => {
                let ino = Self::dentry_to_ino(resolved.dentry);
                match ops::stat(&mut fs.tree, &mut fs.device, &fs.geometry, &path) {
                    Ok(attr) => reply.entry(&TTL, &Self::attr_to_file_attr(ino, &attr), 0),
                    Err(e) => reply.error(e.errno()),
                }
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let mut guard = self.fs.lock().unwrap();
        let fs = guard.as_mut().expect("filesystem not mounted");
        let parent_idx = Self::ino_to_dentry(parent);
        let parent_path = Self::path_for(fs, parent_idx);
        let path = Self::child_path(&parent_path, name);

        if let Err(e) = ops::mknod(
            &mut fs.tree,
            &mut fs.bitmaps,
            &mut fs.device,
            &fs.geometry,
            &path,
            false,
        ) {
            reply.error(e.errno());
            return;
        }
        match crate::resolver::resolve(&mut fs.tree, &mut fs.device, &fs.geometry, &path) {
            Ok(resolved) => {
                let ino = Self::dentry_to_ino(resolved.dentry);
                match ops::stat(&mut fs.tree, &mut fs.device, &fs.geometry, &path) {
                    Ok(attr) => reply.entry(&TTL, &Self::attr_to_file_attr(ino, &attr), 0),
                    Err(e) => reply.error(e.errno()),
                }
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let mut guard = self.fs.lock().unwrap();
        let fs = guard.as_mut().expect("filesystem not mounted");
        let dentry_idx = Self::ino_to_dentry(ino);
        let path = Self::path_for(fs, dentry_idx);
        match ops::read(
            &mut fs.tree,
            &mut fs.device,
            &fs.geometry,
            &path,
            offset as u64,
            size as u64,
        ) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let mut guard = self.fs.lock().unwrap();
        let fs = guard.as_mut().expect("filesystem not mounted");
        let dentry_idx = Self::ino_to_dentry(ino);
        let path = Self::path_for(fs, dentry_idx);
        match ops::write(&mut fs.tree, &mut fs.device, &fs.geometry, &path, offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let mut guard = self.fs.lock().unwrap();
        let fs = guard.as_mut().expect("filesystem not mounted");
        let dentry_idx = Self::ino_to_dentry(ino);
        let path = Self::path_for(fs, dentry_idx);
        match ops::access(&mut fs.tree, &mut fs.device, &fs.geometry, &path, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let mut guard = self.fs.lock().unwrap();
        let fs = guard.as_mut().expect("filesystem not mounted");
        let usage = ops::usage(&fs.bitmaps, &fs.geometry);
        reply.statfs(
            usage.total_blocks as u64,
            usage.free_blocks as u64,
            usage.free_blocks as u64,
            usage.total_inodes as u64,
            usage.free_inodes as u64,
            fs.geometry.blk_sz,
            crate::layout::MAX_FNAME as u32,
            fs.geometry.blk_sz,
        );
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        warn!("unlink is not supported by this filesystem");
        reply.error(libc::ENOSYS);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        warn!("rmdir is not supported by this filesystem");
        reply.error(libc::ENOSYS);
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        warn!("rename is not supported by this filesystem");
        reply.error(libc::ENOSYS);
    }

    fn destroy(&mut self) {
        let mut guard = self.fs.lock().unwrap();
        if let Some(fs) = guard.take() {
            if let Err(e) = fs.unmount() {
                warn!("error flushing filesystem on unmount: {e}");
            }
        }
    }
}
