//! Block-aligned device I/O.
//!
//! The block device driver (out of scope, see spec) only accepts transfers
//! aligned to its reported I/O unit. [`Device`] turns arbitrary byte-range
//! reads and writes into a sequence of aligned transfers, doing a
//! read-modify-write for partial writes.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use crate::error::FsResult;

/// ioctl macro: command encoding, mirroring `utils::disk::ior!`.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as std::ffi::c_long)
    };
}

/// ioctl command: get the size of a block device in 512-byte sectors.
const BLKGETSIZE64: std::ffi::c_long = ior!(0x12, 114, u64);
/// ioctl command: get the logical sector (I/O unit) size of a block device.
const BLKSSZGET: std::ffi::c_long = 0x1268;

/// Default I/O unit size assumed for a regular file used as a disk image
/// (there is no real block device to query).
const DEFAULT_IO_SZ: u32 = 512;

/// Queries the size, in bytes, of the device or file at `path`.
fn query_size(file: &File) -> io::Result<u64> {
    let metadata = file.metadata()?;
    let file_type = metadata.file_type();
    if file_type.is_block_device() || file_type.is_char_device() {
        let mut size: u64 = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(size * 512)
    } else {
        Ok(metadata.len())
    }
}

/// Queries the I/O unit size, in bytes, of the device at `path`.
fn query_io_sz(file: &File) -> io::Result<u32> {
    let metadata = file.metadata()?;
    if metadata.file_type().is_block_device() {
        let mut sz: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET as _, &mut sz) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sz as u32)
    } else {
        Ok(DEFAULT_IO_SZ)
    }
}

/// Rounds `value` down to a multiple of `round`.
fn round_down(value: u64, round: u64) -> u64 {
    (value / round) * round
}

/// Rounds `value` up to a multiple of `round`.
fn round_up(value: u64, round: u64) -> u64 {
    round_down(value + round - 1, round)
}

/// A block-aligned view over an open device handle.
pub struct Device {
    file: File,
    /// The device's reported I/O unit size, in bytes.
    pub io_sz: u32,
    /// The device's reported total size, in bytes.
    pub size: u64,
}

impl Device {
    /// Opens the device or disk image at `path` and queries its geometry.
    pub fn open(path: &Path) -> FsResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let io_sz = query_io_sz(&file)?;
        let size = query_size(&file)?;
        Ok(Self { file, io_sz, size })
    }

    /// The filesystem's logical block size: twice the I/O unit.
    pub fn blk_sz(&self) -> u32 {
        self.io_sz * 2
    }

    /// Reads the aligned window covering `[offset, offset+buf.len())`, then
    /// copies out the requested sub-range.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        let blk_sz = self.blk_sz() as u64;
        let aligned_start = round_down(offset, blk_sz);
        let aligned_end = round_up(offset + buf.len() as u64, blk_sz);
        let mut window = vec![0u8; (aligned_end - aligned_start) as usize];
        self.transfer_aligned_read(aligned_start, &mut window)?;
        let rel = (offset - aligned_start) as usize;
        buf.copy_from_slice(&window[rel..rel + buf.len()]);
        Ok(())
    }

    /// Read-modify-writes the aligned window covering
    /// `[offset, offset+buf.len())`, overlaying `buf` before writing back.
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> FsResult<()> {
        let blk_sz = self.blk_sz() as u64;
        let aligned_start = round_down(offset, blk_sz);
        let aligned_end = round_up(offset + buf.len() as u64, blk_sz);
        let mut window = vec![0u8; (aligned_end - aligned_start) as usize];
        self.transfer_aligned_read(aligned_start, &mut window)?;
        let rel = (offset - aligned_start) as usize;
        window[rel..rel + buf.len()].copy_from_slice(buf);
        self.transfer_aligned_write(aligned_start, &window)?;
        Ok(())
    }

    /// Transfers an already block-aligned range through repeated I/O-unit
    /// sized reads.
    fn transfer_aligned_read(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Transfers an already block-aligned range through repeated I/O-unit
    /// sized writes.
    fn transfer_aligned_write(&mut self, offset: u64, buf: &[u8]) -> FsResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_device(size: u64) -> (tempfile::NamedTempFile, Device) {
        let f = tempfile::NamedTempFile::new().unwrap();
        f.as_file().set_len(size).unwrap();
        let dev = Device::open(f.path()).unwrap();
        (f, dev)
    }

    #[test]
    fn round_trip_aligned() {
        let (_tmp, mut dev) = make_device(4096);
        let data = [0xAAu8; 8];
        dev.write(0, &data).unwrap();
        let mut out = [0u8; 8];
        dev.read(0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn round_trip_unaligned_preserves_neighbors() {
        let (_tmp, mut dev) = make_device(4096);
        let blk_sz = dev.blk_sz() as u64;
        dev.write(0, &[0xFFu8; 1]).unwrap();
        dev.write(blk_sz - 1, &[0x11, 0x22]).unwrap();
        let mut out = [0u8; 2];
        dev.read(blk_sz - 1, &mut out).unwrap();
        assert_eq!(out, [0x11, 0x22]);
        let mut first = [0u8; 1];
        dev.read(0, &mut first).unwrap();
        assert_eq!(first, [0xFF]);
    }
}
