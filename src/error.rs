//! Filesystem error kinds and their mapping onto the errno-style codes the
//! FUSE bridge expects back.

use std::fmt;
use std::io;

/// An error raised by a filesystem operation.
#[derive(Debug)]
pub enum FsError {
    /// Permission check failed.
    Access,
    /// Read/write offset beyond the current file size.
    Seek,
    /// A file operation was invoked on a directory.
    IsDir,
    /// The inode or data bitmap is exhausted.
    NoSpace,
    /// `mkdir`/`mknod` targeted an already-present path.
    Exists,
    /// The path does not resolve.
    NotFound,
    /// Create was attempted under a non-directory parent.
    Unsupported,
    /// The device shim failed to complete a transfer.
    Io(io::Error),
    /// A malformed argument was given.
    Inval,
}

impl FsError {
    /// Returns the `errno`-style code the FUSE bridge should report to the
    /// kernel for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Self::Access => libc::EACCES,
            Self::Seek => libc::ESPIPE,
            Self::IsDir => libc::EISDIR,
            Self::NoSpace => libc::ENOSPC,
            Self::Exists => libc::EEXIST,
            Self::NotFound => libc::ENOENT,
            Self::Unsupported => libc::ENOSYS,
            Self::Io(_) => libc::EIO,
            Self::Inval => libc::EINVAL,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access => write!(fmt, "permission denied"),
            Self::Seek => write!(fmt, "offset beyond end of file"),
            Self::IsDir => write!(fmt, "is a directory"),
            Self::NoSpace => write!(fmt, "no space left on device"),
            Self::Exists => write!(fmt, "file exists"),
            Self::NotFound => write!(fmt, "no such file or directory"),
            Self::Unsupported => write!(fmt, "operation not supported"),
            Self::Io(e) => write!(fmt, "I/O error: {e}"),
            Self::Inval => write!(fmt, "invalid argument"),
        }
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Shorthand result type used throughout the core.
pub type FsResult<T> = Result<T, FsError>;
