//! Core of a small userspace POSIX filesystem backed by a single block
//! device, bridged to the kernel through FUSE.

pub mod alloc;
pub mod device;
pub mod disk_format;
pub mod error;
pub mod fuse_adapter;
pub mod layout;
pub mod mount;
pub mod ops;
pub mod resolver;
pub mod tree;
