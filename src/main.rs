//! `newfs`: mounts a single block device (or disk image) as a small
//! POSIX filesystem via FUSE.

use std::path::PathBuf;

use clap::Parser;
use fuser::MountOption;
use log::info;
use newfs::fuse_adapter::FuseAdapter;
use newfs::mount::Fs;

/// Mounts the filesystem image at `--device` on `mountpoint`.
#[derive(Parser, Debug)]
#[command(name = "newfs", version, about)]
struct Cli {
    /// Path to the backing block device or disk image.
    #[arg(long)]
    device: PathBuf,

    /// Directory to mount the filesystem on.
    mountpoint: PathBuf,

    /// Stay in the foreground instead of forking.
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Raise the log level to debug.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Allow other users to access the mount.
    #[arg(long = "allow-other")]
    allow_other: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // This crate never forks; `-f` is accepted for CLI compatibility with
    // conventional FUSE tools but the session loop below always runs in
    // the calling process.
    let _ = cli.foreground;

    info!("opening device {}", cli.device.display());
    let fs = Fs::mount(&cli.device)?;

    let mut options = vec![MountOption::FSName("newfs".to_string()), MountOption::AutoUnmount];
    if cli.allow_other {
        options.push(MountOption::AllowOther);
    }

    info!("mounting at {}", cli.mountpoint.display());
    fuser::mount2(FuseAdapter::new(fs), &cli.mountpoint, &options)?;
    Ok(())
}
