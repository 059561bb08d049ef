//! Mount command for serving a LayerFS engine via FUSE

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use fuser::MountOption;
use log::{error, info};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use layerfs::blockdev::{BlockDevice, FileBackedBlockDevice, BLOCK_SIZE};
use layerfs::{Engine, EngineConfig, LayerFs};

/// Mount a LayerFS filesystem
#[derive(Parser, Debug)]
#[command(about = "Mount a LayerFS filesystem via FUSE")]
pub struct MountArgs {
    /// Mount point
    pub mountpoint: PathBuf,

    /// Image file whose size sets the block capacity. File data is kept
    /// in memory and is not written to the image.
    #[arg(long)]
    pub image: Option<PathBuf>,

    /// Create the image with this size in MiB instead of opening it
    #[arg(long, requires = "image")]
    pub size_mb: Option<u64>,

    /// JSON engine configuration
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Allow other users to access the mount
    #[arg(long)]
    pub allow_other: bool,
}

/// Image size in bytes for `--size-mb`
fn image_bytes(mb: u64) -> Result<u64> {
    let size = mb
        .checked_mul(1024 * 1024)
        .ok_or_else(|| anyhow!("image size of {} MiB is too large", mb))?;
    if size < BLOCK_SIZE as u64 {
        return Err(anyhow!("image must hold at least one {} byte block", BLOCK_SIZE));
    }
    Ok(size)
}

fn open_device(image: &Path, size_mb: Option<u64>) -> Result<Arc<dyn BlockDevice>> {
    let device = match size_mb {
        Some(mb) => {
            let size = image_bytes(mb)?;
            FileBackedBlockDevice::create(image, size)
                .with_context(|| format!("Failed to create image: {}", image.display()))?
        }
        None => FileBackedBlockDevice::open(image, false)
            .with_context(|| format!("Failed to open image: {}", image.display()))?,
    };
    info!(
        "Using image {} ({} blocks)",
        image.display(),
        device.block_count()
    );
    Ok(Arc::new(device))
}

pub fn run(args: MountArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => EngineConfig::default(),
    };

    // Check if mountpoint exists and is a directory
    let mountpoint = args
        .mountpoint
        .canonicalize()
        .with_context(|| format!("Failed to access mountpoint: {}", args.mountpoint.display()))?;
    if !mountpoint.is_dir() {
        return Err(anyhow!("Mountpoint must be a directory"));
    }

    let engine = match &args.image {
        Some(image) => Engine::with_device(config, open_device(image, args.size_mb)?),
        None => Engine::new(config),
    }
    .context("Failed to create engine")?;
    let fs = LayerFs::new(Arc::new(engine));

    let mut options = vec![
        MountOption::FSName("layerfs".to_string()),
        MountOption::AutoUnmount,
    ];
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }

    // Set up signal handler for clean unmount
    ctrlc::set_handler(move || {
        info!("Unmounting filesystem...");
        // AutoUnmount handles the actual unmounting
        std::process::exit(0);
    })
    .context("Failed to set Ctrl+C handler")?;

    info!("Mounting LayerFS at {:?}", mountpoint);
    info!("Press Ctrl+C to unmount");

    // This will block until the filesystem is unmounted
    match fuser::mount2(fs, &mountpoint, &options) {
        Ok(()) => {
            info!("Filesystem unmounted successfully");
            Ok(())
        }
        Err(e) => {
            error!("Mount error: {}", e);
            Err(anyhow!("Failed to mount: {}", e))
        }
    }
}
