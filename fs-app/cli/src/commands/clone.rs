//! Clone management over the mounted filesystem's xattr channel

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

/// Clone a directory
#[derive(Parser, Debug)]
#[command(about = "Clone a directory of a mounted LayerFS into a new layer")]
pub struct CloneArgs {
    /// Directory to clone, inside a LayerFS mount
    pub source: PathBuf,

    /// Name of the clone root
    pub name: String,
}

/// Remove a clone
#[derive(Parser, Debug)]
#[command(about = "Remove a LayerFS clone")]
pub struct RemoveArgs {
    /// Root directory of the clone
    pub root: PathBuf,
}

fn attr_name(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('/') {
        return Err(anyhow!("invalid clone name {:?}", name));
    }
    Ok(format!("user.{name}"))
}

pub fn run_clone(args: CloneArgs) -> Result<()> {
    if !args.source.is_dir() {
        return Err(anyhow!("{} is not a directory", args.source.display()));
    }
    let attr = attr_name(&args.name)?;
    xattr::set(&args.source, &attr, b"")
        .with_context(|| format!("Failed to clone {}", args.source.display()))?;
    info!("Cloned {} as {}", args.source.display(), args.name);
    println!("Created clone '{}'", args.name);
    Ok(())
}

pub fn run_remove(args: RemoveArgs) -> Result<()> {
    let name = args
        .root
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("cannot name clone root {}", args.root.display()))?;
    let attr = attr_name(name)?;
    xattr::remove(&args.root, &attr)
        .with_context(|| format!("Failed to remove clone {}", args.root.display()))?;
    println!("Removed clone '{}'", name);
    Ok(())
}
