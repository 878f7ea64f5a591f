//! Helpers for interacting with mountpoints, built on `findmnt` and the
//! util-linux mount tools.

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use rootshift_utils::CommandRunExt;

#[derive(Debug, Deserialize)]
struct FindmntOutput {
    filesystems: Vec<Filesystem>,
}

/// A mounted filesystem as reported by `findmnt`.
#[derive(Debug, Deserialize)]
pub struct Filesystem {
    /// The mountpoint.
    pub target: Utf8PathBuf,
    /// The device backing the mount, e.g. `/dev/mmcblk0p2`.
    pub source: String,
    /// Filesystem type.
    pub fstype: String,
    /// Filesystem UUID, if known.
    pub uuid: Option<String>,
    /// Child mounts, if requested recursively.
    pub children: Option<Vec<Filesystem>>,
}

fn run_findmnt(args: &[&str], path: &str) -> Result<FindmntOutput> {
    let o: FindmntOutput = Command::new("findmnt")
        .args(["-J", "-v", "--output", "SOURCE,TARGET,FSTYPE,UUID"])
        .args(args)
        .arg(path)
        .log_debug()
        .run_and_parse_json()?;
    Ok(o)
}

/// Inspect the filesystem mounted at the provided path.
#[context("Inspecting filesystem {path}")]
pub fn inspect_filesystem(path: &Utf8Path) -> Result<Filesystem> {
    run_findmnt(&[], path.as_str())?
        .filesystems
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("findmnt returned no data for {path}"))
}

/// Return all mountpoints currently backed by the given source device.
/// A device that is not mounted anywhere yields an empty list.
#[context("Querying mounts of {source}")]
pub fn mounts_of(source: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    // findmnt exits with an error when the source has no mounts, which
    // for us is just the empty answer.
    let output = Command::new("findmnt")
        .args(["-J", "-v", "--output", "SOURCE,TARGET,FSTYPE,UUID", "--source"])
        .arg(source)
        .log_debug()
        .output()
        .context("Spawning findmnt")?;
    if !output.status.success() {
        return Ok(Vec::new());
    }
    let parsed: FindmntOutput =
        serde_json::from_slice(&output.stdout).context("Parsing findmnt JSON")?;
    Ok(parsed.filesystems.into_iter().map(|f| f.target).collect())
}

/// Mount the given device at the target path.
#[context("Mounting {dev} at {target}")]
pub fn mount(dev: &Utf8Path, target: &Utf8Path) -> Result<()> {
    Command::new("mount").arg(dev).arg(target).log_debug().run()
}

/// Unmount the filesystem at the target path.
#[context("Unmounting {target}")]
pub fn unmount(target: &Utf8Path) -> Result<()> {
    Command::new("umount").arg(target).log_debug().run()
}

/// Unmount every mountpoint backed by the given device.
#[context("Unmounting all targets of {dev}")]
pub fn unmount_all_targets(dev: &Utf8Path) -> Result<()> {
    Command::new("umount")
        .arg("--all-targets")
        .arg(dev)
        .log_debug()
        .run()
}

/// A partition mounted at a private runtime mountpoint, unmounted again
/// when no longer needed.
#[derive(Debug)]
pub struct TempMount {
    target: Option<Utf8PathBuf>,
}

impl TempMount {
    /// Mount `dev` at `target`, creating the mountpoint if necessary.
    #[context("Mounting {dev} at {target}")]
    pub fn new(dev: &Utf8Path, target: &Utf8Path) -> Result<Self> {
        std::fs::create_dir_all(target).with_context(|| format!("Creating {target}"))?;
        mount(dev, target)?;
        Ok(Self {
            target: Some(target.to_owned()),
        })
    }

    /// Access the mountpoint.
    pub fn path(&self) -> &Utf8Path {
        // SAFETY: The option cannot be destructured until we are dropped
        self.target.as_deref().unwrap()
    }

    // Shared backend for our `close` and `drop` implementations.
    fn impl_close(&mut self) -> Result<()> {
        let Some(target) = self.target.take() else {
            tracing::trace!("mountpoint already released");
            return Ok(());
        };
        unmount(&target)
    }

    /// Consume this mount, unmounting it.
    pub fn close(mut self) -> Result<()> {
        self.impl_close()
    }
}

impl Drop for TempMount {
    fn drop(&mut self) {
        // Best effort to unmount if we're dropped without invoking `close`
        let _ = self.impl_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_findmnt() {
        let fixture = indoc::indoc! { r#"
        {
           "filesystems": [
              {
                 "source": "/dev/nvme0n1p2",
                 "target": "/",
                 "fstype": "ext4",
                 "uuid": "3b7c2f1e-85df-4a35-a5b7-9f5c1d62a1c4",
                 "children": [
                    {
                       "source": "/dev/mmcblk0p1",
                       "target": "/boot/firmware",
                       "fstype": "vfat",
                       "uuid": "9C33-6BBC"
                    }
                 ]
              }
           ]
        }
        "# };
        let parsed: FindmntOutput = serde_json::from_str(fixture).unwrap();
        let root = parsed.filesystems.into_iter().next().unwrap();
        assert_eq!(root.source, "/dev/nvme0n1p2");
        assert_eq!(root.target, Utf8Path::new("/"));
        let boot = root.children.as_deref().unwrap().first().unwrap();
        assert_eq!(boot.source, "/dev/mmcblk0p1");
        assert_eq!(boot.fstype, "vfat");
    }
}
