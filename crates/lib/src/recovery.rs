//! The recovery controller: destructive paths back to a pristine
//! removable media.
//!
//! Both operations carry the strictest guard in the system, running
//! only while the root is definitely on secondary storage, because
//! they are invoked precisely when the removable media is expected to
//! be stale or corrupt. They are separately gated forward operations,
//! not reverse edges of the stage machine.

use std::os::unix::fs::FileTypeExt;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::bootsel;
use crate::devices::{self, DeviceLayout, RootSource};
use crate::guard::{self, Guard, HostRunner, LiveProbe, Operation};
use crate::verify;
use rootshift_mount::TempMount;

const RECOVERY_BOOT_MOUNT: &str = "/run/rootshift/recover-boot";
const RECOVERY_SDROOT_MOUNT: &str = "/run/rootshift/recover-sdroot";
/// Directory on the media's root partition for a staged recovery
/// image; also on the strip stage's keep-list.
const RECOVERY_DIR: &str = "recovery";

/// Overwrite the removable media with a pristine image, optionally
/// staging a copy of the image onto the media afterwards for future
/// self-service recovery.
#[context("Re-imaging removable media")]
pub(crate) fn reimage(
    layout: &DeviceLayout,
    image: &Utf8Path,
    stage_copy: bool,
    confirm: Option<String>,
) -> Result<()> {
    // Missing prerequisites fail fast with a clear error before the
    // guard is even evaluated; the image file is not opened here.
    let meta = image
        .symlink_metadata()
        .with_context(|| format!("image file {image} is not accessible"))?;
    if !meta.file_type().is_file() {
        return Err(anyhow!("{image} is not a regular file"));
    }
    let dev_meta = layout
        .removable
        .symlink_metadata()
        .with_context(|| format!("target device {} is not accessible", layout.removable))?;
    if !dev_meta.file_type().is_block_device() {
        return Err(anyhow!("Not a block device: {}", layout.removable));
    }

    let op = Operation::WriteImage {
        image: image.to_owned(),
        dest: layout.removable.clone(),
    };
    let confirm = guard::resolve_confirmation(confirm, &op)?;
    let outcome = guard::execute(
        &op,
        Guard::RootOnSecondary,
        &confirm,
        &LiveProbe { layout },
        &mut HostRunner,
    )?;
    tracing::info!("{}", outcome.summary);
    devices::reread_partitions(&layout.removable)?;

    if stage_copy {
        stage_image_copy(layout, image)?;
    }
    Ok(())
}

/// Copy the image into the freshly written media's recovery directory.
#[context("Staging recovery image onto removable media")]
fn stage_image_copy(layout: &DeviceLayout, image: &Utf8Path) -> Result<()> {
    let name = image
        .file_name()
        .ok_or_else(|| anyhow!("image path {image} has no file name"))?;
    let root_part = layout.removable_root_partition()?;
    let mnt = TempMount::new(&root_part, Utf8Path::new(RECOVERY_SDROOT_MOUNT))?;
    let dir = mnt.path().join(RECOVERY_DIR);
    std::fs::create_dir_all(&dir).with_context(|| format!("Creating {dir}"))?;
    let dest = dir.join(name);
    std::fs::copy(image, &dest).with_context(|| format!("Copying {image} to {dest}"))?;
    rustix::fs::sync();
    mnt.close()?;
    tracing::info!("staged {name} under {RECOVERY_DIR}/ for self-service recovery");
    Ok(())
}

/// Point the boot selector back at the removable media's own root
/// partition, for the case where only the software boot path needs
/// resetting.
#[context("Reverting boot selector to removable media")]
pub(crate) fn revert_boot_selector(layout: &DeviceLayout) -> Result<()> {
    // Same strict guard as re-imaging, checked fresh even though this
    // only edits a file.
    let root = devices::current_root_source(layout)?;
    if root != RootSource::Secondary {
        return Err(anyhow!(
            "precondition violated: current root source is {root}, \
             but recovery requires running from secondary storage"
        ));
    }
    let partuuid = verify::root_partuuid(&layout.removable)?
        .ok_or_else(|| anyhow!("removable root partition has no PARTUUID"))?;
    let wanted = bootsel::partuuid_selector(&partuuid);
    let boot_part = layout.removable_boot_partition()?;
    let mnt = TempMount::new(&boot_part, Utf8Path::new(RECOVERY_BOOT_MOUNT))?;
    bootsel::rewrite_root_selector(mnt.path(), &wanted)?;
    let now = bootsel::read_root_selector(mnt.path())?;
    mnt.close()?;
    if now != wanted {
        return Err(anyhow!("selector reads {now} after rewrite, expected {wanted}"));
    }
    tracing::info!("boot selector reverted to {wanted}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_dir_is_kept_by_strip() {
        assert!(crate::stages::STRIP_KEEP.contains(&RECOVERY_DIR));
    }
}
