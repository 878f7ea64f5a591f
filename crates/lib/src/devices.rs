//! Identifying the node's two storage devices and which one currently
//! backs the running root filesystem.
//!
//! Nothing in this module caches: the physical devices are the only
//! source of truth and can change between invocations, so every answer
//! is derived fresh from the kernel.

use std::fmt::Display;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::blockdev;
use rootshift_utils::CommandRunExt;

/// 1-based index of the boot (ESP) partition on the removable media.
pub(crate) const BOOT_PARTNO: u32 = 1;
/// 1-based index of the root partition on either device.
pub(crate) const ROOT_PARTNO: u32 = 2;

/// Where the two physical storage devices of the node live.
#[derive(Debug, Clone)]
pub(crate) struct DeviceLayout {
    /// The removable boot media the firmware reads at power-on.
    pub(crate) removable: Utf8PathBuf,
    /// The secondary fast device the OS is migrated to.
    pub(crate) secondary: Utf8PathBuf,
}

impl DeviceLayout {
    /// The boot (ESP) partition on the removable media. The bootloader
    /// configuration lives here, and the firmware keeps reading it from
    /// the removable device even after the root has moved.
    pub(crate) fn removable_boot_partition(&self) -> Result<Utf8PathBuf> {
        blockdev::partition_path(&self.removable, BOOT_PARTNO)
    }

    /// The root partition on the removable media.
    pub(crate) fn removable_root_partition(&self) -> Result<Utf8PathBuf> {
        blockdev::partition_path(&self.removable, ROOT_PARTNO)
    }

    /// The root partition on the secondary device.
    pub(crate) fn secondary_root_partition(&self) -> Result<Utf8PathBuf> {
        blockdev::partition_path(&self.secondary, ROOT_PARTNO)
    }
}

/// The role a device plays in the migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceRole {
    /// The small, slow media the firmware can read at power-on.
    RemovableBoot,
    /// The larger, faster device the OS is migrated to.
    SecondaryFast,
}

impl Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceRole::RemovableBoot => f.write_str("removable-boot"),
            DeviceRole::SecondaryFast => f.write_str("secondary-fast"),
        }
    }
}

/// The device backing `/` at this moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RootSource {
    /// Root is on the removable boot media.
    Removable,
    /// Root is on the secondary fast device.
    Secondary,
    /// Root is on something else entirely.
    Other(Utf8PathBuf),
}

impl Display for RootSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RootSource::Removable => f.write_str("removable boot media"),
            RootSource::Secondary => f.write_str("secondary storage"),
            RootSource::Other(dev) => write!(f, "unexpected device {dev}"),
        }
    }
}

/// Map a whole-disk device path onto the configured layout.
fn classify_root_device(disk: &Utf8Path, layout: &DeviceLayout) -> RootSource {
    if disk == layout.removable {
        RootSource::Removable
    } else if disk == layout.secondary {
        RootSource::Secondary
    } else {
        RootSource::Other(disk.to_owned())
    }
}

/// Determine which physical device backs the running root filesystem.
///
/// This is the single fact every safety guard depends on, so it is
/// always computed from the live mount table at the moment it is
/// needed.
#[context("Determining current root source")]
pub(crate) fn current_root_source(layout: &DeviceLayout) -> Result<RootSource> {
    let rootfs = rootshift_mount::inspect_filesystem(Utf8Path::new("/"))?;
    let source = Utf8PathBuf::from(&rootfs.source);
    let parents = blockdev::find_parent_devices(&source)
        .with_context(|| format!("Resolving parent device of {source}"))?;
    // A root on device-mapper or similar stacks could have several
    // parents; the layout assumes plain partitions, so take the first.
    let disk = parents.into_iter().next().unwrap_or(source);
    let classified = classify_root_device(&disk, layout);
    tracing::debug!("root is backed by {disk} ({classified})");
    Ok(classified)
}

/// Ask the kernel to re-read a device's partition table, needed after
/// the table was rewritten behind its back.
#[context("Re-reading partition table of {dev}")]
pub(crate) fn reread_partitions(dev: &Utf8Path) -> Result<()> {
    Command::new("blockdev")
        .args(["--rereadpt", dev.as_str()])
        .log_debug()
        .run()
}

/// Identity of a device's root partition.
#[derive(Debug)]
pub(crate) struct DeviceIdentity {
    /// Partition UUID of the root partition.
    pub(crate) partuuid: Option<String>,
    /// Filesystem type of the root partition.
    pub(crate) fstype: Option<String>,
    /// The role the configured layout assigns to this device.
    pub(crate) role: DeviceRole,
}

/// Identify a device's root partition and role. The role comes from
/// the configured layout, never from a hard-coded path comparison at a
/// decision site; destructive callers re-validate the live root source
/// separately.
#[context("Identifying {dev}")]
pub(crate) fn identify(layout: &DeviceLayout, dev: &Utf8Path) -> Result<DeviceIdentity> {
    let role = if dev == layout.removable {
        DeviceRole::RemovableBoot
    } else if dev == layout.secondary {
        DeviceRole::SecondaryFast
    } else {
        return Err(anyhow!("{dev} is not part of the configured layout"));
    };
    let parent = blockdev::list_dev(dev)?;
    let root = parent.partition(ROOT_PARTNO);
    Ok(DeviceIdentity {
        partuuid: root.and_then(|p| p.partuuid.clone()),
        fstype: root.and_then(|p| p.fstype.clone()),
        role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> DeviceLayout {
        DeviceLayout {
            removable: "/dev/mmcblk0".into(),
            secondary: "/dev/nvme0n1".into(),
        }
    }

    #[test]
    fn test_classify_root_device() {
        let layout = layout();
        assert_eq!(
            classify_root_device(Utf8Path::new("/dev/mmcblk0"), &layout),
            RootSource::Removable
        );
        assert_eq!(
            classify_root_device(Utf8Path::new("/dev/nvme0n1"), &layout),
            RootSource::Secondary
        );
        assert_eq!(
            classify_root_device(Utf8Path::new("/dev/sdb"), &layout),
            RootSource::Other("/dev/sdb".into())
        );
    }

    #[test]
    fn test_layout_partitions() -> Result<()> {
        let layout = layout();
        assert_eq!(layout.removable_boot_partition()?, "/dev/mmcblk0p1");
        assert_eq!(layout.removable_root_partition()?, "/dev/mmcblk0p2");
        assert_eq!(layout.secondary_root_partition()?, "/dev/nvme0n1p2");
        Ok(())
    }
}
