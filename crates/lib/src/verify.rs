//! The verifier: a non-destructive audit of everything the migration
//! is supposed to have established.
//!
//! Every invariant is evaluated independently and unconditionally; a
//! failing check never prevents the remaining checks from running,
//! because the point is a complete audit rather than fail-fast. An
//! error while evaluating a check marks that check failed with the
//! error as its detail.

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;

use crate::blockdev;
use crate::bootsel;
use crate::devices::{self, DeviceLayout, RootSource, ROOT_PARTNO};
use crate::firmware;
use crate::stages;
use rootshift_mount::TempMount;
use rootshift_utils::CommandRunExt;

/// The conventional mountpoint of the firmware boot partition.
pub(crate) const BOOT_MOUNTPOINT: &str = "/boot/firmware";
/// The non-graphical systemd default target expected on a headless node.
pub(crate) const HEADLESS_TARGET: &str = "multi-user.target";

/// Private mountpoints so verification never races with the stages'
/// own mounts.
const VERIFY_BOOT_MOUNT: &str = "/run/rootshift/verify-boot";
const VERIFY_SDROOT_MOUNT: &str = "/run/rootshift/verify-sdroot";

/// Result of evaluating one named invariant.
#[derive(Debug)]
pub(crate) struct CheckResult {
    /// Invariant name.
    pub(crate) name: &'static str,
    /// Whether the invariant held.
    pub(crate) passed: bool,
    /// Human-readable explanation of what was observed.
    pub(crate) detail: String,
}

fn run_check(
    name: &'static str,
    f: impl FnOnce() -> Result<(bool, String)>,
) -> CheckResult {
    match f() {
        Ok((passed, detail)) => CheckResult {
            name,
            passed,
            detail,
        },
        Err(e) => CheckResult {
            name,
            passed: false,
            detail: format!("check could not be evaluated: {e:#}"),
        },
    }
}

/// Evaluate the full invariant list. Read-only; repeated invocation is
/// always safe.
pub(crate) fn run_all(layout: &DeviceLayout) -> Vec<CheckResult> {
    vec![
        run_check("root-on-secondary", || check_root_on_secondary(layout)),
        run_check("boot-selector-points-at-secondary", || {
            boot_selector_repointed(layout)
        }),
        run_check("firmware-current-entry-is-removable", check_firmware_current),
        run_check("removable-root-stripped", || {
            removable_root_stripped(layout)
        }),
        run_check("boot-mount-from-removable-esp", || check_boot_mount(layout)),
        run_check("no-active-swap", no_active_swap),
        run_check("default-target-non-graphical", default_target_headless),
    ]
}

fn check_root_on_secondary(layout: &DeviceLayout) -> Result<(bool, String)> {
    let source = devices::current_root_source(layout)?;
    Ok((
        source == RootSource::Secondary,
        format!("root is backed by {source}"),
    ))
}

/// The PARTUUID of a device's root partition. For MBR tables this is
/// synthesized from the disk identifier, so it comes from lsblk (which
/// asks libblkid) rather than the partition table dump.
pub(crate) fn root_partuuid(dev: &Utf8Path) -> Result<Option<String>> {
    Ok(blockdev::list_dev(dev)?
        .partition(ROOT_PARTNO)
        .and_then(|p| p.partuuid.clone()))
}

/// The PARTUUID the selector must name: the secondary root partition's.
pub(crate) fn secondary_root_partuuid(layout: &DeviceLayout) -> Result<String> {
    root_partuuid(&layout.secondary)?
        .ok_or_else(|| anyhow!("secondary root partition has no PARTUUID"))
}

/// Whether the boot selector on the removable media points at the
/// secondary root partition. Shared with the stage preconditions.
pub(crate) fn boot_selector_repointed(layout: &DeviceLayout) -> Result<(bool, String)> {
    let wanted = bootsel::partuuid_selector(&secondary_root_partuuid(layout)?);
    let boot_part = layout.removable_boot_partition()?;
    let mnt = TempMount::new(&boot_part, Utf8Path::new(VERIFY_BOOT_MOUNT))?;
    let actual = bootsel::read_root_selector(mnt.path())?;
    mnt.close()?;
    Ok((
        actual == wanted,
        format!("selector is {actual}, secondary root is {wanted}"),
    ))
}

fn check_firmware_current() -> Result<(bool, String)> {
    let entries = firmware::list_entries()?;
    // The bootloader stage happens before firmware hand-off, so even a
    // fully migrated node still boots via the removable-media entry;
    // only a selector mismatch is a failure, never this.
    let Some(current) = entries.current_entry() else {
        return Ok((false, "firmware did not report a current boot entry".into()));
    };
    Ok((
        firmware::is_removable_media_label(&current.label),
        format!(
            "booted via Boot{:04X} ({})",
            current.index, current.label
        ),
    ))
}

/// Whether a directory tree has been reduced to the keep-list.
pub(crate) fn tree_reduced_to(dir: &Utf8Path, keep: &[&str]) -> Result<(bool, String)> {
    let mut extra = Vec::new();
    for entry in dir
        .read_dir_utf8()
        .with_context(|| format!("Reading {dir}"))?
    {
        let entry = entry.with_context(|| format!("Reading entry of {dir}"))?;
        let name = entry.file_name().to_owned();
        if !keep.contains(&name.as_str()) {
            extra.push(name);
        }
    }
    if extra.is_empty() {
        Ok((true, format!("only the keep-list remains: {}", keep.join(", "))))
    } else {
        extra.sort();
        Ok((false, format!("unexpected entries: {}", extra.join(", "))))
    }
}

/// Whether the removable media's root tree has been reduced to the
/// keep-list. Shared with the stage pre/postconditions.
pub(crate) fn removable_root_stripped(layout: &DeviceLayout) -> Result<(bool, String)> {
    let root_part = layout.removable_root_partition()?;
    let mnt = TempMount::new(&root_part, Utf8Path::new(VERIFY_SDROOT_MOUNT))?;
    let r = tree_reduced_to(mnt.path(), stages::STRIP_KEEP);
    mnt.close()?;
    r
}

fn check_boot_mount(layout: &DeviceLayout) -> Result<(bool, String)> {
    let esp = layout.removable_boot_partition()?;
    let fs = rootshift_mount::inspect_filesystem(Utf8Path::new(BOOT_MOUNTPOINT))?;
    Ok((
        fs.source == esp.as_str(),
        format!("{BOOT_MOUNTPOINT} is backed by {}", fs.source),
    ))
}

/// Parse the device list out of `/proc/swaps` contents.
pub(crate) fn parse_swaps(contents: &str) -> Vec<&str> {
    // First line is the column header
    contents
        .lines()
        .skip(1)
        .filter_map(|l| l.split_whitespace().next())
        .collect()
}

/// Whether no swap device is active. Shared with the headless stage.
pub(crate) fn no_active_swap() -> Result<(bool, String)> {
    let contents =
        std::fs::read_to_string("/proc/swaps").context("Reading /proc/swaps")?;
    let devices = parse_swaps(&contents);
    if devices.is_empty() {
        Ok((true, "no swap devices active".into()))
    } else {
        Ok((false, format!("active swap: {}", devices.join(", "))))
    }
}

/// Whether the default systemd target is the headless one. Shared
/// with the headless stage.
pub(crate) fn default_target_headless() -> Result<(bool, String)> {
    let target = Command::new("systemctl")
        .arg("get-default")
        .log_debug()
        .run_get_string()?;
    Ok((
        target == HEADLESS_TARGET,
        format!("default target is {target}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_check_error_counts_as_failure() {
        let r = run_check("example", || Err(anyhow!("boom")));
        assert!(!r.passed);
        assert!(r.detail.contains("boom"));
        assert_eq!(r.name, "example");
    }

    #[test]
    fn test_parse_swaps() {
        let none = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n";
        assert!(parse_swaps(none).is_empty());
        let some = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n/var/swap                               file\t\t102396\t\t0\t\t-2\n";
        assert_eq!(parse_swaps(some), ["/var/swap"]);
    }

    #[test]
    fn test_tree_reduced_to() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        std::fs::create_dir(dir.join("lost+found"))?;
        let (ok, _) = tree_reduced_to(dir, &["lost+found", "recovery"])?;
        assert!(ok);
        std::fs::write(dir.join("vmlinuz"), "x")?;
        let (ok, detail) = tree_reduced_to(dir, &["lost+found", "recovery"])?;
        assert!(!ok);
        assert!(detail.contains("vmlinuz"));
        Ok(())
    }
}
