//! The forward migration stages.
//!
//! The states run strictly forward: HeadlessConfigured, Cloned,
//! BootRepointed, Stripped, Updated, Verified. Each stage derives its
//! precondition from the physical devices (never from a persisted
//! marker), acts only through the guarded executor and the accessors,
//! and asserts its postcondition before reporting success. There is no
//! reverse edge; returning to an earlier state is the recovery
//! controller's job.
//!
//! A stage whose postcondition already holds reports success without
//! doing anything, so the sequence can be safely re-invoked after a
//! failure.

use std::io::Read;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::blockdev::{self, PartitionType};
use crate::bootsel;
use crate::devices::{self, DeviceLayout, ROOT_PARTNO};
use crate::guard::{self, Guard, HostRunner, LiveProbe, Operation};
use crate::verify;
use rootshift_mount::TempMount;
use rootshift_utils::CommandRunExt;

/// Top-level names preserved on the removable media's root partition
/// by the strip stage. `recovery` is where the recovery controller may
/// stage a self-service image.
pub(crate) const STRIP_KEEP: &[&str] = &["lost+found", "recovery"];

/// Private mountpoints used while staging.
const STAGE_BOOT_MOUNT: &str = "/run/rootshift/boot";
const STAGE_SDROOT_MOUNT: &str = "/run/rootshift/sdroot";
const CLONE_ROOT_MOUNT: &str = "/run/rootshift/cloneroot";

/// How a stage finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageOutcome {
    /// The postcondition already held; nothing was done.
    AlreadyDone,
    /// Work was performed and the postcondition now holds.
    Completed,
}

impl StageOutcome {
    /// One-line message for the operator.
    pub(crate) fn message(&self) -> &'static str {
        match self {
            StageOutcome::AlreadyDone => "already satisfied; nothing to do",
            StageOutcome::Completed => "complete",
        }
    }
}

/// Configure the node for headless operation: non-graphical default
/// target and no swap.
#[context("Configuring headless operation")]
pub(crate) fn headless_configure() -> Result<StageOutcome> {
    if headless_configured()? {
        return Ok(StageOutcome::AlreadyDone);
    }
    Command::new("systemctl")
        .args(["set-default", verify::HEADLESS_TARGET])
        .log_debug()
        .run()?;
    // Masking swap.target keeps swap units from coming back on reboot.
    Command::new("systemctl")
        .args(["mask", "--now", "swap.target"])
        .log_debug()
        .run()?;
    Command::new("swapoff").arg("-a").log_debug().run()?;
    if !headless_configured()? {
        return Err(anyhow!("postcondition does not hold after configuration"));
    }
    Ok(StageOutcome::Completed)
}

fn headless_configured() -> Result<bool> {
    let (target_ok, _) = verify::default_target_headless()?;
    let (swap_ok, _) = verify::no_active_swap()?;
    Ok(target_ok && swap_ok)
}

/// Whether the secondary device carries a clone of the removable
/// media: same table kind, at least the same partitions, a filesystem
/// signature on its root partition, and a disk identity of its own.
pub(crate) fn cloned(layout: &DeviceLayout) -> Result<(bool, String)> {
    let src = blockdev::partitions_of(&layout.removable)?;
    let dest = match blockdev::partitions_of(&layout.secondary) {
        Ok(t) => t,
        Err(e) => {
            return Ok((
                false,
                format!("no partition table on {}: {e:#}", layout.secondary),
            ))
        }
    };
    if dest.label != src.label || dest.partitions.len() < src.partitions.len() {
        return Ok((
            false,
            format!(
                "partition table of {} does not mirror {}",
                layout.secondary, layout.removable
            ),
        ));
    }
    if dest.find_partno(ROOT_PARTNO)?.size < src.find_partno(ROOT_PARTNO)?.size {
        return Ok((
            false,
            format!(
                "root partition of {} is smaller than the source's",
                layout.secondary
            ),
        ));
    }
    let dest_dev = blockdev::list_dev(&layout.secondary)?;
    let root_fs = dest_dev
        .partition(ROOT_PARTNO)
        .and_then(|p| p.fstype.as_deref());
    if root_fs.is_none() {
        return Ok((
            false,
            format!("no filesystem signature on the root partition of {}", layout.secondary),
        ));
    }
    // A fresh block clone still shares the source's disk identifier;
    // the stage randomizes it before the postcondition can hold.
    let src_root_uuid = verify::root_partuuid(&layout.removable)?;
    let dest_root_uuid = dest_dev
        .partition(ROOT_PARTNO)
        .and_then(|p| p.partuuid.clone());
    if dest_root_uuid.is_none() || dest_root_uuid == src_root_uuid {
        return Ok((
            false,
            format!("{} has no distinct partition identity yet", layout.secondary),
        ));
    }
    Ok((true, format!("{} carries a clone with its own identity", layout.secondary)))
}

/// Clone the OS from the removable media onto the secondary device.
#[context("Cloning removable media onto secondary storage")]
pub(crate) fn clone_to_secondary(
    layout: &DeviceLayout,
    confirm: Option<String>,
) -> Result<StageOutcome> {
    let (done, detail) = cloned(layout)?;
    if done {
        tracing::info!("{detail}");
        return Ok(StageOutcome::AlreadyDone);
    }
    if !headless_configured()? {
        return Err(anyhow!(
            "precondition violated: the node is not configured for headless \
             operation yet; run the headless stage first"
        ));
    }
    // Fail fast on prerequisites before any prompt or guard.
    let src = blockdev::list_dev(&layout.removable)?;
    let dest = blockdev::list_dev(&layout.secondary)?;
    if dest.size < src.size {
        return Err(anyhow!(
            "secondary device {} ({} bytes) is smaller than the removable media ({} bytes)",
            layout.secondary,
            dest.size,
            src.size
        ));
    }
    let op = Operation::BlockClone {
        source: layout.removable.clone(),
        dest: layout.secondary.clone(),
    };
    let confirm = guard::resolve_confirmation(confirm, &op)?;
    let outcome = guard::execute(
        &op,
        Guard::RootOnRemovable,
        &confirm,
        &LiveProbe { layout },
        &mut HostRunner,
    )?;
    tracing::info!("{}", outcome.summary);
    // Give the clone its own identity so PARTUUID selectors are
    // unambiguous between the two devices.
    randomize_disk_id(&layout.secondary)?;
    devices::reread_partitions(&layout.secondary)?;
    let (ok, detail) = cloned(layout)?;
    if !ok {
        return Err(anyhow!("postcondition does not hold: {detail}"));
    }
    Ok(StageOutcome::Completed)
}

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut b = [0u8; N];
    std::fs::File::open("/dev/urandom")
        .context("Opening /dev/urandom")?
        .read_exact(&mut b)
        .context("Reading /dev/urandom")?;
    Ok(b)
}

fn format_uuid(mut b: [u8; 16]) -> String {
    // RFC 4122 version 4
    b[6] = (b[6] & 0x0f) | 0x40;
    b[8] = (b[8] & 0x3f) | 0x80;
    let hex: String = b.iter().map(|x| format!("{x:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[context("Randomizing disk identifier of {dev}")]
fn randomize_disk_id(dev: &Utf8Path) -> Result<()> {
    let table = blockdev::partitions_of(dev)?;
    let id = match table.label {
        PartitionType::Dos => format!("0x{:08x}", u32::from_be_bytes(random_bytes()?)),
        PartitionType::Gpt | PartitionType::Unknown(_) => format_uuid(random_bytes()?),
    };
    Command::new("sfdisk")
        .args(["--disk-id", dev.as_str(), &id])
        .log_debug()
        .run()
}

/// Point the bootloader at the cloned root and fix the clone's fstab
/// so the migrated system mounts itself by its own identifier.
#[context("Repointing boot selector to the cloned root")]
pub(crate) fn repoint_boot(layout: &DeviceLayout) -> Result<StageOutcome> {
    let (ok, detail) = cloned(layout)?;
    if !ok {
        return Err(anyhow!(
            "precondition violated: no clone on secondary storage ({detail})"
        ));
    }
    let wanted = bootsel::partuuid_selector(&verify::secondary_root_partuuid(layout)?);

    // Patch the clone's fstab; harmless to re-apply.
    let root_part = layout.secondary_root_partition()?;
    let mnt = TempMount::new(&root_part, Utf8Path::new(CLONE_ROOT_MOUNT))?;
    bootsel::rewrite_fstab_root(mnt.path(), &wanted)?;
    mnt.close()?;

    // Mount the removable boot partition explicitly. After migration
    // the conventional boot path may be backed by a stale copy, so the
    // selector is only ever edited on this specific partition.
    let boot_part = layout.removable_boot_partition()?;
    let mnt = TempMount::new(&boot_part, Utf8Path::new(STAGE_BOOT_MOUNT))?;
    let current = bootsel::read_root_selector(mnt.path())?;
    if current == wanted {
        mnt.close()?;
        return Ok(StageOutcome::AlreadyDone);
    }
    bootsel::rewrite_root_selector(mnt.path(), &wanted)?;
    let now = bootsel::read_root_selector(mnt.path())?;
    mnt.close()?;
    if now != wanted {
        return Err(anyhow!(
            "postcondition does not hold: selector reads {now}, expected {wanted}"
        ));
    }
    tracing::info!("boot selector now {wanted}; the next boot hands off to {root_part}");
    Ok(StageOutcome::Completed)
}

/// Remove the redundant OS copy from the removable media, leaving only
/// the keep-list.
#[context("Stripping the redundant copy from removable media")]
pub(crate) fn strip_removable(
    layout: &DeviceLayout,
    confirm: Option<String>,
) -> Result<StageOutcome> {
    // Precondition: the selector must already point away from the
    // media whose copy is about to be deleted.
    let (repointed, detail) = verify::boot_selector_repointed(layout)?;
    if !repointed {
        return Err(anyhow!(
            "precondition violated: boot selector still points at the removable media ({detail})"
        ));
    }
    let root_part = layout.removable_root_partition()?;
    let mnt = TempMount::new(&root_part, Utf8Path::new(STAGE_SDROOT_MOUNT))?;
    let (already, _) = verify::tree_reduced_to(mnt.path(), STRIP_KEEP)?;
    if already {
        mnt.close()?;
        return Ok(StageOutcome::AlreadyDone);
    }
    let op = Operation::DeleteExcept {
        dir: mnt.path().to_owned(),
        keep: STRIP_KEEP.iter().map(|s| s.to_string()).collect(),
    };
    let confirm = guard::resolve_confirmation(confirm, &op)?;
    guard::execute(
        &op,
        Guard::RootOnSecondary,
        &confirm,
        &LiveProbe { layout },
        &mut HostRunner,
    )?;
    let (ok, detail) = verify::tree_reduced_to(mnt.path(), STRIP_KEEP)?;
    mnt.close()?;
    if !ok {
        return Err(anyhow!("postcondition does not hold: {detail}"));
    }
    Ok(StageOutcome::Completed)
}

/// Apply pending OS updates. The package subsystem is an opaque
/// collaborator; nothing beyond its exit status is inspected, and
/// accordingly this stage has no postcondition of its own.
#[context("Applying pending OS updates")]
pub(crate) fn apply_updates(layout: &DeviceLayout) -> Result<StageOutcome> {
    let (stripped, detail) = verify::removable_root_stripped(layout)?;
    if !stripped {
        return Err(anyhow!(
            "precondition violated: removable media is not yet stripped ({detail})"
        ));
    }
    Command::new("apt-get")
        .arg("update")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .log_debug()
        .run_inherited()?;
    Command::new("apt-get")
        .args(["full-upgrade", "-y"])
        .env("DEBIAN_FRONTEND", "noninteractive")
        .log_debug()
        .run_inherited()?;
    Ok(StageOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uuid() {
        let b = [0u8; 16];
        let u = format_uuid(b);
        assert_eq!(u, "00000000-0000-4000-8000-000000000000");
        let b = [0xff; 16];
        let u = format_uuid(b);
        assert_eq!(u, "ffffffff-ffff-4fff-bfff-ffffffffffff");
    }

    #[test]
    fn test_stage_outcome_messages() {
        assert_eq!(
            StageOutcome::AlreadyDone.message(),
            "already satisfied; nothing to do"
        );
        assert_eq!(StageOutcome::Completed.message(), "complete");
    }
}
