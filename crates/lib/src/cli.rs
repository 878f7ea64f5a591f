//! The CLI entrypoint: one subcommand per stage, plus verification,
//! introspection and recovery.

use std::ffi::OsString;

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};

use crate::devices::{self, DeviceLayout};
use crate::{blockdev, bootsel, firmware, recovery, stages, verify};
use rootshift_mount::TempMount;

/// rootshift: migrate a microSD-booted node onto secondary storage.
#[derive(Debug, Parser)]
#[clap(name = "rootshift", version)]
pub(crate) struct Opts {
    /// The removable boot media the firmware reads at power-on.
    #[clap(long, global = true, default_value = "/dev/mmcblk0")]
    removable: Utf8PathBuf,

    /// The secondary fast device the OS runs from after migration.
    #[clap(long, global = true, default_value = "/dev/nvme0n1")]
    secondary: Utf8PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Args)]
struct ConfirmOpts {
    /// Confirmation phrase for the destructive operation; prompted for
    /// interactively when not given.
    #[clap(long)]
    confirm: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Configure the node for headless operation (non-graphical
    /// default target, no swap).
    Headless,
    /// Clone the OS from the removable media onto the secondary
    /// device. Destroys the secondary device's contents.
    Clone(ConfirmOpts),
    /// Point the bootloader at the cloned root on the secondary
    /// device.
    Repoint,
    /// Remove the redundant OS copy from the removable media, keeping
    /// only a minimal set of entries. Run this after rebooting onto
    /// the secondary device.
    Strip(ConfirmOpts),
    /// Apply pending OS updates.
    Update,
    /// Audit the migrated state against the full invariant checklist.
    /// Never mutates anything.
    Verify,
    /// Show the device layout, current root source and boot selector.
    Status,
    /// List and classify the firmware boot entries.
    BootEntries,
    /// Destructive recovery of the removable media.
    #[clap(subcommand)]
    Recover(RecoverCmd),
}

#[derive(Debug, Subcommand)]
enum RecoverCmd {
    /// Overwrite the removable media with a pristine image.
    Reimage {
        /// The image file to write.
        image: Utf8PathBuf,
        /// Also stage a copy of the image onto the freshly written
        /// media for future self-service recovery.
        #[clap(long)]
        stage_image: bool,
        #[clap(flatten)]
        confirm: ConfirmOpts,
    },
    /// Point the boot selector back at the removable media itself.
    RevertBoot,
}

/// Parse the provided arguments and execute the requested command.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let opts = Opts::parse_from(args);
    // Raw block devices and firmware variables are root-only.
    if !rustix::process::getuid().is_root() {
        return Err(anyhow!("This command requires root privileges"));
    }
    let layout = DeviceLayout {
        removable: opts.removable,
        secondary: opts.secondary,
    };
    match opts.cmd {
        Cmd::Headless => report_stage("headless", stages::headless_configure()?),
        Cmd::Clone(c) => report_stage(
            "clone",
            stages::clone_to_secondary(&layout, c.confirm)?,
        ),
        Cmd::Repoint => report_stage("repoint", stages::repoint_boot(&layout)?),
        Cmd::Strip(c) => report_stage(
            "strip",
            stages::strip_removable(&layout, c.confirm)?,
        ),
        Cmd::Update => report_stage("update", stages::apply_updates(&layout)?),
        Cmd::Verify => run_verify(&layout),
        Cmd::Status => status(&layout),
        Cmd::BootEntries => boot_entries(),
        Cmd::Recover(RecoverCmd::Reimage {
            image,
            stage_image,
            confirm,
        }) => {
            recovery::reimage(&layout, &image, stage_image, confirm.confirm)?;
            println!("reimage complete");
            Ok(())
        }
        Cmd::Recover(RecoverCmd::RevertBoot) => {
            recovery::revert_boot_selector(&layout)?;
            println!("boot selector reverted");
            Ok(())
        }
    }
}

fn report_stage(name: &str, outcome: stages::StageOutcome) -> Result<()> {
    println!("{name}: {}", outcome.message());
    Ok(())
}

fn run_verify(layout: &DeviceLayout) -> Result<()> {
    let results = verify::run_all(layout);
    let mut failed = 0usize;
    for r in &results {
        let mark = if r.passed { "ok  " } else { "FAIL" };
        println!("{mark} {:<36} {}", r.name, r.detail);
        if !r.passed {
            failed += 1;
        }
    }
    if failed > 0 {
        return Err(anyhow!("{failed} of {} checks failed", results.len()));
    }
    println!("all {} checks passed", results.len());
    Ok(())
}

const STATUS_BOOT_MOUNT: &str = "/run/rootshift/status-boot";

fn status(layout: &DeviceLayout) -> Result<()> {
    for dev in [&layout.removable, &layout.secondary] {
        let ident = devices::identify(layout, dev);
        match (blockdev::list_dev(dev), ident) {
            (Ok(d), Ok(ident)) => {
                println!(
                    "{}: {dev} model={} serial={} size={} removable={}",
                    ident.role,
                    d.model.as_deref().unwrap_or("-"),
                    d.serial.as_deref().unwrap_or("-"),
                    d.size,
                    d.rm.unwrap_or(false),
                );
                println!(
                    "    rootfs: fstype={} partuuid={}",
                    ident.fstype.as_deref().unwrap_or("-"),
                    ident.partuuid.as_deref().unwrap_or("-"),
                );
            }
            (Err(e), _) | (_, Err(e)) => println!("{dev}: unavailable: {e:#}"),
        }
    }
    let root = devices::current_root_source(layout)?;
    println!("root source: {root}");
    let boot_part = layout.removable_boot_partition()?;
    match TempMount::new(&boot_part, Utf8Path::new(STATUS_BOOT_MOUNT))
        .and_then(|mnt| {
            let r = bootsel::read_root_selector(mnt.path());
            mnt.close()?;
            r
        }) {
        Ok(selector) => println!("boot selector: {selector}"),
        Err(e) => println!("boot selector: unreadable: {e:#}"),
    }
    Ok(())
}

fn boot_entries() -> Result<()> {
    let entries = firmware::list_entries()?;
    if let Some(current) = entries.current {
        println!("BootCurrent: {current:04X}");
    }
    if !entries.order.is_empty() {
        let order: Vec<String> = entries.order.iter().map(|i| format!("{i:04X}")).collect();
        println!("BootOrder: {}", order.join(","));
    }
    let classified = firmware::classify_entries(&entries.entries);
    for e in &classified.standard {
        print_entry("standard ", e);
    }
    for e in &classified.anomalous {
        print_entry("ANOMALOUS", e);
    }
    Ok(())
}

fn print_entry(class: &str, e: &firmware::FirmwareBootEntry) {
    let active = if e.active { "*" } else { " " };
    match e.device_path.as_deref() {
        Some(path) => println!("{class} Boot{:04X}{active} {}\t{path}", e.index, e.label),
        None => println!("{class} Boot{:04X}{active} {}", e.index, e.label),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        let opts = Opts::parse_from(["rootshift", "verify"]);
        assert!(matches!(opts.cmd, Cmd::Verify));
        assert_eq!(opts.removable, "/dev/mmcblk0");
        assert_eq!(opts.secondary, "/dev/nvme0n1");

        let opts = Opts::parse_from([
            "rootshift",
            "--secondary",
            "/dev/sda",
            "clone",
            "--confirm",
            "overwrite /dev/sda",
        ]);
        assert_eq!(opts.secondary, "/dev/sda");
        match opts.cmd {
            Cmd::Clone(c) => assert_eq!(c.confirm.as_deref(), Some("overwrite /dev/sda")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_recover() {
        let opts = Opts::parse_from([
            "rootshift",
            "recover",
            "reimage",
            "/srv/base.img",
            "--stage-image",
        ]);
        match opts.cmd {
            Cmd::Recover(RecoverCmd::Reimage {
                image, stage_image, ..
            }) => {
                assert_eq!(image, "/srv/base.img");
                assert!(stage_image);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
