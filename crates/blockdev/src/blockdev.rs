//! Thin wrappers for querying block devices via util-linux.
//!
//! Everything here shells out to `lsblk`/`sfdisk` and parses their JSON
//! output; nothing is cached. Callers are expected to re-query rather
//! than hold on to a [`Device`] across operations, because the physical
//! devices backing these paths can change between invocations.

use std::collections::HashMap;
use std::process::Command;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;
use serde::Deserialize;

use rootshift_utils::CommandRunExt;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device (or partition) as reported by `lsblk`.
#[derive(Debug, Deserialize)]
pub struct Device {
    /// Kernel device name, e.g. `mmcblk0` or `nvme0n1p2`.
    pub name: String,
    /// Hardware serial number, if the device reports one.
    pub serial: Option<String>,
    /// Device model string.
    pub model: Option<String>,
    /// Whether the kernel considers the device removable.
    pub rm: Option<bool>,
    /// Partition UUID (for partitions on GPT/MBR tables).
    pub partuuid: Option<String>,
    /// Filesystem UUID, if a filesystem signature is present.
    pub uuid: Option<String>,
    /// Filesystem label.
    pub label: Option<String>,
    /// Filesystem type, e.g. `ext4` or `vfat`.
    pub fstype: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Canonical device path; not reported by older util-linux.
    pub path: Option<String>,
    /// Child devices (partitions), if any.
    pub children: Option<Vec<Device>>,
}

impl Device {
    /// Canonical path to the device node. Older lsblk doesn't have PATH,
    /// so fall back to the conventional /dev location.
    pub fn path(&self) -> Utf8PathBuf {
        self.path
            .as_deref()
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| format!("/dev/{}", self.name).into())
    }

    /// Find the child partition with the given (1-based) index.
    pub fn partition(&self, partno: u32) -> Option<&Device> {
        let name = partition_name(&self.name, partno);
        self.children
            .iter()
            .flatten()
            .find(|c| c.name == name)
    }
}

/// Query a single device (and its partitions).
#[context("Listing device {dev}")]
pub fn list_dev(dev: &Utf8Path) -> Result<Device> {
    let devs: DevicesOutput = Command::new("lsblk")
        .args(["-J", "-b", "-O"])
        .arg(dev)
        .log_debug()
        .run_and_parse_json()?;
    devs.blockdevices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

/// Compute the kernel name of partition `partno` of `parent`. Devices
/// whose name ends in a digit get a `p` separator (`mmcblk0p2`,
/// `nvme0n1p2`); others do not (`sda2`).
pub fn partition_name(parent: &str, partno: u32) -> String {
    if parent.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{parent}p{partno}")
    } else {
        format!("{parent}{partno}")
    }
}

/// Compute the path of partition `partno` of the device at `dev`.
pub fn partition_path(dev: &Utf8Path, partno: u32) -> Result<Utf8PathBuf> {
    let name = dev
        .file_name()
        .ok_or_else(|| anyhow!("Invalid device path: {dev}"))?;
    let parent = dev
        .parent()
        .ok_or_else(|| anyhow!("Invalid device path: {dev}"))?;
    Ok(parent.join(partition_name(name, partno)))
}

#[derive(Debug, Deserialize)]
struct SfDiskOutput {
    partitiontable: PartitionTable,
}

/// One partition from an sfdisk partition table dump.
#[derive(Debug, Deserialize)]
pub struct Partition {
    /// Device node for the partition.
    pub node: String,
    /// Starting sector.
    pub start: u64,
    /// Size in sectors.
    pub size: u64,
    /// Partition type GUID (GPT) or type byte (MBR).
    #[serde(rename = "type")]
    pub parttype: String,
    /// Partition UUID.
    pub uuid: Option<String>,
    /// Partition name/label.
    pub name: Option<String>,
}

/// The kind of partition table on a device.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    /// An MBR ("dos") partition table.
    Dos,
    /// A GPT partition table.
    Gpt,
    /// Anything else.
    #[serde(untagged)]
    Unknown(String),
}

/// A device's partition table as reported by `sfdisk -J`.
#[derive(Debug, Deserialize)]
pub struct PartitionTable {
    /// Table kind.
    pub label: PartitionType,
    /// Disk identifier; for MBR tables the source of PARTUUIDs.
    pub id: String,
    /// Device the table lives on.
    pub device: String,
    /// The partitions, in table order.
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Find the partition with the given offset (starting at 1).
    pub fn find_partno(&self, partno: u32) -> Result<&Partition> {
        let idx = partno
            .checked_sub(1)
            .ok_or_else(|| anyhow!("Invalid 1-based partition offset {partno}"))?;
        self.partitions
            .get(idx as usize)
            .ok_or_else(|| anyhow!("Missing partition for index {partno} on {}", self.device))
    }
}

/// Query the partition table of a device.
#[context("Listing partitions of {dev}")]
pub fn partitions_of(dev: &Utf8Path) -> Result<PartitionTable> {
    let o: SfDiskOutput = Command::new("sfdisk")
        .args(["-J", dev.as_str()])
        .log_debug()
        .run_and_parse_json()?;
    Ok(o.partitiontable)
}

/// Parse key-value pairs from lsblk --pairs.
/// Newer versions of lsblk support JSON but the one in CentOS 7 doesn't.
fn split_lsblk_line(line: &str) -> HashMap<String, String> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r#"([A-Z-_]+)="([^"]+)""#).unwrap());
    let mut fields: HashMap<String, String> = HashMap::new();
    for cap in regex.captures_iter(line) {
        fields.insert(cap[1].to_string(), cap[2].to_string());
    }
    fields
}

/// Return every whole-disk block device in the parent hierarchy of
/// `device`. For a partition this is the disk containing it; partitions
/// in the chain are skipped.
#[context("Finding parent devices of {device}")]
pub fn find_parent_devices(device: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let output = Command::new("lsblk")
        // Older lsblk, e.g. in CentOS 7.6, doesn't support PATH, but --paths option
        .args(["--pairs", "--paths", "--inverse", "--output", "NAME,TYPE"])
        .arg(device)
        .log_debug()
        .run_get_string()?;
    let mut parents = Vec::new();
    // skip first line, which is the device itself
    for line in output.lines().skip(1) {
        let dev = split_lsblk_line(line);
        let name = dev
            .get("NAME")
            .with_context(|| format!("device in hierarchy of {device} missing NAME"))?;
        let kind = dev
            .get("TYPE")
            .with_context(|| format!("device in hierarchy of {device} missing TYPE"))?;
        if kind == "disk" || kind == "loop" {
            parents.push(name.into());
        }
    }
    Ok(parents)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partition_name() {
        assert_eq!(partition_name("mmcblk0", 2), "mmcblk0p2");
        assert_eq!(partition_name("nvme0n1", 1), "nvme0n1p1");
        assert_eq!(partition_name("sda", 2), "sda2");
    }

    #[test]
    fn test_partition_path() -> Result<()> {
        assert_eq!(
            partition_path(Utf8Path::new("/dev/mmcblk0"), 1)?,
            Utf8Path::new("/dev/mmcblk0p1")
        );
        assert_eq!(
            partition_path(Utf8Path::new("/dev/sda"), 2)?,
            Utf8Path::new("/dev/sda2")
        );
        Ok(())
    }

    #[test]
    fn test_parse_lsblk() {
        let fixture = include_str!("../tests/fixtures/lsblk.json");
        let devs: DevicesOutput = serde_json::from_str(fixture).unwrap();
        let dev = devs.blockdevices.into_iter().next().unwrap();
        assert_eq!(dev.name, "mmcblk0");
        assert_eq!(dev.rm, Some(true));
        let boot = dev.partition(1).unwrap();
        assert_eq!(boot.fstype.as_deref(), Some("vfat"));
        assert_eq!(boot.path(), Utf8Path::new("/dev/mmcblk0p1"));
        let root = dev.partition(2).unwrap();
        assert_eq!(root.fstype.as_deref(), Some("ext4"));
        assert_eq!(
            root.partuuid.as_deref(),
            Some("5f1d4e2a-02")
        );
        assert!(dev.partition(3).is_none());
    }

    #[test]
    fn test_parse_sfdisk() -> Result<()> {
        let fixture = indoc::indoc! { r#"
        {
            "partitiontable": {
               "label": "dos",
               "id": "0x5f1d4e2a",
               "device": "/dev/mmcblk0",
               "unit": "sectors",
               "sectorsize": 512,
               "partitions": [
                  {
                     "node": "/dev/mmcblk0p1",
                     "start": 8192,
                     "size": 1048576,
                     "type": "c",
                     "uuid": "5f1d4e2a-01"
                  },{
                     "node": "/dev/mmcblk0p2",
                     "start": 1056768,
                     "size": 61433856,
                     "type": "83",
                     "uuid": "5f1d4e2a-02"
                  }
               ]
            }
         }
        "# };
        let table: SfDiskOutput = serde_json::from_str(fixture).unwrap();
        let table = table.partitiontable;
        assert_eq!(table.label, PartitionType::Dos);
        assert_eq!(table.find_partno(2)?.size, 61433856);
        assert!(table.find_partno(3).is_err());
        Ok(())
    }
}
