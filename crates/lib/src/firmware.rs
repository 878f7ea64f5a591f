//! Reading and classifying firmware boot entries.
//!
//! The entries live in firmware NVRAM, outside any filesystem. This
//! module only ever reads and classifies them; rewriting `BootOrder`
//! or deleting entries is deliberately out of scope, so a surprising
//! entry is data to report, not an error and not something to fix.

use std::process::Command;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use fn_error_context::context;
use regex::Regex;

use rootshift_utils::CommandRunExt;

/// A single firmware boot entry.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct FirmwareBootEntry {
    /// NVRAM index (the NNNN in BootNNNN).
    pub(crate) index: u16,
    /// Human-readable label.
    pub(crate) label: String,
    /// Whether the entry is active (the `*` in efibootmgr output).
    pub(crate) active: bool,
    /// Firmware device path, when reported.
    pub(crate) device_path: Option<String>,
}

/// Everything the firmware reports about its boot entries.
#[derive(Debug)]
pub(crate) struct BootEntries {
    /// The entry used for the current boot.
    pub(crate) current: Option<u16>,
    /// The firmware's preference list for the next boot.
    pub(crate) order: Vec<u16>,
    /// All entries, in NVRAM order.
    pub(crate) entries: Vec<FirmwareBootEntry>,
}

impl BootEntries {
    /// The entry that produced the current boot, if identifiable.
    pub(crate) fn current_entry(&self) -> Option<&FirmwareBootEntry> {
        let current = self.current?;
        self.entries.iter().find(|e| e.index == current)
    }
}

/// Enumerate the firmware boot entries.
#[context("Listing firmware boot entries")]
pub(crate) fn list_entries() -> Result<BootEntries> {
    let output = Command::new("efibootmgr")
        .arg("-v")
        .log_debug()
        .run_get_string()?;
    parse_efibootmgr(&output)
}

fn parse_efibootmgr(output: &str) -> Result<BootEntries> {
    static ENTRY: OnceLock<Regex> = OnceLock::new();
    let entry_re = ENTRY
        .get_or_init(|| Regex::new(r"^Boot([0-9A-Fa-f]{4})(\*?)\s+(.*)$").unwrap());

    let mut current = None;
    let mut order = Vec::new();
    let mut entries = Vec::new();
    for line in output.lines() {
        if let Some(value) = line.strip_prefix("BootCurrent:") {
            current = Some(parse_index(value.trim())?);
        } else if let Some(value) = line.strip_prefix("BootOrder:") {
            order = value
                .trim()
                .split(',')
                .map(|v| parse_index(v.trim()))
                .collect::<Result<Vec<_>>>()?;
        } else if let Some(cap) = entry_re.captures(line) {
            let index = parse_index(&cap[1])?;
            // efibootmgr -v separates label and device path with a tab
            let rest = &cap[3];
            let (label, device_path) = match rest.split_once('\t') {
                Some((label, path)) => (label, Some(path.to_string())),
                None => (rest, None),
            };
            entries.push(FirmwareBootEntry {
                index,
                label: label.trim_end().to_string(),
                active: &cap[2] == "*",
                device_path,
            });
        }
    }
    Ok(BootEntries {
        current,
        order,
        entries,
    })
}

fn parse_index(s: &str) -> Result<u16> {
    u16::from_str_radix(s, 16).with_context(|| format!("Parsing boot entry index {s:?}"))
}

/// Classification of one entry against the vendor allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryClass {
    /// A label the firmware creates on its own.
    Standard,
    /// Anything else; someone or something added it to NVRAM.
    Anomalous,
}

/// Labels the firmware creates on its own: the setup menu, the boot
/// manager menu and the shell.
const STANDARD_LABELS: &[&str] = &["UiApp", "Boot Manager Menu", "UEFI Shell"];
/// Auto-generated media and network entries carry the model or MAC in
/// the label, so these are matched by prefix: `UEFI PXEv4 (MAC:...)`,
/// `UEFI HTTPv6 (...)`, `UEFI Misc Device`, `UEFI Samsung SSD ...`,
/// `SD/MMC on Arasan SDHCI`.
const STANDARD_LABEL_PREFIXES: &[&str] = &["UEFI ", "SD/MMC"];

/// Classify a single entry label. Total: every label is either
/// standard or anomalous.
pub(crate) fn classify(label: &str) -> EntryClass {
    if STANDARD_LABELS.contains(&label)
        || STANDARD_LABEL_PREFIXES.iter().any(|p| label.starts_with(p))
    {
        EntryClass::Standard
    } else {
        EntryClass::Anomalous
    }
}

/// Entries partitioned by classification.
#[derive(Debug)]
pub(crate) struct Classified<'a> {
    /// Entries matching the vendor allow-list.
    pub(crate) standard: Vec<&'a FirmwareBootEntry>,
    /// Everything else.
    pub(crate) anomalous: Vec<&'a FirmwareBootEntry>,
}

/// Partition entries into standard and anomalous sets.
pub(crate) fn classify_entries(entries: &[FirmwareBootEntry]) -> Classified<'_> {
    let mut r = Classified {
        standard: Vec::new(),
        anomalous: Vec::new(),
    };
    for e in entries {
        match classify(&e.label) {
            EntryClass::Standard => r.standard.push(e),
            EntryClass::Anomalous => r.anomalous.push(e),
        }
    }
    r
}

/// Whether a label names the firmware's removable-media entry. The
/// bootloader stage runs before firmware hand-off, so this remains the
/// expected current entry even after the root has migrated.
pub(crate) fn is_removable_media_label(label: &str) -> bool {
    label.starts_with("SD/MMC") || label == "UEFI Misc Device"
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = indoc::indoc! { "
        BootCurrent: 0004
        Timeout: 3 seconds
        BootOrder: 0004,0000,0001,0002,0003,0005,0006
        Boot0000* UiApp\tFvVol(9a15aa37-d555-4a4e-b541-86391ff68164)/FvFile(462caa21-7614-4503-836e-8ab6f4662331)
        Boot0001* UEFI Misc Device\tVenHw(93e34c7e-b50e-11df-9223-2443dfd72085,00)
        Boot0002* UEFI PXEv4 (MAC:DCA632123456)\tMAC(dca632123456,0x1)/IPv4(0.0.0.00.0.0.0,0,0)
        Boot0003* UEFI Shell\tFvVol(9a15aa37-d555-4a4e-b541-86391ff68164)/FvFile(7c04a583-9e3e-4f1c-ad65-e05268d0b4d1)
        Boot0004* SD/MMC on Arasan SDHCI\tVenHw(100c2cfa-b586-4198-9b4c-1683d195b1da)
        Boot0005* UEFI Samsung SSD 970 EVO 500GB\tNVMe(0x1,00-25-38-5B-91-51-26-00)
        Boot0006* debian\tHD(1,GPT,8c173710-0f4b-4388-a2d8-0a18be0e5a0f)/File(\\EFI\\debian\\shimaa64.efi)
    " };

    #[test]
    fn test_parse_efibootmgr() -> Result<()> {
        let parsed = parse_efibootmgr(FIXTURE)?;
        assert_eq!(parsed.current, Some(4));
        assert_eq!(parsed.order, vec![4, 0, 1, 2, 3, 5, 6]);
        assert_eq!(parsed.entries.len(), 7);
        let current = parsed.current_entry().unwrap();
        assert_eq!(current.label, "SD/MMC on Arasan SDHCI");
        assert!(current.active);
        assert!(current.device_path.as_deref().unwrap().starts_with("VenHw"));
        Ok(())
    }

    #[test]
    fn test_parse_without_device_paths() -> Result<()> {
        // Output without -v has no device path column
        let parsed = parse_efibootmgr("BootCurrent: 0000\nBoot0000* UiApp\n")?;
        assert_eq!(parsed.entries[0].device_path, None);
        assert_eq!(parsed.entries[0].label, "UiApp");
        Ok(())
    }

    #[test]
    fn test_inactive_entry() -> Result<()> {
        let parsed = parse_efibootmgr("Boot0007 old entry\n")?;
        assert!(!parsed.entries[0].active);
        assert_eq!(parsed.current, None);
        Ok(())
    }

    #[test]
    fn test_classification_is_total() -> Result<()> {
        let parsed = parse_efibootmgr(FIXTURE)?;
        let classified = classify_entries(&parsed.entries);
        // Every entry lands in exactly one bucket
        assert_eq!(
            classified.standard.len() + classified.anomalous.len(),
            parsed.entries.len()
        );
        for e in &parsed.entries {
            let in_standard = classified.standard.iter().any(|s| s.index == e.index);
            let in_anomalous = classified.anomalous.iter().any(|s| s.index == e.index);
            assert!(in_standard != in_anomalous, "entry {e:?} in both/neither");
        }
        // The custom NVRAM entry is the anomaly
        assert_eq!(classified.anomalous.len(), 1);
        assert_eq!(classified.anomalous[0].label, "debian");
        Ok(())
    }

    #[test]
    fn test_is_removable_media_label() {
        assert!(is_removable_media_label("SD/MMC on Arasan SDHCI"));
        assert!(is_removable_media_label("UEFI Misc Device"));
        assert!(!is_removable_media_label("UEFI Samsung SSD 970 EVO 500GB"));
        assert!(!is_removable_media_label("debian"));
    }
}
