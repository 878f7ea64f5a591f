//! Reading and rewriting the bootloader's root selector.
//!
//! The selector is the `root=` token in `cmdline.txt` on the removable
//! device's boot partition. The firmware reads that file from the
//! removable media at power-on regardless of what currently backs `/`,
//! so this module always mounts that specific partition explicitly
//! instead of trusting the conventional boot path, which post-migration
//! may be a stale copy.
//!
//! Rewriting is a splice of the one selector token; every other
//! directive in the file is preserved byte-for-byte.

use std::io::Write;
use std::ops::Range;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

/// The bootloader configuration file on the boot partition.
pub(crate) const BOOT_CONFIG: &str = "cmdline.txt";
/// The key of the root-device selector within the config.
const SELECTOR_KEY: &str = "root=";

/// Iterate over whitespace-separated tokens with their byte ranges.
/// Double quotes protect embedded whitespace, as the kernel's own
/// command line parsing does.
fn token_spans(contents: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = None;
    let mut in_quotes = false;
    for (i, c) in contents.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
        }
        if !in_quotes && c.is_ascii_whitespace() {
            if let Some(s) = start.take() {
                spans.push(s..i);
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push(s..contents.len());
    }
    spans
}

/// Find the byte range of the selector's value.
fn selector_value_span(contents: &str) -> Option<Range<usize>> {
    token_spans(contents)
        .into_iter()
        .find(|span| contents[span.clone()].starts_with(SELECTOR_KEY))
        .map(|span| span.start + SELECTOR_KEY.len()..span.end)
}

/// Extract the current selector value, e.g. `PARTUUID=5f1d4e2a-02`.
pub(crate) fn selector_value(contents: &str) -> Result<&str> {
    let span = selector_value_span(contents)
        .ok_or_else(|| anyhow!("No {SELECTOR_KEY} directive found"))?;
    Ok(&contents[span])
}

/// Replace the selector value, leaving every other byte of the file
/// untouched.
pub(crate) fn replace_selector(contents: &str, new_value: &str) -> Result<String> {
    let span = selector_value_span(contents)
        .ok_or_else(|| anyhow!("No {SELECTOR_KEY} directive found"))?;
    let mut r = String::with_capacity(contents.len() + new_value.len());
    r.push_str(&contents[..span.start]);
    r.push_str(new_value);
    r.push_str(&contents[span.end..]);
    Ok(r)
}

/// The selector value pointing at a partition by PARTUUID.
pub(crate) fn partuuid_selector(partuuid: &str) -> String {
    format!("PARTUUID={partuuid}")
}

/// Read the root selector from the boot config below the given
/// (explicitly mounted) boot partition mountpoint.
#[context("Reading root selector")]
pub(crate) fn read_root_selector(bootmnt: &Utf8Path) -> Result<String> {
    let path = bootmnt.join(BOOT_CONFIG);
    let contents =
        std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
    Ok(selector_value(&contents)?.to_owned())
}

/// Rewrite the root selector in place, fsyncing the result. This is
/// the one piece of durable state this tool owns.
#[context("Rewriting root selector")]
pub(crate) fn rewrite_root_selector(bootmnt: &Utf8Path, new_value: &str) -> Result<()> {
    let path = bootmnt.join(BOOT_CONFIG);
    let contents =
        std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
    let updated = replace_selector(&contents, new_value)?;
    if updated == contents {
        tracing::debug!("selector already set to {new_value}");
        return Ok(());
    }
    let mut f = std::fs::File::create(&path).with_context(|| format!("Opening {path}"))?;
    f.write_all(updated.as_bytes())
        .with_context(|| format!("Writing {path}"))?;
    f.sync_all().with_context(|| format!("Syncing {path}"))?;
    tracing::debug!("rewrote selector to {new_value}");
    Ok(())
}

/// Replace the source field of the `/` entry in an fstab, preserving
/// all other lines and the entry's remaining fields byte-for-byte.
pub(crate) fn replace_fstab_root_source(contents: &str, new_source: &str) -> Result<String> {
    let mut replaced = false;
    let mut out = String::with_capacity(contents.len() + new_source.len());
    for line in contents.split_inclusive('\n') {
        let body = line.trim_start();
        if !replaced && !body.is_empty() && !body.starts_with('#') {
            let mut fields = body.split_whitespace();
            let source = fields.next();
            let target = fields.next();
            if let (Some(source), Some("/")) = (source, target) {
                // Splice the new source over the old one within the line.
                let start = line.len() - body.len();
                out.push_str(&line[..start]);
                out.push_str(new_source);
                out.push_str(&line[start + source.len()..]);
                replaced = true;
                continue;
            }
        }
        out.push_str(line);
    }
    if !replaced {
        return Err(anyhow!("No '/' entry found in fstab"));
    }
    Ok(out)
}

/// Rewrite the `/` entry of the fstab on a (mounted) cloned root so
/// the migrated system mounts itself by its own identifier.
#[context("Rewriting fstab root entry")]
pub(crate) fn rewrite_fstab_root(rootmnt: &Utf8Path, new_source: &str) -> Result<()> {
    let path = rootmnt.join("etc/fstab");
    let contents =
        std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
    let updated = replace_fstab_root_source(&contents, new_source)?;
    if updated == contents {
        return Ok(());
    }
    let mut f = std::fs::File::create(&path).with_context(|| format!("Opening {path}"))?;
    f.write_all(updated.as_bytes())
        .with_context(|| format!("Writing {path}"))?;
    f.sync_all().with_context(|| format!("Syncing {path}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    const CMDLINE: &str = "console=serial0,115200 console=tty1 root=PARTUUID=5f1d4e2a-02 rootfstype=ext4 fsck.repair=yes rootwait\n";

    #[test]
    fn test_selector_value() -> Result<()> {
        assert_eq!(selector_value(CMDLINE)?, "PARTUUID=5f1d4e2a-02");
        assert!(selector_value("console=tty1 rootwait").is_err());
        Ok(())
    }

    #[test]
    fn test_replace_selector_preserves_other_directives() -> Result<()> {
        let updated = replace_selector(CMDLINE, "PARTUUID=9a0c7b3e-02")?;
        assert_eq!(
            updated,
            "console=serial0,115200 console=tty1 root=PARTUUID=9a0c7b3e-02 rootfstype=ext4 fsck.repair=yes rootwait\n"
        );
        // Round trip back: everything else must be byte-identical.
        let back = replace_selector(&updated, "PARTUUID=5f1d4e2a-02")?;
        assert_eq!(back, CMDLINE);
        Ok(())
    }

    #[test]
    fn test_replace_selector_keeps_odd_spacing() -> Result<()> {
        let input = "console=tty1   root=/dev/mmcblk0p2\textra=1\n";
        let updated = replace_selector(input, "PARTUUID=abc-02")?;
        assert_eq!(updated, "console=tty1   root=PARTUUID=abc-02\textra=1\n");
        Ok(())
    }

    #[test]
    fn test_quoted_values_are_not_split() -> Result<()> {
        let input = r#"init_args="a b c" root=/dev/sda2 quiet"#;
        assert_eq!(selector_value(input)?, "/dev/sda2");
        let input = r#"weird="root=not this" root=/dev/sda2"#;
        assert_eq!(selector_value(input)?, "/dev/sda2");
        Ok(())
    }

    #[test]
    fn test_partuuid_selector() {
        assert_eq!(partuuid_selector("5f1d4e2a-02"), "PARTUUID=5f1d4e2a-02");
    }

    #[test]
    fn test_replace_fstab_root_source() -> Result<()> {
        let fstab = indoc::indoc! { "
            # /etc/fstab: static file system information.
            proc            /proc           proc    defaults          0       0
            PARTUUID=5f1d4e2a-01  /boot/firmware  vfat    defaults          0       2
            PARTUUID=5f1d4e2a-02  /               ext4    defaults,noatime  0       1
            tmpfs           /tmp            tmpfs   defaults          0       0
        " };
        let updated = replace_fstab_root_source(fstab, "PARTUUID=9a0c7b3e-02")?;
        let expected = indoc::indoc! { "
            # /etc/fstab: static file system information.
            proc            /proc           proc    defaults          0       0
            PARTUUID=5f1d4e2a-01  /boot/firmware  vfat    defaults          0       2
            PARTUUID=9a0c7b3e-02  /               ext4    defaults,noatime  0       1
            tmpfs           /tmp            tmpfs   defaults          0       0
        " };
        assert_eq!(updated, expected);
        // Only the one entry changes; a second pass is a no-op.
        assert_eq!(
            replace_fstab_root_source(&updated, "PARTUUID=9a0c7b3e-02")?,
            expected
        );
        Ok(())
    }

    #[test]
    fn test_replace_fstab_root_source_missing() {
        assert!(replace_fstab_root_source("proc /proc proc defaults 0 0\n", "X").is_err());
    }
}
