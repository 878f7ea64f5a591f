//! The guarded operation executor: the safety kernel wrapping every
//! destructive action.
//!
//! Every operation that can destroy data runs through [`execute`],
//! which re-derives the current root source immediately before acting,
//! evaluates the caller's guard against that fresh value, and demands
//! an exactly matching confirmation phrase. Failures of any of those
//! happen before a single byte of I/O. There is no retry and no
//! rollback; the only defense is refusing to start.

use std::io::{BufRead, Write};
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::blockdev;
use crate::devices::{self, DeviceLayout, RootSource};
use rootshift_utils::CommandRunExt;

/// Everything the executor can fail with. Callers always receive one
/// of these; nothing panics or escapes unclassified past this boundary.
#[derive(Debug, Error)]
pub(crate) enum ExecError {
    /// The current root source could not be determined. Always fatal:
    /// every guard depends on this fact.
    #[error("cannot determine current root source: {0}")]
    Inspection(String),
    /// The guard evaluated false against the freshly probed state.
    /// No I/O has been performed.
    #[error("precondition violated: {0}")]
    Precondition(String),
    /// The supplied confirmation did not exactly match the expected
    /// phrase. No I/O has been performed.
    #[error("confirmation rejected: expected the exact phrase {expected:?}")]
    Confirmation {
        /// The phrase that would have been accepted.
        expected: String,
    },
    /// The underlying operation failed, possibly partway. No cleanup
    /// of partial state is attempted; guessing could do further damage.
    #[error("operation failed: {0}")]
    Operation(String),
}

/// A destructive operation. These are the only three things in the
/// system that can destroy data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Operation {
    /// Block-level copy of one whole device onto another.
    BlockClone {
        /// Device read from.
        source: Utf8PathBuf,
        /// Device overwritten.
        dest: Utf8PathBuf,
    },
    /// Delete everything in a directory except the keep-list.
    DeleteExcept {
        /// Directory to strip.
        dir: Utf8PathBuf,
        /// Top-level names to preserve.
        keep: Vec<String>,
    },
    /// Overwrite a whole device from an image file.
    WriteImage {
        /// Image file read from.
        image: Utf8PathBuf,
        /// Device overwritten.
        dest: Utf8PathBuf,
    },
}

impl Operation {
    /// The confirmation phrase required to run this operation. Derived
    /// from the target so the operator must name the thing being
    /// destroyed.
    pub(crate) fn expected_phrase(&self) -> String {
        match self {
            Operation::BlockClone { dest, .. } => format!("overwrite {dest}"),
            Operation::DeleteExcept { dir, .. } => format!("strip {dir}"),
            Operation::WriteImage { dest, .. } => format!("reimage {dest}"),
        }
    }

    /// One-line description for prompts and summaries.
    pub(crate) fn describe(&self) -> String {
        match self {
            Operation::BlockClone { source, dest } => {
                format!("clone {source} onto {dest}, destroying its contents")
            }
            Operation::DeleteExcept { dir, keep } => {
                format!("delete everything under {dir} except {}", keep.join(", "))
            }
            Operation::WriteImage { image, dest } => {
                format!("overwrite {dest} with the image {image}")
            }
        }
    }

    /// The block device this operation writes to, if it targets one
    /// directly. Its partitions are unmounted before execution.
    fn target_device(&self) -> Option<&Utf8Path> {
        match self {
            Operation::BlockClone { dest, .. } | Operation::WriteImage { dest, .. } => {
                Some(dest)
            }
            Operation::DeleteExcept { .. } => None,
        }
    }
}

/// A precondition on the current root source, evaluated against a
/// fresh probe immediately before the operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Guard {
    /// The running root must still be on the removable boot media.
    RootOnRemovable,
    /// The running root must be on the secondary device.
    RootOnSecondary,
}

impl Guard {
    fn check(&self, actual: &RootSource) -> Result<(), String> {
        let ok = match self {
            Guard::RootOnRemovable => *actual == RootSource::Removable,
            Guard::RootOnSecondary => *actual == RootSource::Secondary,
        };
        if ok {
            Ok(())
        } else {
            let wanted = match self {
                Guard::RootOnRemovable => "the removable boot media",
                Guard::RootOnSecondary => "secondary storage",
            };
            Err(format!(
                "current root source is {actual}, but this operation requires running from {wanted}"
            ))
        }
    }
}

/// Source of the current-root-source fact. The live implementation
/// queries the device inspector; tests inject fixed values.
pub(crate) trait RootProbe {
    /// Compute the device currently backing `/`.
    fn current_root_source(&self) -> Result<RootSource>;
}

/// Probe backed by the live mount table.
#[derive(Debug)]
pub(crate) struct LiveProbe<'a> {
    /// The configured device layout to classify against.
    pub(crate) layout: &'a DeviceLayout,
}

impl RootProbe for LiveProbe<'_> {
    fn current_root_source(&self) -> Result<RootSource> {
        devices::current_root_source(self.layout)
    }
}

/// Performs the actual I/O of an operation. The live implementation
/// shells out; tests substitute a counter to prove that guard and
/// confirmation failures never reach it.
pub(crate) trait OpRunner {
    /// Unmount all mounted partitions of the given device.
    fn unmount_targets(&mut self, dev: &Utf8Path) -> Result<()>;
    /// Perform the operation.
    fn perform(&mut self, op: &Operation) -> Result<()>;
    /// Force written data to stable storage.
    fn sync(&mut self);
}

/// The live runner.
#[derive(Debug)]
pub(crate) struct HostRunner;

impl OpRunner for HostRunner {
    fn unmount_targets(&mut self, dev: &Utf8Path) -> Result<()> {
        let parent = blockdev::list_dev(dev)?;
        for child in parent.children.iter().flatten() {
            let path = child.path();
            let mounts = rootshift_mount::mounts_of(&path)?;
            if !mounts.is_empty() {
                tracing::debug!("unmounting {path} ({} mounts)", mounts.len());
                rootshift_mount::unmount_all_targets(&path)?;
            }
        }
        Ok(())
    }

    fn perform(&mut self, op: &Operation) -> Result<()> {
        match op {
            Operation::BlockClone { source, dest } => dd(source, dest),
            Operation::DeleteExcept { dir, keep } => delete_except(dir, keep),
            Operation::WriteImage { image, dest } => dd(image, dest),
        }
    }

    fn sync(&mut self) {
        rustix::fs::sync();
    }
}

fn dd(source: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    Command::new("dd")
        .arg(format!("if={source}"))
        .arg(format!("of={dest}"))
        .args(["bs=4M", "conv=fsync"])
        .log_debug()
        .run()
}

/// Delete all top-level entries of `dir` except the named ones.
pub(crate) fn delete_except(dir: &Utf8Path, keep: &[String]) -> Result<()> {
    for entry in dir
        .read_dir_utf8()
        .with_context(|| format!("Reading {dir}"))?
    {
        let entry = entry.with_context(|| format!("Reading entry of {dir}"))?;
        let name = entry.file_name();
        if keep.iter().any(|k| k == name) {
            continue;
        }
        let path = entry.path();
        let ftype = entry
            .file_type()
            .with_context(|| format!("Inspecting {path}"))?;
        if ftype.is_dir() {
            std::fs::remove_dir_all(path).with_context(|| format!("Removing {path}"))?;
        } else {
            std::fs::remove_file(path).with_context(|| format!("Removing {path}"))?;
        }
    }
    Ok(())
}

/// Outcome of a successfully executed guarded operation.
#[derive(Debug)]
pub(crate) struct ExecOutcome {
    /// Human-readable summary of what was done.
    pub(crate) summary: String,
}

/// Run a destructive operation behind its guard.
///
/// The sequence is fixed: fresh root-source probe, guard evaluation,
/// confirmation check, unmount of the target device's partitions, the
/// operation itself, and a durability sync. The first three steps
/// perform no mutation whatsoever.
pub(crate) fn execute(
    op: &Operation,
    guard: Guard,
    confirm: &str,
    probe: &dyn RootProbe,
    runner: &mut dyn OpRunner,
) -> Result<ExecOutcome, ExecError> {
    // Never trust a value computed earlier in the process lifetime.
    let root = probe
        .current_root_source()
        .map_err(|e| ExecError::Inspection(format!("{e:#}")))?;
    guard.check(&root).map_err(ExecError::Precondition)?;

    let expected = op.expected_phrase();
    if confirm != expected {
        return Err(ExecError::Confirmation { expected });
    }

    if let Some(dev) = op.target_device() {
        runner
            .unmount_targets(dev)
            .map_err(|e| ExecError::Operation(format!("unmounting {dev}: {e:#}")))?;
    }
    tracing::info!("executing: {}", op.describe());
    runner
        .perform(op)
        .map_err(|e| ExecError::Operation(format!("{e:#}")))?;
    runner.sync();
    Ok(ExecOutcome {
        summary: format!("done: {}", op.describe()),
    })
}

/// Resolve the confirmation for an operation: either the phrase the
/// operator passed on the command line, or an interactive prompt.
/// The equality check itself always happens inside [`execute`].
pub(crate) fn resolve_confirmation(
    supplied: Option<String>,
    op: &Operation,
) -> Result<String> {
    if let Some(s) = supplied {
        return Ok(s);
    }
    let expected = op.expected_phrase();
    let mut err = std::io::stderr().lock();
    writeln!(err).context("Writing prompt")?;
    writeln!(err, "WARNING: this will {}", op.describe()).context("Writing prompt")?;
    writeln!(err, "This action is irreversible.").context("Writing prompt")?;
    write!(err, "Type `{expected}` to continue: ").context("Writing prompt")?;
    err.flush().context("Writing prompt")?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Reading confirmation")?;
    // Strip the line terminator; interior whitespace must match exactly.
    Ok(line.trim_end_matches(['\n', '\r']).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[derive(Debug)]
    struct FixedProbe(RootSource);

    impl RootProbe for FixedProbe {
        fn current_root_source(&self) -> Result<RootSource> {
            Ok(self.0.clone())
        }
    }

    #[derive(Debug)]
    struct FailingProbe;

    impl RootProbe for FailingProbe {
        fn current_root_source(&self) -> Result<RootSource> {
            Err(anyhow!("mount table unreadable"))
        }
    }

    /// Counts every call that would touch a device; the properties
    /// below assert it stays at zero on the abort paths.
    #[derive(Debug, Default)]
    struct CountingRunner {
        mutations: u32,
        synced: bool,
    }

    impl OpRunner for CountingRunner {
        fn unmount_targets(&mut self, _dev: &Utf8Path) -> Result<()> {
            self.mutations += 1;
            Ok(())
        }
        fn perform(&mut self, _op: &Operation) -> Result<()> {
            self.mutations += 1;
            Ok(())
        }
        fn sync(&mut self) {
            self.synced = true;
        }
    }

    fn clone_op() -> Operation {
        Operation::BlockClone {
            source: "/dev/mmcblk0".into(),
            dest: "/dev/nvme0n1".into(),
        }
    }

    #[test]
    fn test_guard_violation_performs_no_io() {
        let probe = FixedProbe(RootSource::Secondary);
        let mut runner = CountingRunner::default();
        let op = clone_op();
        let r = execute(
            &op,
            Guard::RootOnRemovable,
            &op.expected_phrase(),
            &probe,
            &mut runner,
        );
        assert!(matches!(r, Err(ExecError::Precondition(_))));
        assert_eq!(runner.mutations, 0);
        assert!(!runner.synced);
    }

    #[test]
    fn test_confirmation_must_match_exactly() {
        let probe = FixedProbe(RootSource::Removable);
        let op = clone_op();
        // Case, whitespace and truncation all count as mismatches
        for bad in [
            "",
            "overwrite /dev/nvme0n1 ",
            " overwrite /dev/nvme0n1",
            "Overwrite /dev/nvme0n1",
            "overwrite /dev/nvme0",
            "yes",
        ] {
            let mut runner = CountingRunner::default();
            let r = execute(&op, Guard::RootOnRemovable, bad, &probe, &mut runner);
            assert!(
                matches!(r, Err(ExecError::Confirmation { .. })),
                "accepted {bad:?}"
            );
            assert_eq!(runner.mutations, 0, "mutated on {bad:?}");
        }
    }

    #[test]
    fn test_inspection_failure_is_fatal() {
        let mut runner = CountingRunner::default();
        let op = clone_op();
        let r = execute(
            &op,
            Guard::RootOnRemovable,
            &op.expected_phrase(),
            &FailingProbe,
            &mut runner,
        );
        assert!(matches!(r, Err(ExecError::Inspection(_))));
        assert_eq!(runner.mutations, 0);
    }

    #[test]
    fn test_execute_happy_path() -> Result<()> {
        let probe = FixedProbe(RootSource::Removable);
        let mut runner = CountingRunner::default();
        let op = clone_op();
        let outcome = execute(
            &op,
            Guard::RootOnRemovable,
            "overwrite /dev/nvme0n1",
            &probe,
            &mut runner,
        )
        .map_err(|e| anyhow!(e))?;
        // unmount + perform
        assert_eq!(runner.mutations, 2);
        assert!(runner.synced);
        assert!(outcome.summary.contains("/dev/nvme0n1"));
        Ok(())
    }

    #[test]
    fn test_delete_except_has_no_device_target() {
        let op = Operation::DeleteExcept {
            dir: "/run/rootshift/sdroot".into(),
            keep: vec!["lost+found".into()],
        };
        assert_eq!(op.target_device(), None);
        let probe = FixedProbe(RootSource::Secondary);
        let mut runner = CountingRunner::default();
        let r = execute(
            &op,
            Guard::RootOnSecondary,
            &op.expected_phrase(),
            &probe,
            &mut runner,
        );
        assert!(r.is_ok());
        // Only the perform call; nothing was unmounted
        assert_eq!(runner.mutations, 1);
    }

    #[test]
    fn test_expected_phrases() {
        assert_eq!(clone_op().expected_phrase(), "overwrite /dev/nvme0n1");
        let op = Operation::WriteImage {
            image: "/srv/base.img".into(),
            dest: "/dev/mmcblk0".into(),
        };
        assert_eq!(op.expected_phrase(), "reimage /dev/mmcblk0");
    }

    #[test]
    fn test_delete_except() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        std::fs::create_dir(dir.join("lost+found"))?;
        std::fs::create_dir(dir.join("usr"))?;
        std::fs::write(dir.join("usr/bin"), "x")?;
        std::fs::write(dir.join("vmlinuz"), "x")?;
        std::fs::create_dir(dir.join("recovery"))?;
        std::fs::write(dir.join("recovery/base.img"), "x")?;
        delete_except(dir, &["lost+found".into(), "recovery".into()])?;
        let mut names: Vec<_> = dir
            .read_dir_utf8()?
            .map(|e| e.unwrap().file_name().to_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["lost+found", "recovery"]);
        // Kept directories retain their contents
        assert!(dir.join("recovery/base.img").exists());
        Ok(())
    }
}
