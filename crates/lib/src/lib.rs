//! # rootshift
//!
//! Migrates a microSD-booted single-board computer onto a secondary
//! fast storage device: clone the OS, repoint the bootloader, strip
//! the redundant copy, and audit the result. Every destructive step
//! runs behind a freshly evaluated guard and a typed confirmation
//! phrase; recovery back to a pristine media is a separately gated
//! path, not an undo.

mod bootsel;
pub mod cli;
mod devices;
mod firmware;
mod guard;
mod recovery;
mod stages;
mod verify;

// Re-export blockdev crate for internal use
pub(crate) use rootshift_blockdev as blockdev;
