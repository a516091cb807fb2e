//! # exfat-forensics
//!
//! Read-only forensic analysis of exFAT volumes in Rust.
//!
//! The engine opens a raw sector source (a disk image file, a device, or a
//! byte buffer), validates the boot sector and walks the directory tree.
//! Unlike a regular filesystem driver it also surfaces what a driver hides:
//! deleted entry sets are reconstructed from their slots, wiped cluster
//! chains are re-estimated from the allocation bitmap, and entry sets no
//! directory points at anymore are collected under a synthetic
//! `$OrphanFiles` directory.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use exfat_forensics::{Engine, InodeId, WalkFlags, WalkOptions};
//!
//! let image = std::fs::File::open("volume.img").unwrap();
//! let engine = Engine::open(image).unwrap();
//!
//! let options = WalkOptions::builder()
//!     .flags(WalkFlags::ALLOCATED | WalkFlags::DELETED | WalkFlags::RECURSIVE)
//!     .build()
//!     .unwrap();
//!
//! for entry in engine.walk(InodeId::ROOT, options).unwrap() {
//!     let entry = entry.unwrap();
//!     println!("{} {} ({} bytes)", entry.id, entry.name, entry.size_bytes);
//! }
//! ```
//!
//! ## Limitations
//! The engine never writes: repairing a volume is out of scope, as is the
//! FAT12/16/32 family. TexFAT volumes are readable through their first FAT
//! and first allocation bitmap only.

pub(crate) mod bitmap;
/// Boot sector decoding and volume geometry
pub mod boot;
pub mod chain;
/// Sector source abstractions
pub mod disk;
pub mod engine;
pub mod entry;
pub mod error;
pub(crate) mod fat;
pub mod inode;
pub(crate) mod orphan;
pub mod timestamp;

#[cfg(test)]
pub(crate) mod testutil;

pub use boot::Geometry;
pub use chain::{Run, RunList};
pub use disk::SectorSource;
pub use engine::{Engine, ProgressFn, Walk, WalkFlags, WalkOptions, WalkOptionsBuilder};
pub use entry::{Allocation, Entry, EntryKind, FileAttributes};
pub use error::{Diagnostic, OpenError, WalkError};
pub use fat::ChainEntry;
pub use inode::InodeId;
pub use timestamp::{Timestamp, Timestamps};
