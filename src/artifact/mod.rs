//! Image artifacts: unpacking, authoring and verification.
//!
//! - [`extract`] - Source image to working tree (loop mount or ISO9660 reader)
//! - [`compose`] - Working tree to bootable output image, with read-back checks
//! - [`iso9660`] - Mount-free ISO9660 / Rock Ridge / El Torito reader and writer
//! - [`iso`] - Boot layout detection, volume labels, output description
//! - [`iso_utils`] - Native authoring tools and checksum sidecars
//! - [`filesystem`] - Tree copies, permissions, atomic publication

pub mod compose;
pub mod extract;
pub mod filesystem;
pub mod iso;
pub mod iso9660;
pub mod iso_utils;
