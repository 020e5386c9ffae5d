//! Build unattended Ubuntu Server installer ISOs.
//!
//! An official live-server image is fetched (or reused from the cache),
//! unpacked, given an autoinstall overlay as a NoCloud seed, and packed back
//! into a BIOS and UEFI bootable image. Credentials come from the environment
//! and never reach disk in plaintext.
//!
//! - **Preflight** - Pick extraction and composition backends for this host
//! - **Acquisition** - Mirror probing, retries, checksums and the image cache
//! - **Overlay** - Validation, credential templating and injection
//! - **Artifact** - ISO 9660 reading and writing, extraction and composition
//! - **Teardown** - Shred secrets and remove the working tree on every exit
//!
//! # Architecture
//!
//! ```text
//! preflight ──► acquire ───────┐
//!          └──► overlay/validate ─► extract ─► inject ─► compose
//!                                                          │
//! teardown (guard over the whole run) ◄────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use autoiso_builder::{config, CancelToken, HttpMirror, Pipeline, SystemProbe};
//!
//! let config = config::resolve(&invocation)?;
//! let mirror = HttpMirror::new(config.download_timeout);
//! let outcome = Pipeline::new(&config, &mirror, &SystemProbe, CancelToken::new()).run()?;
//! println!("{}", outcome.output.path.display());
//! ```

pub mod acquire;
pub mod artifact;
pub mod cancel;
pub mod config;
pub mod error;
pub mod overlay;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod teardown;

pub use acquire::mirror::{HttpMirror, MirrorClient};
pub use cancel::CancelToken;
pub use config::{BuildConfig, Invocation};
pub use error::{BuildError, BuildResult};
pub use pipeline::{BuildOutcome, Pipeline};
pub use preflight::{HostProbe, SystemProbe};
