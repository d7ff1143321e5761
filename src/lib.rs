//! Privileged build sandbox for container and VM root filesystem images.
//!
//! Given a downloaded distribution tree, the crate:
//!
//! - **Sandbox** - enters a chroot with `/proc`, `/sys`, tmpfs mounts and a
//!   minimal `/dev`, and tears all of it down again on exit
//! - **VM disks** - creates a partitioned, loop-attached disk image and exposes
//!   its devices inside the sandbox
//! - **Package managers** - drives apt, dnf, pacman and friends through a
//!   filter-aware, order-preserving pipeline
//! - **Preflight checks** - host tool validation before builds
//!
//! # Architecture
//!
//! ```text
//! definition (TOML) ──► filter ──► build::pack
//!                                     │
//!                                     ├── build::overlay    (work tree over the source)
//!                                     ├── vm::VmDisk        (VM builds only)
//!                                     ├── sandbox::enter    (chroot lease)
//!                                     ├── managers::pipeline
//!                                     └── sandbox lease exit
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use rootfs_builder::build::{pack, BuildOptions};
//! use rootfs_builder::definition::Definition;
//! use rootfs_builder::filter::TargetType;
//! use rootfs_builder::process::SystemRunner;
//! use std::path::Path;
//!
//! let definition = Definition::load(Path::new("ubuntu.toml"))?;
//! let options = BuildOptions::new(TargetType::Container, "/var/cache/rootfs-builder");
//! pack(
//!     &definition,
//!     Path::new("/build/rootfs"),
//!     Path::new("/build/out"),
//!     &options,
//!     &SystemRunner,
//! )?;
//! ```

pub mod build;
pub mod definition;
pub mod filter;
pub mod managers;
pub mod preflight;
pub mod process;
pub mod sandbox;
pub mod teardown;
pub mod template;
pub mod vm;
