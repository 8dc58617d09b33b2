//! Roto - chroot build sandbox for RPM packages.
//!
//! This crate creates, populates and tears down chroot build roots, then
//! drives `rpmbuild` inside them on behalf of an unprivileged user.
//!
//! # Platform Requirements
//!
//! - Linux, started as root through sudo or userhelper
//! - `rpm`, `rpmbuild` and a yum-compatible installer on the host
//!
//! # Modules
//!
//! - [`sandbox`]: privileges, locks, mounts, device nodes, command execution
//! - [`plugins`]: cache plugins and the stage hooks they register
//! - [`build`]: the [`Buildroot`] and every operation on it
//! - [`config`] and [`cli`]: how a [`BuildConfig`] is assembled
//!
//! # Example
//!
//! ```no_run
//! use roto_sandbox::{BuildConfig, Buildroot};
//! use roto_sandbox::sandbox::PrivilegeManager;
//!
//! fn main() -> roto_sandbox::Result<()> {
//!     let config = BuildConfig::default().with_root("fedora-rawhide-x86_64");
//!     let mut root = Buildroot::new(config, PrivilegeManager::new(1000, 135))?;
//!
//!     root.rebuild(&["foo-1.0-1.src.rpm".into()], true)?;
//!     root.end();
//!     Ok(())
//! }
//! ```

pub mod build;
pub mod cli;
pub mod config;
pub mod error;
pub mod plugins;
pub mod sandbox;
pub mod system;

// Re-export commonly used types
pub use build::Buildroot;
pub use config::BuildConfig;
pub use error::{Error, Result};
