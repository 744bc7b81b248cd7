//! Pipeline stage modules, one per build phase.
//!
//! Each module implements [`crate::pipeline::BuildModule`]: it checks the
//! preconditions left by its predecessors, does its work through the chroot
//! executor and the workspace, and optionally hands a resume payload back to
//! the checkpoint store.

pub mod bootloader;
pub mod calamares;
pub mod debootstrap;
pub mod dracut;
pub mod hardening;
pub mod iso;
pub mod kernel;
pub mod live_env;
pub mod proxmox;
pub mod workspace_setup;
pub mod zfs_build;

use anyhow::{Context, Result};
use std::path::Path;

use crate::errors::BuildErrorKind;

/// Fail with `MissingRequired` unless an earlier module produced `path`.
pub(crate) fn require_stage_output(path: &Path, produced_by: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "'{}' is missing; run the {} module first",
        path.display(),
        produced_by
    ))
    .context(BuildErrorKind::MissingRequired)
}

/// The chroot must look like a bootstrapped Debian system.
pub(crate) fn require_chroot(chroot: &Path) -> Result<()> {
    require_stage_output(&chroot.join("etc/debian_version"), "Debootstrap")
}

/// chmod 755.
pub(crate) fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)
        .with_context(|| format!("reading metadata of '{}'", path.display()))?
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("marking '{}' executable", path.display()))
}
