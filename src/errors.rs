//! Build failure taxonomy.
//!
//! Every failure that escapes a module carries one of these kinds somewhere
//! in its anyhow chain so the CLI can map it to an exit code and a useful
//! one-line summary. Attach a kind with `.context(BuildErrorKind::...)`.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BuildErrorKind {
    /// The specification is malformed or contains unknown enumerated values.
    #[error("specification validation failed")]
    Validation,

    /// An unknown key appeared under an enumerated spec section.
    #[error("unknown option in specification")]
    UnknownOption,

    /// A required host tool, asset, or module precondition is absent.
    #[error("required tool or asset missing")]
    MissingRequired,

    /// Network operation failed after retries were exhausted.
    #[error("network operation failed after retries")]
    Network,

    /// apt/dpkg failure inside the chroot.
    #[error("package installation failed in chroot")]
    PackageInstall,

    /// ZFS build failed against the installed kernel headers.
    #[error("ZFS build does not match the installed kernel")]
    KernelZfsMismatch,

    /// dracut failed to produce an initramfs.
    #[error("initramfs generation failed")]
    InitramfsRegen,

    /// xorriso/mksquashfs or a related sub-tool failed.
    #[error("ISO assembly failed")]
    IsoAssembly,

    /// A second chroot acquisition was attempted while one is active.
    #[error("chroot is already in use")]
    ChrootBusy,

    /// A bind mount could not be released even with lazy unmount.
    #[error("mount could not be released")]
    MountLeak,

    /// Subprocess produced no output past the idle threshold.
    #[error("subprocess stalled past the idle threshold")]
    Stalled,

    /// A required installer module's source tree is not present.
    #[error("installer module source missing")]
    InstallerAssetMissing,

    /// The workspace was left with a failed teardown and refuses reuse.
    #[error("workspace is dirty from a previous failed teardown")]
    WorkspaceDirty,

    /// Cancellation was requested by the caller.
    #[error("build cancelled")]
    Cancelled,
}

/// Extract the kind attached to an error chain, if any.
pub fn kind_of(err: &anyhow::Error) -> Option<BuildErrorKind> {
    err.downcast_ref::<BuildErrorKind>().copied()
}

/// Exit code for the CLI contract.
///
/// 0 success, 1 validation, 2 module error, 3 dirty workspace, 130 cancelled.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match kind_of(err) {
        Some(BuildErrorKind::Validation) | Some(BuildErrorKind::UnknownOption) => 1,
        Some(BuildErrorKind::WorkspaceDirty) => 3,
        Some(BuildErrorKind::Cancelled) => 130,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_survives_context_chain() {
        let err = anyhow::anyhow!("apt-get exited 100")
            .context(BuildErrorKind::PackageInstall)
            .context("installing proxmox-ve");
        assert_eq!(kind_of(&err), Some(BuildErrorKind::PackageInstall));
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn test_exit_codes() {
        let validation = anyhow::anyhow!("bad").context(BuildErrorKind::Validation);
        assert_eq!(exit_code(&validation), 1);

        let dirty = anyhow::anyhow!("dirty").context(BuildErrorKind::WorkspaceDirty);
        assert_eq!(exit_code(&dirty), 3);

        let cancelled = anyhow::anyhow!("stop").context(BuildErrorKind::Cancelled);
        assert_eq!(exit_code(&cancelled), 130);

        let plain = anyhow::anyhow!("anything else");
        assert_eq!(exit_code(&plain), 2);
    }
}
