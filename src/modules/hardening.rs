//! SecurityHardening and EncryptionSupport build-time modules.
//!
//! SecurityHardening stages the selected profile's assets into the live
//! rootfs (the installer-side job re-applies them to the target);
//! EncryptionSupport makes sure the native-ZFS encryption tooling is present.

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::chroot::ChrootSession;
use crate::errors::BuildErrorKind;
use crate::installer::hardening::write_assets;
use crate::modules::require_chroot;
use crate::pipeline::{BuildContext, BuildModule};
use crate::spec::HardeningProfile;

pub struct SecurityHardening;

impl BuildModule for SecurityHardening {
    fn name(&self) -> &'static str {
        "SecurityHardening"
    }

    fn execute(&self, ctx: &BuildContext, _resume: Option<&Value>) -> Result<Option<Value>> {
        let chroot = ctx.workspace.chroot_dir();
        require_chroot(&chroot)?;

        let profile = ctx.plan.security_config.hardening_profile;
        if profile == HardeningProfile::None {
            println!("Hardening profile 'none', nothing to stage");
            return Ok(Some(json!({ "profile": "none" })));
        }

        write_assets(&chroot, profile)
            .with_context(|| format!("staging hardening profile '{}'", profile.as_str()))?;

        if profile == HardeningProfile::Server {
            let session =
                ChrootSession::enter(ctx.workspace, ctx.plan.builder_config.cache_packages)?;
            let result = session
                .run(["apt-get", "install", "-y", "nftables", "openssh-server"])
                .context(BuildErrorKind::PackageInstall)
                .and_then(|_| {
                    session.run_allow_fail(["systemctl", "enable", "nftables"])?;
                    Ok(())
                });
            session.release(ctx.workspace)?;
            result?;
        }

        println!("Staged hardening profile '{}'", profile.as_str());
        Ok(Some(json!({ "profile": profile.as_str() })))
    }
}

pub struct EncryptionSupport;

impl BuildModule for EncryptionSupport {
    fn name(&self) -> &'static str {
        "EncryptionSupport"
    }

    /// Native ZFS encryption needs no extra packages beyond the zfs
    /// utilities, but the prompt tooling the initramfs uses must exist.
    fn execute(&self, ctx: &BuildContext, _resume: Option<&Value>) -> Result<Option<Value>> {
        let chroot = ctx.workspace.chroot_dir();
        require_chroot(&chroot)?;

        let session = ChrootSession::enter(ctx.workspace, ctx.plan.builder_config.cache_packages)?;
        let result = (|| -> Result<()> {
            session
                .run(["apt-get", "install", "-y", "cryptsetup-bin", "keyutils"])
                .context(BuildErrorKind::PackageInstall)?;

            // The zfs userland must understand the configured algorithm.
            let check = session.run_allow_fail([
                "zfs",
                "get",
                "-H",
                "encryption",
            ])?;
            if !check.success() {
                log::warn!(
                    "zfs userland does not answer encryption queries yet: {}",
                    check.stderr_trimmed()
                );
            }
            Ok(())
        })();
        session.release(ctx.workspace)?;
        result?;

        Ok(Some(json!({
            "algorithm": ctx.plan.zfs_config.encryption.algorithm,
            "pbkdf_iterations": ctx.plan.zfs_config.encryption.pbkdf_iterations,
        })))
    }
}
