//! ProxmoxIntegration: Proxmox VE repository, package set, and web UI
//! subscription nag removal.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;

use crate::chroot::ChrootSession;
use crate::errors::BuildErrorKind;
use crate::modules::require_chroot;
use crate::pipeline::{BuildContext, BuildModule};
use crate::process::{retry_network, NETWORK_ATTEMPTS};

const PROXMOXLIB: &str = "usr/share/javascript/proxmox-widget-toolkit/proxmoxlib.js";

pub struct ProxmoxIntegration;

impl BuildModule for ProxmoxIntegration {
    fn name(&self) -> &'static str {
        "ProxmoxIntegration"
    }

    fn execute(&self, ctx: &BuildContext, _resume: Option<&Value>) -> Result<Option<Value>> {
        require_chroot(&ctx.workspace.chroot_dir())?;

        let packages = package_set(ctx.plan);
        println!("Installing Proxmox packages: {}", packages.join(" "));

        let session = ChrootSession::enter(ctx.workspace, ctx.plan.builder_config.cache_packages)?;
        let result = install(&session, &packages);
        session.release(ctx.workspace)?;
        result?;

        let version = suppress_subscription_banner(ctx)?;

        Ok(Some(json!({
            "packages": packages,
            "pve_manager_version": version,
        })))
    }
}

fn package_set(plan: &crate::spec::BuildPlan) -> Vec<String> {
    let config = &plan.proxmox_config;
    if config.minimal_install {
        // A minimal install keeps only the metapackage; apt pulls the
        // mandatory dependencies.
        vec!["proxmox-ve".to_string()]
    } else {
        config.include_packages.clone()
    }
}

fn install(session: &ChrootSession, packages: &[String]) -> Result<()> {
    // The pve repository and keyring were set up by KernelAcquisition.
    retry_network("apt-get update", NETWORK_ATTEMPTS, || {
        session.run(["apt-get", "update"])
    })?;

    let mut argv = vec!["apt-get".to_string(), "install".to_string(), "-y".to_string()];
    argv.extend(packages.iter().cloned());
    session
        .run(argv.iter().map(String::as_str))
        .context(BuildErrorKind::PackageInstall)
        .context("installing Proxmox packages")?;
    Ok(())
}

/// Disable the "No valid subscription" dialog in the bundled web UI assets.
fn suppress_subscription_banner(ctx: &BuildContext) -> Result<String> {
    let lib_path = ctx.workspace.chroot_dir().join(PROXMOXLIB);
    if !lib_path.exists() {
        log::warn!("proxmoxlib.js not found, skipping subscription banner removal");
        return Ok("unknown".to_string());
    }

    let content = fs::read_to_string(&lib_path)
        .with_context(|| format!("reading '{}'", lib_path.display()))?;
    let patched = patch_subscription_check(&content);
    fs::write(&lib_path, patched)
        .with_context(|| format!("writing '{}'", lib_path.display()))?;

    let version = fs::read_to_string(
        ctx.workspace
            .chroot_dir()
            .join("usr/share/pve-manager/version"),
    )
    .map(|v| v.trim().to_string())
    .unwrap_or_else(|_| "unknown".to_string());
    Ok(version)
}

/// Rewrite the status check that decides whether to pop the nag dialog.
fn patch_subscription_check(content: &str) -> String {
    content.replace(
        "res === null || res === undefined || !res || res\n\t\t\t.data.status.toLowerCase() !== 'active'",
        "false",
    )
    .replace(
        ".data.status.toLowerCase() !== 'active'",
        ".data.status.toLowerCase() == 'active'",
    )
}
