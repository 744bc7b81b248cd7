//! KernelAcquisition: install the Proxmox kernel, headers and firmware.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;

use crate::chroot::ChrootSession;
use crate::errors::BuildErrorKind;
use crate::modules::require_chroot;
use crate::pipeline::{BuildContext, BuildModule};
use crate::process::{retry_network, NETWORK_ATTEMPTS};
use crate::spec::KernelSelector;

/// Oldest kernel series `latest` will accept.
const MIN_KERNEL_SERIES: (u32, u32) = (6, 5);

const PVE_REPO_KEY_URL: &str =
    "https://enterprise.proxmox.com/debian/proxmox-release-bookworm.gpg";

pub struct KernelAcquisition;

impl BuildModule for KernelAcquisition {
    fn name(&self) -> &'static str {
        "KernelAcquisition"
    }

    fn execute(&self, ctx: &BuildContext, resume: Option<&Value>) -> Result<Option<Value>> {
        require_chroot(&ctx.workspace.chroot_dir())?;

        let session = ChrootSession::enter(ctx.workspace, ctx.plan.builder_config.cache_packages)?;
        let result = install(ctx, &session, resume);
        session.release(ctx.workspace)?;
        result
    }
}

fn install(
    ctx: &BuildContext,
    session: &ChrootSession,
    resume: Option<&Value>,
) -> Result<Option<Value>> {
    ensure_pve_repository(ctx, session)?;

    // A failed install after version resolution resumes with the same
    // concrete version instead of resolving again.
    let resolved = resume
        .and_then(|r| r.get("kernel_series"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let series = match resolved {
        Some(series) => {
            println!("Resuming with kernel series {series}");
            series
        }
        None => match &ctx.plan.builder_config.kernel_version {
            KernelSelector::Latest => resolve_latest(session)?,
            KernelSelector::Version(v) => v.clone(),
        },
    };
    println!("Installing proxmox-kernel-{series}");

    session
        .run([
            "apt-get",
            "install",
            "-y",
            &format!("proxmox-kernel-{series}"),
            &format!("proxmox-headers-{series}"),
            "pve-firmware",
        ])
        .context(BuildErrorKind::PackageInstall)
        .context("installing kernel packages")?;

    let release = installed_kernel_release(session)?;
    println!("Kernel installed: {release}");

    Ok(Some(json!({
        "kernel_series": series,
        "kernel_release": release,
    })))
}

/// The Proxmox repository has to be reachable before kernel selection; the
/// key and list are also what ProxmoxIntegration builds on later.
fn ensure_pve_repository(ctx: &BuildContext, session: &ChrootSession) -> Result<()> {
    let chroot = ctx.workspace.chroot_dir();
    let keyring = chroot.join("usr/share/keyrings/proxmox-release.gpg");
    if !keyring.exists() {
        retry_network("downloading Proxmox release key", NETWORK_ATTEMPTS, || {
            session.run([
                "wget",
                "-qO",
                "/usr/share/keyrings/proxmox-release.gpg",
                PVE_REPO_KEY_URL,
            ])
        })?;
    }

    let release = ctx.plan.builder_config.debian_release.as_str();
    let list = format!(
        "deb [signed-by=/usr/share/keyrings/proxmox-release.gpg] http://download.proxmox.com/debian/pve {release} pve-no-subscription\n"
    );
    let list_dir = chroot.join("etc/apt/sources.list.d");
    fs::create_dir_all(&list_dir).context("creating sources.list.d")?;
    fs::write(list_dir.join("pve.list"), list).context("writing pve.list")?;

    retry_network("apt-get update (pve repository)", NETWORK_ATTEMPTS, || {
        session.run(["apt-get", "update"])
    })?;
    Ok(())
}

/// Resolve `latest` to the newest proxmox-kernel series the repository
/// offers, subject to the minimum floor.
fn resolve_latest(session: &ChrootSession) -> Result<String> {
    let result = session
        .run_script("apt-cache search --names-only '^proxmox-kernel-[0-9.]+$'")
        .context("listing available kernel series")?;
    let series = newest_series(&result.stdout).ok_or_else(|| {
        anyhow::anyhow!(
            "no proxmox-kernel series >= {}.{} available",
            MIN_KERNEL_SERIES.0,
            MIN_KERNEL_SERIES.1
        )
    })?;
    Ok(series)
}

/// Pick the newest `major.minor` series from apt-cache search output.
fn newest_series(apt_output: &str) -> Option<String> {
    let mut best: Option<(u32, u32)> = None;
    for line in apt_output.lines() {
        let Some(name) = line.split_whitespace().next() else {
            continue;
        };
        let Some(series) = parse_series(name) else {
            continue;
        };
        if series < MIN_KERNEL_SERIES {
            continue;
        }
        if best.map_or(true, |b| series > b) {
            best = Some(series);
        }
    }
    best.map(|(major, minor)| format!("{major}.{minor}"))
}

fn parse_series(package_name: &str) -> Option<(u32, u32)> {
    let series = package_name.strip_prefix("proxmox-kernel-")?;
    let mut parts = series.splitn(2, '.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Newest kernel release directory under /lib/modules.
pub fn installed_kernel_release(session: &ChrootSession) -> Result<String> {
    let result = session
        .run_script("ls -1 /lib/modules | sort -V | tail -1")
        .context("listing installed kernels")?;
    let release = result.stdout_trimmed().to_string();
    if release.is_empty() {
        return Err(anyhow::anyhow!("no kernel modules directory found"))
            .context(BuildErrorKind::MissingRequired);
    }
    Ok(release)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_series_picks_highest() {
        let output = "proxmox-kernel-6.5 - kernel image\n\
                      proxmox-kernel-6.8 - kernel image\n\
                      proxmox-kernel-6.11 - kernel image\n";
        assert_eq!(newest_series(output).as_deref(), Some("6.11"));
    }

    #[test]
    fn test_newest_series_honors_floor() {
        let output = "proxmox-kernel-5.15 - old kernel\n\
                      proxmox-kernel-6.2 - old kernel\n";
        assert_eq!(newest_series(output), None);
    }

    #[test]
    fn test_newest_series_ignores_unrelated_packages() {
        let output = "proxmox-kernel-helper - helper scripts\n\
                      proxmox-kernel-6.8 - kernel image\n";
        assert_eq!(newest_series(output).as_deref(), Some("6.8"));
    }
}
