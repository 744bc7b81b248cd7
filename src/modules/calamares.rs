//! CalamaresIntegration: install the installer framework, stage the custom
//! Z-Forge installer modules, and compose the installer sequence.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

use crate::chroot::ChrootSession;
use crate::errors::BuildErrorKind;
use crate::modules::require_chroot;
use crate::pipeline::{BuildContext, BuildModule};

/// The frozen set of custom installer modules. A build without the source for
/// any of them must fail early.
pub const REQUIRED_INSTALLER_MODULES: &[&str] = &[
    "zfspooldetect",
    "zfsrootselect",
    "zfsbootloader",
    "proxmoxconfig",
    "zforgefinalize",
    "securityhardening",
    "telemetryconsent",
    "telemetryjob",
];

const CALAMARES_PACKAGES: &[&str] = &["calamares", "qml-module-qtquick2"];

pub struct CalamaresIntegration;

impl BuildModule for CalamaresIntegration {
    fn name(&self) -> &'static str {
        "CalamaresIntegration"
    }

    fn execute(&self, ctx: &BuildContext, _resume: Option<&Value>) -> Result<Option<Value>> {
        let chroot = ctx.workspace.chroot_dir();
        require_chroot(&chroot)?;

        let assets = &ctx.plan.builder_config.installer_modules_path;
        check_required_modules(assets)?;

        let session = ChrootSession::enter(ctx.workspace, ctx.plan.builder_config.cache_packages)?;
        let result = session
            .run_script(&format!(
                "apt-get install -y {}",
                CALAMARES_PACKAGES.join(" ")
            ))
            .context(BuildErrorKind::PackageInstall)
            .context("installing Calamares");
        session.release(ctx.workspace)?;
        result?;

        stage_modules(assets, &chroot)?;
        stage_installer_runner(&chroot)?;
        write_settings(ctx, &chroot)?;
        write_branding(ctx, &chroot)?;

        Ok(Some(json!({
            "modules": REQUIRED_INSTALLER_MODULES,
        })))
    }
}

/// Every required module must exist as a directory with a descriptor.
pub fn check_required_modules(assets: &Path) -> Result<()> {
    let mut missing = Vec::new();
    for module in REQUIRED_INSTALLER_MODULES {
        let dir = assets.join(module);
        if !dir.join("module.desc").is_file() {
            missing.push(*module);
        }
    }
    if missing.is_empty() {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "installer module source missing under '{}': {}",
        assets.display(),
        missing.join(", ")
    ))
    .context(BuildErrorKind::InstallerAssetMissing)
}

fn stage_modules(assets: &Path, chroot: &Path) -> Result<()> {
    let dest_root = chroot.join("usr/lib/calamares/modules");
    for module in REQUIRED_INSTALLER_MODULES {
        let src = assets.join(module);
        let dest = dest_root.join(module);
        copy_dir_recursive(&src, &dest)
            .with_context(|| format!("staging installer module '{module}'"))?;
        println!("Staged installer module {module}");
    }
    Ok(())
}

/// The job runner binary the job module descriptors invoke.
fn stage_installer_runner(chroot: &Path) -> Result<()> {
    let exe = std::env::current_exe().context("locating current executable")?;
    let runner = exe
        .parent()
        .map(|dir| dir.join("zforge-install"))
        .filter(|p| p.is_file());

    match runner {
        Some(src) => {
            let dest = chroot.join("usr/bin/zforge-install");
            fs::copy(&src, &dest).context("staging zforge-install")?;
            crate::modules::set_executable(&dest)?;
            Ok(())
        }
        None => Err(anyhow::anyhow!(
            "zforge-install binary not found next to the builder; build both binaries first"
        ))
        .context(BuildErrorKind::InstallerAssetMissing),
    }
}

#[derive(Serialize)]
struct SettingsFile {
    #[serde(rename = "modules-search")]
    modules_search: Vec<String>,
    sequence: Vec<SequencePhase>,
    branding: String,
    #[serde(rename = "prompt-install")]
    prompt_install: bool,
    #[serde(rename = "dont-chroot")]
    dont_chroot: bool,
    #[serde(rename = "disable-cancel-during-exec")]
    disable_cancel_during_exec: bool,
}

#[derive(Serialize)]
enum SequencePhase {
    #[serde(rename = "show")]
    Show(Vec<String>),
    #[serde(rename = "exec")]
    Exec(Vec<String>),
}

/// The installer's show sequence.
pub fn show_sequence() -> Vec<String> {
    [
        "welcome",
        "locale",
        "keyboard",
        "telemetryconsent",
        "network",
        "partition",
        "zfsrootselect",
        "users",
        "summary",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// The installer's exec sequence. `telemetryjob` runs last so a failed
/// submission can never undo completed work.
pub fn exec_sequence() -> Vec<String> {
    [
        "unpackfs",
        "fstab",
        "users",
        "networkcfg",
        "bootloader",
        "zfsbootloader",
        "proxmoxconfig",
        "securityhardening",
        "zforgefinalize",
        "telemetryjob",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn write_settings(ctx: &BuildContext, chroot: &Path) -> Result<()> {
    let settings = SettingsFile {
        modules_search: vec!["local".to_string()],
        sequence: vec![
            SequencePhase::Show(show_sequence()),
            SequencePhase::Exec(exec_sequence()),
            SequencePhase::Show(vec!["finished".to_string()]),
        ],
        branding: "zforge".to_string(),
        prompt_install: true,
        dont_chroot: false,
        disable_cancel_during_exec: true,
    };

    let settings_dir = chroot.join("etc/calamares");
    fs::create_dir_all(&settings_dir).context("creating /etc/calamares")?;
    let yaml = serde_yaml::to_string(&settings).context("serializing Calamares settings")?;
    fs::write(settings_dir.join("settings.conf"), yaml)
        .context("writing Calamares settings.conf")?;

    // Seed the globalstorage defaults the view modules start from.
    let defaults = json!({
        "iso_version": ctx.plan.builder_config.version_tag,
        "telemetry_endpoint_url": ctx.plan.telemetry_config.endpoint_url,
        "security_hardening_profile": ctx.plan.security_config.hardening_profile.as_str(),
        "zfs_default_compression": ctx.plan.zfs_config.default_compression.to_string(),
        "zfs_default_raid_type": ctx.plan.zfs_config.default_raid_type.as_str(),
        "zfs_default_ashift": ctx.plan.zfs_config.default_ashift.to_string(),
        "zfs_default_arc_max": ctx.plan.zfs_config.default_arc_max.to_string(),
        "zfs_encryption_algorithm": ctx.plan.zfs_config.encryption.algorithm,
        "zfs_encryption_pbkdf_iterations": ctx.plan.zfs_config.encryption.pbkdf_iterations,
    });
    fs::write(
        settings_dir.join("zforge-defaults.json"),
        serde_json::to_vec_pretty(&defaults).context("serializing installer defaults")?,
    )
    .context("writing installer defaults")?;
    Ok(())
}

fn write_branding(ctx: &BuildContext, chroot: &Path) -> Result<()> {
    let branding_dir = chroot.join("etc/calamares/branding/zforge");
    fs::create_dir_all(&branding_dir).context("creating branding directory")?;

    let version = &ctx.plan.builder_config.version_tag;
    let branding = format!(
        "componentName: zforge\n\
         welcomeStyleCalamares: false\n\
         windowExpanding: normal\n\
         windowSize: 1024,768\n\
         strings:\n\
         \x20 productName: Z-Forge Proxmox VE\n\
         \x20 shortProductName: Z-Forge\n\
         \x20 version: \"{version}\"\n\
         \x20 shortVersion: \"{version}\"\n\
         \x20 versionedName: Z-Forge Proxmox VE {version}\n\
         \x20 shortVersionedName: Z-Forge {version}\n\
         \x20 bootloaderEntryName: Z-Forge Proxmox\n\
         images:\n\
         \x20 productLogo: logo.png\n\
         \x20 productIcon: icon.png\n\
         slideshow: show.qml\n\
         style:\n\
         \x20 sidebarBackground: \"#292F34\"\n\
         \x20 sidebarText: \"#FFFFFF\"\n\
         \x20 sidebarTextSelect: \"#292F34\"\n"
    );
    fs::write(branding_dir.join("branding.desc"), branding)
        .context("writing branding descriptor")?;
    Ok(())
}

/// Recursive file tree copy preserving permissions.
pub fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("creating directory '{}'", dest.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("reading '{}'", src.display()))? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copying '{}'", entry.path().display()))?;
        }
    }
    Ok(())
}
