//! BootloaderSetup: stage ZFSBootMenu (and optionally OpenCore) under the
//! EFI staging tree and write their configuration templates.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::modules::require_chroot;
use crate::pipeline::{BuildContext, BuildModule};
use crate::process::{retry_network, Cmd, NETWORK_ATTEMPTS};
use crate::spec::BuildPlan;

const ZBM_RELEASE_URL: &str =
    "https://github.com/zbm-dev/zfsbootmenu/releases/latest/download/zfsbootmenu-release-x86_64-latest.EFI";
const OPENCORE_RELEASE_URL: &str =
    "https://github.com/acidanthera/OpenCorePkg/releases/download/0.9.7/OpenCore-0.9.7-RELEASE.zip";

/// Chainload target OpenCore jumps to.
pub const ZBM_EFI_PATH: &str = "\\EFI\\BOOT\\BOOTX64.EFI";

/// Written when the hardware overlay does not provide a device path.
pub const DEVICE_PATH_PLACEHOLDER: &str =
    "PciRoot(0x0)/Pci(0x0,0x0)/Pci(0x0,0x0)/NVMe(0x1,00-00-00-00-00-00-00-00)";

pub struct BootloaderSetup;

impl BuildModule for BootloaderSetup {
    fn name(&self) -> &'static str {
        "BootloaderSetup"
    }

    fn execute(&self, ctx: &BuildContext, _resume: Option<&Value>) -> Result<Option<Value>> {
        let chroot = ctx.workspace.chroot_dir();
        require_chroot(&chroot)?;

        let efi = ctx.workspace.efi_dir();
        let boot_dir = efi.join("EFI/BOOT");
        fs::create_dir_all(&boot_dir).context("creating EFI staging tree")?;

        let zbm_image = acquire_zfsbootmenu(ctx)?;
        fs::copy(&zbm_image, boot_dir.join("BOOTX64.EFI"))
            .with_context(|| format!("staging '{}'", zbm_image.display()))?;
        println!("Staged ZFSBootMenu as EFI/BOOT/BOOTX64.EFI");

        // The installer-side bootloader job takes its images from here.
        let live_assets = chroot.join("usr/share/zforge/bootloaders");
        fs::create_dir_all(&live_assets).context("creating live bootloader asset directory")?;
        fs::copy(&zbm_image, live_assets.join("zfsbootmenu.EFI"))
            .context("staging ZFSBootMenu for the installer")?;

        write_zbm_config(ctx.plan, &chroot)?;

        let mut staged_opencore = false;
        if ctx.plan.bootloader_config.enable_opencore {
            stage_opencore(ctx, &efi)?;
            staged_opencore = true;
        }

        Ok(Some(json!({
            "zfsbootmenu": "EFI/BOOT/BOOTX64.EFI",
            "opencore": staged_opencore,
        })))
    }
}

/// Find a ZFSBootMenu EFI image in the chroot, or download the release build
/// into the package cache.
fn acquire_zfsbootmenu(ctx: &BuildContext) -> Result<PathBuf> {
    let chroot = ctx.workspace.chroot_dir();
    let candidates = [
        "usr/lib/zfsbootmenu/zfsbootmenu.EFI",
        "usr/share/zfsbootmenu/zfsbootmenu.EFI",
        "usr/bin/zfsbootmenu.efi",
    ];
    for candidate in candidates {
        let path = chroot.join(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }

    let cached = ctx.workspace.cache_dir().join("zfsbootmenu.EFI");
    if !cached.is_file() {
        println!("Downloading ZFSBootMenu release image");
        retry_network("downloading ZFSBootMenu", NETWORK_ATTEMPTS, || {
            Cmd::new("curl")
                .args(["-fL", "-o"])
                .arg_path(&cached)
                .arg(ZBM_RELEASE_URL)
                .error_msg("ZFSBootMenu download failed")
                .run_streamed()
        })?;
    }
    Ok(cached)
}

fn write_zbm_config(plan: &BuildPlan, chroot: &Path) -> Result<()> {
    let config_dir = chroot.join("etc/zfsbootmenu");
    fs::create_dir_all(config_dir.join("dracut.conf.d"))
        .context("creating /etc/zfsbootmenu")?;

    fs::write(
        config_dir.join("config.yaml"),
        zbm_config_yaml("rpool", "ROOT/pve", plan.hardware_config.serial_console.as_deref()),
    )
    .context("writing zfsbootmenu config.yaml")?;

    let dracut_conf = "# ZFSBootMenu dracut configuration\n\
                       add_dracutmodules+=\" zfs \"\n\
                       omit_dracutmodules+=\" btrfs resume usrmount \"\n\
                       compress=\"zstd\"\n";
    fs::write(
        config_dir.join("dracut.conf.d/zfsbootmenu.conf"),
        dracut_conf,
    )
    .context("writing zfsbootmenu dracut configuration")?;
    Ok(())
}

/// ZFSBootMenu configuration template for the installed system.
pub fn zbm_config_yaml(pool: &str, dataset: &str, serial_console: Option<&str>) -> String {
    let mut cmdline = "ro quiet loglevel=4".to_string();
    if let Some(serial) = serial_console {
        cmdline.push(' ');
        cmdline.push_str(serial);
    }
    format!(
        "Global:\n\
        \x20 ManageImages: true\n\
        \x20 BootMountPoint: /boot/efi\n\
        \x20 DracutConfDir: /etc/zfsbootmenu/dracut.conf.d\n\
        Components:\n\
        \x20 ImageDir: /boot/efi/EFI/zfsbootmenu\n\
        \x20 Versions: 3\n\
        \x20 Enabled: false\n\
        EFI:\n\
        \x20 ImageDir: /boot/efi/EFI/zfsbootmenu\n\
        \x20 Versions: false\n\
        \x20 Enabled: true\n\
        Kernel:\n\
        \x20 CommandLine: \"{cmdline}\"\n\
        \x20 Prefix: vmlinuz\n\
        ZFS:\n\
        \x20 PoolName: {pool}\n\
        \x20 DefaultSet: {pool}/{dataset}\n\
        \x20 ShowSnapshots: true\n"
    )
}

fn stage_opencore(ctx: &BuildContext, efi: &Path) -> Result<()> {
    let oc_dir = efi.join("EFI/OC");
    fs::create_dir_all(oc_dir.join("Drivers")).context("creating EFI/OC tree")?;

    let oc_cache = acquire_opencore(ctx)?;
    let oc_efi_src = oc_cache.join("X64/EFI/OC/OpenCore.efi");
    if !oc_efi_src.is_file() {
        bail!(
            "OpenCore.efi not found in the extracted release at '{}'",
            oc_efi_src.display()
        );
    }
    fs::copy(&oc_efi_src, oc_dir.join("OpenCore.efi")).context("staging OpenCore.efi")?;

    for driver in &ctx.plan.bootloader_config.opencore_drivers {
        let src = oc_cache.join("X64/EFI/OC/Drivers").join(driver);
        if src.is_file() {
            fs::copy(&src, oc_dir.join("Drivers").join(driver))
                .with_context(|| format!("staging OpenCore driver '{driver}'"))?;
        } else {
            log::warn!("OpenCore driver '{driver}' not present in the release archive");
        }
    }

    let device_path = match &ctx.plan.hardware_config.opencore_device_path {
        Some(path) => path.clone(),
        None => {
            log::warn!(
                "hardware overlay provides no OpenCore device path; writing placeholder '{}'",
                DEVICE_PATH_PLACEHOLDER
            );
            DEVICE_PATH_PLACEHOLDER.to_string()
        }
    };

    fs::write(
        oc_dir.join("config.plist"),
        opencore_config_plist(&device_path, &ctx.plan.bootloader_config.opencore_drivers),
    )
    .context("writing OpenCore config.plist")?;

    // Mirror the staged tree into the live rootfs for the installer job.
    let live_assets = ctx
        .workspace
        .chroot_dir()
        .join("usr/share/zforge/bootloaders/opencore/EFI");
    crate::modules::calamares::copy_dir_recursive(&efi.join("EFI"), &live_assets)
        .context("staging OpenCore for the installer")?;

    println!("Staged OpenCore chainloader under EFI/OC");
    Ok(())
}

fn acquire_opencore(ctx: &BuildContext) -> Result<PathBuf> {
    let cache = ctx.workspace.cache_dir();
    let extract_dir = cache.join("opencore");
    if extract_dir.join("X64/EFI/OC/OpenCore.efi").is_file() {
        return Ok(extract_dir);
    }

    let archive = cache.join("opencore-release.zip");
    if !archive.is_file() {
        println!("Downloading OpenCore release");
        retry_network("downloading OpenCore", NETWORK_ATTEMPTS, || {
            Cmd::new("curl")
                .args(["-fL", "-o"])
                .arg_path(&archive)
                .arg(OPENCORE_RELEASE_URL)
                .error_msg("OpenCore download failed")
                .run_streamed()
        })?;
    }

    fs::create_dir_all(&extract_dir).context("creating OpenCore extract directory")?;
    Cmd::new("unzip")
        .args(["-o", "-q"])
        .arg_path(&archive)
        .arg("-d")
        .arg_path(&extract_dir)
        .error_msg("extracting OpenCore release")
        .run()?;
    Ok(extract_dir)
}

/// A single-entry OpenCore configuration that chainloads ZFSBootMenu through
/// the given PCIe device path.
pub fn opencore_config_plist(device_path: &str, drivers: &[String]) -> String {
    let driver_entries: String = drivers
        .iter()
        .map(|d| format!("\t\t\t<string>{d}</string>\n"))
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>Misc</key>
	<dict>
		<key>Boot</key>
		<dict>
			<key>ShowPicker</key>
			<false/>
			<key>Timeout</key>
			<integer>0</integer>
		</dict>
		<key>Entries</key>
		<array>
			<dict>
				<key>Name</key>
				<string>ZFSBootMenu</string>
				<key>Enabled</key>
				<true/>
				<key>Path</key>
				<string>{device_path}{zbm}</string>
			</dict>
		</array>
	</dict>
	<key>UEFI</key>
	<dict>
		<key>Drivers</key>
		<array>
{driver_entries}		</array>
		<key>ConnectDrivers</key>
		<true/>
	</dict>
</dict>
</plist>
"#,
        zbm = ZBM_EFI_PATH,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zbm_config_defaults() {
        let config = zbm_config_yaml("rpool", "ROOT/pve", None);
        assert!(config.contains("ManageImages: true"));
        assert!(config.contains("DefaultSet: rpool/ROOT/pve"));
        assert!(config.contains("ShowSnapshots: true"));
        assert!(config.contains("CommandLine: \"ro quiet loglevel=4\""));
    }

    #[test]
    fn test_zbm_config_serial_console() {
        let config = zbm_config_yaml("rpool", "ROOT/pve", Some("console=ttyS0,115200n8"));
        assert!(config.contains("ro quiet loglevel=4 console=ttyS0,115200n8"));
    }

    #[test]
    fn test_opencore_plist_single_chainload_entry() {
        let drivers = vec!["NvmExpressDxe.efi".to_string(), "OpenRuntime.efi".to_string()];
        let plist = opencore_config_plist("PciRoot(0x0)/Pci(0x1,0x0)", &drivers);

        assert_eq!(plist.matches("<key>Entries</key>").count(), 1);
        assert!(plist.contains("PciRoot(0x0)/Pci(0x1,0x0)\\EFI\\BOOT\\BOOTX64.EFI"));
        assert!(plist.contains("<string>NvmExpressDxe.efi</string>"));
        assert!(plist.contains("<string>OpenRuntime.efi</string>"));
    }

    #[test]
    fn test_placeholder_is_a_pcie_path() {
        assert!(DEVICE_PATH_PLACEHOLDER.starts_with("PciRoot("));
        assert!(DEVICE_PATH_PLACEHOLDER.contains("NVMe"));
    }
}
