//! ISOGeneration: squash the rootfs, assemble the hybrid BIOS/UEFI image,
//! write the checksum sidecars.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::chroot::ChrootSession;
use crate::errors::BuildErrorKind;
use crate::modules::{require_chroot, require_stage_output};
use crate::pipeline::{BuildContext, BuildModule};
use crate::process::Cmd;
use crate::spec::BuildPlan;

/// Files every bootable image must carry, relative to the ISO root.
const REQUIRED_ISO_FILES: &[&str] = &[
    "boot/vmlinuz",
    "boot/initramfs.img",
    "live/filesystem.squashfs",
    "EFI/BOOT/BOOTX64.EFI",
];

pub struct IsoGeneration;

impl BuildModule for IsoGeneration {
    fn name(&self) -> &'static str {
        "ISOGeneration"
    }

    fn execute(&self, ctx: &BuildContext, _resume: Option<&Value>) -> Result<Option<Value>> {
        let chroot = ctx.workspace.chroot_dir();
        require_chroot(&chroot)?;
        require_stage_output(
            &ctx.workspace.efi_dir().join("EFI/BOOT/BOOTX64.EFI"),
            "BootloaderSetup",
        )?;

        let iso_root = ctx.workspace.iso_dir();
        prepare_iso_structure(&iso_root)?;

        scrub_chroot(ctx)?;
        create_squashfs(ctx, &iso_root)?;
        copy_boot_files(ctx, &iso_root)?;
        write_boot_configs(ctx.plan, &iso_root)?;
        stage_efi_tree(ctx, &iso_root)?;
        write_disk_info(ctx.plan, &iso_root)?;

        let output_iso = ctx
            .workspace
            .root()
            .join(&ctx.plan.builder_config.output_iso_name);
        assemble_hybrid_iso(ctx.plan, &iso_root, &output_iso)?;
        verify_iso(&output_iso, &iso_root)?;
        let (sha256, md5) = write_checksums(&output_iso)?;

        let size = fs::metadata(&output_iso)?.len();
        println!(
            "ISO ready: {} ({} MiB)",
            output_iso.display(),
            size / 1024 / 1024
        );

        Ok(Some(json!({
            "iso_path": output_iso,
            "iso_size": size,
            "sha256": sha256,
            "md5": md5,
        })))
    }
}

fn prepare_iso_structure(iso_root: &Path) -> Result<()> {
    for sub in ["boot", "live", "EFI/BOOT", "isolinux", ".disk"] {
        fs::create_dir_all(iso_root.join(sub))
            .with_context(|| format!("creating ISO directory '{sub}'"))?;
    }
    Ok(())
}

/// Drop caches and scratch files before squashing.
fn scrub_chroot(ctx: &BuildContext) -> Result<()> {
    let session = ChrootSession::enter(ctx.workspace, false)?;
    let result = session.run_script(
        "apt-get clean && \
         rm -rf /tmp/* /var/tmp/* /var/cache/apt/archives/*.deb /var/lib/apt/lists/* && \
         mkdir -p /tmp /var/tmp && chmod 1777 /tmp /var/tmp",
    );
    session.release(ctx.workspace)?;
    result.context("scrubbing chroot before squashfs")?;
    Ok(())
}

fn create_squashfs(ctx: &BuildContext, iso_root: &Path) -> Result<()> {
    let squashfs = iso_root.join("live/filesystem.squashfs");
    if squashfs.exists() {
        fs::remove_file(&squashfs).context("removing stale squashfs")?;
    }

    println!("Creating squashfs (this is the long part)...");
    let mut cmd = Cmd::new("mksquashfs")
        .arg_path(&ctx.workspace.chroot_dir())
        .arg_path(&ctx.workspace.live_dir())
        .arg_path(&squashfs)
        .args(["-comp", "zstd", "-Xcompression-level", "19"])
        .args(["-b", "1M"])
        .args(["-noappend", "-no-exports", "-no-duplicates", "-wildcards"]);
    // The shared cache mount point exists inside the chroot but its content
    // must not ship.
    cmd = cmd.args(["-e", "var/cache/zforge"]);
    cmd.error_msg("mksquashfs failed")
        .run_streamed()
        .context(BuildErrorKind::IsoAssembly)?;

    let size = fs::metadata(&squashfs)?.len();
    fs::write(iso_root.join("live/filesystem.size"), size.to_string())
        .context("writing filesystem.size")?;
    println!("Squashfs created: {} MiB", size / 1024 / 1024);
    Ok(())
}

/// Newest kernel and matching initramfs out of the chroot /boot.
fn copy_boot_files(ctx: &BuildContext, iso_root: &Path) -> Result<()> {
    let boot = ctx.workspace.chroot_dir().join("boot");
    let kernel = newest_prefixed(&boot, "vmlinuz-")?
        .ok_or_else(|| anyhow::anyhow!("no vmlinuz-* in the chroot"))
        .context(BuildErrorKind::MissingRequired)?;
    let initramfs = newest_prefixed(&boot, "initramfs-")?
        .ok_or_else(|| anyhow::anyhow!("no initramfs-* in the chroot"))
        .context(BuildErrorKind::MissingRequired)?;

    fs::copy(&kernel, iso_root.join("boot/vmlinuz")).context("copying kernel")?;
    fs::copy(&initramfs, iso_root.join("boot/initramfs.img")).context("copying initramfs")?;
    Ok(())
}

/// Lexically newest file with the given prefix (version sort is close enough
/// for the single-kernel chroot this builder produces).
fn newest_prefixed(dir: &Path, prefix: &str) -> Result<Option<PathBuf>> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("reading '{}'", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix) && !n.ends_with(".img.old"))
        })
        .collect();
    candidates.sort();
    Ok(candidates.pop())
}

fn write_boot_configs(plan: &BuildPlan, iso_root: &Path) -> Result<()> {
    let cmdline = plan.live_cmdline();
    let label = &plan.builder_config.iso_label;

    let isolinux_cfg = format!(
        "DEFAULT menu.c32\n\
         TIMEOUT 100\n\
         PROMPT 0\n\
         \n\
         MENU TITLE {label} installer\n\
         \n\
         LABEL installer\n\
         \x20   MENU LABEL ^Install Proxmox VE (ZFS)\n\
         \x20   MENU DEFAULT\n\
         \x20   KERNEL /boot/vmlinuz\n\
         \x20   APPEND initrd=/boot/initramfs.img {cmdline}\n\
         \n\
         LABEL toram\n\
         \x20   MENU LABEL Install (copy to ^RAM, unplug the medium)\n\
         \x20   KERNEL /boot/vmlinuz\n\
         \x20   APPEND initrd=/boot/initramfs.img {cmdline} zforge.toram=yes\n\
         \n\
         LABEL safe\n\
         \x20   MENU LABEL Install with ^Safe Graphics\n\
         \x20   KERNEL /boot/vmlinuz\n\
         \x20   APPEND initrd=/boot/initramfs.img {cmdline} nomodeset\n\
         \n\
         LABEL recovery\n\
         \x20   MENU LABEL ^Recovery shell (bootloader repair)\n\
         \x20   KERNEL /boot/vmlinuz\n\
         \x20   APPEND initrd=/boot/initramfs.img {cmdline} single\n"
    );
    fs::write(iso_root.join("isolinux/isolinux.cfg"), isolinux_cfg)
        .context("writing isolinux.cfg")?;

    // ZFSBootMenu is the EFI boot program; this grub.cfg is only read when
    // firmware falls back to a shell-provided grub, so keep it equivalent.
    let grub_cfg = format!(
        "set timeout=10\n\
         set default=0\n\
         \n\
         menuentry \"Install Proxmox VE (ZFS)\" {{\n\
         \x20   linux /boot/vmlinuz {cmdline}\n\
         \x20   initrd /boot/initramfs.img\n\
         }}\n\
         \n\
         menuentry \"Install (copy to RAM)\" {{\n\
         \x20   linux /boot/vmlinuz {cmdline} zforge.toram=yes\n\
         \x20   initrd /boot/initramfs.img\n\
         }}\n\
         \n\
         menuentry \"Recovery shell\" {{\n\
         \x20   linux /boot/vmlinuz {cmdline} single\n\
         \x20   initrd /boot/initramfs.img\n\
         }}\n"
    );
    fs::create_dir_all(iso_root.join("boot/grub")).context("creating boot/grub")?;
    fs::write(iso_root.join("boot/grub/grub.cfg"), grub_cfg).context("writing grub.cfg")?;
    Ok(())
}

/// Copy the staged EFI tree and build the El Torito ESP image.
fn stage_efi_tree(ctx: &BuildContext, iso_root: &Path) -> Result<()> {
    crate::modules::calamares::copy_dir_recursive(&ctx.workspace.efi_dir(), iso_root)
        .context("copying EFI staging tree into the ISO root")?;

    if !ctx.plan.bootloader_config.uefi_only {
        copy_isolinux_binaries(ctx, iso_root)?;
    }

    let efiboot = iso_root.join("efiboot.img");
    create_efi_boot_image(&ctx.workspace.efi_dir(), &efiboot)
        .context(BuildErrorKind::IsoAssembly)?;
    Ok(())
}

/// isolinux comes from the host when installed, else from the chroot.
fn copy_isolinux_binaries(ctx: &BuildContext, iso_root: &Path) -> Result<()> {
    let chroot = ctx.workspace.chroot_dir();
    let roots = [PathBuf::from("/"), chroot];

    let files = [
        "usr/lib/ISOLINUX/isolinux.bin",
        "usr/lib/syslinux/modules/bios/ldlinux.c32",
        "usr/lib/syslinux/modules/bios/menu.c32",
        "usr/lib/syslinux/modules/bios/libcom32.c32",
        "usr/lib/syslinux/modules/bios/libutil.c32",
    ];

    for file in files {
        let source = roots.iter().map(|r| r.join(file)).find(|p| p.is_file());
        match source {
            Some(path) => {
                let dest = iso_root.join("isolinux").join(
                    Path::new(file)
                        .file_name()
                        .expect("isolinux paths have file names"),
                );
                fs::copy(&path, &dest)
                    .with_context(|| format!("copying '{}'", path.display()))?;
            }
            None => {
                bail!("isolinux file '{file}' found neither on the host nor in the chroot")
            }
        }
    }
    Ok(())
}

/// FAT image holding the EFI tree for the El Torito alternative boot entry.
fn create_efi_boot_image(efi_dir: &Path, efiboot: &Path) -> Result<()> {
    let size_mb = 16;
    Cmd::new("dd")
        .arg("if=/dev/zero")
        .arg(format!("of={}", efiboot.display()))
        .arg("bs=1M")
        .arg(format!("count={size_mb}"))
        .error_msg("creating efiboot.img")
        .run()?;
    Cmd::new("mkfs.vfat")
        .args(["-F", "16", "-n", "EFIBOOT"])
        .arg_path(efiboot)
        .error_msg("formatting efiboot.img")
        .run()?;

    for dir in ["::EFI", "::EFI/BOOT"] {
        Cmd::new("mmd")
            .arg("-i")
            .arg_path(efiboot)
            .arg(dir)
            .error_msg("creating EFI directories in efiboot.img")
            .run()?;
    }
    Cmd::new("mcopy")
        .arg("-i")
        .arg_path(efiboot)
        .arg_path(&efi_dir.join("EFI/BOOT/BOOTX64.EFI"))
        .arg("::EFI/BOOT/")
        .error_msg("copying BOOTX64.EFI into efiboot.img")
        .run()?;

    if efi_dir.join("EFI/OC").is_dir() {
        Cmd::new("mmd")
            .arg("-i")
            .arg_path(efiboot)
            .arg("::EFI/OC")
            .error_msg("creating EFI/OC in efiboot.img")
            .run()?;
        Cmd::new("mcopy")
            .args(["-s", "-i"])
            .arg_path(efiboot)
            .arg_path(&efi_dir.join("EFI/OC"))
            .arg("::EFI/")
            .error_msg("copying OpenCore tree into efiboot.img")
            .run()?;
    }
    Ok(())
}

fn write_disk_info(plan: &BuildPlan, iso_root: &Path) -> Result<()> {
    let info = format!(
        "{} installer\nVersion: {}\nArchitecture: amd64\n",
        plan.builder_config.iso_label, plan.builder_config.version_tag
    );
    fs::write(iso_root.join(".disk/info"), info).context("writing .disk/info")?;
    Ok(())
}

fn assemble_hybrid_iso(plan: &BuildPlan, iso_root: &Path, output: &Path) -> Result<()> {
    println!("Assembling hybrid ISO with xorriso...");

    let mut cmd = Cmd::new("xorriso")
        .args(["-as", "mkisofs"])
        .args(["-iso-level", "3", "-full-iso9660-filenames"])
        .args(["-volid", &plan.builder_config.iso_label]);

    if !plan.bootloader_config.uefi_only {
        cmd = cmd
            .args(["-eltorito-boot", "isolinux/isolinux.bin"])
            .args(["-eltorito-catalog", "isolinux/boot.cat"])
            .args(["-no-emul-boot", "-boot-load-size", "4", "-boot-info-table"]);
        // The hybrid MBR lives next to isolinux.bin wherever it came from.
        for mbr in [
            "/usr/lib/ISOLINUX/isohdpfx.bin",
            "/usr/lib/syslinux/isohdpfx.bin",
        ] {
            if Path::new(mbr).is_file() {
                cmd = cmd.args(["-isohybrid-mbr", mbr]);
                break;
            }
        }
        cmd = cmd.arg("-eltorito-alt-boot");
    }

    cmd = cmd
        .args(["-e", "efiboot.img"])
        .args(["-no-emul-boot", "-isohybrid-gpt-basdat"])
        .arg("-output")
        .arg_path(output)
        .arg_path(iso_root);

    cmd.error_msg("xorriso failed")
        .run_streamed()
        .context(BuildErrorKind::IsoAssembly)?;
    Ok(())
}

/// The image must exist, be plausibly sized, and carry the required files.
fn verify_iso(output: &Path, iso_root: &Path) -> Result<()> {
    let metadata = fs::metadata(output)
        .with_context(|| format!("ISO '{}' was not produced", output.display()))
        .context(BuildErrorKind::IsoAssembly)?;
    if metadata.len() < 100 * 1024 * 1024 {
        return Err(anyhow::anyhow!(
            "ISO is implausibly small ({} bytes)",
            metadata.len()
        ))
        .context(BuildErrorKind::IsoAssembly);
    }

    for file in REQUIRED_ISO_FILES {
        if !iso_root.join(file).is_file() {
            return Err(anyhow::anyhow!("ISO tree is missing '{file}'"))
                .context(BuildErrorKind::IsoAssembly);
        }
    }
    Ok(())
}

/// SHA256 in-process, MD5 via coreutils; both written as sidecar files in
/// the `<checksum>  <filename>` convention.
fn write_checksums(iso: &Path) -> Result<(String, String)> {
    let sha256 = sha256_file(iso)?;
    let file_name = iso
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("output.iso");
    fs::write(
        iso.with_extension("iso.sha256"),
        format!("{sha256}  {file_name}\n"),
    )
    .context("writing sha256 sidecar")?;

    let md5_out = Cmd::new("md5sum").arg_path(iso).run()?;
    let md5 = md5_out
        .stdout_trimmed()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    fs::write(
        iso.with_extension("iso.md5"),
        format!("{md5}  {file_name}\n"),
    )
    .context("writing md5 sidecar")?;

    Ok((sha256, md5))
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("opening '{}' for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_file_matches_known_vector() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_newest_prefixed_picks_last_sorted() {
        let tmp = TempDir::new().unwrap();
        for name in ["vmlinuz-6.5.0-pve", "vmlinuz-6.8.12-pve", "initramfs-6.8.12-pve.img"] {
            fs::write(tmp.path().join(name), b"x").unwrap();
        }
        let kernel = newest_prefixed(tmp.path(), "vmlinuz-").unwrap().unwrap();
        assert!(kernel.ends_with("vmlinuz-6.8.12-pve"));
        assert!(newest_prefixed(tmp.path(), "zz-").unwrap().is_none());
    }

    #[test]
    fn test_boot_configs_carry_toram_entry() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("isolinux")).unwrap();
        let plan =
            BuildPlan::from_value(serde_yaml::Value::Mapping(Default::default())).unwrap();
        write_boot_configs(&plan, tmp.path()).unwrap();

        let isolinux = fs::read_to_string(tmp.path().join("isolinux/isolinux.cfg")).unwrap();
        assert!(isolinux.contains("zforge.toram=yes"));
        assert!(isolinux.contains("boot=live"));

        let grub = fs::read_to_string(tmp.path().join("boot/grub/grub.cfg")).unwrap();
        assert!(grub.contains("zforge.toram=yes"));
    }

    #[test]
    fn test_verify_iso_flags_missing_payload() {
        let tmp = TempDir::new().unwrap();
        let iso = tmp.path().join("out.iso");
        let file = fs::File::create(&iso).unwrap();
        file.set_len(200 * 1024 * 1024).unwrap();

        let err = verify_iso(&iso, tmp.path()).unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(BuildErrorKind::IsoAssembly)
        );
        assert!(format!("{err:#}").contains("filesystem.squashfs") || format!("{err:#}").contains("vmlinuz"));
    }
}
