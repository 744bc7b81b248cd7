//! DracutConfig: replace initramfs-tools with a ZFS-aware dracut stack and
//! generate the initramfs, including the copy-to-RAM hook for the live
//! medium.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::chroot::ChrootSession;
use crate::errors::BuildErrorKind;
use crate::modules::kernel::installed_kernel_release;
use crate::modules::{require_chroot, require_stage_output};
use crate::pipeline::{BuildContext, BuildModule};
use crate::spec::BuildPlan;

const DRACUT_PACKAGES: &[&str] = &["dracut", "dracut-core", "dracut-network", "dracut-squash"];

pub struct DracutConfig;

impl BuildModule for DracutConfig {
    fn name(&self) -> &'static str {
        "DracutConfig"
    }

    fn execute(&self, ctx: &BuildContext, _resume: Option<&Value>) -> Result<Option<Value>> {
        let chroot = ctx.workspace.chroot_dir();
        require_chroot(&chroot)?;
        require_stage_output(&chroot.join("lib/modules"), "KernelAcquisition")?;

        write_dracut_configuration(ctx.plan, &chroot)?;
        install_toram_module(&chroot)?;

        let session = ChrootSession::enter(ctx.workspace, ctx.plan.builder_config.cache_packages)?;
        let result = configure_and_generate(&session);
        session.release(ctx.workspace)?;
        let (dracut_version, kernel_release) = result?;

        Ok(Some(json!({
            "dracut_version": dracut_version,
            "kernel_release": kernel_release,
        })))
    }
}

fn configure_and_generate(session: &ChrootSession) -> Result<(String, String)> {
    // initramfs-tools and dracut fight over update-initramfs; the removal is
    // tolerated to fail when it was never installed.
    session.run_allow_fail(["apt-get", "remove", "-y", "initramfs-tools"])?;

    session
        .run_script(&format!(
            "apt-get install -y {}",
            DRACUT_PACKAGES.join(" ")
        ))
        .context(BuildErrorKind::PackageInstall)
        .context("installing dracut")?;

    // ZFS needs a stable host identity in the initramfs.
    session.run_script(
        "test -e /etc/hostid || zgenhostid \"$(hexdump -n 4 -e '\"0x%08x\"' /dev/urandom)\"",
    )?;

    let kernel_release = installed_kernel_release(session)?;
    println!("Generating initramfs for kernel {kernel_release}");
    session
        .run([
            "dracut",
            "--force",
            &format!("/boot/initramfs-{kernel_release}.img"),
            &kernel_release,
        ])
        .context(BuildErrorKind::InitramfsRegen)
        .context("dracut failed")?;

    // Compatibility name used by tools that expect the Debian convention.
    session.run([
        "ln",
        "-sf",
        &format!("initramfs-{kernel_release}.img"),
        &format!("/boot/initrd.img-{kernel_release}"),
    ])?;

    let dracut_version = session
        .run_allow_fail(["dracut", "--version"])?
        .stdout_trimmed()
        .to_string();

    Ok((dracut_version, kernel_release))
}

fn write_dracut_configuration(plan: &BuildPlan, chroot: &Path) -> Result<()> {
    let conf_dir = chroot.join("etc/dracut.conf.d");
    fs::create_dir_all(&conf_dir).context("creating dracut.conf.d")?;

    let dracut = &plan.dracut_config;
    let mut drivers: Vec<&str> = dracut.extra_drivers.iter().map(String::as_str).collect();
    for extra in &plan.hardware_config.extra_drivers {
        if !drivers.contains(&extra.as_str()) {
            drivers.push(extra);
        }
    }

    let main_conf = format!(
        "# Z-Forge dracut configuration\n\
         \n\
         compress=\"{compress}\"\n\
         \n\
         add_dracutmodules+=\" {modules} \"\n\
         \n\
         filesystems+=\" zfs \"\n\
         \n\
         hostonly=\"{hostonly}\"\n\
         \n\
         kernel_cmdline=\"{cmdline}\"\n\
         \n\
         add_drivers+=\" {drivers} \"\n",
        compress = dracut.compression.as_str(),
        modules = dracut.modules.join(" "),
        hostonly = if dracut.hostonly { "yes" } else { "no" },
        cmdline = dracut.kernel_cmdline,
        drivers = drivers.join(" "),
    );
    fs::write(conf_dir.join("zforge.conf"), main_conf).context("writing zforge.conf")?;

    let zfs_conf = "# ZFS dracut configuration\n\
                    \n\
                    install_optional_items+=\" /etc/hostid /etc/zfs/zpool.cache \"\n\
                    \n\
                    install_items+=\" /usr/sbin/zfs /usr/sbin/zpool \"\n";
    fs::write(conf_dir.join("zfs.conf"), zfs_conf).context("writing zfs.conf")?;

    Ok(())
}

/// The 99zforge-toram dracut module: when `zforge.toram=yes` or `toram` is on
/// the kernel command line, the squashfs is copied into a tmpfs and the boot
/// medium can be removed after boot.
fn install_toram_module(chroot: &Path) -> Result<()> {
    let module_dir = chroot.join("usr/lib/dracut/modules.d/99zforge-toram");
    fs::create_dir_all(&module_dir).context("creating toram dracut module directory")?;

    write_executable(&module_dir.join("module-setup.sh"), TORAM_MODULE_SETUP)?;
    write_executable(&module_dir.join("zforge-toram.sh"), TORAM_HOOK)?;
    Ok(())
}

fn write_executable(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).with_context(|| format!("writing '{}'", path.display()))?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

const TORAM_MODULE_SETUP: &str = r#"#!/bin/bash

check() {
    return 0
}

depends() {
    echo base
    return 0
}

install() {
    inst_multiple losetup blockdev awk
    inst_hook pre-mount 20 "$moddir/zforge-toram.sh"
}
"#;

const TORAM_HOOK: &str = r#"#!/bin/sh
# Copy the live squashfs into RAM when requested on the kernel command line.
#
#   zforge.toram=yes (or bare "toram")  enable the copy
#   findiso=<path>                      squashfs path on the live medium

command -v getarg >/dev/null || . /lib/dracut-lib.sh

toram="$(getarg zforge.toram=)"
if [ "$toram" != "yes" ] && ! getargbool 0 toram; then
    exit 0
fi

squash_path="$(getarg findiso=)"
[ -n "$squash_path" ] || squash_path="/live/filesystem.squashfs"

medium="/run/initramfs/live"
squash="$medium$squash_path"
if [ ! -f "$squash" ]; then
    warn "zforge-toram: no squashfs at $squash, staying on the boot medium"
    exit 0
fi

squash_kb=$(( $(blockdev --getsize64 "$squash" 2>/dev/null || stat -c %s "$squash") / 1024 ))
avail_kb=$(awk '/MemAvailable:/ {print $2}' /proc/meminfo)
total_kb=$(awk '/MemTotal:/ {print $2}' /proc/meminfo)
buffer_kb=$(( 256 * 1024 ))
limit_kb=$(( total_kb * 75 / 100 ))

if [ $(( squash_kb + buffer_kb )) -gt "$avail_kb" ] || [ "$squash_kb" -gt "$limit_kb" ]; then
    warn "zforge-toram: not enough RAM (${squash_kb}kB image, ${avail_kb}kB available), staying on the boot medium"
    exit 0
fi

info "zforge-toram: copying ${squash_kb}kB squashfs into RAM"
mkdir -p /run/zforge/toram
mount -t tmpfs -o size=$(( squash_kb + 1024 ))k zforge-toram /run/zforge/toram
if ! cp "$squash" /run/zforge/toram/filesystem.squashfs; then
    warn "zforge-toram: copy failed, staying on the boot medium"
    umount /run/zforge/toram
    exit 0
fi

loopdev=$(losetup -f --show /run/zforge/toram/filesystem.squashfs)
mkdir -p "$NEWROOT"
mount -t squashfs -o ro "$loopdev" "$NEWROOT"
info "zforge-toram: root switched to in-RAM image on $loopdev"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::BuildPlan;
    use tempfile::TempDir;

    fn default_plan() -> BuildPlan {
        BuildPlan::from_value(serde_yaml::Value::Mapping(Default::default())).unwrap()
    }

    #[test]
    fn test_dracut_configuration_contents() {
        let tmp = TempDir::new().unwrap();
        write_dracut_configuration(&default_plan(), tmp.path()).unwrap();

        let main = fs::read_to_string(tmp.path().join("etc/dracut.conf.d/zforge.conf")).unwrap();
        assert!(main.contains("compress=\"zstd\""));
        assert!(main.contains("add_dracutmodules+=\" zfs systemd \""));
        assert!(main.contains("hostonly=\"yes\""));
        assert!(main.contains("kernel_cmdline=\"root=zfs:AUTO\""));
        assert!(main.contains("add_drivers+=\" nvme \""));

        let zfs = fs::read_to_string(tmp.path().join("etc/dracut.conf.d/zfs.conf")).unwrap();
        assert!(zfs.contains("/etc/hostid"));
        assert!(zfs.contains("/etc/zfs/zpool.cache"));
        assert!(zfs.contains("/usr/sbin/zfs /usr/sbin/zpool"));
    }

    #[test]
    fn test_overlay_drivers_are_appended_once() {
        let tmp = TempDir::new().unwrap();
        let mut plan = default_plan();
        plan.hardware_config.extra_drivers =
            vec!["megaraid_sas".to_string(), "nvme".to_string()];
        write_dracut_configuration(&plan, tmp.path()).unwrap();

        let main = fs::read_to_string(tmp.path().join("etc/dracut.conf.d/zforge.conf")).unwrap();
        assert!(main.contains("add_drivers+=\" nvme megaraid_sas \""));
    }

    #[test]
    fn test_toram_module_files_are_executable() {
        let tmp = TempDir::new().unwrap();
        install_toram_module(tmp.path()).unwrap();

        let hook = tmp
            .path()
            .join("usr/lib/dracut/modules.d/99zforge-toram/zforge-toram.sh");
        let mode = fs::metadata(&hook).unwrap().permissions().mode();
        assert_eq!(mode & 0o755, 0o755);

        let content = fs::read_to_string(&hook).unwrap();
        assert!(content.contains("zforge.toram="));
        assert!(content.contains("findiso="));
        assert!(content.contains("256 * 1024"));
        assert!(content.contains("75 / 100"));
    }
}
