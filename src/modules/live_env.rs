//! LiveEnvironment: live-boot packages, the unprivileged live user with
//! installer-only sudo, display-manager autologin and installer autostart.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::chroot::ChrootSession;
use crate::errors::BuildErrorKind;
use crate::modules::require_chroot;
use crate::pipeline::{BuildContext, BuildModule};

pub const LIVE_USER: &str = "zforge";

const LIVE_PACKAGES: &[&str] = &[
    "live-boot",
    "live-config",
    "live-config-systemd",
    "systemd-sysv",
    "network-manager",
    "firmware-linux-free",
    "firmware-misc-nonfree",
    "dbus",
    "pciutils",
    "usbutils",
    "efibootmgr",
    "rsync",
    "xserver-xorg",
    "xfce4",
    "xfce4-terminal",
    "lightdm",
    "lightdm-gtk-greeter",
];

pub struct LiveEnvironment;

impl BuildModule for LiveEnvironment {
    fn name(&self) -> &'static str {
        "LiveEnvironment"
    }

    fn execute(&self, ctx: &BuildContext, _resume: Option<&Value>) -> Result<Option<Value>> {
        let chroot = ctx.workspace.chroot_dir();
        require_chroot(&chroot)?;

        let session = ChrootSession::enter(ctx.workspace, ctx.plan.builder_config.cache_packages)?;
        let result = install_and_configure(&session);
        session.release(ctx.workspace)?;
        result?;

        write_live_config(&chroot)?;
        write_autologin(&chroot)?;
        write_installer_autostart(&chroot)?;
        write_sudoers(&chroot)?;
        write_branding(ctx, &chroot)?;

        Ok(Some(json!({ "live_user": LIVE_USER })))
    }
}

fn install_and_configure(session: &ChrootSession) -> Result<()> {
    session
        .run_script(&format!(
            "apt-get install -y {}",
            LIVE_PACKAGES.join(" ")
        ))
        .context(BuildErrorKind::PackageInstall)
        .context("installing live environment packages")?;

    // Unprivileged account the live session runs as.
    session.run_script(&format!(
        "id -u {LIVE_USER} >/dev/null 2>&1 || \
         useradd -m -s /bin/bash -G audio,video,netdev,plugdev {LIVE_USER}"
    ))?;

    for service in ["NetworkManager", "lightdm"] {
        session.run_allow_fail(["systemctl", "enable", service])?;
    }
    for service in ["apt-daily.timer", "apt-daily-upgrade.timer"] {
        session.run_allow_fail(["systemctl", "disable", service])?;
    }
    Ok(())
}

fn write_live_config(chroot: &Path) -> Result<()> {
    let live_config = format!(
        "# Z-Forge live configuration\n\
         LIVE_HOSTNAME=\"zforge-live\"\n\
         LIVE_USERNAME=\"{LIVE_USER}\"\n\
         LIVE_USER_FULLNAME=\"Z-Forge Installer\"\n\
         LIVE_USER_DEFAULT_GROUPS=\"audio cdrom video plugdev netdev\"\n\
         LIVE_LOCALES=\"en_US.UTF-8\"\n\
         LIVE_TIMEZONE=\"UTC\"\n\
         LIVE_KEYBOARD_MODEL=\"pc105\"\n\
         LIVE_KEYBOARD_LAYOUTS=\"us\"\n"
    );
    let config_path = chroot.join("etc/live/config.conf");
    fs::create_dir_all(config_path.parent().unwrap()).context("creating /etc/live")?;
    fs::write(&config_path, live_config).context("writing live config")?;
    Ok(())
}

fn write_autologin(chroot: &Path) -> Result<()> {
    let lightdm_conf = format!(
        "[Seat:*]\n\
         autologin-guest=false\n\
         autologin-user={LIVE_USER}\n\
         autologin-user-timeout=0\n\
         autologin-session=xfce\n"
    );
    let conf_dir = chroot.join("etc/lightdm/lightdm.conf.d");
    fs::create_dir_all(&conf_dir).context("creating lightdm.conf.d")?;
    fs::write(conf_dir.join("10-zforge-autologin.conf"), lightdm_conf)
        .context("writing lightdm autologin configuration")?;
    Ok(())
}

fn write_installer_autostart(chroot: &Path) -> Result<()> {
    let desktop_entry = "[Desktop Entry]\n\
         Type=Application\n\
         Version=1.0\n\
         Name=Install Proxmox VE\n\
         Comment=Install Proxmox VE onto a ZFS pool\n\
         Exec=sudo calamares\n\
         Icon=calamares\n\
         Terminal=false\n\
         StartupNotify=true\n\
         Categories=System;\n";

    let autostart_dir = chroot.join("etc/xdg/autostart");
    fs::create_dir_all(&autostart_dir).context("creating xdg autostart directory")?;
    fs::write(autostart_dir.join("zforge-installer.desktop"), desktop_entry)
        .context("writing installer autostart entry")?;

    let apps_dir = chroot.join("usr/share/applications");
    fs::create_dir_all(&apps_dir).context("creating applications directory")?;
    fs::write(apps_dir.join("zforge-installer.desktop"), desktop_entry)
        .context("writing installer launcher")?;
    Ok(())
}

/// Passwordless sudo for the installer tooling only.
fn write_sudoers(chroot: &Path) -> Result<()> {
    let sudoers = format!(
        "{LIVE_USER} ALL=(root) NOPASSWD: /usr/bin/calamares, /usr/bin/zforge-install\n"
    );
    let sudoers_dir = chroot.join("etc/sudoers.d");
    fs::create_dir_all(&sudoers_dir).context("creating sudoers.d")?;
    let path = sudoers_dir.join("zforge-installer");
    fs::write(&path, sudoers).context("writing installer sudoers entry")?;
    let mut perms = fs::metadata(&path)?.permissions();
    perms.set_mode(0o440);
    fs::set_permissions(&path, perms).context("restricting sudoers permissions")?;
    Ok(())
}

fn write_branding(ctx: &BuildContext, chroot: &Path) -> Result<()> {
    let issue = format!(
        "Z-Forge Proxmox VE installer {} \\n \\l\n",
        ctx.plan.builder_config.version_tag
    );
    fs::write(chroot.join("etc/issue"), issue).context("writing /etc/issue")?;

    let os_release_dir = chroot.join("usr/share/zforge");
    fs::create_dir_all(&os_release_dir).context("creating branding directory")?;
    fs::write(
        os_release_dir.join("build-info"),
        format!(
            "name={}\nversion={}\n",
            ctx.plan.builder_config.iso_label, ctx.plan.builder_config.version_tag
        ),
    )
    .context("writing build info")?;
    Ok(())
}
