//! Debootstrap: minimal Debian base system in the chroot.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;

use crate::chroot::ChrootSession;
use crate::errors::BuildErrorKind;
use crate::pipeline::{BuildContext, BuildModule};
use crate::process::{retry_network, Cmd, NETWORK_ATTEMPTS};

const DEBIAN_MIRROR: &str = "http://deb.debian.org/debian";

/// Seed packages installed by debootstrap itself.
const SEED_PACKAGES: &[&str] = &[
    "locales",
    "linux-base",
    "sudo",
    "bash-completion",
    "apt-transport-https",
    "ca-certificates",
    "curl",
    "wget",
    "gnupg",
];

pub struct Debootstrap;

impl BuildModule for Debootstrap {
    fn name(&self) -> &'static str {
        "Debootstrap"
    }

    fn execute(&self, ctx: &BuildContext, resume: Option<&Value>) -> Result<Option<Value>> {
        let release = ctx.plan.builder_config.debian_release;
        let chroot = ctx.workspace.chroot_dir();

        let bootstrapped = resume
            .and_then(|r| r.get("bootstrapped"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || chroot.join("etc/debian_version").exists();

        if bootstrapped {
            println!("Base system already bootstrapped, configuring only");
        } else {
            println!("Bootstrapping Debian {} ...", release.as_str());
            run_debootstrap(ctx)?;
        }

        configure_base_files(ctx)?;

        let session = ChrootSession::enter(ctx.workspace, ctx.plan.builder_config.cache_packages)?;
        let result = configure_in_chroot(&session);
        session.release(ctx.workspace)?;
        result?;

        Ok(Some(json!({
            "bootstrapped": true,
            "debian_release": release.as_str(),
        })))
    }
}

fn run_debootstrap(ctx: &BuildContext) -> Result<()> {
    let release = ctx.plan.builder_config.debian_release;
    let chroot = ctx.workspace.chroot_dir();

    retry_network("debootstrap", NETWORK_ATTEMPTS, || {
        Cmd::new("debootstrap")
            .arg("--arch=amd64")
            .arg("--variant=minbase")
            .arg(format!("--include={}", SEED_PACKAGES.join(",")))
            .arg(release.as_str())
            .arg_path(&chroot)
            .arg(DEBIAN_MIRROR)
            .error_msg("debootstrap failed")
            .run_streamed()
    })?;
    Ok(())
}

fn configure_base_files(ctx: &BuildContext) -> Result<()> {
    let release = ctx.plan.builder_config.debian_release.as_str();
    let chroot = ctx.workspace.chroot_dir();

    let sources = format!(
        "# Main Debian repositories\n\
         deb {m} {r} main contrib non-free non-free-firmware\n\
         deb {m} {r}-updates main contrib non-free non-free-firmware\n\
         deb http://security.debian.org/debian-security {r}-security main contrib non-free non-free-firmware\n\
         \n\
         # Backports\n\
         deb {m} {r}-backports main contrib non-free non-free-firmware\n",
        m = DEBIAN_MIRROR,
        r = release
    );
    fs::write(chroot.join("etc/apt/sources.list"), sources)
        .context("writing sources.list")?;

    if ctx.plan.builder_config.cache_packages {
        // Route apt's archive cache at the bind-mounted shared cache.
        let apt_conf = format!(
            "Dir::Cache::archives \"/{}/apt\";\n",
            crate::chroot::CHROOT_CACHE_DIR
        );
        let conf_dir = chroot.join("etc/apt/apt.conf.d");
        fs::create_dir_all(&conf_dir).context("creating apt.conf.d")?;
        fs::write(conf_dir.join("01zforge-cache"), apt_conf)
            .context("writing apt cache configuration")?;
        fs::create_dir_all(ctx.workspace.cache_dir().join("apt/partial"))
            .context("creating apt cache directory")?;
    }

    fs::write(chroot.join("etc/hostname"), "zforge\n").context("writing hostname")?;

    let hosts = "127.0.0.1   localhost\n\
                 127.0.1.1   zforge\n\
                 \n\
                 ::1     localhost ip6-localhost ip6-loopback\n\
                 ff02::1 ip6-allnodes\n\
                 ff02::2 ip6-allrouters\n";
    fs::write(chroot.join("etc/hosts"), hosts).context("writing hosts")?;

    let fstab = "# <file system>  <mount point>  <type>  <options>  <dump>  <pass>\n\
                 proc             /proc          proc    defaults   0       0\n";
    fs::write(chroot.join("etc/fstab"), fstab).context("writing fstab")?;

    Ok(())
}

fn configure_in_chroot(session: &ChrootSession) -> Result<()> {
    retry_network("apt-get update", NETWORK_ATTEMPTS, || {
        session.run(["apt-get", "update"])
    })?;

    session
        .run(["apt-get", "upgrade", "-y"])
        .context(BuildErrorKind::PackageInstall)?;

    session
        .run_script("echo 'en_US.UTF-8 UTF-8' >> /etc/locale.gen && locale-gen")
        .context("generating locales")?;
    session.run(["ln", "-sf", "/usr/share/zoneinfo/UTC", "/etc/localtime"])?;

    Ok(())
}
