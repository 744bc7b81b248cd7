//! ZFSBuild: OpenZFS via DKMS packages or built from source against the
//! installed kernel headers.

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::chroot::ChrootSession;
use crate::errors::BuildErrorKind;
use crate::modules::kernel::installed_kernel_release;
use crate::modules::require_chroot;
use crate::pipeline::{BuildContext, BuildModule};
use crate::process::{retry_network, NETWORK_ATTEMPTS};

const ZFS_REPO: &str = "https://github.com/openzfs/zfs.git";
const ZFS_FALLBACK_VERSION: &str = "2.2.4";

/// Build dependencies for a from-source OpenZFS build.
const BUILD_DEPS: &[&str] = &[
    "build-essential",
    "autoconf",
    "automake",
    "libtool",
    "gawk",
    "alien",
    "fakeroot",
    "dkms",
    "libblkid-dev",
    "uuid-dev",
    "libudev-dev",
    "libssl-dev",
    "zlib1g-dev",
    "libaio-dev",
    "libattr1-dev",
    "libelf-dev",
    "python3",
    "python3-dev",
    "python3-setuptools",
    "python3-cffi",
    "libffi-dev",
    "git",
];

pub struct ZfsBuild;

impl BuildModule for ZfsBuild {
    fn name(&self) -> &'static str {
        "ZFSBuild"
    }

    fn execute(&self, ctx: &BuildContext, resume: Option<&Value>) -> Result<Option<Value>> {
        require_chroot(&ctx.workspace.chroot_dir())?;

        let session = ChrootSession::enter(ctx.workspace, ctx.plan.builder_config.cache_packages)?;
        let result = build(ctx, &session, resume);
        session.release(ctx.workspace)?;
        result
    }
}

fn build(
    ctx: &BuildContext,
    session: &ChrootSession,
    resume: Option<&Value>,
) -> Result<Option<Value>> {
    let kernel_release = installed_kernel_release(session)?;

    if ctx.plan.zfs_config.build_from_source {
        let version = resume
            .and_then(|r| r.get("zfs_version"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .map(Ok)
            .unwrap_or_else(|| resolve_version(ctx, session))?;
        build_from_source(session, &version, &kernel_release)?;
        verify_module(session, &kernel_release)?;
        Ok(Some(json!({
            "zfs_version": version,
            "kernel_release": kernel_release,
            "from_source": true,
        })))
    } else {
        install_dkms_packages(session)?;
        verify_module(session, &kernel_release)?;
        let version = installed_version(session);
        Ok(Some(json!({
            "zfs_version": version,
            "kernel_release": kernel_release,
            "from_source": false,
        })))
    }
}

fn install_dkms_packages(session: &ChrootSession) -> Result<()> {
    println!("Installing ZFS via DKMS packages");
    session
        .run(["apt-get", "install", "-y", "zfs-dkms", "zfsutils-linux", "zfs-zed"])
        .context(BuildErrorKind::PackageInstall)
        .context("installing zfs-dkms")?;
    Ok(())
}

fn resolve_version(ctx: &BuildContext, session: &ChrootSession) -> Result<String> {
    if ctx.plan.zfs_config.version != "latest" {
        return Ok(ctx.plan.zfs_config.version.clone());
    }
    // Newest release tag from the upstream repository; falls back to a known
    // good version when the listing is unreachable.
    let script = format!(
        "git ls-remote --tags --refs {ZFS_REPO} \
         | grep -E 'refs/tags/zfs-[0-9]+\\.[0-9]+\\.[0-9]+$' \
         | sed 's|.*refs/tags/zfs-||' | sort -V | tail -1"
    );
    match session.run_script(&script) {
        Ok(result) if !result.stdout_trimmed().is_empty() => {
            Ok(result.stdout_trimmed().to_string())
        }
        _ => {
            log::warn!(
                "could not resolve latest OpenZFS release, using {}",
                ZFS_FALLBACK_VERSION
            );
            Ok(ZFS_FALLBACK_VERSION.to_string())
        }
    }
}

fn build_from_source(session: &ChrootSession, version: &str, kernel_release: &str) -> Result<()> {
    println!("Building OpenZFS {version} from source for kernel {kernel_release}");

    session
        .run_script(&format!(
            "apt-get install -y {}",
            BUILD_DEPS.join(" ")
        ))
        .context(BuildErrorKind::PackageInstall)
        .context("installing ZFS build dependencies")?;

    retry_network("cloning OpenZFS", NETWORK_ATTEMPTS, || {
        session.run_script(&format!(
            "rm -rf /usr/src/zfs && \
             git clone --depth 1 --branch zfs-{version} {ZFS_REPO} /usr/src/zfs"
        ))
    })?;

    let build_script = format!(
        "set -e\n\
         cd /usr/src/zfs\n\
         ./autogen.sh\n\
         ./configure --prefix=/usr --with-linux=/usr/src/linux-headers-{kernel_release} --enable-systemd\n\
         make -j$(nproc)\n\
         make install\n\
         make deb-dkms\n\
         dpkg -i *.deb || apt-get -f install -y\n"
    );
    session
        .run_script(&build_script)
        .context(BuildErrorKind::KernelZfsMismatch)
        .context("building OpenZFS against the installed headers")?;
    Ok(())
}

/// The kernel module must exist for the chroot kernel. An actual modprobe is
/// attempted but tolerated to fail: the build host usually runs a different
/// kernel, and the real validation happens at initramfs generation and live
/// boot.
fn verify_module(session: &ChrootSession, kernel_release: &str) -> Result<()> {
    let check = session
        .run_script(&format!(
            "modinfo -k {kernel_release} zfs >/dev/null 2>&1 || \
             test -e /lib/modules/{kernel_release}/updates/dkms/zfs.ko*"
        ))
        .map(|r| r.success());
    match check {
        Ok(true) => {}
        _ => {
            return Err(anyhow::anyhow!(
                "no zfs kernel module found for {kernel_release}"
            ))
            .context(BuildErrorKind::KernelZfsMismatch);
        }
    }

    let probe = session.run_allow_fail(["modprobe", "zfs"])?;
    if !probe.success() {
        log::warn!(
            "modprobe zfs failed in the chroot (expected when the host kernel differs): {}",
            probe.stderr_trimmed()
        );
    }
    Ok(())
}

fn installed_version(session: &ChrootSession) -> String {
    session
        .run_allow_fail(["zfs", "version"])
        .ok()
        .map(|r| r.stdout_trimmed().lines().next().unwrap_or("unknown").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
